//! The process-wide device registry.
//!
//! The registry hands out device minor numbers and owns the device class.
//! The class is created when the first device attaches and destroyed when
//! the last one detaches.
use core::fmt;

use maitake_sync::spin::Mutex;

/// Tracks attached devices.
pub struct Registry {
    name: &'static str,
    state: Mutex<RegistryState>,
}

/// An attached device's registration. Returned to the registry by
/// [`Registry::detach`].
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a `DeviceId` must be detached, or its minor number is leaked"]
pub struct DeviceId {
    minor: u8,
}

/// Returned by [`Registry::attach`] when every minor number is in use.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RegistryFull;

struct RegistryState {
    /// Bitmap of allocated minor numbers.
    minors: u16,
    devices: usize,
    class_live: bool,
}

// === impl Registry ===

impl Registry {
    /// The maximum number of devices that may be attached at once.
    pub const MAX_DEVICES: usize = 16;

    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(RegistryState {
                minors: 0,
                devices: 0,
                class_live: false,
            }),
        }
    }

    /// Registers a device, creating the class if this is the first one.
    pub fn attach(&self) -> Result<DeviceId, RegistryFull> {
        let mut state = self.state.lock();
        let minor = state.minors.trailing_ones() as u8;
        if minor as usize >= Self::MAX_DEVICES {
            tracing::warn!(class = self.name, "no free minor numbers");
            return Err(RegistryFull);
        }
        state.minors |= 1 << minor;
        state.devices += 1;
        if !state.class_live {
            state.class_live = true;
            tracing::info!(class = self.name, "device class created");
        }
        tracing::debug!(class = self.name, minor, devices = state.devices, "device attached");
        Ok(DeviceId { minor })
    }

    /// Unregisters a device, destroying the class if it was the last one.
    pub fn detach(&self, id: DeviceId) {
        let mut state = self.state.lock();
        state.minors &= !(1 << id.minor);
        state.devices = state.devices.saturating_sub(1);
        tracing::debug!(class = self.name, minor = id.minor, devices = state.devices, "device detached");
        if state.devices == 0 && state.class_live {
            state.class_live = false;
            tracing::info!(class = self.name, "device class destroyed");
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Number of attached devices.
    #[must_use]
    pub fn devices(&self) -> usize {
        self.state.lock().devices
    }

    /// Returns `true` while at least one device is attached.
    #[must_use]
    pub fn class_live(&self) -> bool {
        self.state.lock().class_live
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Registry")
            .field("name", &self.name)
            .field("minors", &format_args!("{:#018b}", state.minors))
            .field("devices", &state.devices)
            .field("class_live", &state.class_live)
            .finish()
    }
}

// === impl DeviceId ===

impl DeviceId {
    #[must_use]
    pub fn minor(&self) -> u8 {
        self.minor
    }
}

impl fmt::Display for RegistryFull {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "all {} device minor numbers are in use", Registry::MAX_DEVICES)
    }
}

#[cfg(feature = "use-std")]
impl std::error::Error for RegistryFull {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_lifetime_follows_devices() {
        let registry = Registry::new("ringdma");
        assert!(!registry.class_live());

        let a = registry.attach().unwrap();
        let b = registry.attach().unwrap();
        assert_eq!((a.minor(), b.minor()), (0, 1));
        assert!(registry.class_live());

        registry.detach(a);
        assert!(registry.class_live());
        assert_eq!(registry.devices(), 1);

        registry.detach(b);
        assert!(!registry.class_live());
        assert_eq!(registry.devices(), 0);
    }

    #[test]
    fn minors_are_reused() {
        let registry = Registry::new("ringdma");
        let ids = (0..Registry::MAX_DEVICES)
            .map(|_| registry.attach().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(registry.attach(), Err(RegistryFull));

        let mut ids = ids.into_iter();
        let _ = ids.next();
        let third = ids.nth(1).unwrap();
        assert_eq!(third.minor(), 2);
        registry.detach(third);

        let again = registry.attach().unwrap();
        assert_eq!(again.minor(), 2);
        registry.detach(again);
        for id in ids {
            registry.detach(id);
        }
    }
}
