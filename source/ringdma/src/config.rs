//! Channel and device configuration.
//!
//! All of these types are `serde`-deserializable. With the `use-std`
//! feature enabled, a [`DeviceConfig`] can be loaded from a TOML file.
use serde::{Deserialize, Serialize};

/// Parameters for configuring one channel.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelParams {
    /// Number of ring slots (buffer descriptors).
    pub total_rings: usize,
    /// Bytes transferred by each ring slot.
    pub bytes_per_ring: usize,
    /// Bytes per scatter-gather entry.
    pub desc_length: usize,
    /// Written to the IP core's packet size counter register.
    #[serde(default)]
    pub counter: u32,
}

/// Queue depth thresholds used by the outbound data-flow completion policy.
///
/// Zones are evaluated from `full` down to `low`; the first one that
/// matches wins.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Watermarks {
    pub full: usize,
    pub prime: usize,
    pub low: usize,
}

/// Parameters for the loopback self-test.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoopbackParams {
    /// Length of each half of the shared buffer to prime.
    pub size: usize,
    /// Used to wrap the index pattern written to the second half.
    pub bytes_per_ring: usize,
}

/// Everything needed to bring up one device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceConfig {
    /// Size of the shared coherent buffer, in bytes.
    pub buffer_size: usize,
    #[serde(default)]
    pub watermarks: Watermarks,
    #[serde(default)]
    pub rx: Option<ChannelParams>,
    #[serde(default)]
    pub tx: Option<ChannelParams>,
}

// === impl ChannelParams ===

impl ChannelParams {
    /// Total bytes the channel needs from the shared buffer.
    #[must_use]
    pub fn length(&self) -> usize {
        self.bytes_per_ring.saturating_mul(self.total_rings)
    }

    /// Scatter-gather entries per ring slot.
    #[must_use]
    pub fn sg_entries(&self) -> usize {
        self.bytes_per_ring.checked_div(self.desc_length).unwrap_or(0)
    }
}

// === impl Watermarks ===

impl Watermarks {
    pub const DEFAULT: Self = Self {
        full: 8,
        prime: 4,
        low: 1,
    };

    /// Returns `true` if `full > prime > low`.
    #[must_use]
    pub fn is_ordered(&self) -> bool {
        self.full > self.prime && self.prime > self.low
    }
}

impl Default for Watermarks {
    fn default() -> Self {
        Self::DEFAULT
    }
}

// === impl DeviceConfig ===

#[cfg(feature = "use-std")]
impl DeviceConfig {
    /// Parses a device configuration from TOML.
    pub fn from_toml(s: &str) -> miette::Result<Self> {
        use miette::{Context, IntoDiagnostic};

        let config: Self = toml::from_str(s)
            .into_diagnostic()
            .context("failed to parse device configuration")?;
        if !config.watermarks.is_ordered() {
            miette::bail!(
                "watermarks must satisfy full > prime > low (got {:?})",
                config.watermarks
            );
        }
        Ok(config)
    }

    /// Reads and parses a device configuration file.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> miette::Result<Self> {
        use miette::{Context, IntoDiagnostic};

        let path = path.as_ref();
        let s = std::fs::read_to_string(path)
            .into_diagnostic()
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_toml(&s).with_context(|| format!("in {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_device_config() {
        let config: DeviceConfig = toml::from_str(
            r#"
            buffer_size = 65536

            [watermarks]
            full = 12

            [rx]
            total_rings = 16
            bytes_per_ring = 2048
            desc_length = 512
            counter = 512

            [tx]
            total_rings = 16
            bytes_per_ring = 2048
            desc_length = 512
            "#,
        )
        .unwrap();

        assert_eq!(config.buffer_size, 65536);
        assert_eq!(
            config.watermarks,
            Watermarks {
                full: 12,
                prime: 4,
                low: 1
            }
        );
        let rx = config.rx.unwrap();
        assert_eq!(rx.length(), 32768);
        assert_eq!(rx.sg_entries(), 4);
        assert_eq!(rx.counter, 512);
        assert_eq!(config.tx.unwrap().counter, 0);
    }

    #[test]
    fn rejects_unknown_fields() {
        let res = toml::from_str::<ChannelParams>(
            r#"
            total_rings = 2
            bytes_per_ring = 64
            desc_length = 64
            rings = 4
            "#,
        );
        assert!(res.is_err());
    }

    #[test]
    fn zero_desc_length_has_no_entries() {
        let params = ChannelParams {
            total_rings: 4,
            bytes_per_ring: 64,
            desc_length: 0,
            counter: 0,
        };
        assert_eq!(params.sg_entries(), 0);
    }

    #[test]
    fn default_watermarks_are_ordered() {
        assert!(Watermarks::default().is_ordered());
        assert!(!Watermarks {
            full: 4,
            prime: 4,
            low: 1
        }
        .is_ordered());
    }
}
