//! The device context: a register window, a shared coherent buffer and up
//! to two channels carved out of it.
use alloc::sync::Arc;
use core::fmt;

use crate::{
    channel::{Channel, Geometry},
    completion::{Mode, NotifyOn},
    config::{ChannelParams, LoopbackParams, Watermarks},
    error::{AllocationError, ConfigError, Error},
    hal::{CoherentMemory, DeviceChannel, DmaEngine, DmaRegion, Registers},
    notify::Notifier,
    registry::{DeviceId, Registry, RegistryFull},
    Direction,
};

/// Offsets into the IP core's register window.
pub mod regs {
    /// Writing 1 resets the IP core.
    pub const RESET: usize = 0x0;
    /// The packet size counter, in bytes.
    pub const PACKET_SIZE: usize = 0x8;
}

/// A streaming DMA device.
///
/// Channels are sub-allocated from the shared buffer with a bump allocator
/// in the order they are set up. Space is only reclaimed when the whole
/// buffer is [released](Self::release_buffer). Configuration takes
/// `&mut self`, so it is always serialized.
pub struct Device<C: DeviceChannel, M: CoherentMemory, R: Registers> {
    registry: Arc<Registry>,
    id: Option<DeviceId>,
    memory: M,
    registers: R,
    buffer: Option<SharedBuffer>,
    rx: Option<Channel<C>>,
    tx: Option<Channel<C>>,
    notifier: Arc<Notifier>,
    watermarks: Watermarks,
}

/// Where the shared buffer lives.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Properties {
    /// Device address of the shared buffer.
    pub base: u64,
    /// Size of the shared buffer, in bytes.
    pub size: usize,
}

struct SharedBuffer {
    region: DmaRegion,
    /// Bump offset of the next channel buffer.
    offset: usize,
}

impl<C, M, R> Device<C, M, R>
where
    C: DeviceChannel,
    M: CoherentMemory,
    R: Registers,
{
    /// Attaches a device to `registry` and acquires a streaming channel in
    /// each direction from `engine`.
    ///
    /// A device with no channels is still usable through its registers.
    pub fn probe<E>(
        registry: Arc<Registry>,
        engine: &mut E,
        memory: M,
        registers: R,
        watermarks: Watermarks,
    ) -> Result<Self, RegistryFull>
    where
        E: DmaEngine<Channel = C>,
    {
        let id = registry.attach()?;
        let notifier = Arc::new(Notifier::new());
        let caps = crate::hal::Capabilities::streaming();
        let mut acquire = |direction: Direction| {
            let chan = engine.acquire(direction, caps);
            if chan.is_none() {
                tracing::warn!(%direction, "no DMA channel available");
            }
            chan.map(|chan| Channel::new(chan, direction, watermarks, notifier.clone()))
        };
        let rx = acquire(Direction::Inbound);
        let tx = acquire(Direction::Outbound);
        tracing::info!(
            minor = id.minor(),
            rx = rx.is_some(),
            tx = tx.is_some(),
            "device probed"
        );

        Ok(Self {
            registry,
            id: Some(id),
            memory,
            registers,
            buffer: None,
            rx,
            tx,
            notifier,
            watermarks,
        })
    }

    /// Allocates the shared buffer.
    pub fn allocate_buffer(&mut self, size: usize) -> Result<(), AllocationError> {
        if self.buffer.is_some() {
            return Err(AllocationError::AlreadyAllocated);
        }
        let region = self.memory.allocate_coherent(size)?;
        tracing::debug!(size, base = format_args!("{:#x}", region.device_addr()), "shared buffer allocated");
        self.buffer = Some(SharedBuffer { region, offset: 0 });
        Ok(())
    }

    /// Frees the shared buffer and resets the bump offset.
    ///
    /// Fails if a channel is still configured over it.
    pub fn release_buffer(&mut self) -> Result<(), AllocationError> {
        if self.channels().any(Channel::is_configured) {
            return Err(AllocationError::InUse);
        }
        let buffer = self.buffer.take().ok_or(AllocationError::BufferAbsent)?;
        self.memory.free_coherent(buffer.region);
        tracing::debug!("shared buffer released");
        Ok(())
    }

    /// Configures the channel for `direction` over the next free part of the
    /// shared buffer.
    ///
    /// Resets the IP core and programs its packet size counter first. The
    /// bump offset only advances if configuration succeeds.
    pub fn setup_channel(&mut self, direction: Direction, params: &ChannelParams) -> Result<(), Error> {
        let chan = match direction {
            Direction::Inbound => self.rx.as_ref(),
            Direction::Outbound => self.tx.as_ref(),
        }
        .ok_or(ConfigError::NoChannel(direction))?;
        let buffer = self.buffer.as_mut().ok_or(ConfigError::NoBuffer)?;
        let geometry = Geometry::new(params)?;

        let available = buffer.region.len().saturating_sub(buffer.offset);
        let span = buffer
            .region
            .span(buffer.offset, geometry.length)
            .ok_or(ConfigError::InsufficientMemory {
                requested: geometry.length,
                available,
            })?;

        self.registers.write32(regs::RESET, 1);
        self.registers.write32(regs::PACKET_SIZE, params.counter);

        chan.configure(geometry, span)?;
        buffer.offset += geometry.length;
        tracing::info!(
            %direction,
            offset = span.offset(),
            length = geometry.length,
            next_offset = buffer.offset,
            "channel set up"
        );
        Ok(())
    }

    /// Frees the channel for `direction`. Later operations on that direction
    /// fail with [`ConfigError::NoChannel`].
    ///
    /// Returns `false` if there was no channel.
    pub fn free_channel(&mut self, direction: Direction) -> bool {
        let chan = match direction {
            Direction::Inbound => self.rx.take(),
            Direction::Outbound => self.tx.take(),
        };
        match chan {
            Some(chan) => {
                chan.free();
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn channel(&self, direction: Direction) -> Option<&Channel<C>> {
        match direction {
            Direction::Inbound => self.rx.as_ref(),
            Direction::Outbound => self.tx.as_ref(),
        }
    }

    #[must_use]
    pub fn rx(&self) -> Option<&Channel<C>> {
        self.rx.as_ref()
    }

    #[must_use]
    pub fn tx(&self) -> Option<&Channel<C>> {
        self.tx.as_ref()
    }

    /// Base address and size of the shared buffer, if allocated.
    #[must_use]
    pub fn properties(&self) -> Option<Properties> {
        self.buffer.as_ref().map(|buffer| Properties {
            base: buffer.region.device_addr(),
            size: buffer.region.len(),
        })
    }

    /// The shared buffer, if allocated.
    #[must_use]
    pub fn buffer(&self) -> Option<&DmaRegion> {
        self.buffer.as_ref().map(|buffer| &buffer.region)
    }

    /// Bytes of the shared buffer handed out to channels so far.
    #[must_use]
    pub fn buffer_offset(&self) -> usize {
        self.buffer.as_ref().map_or(0, |buffer| buffer.offset)
    }

    #[must_use]
    pub fn notifier(&self) -> &Arc<Notifier> {
        &self.notifier
    }

    #[must_use]
    pub fn registers(&self) -> &R {
        &self.registers
    }

    #[must_use]
    pub fn watermarks(&self) -> Watermarks {
        self.watermarks
    }

    #[must_use]
    pub fn minor(&self) -> Option<u8> {
        self.id.as_ref().map(DeviceId::minor)
    }

    /// Runs one transfer through both channels.
    ///
    /// The first `params.size` bytes of the shared buffer are filled with
    /// `0xDEADC0DE`, and the next `params.size` bytes with the words
    /// `(i + 1) % (bytes_per_ring / 4)`. Then one transfer is queued, a
    /// single-shot receive is armed and a single-shot transmit is started.
    /// If either side fails to start, neither is left running. With both channels
    /// set up in order, RX sits over the first half and TX over the second.
    pub fn test_loopback(&mut self, params: &LoopbackParams) -> Result<(), Error> {
        let words_per_ring = params.bytes_per_ring / 4;
        if words_per_ring == 0 {
            return Err(Error::InvalidArgument("bytes_per_ring must be at least one word"));
        }
        let buffer = self.buffer.as_ref().ok_or(ConfigError::NoBuffer)?;
        let region = &buffer.region;
        if params.size.checked_mul(2).map_or(true, |len| len > region.len()) {
            return Err(Error::InvalidArgument("loopback halves exceed the shared buffer"));
        }
        let rx = self.rx.as_ref().ok_or(ConfigError::NoChannel(Direction::Inbound))?;
        let tx = self.tx.as_ref().ok_or(ConfigError::NoChannel(Direction::Outbound))?;

        for word in 0..params.size / 4 {
            region.write_u32(word * 4, 0xDEAD_C0DE);
        }
        for word in 0..params.size / 4 {
            let value = ((word + 1) % words_per_ring) as u32;
            region.write_u32(params.size + word * 4, value);
        }
        tracing::debug!(size = params.size, words_per_ring, "loopback buffer primed");

        // queue the transmit first, so that a full or unconfigured TX ring
        // fails before anything is armed.
        tx.enqueue(1)?;
        if let Err(error) = rx.set_mode(Mode::Single, NotifyOn::TransferComplete) {
            tx.stop()?;
            return Err(error);
        }
        if let Err(error) = tx.set_mode(Mode::Single, NotifyOn::TransferComplete) {
            tracing::warn!(%error, "failed to start loopback transmit, stopping receive");
            rx.stop()?;
            tx.stop()?;
            return Err(error);
        }
        Ok(())
    }

    fn channels(&self) -> impl Iterator<Item = &Channel<C>> + '_ {
        self.rx.iter().chain(self.tx.iter())
    }
}

impl<C, M, R> Drop for Device<C, M, R>
where
    C: DeviceChannel,
    M: CoherentMemory,
    R: Registers,
{
    fn drop(&mut self) {
        for direction in Direction::ALL {
            self.free_channel(direction);
        }
        if let Some(buffer) = self.buffer.take() {
            self.memory.free_coherent(buffer.region);
        }
        self.notifier.close();
        if let Some(id) = self.id.take() {
            self.registry.detach(id);
        }
    }
}

impl<C, M, R> fmt::Debug for Device<C, M, R>
where
    C: DeviceChannel,
    M: CoherentMemory,
    R: Registers,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("minor", &self.minor())
            .field("properties", &self.properties())
            .field("offset", &self.buffer_offset())
            .field("rx", &self.rx)
            .field("tx", &self.tx)
            .field("watermarks", &self.watermarks)
            .finish()
    }
}
