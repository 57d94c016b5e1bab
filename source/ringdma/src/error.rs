//! Errors returned synchronously by channel and device operations.
//!
//! Errors detected while handling a completion are never returned to a
//! caller. They are latched into the channel as an
//! [`ErrorCode`](crate::completion::ErrorCode) instead.
use core::fmt;

use crate::Direction;

/// Any error returned by a [`Channel`](crate::Channel) or
/// [`Device`](crate::Device) operation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Error {
    Config(ConfigError),
    Allocation(AllocationError),
    Mapping(MappingError),
    Submit(SubmitError),
    QueueFull(QueueFull),
    /// An outbound single-shot transfer was requested with nothing queued.
    QueueEmpty,
    Stop(StopError),
    /// An argument was out of range for the operation.
    InvalidArgument(&'static str),
    /// The channel has not been configured, or has been freed.
    NotConfigured,
}

/// A channel could not be configured.
///
/// A channel whose configuration failed is left unconfigured.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ConfigError {
    /// The device has no channel for this direction.
    NoChannel(Direction),
    /// The device's shared buffer has not been allocated.
    NoBuffer,
    /// The ring must contain at least one descriptor.
    ZeroRings,
    /// The descriptor length must be non-zero.
    ZeroDescriptorLength,
    /// `bytes_per_ring / desc_length` is zero.
    NoScatterEntries {
        bytes_per_ring: usize,
        desc_length: usize,
    },
    /// The channel's buffer does not fit in what remains of the shared
    /// buffer.
    InsufficientMemory { requested: usize, available: usize },
    /// Building the descriptor ring failed.
    Ring(AllocationError),
    /// Mapping a ring slot failed.
    Mapping { slot: usize, error: MappingError },
}

/// Memory for a buffer or a scatter-gather table could not be obtained.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AllocationError {
    /// There is no buffer to partition.
    BufferAbsent,
    /// A scatter-gather table with this many entries could not be allocated.
    Table { entries: usize },
    /// The coherent memory provider could not allocate this many bytes.
    Coherent { size: usize },
    /// The shared buffer is already allocated.
    AlreadyAllocated,
    /// The shared buffer is still in use by a configured channel.
    InUse,
}

/// A descriptor could not be made visible to the device.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MappingError {
    /// The device mapped none of the descriptor's scatter-gather entries.
    NoDeviceBuffers,
    /// The device channel could not prepare a transfer from the mapped
    /// table.
    Prepare,
}

/// The pipeline could not be advanced.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SubmitError {
    /// The device rejected the transfer prepared for `slot`.
    Rejected { slot: usize, error: DeviceError },
    /// A fresh transfer could not be prepared for `slot`.
    Prepare { slot: usize },
    /// `slot` was eligible but holds no prepared transfer.
    NotPrepared { slot: usize },
    /// The channel was configured with a single ring slot, so no ring
    /// was allocated.
    RingUnallocated,
}

/// An [`enqueue`](crate::Channel::enqueue) request that would fill the ring.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct QueueFull {
    pub queued: usize,
    pub requested: usize,
    pub capacity: usize,
}

/// The device channel failed to terminate outstanding transfers.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct StopError(pub DeviceError);

/// An error code reported by a device channel.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DeviceError(pub i32);

// === impl Error ===

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(error) => write!(f, "channel configuration failed: {error}"),
            Error::Allocation(error) => fmt::Display::fmt(error, f),
            Error::Mapping(error) => fmt::Display::fmt(error, f),
            Error::Submit(error) => fmt::Display::fmt(error, f),
            Error::QueueFull(error) => fmt::Display::fmt(error, f),
            Error::QueueEmpty => f.write_str("transfer queue is empty"),
            Error::Stop(error) => fmt::Display::fmt(error, f),
            Error::InvalidArgument(what) => write!(f, "invalid argument: {what}"),
            Error::NotConfigured => f.write_str("channel is not configured"),
        }
    }
}

impl From<ConfigError> for Error {
    fn from(error: ConfigError) -> Self {
        Error::Config(error)
    }
}

impl From<AllocationError> for Error {
    fn from(error: AllocationError) -> Self {
        Error::Allocation(error)
    }
}

impl From<MappingError> for Error {
    fn from(error: MappingError) -> Self {
        Error::Mapping(error)
    }
}

impl From<SubmitError> for Error {
    fn from(error: SubmitError) -> Self {
        Error::Submit(error)
    }
}

impl From<QueueFull> for Error {
    fn from(error: QueueFull) -> Self {
        Error::QueueFull(error)
    }
}

impl From<StopError> for Error {
    fn from(error: StopError) -> Self {
        Error::Stop(error)
    }
}

#[cfg(feature = "use-std")]
impl std::error::Error for Error {}

#[cfg(feature = "use-std")]
impl std::error::Error for AllocationError {}

// === impl ConfigError ===

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::NoChannel(dir) => write!(f, "no {dir} channel was acquired"),
            ConfigError::NoBuffer => f.write_str("shared buffer is not allocated"),
            ConfigError::ZeroRings => f.write_str("ring count must be at least 1"),
            ConfigError::ZeroDescriptorLength => f.write_str("descriptor length must be non-zero"),
            ConfigError::NoScatterEntries {
                bytes_per_ring,
                desc_length,
            } => write!(
                f,
                "{bytes_per_ring} bytes per ring yields no {desc_length}-byte descriptors"
            ),
            ConfigError::InsufficientMemory {
                requested,
                available,
            } => write!(
                f,
                "channel needs {requested} bytes, but only {available} bytes of the shared buffer remain"
            ),
            ConfigError::Ring(error) => fmt::Display::fmt(error, f),
            ConfigError::Mapping { slot, error } => write!(f, "ring slot {slot}: {error}"),
        }
    }
}

impl From<AllocationError> for ConfigError {
    fn from(error: AllocationError) -> Self {
        ConfigError::Ring(error)
    }
}

// === impl AllocationError ===

impl fmt::Display for AllocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocationError::BufferAbsent => f.write_str("no buffer to partition"),
            AllocationError::Table { entries } => {
                write!(f, "failed to allocate a {entries}-entry scatter-gather table")
            }
            AllocationError::Coherent { size } => {
                write!(f, "failed to allocate {size} bytes of coherent memory")
            }
            AllocationError::AlreadyAllocated => f.write_str("shared buffer is already allocated"),
            AllocationError::InUse => f.write_str("shared buffer is in use by a channel"),
        }
    }
}

// === impl MappingError ===

impl fmt::Display for MappingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MappingError::NoDeviceBuffers => f.write_str("no buffers available"),
            MappingError::Prepare => f.write_str("failed to prepare the DMA descriptor"),
        }
    }
}

// === impl SubmitError ===

impl fmt::Display for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmitError::Rejected { slot, error } => {
                write!(f, "device rejected the transfer for slot {slot} ({error})")
            }
            SubmitError::Prepare { slot } => write!(f, "failed to re-prepare slot {slot}"),
            SubmitError::NotPrepared { slot } => {
                write!(f, "slot {slot} has no prepared transfer")
            }
            SubmitError::RingUnallocated => f.write_str("channel has no descriptor ring"),
        }
    }
}

// === impl QueueFull ===

impl fmt::Display for QueueFull {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self {
            queued,
            requested,
            capacity,
        } = self;
        write!(
            f,
            "queue full: {queued} queued + {requested} requested >= {capacity} ring slots"
        )
    }
}

// === impl StopError ===

impl fmt::Display for StopError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to terminate transfers ({})", self.0)
    }
}

// === impl DeviceError ===

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device error {}", self.0)
    }
}
