//! # ringdma
//!
//! A descriptor-ring engine for FPGA-attached streaming DMA.
//!
//! A [`Device`](device::Device) owns a region of CPU-and-device-visible
//! memory and up to two DMA [`Channel`](channel::Channel)s: one *inbound*
//! (RX, device to memory) and one *outbound* (TX, memory to device). Each
//! channel carves its buffer out of the shared region and splits it into a
//! fixed ring of scatter-gather [buffer descriptors](pool::BufferDescriptor).
//!
//! The engine keeps exactly one descriptor in flight while chaining the
//! next. When the hardware reports that a descriptor has finished, the
//! channel's active [`CompletionPolicy`](completion::CompletionPolicy)
//! updates the ring cursors and queue depth, decides whether to re-arm
//! the pipeline, and latches flow-control signals (watermark zones, ring
//! overflow, queue underflow) that the caller reads back explicitly.
//!
//! The hardware itself is abstracted by the traits in [`hal`]. The [`sim`]
//! module provides an in-process implementation of those traits, which is
//! used by the tests and by the `ringdma-sim` host tool.
#![cfg_attr(not(any(feature = "use-std", test)), no_std)]
#![warn(missing_debug_implementations)]

extern crate alloc;

pub mod channel;
pub mod completion;
pub mod config;
pub mod control;
pub mod device;
pub mod error;
pub mod hal;
pub mod notify;
pub mod pool;
pub mod registry;
pub mod sim;

#[cfg(test)]
pub(crate) mod test_util;

pub use self::{
    channel::{Channel, Status},
    completion::{CompletionPolicy, ErrorCode},
    config::{ChannelParams, DeviceConfig, Watermarks},
    control::{Command, ControlError, Reply},
    device::Device,
    error::Error,
    registry::Registry,
};

use core::fmt;

/// The direction of a DMA channel.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Direction {
    /// Device to memory (RX).
    Inbound,
    /// Memory to device (TX).
    Outbound,
}

// === impl Direction ===

impl Direction {
    /// Both directions, inbound first.
    ///
    /// Channels are configured in this order, so an inbound channel's buffer
    /// precedes the outbound channel's buffer in the shared region.
    pub const ALL: [Direction; 2] = [Direction::Inbound, Direction::Outbound];

    #[must_use]
    pub const fn is_inbound(self) -> bool {
        matches!(self, Direction::Inbound)
    }

    #[must_use]
    pub const fn is_outbound(self) -> bool {
        matches!(self, Direction::Outbound)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Inbound => f.write_str("rx"),
            Direction::Outbound => f.write_str("tx"),
        }
    }
}
