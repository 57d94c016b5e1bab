//! The descriptor pool: a fixed ring of buffer descriptors per channel.
//!
//! A [`Ring`] is an index-addressed arena. Ring neighbours are computed
//! with modulo arithmetic rather than stored as links, so "the descriptor
//! after slot `i`" is always [`Ring::next`]`(i)`.
use alloc::vec::Vec;
use core::ops::{Index, IndexMut};

use crate::{
    error::{AllocationError, ConfigError, MappingError},
    hal::{BufferSpan, Cookie, DeviceChannel, PrepFlags, SgEntry, SgTable},
    Direction,
};

/// The lifecycle state of a [`BufferDescriptor`].
///
/// ```text
/// Unallocated -> Allocated -> Mapped -> Process -> (Mapped/Process ...)
///      ^_______________________|_________|   (failure or unmap)
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BdStatus {
    Unallocated,
    Allocated,
    Mapped,
    Process,
}

/// One unit of transfer work: a slice of the channel buffer, its
/// scatter-gather table and its submission state.
#[derive(Debug)]
pub struct BufferDescriptor<T> {
    index: usize,
    status: BdStatus,
    span: BufferSpan,
    sg: SgTable,
    prepared: Option<T>,
    cookie: Option<Cookie>,
}

/// A channel's ring of [`BufferDescriptor`]s.
#[derive(Debug)]
pub struct Ring<T> {
    slots: Vec<BufferDescriptor<T>>,
}

/// Partitions `total_length` bytes of `buffer` into `ring_size` equal
/// slices, each described by a scatter-gather table of
/// `granularity`-byte entries.
///
/// Every descriptor of the returned ring is [`BdStatus::Allocated`].
pub fn allocate_ring<T>(
    buffer: Option<&BufferSpan>,
    ring_size: usize,
    total_length: usize,
    granularity: usize,
) -> Result<Ring<T>, AllocationError> {
    let buffer = buffer.ok_or(AllocationError::BufferAbsent)?;
    if ring_size == 0 || granularity == 0 {
        return Err(AllocationError::Table { entries: 0 });
    }

    let slice_len = total_length / ring_size;
    let entries = slice_len / granularity;
    if entries == 0 {
        return Err(AllocationError::Table { entries });
    }

    let mut slots = Vec::new();
    slots
        .try_reserve_exact(ring_size)
        .map_err(|_| AllocationError::Table { entries: ring_size })?;

    for index in 0..ring_size {
        let span = buffer
            .slice(index * slice_len, slice_len)
            .ok_or(AllocationError::BufferAbsent)?;

        let mut table = Vec::new();
        table
            .try_reserve_exact(entries)
            .map_err(|_| AllocationError::Table { entries })?;
        table.extend((0..entries).map(|i| SgEntry::new(span.cpu_addr() + i * granularity, granularity)));

        slots.push(BufferDescriptor {
            index,
            status: BdStatus::Allocated,
            span,
            sg: SgTable::from_entries(table),
            prepared: None,
            cookie: None,
        });
    }

    tracing::trace!(ring_size, slice_len, entries, granularity, "allocated descriptor ring");
    Ok(Ring { slots })
}

/// Maps `desc`'s scatter-gather table for `direction` and prepares a
/// transfer from it.
///
/// On failure the descriptor is left [`BdStatus::Unallocated`] and unmapped.
pub fn map<D: DeviceChannel>(
    desc: &mut BufferDescriptor<D::Transfer>,
    device: &mut D,
    direction: Direction,
    flags: PrepFlags,
) -> Result<(), MappingError> {
    let mapped = device.map_sg(&mut desc.sg, direction);
    if mapped == 0 {
        tracing::warn!(slot = desc.index, %direction, "no buffers available");
        desc.sg.set_mapped(0);
        desc.status = BdStatus::Unallocated;
        return Err(MappingError::NoDeviceBuffers);
    }
    desc.sg.set_mapped(mapped);

    match device.prepare(&desc.sg, direction, flags) {
        Some(transfer) => {
            desc.prepared = Some(transfer);
            desc.status = BdStatus::Mapped;
            Ok(())
        }
        None => {
            tracing::warn!(slot = desc.index, %direction, "failed to prepare the DMA descriptor");
            unmap(desc, device, direction);
            Err(MappingError::Prepare)
        }
    }
}

/// Reverses [`map`]. Safe to call in any state, any number of times.
pub fn unmap<D: DeviceChannel>(
    desc: &mut BufferDescriptor<D::Transfer>,
    device: &mut D,
    direction: Direction,
) {
    desc.prepared = None;
    desc.cookie = None;
    if desc.sg.is_mapped() {
        device.unmap_sg(&mut desc.sg, direction);
        desc.sg.set_mapped(0);
    }
    desc.status = BdStatus::Unallocated;
}

// === impl BufferDescriptor ===

impl<T> BufferDescriptor<T> {
    /// This descriptor's position in its ring.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    #[must_use]
    pub fn status(&self) -> BdStatus {
        self.status
    }

    /// The slice of the channel buffer this descriptor transfers.
    #[must_use]
    pub fn span(&self) -> &BufferSpan {
        &self.span
    }

    #[must_use]
    pub fn sg(&self) -> &SgTable {
        &self.sg
    }

    /// The handle the device returned when it last accepted this
    /// descriptor.
    #[must_use]
    pub fn cookie(&self) -> Option<Cookie> {
        self.cookie
    }

    /// Returns `true` if [`start`](crate::Channel::start) may submit this
    /// descriptor.
    #[must_use]
    pub fn is_eligible(&self) -> bool {
        matches!(self.status, BdStatus::Mapped | BdStatus::Process)
    }

    pub(crate) fn set_status(&mut self, status: BdStatus) {
        self.status = status;
    }

    pub(crate) fn set_cookie(&mut self, cookie: Cookie) {
        self.cookie = Some(cookie);
    }

    pub(crate) fn take_prepared(&mut self) -> Option<T> {
        self.prepared.take()
    }

    pub(crate) fn set_prepared(&mut self, transfer: T) {
        self.prepared = Some(transfer);
    }

    #[must_use]
    pub fn is_prepared(&self) -> bool {
        self.prepared.is_some()
    }
}

// === impl Ring ===

impl<T> Ring<T> {
    /// A ring with no descriptors.
    #[must_use]
    pub const fn empty() -> Self {
        Self { slots: Vec::new() }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// The slot after `index`, wrapping at the end of the ring.
    #[must_use]
    pub fn next(&self, index: usize) -> usize {
        (index + 1) % self.slots.len()
    }

    /// The slot before `index`, wrapping at the start of the ring.
    #[must_use]
    pub fn prior(&self, index: usize) -> usize {
        (index + self.slots.len() - 1) % self.slots.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BufferDescriptor<T>> + '_ {
        self.slots.iter()
    }

    /// Maps every descriptor, stopping at the first failure.
    pub fn map_all<D>(&mut self, device: &mut D, direction: Direction, flags: PrepFlags) -> Result<(), ConfigError>
    where
        D: DeviceChannel<Transfer = T>,
    {
        for desc in &mut self.slots {
            let slot = desc.index;
            map(desc, device, direction, flags)
                .map_err(|error| ConfigError::Mapping { slot, error })?;
        }
        Ok(())
    }

    /// Unmaps every descriptor and drops the ring's tables.
    pub fn release<D>(mut self, device: &mut D, direction: Direction)
    where
        D: DeviceChannel<Transfer = T>,
    {
        for desc in &mut self.slots {
            unmap(desc, device, direction);
        }
    }
}

impl<T> Index<usize> for Ring<T> {
    type Output = BufferDescriptor<T>;

    fn index(&self, index: usize) -> &Self::Output {
        &self.slots[index]
    }
}

impl<T> IndexMut<usize> for Ring<T> {
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.slots[index]
    }
}
