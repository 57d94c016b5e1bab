//! Interfaces to the hardware collaborators this crate drives but does not
//! implement: the DMA engine and its channels, the coherent memory provider
//! and the device's register window.
//!
//! The [`sim`](crate::sim) module implements all of these traits in
//! software.
use alloc::vec::Vec;
use core::{fmt, ptr::NonNull};

use mycelium_bitfield::bitfield;

use crate::{
    completion::Completion,
    error::{AllocationError, DeviceError, StopError},
    Direction,
};

bitfield! {
    /// Capabilities a DMA channel must advertise to be acquired.
    pub struct Capabilities<u8> {
        /// The channel serves a peripheral (slave) rather than doing
        /// memory-to-memory copies.
        pub const SLAVE: bool;
        /// The channel is reserved for exclusive use once acquired.
        pub const PRIVATE: bool;
        /// The channel supports cyclic (ring) transfers.
        pub const CYCLIC: bool;
    }
}

bitfield! {
    /// Flags passed to [`DeviceChannel::prepare`].
    pub struct PrepFlags<u8> {
        /// The client acknowledges the descriptor, so the engine may reuse it.
        pub const ACK: bool;
        /// Raise an interrupt when the transfer completes.
        pub const INTERRUPT: bool;
    }
}

/// An opaque handle returned by the device when it accepts a transfer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Cookie(pub u32);

/// A DMA engine from which channels can be acquired.
pub trait DmaEngine {
    type Channel: DeviceChannel;

    /// Acquires a channel for `direction` that advertises every capability
    /// in `caps`, or returns `None` if no such channel is free.
    fn acquire(&mut self, direction: Direction, caps: Capabilities) -> Option<Self::Channel>;
}

/// A DMA channel owned by a [`Channel`](crate::Channel).
///
/// The channel engine calls these methods while holding its lock, so an
/// implementation must never invoke a [`Completion`] from inside
/// [`submit`](Self::submit) or [`issue_pending`](Self::issue_pending).
/// Completions are delivered later, from whatever context services the
/// device's interrupt.
pub trait DeviceChannel: Send + 'static {
    /// A transfer prepared from a scatter-gather table.
    type Transfer: Send + 'static;

    /// Makes `table` visible to the device, filling in each entry's device
    /// address. Returns the number of entries mapped, or 0 if no device
    /// buffers are available.
    fn map_sg(&mut self, table: &mut SgTable, direction: Direction) -> usize;

    /// Reverses [`map_sg`](Self::map_sg).
    fn unmap_sg(&mut self, table: &mut SgTable, direction: Direction);

    /// Prepares a slave transfer over a mapped table.
    fn prepare(
        &mut self,
        table: &SgTable,
        direction: Direction,
        flags: PrepFlags,
    ) -> Option<Self::Transfer>;

    /// Queues a prepared transfer. `completion` must be invoked exactly once
    /// when the transfer finishes, and dropped without being invoked if the
    /// transfer is terminated.
    fn submit(
        &mut self,
        transfer: Self::Transfer,
        completion: Completion,
    ) -> Result<Cookie, DeviceError>;

    /// Starts every submitted transfer.
    fn issue_pending(&mut self);

    /// Aborts every submitted or in-flight transfer.
    fn terminate_all(&mut self) -> Result<(), StopError>;

    /// Returns the channel to the engine.
    fn release(self)
    where
        Self: Sized;
}

/// A provider of memory that is visible to both the CPU and the device.
pub trait CoherentMemory {
    fn allocate_coherent(&mut self, size: usize) -> Result<DmaRegion, AllocationError>;

    fn free_coherent(&mut self, region: DmaRegion);
}

/// The device's 32-bit register window.
pub trait Registers: Send {
    fn read32(&self, offset: usize) -> u32;

    fn write32(&mut self, offset: usize, value: u32);
}

/// A region of coherent memory, as returned by
/// [`CoherentMemory::allocate_coherent`].
///
/// The device may write to this memory at any time while a transfer is in
/// flight, so no Rust references into it are ever handed out. Reads and
/// writes go through raw pointers.
pub struct DmaRegion {
    cpu: NonNull<u8>,
    device: u64,
    len: usize,
}

/// A contiguous span of a [`DmaRegion`], owned by one channel or one
/// descriptor.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BufferSpan {
    cpu: usize,
    device: u64,
    offset: usize,
    len: usize,
}

/// One fragment of a scatter-gather table.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SgEntry {
    cpu: usize,
    len: usize,
    dma: Option<u64>,
}

/// The scatter-gather table describing one descriptor's buffer.
#[derive(Debug, Default)]
pub struct SgTable {
    entries: Vec<SgEntry>,
    mapped: usize,
}

// === impl DmaRegion ===

// SAFETY: the region is plain memory; concurrent access is mediated by the
// ring protocol, and all access goes through raw pointers.
unsafe impl Send for DmaRegion {}
unsafe impl Sync for DmaRegion {}

impl DmaRegion {
    /// # Safety
    ///
    /// `cpu` must be valid for reads and writes of `len` bytes, aligned to
    /// 4 bytes, for as long as the returned region exists, and `device` must
    /// be the address at which the device sees `cpu`.
    pub unsafe fn new(cpu: NonNull<u8>, device: u64, len: usize) -> Self {
        debug_assert_eq!(cpu.as_ptr() as usize % 4, 0, "coherent memory must be word-aligned");
        Self { cpu, device, len }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The address at which the device sees the start of the region.
    #[must_use]
    pub fn device_addr(&self) -> u64 {
        self.device
    }

    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.cpu.as_ptr()
    }

    /// Returns the span `offset..offset + len`, or `None` if it does not fit.
    #[must_use]
    pub fn span(&self, offset: usize, len: usize) -> Option<BufferSpan> {
        let end = offset.checked_add(len)?;
        if end > self.len {
            return None;
        }
        Some(BufferSpan {
            cpu: self.cpu.as_ptr() as usize + offset,
            device: self.device + offset as u64,
            offset,
            len,
        })
    }

    /// Writes a native-endian word at byte `offset`.
    ///
    /// # Panics
    ///
    /// If the word does not fit in the region.
    pub fn write_u32(&self, offset: usize, value: u32) {
        assert!(offset + 4 <= self.len, "write at {offset} is out of bounds");
        // SAFETY: bounds checked above; the region is valid for writes.
        unsafe {
            self.cpu
                .as_ptr()
                .add(offset)
                .cast::<u32>()
                .write_unaligned(value)
        }
    }

    /// Reads a native-endian word at byte `offset`.
    ///
    /// # Panics
    ///
    /// If the word does not fit in the region.
    #[must_use]
    pub fn read_u32(&self, offset: usize) -> u32 {
        assert!(offset + 4 <= self.len, "read at {offset} is out of bounds");
        // SAFETY: bounds checked above; the region is valid for reads.
        unsafe { self.cpu.as_ptr().add(offset).cast::<u32>().read_unaligned() }
    }

    /// Copies `dst.len()` bytes starting at `offset` into `dst`.
    ///
    /// # Panics
    ///
    /// If the range does not fit in the region.
    pub fn read(&self, offset: usize, dst: &mut [u8]) {
        assert!(offset + dst.len() <= self.len, "read at {offset} is out of bounds");
        // SAFETY: bounds checked above; `dst` cannot alias DMA memory.
        unsafe {
            core::ptr::copy_nonoverlapping(self.cpu.as_ptr().add(offset), dst.as_mut_ptr(), dst.len())
        }
    }
}

impl fmt::Debug for DmaRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaRegion")
            .field("cpu", &self.cpu)
            .field("device", &format_args!("{:#x}", self.device))
            .field("len", &self.len)
            .finish()
    }
}

// === impl BufferSpan ===

impl BufferSpan {
    /// Byte offset of this span from the start of its region.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// CPU address of the first byte.
    #[must_use]
    pub fn cpu_addr(&self) -> usize {
        self.cpu
    }

    /// Device address of the first byte.
    #[must_use]
    pub fn device_addr(&self) -> u64 {
        self.device
    }

    /// Returns the sub-span `offset..offset + len` of this span.
    #[must_use]
    pub fn slice(&self, offset: usize, len: usize) -> Option<BufferSpan> {
        let end = offset.checked_add(len)?;
        if end > self.len {
            return None;
        }
        Some(BufferSpan {
            cpu: self.cpu + offset,
            device: self.device + offset as u64,
            offset: self.offset + offset,
            len,
        })
    }
}

// === impl SgEntry ===

impl SgEntry {
    #[must_use]
    pub fn new(cpu: usize, len: usize) -> Self {
        Self {
            cpu,
            len,
            dma: None,
        }
    }

    #[must_use]
    pub fn cpu_addr(&self) -> usize {
        self.cpu
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The device address assigned by [`DeviceChannel::map_sg`], if mapped.
    #[must_use]
    pub fn dma_addr(&self) -> Option<u64> {
        self.dma
    }

    pub fn set_dma_addr(&mut self, addr: Option<u64>) {
        self.dma = addr;
    }
}

// === impl SgTable ===

impl SgTable {
    pub(crate) fn from_entries(entries: Vec<SgEntry>) -> Self {
        Self { entries, mapped: 0 }
    }

    #[must_use]
    pub fn entries(&self) -> &[SgEntry] {
        &self.entries
    }

    pub fn entries_mut(&mut self) -> &mut [SgEntry] {
        &mut self.entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total number of bytes described by the table.
    #[must_use]
    pub fn total_len(&self) -> usize {
        self.entries.iter().map(SgEntry::len).sum()
    }

    /// Number of entries the device mapped, or 0 if unmapped.
    #[must_use]
    pub fn mapped(&self) -> usize {
        self.mapped
    }

    #[must_use]
    pub fn is_mapped(&self) -> bool {
        self.mapped > 0
    }

    pub(crate) fn set_mapped(&mut self, mapped: usize) {
        self.mapped = mapped;
        if mapped == 0 {
            for entry in &mut self.entries {
                entry.dma = None;
            }
        }
    }
}

// === impl Capabilities ===

impl Capabilities {
    /// The capabilities required of a streaming channel.
    #[must_use]
    pub fn streaming() -> Self {
        Self::new()
            .with(Self::SLAVE, true)
            .with(Self::PRIVATE, true)
            .with(Self::CYCLIC, true)
    }

    /// Returns `true` if `self` advertises every capability in `required`.
    #[must_use]
    pub fn satisfies(&self, required: Capabilities) -> bool {
        self.bits() & required.bits() == required.bits()
    }
}

// === impl PrepFlags ===

impl PrepFlags {
    /// The flags every ring descriptor is prepared with.
    #[must_use]
    pub fn ring() -> Self {
        Self::new().with(Self::ACK, true).with(Self::INTERRUPT, true)
    }
}
