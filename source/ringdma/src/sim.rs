//! A simulated streaming DMA device.
//!
//! [`SimEngine`] models an AXI DMA core with one memory-to-stream (TX) and
//! one stream-to-memory (RX) channel. Transfers only make progress when
//! the owner of the engine calls [`SimEngine::step`] or [`SimEngine::run`],
//! which stands in for the device's completion interrupt.
//!
//! By default the TX stream is looped back into RX, so whatever is
//! transmitted is received. [`Source::Pattern`] instead feeds RX from a
//! counter and discards TX data.
//!
//! [`SimMemory`] and [`SimRegisters`] provide identity-mapped coherent
//! memory and a register file.
use alloc::{alloc as heap, collections::VecDeque, sync::Arc, vec::Vec};
use core::{alloc::Layout, fmt, ptr::NonNull};

use maitake_sync::spin::Mutex;
use portable_atomic::{AtomicBool, AtomicUsize, Ordering::*};

use crate::{
    completion::Completion,
    error::{AllocationError, DeviceError, StopError},
    hal::{
        Capabilities, CoherentMemory, Cookie, DeviceChannel, DmaEngine, DmaRegion, PrepFlags,
        Registers, SgTable,
    },
    Direction,
};

/// A handle to a simulated DMA engine. Clones share the same engine.
#[derive(Clone)]
pub struct SimEngine {
    shared: Arc<Shared>,
}

/// A channel acquired from a [`SimEngine`].
pub struct SimChannel {
    direction: Direction,
    shared: Arc<Shared>,
}

/// A transfer prepared by a [`SimChannel`]: the device address and length
/// of each mapped fragment.
#[derive(Debug)]
pub struct SimTransfer {
    segments: Vec<(u64, usize)>,
}

/// Where received data comes from.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Source {
    /// Transmitted bytes are received, in order. A receive completes only
    /// once enough bytes have been transmitted to fill it.
    Loopback,
    /// Receives are filled with incrementing 32-bit words; transmitted bytes
    /// are discarded.
    Pattern,
}

/// Failures to inject into the next matching device operation.
#[derive(Default)]
pub struct Faults {
    /// 0 when disarmed, otherwise one more than the number of maps to allow
    /// before failing.
    map_countdown: AtomicUsize,
    prepare: AtomicBool,
    submit: AtomicBool,
    terminate: AtomicBool,
}

/// Coherent memory backed by the global allocator, where device addresses
/// are CPU addresses.
#[derive(Debug)]
pub struct SimMemory {
    capacity: usize,
    allocated: usize,
}

/// A register file of 32-bit registers.
#[derive(Debug)]
pub struct SimRegisters {
    regs: [u32; Self::COUNT],
}

struct Shared {
    state: Mutex<SimState>,
    faults: Faults,
}

struct SimState {
    claims: u8,
    source: Source,
    stream: VecDeque<u8>,
    pattern: u32,
    sunk: usize,
    mapped_tables: usize,
    next_cookie: u32,
    lanes: [Lane; 2],
}

#[derive(Default)]
struct Lane {
    pending: VecDeque<Job>,
    active: VecDeque<Job>,
    submitted: usize,
    completed: usize,
    terminations: usize,
}

struct Job {
    transfer: SimTransfer,
    completion: Completion,
}

const EINVAL: i32 = -22;
const EIO: i32 = -5;

// === impl SimEngine ===

impl SimEngine {
    /// Capabilities advertised by every simulated channel.
    #[must_use]
    pub fn capabilities() -> Capabilities {
        Capabilities::streaming()
    }

    /// A loopback engine.
    #[must_use]
    pub fn new() -> Self {
        Self::with_source(Source::Loopback)
    }

    #[must_use]
    pub fn with_source(source: Source) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(SimState {
                    claims: 0,
                    source,
                    stream: VecDeque::new(),
                    pattern: 0,
                    sunk: 0,
                    mapped_tables: 0,
                    next_cookie: 1,
                    lanes: [Lane::default(), Lane::default()],
                }),
                faults: Faults::default(),
            }),
        }
    }

    #[must_use]
    pub fn faults(&self) -> &Faults {
        &self.shared.faults
    }

    /// Completes the oldest issued transfer in `direction`, returning its
    /// ring slot.
    ///
    /// Returns `None` if nothing is issued, or if a loopback receive is
    /// waiting for more transmitted data.
    pub fn step(&self, direction: Direction) -> Option<usize> {
        let job = {
            let mut state = self.shared.state.lock();
            let len = state.lane(direction).active.front()?.transfer.len();
            if direction.is_inbound() && state.source == Source::Loopback && state.stream.len() < len {
                return None;
            }
            let job = state.lane_mut(direction).active.pop_front()?;
            state.execute(direction, &job.transfer);
            state.lane_mut(direction).completed += 1;
            job
        };

        let slot = job.completion.slot();
        tracing::trace!(%direction, slot, bytes = job.transfer.len(), "sim transfer done");
        job.completion.complete();
        Some(slot)
    }

    /// Steps both directions, TX first, until nothing makes progress or
    /// `limit` transfers have completed. Returns the number completed.
    pub fn run(&self, limit: usize) -> usize {
        let mut done = 0;
        while done < limit {
            let mut progressed = false;
            for direction in [Direction::Outbound, Direction::Inbound] {
                if done < limit && self.step(direction).is_some() {
                    done += 1;
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
        done
    }

    /// Transfers accepted by `submit` in `direction`.
    #[must_use]
    pub fn submitted(&self, direction: Direction) -> usize {
        self.shared.state.lock().lane(direction).submitted
    }

    /// Transfers completed in `direction`.
    #[must_use]
    pub fn completed(&self, direction: Direction) -> usize {
        self.shared.state.lock().lane(direction).completed
    }

    /// Submitted transfers that have neither completed nor been terminated.
    #[must_use]
    pub fn in_flight(&self, direction: Direction) -> usize {
        let state = self.shared.state.lock();
        let lane = state.lane(direction);
        lane.pending.len() + lane.active.len()
    }

    /// Successful calls to `terminate_all` in `direction`.
    #[must_use]
    pub fn terminations(&self, direction: Direction) -> usize {
        self.shared.state.lock().lane(direction).terminations
    }

    /// Scatter-gather tables currently mapped, across both channels.
    #[must_use]
    pub fn mapped_tables(&self) -> usize {
        self.shared.state.lock().mapped_tables
    }

    /// Bytes transmitted but not yet received (loopback only).
    #[must_use]
    pub fn stream_len(&self) -> usize {
        self.shared.state.lock().stream.len()
    }

    /// Bytes discarded by the pattern sink.
    #[must_use]
    pub fn sunk(&self) -> usize {
        self.shared.state.lock().sunk
    }
}

impl Default for SimEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl DmaEngine for SimEngine {
    type Channel = SimChannel;

    fn acquire(&mut self, direction: Direction, caps: Capabilities) -> Option<SimChannel> {
        if !Self::capabilities().satisfies(caps) {
            return None;
        }
        let mut state = self.shared.state.lock();
        let bit = 1 << lane_index(direction);
        if state.claims & bit != 0 {
            return None;
        }
        state.claims |= bit;
        tracing::debug!(%direction, "sim channel acquired");
        Some(SimChannel {
            direction,
            shared: self.shared.clone(),
        })
    }
}

impl fmt::Debug for SimEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("SimEngine")
            .field("source", &state.source)
            .field("claims", &format_args!("{:#04b}", state.claims))
            .field("stream", &state.stream.len())
            .field("mapped_tables", &state.mapped_tables)
            .finish()
    }
}

// === impl SimState ===

impl SimState {
    fn lane(&self, direction: Direction) -> &Lane {
        &self.lanes[lane_index(direction)]
    }

    fn lane_mut(&mut self, direction: Direction) -> &mut Lane {
        &mut self.lanes[lane_index(direction)]
    }

    fn execute(&mut self, direction: Direction, transfer: &SimTransfer) {
        let mut chunk = Vec::new();
        for &(addr, len) in &transfer.segments {
            chunk.clear();
            match direction {
                Direction::Outbound => {
                    chunk.resize(len, 0);
                    // SAFETY: `addr` was produced by `map_sg` from a live
                    // coherent region, and the ring keeps the region alive
                    // until the transfer completes or is terminated.
                    unsafe {
                        core::ptr::copy_nonoverlapping(addr as usize as *const u8, chunk.as_mut_ptr(), len)
                    };
                    match self.source {
                        Source::Loopback => self.stream.extend(chunk.iter().copied()),
                        Source::Pattern => self.sunk += len,
                    }
                }
                Direction::Inbound => {
                    match self.source {
                        Source::Loopback => chunk.extend(self.stream.drain(..len)),
                        Source::Pattern => {
                            while chunk.len() < len {
                                chunk.extend_from_slice(&self.pattern.to_ne_bytes());
                                self.pattern = self.pattern.wrapping_add(1);
                            }
                            chunk.truncate(len);
                        }
                    }
                    // SAFETY: as above.
                    unsafe {
                        core::ptr::copy_nonoverlapping(chunk.as_ptr(), addr as usize as *mut u8, len)
                    };
                }
            }
        }
    }
}

// === impl SimChannel ===

impl DeviceChannel for SimChannel {
    type Transfer = SimTransfer;

    fn map_sg(&mut self, table: &mut SgTable, _direction: Direction) -> usize {
        if self.shared.faults.take_map_fault() {
            return 0;
        }
        for entry in table.entries_mut() {
            entry.set_dma_addr(Some(entry.cpu_addr() as u64));
        }
        self.shared.state.lock().mapped_tables += 1;
        table.len()
    }

    fn unmap_sg(&mut self, table: &mut SgTable, _direction: Direction) {
        for entry in table.entries_mut() {
            entry.set_dma_addr(None);
        }
        let mut state = self.shared.state.lock();
        state.mapped_tables = state.mapped_tables.saturating_sub(1);
    }

    fn prepare(
        &mut self,
        table: &SgTable,
        direction: Direction,
        _flags: PrepFlags,
    ) -> Option<SimTransfer> {
        if self.shared.faults.prepare.swap(false, AcqRel) {
            return None;
        }
        if direction != self.direction || !table.is_mapped() {
            return None;
        }
        let segments = table
            .entries()
            .iter()
            .map(|entry| Some((entry.dma_addr()?, entry.len())))
            .collect::<Option<Vec<_>>>()?;
        Some(SimTransfer { segments })
    }

    fn submit(
        &mut self,
        transfer: SimTransfer,
        completion: Completion,
    ) -> Result<Cookie, DeviceError> {
        if self.shared.faults.submit.swap(false, AcqRel) {
            return Err(DeviceError(EINVAL));
        }
        let mut state = self.shared.state.lock();
        let cookie = Cookie(state.next_cookie);
        state.next_cookie = state.next_cookie.wrapping_add(1);
        let lane = state.lane_mut(self.direction);
        lane.pending.push_back(Job {
            transfer,
            completion,
        });
        lane.submitted += 1;
        Ok(cookie)
    }

    fn issue_pending(&mut self) {
        let mut state = self.shared.state.lock();
        let lane = state.lane_mut(self.direction);
        let Lane {
            pending, active, ..
        } = lane;
        active.extend(pending.drain(..));
    }

    fn terminate_all(&mut self) -> Result<(), StopError> {
        if self.shared.faults.terminate.swap(false, AcqRel) {
            return Err(StopError(DeviceError(EIO)));
        }
        let aborted: Vec<Job> = {
            let mut state = self.shared.state.lock();
            let lane = state.lane_mut(self.direction);
            lane.terminations += 1;
            lane.pending.drain(..).chain(lane.active.drain(..)).collect()
        };
        tracing::debug!(direction = %self.direction, aborted = aborted.len(), "sim channel terminated");
        Ok(())
    }

    fn release(self) {
        let mut state = self.shared.state.lock();
        state.claims &= !(1 << lane_index(self.direction));
        tracing::debug!(direction = %self.direction, "sim channel released");
    }
}

impl fmt::Debug for SimChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimChannel")
            .field("direction", &self.direction)
            .finish_non_exhaustive()
    }
}

// === impl SimTransfer ===

impl SimTransfer {
    /// Total bytes moved by this transfer.
    #[must_use]
    pub fn len(&self) -> usize {
        self.segments.iter().map(|&(_, len)| len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// === impl Faults ===

impl Faults {
    /// The next `map_sg` maps nothing.
    pub fn fail_next_map(&self) {
        self.fail_map_after(0);
    }

    /// Allows `n` more `map_sg` calls, then fails one.
    pub fn fail_map_after(&self, n: usize) {
        self.map_countdown.store(n + 1, Release);
    }

    /// The next `prepare` fails.
    pub fn fail_next_prepare(&self) {
        self.prepare.store(true, Release);
    }

    /// The next `submit` is rejected.
    pub fn fail_next_submit(&self) {
        self.submit.store(true, Release);
    }

    /// The next `terminate_all` fails.
    pub fn fail_next_terminate(&self) {
        self.terminate.store(true, Release);
    }

    fn take_map_fault(&self) -> bool {
        let prev = self
            .map_countdown
            .fetch_update(AcqRel, Acquire, |n| n.checked_sub(1));
        prev == Ok(1)
    }
}

impl fmt::Debug for Faults {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Faults")
            .field("map_countdown", &self.map_countdown.load(Acquire))
            .field("prepare", &self.prepare.load(Acquire))
            .field("submit", &self.submit.load(Acquire))
            .field("terminate", &self.terminate.load(Acquire))
            .finish()
    }
}

// === impl SimMemory ===

impl SimMemory {
    const ALIGN: usize = 4096;

    /// A provider that allocates at most `capacity` bytes in total.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            allocated: 0,
        }
    }

    /// Bytes currently allocated.
    #[must_use]
    pub fn allocated(&self) -> usize {
        self.allocated
    }

    fn layout(size: usize) -> Option<Layout> {
        Layout::from_size_align(size.max(4), Self::ALIGN).ok()
    }
}

impl CoherentMemory for SimMemory {
    fn allocate_coherent(&mut self, size: usize) -> Result<DmaRegion, AllocationError> {
        let exhausted = AllocationError::Coherent { size };
        if self.allocated.saturating_add(size) > self.capacity {
            return Err(exhausted);
        }
        let layout = Self::layout(size).ok_or(AllocationError::Coherent { size })?;
        // SAFETY: the layout has a non-zero size.
        let ptr = NonNull::new(unsafe { heap::alloc_zeroed(layout) }).ok_or(exhausted)?;
        self.allocated += size;
        tracing::debug!(size, addr = ?ptr, "sim coherent memory allocated");
        // SAFETY: freshly allocated, aligned, and identity-mapped for the
        // simulated device.
        Ok(unsafe { DmaRegion::new(ptr, ptr.as_ptr() as usize as u64, size) })
    }

    fn free_coherent(&mut self, region: DmaRegion) {
        let size = region.len();
        if let Some(layout) = Self::layout(size) {
            // SAFETY: `region` was allocated by `allocate_coherent` with
            // this same layout.
            unsafe { heap::dealloc(region.as_ptr(), layout) };
        }
        self.allocated = self.allocated.saturating_sub(size);
        tracing::debug!(size, "sim coherent memory freed");
    }
}

// === impl SimRegisters ===

impl SimRegisters {
    const COUNT: usize = 64;

    #[must_use]
    pub fn new() -> Self {
        Self {
            regs: [0; Self::COUNT],
        }
    }
}

impl Default for SimRegisters {
    fn default() -> Self {
        Self::new()
    }
}

impl Registers for SimRegisters {
    fn read32(&self, offset: usize) -> u32 {
        self.regs.get(offset / 4).copied().unwrap_or(0)
    }

    fn write32(&mut self, offset: usize, value: u32) {
        tracing::trace!(offset = format_args!("{offset:#x}"), value, "sim register write");
        if let Some(reg) = self.regs.get_mut(offset / 4) {
            *reg = value;
        }
    }
}

fn lane_index(direction: Direction) -> usize {
    match direction {
        Direction::Inbound => 0,
        Direction::Outbound => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channels_are_exclusive() {
        let mut engine = SimEngine::new();
        let rx = engine
            .acquire(Direction::Inbound, Capabilities::streaming())
            .unwrap();
        assert!(engine
            .acquire(Direction::Inbound, Capabilities::streaming())
            .is_none());
        let tx = engine
            .acquire(Direction::Outbound, Capabilities::streaming())
            .unwrap();

        rx.release();
        assert!(engine
            .acquire(Direction::Inbound, Capabilities::streaming())
            .is_some());
        tx.release();
    }

    #[test]
    fn map_countdown() {
        let faults = Faults::default();
        assert!(!faults.take_map_fault());
        faults.fail_map_after(2);
        assert!(!faults.take_map_fault());
        assert!(!faults.take_map_fault());
        assert!(faults.take_map_fault());
        assert!(!faults.take_map_fault());
    }

    #[test]
    fn memory_capacity() {
        let mut memory = SimMemory::new(8192);
        let a = memory.allocate_coherent(4096).unwrap();
        assert_eq!(a.device_addr(), a.as_ptr() as usize as u64);
        let b = memory.allocate_coherent(4096).unwrap();
        assert_eq!(
            memory.allocate_coherent(1).unwrap_err(),
            AllocationError::Coherent { size: 1 }
        );
        memory.free_coherent(a);
        memory.free_coherent(b);
        assert_eq!(memory.allocated(), 0);
    }

    #[test]
    fn register_file() {
        let mut regs = SimRegisters::new();
        regs.write32(0x8, 512);
        assert_eq!(regs.read32(0x8), 512);
        assert_eq!(regs.read32(0x0), 0);
        assert_eq!(regs.read32(0x1000), 0);
    }
}
