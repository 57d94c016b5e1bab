//! The channel engine: per-channel ring state and the start/advance/stop
//! protocol.
//!
//! Every field a completion can touch lives in one [`State`] behind a
//! spinlock, so control operations and completions serialize on it. The
//! lock is never held across anything that can block; completions raise
//! their notification only after dropping it.
use alloc::sync::{Arc, Weak};
use core::fmt;

use maitake_sync::spin::Mutex;

use crate::{
    completion::{Completion, CompletionPolicy, CompletionTarget, ErrorCode, Mode, NotifyOn},
    config::{ChannelParams, Watermarks},
    error::{ConfigError, Error, QueueFull, SubmitError},
    hal::{BufferSpan, DeviceChannel, PrepFlags},
    notify::Notifier,
    pool::{self, BdStatus, Ring},
    Direction,
};

/// A DMA channel and its descriptor ring.
///
/// A `Channel` is created unconfigured, holding the device channel it was
/// acquired with. [`configure`](Self::configure) builds and maps the ring;
/// [`set_mode`](Self::set_mode) and [`enqueue`](Self::enqueue) drive
/// transfers.
///
/// Dropping a `Channel` (or calling [`free`](Self::free)) terminates any
/// outstanding transfers, unmaps the ring and releases the device channel.
pub struct Channel<D: DeviceChannel> {
    inner: Arc<Inner<D>>,
}

/// The run state of a channel.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Status {
    /// Idle, no outstanding work.
    Ready,
    /// The device is consuming the ring.
    Running,
    /// Armed for continuous output, but withholding submission until enough
    /// transfers are queued.
    Waiting,
}

/// Sizing derived from [`ChannelParams`] when a channel is configured.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Geometry {
    pub ring_total: usize,
    pub bytes_per_ring: usize,
    /// Total bytes of the channel's buffer.
    pub length: usize,
    /// Bytes per scatter-gather entry.
    pub bd_bytes: usize,
    pub sg_entries: usize,
    /// The modulus of [`Channel::next_index`].
    pub buffer_interrupts: usize,
}

pub(crate) struct Inner<D: DeviceChannel> {
    direction: Direction,
    watermarks: Watermarks,
    notifier: Arc<Notifier>,
    state: Mutex<State<D>>,
}

pub(crate) struct State<D: DeviceChannel> {
    pub(crate) direction: Direction,
    /// `None` once the channel has been freed.
    pub(crate) device: Option<D>,
    link: Weak<dyn CompletionTarget>,
    /// Bumped whenever the ring is torn down, so completions for transfers
    /// submitted to an old ring are ignored.
    pub(crate) epoch: u32,
    pub(crate) geometry: Option<Geometry>,
    buffer: Option<BufferSpan>,
    pub(crate) ring: Ring<D::Transfer>,
    pub(crate) curr: usize,
    pub(crate) prev: usize,
    pub(crate) completed: Option<usize>,
    pub(crate) next_index: usize,
    pub(crate) policy: Option<CompletionPolicy>,
    pub(crate) queued: usize,
    pub(crate) transfer_count: u64,
    pub(crate) error: ErrorCode,
    pub(crate) status: Status,
}

// === impl Geometry ===

impl Geometry {
    /// Validates `params` and derives the channel geometry from them.
    pub fn new(params: &ChannelParams) -> Result<Self, ConfigError> {
        if params.total_rings == 0 {
            return Err(ConfigError::ZeroRings);
        }
        if params.desc_length == 0 {
            return Err(ConfigError::ZeroDescriptorLength);
        }
        let sg_entries = params.sg_entries();
        if sg_entries == 0 {
            return Err(ConfigError::NoScatterEntries {
                bytes_per_ring: params.bytes_per_ring,
                desc_length: params.desc_length,
            });
        }
        let length = params
            .bytes_per_ring
            .checked_mul(params.total_rings)
            .ok_or(ConfigError::InsufficientMemory {
                requested: usize::MAX,
                available: 0,
            })?;

        Ok(Self {
            ring_total: params.total_rings,
            bytes_per_ring: params.bytes_per_ring,
            length,
            bd_bytes: params.desc_length,
            sg_entries,
            buffer_interrupts: params.total_rings,
        })
    }
}

// === impl Channel ===

impl<D: DeviceChannel> Channel<D> {
    /// Wraps an acquired device channel. The returned channel must be
    /// [configured](Self::configure) before use.
    pub fn new(
        device: D,
        direction: Direction,
        watermarks: Watermarks,
        notifier: Arc<Notifier>,
    ) -> Self {
        let inner = Arc::new_cyclic(|this: &Weak<Inner<D>>| {
            let link: Weak<dyn CompletionTarget> = this.clone();
            Inner {
                direction,
                watermarks,
                notifier,
                state: Mutex::new(State {
                    direction,
                    device: Some(device),
                    link,
                    epoch: 0,
                    geometry: None,
                    buffer: None,
                    ring: Ring::empty(),
                    curr: 0,
                    prev: 0,
                    completed: None,
                    next_index: 0,
                    policy: None,
                    queued: 0,
                    transfer_count: 0,
                    error: ErrorCode::None,
                    status: Status::Ready,
                }),
            }
        });
        Self { inner }
    }

    #[must_use]
    pub fn direction(&self) -> Direction {
        self.inner.direction
    }

    /// Builds this channel's ring over `buffer`.
    ///
    /// For rings of two or more slots, every descriptor is allocated and
    /// mapped, `current` is the last slot and `previous` the one before it.
    /// A single-slot ring is accepted, but is left unallocated.
    ///
    /// Any previous ring is torn down first. On failure the channel is left
    /// unconfigured.
    #[tracing::instrument(level = "debug", skip(self, buffer), fields(direction = %self.inner.direction))]
    pub fn configure(&self, geometry: Geometry, buffer: BufferSpan) -> Result<(), Error> {
        if buffer.len() < geometry.length {
            return Err(ConfigError::InsufficientMemory {
                requested: geometry.length,
                available: buffer.len(),
            }
            .into());
        }

        let mut state = self.inner.state.lock();
        state.teardown();
        let direction = state.direction;
        let device = state
            .device
            .as_mut()
            .ok_or(ConfigError::NoChannel(direction))?;

        let ring = if geometry.ring_total >= 2 {
            let mut ring = pool::allocate_ring(
                Some(&buffer),
                geometry.ring_total,
                geometry.length,
                geometry.bd_bytes,
            )
            .map_err(ConfigError::from)?;
            if let Err(error) = ring.map_all(device, direction, PrepFlags::ring()) {
                tracing::warn!(%error, "failed to map descriptor ring");
                ring.release(device, direction);
                return Err(error.into());
            }
            ring
        } else {
            Ring::empty()
        };

        let last = geometry.ring_total - 1;
        state.curr = last;
        state.prev = last.saturating_sub(1);
        state.ring = ring;
        state.geometry = Some(geometry);
        state.buffer = Some(buffer);
        tracing::debug!(
            ring_total = geometry.ring_total,
            length = geometry.length,
            sg_entries = geometry.sg_entries,
            offset = buffer.offset(),
            "channel configured"
        );
        Ok(())
    }

    /// Advances the pipeline one step.
    ///
    /// Submits the descriptor after `current` if it is mapped, then
    /// re-prepares `current` for its next cycle and rotates the cursors.
    /// Does nothing if the next descriptor is not eligible yet.
    pub fn start(&self) -> Result<(), Error> {
        let mut state = self.inner.state.lock();
        state.configured()?;
        state.start().map_err(Error::from)
    }

    /// Tells the device to begin processing submitted descriptors.
    pub fn issue_pending(&self) {
        if let Some(device) = self.inner.state.lock().device.as_mut() {
            device.issue_pending();
        }
    }

    /// Selects a transfer mode and completion policy, and kicks the pipeline
    /// as that mode requires.
    ///
    /// | direction | mode         | effect                                            |
    /// |-----------|--------------|---------------------------------------------------|
    /// | inbound   | `Single`     | clear counters, arm one descriptor                |
    /// | inbound   | `Burst(n)`   | queue `n` ring cycles (`0 < n <= ring_total`)     |
    /// | inbound   | `Continuous` | clear counters, arm two descriptors               |
    /// | outbound  | `Single`     | arm one descriptor; requires a non-empty queue    |
    /// | outbound  | `Continuous` | wait for the queue to pass the prime watermark    |
    pub fn set_mode(&self, mode: Mode, notify: NotifyOn) -> Result<(), Error> {
        let direction = self.inner.direction;
        let policy = CompletionPolicy::select(direction, mode, notify)
            .ok_or(Error::InvalidArgument("mode is not supported in this direction"))?;

        let mut state = self.inner.state.lock();
        let geometry = state.configured()?;
        tracing::debug!(%direction, ?mode, ?notify, ?policy, "set transfer mode");

        match (direction, mode) {
            (Direction::Inbound, Mode::Single) => {
                state.policy = Some(policy);
                state.error = ErrorCode::None;
                state.transfer_count = 0;
                state.start()?;
                state.status = Status::Running;
                state.issue_pending();
            }
            (Direction::Inbound, Mode::Burst(count)) => {
                if count == 0 || count > geometry.ring_total {
                    return Err(Error::InvalidArgument("burst count must be in 1..=ring_total"));
                }
                state.policy = Some(policy);
                state.queued = count;
                state.transfer_count = 0;
                state.error = ErrorCode::None;
                state.start()?;
                state.status = Status::Running;
                state.issue_pending();
            }
            (Direction::Inbound, Mode::Continuous) => {
                state.policy = Some(policy);
                state.transfer_count = 0;
                state.error = ErrorCode::None;
                state.start()?;
                state.issue_pending();
                state.start()?;
                state.status = Status::Running;
            }
            (Direction::Outbound, Mode::Single) => {
                state.policy = Some(policy);
                if state.queued == 0 {
                    tracing::warn!("queue is empty");
                    return Err(Error::QueueEmpty);
                }
                state.advance_next_index(geometry);
                state.start()?;
                state.status = Status::Running;
                state.issue_pending();
            }
            (Direction::Outbound, Mode::Continuous) => {
                state.policy = Some(policy);
                state.status = Status::Waiting;
                state.advance_next_index(geometry);
            }
            (Direction::Outbound, Mode::Burst(_)) => {
                return Err(Error::InvalidArgument("outbound channels have no burst mode"));
            }
        }
        Ok(())
    }

    /// Adds `count` transfers to the outbound queue.
    ///
    /// Fails without changing anything if the queue would reach the ring
    /// size. If the channel is [`Waiting`](Status::Waiting) and the queue now
    /// exceeds the prime watermark, the pipeline is started.
    pub fn enqueue(&self, count: usize) -> Result<(), Error> {
        if self.inner.direction.is_inbound() {
            return Err(Error::InvalidArgument("only outbound channels have a queue"));
        }

        let mut state = self.inner.state.lock();
        let geometry = state.configured()?;
        let queued = state.queued;
        if queued.saturating_add(count) >= geometry.ring_total {
            let error = QueueFull {
                queued,
                requested: count,
                capacity: geometry.ring_total,
            };
            tracing::warn!(%error, "rejecting enqueue");
            return Err(error.into());
        }

        state.queued = queued + count;
        tracing::trace!(queued = state.queued, "enqueued");

        if state.status == Status::Waiting && state.queued > self.inner.watermarks.prime {
            tracing::debug!(queued = state.queued, "queue primed, starting");
            state.start()?;
            state.issue_pending();
            state.start()?;
            state.status = Status::Running;
        }
        Ok(())
    }

    /// Terminates outstanding transfers. The ring cursors are left where
    /// they are, so a later [`start`](Self::start) resumes from there.
    ///
    /// Stopping an outbound channel also empties its queue. Stopping an
    /// inbound channel that was running notifies readers, since a partial
    /// transfer may be in the buffer.
    pub fn stop(&self) -> Result<(), Error> {
        let direction = self.inner.direction;
        let interrupted = {
            let mut state = self.inner.state.lock();
            let interrupted = state.status != Status::Ready;
            if interrupted {
                if let Some(device) = state.device.as_mut() {
                    device.terminate_all()?;
                }
                tracing::debug!(%direction, transfers = state.transfer_count, "stopped DMA");
            }
            if direction.is_outbound() {
                state.queued = 0;
            }
            state.status = Status::Ready;
            interrupted
        };

        if interrupted && direction.is_inbound() {
            tracing::info!("partial transfer");
            self.inner.notifier.notify_readers(direction);
        }
        Ok(())
    }

    /// Returns the caller's read cursor and advances it, wrapping at the
    /// ring size.
    pub fn next_index(&self) -> Result<usize, Error> {
        let mut state = self.inner.state.lock();
        let geometry = state.configured()?;
        Ok(state.advance_next_index(geometry))
    }

    /// Returns the ring slot after `current`: the slot an outbound caller
    /// should fill next. Does not advance anything.
    pub fn fill_index(&self) -> Result<usize, Error> {
        let state = self.inner.state.lock();
        let geometry = state.configured()?;
        Ok((state.curr + 1) % geometry.ring_total)
    }

    /// Returns and clears the latched error.
    pub fn take_error(&self) -> ErrorCode {
        core::mem::replace(&mut self.inner.state.lock().error, ErrorCode::None)
    }

    /// Returns the latched error without clearing it.
    #[must_use]
    pub fn error(&self) -> ErrorCode {
        self.inner.state.lock().error
    }

    #[must_use]
    pub fn status(&self) -> Status {
        self.inner.state.lock().status
    }

    #[must_use]
    pub fn queued(&self) -> usize {
        self.inner.state.lock().queued
    }

    /// Completions since the current mode was selected.
    #[must_use]
    pub fn transfer_count(&self) -> u64 {
        self.inner.state.lock().transfer_count
    }

    /// The ring slot of the most recent completion.
    #[must_use]
    pub fn completed(&self) -> Option<usize> {
        self.inner.state.lock().completed
    }

    /// Returns `(current, previous)`.
    #[must_use]
    pub fn cursors(&self) -> (usize, usize) {
        let state = self.inner.state.lock();
        (state.curr, state.prev)
    }

    #[must_use]
    pub fn policy(&self) -> Option<CompletionPolicy> {
        self.inner.state.lock().policy
    }

    #[must_use]
    pub fn geometry(&self) -> Option<Geometry> {
        self.inner.state.lock().geometry
    }

    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.inner.state.lock().configured().is_ok()
    }

    /// The channel's buffer within the shared region.
    #[must_use]
    pub fn buffer(&self) -> Option<BufferSpan> {
        self.inner.state.lock().buffer
    }

    /// The status of every descriptor, in ring order.
    #[must_use]
    pub fn descriptor_status(&self) -> alloc::vec::Vec<BdStatus> {
        self.inner.state.lock().ring.iter().map(|d| d.status()).collect()
    }

    /// The buffer span transferred by ring slot `slot`.
    #[must_use]
    pub fn slot_span(&self, slot: usize) -> Option<BufferSpan> {
        let state = self.inner.state.lock();
        let geometry = state.geometry?;
        state
            .buffer?
            .slice(slot.checked_mul(geometry.bytes_per_ring)?, geometry.bytes_per_ring)
    }

    /// Terminates outstanding transfers, unmaps the ring and releases the
    /// device channel.
    pub fn free(self) {
        drop(self)
    }

    #[cfg(test)]
    pub(crate) fn with_state<T>(&self, f: impl FnOnce(&mut State<D>) -> T) -> T {
        f(&mut self.inner.state.lock())
    }
}

impl<D: DeviceChannel> Drop for Channel<D> {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        state.teardown();
        if let Some(device) = state.device.take() {
            tracing::debug!(direction = %state.direction, "releasing DMA channel");
            device.release();
        }
    }
}

impl<D: DeviceChannel> fmt::Debug for Channel<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Channel")
            .field("direction", &self.inner.direction)
            .field("status", &state.status)
            .field("geometry", &state.geometry)
            .field("curr", &state.curr)
            .field("prev", &state.prev)
            .field("completed", &state.completed)
            .field("queued", &state.queued)
            .field("transfer_count", &state.transfer_count)
            .field("error", &state.error)
            .field("policy", &state.policy)
            .finish()
    }
}

// === impl Inner ===

impl<D: DeviceChannel> CompletionTarget for Inner<D> {
    fn complete(&self, slot: usize, epoch: u32) {
        let listener = self.notifier.has_listener();
        let wake = {
            let mut state = self.state.lock();
            if state.epoch != epoch || state.device.is_none() {
                tracing::trace!(slot, epoch, "ignoring stale completion");
                return;
            }
            state.on_complete(slot, listener, &self.watermarks)
        };
        if wake {
            self.notifier.notify_readers(self.direction);
        }
    }
}

// === impl State ===

impl<D: DeviceChannel> State<D> {
    pub(crate) fn configured(&self) -> Result<Geometry, Error> {
        match (self.device.as_ref(), self.geometry) {
            (Some(_), Some(geometry)) => Ok(geometry),
            _ => Err(Error::NotConfigured),
        }
    }

    pub(crate) fn start(&mut self) -> Result<(), SubmitError> {
        let direction = self.direction;
        let Some(device) = self.device.as_mut() else {
            return Ok(());
        };
        if self.ring.is_empty() {
            return Err(SubmitError::RingUnallocated);
        }

        let next = self.ring.next(self.curr);
        if !self.ring[next].is_eligible() {
            tracing::trace!(slot = next, status = ?self.ring[next].status(), "next descriptor is not ready");
            return Ok(());
        }

        let Some(transfer) = self.ring[next].take_prepared() else {
            tracing::error!(slot = next, "eligible descriptor has no prepared transfer");
            pool::unmap(&mut self.ring[next], device, direction);
            return Err(SubmitError::NotPrepared { slot: next });
        };
        let completion = Completion::new(self.link.clone(), next, self.epoch);
        match device.submit(transfer, completion) {
            Ok(cookie) => self.ring[next].set_cookie(cookie),
            Err(error) => {
                tracing::error!(slot = next, %error, "failed to submit DMA descriptor");
                pool::unmap(&mut self.ring[next], device, direction);
                return Err(SubmitError::Rejected { slot: next, error });
            }
        }

        // `next` now belongs to the device, so rotate before touching `curr`.
        let curr = self.curr;
        self.prev = curr;
        self.curr = next;
        match device.prepare(self.ring[curr].sg(), direction, PrepFlags::ring()) {
            Some(transfer) => self.ring[curr].set_prepared(transfer),
            None => {
                tracing::error!(slot = curr, "failed to re-prepare DMA descriptor");
                pool::unmap(&mut self.ring[curr], device, direction);
                return Err(SubmitError::Prepare { slot: curr });
            }
        }

        self.ring[curr].set_status(BdStatus::Process);
        tracing::trace!(submitted = next, prev = self.prev, "advanced ring");
        Ok(())
    }

    pub(crate) fn issue_pending(&mut self) {
        if let Some(device) = self.device.as_mut() {
            device.issue_pending();
        }
    }

    fn advance_next_index(&mut self, geometry: Geometry) -> usize {
        let index = self.next_index;
        self.next_index = (index + 1) % geometry.buffer_interrupts;
        index
    }

    /// Terminates the device channel, unmaps the ring and forgets the
    /// geometry. Later completions for the old ring are ignored.
    fn teardown(&mut self) {
        let direction = self.direction;
        let ring = core::mem::replace(&mut self.ring, Ring::empty());
        if let Some(device) = self.device.as_mut() {
            if self.geometry.is_some() {
                if let Err(error) = device.terminate_all() {
                    tracing::warn!(%direction, %error, "failed to terminate DMA channel");
                }
            }
            ring.release(device, direction);
        }
        self.epoch = self.epoch.wrapping_add(1);
        self.geometry = None;
        self.buffer = None;
        self.curr = 0;
        self.prev = 0;
        self.completed = None;
        self.next_index = 0;
        self.policy = None;
        self.queued = 0;
        self.transfer_count = 0;
        self.error = ErrorCode::None;
        self.status = Status::Ready;
    }
}
