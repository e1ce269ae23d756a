//! Connection queues.
//!
//! A queue keeps its active records sorted by the configured [`QueueOrder`].
//! Penalized records wait in a side list until their penalty expires. Once the
//! active set grows past the swap threshold, its coldest records (the tail of
//! the order) are written to swap files and only a [`SwapSummary`] stays in
//! memory; a segment is read back as soon as its head would be polled next.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use flowrepo_core::{now_millis, ConnectionId, FlowFileId, FlowFileRecord, QueueSettings};

use crate::error::{QueueError, QueueResult};
use crate::prioritizer::QueueOrder;
use crate::size::QueueSize;
use crate::swap::{SwapManager, SwapRecorder, SwapSummary};

/// Capacity held for records a committing session is about to enqueue.
///
/// Must be handed back through [`FlowFileQueue::enqueue_reserved`] or
/// [`FlowFileQueue::cancel`].
#[derive(Debug, PartialEq, Eq)]
#[must_use]
pub struct Reservation {
    id: u64,
    connection: ConnectionId,
    count: u64,
    bytes: u64,
}

impl Reservation {
    /// Queue the capacity was reserved on.
    pub fn connection(&self) -> &ConnectionId {
        &self.connection
    }

    /// Reserved record count.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Reserved bytes.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

/// A bounded, ordered queue of FlowFiles between two stages.
pub trait FlowFileQueue: Send + Sync {
    /// The connection this queue belongs to.
    fn id(&self) -> &ConnectionId;

    /// Adds a record, failing with `QueueFull` past a hard ceiling.
    fn enqueue(&self, record: FlowFileRecord) -> QueueResult<()>;

    /// Withdraws up to `max` records in policy order.
    fn poll(&self, max: usize) -> QueueResult<Vec<FlowFileRecord>>;

    /// True when queued records meet a back-pressure threshold.
    fn is_full(&self) -> bool;

    /// Returns withdrawn records to their original positions.
    fn reinsert(&self, records: Vec<FlowFileRecord>);

    /// Forgets withdrawn records after a commit.
    fn acknowledge(&self, records: &[FlowFileRecord]);

    /// Reserves room for `count` records totalling `bytes`.
    fn reserve(&self, count: u64, bytes: u64) -> QueueResult<Reservation>;

    /// Enqueues records into previously reserved room. Never fails.
    fn enqueue_reserved(&self, reservation: Reservation, records: Vec<FlowFileRecord>);

    /// Releases a reservation without enqueueing.
    fn cancel(&self, reservation: Reservation);

    /// Current size.
    fn size(&self) -> QueueSize;
}

#[derive(Debug, Default)]
struct QueueState {
    active: VecDeque<FlowFileRecord>,
    active_bytes: u64,
    penalized: Vec<FlowFileRecord>,
    penalized_bytes: u64,
    swapped: Vec<SwapSummary>,
    in_flight: HashMap<FlowFileId, u64>,
    in_flight_bytes: u64,
    reservations: HashMap<u64, (u64, u64)>,
    reserved_count: u64,
    reserved_bytes: u64,
    next_reservation: u64,
}

impl QueueState {
    fn swapped_count(&self) -> u64 {
        self.swapped.iter().map(|s| s.count).sum()
    }

    fn swapped_bytes(&self) -> u64 {
        self.swapped.iter().map(|s| s.bytes).sum()
    }

    fn queued_count(&self) -> u64 {
        self.active.len() as u64 + self.penalized.len() as u64 + self.swapped_count()
    }

    fn queued_bytes(&self) -> u64 {
        self.active_bytes + self.penalized_bytes + self.swapped_bytes()
    }
}

/// File-backed [`FlowFileQueue`].
pub struct ConnectionQueue {
    id: ConnectionId,
    settings: QueueSettings,
    order: QueueOrder,
    swap: Arc<SwapManager>,
    recorder: Arc<dyn SwapRecorder>,
    state: Mutex<QueueState>,
}

impl std::fmt::Debug for ConnectionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionQueue")
            .field("id", &self.id)
            .field("settings", &self.settings)
            .field("order", &self.order)
            .finish_non_exhaustive()
    }
}

impl ConnectionQueue {
    /// Creates an empty queue.
    pub fn new(
        id: ConnectionId,
        settings: QueueSettings,
        order: QueueOrder,
        swap: Arc<SwapManager>,
        recorder: Arc<dyn SwapRecorder>,
    ) -> Self {
        Self {
            id,
            settings,
            order,
            swap,
            recorder,
            state: Mutex::new(QueueState::default()),
        }
    }

    /// Effective settings.
    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    /// Ordering policy.
    pub fn order(&self) -> &QueueOrder {
        &self.order
    }

    /// Replaces the queue contents with recovered state.
    pub fn restore(&self, active: Vec<FlowFileRecord>, swapped: Vec<SwapSummary>) {
        let mut state = self.state.lock();
        let now = now_millis();
        state.active.clear();
        state.active_bytes = 0;
        state.penalized.clear();
        state.penalized_bytes = 0;
        let (penalized, mut ready): (Vec<_>, Vec<_>) =
            active.into_iter().partition(|r| r.is_penalized_at(now));
        ready.sort_by(|a, b| self.order.compare(a, b));
        state.active_bytes = ready.iter().map(|r| r.size).sum();
        state.active = ready.into();
        state.penalized_bytes = penalized.iter().map(|r| r.size).sum();
        state.penalized = penalized;
        state.swapped = swapped;
        info!(
            connection = %self.id,
            active = state.active.len(),
            penalized = state.penalized.len(),
            swap_files = state.swapped.len(),
            "queue restored"
        );
    }

    /// Withdraws every queued record, including penalized and swapped ones.
    pub fn drain(&self) -> QueueResult<Vec<FlowFileRecord>> {
        let mut state = self.state.lock();
        while !state.swapped.is_empty() {
            self.swap_in(&mut state, 0)?;
        }
        let mut drained: Vec<FlowFileRecord> = state.active.drain(..).collect();
        drained.append(&mut state.penalized);
        state.active_bytes = 0;
        state.penalized_bytes = 0;
        for record in &drained {
            state.in_flight.insert(record.id, record.size);
            state.in_flight_bytes += record.size;
        }
        debug!(connection = %self.id, count = drained.len(), "queue drained");
        Ok(drained)
    }

    fn check_limits(&self, state: &QueueState, count: u64, bytes: u64) -> QueueResult<()> {
        if let Some(limit) = self.settings.hard_object_limit {
            let queued = state.queued_count() + state.reserved_count;
            if queued + count > limit {
                return Err(QueueError::QueueFull {
                    connection: self.id.clone(),
                    reason: format!("{} queued + {} incoming exceeds object limit {}", queued, count, limit),
                });
            }
        }
        if let Some(limit) = self.settings.hard_data_size_limit {
            let queued = state.queued_bytes() + state.reserved_bytes;
            if queued + bytes > limit {
                return Err(QueueError::QueueFull {
                    connection: self.id.clone(),
                    reason: format!("{} bytes queued + {} incoming exceeds size limit {}", queued, bytes, limit),
                });
            }
        }
        Ok(())
    }

    fn insert(&self, state: &mut QueueState, record: FlowFileRecord, now: u64) {
        if record.is_penalized_at(now) {
            state.penalized_bytes += record.size;
            state.penalized.push(record);
            return;
        }
        let pos = state
            .active
            .partition_point(|x| self.order.compare(x, &record) != std::cmp::Ordering::Greater);
        state.active_bytes += record.size;
        state.active.insert(pos, record);
    }

    fn release_expired(&self, state: &mut QueueState, now: u64) {
        if state.penalized.is_empty() {
            return;
        }
        let (waiting, expired): (Vec<_>, Vec<_>) = std::mem::take(&mut state.penalized)
            .into_iter()
            .partition(|r| r.is_penalized_at(now));
        state.penalized = waiting;
        for record in expired {
            state.penalized_bytes -= record.size;
            self.insert(state, record, now);
        }
    }

    fn swap_out_if_needed(&self, state: &mut QueueState) {
        while state.active.len() > self.settings.swap_threshold {
            let batch = self.settings.swap_batch_size.min(state.active.len());
            if batch == 0 {
                return;
            }
            let split = state.active.len() - batch;
            let tail: Vec<FlowFileRecord> = state.active.split_off(split).into();

            let summary = match self.swap.write(&self.id, &tail, &self.order) {
                Ok(summary) => summary,
                Err(e) => {
                    warn!(connection = %self.id, error = %e, "swap out failed, keeping records in memory");
                    state.active.extend(tail);
                    return;
                }
            };
            if let Err(e) = self.recorder.swapped_out(&self.id, &summary.location, &tail) {
                warn!(connection = %self.id, location = %summary.location, error = %e, "swap out not recorded, keeping records in memory");
                if let Err(e) = self.swap.delete(&summary.location) {
                    warn!(location = %summary.location, error = %e, "failed to delete unrecorded swap file");
                }
                state.active.extend(tail);
                return;
            }

            state.active_bytes -= summary.bytes;
            info!(
                connection = %self.id,
                location = %summary.location,
                count = summary.count,
                bytes = summary.bytes,
                "swapped out"
            );
            state.swapped.push(summary);
        }
    }

    /// Index of the segment that should be swapped in before the next poll.
    fn next_swap_in(&self, state: &QueueState) -> Option<usize> {
        let (idx, head) = state
            .swapped
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| self.order.compare(&a.head, &b.head))
            .map(|(i, s)| (i, &s.head))?;
        match state.active.front() {
            None => Some(idx),
            Some(front) if self.order.compare(head, front) == std::cmp::Ordering::Less => Some(idx),
            Some(_) => None,
        }
    }

    fn swap_in(&self, state: &mut QueueState, idx: usize) -> QueueResult<()> {
        let summary = state.swapped[idx].clone();
        let records = self.swap.read(&summary.location)?;
        self.recorder.swapped_in(&self.id, &summary.location, &records)?;
        state.swapped.remove(idx);
        if let Err(e) = self.swap.delete(&summary.location) {
            warn!(location = %summary.location, error = %e, "failed to delete swapped-in file");
        }

        let now = now_millis();
        let mut merged: Vec<FlowFileRecord> = state.active.drain(..).collect();
        for record in records {
            if record.is_penalized_at(now) {
                state.penalized_bytes += record.size;
                state.penalized.push(record);
            } else {
                state.active_bytes += record.size;
                merged.push(record);
            }
        }
        merged.sort_by(|a, b| self.order.compare(a, b));
        state.active = merged.into();
        info!(connection = %self.id, location = %summary.location, count = summary.count, "swapped in");
        Ok(())
    }

    fn withdraw(state: &mut QueueState, id: &FlowFileId) {
        if let Some(size) = state.in_flight.remove(id) {
            state.in_flight_bytes -= size;
        }
    }
}

impl FlowFileQueue for ConnectionQueue {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn enqueue(&self, record: FlowFileRecord) -> QueueResult<()> {
        let mut state = self.state.lock();
        self.check_limits(&state, 1, record.size)?;
        self.insert(&mut state, record, now_millis());
        self.swap_out_if_needed(&mut state);
        Ok(())
    }

    fn poll(&self, max: usize) -> QueueResult<Vec<FlowFileRecord>> {
        let mut state = self.state.lock();
        self.release_expired(&mut state, now_millis());
        let mut polled = Vec::new();
        while polled.len() < max {
            if let Some(idx) = self.next_swap_in(&state) {
                if let Err(e) = self.swap_in(&mut state, idx) {
                    if polled.is_empty() {
                        return Err(e);
                    }
                    warn!(connection = %self.id, error = %e, "swap in failed");
                    break;
                }
            }
            let Some(record) = state.active.pop_front() else {
                break;
            };
            state.active_bytes -= record.size;
            state.in_flight_bytes += record.size;
            state.in_flight.insert(record.id, record.size);
            polled.push(record);
        }
        if !polled.is_empty() {
            debug!(connection = %self.id, count = polled.len(), "polled");
        }
        Ok(polled)
    }

    fn is_full(&self) -> bool {
        let state = self.state.lock();
        state.queued_count() >= self.settings.backpressure_object_threshold
            || state.queued_bytes() >= self.settings.backpressure_data_size_threshold
    }

    fn reinsert(&self, records: Vec<FlowFileRecord>) {
        let mut state = self.state.lock();
        let now = now_millis();
        for record in records {
            Self::withdraw(&mut state, &record.id);
            self.insert(&mut state, record, now);
        }
        self.swap_out_if_needed(&mut state);
    }

    fn acknowledge(&self, records: &[FlowFileRecord]) {
        let mut state = self.state.lock();
        for record in records {
            Self::withdraw(&mut state, &record.id);
        }
    }

    fn reserve(&self, count: u64, bytes: u64) -> QueueResult<Reservation> {
        let mut state = self.state.lock();
        self.check_limits(&state, count, bytes)?;
        let id = state.next_reservation;
        state.next_reservation += 1;
        state.reservations.insert(id, (count, bytes));
        state.reserved_count += count;
        state.reserved_bytes += bytes;
        Ok(Reservation {
            id,
            connection: self.id.clone(),
            count,
            bytes,
        })
    }

    fn enqueue_reserved(&self, reservation: Reservation, records: Vec<FlowFileRecord>) {
        let mut state = self.state.lock();
        if let Some((count, bytes)) = state.reservations.remove(&reservation.id) {
            state.reserved_count -= count;
            state.reserved_bytes -= bytes;
        }
        let now = now_millis();
        for record in records {
            self.insert(&mut state, record, now);
        }
        self.swap_out_if_needed(&mut state);
    }

    fn cancel(&self, reservation: Reservation) {
        let mut state = self.state.lock();
        if let Some((count, bytes)) = state.reservations.remove(&reservation.id) {
            state.reserved_count -= count;
            state.reserved_bytes -= bytes;
        }
    }

    fn size(&self) -> QueueSize {
        let state = self.state.lock();
        QueueSize {
            active_count: state.active.len() as u64,
            active_bytes: state.active_bytes,
            penalized_count: state.penalized.len() as u64,
            penalized_bytes: state.penalized_bytes,
            swapped_count: state.swapped_count(),
            swapped_bytes: state.swapped_bytes(),
            swap_files: state.swapped.len(),
            in_flight_count: state.in_flight.len() as u64,
            in_flight_bytes: state.in_flight_bytes,
            reserved_count: state.reserved_count,
            reserved_bytes: state.reserved_bytes,
        }
    }
}
