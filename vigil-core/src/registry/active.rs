use std::{collections::VecDeque, fmt, sync::Arc};

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use vigil_model::{
    EventFrame, FramePayload, JobId, JobRecord, JobSnapshot, ProgressEvent,
    UnitOutcome,
};

use crate::runner::ExitGate;

/// In-memory state of one non-terminal job.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveJob {
    pub record: JobRecord,
    /// Sequence of the newest frame applied to `record`.
    pub sequence: u64,
    /// The process exited and artifacts are being finalized.
    pub finalizing: bool,
}

impl LiveJob {
    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot::from_record(&self.record, self.sequence)
    }
}

/// Active-set entry. Only the job's actor writes to it.
pub(crate) struct ActiveJob {
    pub id: JobId,
    pub state: watch::Sender<LiveJob>,
    pub events: broadcast::Sender<EventFrame>,
    history: Mutex<VecDeque<EventFrame>>,
    history_limit: usize,
    pub gate: Arc<ExitGate>,
}

impl fmt::Debug for ActiveJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let live = self.state.borrow();
        f.debug_struct("ActiveJob")
            .field("id", &self.id)
            .field("status", &live.record.status)
            .field("sequence", &live.sequence)
            .field("finalizing", &live.finalizing)
            .field("subscribers", &self.events.receiver_count())
            .finish()
    }
}

impl ActiveJob {
    pub fn new(
        record: JobRecord,
        channel_capacity: usize,
        history_limit: usize,
    ) -> Self {
        let id = record.id;
        let (state, _) = watch::channel(LiveJob {
            record,
            sequence: 0,
            finalizing: false,
        });
        let (events, _) = broadcast::channel(channel_capacity.max(1));
        Self {
            id,
            state,
            events,
            history: Mutex::new(VecDeque::with_capacity(history_limit.min(1024))),
            history_limit,
            gate: Arc::new(ExitGate::new()),
        }
    }

    pub fn live(&self) -> LiveJob {
        self.state.borrow().clone()
    }

    /// Apply `update` to the live record and publish the resulting frame.
    pub fn publish<F>(&self, payload: FramePayload, update: F) -> EventFrame
    where
        F: FnOnce(&mut LiveJob),
    {
        let mut sequence = 0;
        self.state.send_modify(|live| {
            update(live);
            live.sequence += 1;
            sequence = live.sequence;
        });
        let frame = EventFrame {
            sequence,
            job_id: self.id,
            at: Utc::now(),
            payload,
        };

        // History and broadcast move together so subscribe() can take a
        // consistent cut.
        let mut history = self.history.lock();
        if self.history_limit > 0 {
            if history.len() == self.history_limit {
                history.pop_front();
            }
            history.push_back(frame.clone());
        }
        let _ = self.events.send(frame.clone());
        frame
    }

    /// Buffered frames plus a receiver for everything after them.
    pub fn subscribe(&self) -> (Vec<EventFrame>, broadcast::Receiver<EventFrame>) {
        let history = self.history.lock();
        let receiver = self.events.subscribe();
        (history.iter().cloned().collect(), receiver)
    }

    pub fn history_since(&self, since: u64) -> Vec<EventFrame> {
        self.history
            .lock()
            .iter()
            .filter(|frame| frame.sequence > since)
            .cloned()
            .collect()
    }
}

/// Fold one parsed event into the job record.
pub fn apply_progress(record: &mut JobRecord, event: &ProgressEvent) {
    match event {
        ProgressEvent::ProgressUpdate {
            completed,
            total,
            current_unit,
        } => {
            if let Some(total) = total {
                record.total_units = *total;
            }
            if let Some(completed) = completed {
                record.completed_units = record.completed_units.max(*completed);
            }
            if let Some(unit) = current_unit {
                record.current_unit = Some(unit.clone());
            }
        }
        ProgressEvent::UnitResult(result) => {
            match result.outcome {
                UnitOutcome::Pass => record.pass_count += 1,
                UnitOutcome::Fail => record.fail_count += 1,
            }
            record.current_unit = Some(result.unit.clone());
            record.results.push(result.clone());

            let mut units: Vec<&str> =
                record.results.iter().map(|r| r.unit.as_str()).collect();
            units.sort_unstable();
            units.dedup();
            let finished = u32::try_from(units.len()).unwrap_or(u32::MAX);
            record.completed_units = record.completed_units.max(finished);
        }
        ProgressEvent::ArtifactReady { .. } => {}
        ProgressEvent::Completed => {
            record.current_unit = None;
        }
        ProgressEvent::Failed { reason } => {
            if record.error_message.is_none() {
                record.error_message = Some(reason.clone());
            }
        }
    }
    if record.total_units < record.completed_units {
        record.total_units = record.completed_units;
    }
}
