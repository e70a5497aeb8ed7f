//! The single-task execution slot.
//!
//! One writer (the transcode thread) mutates the slot; HTTP handlers and the
//! discovery services read copy-out snapshots so they never observe a
//! half-updated record and never block on a running transcode.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use serde_json::Value;

use crate::sync_ext::MutexExt;
use crate::timefmt::human_now;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SlotStatus {
    Idle,
    Receiving,
    Processing,
    Completed,
    Error,
    Stopped,
}

impl SlotStatus {
    fn is_busy(self) -> bool {
        matches!(self, SlotStatus::Receiving | SlotStatus::Processing)
    }
}

/// Wire form of the slot, served by `/status` and embedded in heartbeats.
#[derive(Debug, Clone, Serialize)]
pub struct SlotSnapshot {
    pub status: SlotStatus,
    pub current_task: Option<String>,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SlotSnapshot {
    fn idle() -> Self {
        Self {
            status: SlotStatus::Idle,
            current_task: None,
            progress: 0,
            start_time: None,
            end_time: None,
            error: None,
        }
    }
}

/// Returned when a task submission races an occupied slot.
#[derive(Debug)]
pub struct SlotBusy;

pub struct ExecutionSlot {
    state: Mutex<SlotSnapshot>,
    stop: AtomicBool,
}

impl ExecutionSlot {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SlotSnapshot::idle()),
            stop: AtomicBool::new(false),
        }
    }

    /// Claim the slot for a new task. Allowed from `idle` and from any
    /// terminal state (a new submission implicitly settles the previous
    /// outcome); refused while a task is in flight or the worker is
    /// shutting down.
    pub fn try_begin_receiving(&self, task_name: &str) -> Result<(), SlotBusy> {
        if self.stop_requested() {
            return Err(SlotBusy);
        }
        let mut state = self.state.lock_unpoisoned();
        if state.status.is_busy() {
            return Err(SlotBusy);
        }
        *state = SlotSnapshot {
            status: SlotStatus::Receiving,
            current_task: Some(task_name.to_string()),
            progress: 0,
            start_time: Some(human_now()),
            end_time: None,
            error: None,
        };
        Ok(())
    }

    /// Input fully staged on disk; the transcode begins.
    pub fn mark_processing(&self) {
        let mut state = self.state.lock_unpoisoned();
        state.status = SlotStatus::Processing;
        state.progress = 0;
    }

    /// Update progress. Returns true when the percentage actually changed,
    /// letting callers skip redundant notifications.
    pub fn set_progress(&self, percent: u8) -> bool {
        let mut state = self.state.lock_unpoisoned();
        if state.progress == percent {
            return false;
        }
        state.progress = percent;
        true
    }

    pub fn mark_completed(&self) {
        let mut state = self.state.lock_unpoisoned();
        state.status = SlotStatus::Completed;
        state.current_task = None;
        state.progress = 100;
        state.end_time = Some(human_now());
        state.error = None;
    }

    pub fn mark_error(&self, error: impl Into<String>) {
        let mut state = self.state.lock_unpoisoned();
        state.status = SlotStatus::Error;
        state.current_task = None;
        state.progress = 0;
        state.end_time = Some(human_now());
        state.error = Some(error.into());
    }

    pub fn mark_stopped(&self) {
        let mut state = self.state.lock_unpoisoned();
        state.status = SlotStatus::Stopped;
        state.current_task = None;
        state.end_time = Some(human_now());
    }

    /// Plain copy-out read, used by heartbeats and the responder. Does not
    /// settle terminal states.
    pub fn snapshot(&self) -> SlotSnapshot {
        self.state.lock_unpoisoned().clone()
    }

    pub fn status_json(&self) -> Value {
        serde_json::to_value(self.snapshot()).unwrap_or(Value::Null)
    }

    /// `/status` read: report the current snapshot, then settle a terminal
    /// outcome back to `idle` so the next poll sees a quiet worker.
    pub fn read_status(&self) -> SlotSnapshot {
        let mut state = self.state.lock_unpoisoned();
        let snapshot = state.clone();
        if matches!(
            state.status,
            SlotStatus::Completed | SlotStatus::Error | SlotStatus::Stopped
        ) {
            *state = SlotSnapshot::idle();
        }
        snapshot
    }

    /// Shutdown: refuse new tasks and tell the transcode loop to abort.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }
}

impl Default for ExecutionSlot {
    fn default() -> Self {
        Self::new()
    }
}
