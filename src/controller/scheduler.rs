//! Batch dispatch: map N pending tasks over M workers, one in-flight task
//! per worker, with retry and node-affinity avoidance.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::controller::client::WorkerClient;
use crate::controller::queue::{PopOutcome, TaskQueue};
use crate::controller::task::{Task, TaskHandle, TaskStatus};
use crate::controller::validate_output_file;
use crate::sync_ext::MutexExt;
use crate::timefmt::human_now;

const IDLE_POLL: Duration = Duration::from_millis(50);
const STATUS_POLL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no workers available")]
    NoWorkers,
    #[error("no worker supports encoder {codec}")]
    NoCapableWorkers { codec: String },
    #[error("encoder {codec} requires a capability probe still pending for: {workers}")]
    CapabilitiesUnknown { codec: String, workers: String },
}

/// Snapshots published by the dispatch machinery. Consumers read from the
/// channel at their own pace; a slow or absent consumer never stalls a
/// dispatch loop.
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    TaskUpdated(Task),
    NodeStatus { worker: String, status: Value },
    Finished(DispatchReport),
}

#[derive(Clone)]
pub struct EventBus {
    tx: Option<Sender<SchedulerEvent>>,
}

impl EventBus {
    /// A bus with a consumer on the other end.
    pub fn channel() -> (Self, Receiver<SchedulerEvent>) {
        let (tx, rx) = channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A bus that drops everything, for callers without a consumer.
    pub fn sink() -> Self {
        Self { tx: None }
    }

    fn publish(&self, event: SchedulerEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }

    pub(crate) fn task_updated(&self, handle: &TaskHandle) {
        if self.tx.is_some() {
            let snapshot = handle.lock_unpoisoned().clone();
            self.publish(SchedulerEvent::TaskUpdated(snapshot));
        }
    }

    pub(crate) fn node_status(&self, worker: &str, status: Value) {
        self.publish(SchedulerEvent::NodeStatus {
            worker: worker.to_string(),
            status,
        });
    }

    fn finished(&self, report: DispatchReport) {
        self.publish(SchedulerEvent::Finished(report));
    }
}

/// One attempt against one worker, collapsed to `(ok, error message)`.
/// Abstracted so scheduler behavior is testable without sockets.
pub(crate) trait AttemptSubmitter: Send + Sync {
    fn submit(
        &self,
        task: &TaskHandle,
        worker_ip: &str,
        stop: &Arc<AtomicBool>,
        events: &EventBus,
    ) -> (bool, Option<String>);
}

/// Drive the full batch to completion. Returns once every task reached a
/// terminal state, or once `stop` was observed (remaining tasks are then
/// marked stopped and excluded from the counts).
pub(crate) fn dispatch_tasks(
    tasks: &[TaskHandle],
    workers: &[String],
    submitter: Arc<dyn AttemptSubmitter>,
    events: &EventBus,
    stop: &Arc<AtomicBool>,
) -> Result<DispatchReport, DispatchError> {
    let total = tasks.len();
    if total == 0 {
        let report = DispatchReport {
            total: 0,
            completed: 0,
            failed: 0,
        };
        events.finished(report);
        return Ok(report);
    }
    if workers.is_empty() {
        return Err(DispatchError::NoWorkers);
    }

    info!(total, workers = workers.len(), "dispatching batch");

    let queue = Arc::new(TaskQueue::new(tasks.iter().cloned()));
    let completed = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let in_flight = Arc::new(AtomicUsize::new(0));
    let live_workers = Arc::new(AtomicUsize::new(workers.len()));

    let mut join_handles = Vec::with_capacity(workers.len());
    for worker_ip in workers {
        let loop_ctx = WorkerLoop {
            worker_ip: worker_ip.clone(),
            queue: queue.clone(),
            submitter: submitter.clone(),
            events: events.clone(),
            stop: stop.clone(),
            completed: completed.clone(),
            failed: failed.clone(),
            in_flight: in_flight.clone(),
            live_workers: live_workers.clone(),
        };
        let spawned = thread::Builder::new()
            .name(format!("tc-dispatch-{worker_ip}"))
            .spawn(move || loop_ctx.run());
        match spawned {
            Ok(handle) => join_handles.push(handle),
            Err(err) => {
                warn!(%err, worker = %worker_ip, "failed to spawn dispatch thread");
                live_workers.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }
    if join_handles.is_empty() {
        return Err(DispatchError::NoWorkers);
    }
    for handle in join_handles {
        let _ = handle.join();
    }

    // A stop can leave never-attempted tasks behind; settle them so no task
    // is left claiming to be pending.
    for handle in queue.drain_remaining() {
        {
            let mut task = handle.lock_unpoisoned();
            task.status = TaskStatus::Stopped;
            task.end_time = Some(human_now());
        }
        events.task_updated(&handle);
    }

    let report = DispatchReport {
        total,
        completed: completed.load(Ordering::SeqCst),
        failed: failed.load(Ordering::SeqCst),
    };
    info!(?report, "dispatch finished");
    events.finished(report);
    Ok(report)
}

struct WorkerLoop {
    worker_ip: String,
    queue: Arc<TaskQueue>,
    submitter: Arc<dyn AttemptSubmitter>,
    events: EventBus,
    stop: Arc<AtomicBool>,
    completed: Arc<AtomicUsize>,
    failed: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    live_workers: Arc<AtomicUsize>,
}

impl WorkerLoop {
    fn run(self) {
        loop {
            if self.stop.load(Ordering::SeqCst) {
                break;
            }
            match self
                .queue
                .pop_next(&self.worker_ip, self.live_workers.load(Ordering::SeqCst))
            {
                PopOutcome::Task(handle) => {
                    self.in_flight.fetch_add(1, Ordering::SeqCst);
                    self.run_attempt(&handle);
                    // Retry pushes happen inside run_attempt, before this
                    // decrement, so peers never observe an empty queue with
                    // zero in-flight work while a retry is pending.
                    self.in_flight.fetch_sub(1, Ordering::SeqCst);
                }
                PopOutcome::Wait => thread::sleep(IDLE_POLL),
                PopOutcome::Empty => {
                    if self.in_flight.load(Ordering::SeqCst) == 0 {
                        break;
                    }
                    // An in-flight task elsewhere may still be requeued.
                    thread::sleep(IDLE_POLL);
                }
            }
        }
        self.live_workers.fetch_sub(1, Ordering::SeqCst);
        debug!(worker = %self.worker_ip, "dispatch loop exited");
    }

    fn run_attempt(&self, handle: &TaskHandle) {
        {
            let mut task = handle.lock_unpoisoned();
            task.worker = Some(self.worker_ip.clone());
            task.last_worker = Some(self.worker_ip.clone());
            task.attempts += 1;
            task.status = TaskStatus::Uploading;
            task.progress = 0;
            task.error = None;
            if task.start_time.is_none() {
                task.start_time = Some(human_now());
            }
            debug!(task = %task.id, worker = %self.worker_ip, attempt = task.attempts, "attempt starting");
        }
        self.events.task_updated(handle);

        let (ok, error) = self
            .submitter
            .submit(handle, &self.worker_ip, &self.stop, &self.events);

        let mut requeue = false;
        {
            let mut task = handle.lock_unpoisoned();
            if ok {
                task.status = TaskStatus::Completed;
                task.progress = 100;
                task.error = None;
                task.end_time = Some(human_now());
                self.completed.fetch_add(1, Ordering::SeqCst);
                info!(task = %task.id, worker = %self.worker_ip, "task completed");
            } else if task.attempts < task.max_attempts && !self.stop.load(Ordering::SeqCst) {
                task.status = TaskStatus::Pending;
                task.progress = 0;
                task.worker = None;
                task.error = error;
                requeue = true;
                info!(
                    task = %task.id,
                    worker = %self.worker_ip,
                    attempt = task.attempts,
                    max_attempts = task.max_attempts,
                    "attempt failed, requeueing"
                );
            } else {
                task.status = TaskStatus::Failed;
                task.error = error;
                task.end_time = Some(human_now());
                self.failed.fetch_add(1, Ordering::SeqCst);
                warn!(task = %task.id, worker = %self.worker_ip, error = ?task.error, "task failed");
            }
        }
        if requeue {
            self.queue.push_retry(handle.clone());
        }
        self.events.task_updated(handle);
    }
}

/// Real submitter: POST the task, mirror `/status` into the task while the
/// POST is in flight, then download and validate the output.
pub(crate) struct HttpSubmitter {
    pub client: Arc<WorkerClient>,
}

impl AttemptSubmitter for HttpSubmitter {
    fn submit(
        &self,
        task: &TaskHandle,
        worker_ip: &str,
        stop: &Arc<AtomicBool>,
        events: &EventBus,
    ) -> (bool, Option<String>) {
        let (task_id, input_file, output_file, ffmpeg_args) = {
            let task = task.lock_unpoisoned();
            (
                task.id.clone(),
                task.input_file.clone(),
                task.output_file.clone(),
                task.ffmpeg_args.clone(),
            )
        };

        let done = Arc::new(AtomicBool::new(false));
        let poller = spawn_status_poller(
            self.client.clone(),
            task.clone(),
            worker_ip.to_string(),
            done.clone(),
            stop.clone(),
            events.clone(),
        );

        let result = self
            .client
            .submit_task(worker_ip, &task_id, &input_file, &ffmpeg_args);

        done.store(true, Ordering::SeqCst);
        if let Some(poller) = poller {
            let _ = poller.join();
        }

        let remote_path = match result {
            Ok(path) => path,
            Err(err) => return (false, Some(err.to_string())),
        };

        // The worker reports its own staging path; we only need the name.
        let remote_name = Path::new(&remote_path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&remote_path)
            .to_string();

        if let Err(err) = self.client.download(worker_ip, &remote_name, &output_file) {
            return (false, Some(err.to_string()));
        }
        match validate_output_file(&output_file) {
            Ok(()) => (true, None),
            Err(message) => (false, Some(message)),
        }
    }
}

/// Mirror the worker's `/status` into the task roughly once a second until
/// the main POST settles. The poll thread never outlives the attempt.
fn spawn_status_poller(
    client: Arc<WorkerClient>,
    task: TaskHandle,
    worker_ip: String,
    done: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    events: EventBus,
) -> Option<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("tc-poll-{worker_ip}"))
        .spawn(move || {
            let finished = || done.load(Ordering::SeqCst) || stop.load(Ordering::SeqCst);
            while !finished() {
                // Sleep in short slices so the join after POST is prompt.
                let mut waited = Duration::ZERO;
                while waited < STATUS_POLL && !finished() {
                    thread::sleep(Duration::from_millis(100));
                    waited += Duration::from_millis(100);
                }
                if finished() {
                    break;
                }

                let status = match client.status(&worker_ip) {
                    Ok(status) => status,
                    Err(err) => {
                        debug!(worker = %worker_ip, %err, "status poll failed");
                        continue;
                    }
                };

                let worker_state = status
                    .get("status")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let worker_progress = status
                    .get("progress")
                    .and_then(Value::as_u64)
                    .unwrap_or(0)
                    .min(100) as u8;

                let changed = {
                    let mut task = task.lock_unpoisoned();
                    match worker_state.as_str() {
                        "receiving" | "uploading" => {
                            let changed = task.status != TaskStatus::Uploading;
                            task.status = TaskStatus::Uploading;
                            changed
                        }
                        "processing" => {
                            let changed = task.status != TaskStatus::Processing
                                || task.progress != worker_progress;
                            task.status = TaskStatus::Processing;
                            task.progress = worker_progress;
                            changed
                        }
                        // Terminal worker states are settled by the POST
                        // response, not the poll.
                        _ => false,
                    }
                };
                if changed {
                    events.task_updated(&task);
                }
                events.node_status(&worker_ip, status);
            }
        })
        .ok()
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Mutex;

    use super::*;
    use crate::controller::task::{Task, task_handle};

    /// Scripted submitter: pops the next outcome per call and records which
    /// worker served each attempt.
    struct ScriptedSubmitter {
        outcomes: Mutex<Vec<bool>>,
        calls: Mutex<Vec<(String, String)>>,
        stop_after_first: Option<Arc<AtomicBool>>,
    }

    impl ScriptedSubmitter {
        fn new(outcomes: Vec<bool>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes),
                calls: Mutex::new(Vec::new()),
                stop_after_first: None,
            }
        }

        fn calls(&self) -> Vec<(String, String)> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl AttemptSubmitter for ScriptedSubmitter {
        fn submit(
            &self,
            task: &TaskHandle,
            worker_ip: &str,
            _stop: &Arc<AtomicBool>,
            _events: &EventBus,
        ) -> (bool, Option<String>) {
            let task_id = task.lock().unwrap().id.clone();
            self.calls
                .lock()
                .unwrap()
                .push((task_id, worker_ip.to_string()));
            if let Some(stop) = &self.stop_after_first {
                stop.store(true, Ordering::SeqCst);
            }
            let ok = {
                let mut outcomes = self.outcomes.lock().unwrap();
                if outcomes.is_empty() { true } else { outcomes.remove(0) }
            };
            if ok {
                (true, None)
            } else {
                (false, Some("scripted failure".to_string()))
            }
        }
    }

    fn make_task(id: &str, max_attempts: u32) -> TaskHandle {
        task_handle(Task::new(
            id.into(),
            PathBuf::from("in.mp4"),
            PathBuf::from("in_transcoded.mp4"),
            vec!["-c:v".into(), "libx265".into()],
            max_attempts,
        ))
    }

    fn workers(ips: &[&str]) -> Vec<String> {
        ips.iter().map(|ip| ip.to_string()).collect()
    }

    #[test]
    fn empty_batch_returns_zero_report_immediately() {
        let submitter = Arc::new(ScriptedSubmitter::new(Vec::new()));
        let report = dispatch_tasks(
            &[],
            &workers(&["10.0.0.2"]),
            submitter,
            &EventBus::sink(),
            &Arc::new(AtomicBool::new(false)),
        )
        .unwrap();
        assert_eq!(
            report,
            DispatchReport {
                total: 0,
                completed: 0,
                failed: 0
            }
        );
    }

    #[test]
    fn empty_worker_list_is_rejected() {
        let submitter = Arc::new(ScriptedSubmitter::new(Vec::new()));
        let err = dispatch_tasks(
            &[make_task("task_1", 1)],
            &[],
            submitter,
            &EventBus::sink(),
            &Arc::new(AtomicBool::new(false)),
        )
        .unwrap_err();
        assert!(matches!(err, DispatchError::NoWorkers));
    }

    #[test]
    fn single_success_records_worker_and_attempt() {
        let submitter = Arc::new(ScriptedSubmitter::new(vec![true]));
        let task = make_task("task_1", 1);
        let report = dispatch_tasks(
            &[task.clone()],
            &workers(&["10.0.0.2"]),
            submitter,
            &EventBus::sink(),
            &Arc::new(AtomicBool::new(false)),
        )
        .unwrap();

        assert_eq!(report.total, 1);
        assert_eq!(report.completed, 1);
        assert_eq!(report.failed, 0);

        let task = task.lock().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.worker.as_deref(), Some("10.0.0.2"));
        assert_eq!(task.attempts, 1);
        assert_eq!(task.progress, 100);
        assert!(task.end_time.is_some());
    }

    #[test]
    fn failure_then_success_retries_to_completion() {
        let submitter = Arc::new(ScriptedSubmitter::new(vec![false, true]));
        let task = make_task("task_1", 2);
        let report = dispatch_tasks(
            &[task.clone()],
            &workers(&["192.168.1.2"]),
            submitter,
            &EventBus::sink(),
            &Arc::new(AtomicBool::new(false)),
        )
        .unwrap();

        assert_eq!(report.completed, 1);
        assert_eq!(report.failed, 0);
        let task = task.lock().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.attempts, 2);
    }

    #[test]
    fn retry_is_exhausted_after_max_attempts() {
        let submitter = Arc::new(ScriptedSubmitter::new(vec![false, false]));
        let task = make_task("task_1", 2);
        let report = dispatch_tasks(
            &[task.clone()],
            &workers(&["192.168.1.2"]),
            submitter.clone(),
            &EventBus::sink(),
            &Arc::new(AtomicBool::new(false)),
        )
        .unwrap();

        assert_eq!(report.completed, 0);
        assert_eq!(report.failed, 1);
        assert_eq!(submitter.calls().len(), 2);
        let task = task.lock().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempts, 2);
        assert_eq!(task.error.as_deref(), Some("scripted failure"));
    }

    #[test]
    fn retry_moves_to_a_different_worker() {
        let submitter = Arc::new(ScriptedSubmitter::new(vec![false, true]));
        let task = make_task("task_1", 2);
        let report = dispatch_tasks(
            &[task.clone()],
            &workers(&["10.0.0.2", "10.0.0.3"]),
            submitter.clone(),
            &EventBus::sink(),
            &Arc::new(AtomicBool::new(false)),
        )
        .unwrap();

        assert_eq!(report.completed, 1);
        let calls = submitter.calls();
        assert_eq!(calls.len(), 2);
        assert_ne!(calls[0].1, calls[1].1, "retry must avoid the failing node");
        let task = task.lock().unwrap();
        assert_eq!(task.attempts, 2);
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.last_worker, task.worker);
    }

    #[test]
    fn all_attempts_failing_terminates_with_all_tasks_failed() {
        let submitter = Arc::new(ScriptedSubmitter::new(vec![false; 6]));
        let tasks = vec![
            make_task("task_1", 2),
            make_task("task_2", 2),
            make_task("task_3", 2),
        ];
        let report = dispatch_tasks(
            &tasks,
            &workers(&["10.0.0.2", "10.0.0.3"]),
            submitter,
            &EventBus::sink(),
            &Arc::new(AtomicBool::new(false)),
        )
        .unwrap();

        assert_eq!(report.completed, 0);
        assert_eq!(report.failed, 3);
        assert_eq!(report.completed + report.failed, report.total);
        for task in &tasks {
            let task = task.lock().unwrap();
            assert_eq!(task.status, TaskStatus::Failed);
            assert_eq!(task.attempts, 2);
            assert!(task.attempts <= task.max_attempts);
        }
    }

    #[test]
    fn stop_signal_suppresses_retries() {
        let stop = Arc::new(AtomicBool::new(false));
        let submitter = Arc::new(ScriptedSubmitter {
            outcomes: Mutex::new(vec![false, false]),
            calls: Mutex::new(Vec::new()),
            stop_after_first: Some(stop.clone()),
        });
        let task = make_task("task_1", 3);
        let report = dispatch_tasks(
            &[task.clone()],
            &workers(&["10.0.0.2"]),
            submitter.clone(),
            &EventBus::sink(),
            &stop,
        )
        .unwrap();

        // One attempt happened; the stop signal turned the would-be retry
        // into a terminal failure.
        assert_eq!(submitter.calls().len(), 1);
        assert_eq!(report.failed, 1);
        assert_eq!(task.lock().unwrap().status, TaskStatus::Failed);
    }

    #[test]
    fn events_flow_from_uploading_to_finished() {
        let (events, rx) = EventBus::channel();
        let submitter = Arc::new(ScriptedSubmitter::new(vec![true]));
        let task = make_task("task_1", 1);
        dispatch_tasks(
            &[task],
            &workers(&["10.0.0.2"]),
            submitter,
            &events,
            &Arc::new(AtomicBool::new(false)),
        )
        .unwrap();

        let collected: Vec<SchedulerEvent> = rx.try_iter().collect();
        assert!(collected.len() >= 3);
        match &collected[0] {
            SchedulerEvent::TaskUpdated(task) => assert_eq!(task.status, TaskStatus::Uploading),
            other => panic!("expected TaskUpdated first, got {other:?}"),
        }
        match collected.last().unwrap() {
            SchedulerEvent::Finished(report) => {
                assert_eq!(report.completed, 1);
                assert_eq!(report.total, 1);
            }
            other => panic!("expected Finished last, got {other:?}"),
        }
    }
}
