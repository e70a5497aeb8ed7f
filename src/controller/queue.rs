//! Shared pending-task FIFO with node-affinity avoidance on retry.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::controller::task::TaskHandle;
use crate::sync_ext::MutexExt;

/// Result of asking the queue for work.
pub(crate) enum PopOutcome {
    Task(TaskHandle),
    /// Pending work exists but all of it last ran on the asking worker and
    /// other workers are still live; the caller should let one of them take
    /// it and ask again shortly.
    Wait,
    Empty,
}

pub(crate) struct TaskQueue {
    pending: Mutex<VecDeque<TaskHandle>>,
}

impl TaskQueue {
    pub fn new(tasks: impl IntoIterator<Item = TaskHandle>) -> Self {
        Self {
            pending: Mutex::new(tasks.into_iter().collect()),
        }
    }

    /// Pop the next task for `worker_ip`.
    ///
    /// While more than one worker is live, a retry never returns to the
    /// node whose attempt failed it: the asker gets the first task whose
    /// previous attempt ran elsewhere, or `Wait` when only its own retries
    /// are pending. A lone worker takes the head unconditionally so nothing
    /// starves when the fleet shrinks to one.
    pub fn pop_next(&self, worker_ip: &str, live_workers: usize) -> PopOutcome {
        let mut pending = self.pending.lock_unpoisoned();
        if pending.is_empty() {
            return PopOutcome::Empty;
        }

        if live_workers > 1 {
            let preferred = pending.iter().position(|handle| {
                handle.lock_unpoisoned().last_worker.as_deref() != Some(worker_ip)
            });
            match preferred {
                Some(index) => match pending.remove(index) {
                    Some(handle) => PopOutcome::Task(handle),
                    None => PopOutcome::Empty,
                },
                None => PopOutcome::Wait,
            }
        } else {
            match pending.pop_front() {
                Some(handle) => PopOutcome::Task(handle),
                None => PopOutcome::Empty,
            }
        }
    }

    pub fn push_retry(&self, task: TaskHandle) {
        self.pending.lock_unpoisoned().push_back(task);
    }

    /// Remove and return everything still pending (used when the stop
    /// signal interrupts a batch).
    pub fn drain_remaining(&self) -> Vec<TaskHandle> {
        self.pending.lock_unpoisoned().drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::controller::task::{Task, task_handle};

    fn queued_task(id: &str, last_worker: Option<&str>) -> TaskHandle {
        let mut task = Task::new(
            id.into(),
            PathBuf::from("in.mp4"),
            PathBuf::from("out.mp4"),
            Vec::new(),
            2,
        );
        task.last_worker = last_worker.map(str::to_string);
        task_handle(task)
    }

    fn expect_task(outcome: PopOutcome) -> String {
        match outcome {
            PopOutcome::Task(handle) => handle.lock().unwrap().id.clone(),
            PopOutcome::Wait => panic!("expected a task, got Wait"),
            PopOutcome::Empty => panic!("expected a task, got Empty"),
        }
    }

    #[test]
    fn pops_in_fifo_order_for_single_worker() {
        let queue = TaskQueue::new([queued_task("task_1", None), queued_task("task_2", None)]);
        assert_eq!(expect_task(queue.pop_next("10.0.0.1", 1)), "task_1");
        assert_eq!(expect_task(queue.pop_next("10.0.0.1", 1)), "task_2");
        assert!(matches!(queue.pop_next("10.0.0.1", 1), PopOutcome::Empty));
    }

    #[test]
    fn retry_prefers_a_different_worker() {
        // task_1 already failed on A; A takes the untouched task_2 while
        // task_1 stays available for B.
        let queue = TaskQueue::new([
            queued_task("task_1", Some("A")),
            queued_task("task_2", None),
        ]);
        assert_eq!(expect_task(queue.pop_next("A", 2)), "task_2");
        assert_eq!(expect_task(queue.pop_next("B", 2)), "task_1");
    }

    #[test]
    fn own_retries_wait_while_peers_are_live() {
        let queue = TaskQueue::new([queued_task("task_1", Some("A"))]);
        assert!(matches!(queue.pop_next("A", 2), PopOutcome::Wait));
        assert_eq!(expect_task(queue.pop_next("B", 2)), "task_1");
    }

    #[test]
    fn lone_worker_takes_its_own_retries() {
        let queue = TaskQueue::new([queued_task("task_1", Some("A"))]);
        assert_eq!(expect_task(queue.pop_next("A", 1)), "task_1");
    }

    #[test]
    fn retry_push_appends_to_tail() {
        let queue = TaskQueue::new([queued_task("task_1", None)]);
        queue.push_retry(queued_task("task_2", Some("A")));
        assert_eq!(expect_task(queue.pop_next("B", 2)), "task_1");
        assert_eq!(expect_task(queue.pop_next("B", 2)), "task_2");
    }

    #[test]
    fn drain_remaining_empties_the_queue() {
        let queue = TaskQueue::new([queued_task("task_1", None), queued_task("task_2", None)]);
        assert_eq!(queue.drain_remaining().len(), 2);
        assert!(matches!(queue.pop_next("A", 1), PopOutcome::Empty));
    }
}
