//! Controller-side task model.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::timefmt::human_now;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Uploading,
    Processing,
    Completed,
    Failed,
    Error,
    Stopped,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Uploading => "uploading",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Error => "error",
            TaskStatus::Stopped => "stopped",
        };
        f.write_str(label)
    }
}

/// One transcoding work item. Identity and inputs are fixed at creation;
/// the scheduler drives everything else.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: String,
    pub input_file: PathBuf,
    pub output_file: PathBuf,
    pub ffmpeg_args: Vec<String>,
    pub max_attempts: u32,

    pub status: TaskStatus,
    /// Current assignee. `None` exactly while the task is pending.
    pub worker: Option<String>,
    /// Assignee of the most recent attempt; drives retry affinity avoidance.
    pub last_worker: Option<String>,
    pub attempts: u32,
    pub progress: u8,
    pub error: Option<String>,
    pub create_time: String,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
}

impl Task {
    pub fn new(
        id: String,
        input_file: PathBuf,
        output_file: PathBuf,
        ffmpeg_args: Vec<String>,
        max_attempts: u32,
    ) -> Self {
        Self {
            id,
            input_file,
            output_file,
            ffmpeg_args,
            max_attempts: max_attempts.max(1),
            status: TaskStatus::Pending,
            worker: None,
            last_worker: None,
            attempts: 0,
            progress: 0,
            error: None,
            create_time: human_now(),
            start_time: None,
            end_time: None,
        }
    }
}

/// Tasks are shared between the dispatch loop that owns an attempt and the
/// poll thread mirroring worker progress into it.
pub type TaskHandle = Arc<Mutex<Task>>;

pub fn task_handle(task: Task) -> TaskHandle {
    Arc::new(Mutex::new(task))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_task_is_pending_and_unassigned() {
        let task = Task::new(
            "task_1".into(),
            PathBuf::from("in.mp4"),
            PathBuf::from("in_transcoded.mp4"),
            vec!["-c:v".into(), "libx265".into()],
            2,
        );
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.worker.is_none());
        assert!(task.last_worker.is_none());
        assert_eq!(task.attempts, 0);
        assert_eq!(task.progress, 0);
        assert!(!task.status.is_terminal());
    }

    #[test]
    fn max_attempts_is_at_least_one() {
        let task = Task::new(
            "task_1".into(),
            PathBuf::from("in.mp4"),
            PathBuf::from("out.mp4"),
            Vec::new(),
            0,
        );
        assert_eq!(task.max_attempts, 1);
    }
}
