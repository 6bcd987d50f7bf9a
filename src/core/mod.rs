//! 核心层：错误类型与任务调度

pub mod error;
pub mod task_scheduler;

pub use error::{BridgeError, SchedulerError};
pub use task_scheduler::{AdmissionPolicy, SchedulerConfig, TaskId, TaskOptions, TaskScheduler};
