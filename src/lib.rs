#![deny(missing_docs)]
//! 一个有界并发任务执行库：在固定数量的工作线程上 fork 一组任务，
//! 按重试策略执行，并在唯一的 join 点汇总结果、失败或超时。

pub use cancel::CancelToken;
pub use config::{PoolConfig, RetryConfig, RunnerConfig};
pub use error::{Result, TaskScopeError};
pub use retry::{default_retryable, Jitter, RetryPolicy};
pub use scope::{
    Attempt, AttemptOutcome, JoinMode, JoinResult, Outcome, Scope, ScopeState, SubtaskHandle,
    SubtaskState,
};
pub use task::{fatal, Fatal, Task, TaskContext, TaskError, TaskId, TaskPanicked};
pub use thread_pool::{JobHandle, OverflowPolicy, RayonThreadPool, ThreadPool, WorkerPool};

#[macro_use]
extern crate slog;
extern crate slog_async;
extern crate slog_term;

mod cancel;
mod config;
mod error;
mod retry;
mod scope;
mod task;
pub mod logging;
pub mod thread_pool;
