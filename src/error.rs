use failure::Fail;
use std::io;

use crate::task::TaskError;

/// taskscope 错误类型.
#[derive(Debug, Fail)]
pub enum TaskScopeError {
    /// IO 错误.
    #[fail(display = "{}", _0)]
    Io(#[cause] io::Error),
    /// 配置文件反序列化错误.
    #[fail(display = "{}", _0)]
    Serde(#[cause] serde_json::Error),
    /// rayon 线程池创建失败.
    #[fail(display = "{}", _0)]
    Rayon(#[cause] rayon::ThreadPoolBuildError),
    /// 任务在某次尝试中失败且不再重试.
    #[fail(display = "{}", _0)]
    Task(#[cause] TaskError),
    /// 通过句柄提交的任务 panic.
    #[fail(display = "Job panicked: {}", _0)]
    JobPanicked(String),
    /// 线程池已关闭，不再接受任务.
    #[fail(display = "Thread pool is closed")]
    PoolClosed,
    /// 有界队列已满且溢出策略为拒绝.
    #[fail(display = "Task queue is full")]
    QueueFull,
    /// Scope 已开始 join 或已被取消，不能再 fork.
    #[fail(display = "Scope is closed")]
    ScopeClosed,
    /// 同一个 Scope 被 join 了两次.
    #[fail(display = "Scope has already been joined")]
    AlreadyJoined,
    /// 结果尚不可用.
    #[fail(display = "Result is not ready")]
    NotReady,
    /// 截止时间已过.
    #[fail(display = "Deadline elapsed")]
    TimedOut,
    /// 任务被取消.
    #[fail(display = "Task was cancelled")]
    Cancelled,
    /// 句柄不属于该 Scope.
    #[fail(display = "Subtask does not belong to this scope")]
    UnknownSubtask,
    /// 非法配置.
    #[fail(display = "Invalid configuration: {}", _0)]
    InvalidConfig(String),
}

impl From<io::Error> for TaskScopeError {
    fn from(err: io::Error) -> TaskScopeError {
        TaskScopeError::Io(err)
    }
}

impl From<serde_json::Error> for TaskScopeError {
    fn from(err: serde_json::Error) -> TaskScopeError {
        TaskScopeError::Serde(err)
    }
}

impl From<rayon::ThreadPoolBuildError> for TaskScopeError {
    fn from(err: rayon::ThreadPoolBuildError) -> TaskScopeError {
        TaskScopeError::Rayon(err)
    }
}

impl From<TaskError> for TaskScopeError {
    fn from(err: TaskError) -> TaskScopeError {
        TaskScopeError::Task(err)
    }
}

/// taskscope 中的 Result 类型
pub type Result<T> = std::result::Result<T, TaskScopeError>;
