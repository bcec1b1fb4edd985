//! 任务定义：任务标识、任务体、执行上下文与任务错误

use failure::Fail;
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::cancel::CancelToken;
use crate::retry::RetryPolicy;
use crate::TaskScopeError;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// 任务的不透明标识，进程内唯一
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    fn next() -> Self {
        TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// 返回标识对应的整数值
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// 任务体：每次尝试调用一次
pub(crate) type TaskBody<V> =
    Box<dyn FnMut(&TaskContext) -> Result<V, failure::Error> + Send + 'static>;

/// 一个可被 fork 到 Scope 中的工作单元
///
/// 任务体可能被调用多次（每次重试一次），因此要求 `FnMut`。
/// 任务需要的上下文（如 trace id）应由闭包显式捕获。
pub struct Task<V> {
    id: TaskId,
    name: String,
    body: TaskBody<V>,
    retry: Option<RetryPolicy>,
}

impl<V> Task<V> {
    /// 根据名字和任务体生成一个任务
    pub fn new<F>(name: impl Into<String>, body: F) -> Self
    where
        F: FnMut(&TaskContext) -> Result<V, failure::Error> + Send + 'static,
    {
        Task {
            id: TaskId::next(),
            name: name.into(),
            body: Box::new(body),
            retry: None,
        }
    }

    /// 为该任务单独指定重试策略，覆盖 Scope 的默认策略
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// 任务标识
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// 任务名
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn into_parts(self) -> (TaskId, String, TaskBody<V>, Option<RetryPolicy>) {
        (self.id, self.name, self.body, self.retry)
    }
}

impl<V> fmt::Debug for Task<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("retry", &self.retry)
            .finish()
    }
}

/// 单次尝试的执行上下文
#[derive(Debug, Clone)]
pub struct TaskContext {
    id: TaskId,
    attempt: u32,
    cancel: CancelToken,
}

impl TaskContext {
    pub(crate) fn new(id: TaskId, attempt: u32, cancel: CancelToken) -> Self {
        TaskContext { id, attempt, cancel }
    }

    /// 当前任务标识
    pub fn task_id(&self) -> TaskId {
        self.id
    }

    /// 当前尝试序号，从 1 开始
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// 所属 Scope 是否已被取消
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// 协作式取消检查点
    ///
    /// 若 Scope 已被取消，返回 `TaskScopeError::Cancelled`，
    /// 任务体应通过 `?` 直接返回该错误。
    pub fn checkpoint(&self) -> Result<(), failure::Error> {
        if self.cancel.is_cancelled() {
            Err(TaskScopeError::Cancelled.into())
        } else {
            Ok(())
        }
    }

    /// 可被取消打断的睡眠，被取消时返回 `TaskScopeError::Cancelled`
    pub fn sleep(&self, dur: std::time::Duration) -> Result<(), failure::Error> {
        if self.cancel.sleep(dur) {
            Err(TaskScopeError::Cancelled.into())
        } else {
            Ok(())
        }
    }
}

/// 不可重试的错误包装
///
/// 默认重试策略遇到 `Fatal` 时立即终止任务。
#[derive(Debug)]
pub struct Fatal(failure::Error);

impl fmt::Display for Fatal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Fail for Fatal {
    fn cause(&self) -> Option<&dyn Fail> {
        Some(self.0.as_fail())
    }
}

/// 将错误标记为不可重试
pub fn fatal<E: Into<failure::Error>>(err: E) -> failure::Error {
    Fatal(err.into()).into()
}

/// 任务体发生 panic
#[derive(Debug, Fail)]
#[fail(display = "task panicked: {}", _0)]
pub struct TaskPanicked(pub String);

/// 任务在某次尝试中产生的错误
#[derive(Debug, Clone)]
pub struct TaskError {
    task: TaskId,
    attempt: u32,
    error: Arc<failure::Error>,
}

impl TaskError {
    pub(crate) fn new(task: TaskId, attempt: u32, error: failure::Error) -> Self {
        TaskError {
            task,
            attempt,
            error: Arc::new(error),
        }
    }

    /// 出错任务的标识
    pub fn task_id(&self) -> TaskId {
        self.task
    }

    /// 出错时的尝试序号
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// 任务体返回的原始错误
    pub fn error(&self) -> &failure::Error {
        &self.error
    }

    /// 原始错误能否向下转型为 `T`
    pub fn downcast_ref<T: Fail>(&self) -> Option<&T> {
        self.error.downcast_ref::<T>()
    }

    /// 是否被标记为不可重试
    pub fn is_fatal(&self) -> bool {
        self.downcast_ref::<Fatal>().is_some()
    }

    /// 是否由 panic 引起
    pub fn is_panic(&self) -> bool {
        self.downcast_ref::<TaskPanicked>().is_some()
    }

    /// 是否在检查点观察到取消
    pub fn is_cancelled(&self) -> bool {
        match self.downcast_ref::<TaskScopeError>() {
            Some(TaskScopeError::Cancelled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} failed on attempt {}: {}",
            self.task, self.attempt, self.error
        )
    }
}

impl Fail for TaskError {
    fn cause(&self) -> Option<&dyn Fail> {
        Some(self.error.as_fail())
    }
}

/// 从 panic 负载中提取信息
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use failure::format_err;

    #[test]
    fn task_ids_are_unique() {
        let a: Task<()> = Task::new("a", |_| Ok(()));
        let b: Task<()> = Task::new("b", |_| Ok(()));
        assert_ne!(a.id(), b.id());
        assert_eq!(a.name(), "a");
    }

    #[test]
    fn classify_task_errors() {
        let id = TaskId::next();
        let plain = TaskError::new(id, 1, format_err!("boom"));
        assert!(!plain.is_fatal());
        assert!(!plain.is_panic());
        assert!(!plain.is_cancelled());

        let fatal_err = TaskError::new(id, 2, fatal(format_err!("nope")));
        assert!(fatal_err.is_fatal());
        assert_eq!(fatal_err.attempt(), 2);
        assert_eq!(
            fatal_err.to_string(),
            format!("{} failed on attempt 2: nope", id)
        );

        let panicked = TaskError::new(id, 1, TaskPanicked("oops".to_string()).into());
        assert!(panicked.is_panic());

        let cancelled = TaskError::new(id, 1, TaskScopeError::Cancelled.into());
        assert!(cancelled.is_cancelled());
    }

    #[test]
    fn checkpoint_reports_cancellation() {
        let token = CancelToken::new();
        let ctx = TaskContext::new(TaskId::next(), 1, token.clone());
        assert!(ctx.checkpoint().is_ok());
        token.cancel();
        assert!(ctx.is_cancelled());
        assert!(ctx.checkpoint().is_err());
    }

    #[test]
    fn panic_payloads() {
        let payload: Box<dyn Any + Send> = Box::new("static str");
        assert_eq!(panic_message(&*payload), "static str");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(&*payload), "owned");
        let payload: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(&*payload), "unknown panic payload");
    }
}
