//! 结构化并发：在一个 Scope 中 fork 一组任务，并在唯一的 join 点汇总结果
//!
//! ```text
//! Scope 状态:   Open ──join()──► Joining ──(全部结束 / 首个失败 / 超时)──► Closed
//! 子任务状态:   Pending ──► Running ──► Succeeded | Failed | Cancelled
//!                  └──────────────────────────────────────► Cancelled
//! ```

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use slog::Logger;

use crate::cancel::CancelToken;
use crate::logging::discard_logger;
use crate::retry::RetryPolicy;
use crate::task::{panic_message, Task, TaskBody, TaskContext, TaskError, TaskId, TaskPanicked};
use crate::thread_pool::ThreadPool;
use crate::{Result, TaskScopeError};

static NEXT_SCOPE_ID: AtomicU64 = AtomicU64::new(1);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// join 的汇总方式
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinMode {
    /// 等待所有子任务结束，失败作为结果的一部分返回
    JoinAll,
    /// 首个子任务失败时取消其余子任务并立即返回
    ShutdownOnFailure,
}

/// Scope 的生命周期状态
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScopeState {
    /// 接受 fork
    Open,
    /// join 进行中
    Joining,
    /// join 已返回
    Closed,
}

/// 子任务状态
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubtaskState {
    /// 已提交，尚未开始
    Pending,
    /// 正在执行或等待重试
    Running,
    /// 成功
    Succeeded,
    /// 失败且不再重试
    Failed,
    /// 被取消
    Cancelled,
}

impl SubtaskState {
    /// 是否为终止状态
    pub fn is_terminal(self) -> bool {
        match self {
            SubtaskState::Succeeded | SubtaskState::Failed | SubtaskState::Cancelled => true,
            SubtaskState::Pending | SubtaskState::Running => false,
        }
    }

    fn from_u8(v: u8) -> SubtaskState {
        match v {
            0 => SubtaskState::Pending,
            1 => SubtaskState::Running,
            2 => SubtaskState::Succeeded,
            3 => SubtaskState::Failed,
            _ => SubtaskState::Cancelled,
        }
    }
}

/// 子任务的最终结果
#[derive(Clone, Debug)]
pub enum Outcome<V> {
    /// 成功的值
    Succeeded(V),
    /// 最后一次尝试的错误
    Failed(TaskError),
    /// 被取消
    Cancelled,
}

impl<V> Outcome<V> {
    /// 转换为 `Result`
    pub fn into_result(self) -> Result<V> {
        match self {
            Outcome::Succeeded(v) => Ok(v),
            Outcome::Failed(e) => Err(TaskScopeError::Task(e)),
            Outcome::Cancelled => Err(TaskScopeError::Cancelled),
        }
    }

    /// 是否成功
    pub fn is_success(&self) -> bool {
        match self {
            Outcome::Succeeded(_) => true,
            _ => false,
        }
    }

    fn state(&self) -> SubtaskState {
        match self {
            Outcome::Succeeded(_) => SubtaskState::Succeeded,
            Outcome::Failed(_) => SubtaskState::Failed,
            Outcome::Cancelled => SubtaskState::Cancelled,
        }
    }
}

/// join 的返回值
#[derive(Debug)]
pub enum JoinResult<V> {
    /// 所有子任务都已结束，结果按 fork 顺序排列
    Completed(Vec<Outcome<V>>),
    /// `ShutdownOnFailure` 模式下首个失败的子任务的错误
    Failed(TaskError),
    /// 截止时间已过
    TimedOut,
}

impl<V> JoinResult<V> {
    /// 所有子任务都成功时按 fork 顺序返回值，否则返回第一个错误
    pub fn into_values(self) -> Result<Vec<V>> {
        match self {
            JoinResult::Completed(outcomes) => {
                outcomes.into_iter().map(Outcome::into_result).collect()
            }
            JoinResult::Failed(e) => Err(TaskScopeError::Task(e)),
            JoinResult::TimedOut => Err(TaskScopeError::TimedOut),
        }
    }
}

/// 单次尝试的结果类别
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// 成功
    Succeeded,
    /// 任务体返回错误
    Failed,
    /// 任务体 panic
    Panicked,
    /// 在检查点观察到取消
    Cancelled,
    /// 在检查点观察到因超时引起的取消
    TimedOut,
}

/// 一次尝试的记录
#[derive(Clone, Debug)]
pub struct Attempt {
    /// 尝试序号，从 1 开始
    pub number: u32,
    /// 开始时间
    pub started: Instant,
    /// 耗时
    pub elapsed: Duration,
    /// 结果
    pub outcome: AttemptOutcome,
}

struct Slot<V> {
    id: TaskId,
    name: String,
    state: AtomicU8,
    outcome: Mutex<Option<Outcome<V>>>,
    attempts: Mutex<Vec<Attempt>>,
}

impl<V: Clone> Slot<V> {
    fn new(id: TaskId, name: String) -> Self {
        Slot {
            id,
            name,
            state: AtomicU8::new(SubtaskState::Pending as u8),
            outcome: Mutex::new(None),
            attempts: Mutex::new(Vec::new()),
        }
    }

    fn state(&self) -> SubtaskState {
        SubtaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn start(&self) -> bool {
        self.state
            .compare_exchange(
                SubtaskState::Pending as u8,
                SubtaskState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// 写入终止状态，已处于终止状态时不做任何事
    fn finish(&self, outcome: Outcome<V>) -> bool {
        let mut guard = lock(&self.outcome);
        if self.state().is_terminal() {
            return false;
        }
        let next = outcome.state();
        *guard = Some(outcome);
        self.state.store(next as u8, Ordering::Release);
        true
    }

    fn outcome(&self) -> Option<Outcome<V>> {
        if !self.state().is_terminal() {
            return None;
        }
        lock(&self.outcome).clone()
    }

    fn record(&self, attempt: Attempt) {
        lock(&self.attempts).push(attempt);
    }
}

struct Shared {
    cancel: CancelToken,
    timed_out: AtomicBool,
    mode: JoinMode,
    first_failure: Mutex<Option<TaskError>>,
    done: Sender<usize>,
}

impl Shared {
    fn record_failure(&self, err: TaskError) {
        let mut first = lock(&self.first_failure);
        if first.is_none() {
            *first = Some(err);
        }
        drop(first);
        if self.mode == JoinMode::ShutdownOnFailure {
            self.cancel.cancel();
        }
    }

    fn first_failure(&self) -> Option<TaskError> {
        lock(&self.first_failure).clone()
    }
}

/// 调用方持有的子任务句柄
pub struct SubtaskHandle<V> {
    index: usize,
    slot: Arc<Slot<V>>,
}

impl<V: Clone> SubtaskHandle<V> {
    /// fork 顺序中的位置
    pub fn index(&self) -> usize {
        self.index
    }

    /// 任务标识
    pub fn id(&self) -> TaskId {
        self.slot.id
    }

    /// 任务名
    pub fn name(&self) -> &str {
        &self.slot.name
    }

    /// 当前状态
    pub fn state(&self) -> SubtaskState {
        self.slot.state()
    }

    /// 已结束的尝试次数，正在进行的尝试不计入
    pub fn attempts(&self) -> u32 {
        lock(&self.slot.attempts).len() as u32
    }

    /// 所有已完成尝试的记录
    pub fn attempt_log(&self) -> Vec<Attempt> {
        lock(&self.slot.attempts).clone()
    }
}

impl<V: Clone> fmt::Debug for SubtaskHandle<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubtaskHandle")
            .field("index", &self.index)
            .field("id", &self.slot.id)
            .field("name", &self.slot.name)
            .field("state", &self.state())
            .finish()
    }
}

// 在工作线程上运行一个子任务及其重试循环
//
// 若未执行就被丢弃（线程池关闭、队列丢弃），Drop 会把子任务标记为取消。
struct SubtaskRunner<V: Clone> {
    index: usize,
    slot: Arc<Slot<V>>,
    shared: Arc<Shared>,
    body: TaskBody<V>,
    retry: RetryPolicy,
    logger: Logger,
}

impl<V: Clone> SubtaskRunner<V> {
    fn run(mut self) {
        if self.shared.cancel.is_cancelled() || !self.slot.start() {
            debug!(self.logger, "Cancelled before start");
            self.finish(Outcome::Cancelled);
            return;
        }

        let mut attempt = 0;
        let outcome = loop {
            if attempt > 0 && self.shared.cancel.is_cancelled() {
                break Outcome::Cancelled;
            }
            attempt += 1;

            let ctx = TaskContext::new(self.slot.id, attempt, self.shared.cancel.clone());
            let started = Instant::now();
            let body = &mut self.body;
            let result = panic::catch_unwind(AssertUnwindSafe(|| body(&ctx)));

            let (error, kind) = match result {
                Ok(Ok(value)) => {
                    self.record(attempt, started, AttemptOutcome::Succeeded);
                    break Outcome::Succeeded(value);
                }
                Ok(Err(err)) => {
                    let err = TaskError::new(self.slot.id, attempt, err);
                    let kind = if !err.is_cancelled() {
                        AttemptOutcome::Failed
                    } else if self.shared.timed_out.load(Ordering::SeqCst) {
                        AttemptOutcome::TimedOut
                    } else {
                        AttemptOutcome::Cancelled
                    };
                    (err, kind)
                }
                Err(payload) => {
                    let message = panic_message(&*payload);
                    let err = TaskError::new(self.slot.id, attempt, TaskPanicked(message).into());
                    (err, AttemptOutcome::Panicked)
                }
            };
            self.record(attempt, started, kind);

            if error.is_cancelled() {
                break Outcome::Cancelled;
            }

            match self.retry.next_delay(attempt, &error) {
                None => break Outcome::Failed(error),
                Some(delay) => {
                    warn!(self.logger, "Attempt failed, retrying";
                        "attempt" => attempt,
                        "delay_ms" => delay.as_millis() as u64,
                        "error" => %error);
                    if self.shared.cancel.sleep(delay) {
                        break Outcome::Cancelled;
                    }
                }
            }
        };

        self.finish(outcome);
    }

    fn record(&self, number: u32, started: Instant, outcome: AttemptOutcome) {
        self.slot.record(Attempt {
            number,
            started,
            elapsed: started.elapsed(),
            outcome,
        });
    }

    fn finish(&self, outcome: Outcome<V>) {
        // 只有 runner 会写终止状态
        if self.slot.state().is_terminal() {
            return;
        }
        let failure = match &outcome {
            Outcome::Failed(e) => Some(e.clone()),
            _ => None,
        };
        // 失败必须先于终止状态可见，否则 join 可能把它当作 Completed
        if let Some(err) = &failure {
            self.shared.record_failure(err.clone());
        }
        let state = outcome.state();
        if !self.slot.finish(outcome) {
            return;
        }

        match failure {
            Some(err) => error!(self.logger, "Subtask failed"; "error" => %err),
            None => debug!(self.logger, "Subtask finished"; "state" => ?state),
        }
        // 接收端与 Scope 同生命周期，Scope 已被丢弃时无需通知
        let _ = self.shared.done.send(self.index);
    }
}

impl<V: Clone> Drop for SubtaskRunner<V> {
    fn drop(&mut self) {
        if !self.slot.state().is_terminal() {
            self.finish(Outcome::Cancelled);
        }
    }
}

/// 一组并发子任务的协调者
///
/// Scope 绑定到一个线程池，每个 fork 的任务在其重试策略下执行。
/// 只能 join 一次；被丢弃时若尚未关闭，会取消所有未完成的子任务。
pub struct Scope<V: Clone, P: ThreadPool> {
    id: u64,
    pool: Arc<P>,
    state: ScopeState,
    completed: bool,
    slots: Vec<Arc<Slot<V>>>,
    shared: Arc<Shared>,
    done: Receiver<usize>,
    retry: RetryPolicy,
    logger: Logger,
}

impl<V, P> Scope<V, P>
where
    V: Clone + Send + 'static,
    P: ThreadPool,
{
    /// 根据给定线程池和汇总方式生成一个 Scope
    pub fn new(pool: Arc<P>, mode: JoinMode) -> Self {
        let (done_tx, done_rx) = unbounded();
        let id = NEXT_SCOPE_ID.fetch_add(1, Ordering::Relaxed);
        Scope {
            id,
            pool,
            state: ScopeState::Open,
            completed: false,
            slots: Vec::new(),
            shared: Arc::new(Shared {
                cancel: CancelToken::new(),
                timed_out: AtomicBool::new(false),
                mode,
                first_failure: Mutex::new(None),
                done: done_tx,
            }),
            done: done_rx,
            retry: RetryPolicy::default(),
            logger: discard_logger().new(o!("scope" => id)),
        }
    }

    /// 设置子任务的默认重试策略
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// 设置日志
    pub fn with_logger(mut self, logger: &Logger) -> Self {
        self.logger = logger.new(o!("scope" => self.id));
        self
    }

    /// 当前状态
    pub fn state(&self) -> ScopeState {
        self.state
    }

    /// 汇总方式
    pub fn mode(&self) -> JoinMode {
        self.shared.mode
    }

    /// 已 fork 的子任务数量
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// 是否还没有 fork 任何子任务
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// 是否已被取消
    pub fn is_cancelled(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// 取消标志的副本，可在其他线程中取消该 Scope
    pub fn cancel_token(&self) -> CancelToken {
        self.shared.cancel.clone()
    }

    /// 取消所有尚未结束的子任务
    pub fn cancel(&self) {
        if self.shared.cancel.cancel() {
            info!(self.logger, "Scope cancelled");
        }
    }

    /// 将任务提交到线程池
    ///
    /// # 错误
    /// * `ScopeClosed`: 已开始 join 或已被取消
    /// * `PoolClosed` / `QueueFull`: 线程池拒绝了任务
    pub fn fork(&mut self, task: Task<V>) -> Result<SubtaskHandle<V>> {
        if self.state != ScopeState::Open || self.is_cancelled() {
            return Err(TaskScopeError::ScopeClosed);
        }

        let (id, name, body, retry) = task.into_parts();
        let index = self.slots.len();
        let slot = Arc::new(Slot::new(id, name));
        let runner = SubtaskRunner {
            index,
            slot: slot.clone(),
            shared: self.shared.clone(),
            body,
            retry: retry.unwrap_or_else(|| self.retry.clone()),
            logger: self
                .logger
                .new(o!("task" => id.to_string(), "name" => slot.name.clone())),
        };

        // 提交失败时 runner 被丢弃，其通知被 join 当作普通唤醒忽略
        self.pool.spawn(move || runner.run())?;
        debug!(self.logger, "Forked subtask"; "task" => %id, "index" => index);

        self.slots.push(slot.clone());
        Ok(SubtaskHandle { index, slot })
    }

    /// 阻塞直到所有子任务结束、首个子任务失败（`ShutdownOnFailure`）或截止时间已过
    ///
    /// 首个失败与超时都会取消其余子任务。
    ///
    /// # 错误
    /// * `AlreadyJoined`: 该 Scope 已被 join 过
    pub fn join(&mut self, deadline: Option<Instant>) -> Result<JoinResult<V>> {
        if self.state != ScopeState::Open {
            return Err(TaskScopeError::AlreadyJoined);
        }
        self.state = ScopeState::Joining;

        let result = self.wait(deadline);
        self.state = ScopeState::Closed;
        self.completed = match result {
            JoinResult::Completed(_) => true,
            _ => false,
        };

        match &result {
            JoinResult::Completed(outcomes) => {
                let succeeded = outcomes.iter().filter(|o| o.is_success()).count();
                info!(self.logger, "Scope completed";
                    "subtasks" => outcomes.len(),
                    "succeeded" => succeeded);
            }
            JoinResult::Failed(err) => warn!(self.logger, "Scope failed"; "error" => %err),
            JoinResult::TimedOut => warn!(self.logger, "Scope timed out"),
        }
        Ok(result)
    }

    /// 最多等待 `timeout` 的 join，`timeout` 过大时不设截止时间
    pub fn join_timeout(&mut self, timeout: Duration) -> Result<JoinResult<V>> {
        self.join(Instant::now().checked_add(timeout))
    }

    fn wait(&self, deadline: Option<Instant>) -> JoinResult<V> {
        loop {
            if self.shared.mode == JoinMode::ShutdownOnFailure {
                if let Some(err) = self.shared.first_failure() {
                    self.cancel();
                    return JoinResult::Failed(err);
                }
            }

            if self.slots.iter().all(|slot| slot.state().is_terminal()) {
                let outcomes: Vec<_> = self
                    .slots
                    .iter()
                    .map(|slot| slot.outcome().unwrap_or(Outcome::Cancelled))
                    .collect();
                if self.shared.mode == JoinMode::ShutdownOnFailure {
                    let failed = outcomes.iter().find_map(|outcome| match outcome {
                        Outcome::Failed(err) => Some(err.clone()),
                        _ => None,
                    });
                    if let Some(err) = failed {
                        self.cancel();
                        return JoinResult::Failed(err);
                    }
                }
                return JoinResult::Completed(outcomes);
            }

            let woken = match deadline {
                Some(deadline) => self.done.recv_deadline(deadline).is_ok(),
                None => self.done.recv().is_ok(),
            };
            if !woken {
                self.shared.timed_out.store(true, Ordering::SeqCst);
                self.cancel();
                return JoinResult::TimedOut;
            }
        }
    }

    /// 子任务的结果，仅在 join 返回 `Completed` 后可用
    ///
    /// # 错误
    /// * `NotReady`: join 尚未返回，或返回的不是 `Completed`
    /// * `Task`: 子任务失败
    /// * `Cancelled`: 子任务被取消
    /// * `UnknownSubtask`: 句柄不属于该 Scope
    pub fn result(&self, handle: &SubtaskHandle<V>) -> Result<V> {
        let slot = self
            .slots
            .get(handle.index)
            .filter(|slot| Arc::ptr_eq(*slot, &handle.slot))
            .ok_or(TaskScopeError::UnknownSubtask)?;
        if self.state != ScopeState::Closed || !self.completed {
            return Err(TaskScopeError::NotReady);
        }
        slot.outcome()
            .ok_or(TaskScopeError::NotReady)?
            .into_result()
    }
}

impl<V: Clone, P: ThreadPool> Drop for Scope<V, P> {
    fn drop(&mut self) {
        if self.state != ScopeState::Closed {
            self.shared.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Task;

    fn slot() -> Slot<u32> {
        let task: Task<u32> = Task::new("slot", |_| Ok(1));
        Slot::new(task.id(), "slot".to_string())
    }

    #[test]
    fn slot_transitions() {
        let slot = slot();
        assert_eq!(slot.state(), SubtaskState::Pending);
        assert!(slot.outcome().is_none());

        assert!(slot.start());
        assert!(!slot.start());
        assert_eq!(slot.state(), SubtaskState::Running);

        assert!(slot.finish(Outcome::Succeeded(7)));
        assert_eq!(slot.state(), SubtaskState::Succeeded);

        // 终止状态不可再变
        assert!(!slot.finish(Outcome::Cancelled));
        assert_eq!(slot.state(), SubtaskState::Succeeded);
        match slot.outcome() {
            Some(Outcome::Succeeded(7)) => {}
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn pending_slot_can_be_cancelled() {
        let slot = slot();
        assert!(slot.finish(Outcome::Cancelled));
        assert!(!slot.start());
        assert_eq!(slot.state(), SubtaskState::Cancelled);
    }

    #[test]
    fn join_result_values() {
        let ok: JoinResult<u32> =
            JoinResult::Completed(vec![Outcome::Succeeded(1), Outcome::Succeeded(2)]);
        assert_eq!(ok.into_values().unwrap(), vec![1, 2]);

        let cancelled: JoinResult<u32> =
            JoinResult::Completed(vec![Outcome::Succeeded(1), Outcome::Cancelled]);
        assert!(matches!(
            cancelled.into_values(),
            Err(TaskScopeError::Cancelled)
        ));

        let timed_out: JoinResult<u32> = JoinResult::TimedOut;
        assert!(matches!(
            timed_out.into_values(),
            Err(TaskScopeError::TimedOut)
        ));
    }
}
