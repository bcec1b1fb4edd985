use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};

use crate::task::panic_message;
use crate::{Result, TaskScopeError};

/// 通过 [`ThreadPool::submit`](super::ThreadPool::submit) 提交的任务的结果句柄
#[derive(Debug)]
pub struct JobHandle<T> {
    rx: Receiver<thread::Result<T>>,
}

impl<T> JobHandle<T> {
    pub(crate) fn new(rx: Receiver<thread::Result<T>>) -> Self {
        JobHandle { rx }
    }

    /// 阻塞直到任务结束
    ///
    /// # 错误
    /// * `JobPanicked`: 任务体 panic
    /// * `Cancelled`: 任务在执行前被线程池丢弃
    pub fn join(self) -> Result<T> {
        match self.rx.recv() {
            Ok(result) => unpack(result),
            Err(_) => Err(TaskScopeError::Cancelled),
        }
    }

    /// 最多等待到 `deadline`，超时返回 `TimedOut`
    pub fn join_deadline(&self, deadline: Instant) -> Result<T> {
        match self.rx.recv_deadline(deadline) {
            Ok(result) => unpack(result),
            Err(RecvTimeoutError::Timeout) => Err(TaskScopeError::TimedOut),
            Err(RecvTimeoutError::Disconnected) => Err(TaskScopeError::Cancelled),
        }
    }

    /// 最多等待 `timeout`，`timeout` 过大时一直等待
    pub fn join_timeout(&self, timeout: Duration) -> Result<T> {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.join_deadline(deadline),
            None => match self.rx.recv() {
                Ok(result) => unpack(result),
                Err(_) => Err(TaskScopeError::Cancelled),
            },
        }
    }

    /// 非阻塞地查询结果，任务未结束时返回 `None`
    pub fn try_join(&self) -> Option<Result<T>> {
        match self.rx.try_recv() {
            Ok(result) => Some(unpack(result)),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(TaskScopeError::Cancelled)),
        }
    }
}

fn unpack<T>(result: thread::Result<T>) -> Result<T> {
    result.map_err(|payload| TaskScopeError::JobPanicked(panic_message(&*payload)))
}
