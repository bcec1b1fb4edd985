use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, select, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use slog::Logger;

use super::ThreadPool;
use crate::config::PoolConfig;
use crate::logging::discard_logger;
use crate::task::panic_message;
use crate::{Result, TaskScopeError};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// 队列已满时的处理方式
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// 立即返回 `QueueFull`
    Reject,
    /// 阻塞提交线程直到队列有空位
    Block,
    /// 丢弃队列中最早的任务，为新任务腾出位置
    DropOldest,
}

impl Default for OverflowPolicy {
    fn default() -> Self {
        OverflowPolicy::Block
    }
}

fn run_jobs(rx: Receiver<Job>, discard: Arc<AtomicBool>, logger: Logger) {
    debug!(logger, "Worker started");
    // 所有发送端关闭且队列为空时退出
    for job in rx.iter() {
        // 非排空关闭后进入队列的任务直接丢弃
        if discard.load(Ordering::SeqCst) {
            drop(job);
            continue;
        }
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
            error!(logger, "Job panicked: {}", panic_message(&*payload));
        }
    }
    debug!(logger, "Worker stopped");
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 通过有界共享队列实现的线程池
///
/// 固定数量的工作线程从同一个队列中取任务执行。
/// 任务 panic 会被工作线程捕获并记录，工作线程继续处理后续任务。
pub struct WorkerPool {
    sender: Mutex<Option<Sender<Job>>>,
    // 用于丢弃最早的任务和关闭时清空队列
    receiver: Receiver<Job>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    // 关闭时丢弃发送端，唤醒阻塞在满队列上的提交者
    close_signal: Mutex<Option<Sender<()>>>,
    closing: Receiver<()>,
    closed: AtomicBool,
    discard: Arc<AtomicBool>,
    overflow: OverflowPolicy,
    size: usize,
    logger: Logger,
}

impl WorkerPool {
    /// 根据配置创建线程池
    pub fn with_config(config: &PoolConfig, logger: &Logger) -> Result<Self> {
        config.validate()?;

        let (s, r) = bounded(config.queue_capacity);
        let logger = logger.new(o!("pool" => config.thread_name.clone()));
        let (close_signal, closing) = bounded(0);
        let discard = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(config.workers);
        for i in 0..config.workers {
            let task_receiver = r.clone();
            let discard = discard.clone();
            let worker_logger = logger.new(o!("worker" => i));
            let handle = thread::Builder::new()
                .name(format!("{}-{}", config.thread_name, i))
                .spawn(move || run_jobs(task_receiver, discard, worker_logger))?;
            workers.push(handle);
        }

        info!(logger, "Worker pool started";
            "workers" => config.workers,
            "queue_capacity" => config.queue_capacity,
            "overflow" => ?config.overflow);

        Ok(WorkerPool {
            sender: Mutex::new(Some(s)),
            receiver: r,
            workers: Mutex::new(workers),
            close_signal: Mutex::new(Some(close_signal)),
            closing,
            closed: AtomicBool::new(false),
            discard,
            overflow: config.overflow,
            size: config.workers,
            logger,
        })
    }

    /// 工作线程数量
    pub fn workers(&self) -> usize {
        self.size
    }

    /// 队列中等待执行的任务数量
    pub fn queued(&self) -> usize {
        self.receiver.len()
    }

    /// 溢出策略
    pub fn overflow(&self) -> OverflowPolicy {
        self.overflow
    }

    fn sender(&self) -> Result<Sender<Job>> {
        if self.is_closed() {
            return Err(TaskScopeError::PoolClosed);
        }
        lock(&self.sender)
            .as_ref()
            .cloned()
            .ok_or(TaskScopeError::PoolClosed)
    }

    fn close(&self) -> Option<Sender<Job>> {
        self.closed.store(true, Ordering::SeqCst);
        drop(lock(&self.close_signal).take());
        lock(&self.sender).take()
    }

    // 清空队列，被丢弃的任务会让对应的句柄观察到取消
    fn purge(&self) -> usize {
        let mut cancelled = 0;
        while let Ok(job) = self.receiver.try_recv() {
            drop(job);
            cancelled += 1;
        }
        cancelled
    }
}

impl ThreadPool for WorkerPool {
    fn new(threads: u32) -> Result<Self> {
        let config = PoolConfig {
            workers: threads as usize,
            ..PoolConfig::default()
        };
        WorkerPool::with_config(&config, &discard_logger())
    }

    fn spawn<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let task_sender = self.sender()?;
        let mut job: Job = Box::new(job);

        match self.overflow {
            OverflowPolicy::Block => {
                let sent = select! {
                    send(task_sender, job) -> res => res.is_ok(),
                    recv(self.closing) -> _ => false,
                };
                if !sent {
                    return Err(TaskScopeError::PoolClosed);
                }
            }
            OverflowPolicy::Reject => match task_sender.try_send(job) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    debug!(self.logger, "Queue full, job rejected");
                    return Err(TaskScopeError::QueueFull);
                }
                Err(TrySendError::Disconnected(_)) => return Err(TaskScopeError::PoolClosed),
            },
            OverflowPolicy::DropOldest => loop {
                if self.is_closed() {
                    return Err(TaskScopeError::PoolClosed);
                }
                match task_sender.try_send(job) {
                    Ok(()) => break,
                    Err(TrySendError::Full(rejected)) => {
                        job = rejected;
                        if let Ok(oldest) = self.receiver.try_recv() {
                            drop(oldest);
                            warn!(self.logger, "Queue full, dropped oldest job");
                        }
                    }
                    Err(TrySendError::Disconnected(_)) => return Err(TaskScopeError::PoolClosed),
                }
            },
        }

        // 与非排空关闭并发入队的任务不会被执行
        if self.discard.load(Ordering::SeqCst) {
            self.purge();
            return Err(TaskScopeError::PoolClosed);
        }
        Ok(())
    }

    fn shutdown(&self, drain: bool) {
        let already_closed = self.is_closed();
        if !drain {
            self.discard.store(true, Ordering::SeqCst);
        }
        let task_sender = self.close();

        if !drain {
            let cancelled = self.purge();
            if cancelled > 0 {
                info!(self.logger, "Cancelled queued jobs"; "count" => cancelled);
            }
        }
        drop(task_sender);

        if drain {
            let workers = mem::take(&mut *lock(&self.workers));
            let current = thread::current().id();
            for worker in workers {
                // 在工作线程内部关闭时不能等待自己
                if worker.thread().id() == current {
                    continue;
                }
                if worker.join().is_err() {
                    error!(self.logger, "Worker thread exited abnormally");
                }
            }
        }

        if !already_closed {
            info!(self.logger, "Worker pool shut down"; "drain" => drain);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // 不等待工作线程，它们在队列清空后自行退出
        drop(self.close());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    fn pool(workers: usize, capacity: usize, overflow: OverflowPolicy) -> WorkerPool {
        let config = PoolConfig {
            workers,
            queue_capacity: capacity,
            overflow,
            ..PoolConfig::default()
        };
        WorkerPool::with_config(&config, &discard_logger()).unwrap()
    }

    #[test]
    fn zero_workers_is_invalid() {
        assert!(matches!(
            WorkerPool::new(0),
            Err(TaskScopeError::InvalidConfig(_))
        ));
    }

    #[test]
    fn queued_counts_waiting_jobs() {
        let pool = pool(1, 4, OverflowPolicy::Reject);
        let (started_tx, started_rx) = mpsc::channel();
        let (gate_tx, gate_rx) = mpsc::channel::<()>();

        pool.spawn(move || {
            started_tx.send(()).unwrap();
            gate_rx.recv().unwrap();
        })
        .unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        pool.spawn(|| {}).unwrap();
        pool.spawn(|| {}).unwrap();
        assert_eq!(pool.queued(), 2);
        assert_eq!(pool.workers(), 1);

        gate_tx.send(()).unwrap();
        pool.shutdown(true);
        assert_eq!(pool.queued(), 0);
    }
}
