use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};

use slog::Logger;

use super::ThreadPool;
use crate::logging::discard_logger;
use crate::task::panic_message;
use crate::{Result, TaskScopeError};

#[derive(Default)]
struct InFlight {
    count: Mutex<usize>,
    cvar: Condvar,
}

impl InFlight {
    fn enter(&self) {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner) += 1;
    }

    fn leave(&self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        *count -= 1;
        if *count == 0 {
            self.cvar.notify_all();
        }
    }

    fn wait_idle(&self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        while *count > 0 {
            count = self
                .cvar
                .wait(count)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

// 任务执行完毕或被丢弃时离开
struct InFlightGuard(Arc<InFlight>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.leave();
    }
}

/// rayon::ThreadPool的包装
///
/// rayon 的队列是无界的，因此不会返回 `QueueFull`。
pub struct RayonThreadPool {
    pool: ::rayon::ThreadPool,
    closed: AtomicBool,
    discard: Arc<AtomicBool>,
    in_flight: Arc<InFlight>,
    logger: Logger,
}

impl RayonThreadPool {
    /// 创建带日志的 rayon 线程池
    pub fn with_logger(threads: u32, logger: &Logger) -> Result<Self> {
        if threads == 0 {
            return Err(TaskScopeError::InvalidConfig(
                "Argument 'threads' must be positive".to_string(),
            ));
        }

        let logger = logger.new(o!("pool" => "rayon"));
        let panic_logger = logger.clone();
        let pool = ::rayon::ThreadPoolBuilder::new()
            .num_threads(threads as usize)
            .thread_name(|i| format!("rayon-worker-{}", i))
            .panic_handler(move |payload| {
                error!(panic_logger, "Job panicked: {}", panic_message(&*payload));
            })
            .build()?;

        Ok(RayonThreadPool {
            pool,
            closed: AtomicBool::new(false),
            discard: Arc::new(AtomicBool::new(false)),
            in_flight: Arc::new(InFlight::default()),
            logger,
        })
    }
}

impl ThreadPool for RayonThreadPool {
    fn new(threads: u32) -> Result<Self> {
        RayonThreadPool::with_logger(threads, &discard_logger())
    }

    fn spawn<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        // 先登记再检查，排空关闭不会漏掉正在提交的任务
        self.in_flight.enter();
        let guard = InFlightGuard(self.in_flight.clone());
        if self.is_closed() {
            return Err(TaskScopeError::PoolClosed);
        }
        let discard = self.discard.clone();
        self.pool.spawn(move || {
            let _guard = guard;
            // 非排空关闭后，尚未开始的任务直接丢弃
            if !discard.load(Ordering::SeqCst) {
                job();
            }
        });
        Ok(())
    }

    fn shutdown(&self, drain: bool) {
        let already_closed = self.closed.swap(true, Ordering::SeqCst);
        if drain {
            self.in_flight.wait_idle();
        } else {
            self.discard.store(true, Ordering::SeqCst);
        }
        if !already_closed {
            info!(self.logger, "Rayon pool shut down"; "drain" => drain);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
