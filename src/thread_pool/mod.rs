//! 该模块提供各类线程池

use std::panic::{self, AssertUnwindSafe};

use crossbeam_channel::bounded;

use crate::Result;

/// 线程池抽象接口
///
/// 该trait定义了线程池的基本行为规范，
/// 不同的具体实现可以提供各自的线程调度策略
pub trait ThreadPool {
    /// 创建新的线程池实例
    ///
    /// # 参数
    /// * `threads`: 线程池中工作线程数量
    ///
    /// # 注意
    /// 1. 实现应立即创建指定数量的工作线程
    /// 2. `threads` 为 0 时返回 `TaskScopeError::InvalidConfig`
    fn new(threads: u32) -> Result<Self>
    where
        Self: Sized;

    /// 向线程池提交任务，不关心其结果
    ///
    /// # 错误
    /// * `PoolClosed`: 线程池已关闭
    /// * `QueueFull`: 有界队列已满且溢出策略为拒绝
    ///
    /// # 保证
    /// 即使任务执行时panic也不会影响线程池运行，panic 会被记录到日志
    fn spawn<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static;

    /// 关闭线程池，此后提交的任务都会失败
    ///
    /// `drain` 为真时等待队列中及正在执行的任务完成，否则直接丢弃队列中的任务。
    /// 重复调用无副作用。
    fn shutdown(&self, drain: bool);

    /// 线程池是否已关闭
    fn is_closed(&self) -> bool;

    /// 提交任务并返回可获取其结果的句柄
    ///
    /// 任务体中的 panic 被捕获并交给句柄，任务被丢弃时句柄返回 `Cancelled`。
    fn submit<F, T>(&self, job: F) -> Result<JobHandle<T>>
    where
        Self: Sized,
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = bounded(1);
        self.spawn(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(job));
            // 句柄可能已被丢弃
            let _ = tx.send(result);
        })?;
        Ok(JobHandle::new(rx))
    }
}

mod handle;
mod rayon;
mod worker_pool;

pub use self::handle::JobHandle;
pub use self::rayon::RayonThreadPool;
pub use self::worker_pool::{OverflowPolicy, WorkerPool};
