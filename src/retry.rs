//! 重试策略
//!
//! 第 `n` 次尝试失败后的等待时长为 `base × 2^(n-1)`，上限为 `max_delay`，
//! 之后再按 [`Jitter`] 施加随机扰动。随机数由 `(seed, attempt)` 派生，
//! 因此给定输入时 [`RetryPolicy::next_delay`] 的结果是确定的。

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::task::TaskError;

/// 随机扰动策略
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Jitter {
    /// 不扰动
    None,
    /// 在 [0, delay] 内均匀取值
    Full,
    /// delay/2 + [0, delay/2] 内均匀取值
    Equal,
}

impl Default for Jitter {
    fn default() -> Self {
        Jitter::None
    }
}

impl Jitter {
    fn apply(self, delay: Duration, seed: u64, attempt: u32) -> Duration {
        let ms = delay.as_millis() as u64;
        if ms == 0 {
            return delay;
        }
        let mut rng = StdRng::seed_from_u64(mix(seed, attempt));
        match self {
            Jitter::None => delay,
            Jitter::Full => Duration::from_millis(rng.gen_range(0..=ms)),
            Jitter::Equal => {
                let half = ms / 2;
                Duration::from_millis(half + rng.gen_range(0..=half))
            }
        }
    }
}

fn mix(seed: u64, attempt: u32) -> u64 {
    seed ^ u64::from(attempt).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

type Retryable = Arc<dyn Fn(&TaskError) -> bool + Send + Sync>;

/// 决定任务失败后是否重试以及等待多久
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base: Duration,
    max_delay: Duration,
    jitter: Jitter,
    seed: u64,
    retryable: Retryable,
}

impl Default for RetryPolicy {
    /// 只尝试一次，不重试
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 1,
            base: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            jitter: Jitter::None,
            seed: 0,
            retryable: Arc::new(default_retryable),
        }
    }
}

/// 默认的可重试判定：致命错误、panic 与取消均不重试
pub fn default_retryable(err: &TaskError) -> bool {
    !(err.is_fatal() || err.is_panic() || err.is_cancelled())
}

impl RetryPolicy {
    /// 最多尝试 `max_attempts` 次，首次重试前等待 `base`
    ///
    /// `max_attempts` 小于 1 时按 1 处理。
    pub fn new(max_attempts: u32, base: Duration) -> Self {
        RetryPolicy {
            max_attempts: max_attempts.max(1),
            base,
            ..RetryPolicy::default()
        }
    }

    /// 只尝试一次
    pub fn once() -> Self {
        RetryPolicy::default()
    }

    /// 设置等待时长上限
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// 设置随机扰动及其种子
    pub fn with_jitter(mut self, jitter: Jitter, seed: u64) -> Self {
        self.jitter = jitter;
        self.seed = seed;
        self
    }

    /// 替换可重试判定
    pub fn retry_if<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&TaskError) -> bool + Send + Sync + 'static,
    {
        self.retryable = Arc::new(predicate);
        self
    }

    /// 最大尝试次数
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// 错误是否可重试
    pub fn is_retryable(&self, err: &TaskError) -> bool {
        (self.retryable)(err)
    }

    /// 第 `attempt` 次失败后的基础等待时长（不含扰动）
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1);
        2u32.checked_pow(exp)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// 第 `attempt` 次尝试以 `err` 失败后，下一次尝试前应等待的时长
    ///
    /// 已达到最大尝试次数或错误不可重试时返回 `None`。
    pub fn next_delay(&self, attempt: u32, err: &TaskError) -> Option<Duration> {
        if attempt >= self.max_attempts || !self.is_retryable(err) {
            return None;
        }
        Some(self.jitter.apply(self.backoff(attempt), self.seed, attempt))
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base", &self.base)
            .field("max_delay", &self.max_delay)
            .field("jitter", &self.jitter)
            .field("seed", &self.seed)
            .finish()
    }
}
