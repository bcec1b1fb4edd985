//! 线程池与重试策略的配置，可从 JSON 文件加载

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::time::Duration;

use crate::retry::{Jitter, RetryPolicy};
use crate::thread_pool::OverflowPolicy;
use crate::{Result, TaskScopeError};

/// 线程池配置
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    /// 工作线程数量，默认为 CPU 核数
    pub workers: usize,
    /// 有界队列容量
    pub queue_capacity: usize,
    /// 队列已满时的处理方式
    pub overflow: OverflowPolicy,
    /// 工作线程名前缀
    pub thread_name: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            workers: num_cpus::get(),
            queue_capacity: 1024,
            overflow: OverflowPolicy::default(),
            thread_name: "taskscope-worker".to_string(),
        }
    }
}

impl PoolConfig {
    /// 检查配置是否合法
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(TaskScopeError::InvalidConfig(
                "workers must be positive".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(TaskScopeError::InvalidConfig(
                "queue_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// 重试配置
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// 最大尝试次数（含首次）
    pub max_attempts: u32,
    /// 首次重试前的等待毫秒数
    pub base_delay_ms: u64,
    /// 等待毫秒数上限
    pub max_delay_ms: u64,
    /// 随机扰动
    pub jitter: Jitter,
    /// 随机扰动种子
    pub seed: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: 1,
            base_delay_ms: 100,
            max_delay_ms: 30_000,
            jitter: Jitter::None,
            seed: 0,
        }
    }
}

impl RetryConfig {
    /// 检查配置是否合法
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(TaskScopeError::InvalidConfig(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// 生成对应的重试策略，使用默认的可重试判定
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, Duration::from_millis(self.base_delay_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
            .with_jitter(self.jitter, self.seed)
    }
}

/// 完整配置
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// 线程池配置
    pub pool: PoolConfig,
    /// 重试配置
    pub retry: RetryConfig,
}

impl RunnerConfig {
    /// 从给定路径的 JSON 文件中加载配置，缺省字段取默认值
    pub fn from_path(path: impl AsRef<Path>) -> Result<RunnerConfig> {
        let reader = BufReader::new(File::open(path)?);
        let config: RunnerConfig = serde_json::from_reader(reader)?;
        config.validate()?;
        Ok(config)
    }

    /// 检查配置是否合法
    pub fn validate(&self) -> Result<()> {
        self.pool.validate()?;
        self.retry.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = RunnerConfig::default();
        assert!(config.pool.workers >= 1);
        assert_eq!(config.pool.overflow, OverflowPolicy::Block);
        assert_eq!(config.retry.max_attempts, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_json_uses_defaults() {
        let config: RunnerConfig =
            serde_json::from_str(r#"{"pool": {"workers": 3, "overflow": "drop_oldest"}}"#).unwrap();
        assert_eq!(config.pool.workers, 3);
        assert_eq!(config.pool.overflow, OverflowPolicy::DropOldest);
        assert_eq!(config.pool.queue_capacity, 1024);
        assert_eq!(config.retry, RetryConfig::default());
    }

    #[test]
    fn retry_config_to_policy() {
        let config = RetryConfig {
            max_attempts: 4,
            base_delay_ms: 10,
            max_delay_ms: 25,
            ..RetryConfig::default()
        };
        let policy = config.to_policy();
        assert_eq!(policy.max_attempts(), 4);
        assert_eq!(policy.backoff(1), Duration::from_millis(10));
        assert_eq!(policy.backoff(2), Duration::from_millis(20));
        assert_eq!(policy.backoff(3), Duration::from_millis(25));
    }

    #[test]
    fn rejects_invalid_values() {
        let mut config = RunnerConfig::default();
        config.pool.queue_capacity = 0;
        assert!(matches!(
            config.validate(),
            Err(TaskScopeError::InvalidConfig(_))
        ));

        let mut config = RunnerConfig::default();
        config.retry.max_attempts = 0;
        assert!(matches!(
            config.validate(),
            Err(TaskScopeError::InvalidConfig(_))
        ));
    }
}
