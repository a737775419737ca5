use std::time::Duration;

use taskgate_core::config::RetryConfig;

/// 重试退避策略
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 基础重试间隔
    pub base_delay: Duration,
    /// 最大重试间隔
    pub max_delay: Duration,
    /// 指数退避倍数
    pub backoff_multiplier: f64,
    /// 重试间隔的随机抖动范围（0.0-1.0）
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            backoff_multiplier: config.backoff_multiplier,
            jitter_factor: config.jitter_factor,
        }
    }

    /// 第 `retry_count` 次失败后的等待时间: base * multiplier^retry_count，不超过上限
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let base = self.base_delay.as_millis() as f64;
        let max = (self.max_delay.as_millis() as f64).max(base);
        let exponent = retry_count.min(i32::MAX as u32) as i32;

        // 计算指数退避间隔并限制最大间隔
        let capped = (base * self.backoff_multiplier.max(1.0).powi(exponent)).min(max);

        if self.jitter_factor <= 0.0 {
            return millis(capped);
        }

        // 添加随机抖动以避免雷群效应
        let jitter = capped * self.jitter_factor * (rand::random::<f64>() - 0.5) * 2.0;
        millis((capped + jitter).clamp(base, max))
    }
}

fn millis(value: f64) -> Duration {
    Duration::from_millis(value.round() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(base_ms: u64, max_ms: u64) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(max_ms),
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
        }
    }

    #[test]
    fn test_exponential_backoff() {
        let policy = policy(100, 10_000);
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(5), Duration::from_millis(3200));
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = policy(1000, 30_000);
        assert_eq!(policy.delay_for(10), Duration::from_millis(30_000));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_millis(30_000));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let mut policy = policy(100, 1000);
        policy.jitter_factor = 0.5;
        for retry in 0..6 {
            let delay = policy.delay_for(retry);
            assert!(delay >= Duration::from_millis(100), "{delay:?}");
            assert!(delay <= Duration::from_millis(1000), "{delay:?}");
        }
    }

    #[test]
    fn test_from_config() {
        let config = RetryConfig::default();
        let policy = RetryPolicy::from_config(&config);
        assert_eq!(policy.base_delay, Duration::from_millis(1000));
        assert_eq!(policy.max_delay, Duration::from_millis(30_000));
        assert_eq!(policy.delay_for(1), Duration::from_millis(2000));
    }
}
