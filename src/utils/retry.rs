use std::time::Duration;

/// 重试退避策略
#[derive(Debug, Clone)]
pub enum BackoffStrategy {
    /// 固定延迟
    Fixed(Duration),
    /// 指数退避，base * 2^attempt，封顶 max_delay
    Exponential {
        base: Duration,
        max_delay: Duration,
    },
}

impl BackoffStrategy {
    /// 第 attempt 次重试前的等待时间（attempt 从 1 开始）
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self {
            BackoffStrategy::Fixed(delay) => *delay,
            BackoffStrategy::Exponential { base, max_delay } => {
                // 指数封顶，避免溢出
                let factor = 2u32.saturating_pow(attempt.min(16));
                let delay = base.saturating_mul(factor);
                std::cmp::min(delay, *max_delay)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff() {
        let strategy = BackoffStrategy::Exponential {
            base: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        };

        assert_eq!(strategy.delay_for(1), Duration::from_secs(2));
        assert_eq!(strategy.delay_for(2), Duration::from_secs(4));
        assert_eq!(strategy.delay_for(3), Duration::from_secs(8));
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let strategy = BackoffStrategy::Exponential {
            base: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        };

        assert_eq!(strategy.delay_for(10), Duration::from_secs(60));
        // 超大尝试次数也不会溢出
        assert_eq!(strategy.delay_for(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_fixed_backoff() {
        let strategy = BackoffStrategy::Fixed(Duration::from_millis(500));
        assert_eq!(strategy.delay_for(1), Duration::from_millis(500));
        assert_eq!(strategy.delay_for(7), Duration::from_millis(500));
    }
}
