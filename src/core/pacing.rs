//! 步间节奏：限流时指数退避，连续成功后逐步回落

use std::time::Duration;

/// 退避上限为起点的倍数
const MAX_BACKOFF_FACTOR: u32 = 8;
/// 基础间隔为 0 时的退避起点
const MIN_BACKOFF: Duration = Duration::from_millis(500);
/// 连续成功多少次后开始回落
const SUCCESSES_BEFORE_DECAY: u32 = 3;

#[derive(Debug, Clone)]
pub struct StepPacer {
    base: Duration,
    current: Duration,
    consecutive_successes: u32,
}

impl StepPacer {
    pub fn new(base: Duration) -> Self {
        Self {
            base,
            current: base,
            consecutive_successes: 0,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    /// 决策方被限流：间隔翻倍，至少 500ms，不超过 8 倍起点
    pub fn on_rate_limited(&mut self) -> Duration {
        self.consecutive_successes = 0;
        let floor = self.base.max(MIN_BACKOFF);
        let max = floor.saturating_mul(MAX_BACKOFF_FACTOR);
        self.current = self.current.saturating_mul(2).max(floor).min(max);
        tracing::warn!(
            delay_ms = self.current.as_millis() as u64,
            "rate limited, increasing step delay"
        );
        self.current
    }

    /// 决策成功：连续 3 次后每次缩短 20%（不低于基础间隔）
    pub fn on_success(&mut self) {
        self.consecutive_successes += 1;
        if self.consecutive_successes >= SUCCESSES_BEFORE_DECAY && self.current > self.base {
            self.current = self.current.mul_f64(0.8).max(self.base);
            tracing::info!(
                delay_ms = self.current.as_millis() as u64,
                successes = self.consecutive_successes,
                "decreased step delay"
            );
        }
    }

    /// 第一步之前不等待
    pub async fn wait_before(&self, step: usize) {
        if step > 1 && !self.current.is_zero() {
            tracing::debug!(delay_ms = self.current.as_millis() as u64, "waiting before next step");
            tokio::time::sleep(self.current).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut pacer = StepPacer::new(Duration::from_secs(1));
        assert_eq!(pacer.on_rate_limited(), Duration::from_secs(2));
        assert_eq!(pacer.on_rate_limited(), Duration::from_secs(4));
        assert_eq!(pacer.on_rate_limited(), Duration::from_secs(8));
        assert_eq!(pacer.on_rate_limited(), Duration::from_secs(8));
    }

    #[test]
    fn test_decay_after_three_successes() {
        let mut pacer = StepPacer::new(Duration::from_secs(1));
        pacer.on_rate_limited();
        pacer.on_rate_limited();
        pacer.on_success();
        pacer.on_success();
        assert_eq!(pacer.current(), Duration::from_secs(4));
        pacer.on_success();
        assert_eq!(pacer.current(), Duration::from_millis(3200));
        for _ in 0..20 {
            pacer.on_success();
        }
        assert_eq!(pacer.current(), Duration::from_secs(1));
    }

    #[test]
    fn test_zero_base_still_backs_off() {
        let mut pacer = StepPacer::new(Duration::ZERO);
        assert!(pacer.current().is_zero());
        assert_eq!(pacer.on_rate_limited(), Duration::from_millis(500));
        assert_eq!(pacer.on_rate_limited(), Duration::from_secs(1));
        for _ in 0..10 {
            pacer.on_rate_limited();
        }
        assert_eq!(pacer.current(), Duration::from_secs(4));
    }

    #[test]
    fn test_huge_base_does_not_overflow() {
        let mut pacer = StepPacer::new(Duration::MAX);
        assert_eq!(pacer.on_rate_limited(), Duration::MAX);
        pacer.on_success();
        assert_eq!(pacer.current(), Duration::MAX);
    }
}
