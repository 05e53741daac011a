//! 完成度感知的错误退避
//!
//! 倍率只在拉取出错后增长，增长速度和上限由当前已出图的桌子数决定；
//! 任何一次成功拉取都把倍率重置为 1。

use std::time::Duration;

/// 一档退避参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffTier {
    /// 已出图桌子数下限（含）
    pub min_filled: usize,
    /// 每次出错的倍率增长
    pub growth: f64,
    /// 倍率上限
    pub cap: f64,
}

/// 分档表，按 min_filled 从高到低排列
pub const BACKOFF_TIERS: [BackoffTier; 4] = [
    BackoffTier { min_filled: 8, growth: 2.0, cap: 16.0 },
    BackoffTier { min_filled: 5, growth: 1.5, cap: 8.0 },
    BackoffTier { min_filled: 3, growth: 1.2, cap: 4.0 },
    BackoffTier { min_filled: 0, growth: 1.1, cap: 2.0 },
];

/// 根据已出图数量选择档位
pub fn tier_for(filled: usize) -> &'static BackoffTier {
    BACKOFF_TIERS
        .iter()
        .find(|tier| filled >= tier.min_filled)
        .unwrap_or(&BACKOFF_TIERS[BACKOFF_TIERS.len() - 1])
}

/// 退避状态
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    multiplier: f64,
}

impl Backoff {
    pub fn new() -> Self {
        Self { multiplier: 1.0 }
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    /// 成功拉取：回到基础间隔
    pub fn reset(&mut self) {
        self.multiplier = 1.0;
    }

    /// 拉取出错：按当前档位增长并截断到该档上限
    pub fn on_error(&mut self, filled: usize) -> f64 {
        let tier = tier_for(filled);
        self.multiplier = (self.multiplier * tier.growth).clamp(1.0, tier.cap);
        self.multiplier
    }

    /// 下一次间隔 = base × multiplier（取整到毫秒）
    pub fn interval(&self, base: Duration) -> Duration {
        let millis = (base.as_millis() as f64 * self.multiplier).round();
        Duration::from_millis(millis as u64)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: Duration = Duration::from_millis(5000);

    #[test]
    fn test_tier_selection() {
        assert_eq!(tier_for(0).cap, 2.0);
        assert_eq!(tier_for(2).cap, 2.0);
        assert_eq!(tier_for(3).cap, 4.0);
        assert_eq!(tier_for(4).growth, 1.2);
        assert_eq!(tier_for(5).cap, 8.0);
        assert_eq!(tier_for(7).growth, 1.5);
        assert_eq!(tier_for(8).cap, 16.0);
        assert_eq!(tier_for(40).growth, 2.0);
    }

    #[test]
    fn test_single_error_low_tier() {
        let mut backoff = Backoff::new();
        backoff.on_error(2);
        assert_eq!(backoff.interval(BASE), Duration::from_millis(5500));

        backoff.reset();
        assert_eq!(backoff.interval(BASE), BASE);
    }

    #[test]
    fn test_multiplier_never_exceeds_cap() {
        let mut backoff = Backoff::new();
        for _ in 0..50 {
            backoff.on_error(8);
            assert!(backoff.multiplier() <= 16.0);
        }
        assert_eq!(backoff.multiplier(), 16.0);
        assert_eq!(backoff.interval(BASE), Duration::from_millis(80_000));
    }

    #[test]
    fn test_lower_tier_clamps_previous_growth() {
        let mut backoff = Backoff::new();
        for _ in 0..10 {
            backoff.on_error(9);
        }
        assert_eq!(backoff.multiplier(), 16.0);

        // 档位下降后，倍率被截断到新档上限
        backoff.on_error(1);
        assert_eq!(backoff.multiplier(), 2.0);
    }

    #[test]
    fn test_growth_sequence_mid_tier() {
        let mut backoff = Backoff::new();
        assert_eq!(backoff.on_error(6), 1.5);
        assert_eq!(backoff.on_error(6), 2.25);
        assert_eq!(backoff.on_error(6), 3.375);
        assert_eq!(backoff.on_error(6), 5.0625);
        assert_eq!(backoff.on_error(6), 7.59375);
        assert_eq!(backoff.on_error(6), 8.0);
    }
}
