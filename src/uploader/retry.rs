// 重试策略
//
// 错误分类：
// - 网络错误（请求没有到达服务器）：立即重试
// - 服务器返回非成功状态码：指数退避，延迟 = 2^已尝试次数 个时间单位
// - 重试次数耗尽：放弃
//
// 不加随机抖动，退避序列是确定的

use crate::api::ApiError;
use std::time::Duration;

/// 默认最大尝试次数
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// 重试决策
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// 等待指定时间后重试
    RetryAfter(Duration),
    /// 放弃
    GiveUp,
}

/// 重试策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 最大尝试次数（包含第一次）
    max_attempts: u32,
    /// 时间单位
    base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// 计算指数退避延迟
    ///
    /// # 延迟序列（时间单位 = 1s）
    /// - attempts_made=1: 2s
    /// - attempts_made=2: 4s
    /// - attempts_made=3: 8s
    pub fn backoff_delay(&self, attempts_made: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempts_made);
        self.base_delay.saturating_mul(factor)
    }

    /// 根据已尝试次数和本次错误决定是否重试
    pub fn decide(&self, attempts_made: u32, error: &ApiError) -> RetryDecision {
        if attempts_made >= self.max_attempts {
            return RetryDecision::GiveUp;
        }
        if error.is_network() {
            RetryDecision::RetryAfter(Duration::ZERO)
        } else {
            RetryDecision::RetryAfter(self.backoff_delay(attempts_made))
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, Duration::from_secs(1))
    }
}
