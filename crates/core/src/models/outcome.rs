use std::fmt;

/// 一次投递尝试的结果分类
///
/// 确认/拒绝的决策由该分类驱动，而不是简单的成功/失败布尔值。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Delivered,
    /// 可能是暂时性的失败（网络抖动、远端临时拒绝），消息应重新入队
    TransientFailure(String),
    /// 永远不会成功的失败（邮箱不存在），消息应丢弃
    PermanentFailure(String),
    /// 在限定时间内未完成
    Timeout,
}

impl AttemptOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::TransientFailure(_) => "transient_failure",
            Self::PermanentFailure(_) => "permanent_failure",
            Self::Timeout => "timeout",
        }
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered)
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientFailure(_) | Self::Timeout)
    }
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Delivered => write!(f, "delivered"),
            Self::TransientFailure(reason) => write!(f, "transient failure: {reason}"),
            Self::PermanentFailure(reason) => write!(f, "permanent failure: {reason}"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}
