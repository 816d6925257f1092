use thiserror::Error;

/// 分发系统错误类型定义
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("消息队列连接错误: {0}")]
    Connection(String),

    #[error("反序列化错误: {0}")]
    Deserialization(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("无效的邮件任务: {0}")]
    InvalidEnvelope(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("邮件传输错误: {0}")]
    Transport(String),

    /// 程序不变量被破坏（重复确认、未知投递标签、重复启动），不可恢复
    #[error("不变量被破坏: {0}")]
    InvariantViolation(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl DispatchError {
    /// 是否属于环境类错误（可在观察到它的层内被吸收）
    pub fn is_environmental(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Transport(_))
    }

    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, Self::InvariantViolation(_))
    }
}

/// 统一的Result类型
pub type Result<T> = std::result::Result<T, DispatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(DispatchError::Connection("down".into()).is_environmental());
        assert!(DispatchError::Transport("reset".into()).is_environmental());
        assert!(!DispatchError::Deserialization("bad".into()).is_environmental());

        let violation = DispatchError::InvariantViolation("tag 7 acked twice".into());
        assert!(violation.is_invariant_violation());
        assert!(!violation.is_environmental());
    }

    #[test]
    fn test_error_display() {
        let err = DispatchError::Connection("broker unreachable".into());
        assert_eq!(err.to_string(), "消息队列连接错误: broker unreachable");
    }
}
