use async_trait::async_trait;
use thiserror::Error;

use crate::models::OutgoingMail;

/// 邮件传输层错误
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// 远端返回的否定应答
    #[error("远端拒绝 ({code}): {message}")]
    Reply { code: u16, message: String },

    #[error("网络错误: {0}")]
    Io(String),

    #[error("协议错误: {0}")]
    Protocol(String),

    #[error("TLS错误: {0}")]
    Tls(String),

    /// 收件地址无法被传输层接受
    #[error("无效的收件地址: {0}")]
    InvalidRecipient(String),
}

impl TransportError {
    /// 收件地址被拒绝（邮箱不可用类错误）：550 / 551 / 553
    pub fn is_mailbox_unavailable(&self) -> bool {
        matches!(self, Self::Reply { code, .. } if matches!(code, 550 | 551 | 553))
    }

    /// 重试也不会成功的错误
    pub fn is_permanent(&self) -> bool {
        self.is_mailbox_unavailable() || matches!(self, Self::InvalidRecipient(_))
    }
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// 用户名/密码凭证
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportCredentials {
    pub username: String,
    pub password: String,
}

/// 邮件传输端点：每次投递尝试打开一个新会话
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn connect(&self) -> TransportResult<Box<dyn MailSession>>;
}

/// 一个已连接的传输会话
#[async_trait]
pub trait MailSession: Send {
    async fn authenticate(&mut self, credentials: &TransportCredentials) -> TransportResult<()>;

    async fn send(&mut self, mail: &OutgoingMail) -> TransportResult<()>;

    /// 优雅关闭会话
    async fn close(&mut self) -> TransportResult<()>;
}
