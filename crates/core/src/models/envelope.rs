use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{DispatchError, Result};

/// 一封待发送邮件的任务信封
///
/// 创建后不可变。`body` 为预先渲染好的 HTML，对分发核心是不透明的；
/// `scheduled_at` 仅作记录，核心不会据此延迟投递。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    recipient: String,
    #[serde(default)]
    subject: String,
    #[serde(default)]
    body: String,
    #[serde(default)]
    sender_display_name: String,
    #[serde(default = "Utc::now")]
    scheduled_at: DateTime<Utc>,
}

impl TaskEnvelope {
    pub fn new(
        recipient: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Result<Self> {
        let recipient = recipient.into();
        validate_address(&recipient).map_err(DispatchError::InvalidEnvelope)?;

        Ok(Self {
            recipient,
            subject: subject.into(),
            body: body.into(),
            sender_display_name: String::new(),
            scheduled_at: Utc::now(),
        })
    }

    pub fn with_sender_display_name(mut self, name: impl Into<String>) -> Self {
        self.sender_display_name = name.into();
        self
    }

    pub fn with_scheduled_at(mut self, scheduled_at: DateTime<Utc>) -> Self {
        self.scheduled_at = scheduled_at;
        self
    }

    pub fn recipient(&self) -> &str {
        &self.recipient
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn sender_display_name(&self) -> &str {
        &self.sender_display_name
    }

    pub fn scheduled_at(&self) -> DateTime<Utc> {
        self.scheduled_at
    }

    /// 序列化为线上格式（UTF-8 JSON）
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| DispatchError::Serialization(format!("序列化邮件任务失败: {e}")))
    }

    /// 从线上格式反序列化
    ///
    /// 未知字段被忽略；缺少 `recipient` 或地址格式非法都视为反序列化失败。
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let envelope: Self = serde_json::from_slice(bytes)
            .map_err(|e| DispatchError::Deserialization(format!("反序列化邮件任务失败: {e}")))?;

        validate_address(&envelope.recipient).map_err(DispatchError::Deserialization)?;
        Ok(envelope)
    }
}

/// 邮件地址语法检查（local@domain）
pub fn validate_address(address: &str) -> std::result::Result<(), String> {
    if address.is_empty() {
        return Err("收件人地址不能为空".to_string());
    }
    if address.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(format!("收件人地址包含空白字符: {address:?}"));
    }

    let (local, domain) = match address.rsplit_once('@') {
        Some(parts) => parts,
        None => return Err(format!("收件人地址缺少@: {address}")),
    };

    if local.is_empty() || local.len() > 64 || local.contains('@') {
        return Err(format!("收件人地址本地部分无效: {address}"));
    }
    if local.starts_with('.') || local.ends_with('.') || local.contains("..") {
        return Err(format!("收件人地址本地部分无效: {address}"));
    }

    if domain.is_empty() || domain.len() > 255 {
        return Err(format!("收件人地址域名无效: {address}"));
    }
    let labels_ok = domain.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    });
    if !labels_ok {
        return Err(format!("收件人地址域名无效: {address}"));
    }

    Ok(())
}
