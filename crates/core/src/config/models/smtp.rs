use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::models::validate_address;
use crate::traits::TransportCredentials;

/// 传输层加密模式
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SmtpTlsMode {
    /// 明文
    #[default]
    None,
    /// 服务器支持时升级为 STARTTLS
    Opportunistic,
    /// 必须升级为 STARTTLS
    Required,
}

/// SMTP endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub tls: SmtpTlsMode,
    pub username: String,
    pub password: String,
    pub from_email: String,
    pub from_name: String,
    /// EHLO 使用的名称，为空时取本机主机名
    pub hello_name: Option<String>,
    /// 单次投递（连接+认证+发送）的总时限
    pub attempt_timeout_seconds: u64,
    pub teardown_timeout_ms: u64,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 587,
            tls: SmtpTlsMode::default(),
            username: String::new(),
            password: String::new(),
            from_email: "reminders@localhost.localdomain".to_string(),
            from_name: "Meeting Reminder System".to_string(),
            hello_name: None,
            attempt_timeout_seconds: 30,
            teardown_timeout_ms: 2000,
        }
    }
}

impl SmtpConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.host.is_empty() {
            return Err(anyhow::anyhow!("SMTP主机地址不能为空"));
        }

        if self.port == 0 {
            return Err(anyhow::anyhow!("SMTP端口必须大于0"));
        }

        validate_address(&self.from_email)
            .map_err(|e| anyhow::anyhow!("发件人地址无效: {e}"))?;

        if self.attempt_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("投递超时时间必须大于0"));
        }

        Ok(())
    }

    /// 用户名和密码都非空时才认证，否则走匿名中继
    pub fn credentials(&self) -> Option<TransportCredentials> {
        if self.username.is_empty() || self.password.is_empty() {
            return None;
        }
        Some(TransportCredentials {
            username: self.username.clone(),
            password: self.password.clone(),
        })
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_seconds)
    }

    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_millis(self.teardown_timeout_ms)
    }
}
