use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use courier_core::{
    config::SmtpConfig, AttemptOutcome, MailSession, MailTransport, OutgoingMail, TaskEnvelope,
    TransportCredentials, TransportError, TransportResult,
};
use tokio::time::error::Elapsed;
use tracing::{debug, info, instrument, warn};

/// 对一个任务信封做一次投递尝试
#[async_trait]
pub trait Deliverer: Send + Sync {
    async fn attempt(&self, envelope: &TaskEnvelope, bounded_timeout: Duration) -> AttemptOutcome;
}

/// 通过邮件传输端点投递信封
///
/// 各次调用之间只共享只读配置，可以在多个任务上并发使用。
pub struct DeliveryExecutor {
    transport: Arc<dyn MailTransport>,
    credentials: Option<TransportCredentials>,
    from_address: String,
    default_from_name: String,
    teardown_timeout: Duration,
}

impl DeliveryExecutor {
    pub fn new(transport: Arc<dyn MailTransport>, smtp: &SmtpConfig) -> Self {
        Self {
            transport,
            credentials: smtp.credentials(),
            from_address: smtp.from_email.clone(),
            default_from_name: smtp.from_name.clone(),
            teardown_timeout: smtp.teardown_timeout(),
        }
    }

    fn outgoing_mail(&self, envelope: &TaskEnvelope) -> OutgoingMail {
        let from_name = if envelope.sender_display_name().is_empty() {
            self.default_from_name.clone()
        } else {
            envelope.sender_display_name().to_string()
        };

        OutgoingMail {
            from_address: self.from_address.clone(),
            from_name,
            to: envelope.recipient().to_string(),
            subject: envelope.subject().to_string(),
            html_body: envelope.body().to_string(),
        }
    }

    /// connect + authenticate + send；已打开的会话留在 `slot` 里，由调用方关闭或丢弃
    async fn deliver(
        &self,
        slot: &mut Option<Box<dyn MailSession>>,
        mail: &OutgoingMail,
    ) -> TransportResult<()> {
        let session = slot.insert(self.transport.connect().await?);

        if let Some(credentials) = &self.credentials {
            session.authenticate(credentials).await?;
        }

        session.send(mail).await
    }

    async fn teardown(&self, mut session: Box<dyn MailSession>) {
        match tokio::time::timeout(self.teardown_timeout, session.close()).await {
            Ok(Ok(())) => debug!("传输会话已关闭"),
            Ok(Err(e)) => warn!("关闭传输会话失败: {}", e),
            Err(_) => warn!(
                "关闭传输会话超时({}ms)，直接释放连接",
                self.teardown_timeout.as_millis()
            ),
        }
    }
}

#[async_trait]
impl Deliverer for DeliveryExecutor {
    #[instrument(skip_all, fields(recipient = %envelope.recipient()))]
    async fn attempt(&self, envelope: &TaskEnvelope, bounded_timeout: Duration) -> AttemptOutcome {
        let mail = self.outgoing_mail(envelope);
        let started = Instant::now();

        let mut session = None;
        let result = tokio::time::timeout(bounded_timeout, self.deliver(&mut session, &mail)).await;

        // 超时的会话可能停在 DATA 中途，不再发 QUIT，直接丢弃以断开连接
        match (session.take(), result.is_err()) {
            (Some(session), true) => {
                drop(session);
                debug!("投递超时，传输会话已直接断开");
            }
            (Some(session), false) => self.teardown(session).await,
            (None, _) => {}
        }

        let outcome = classify(result);
        match &outcome {
            AttemptOutcome::Delivered => info!(
                "邮件已投递到 {}，耗时 {}ms",
                envelope.recipient(),
                started.elapsed().as_millis()
            ),
            AttemptOutcome::Timeout => warn!(
                "投递到 {} 超时({}s)",
                envelope.recipient(),
                bounded_timeout.as_secs_f64()
            ),
            other => warn!("投递到 {} 失败: {}", envelope.recipient(), other),
        }
        outcome
    }
}

/// 把传输结果分类为投递结果
pub fn classify(result: Result<TransportResult<()>, Elapsed>) -> AttemptOutcome {
    match result {
        Err(_) => AttemptOutcome::Timeout,
        Ok(Ok(())) => AttemptOutcome::Delivered,
        Ok(Err(e)) => classify_error(&e),
    }
}

pub fn classify_error(err: &TransportError) -> AttemptOutcome {
    if err.is_permanent() {
        AttemptOutcome::PermanentFailure(err.to_string())
    } else {
        AttemptOutcome::TransientFailure(err.to_string())
    }
}
