//! SMTP 邮件传输
//!
//! 每次投递尝试打开一条新的 SMTP 连接；会话由调用方显式关闭（QUIT），
//! 会话被丢弃时底层 socket 随之释放。

use async_trait::async_trait;
use courier_core::{
    config::{SmtpConfig, SmtpTlsMode},
    MailSession, MailTransport, OutgoingMail, TransportCredentials, TransportError,
    TransportResult,
};
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::{
        authentication::{Credentials, Mechanism},
        client::{AsyncSmtpConnection, TlsParameters},
        extension::ClientId,
        Error as SmtpError,
    },
    Address, Message,
};
use tracing::debug;

const AUTH_MECHANISMS: &[Mechanism] = &[Mechanism::Plain, Mechanism::Login];

pub struct SmtpTransport {
    config: SmtpConfig,
    hello_name: ClientId,
}

impl SmtpTransport {
    pub fn new(config: SmtpConfig) -> Self {
        let hello_name = ClientId::Domain(resolve_hello_name(config.hello_name.as_deref()));
        Self { config, hello_name }
    }

    fn tls_parameters(&self) -> TransportResult<TlsParameters> {
        TlsParameters::new(self.config.host.clone()).map_err(|e| TransportError::Tls(e.to_string()))
    }
}

#[async_trait]
impl MailTransport for SmtpTransport {
    async fn connect(&self) -> TransportResult<Box<dyn MailSession>> {
        debug!("连接SMTP服务器 {}:{}", self.config.host, self.config.port);

        let mut connection = AsyncSmtpConnection::connect_tokio1(
            (self.config.host.as_str(), self.config.port),
            None,
            &self.hello_name,
            None,
            None,
        )
        .await
        .map_err(map_smtp_error)?;

        match self.config.tls {
            SmtpTlsMode::None => {}
            SmtpTlsMode::Opportunistic => {
                if connection.can_starttls() {
                    connection
                        .starttls(self.tls_parameters()?, &self.hello_name)
                        .await
                        .map_err(map_smtp_error)?;
                } else {
                    debug!("SMTP服务器不支持STARTTLS，使用明文连接");
                }
            }
            SmtpTlsMode::Required => {
                if !connection.can_starttls() {
                    connection.abort().await;
                    return Err(TransportError::Tls("SMTP服务器不支持STARTTLS".to_string()));
                }
                connection
                    .starttls(self.tls_parameters()?, &self.hello_name)
                    .await
                    .map_err(map_smtp_error)?;
            }
        }

        Ok(Box::new(SmtpSession { connection }))
    }
}

struct SmtpSession {
    connection: AsyncSmtpConnection,
}

#[async_trait]
impl MailSession for SmtpSession {
    async fn authenticate(&mut self, credentials: &TransportCredentials) -> TransportResult<()> {
        let credentials =
            Credentials::new(credentials.username.clone(), credentials.password.clone());
        self.connection
            .auth(AUTH_MECHANISMS, &credentials)
            .await
            .map(|_| ())
            .map_err(map_smtp_error)
    }

    async fn send(&mut self, mail: &OutgoingMail) -> TransportResult<()> {
        let message = build_message(mail)?;
        self.connection
            .send(message.envelope(), &message.formatted())
            .await
            .map(|_| ())
            .map_err(map_smtp_error)
    }

    async fn close(&mut self) -> TransportResult<()> {
        match self.connection.quit().await {
            Ok(_) => Ok(()),
            Err(e) => {
                self.connection.abort().await;
                Err(map_smtp_error(e))
            }
        }
    }
}

/// 组装 HTML 邮件
pub fn build_message(mail: &OutgoingMail) -> TransportResult<Message> {
    let from_address: Address = mail
        .from_address
        .parse()
        .map_err(|e| TransportError::Protocol(format!("发件人地址无效: {e}")))?;
    let to_address: Address = mail
        .to
        .parse()
        .map_err(|e| TransportError::InvalidRecipient(format!("{}: {e}", mail.to)))?;

    let from_name = (!mail.from_name.is_empty()).then(|| mail.from_name.clone());

    Message::builder()
        .from(Mailbox::new(from_name, from_address))
        .to(Mailbox::new(None, to_address))
        .subject(mail.subject.clone())
        .header(ContentType::TEXT_HTML)
        .body(mail.html_body.clone())
        .map_err(|e| TransportError::Protocol(format!("构造邮件失败: {e}")))
}

/// 把 lettre 的错误映射为传输层错误，远端应答保留应答码
fn map_smtp_error(err: SmtpError) -> TransportError {
    if let Some(code) = err.status() {
        let code = code.to_string().parse::<u16>().unwrap_or(0);
        return TransportError::Reply {
            code,
            message: err.to_string(),
        };
    }

    if err.is_client() {
        TransportError::Protocol(err.to_string())
    } else {
        TransportError::Io(err.to_string())
    }
}

fn resolve_hello_name(configured: Option<&str>) -> String {
    if let Some(name) = configured.filter(|name| !name.is_empty()) {
        return name.to_string();
    }

    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}
