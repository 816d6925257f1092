pub mod config;
pub mod errors;
pub mod models;
pub mod traits;

pub use config::{
    AppConfig, ContactConfig, MessageQueueConfig, MessageQueueType, ObservabilityConfig, SmtpConfig,
    SmtpTlsMode, WorkerConfig,
};
pub use errors::*;
pub use models::{
    AttemptOutcome, Contact, Delivery, DeliveryTag, OutgoingMail, PublishOptions, Subscription,
    TaskEnvelope,
};
pub use traits::{
    ContactSource, MailSession, MailTransport, QueueConnector, TaskQueue, TransportCredentials,
    TransportError, TransportResult,
};

/// 统一的Result类型
pub type DispatchResult<T> = std::result::Result<T, DispatchError>;
