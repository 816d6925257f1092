pub mod app_config;
pub mod contacts;
pub mod message_queue;
pub mod observability;
pub mod smtp;
pub mod worker;

// Re-export main types for easier imports
pub use app_config::AppConfig;
pub use contacts::ContactConfig;
pub use message_queue::{MessageQueueConfig, MessageQueueType};
pub use observability::ObservabilityConfig;
pub use smtp::{SmtpConfig, SmtpTlsMode};
pub use worker::WorkerConfig;
