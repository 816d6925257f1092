pub mod contact_source;
pub mod message_queue;
pub mod transport;

pub use contact_source::ContactSource;
pub use message_queue::{QueueConnector, TaskQueue};
pub use transport::{
    MailSession, MailTransport, TransportCredentials, TransportError, TransportResult,
};
