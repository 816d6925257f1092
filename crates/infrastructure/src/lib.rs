pub mod contact_source;
pub mod in_memory_queue;
pub mod message_queue;
pub mod message_queue_factory;
pub mod smtp_transport;

pub use contact_source::*;
pub use in_memory_queue::*;
pub use message_queue::*;
pub use message_queue_factory::*;
pub use smtp_transport::*;
