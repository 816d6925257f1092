pub mod contact;
pub mod delivery;
pub mod envelope;
pub mod mail;
pub mod outcome;

pub use contact::Contact;
pub use delivery::{Delivery, DeliveryTag, PublishOptions, Subscription};
pub use envelope::{validate_address, TaskEnvelope};
pub use mail::OutgoingMail;
pub use outcome::AttemptOutcome;
