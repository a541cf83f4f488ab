//! NATS JetStream integration
//!
//! Forwards gateway dispatches to the `EVENTS` stream.

mod publisher;

pub use publisher::{streams, subject_for, subjects, NatsPublisher};
