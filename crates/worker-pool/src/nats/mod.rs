//! Optional NATS JetStream wake-up hint.

mod subscriber;

pub use subscriber::NatsSubscriber;
