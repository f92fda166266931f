//! Event bus client for the eShop services: a persistent RabbitMQ
//! connection that recovers from broker failures, producers that publish
//! persistent messages, and consumers that map handler verdicts to
//! acknowledgements.

pub mod config;
pub mod env;
pub mod message;
pub mod rabbitmq;

pub use message::{Disposition, Envelope};
