//! Channel adapters: where messages come from and where posts go.

pub mod log;
pub mod stdin;
pub mod telegram;

use std::pin::Pin;

use futures::Stream;

use crate::pipeline::types::RawMessage;

pub use log::LogPublisher;
pub use stdin::StdinSource;
pub use telegram::TelegramPublisher;

/// Stream of inbound messages produced by a source adapter.
pub type MessageStream = Pin<Box<dyn Stream<Item = RawMessage> + Send>>;
