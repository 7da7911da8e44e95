//! Gowon Bridges
//!
//! Moves gowon messages between the broker and the HTTP world:
//!
//! - **Outbound**: messages on the broker's output topic are decoded and
//!   POSTed to the downstream command service. The response is only
//!   inspected for errors.
//! - **Inbound**: `POST /message` bodies are republished unchanged on the
//!   broker's input topic and acknowledged immediately.
//!
//! Neither direction retries. Failures are handed to an explicit
//! [`FailureHook`], which logs by default.

mod downstream;
mod inbound;
mod outbound;


use std::fmt;
use std::sync::Arc;

use tracing::error;

use crate::client::ClientError;
use crate::message::MessageError;

pub use downstream::{Downstream, DownstreamError, HttpDownstream};
pub use inbound::{InboundBridge, InboundServer, MESSAGE_PATH};
pub use outbound::OutboundBridge;

/// Which way a message was travelling when it failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Broker output topic to the downstream service
    Outbound,
    /// HTTP caller to the broker input topic
    Inbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Outbound => write!(f, "outbound"),
            Direction::Inbound => write!(f, "inbound"),
        }
    }
}

/// Where a failed message came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureContext {
    pub direction: Direction,
    /// Broker topic the message was read from or destined for
    pub topic: String,
    /// Command name, when the payload could be decoded
    pub command: Option<String>,
}

/// Reason a message was dropped
#[derive(Debug)]
pub enum DeliveryError {
    /// Payload is not a gowon message
    Decode(MessageError),
    /// Downstream call failed
    Downstream(DownstreamError),
    /// Publishing to the broker failed
    Publish(ClientError),
    /// HTTP request body could not be read
    RequestBody(String),
}

impl fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryError::Decode(e) => write!(f, "Decode error: {}", e),
            DeliveryError::Downstream(e) => write!(f, "Downstream error: {}", e),
            DeliveryError::Publish(e) => write!(f, "Publish error: {}", e),
            DeliveryError::RequestBody(msg) => write!(f, "Unable to read request body: {}", msg),
        }
    }
}

impl std::error::Error for DeliveryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DeliveryError::Decode(e) => Some(e),
            DeliveryError::Downstream(e) => Some(e),
            DeliveryError::Publish(e) => Some(e),
            DeliveryError::RequestBody(_) => None,
        }
    }
}

impl From<MessageError> for DeliveryError {
    fn from(e: MessageError) -> Self {
        DeliveryError::Decode(e)
    }
}

impl From<DownstreamError> for DeliveryError {
    fn from(e: DownstreamError) -> Self {
        DeliveryError::Downstream(e)
    }
}

impl From<ClientError> for DeliveryError {
    fn from(e: ClientError) -> Self {
        DeliveryError::Publish(e)
    }
}

/// Callback receiving every dropped message
pub type FailureHook = Arc<dyn Fn(&FailureContext, &DeliveryError) + Send + Sync>;

/// Default failure hook: log and move on
pub fn log_failure() -> FailureHook {
    Arc::new(|ctx, err| match ctx.command {
        Some(ref command) => error!(
            "Dropped {} message on '{}' (command '{}'): {}",
            ctx.direction, ctx.topic, command, err
        ),
        None => error!("Dropped {} message on '{}': {}", ctx.direction, ctx.topic, err),
    })
}
