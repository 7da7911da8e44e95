//! Broker output topic to downstream service

use std::sync::Arc;

use tracing::{debug, error};

use super::{log_failure, DeliveryError, Direction, Downstream, FailureContext, FailureHook};
use crate::client::{InboundMessage, PubSub, Subscription};
use crate::message::Message;
use crate::protocol::QoS;

/// Forwards broker messages to the downstream service
#[derive(Clone)]
pub struct OutboundBridge {
    downstream: Arc<dyn Downstream>,
    on_failure: FailureHook,
}

impl OutboundBridge {
    pub fn new(downstream: Arc<dyn Downstream>) -> Self {
        Self {
            downstream,
            on_failure: log_failure(),
        }
    }

    /// Replace the default logging failure hook
    pub fn with_failure_hook(mut self, hook: FailureHook) -> Self {
        self.on_failure = hook;
        self
    }

    /// Decode one broker message and deliver it downstream.
    ///
    /// The service's reply is discarded once it has been checked.
    pub async fn process(&self, payload: &[u8]) -> Result<Message, DeliveryError> {
        let message = Message::decode(payload)?;
        let reply = self.downstream.send(&message).await?;
        Ok(reply)
    }

    /// Process one message, reporting any failure to the hook
    pub async fn forward(&self, inbound: InboundMessage) {
        match self.process(&inbound.payload).await {
            Ok(reply) => {
                debug!(
                    "Delivered message from '{}' (reply module '{}')",
                    inbound.topic, reply.module
                );
            }
            Err(err) => {
                let command = match err {
                    DeliveryError::Decode(_) => None,
                    _ => Message::decode(&inbound.payload).ok().map(|m| m.command),
                };
                let ctx = FailureContext {
                    direction: Direction::Outbound,
                    topic: inbound.topic.to_string(),
                    command,
                };
                (self.on_failure)(&ctx, &err);
            }
        }
    }

    /// Forward every message from `subscription`, each on its own task.
    ///
    /// Returns when the subscription ends.
    pub async fn run(&self, mut subscription: Subscription) {
        debug!("Outbound bridge forwarding '{}'", subscription.filter());
        while let Some(inbound) = subscription.recv().await {
            let bridge = self.clone();
            tokio::spawn(async move { bridge.forward(inbound).await });
        }
        debug!("Outbound bridge stopped");
    }

    /// Subscribe to `output_topic` and forward until the subscription ends
    pub async fn serve<P>(&self, pubsub: Arc<P>, output_topic: &str)
    where
        P: PubSub + ?Sized,
    {
        match pubsub.subscribe(output_topic, QoS::AtMostOnce).await {
            Ok(subscription) => self.run(subscription).await,
            Err(e) => error!("Outbound bridge failed to subscribe to '{}': {}", output_topic, e),
        }
    }
}
