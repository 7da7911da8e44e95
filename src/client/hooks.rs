//! Connection lifecycle callbacks
//!
//! Hooks run on the connection task, so they should return quickly and
//! hand any real work to another task.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{ClientError, InboundMessage};

pub type ConnectHook = Arc<dyn Fn() + Send + Sync>;
pub type ConnectionLostHook = Arc<dyn Fn(&ClientError) + Send + Sync>;
pub type ReconnectingHook = Arc<dyn Fn() + Send + Sync>;
pub type UnhandledHook = Arc<dyn Fn(&InboundMessage) + Send + Sync>;

/// Callbacks invoked by the connection task
///
/// Every hook defaults to logging the event.
#[derive(Clone)]
pub struct ConnectionHooks {
    /// A CONNACK was accepted
    pub on_connect: ConnectHook,
    /// An established connection dropped
    pub on_connection_lost: ConnectionLostHook,
    /// About to attempt a reconnect after a lost connection
    pub on_reconnecting: ReconnectingHook,
    /// A PUBLISH arrived that matches no live subscription
    pub on_unhandled: UnhandledHook,
}

impl Default for ConnectionHooks {
    fn default() -> Self {
        Self {
            on_connect: Arc::new(|| info!("Connected to broker")),
            on_connection_lost: Arc::new(|err| warn!("Connection to broker lost: {}", err)),
            on_reconnecting: Arc::new(|| info!("Reconnecting to broker")),
            on_unhandled: Arc::new(|msg| {
                debug!(
                    "Unhandled message on '{}' ({} bytes)",
                    msg.topic,
                    msg.payload.len()
                )
            }),
        }
    }
}

impl ConnectionHooks {
    pub fn on_connect(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_connect = Arc::new(hook);
        self
    }

    pub fn on_connection_lost(
        mut self,
        hook: impl Fn(&ClientError) + Send + Sync + 'static,
    ) -> Self {
        self.on_connection_lost = Arc::new(hook);
        self
    }

    pub fn on_reconnecting(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_reconnecting = Arc::new(hook);
        self
    }

    pub fn on_unhandled(mut self, hook: impl Fn(&InboundMessage) + Send + Sync + 'static) -> Self {
        self.on_unhandled = Arc::new(hook);
        self
    }
}

impl fmt::Debug for ConnectionHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHooks").finish_non_exhaustive()
    }
}
