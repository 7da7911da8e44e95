//! Local Command Router
//!
//! Answers commands addressed to this bridge's own module without a trip
//! to the downstream service. Messages for other modules, and commands
//! with no registered handler, are left alone.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::client::PubSub;
use crate::message::Message;
use crate::protocol::QoS;

/// Error returned by a command handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// Arguments were missing or malformed
    InvalidArgs(String),
    /// The handler ran but failed
    Failed(String),
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::InvalidArgs(msg) => write!(f, "Invalid arguments: {}", msg),
            CommandError::Failed(msg) => write!(f, "Command failed: {}", msg),
        }
    }
}

impl std::error::Error for CommandError {}

/// A local command handler
pub type CommandHandler = Arc<dyn Fn(&Message) -> Result<String, CommandError> + Send + Sync>;

/// Dispatches messages to local handlers by command name
#[derive(Clone)]
pub struct CommandRouter {
    module: String,
    handlers: HashMap<String, CommandHandler>,
}

impl CommandRouter {
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            handlers: HashMap::new(),
        }
    }

    /// Router with the built-in `test` command registered
    pub fn with_builtins(module: impl Into<String>) -> Self {
        let mut router = Self::new(module);
        router.register("test", |_| Ok("testing".to_string()));
        router
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    /// Register a handler, replacing any previous one for `command`
    pub fn register<F>(&mut self, command: impl Into<String>, handler: F)
    where
        F: Fn(&Message) -> Result<String, CommandError> + Send + Sync + 'static,
    {
        self.handlers.insert(command.into(), Arc::new(handler));
    }

    /// Run the handler for `message`, if it is addressed here and one is registered.
    ///
    /// `None` means the message is not handled locally.
    pub fn dispatch(&self, message: &Message) -> Option<Result<String, CommandError>> {
        if message.module != self.module {
            return None;
        }
        let handler = self.handlers.get(&message.command)?;
        Some(handler(message))
    }

    /// Answer commands arriving on `input_topic` with replies on `output_topic`.
    ///
    /// Runs until the subscription ends.
    pub async fn serve<P>(self, pubsub: Arc<P>, input_topic: &str, output_topic: &str)
    where
        P: PubSub + ?Sized,
    {
        let mut subscription = match pubsub.subscribe(input_topic, QoS::AtMostOnce).await {
            Ok(subscription) => subscription,
            Err(e) => {
                error!("Command router failed to subscribe to '{}': {}", input_topic, e);
                return;
            }
        };
        debug!("Command router listening on '{}'", input_topic);

        while let Some(inbound) = subscription.recv().await {
            let message = match Message::decode(&inbound.payload) {
                Ok(message) => message,
                Err(e) => {
                    warn!("Dropping undecodable message on '{}': {}", inbound.topic, e);
                    continue;
                }
            };

            let text = match self.dispatch(&message) {
                None => {
                    debug!(
                        "Not handled locally: module '{}' command '{}'",
                        message.module, message.command
                    );
                    continue;
                }
                Some(Err(e)) => {
                    error!("Command '{}' failed: {}", message.command, e);
                    continue;
                }
                Some(Ok(text)) => text,
            };

            let reply = message.reply(&self.module, text);
            if let Err(e) = pubsub
                .publish(output_topic, QoS::AtMostOnce, false, reply.encode())
                .await
            {
                error!("Failed to publish reply to '{}': {}", message.command, e);
            }
        }

        debug!("Command router stopped");
    }
}

impl fmt::Debug for CommandRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut commands: Vec<&String> = self.handlers.keys().collect();
        commands.sort();
        f.debug_struct("CommandRouter")
            .field("module", &self.module)
            .field("commands", &commands)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::tests::FakePubSub;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_builtin_test_command() {
        let router = CommandRouter::with_builtins("mqttbroker");
        let message = Message::new("mqttbroker").with_command("test");

        assert_eq!(router.dispatch(&message), Some(Ok("testing".to_string())));
    }

    #[test]
    fn test_unknown_command_not_handled() {
        let router = CommandRouter::with_builtins("mqttbroker");
        let message = Message::new("mqttbroker").with_command("weather");

        assert_eq!(router.dispatch(&message), None);
    }

    #[test]
    fn test_foreign_module_not_handled() {
        let router = CommandRouter::with_builtins("mqttbroker");
        let message = Message::new("gowon").with_command("test");

        assert_eq!(router.dispatch(&message), None);
    }

    #[test]
    fn test_register_overwrites() {
        let mut router = CommandRouter::with_builtins("m");
        router.register("test", |msg| Ok(format!("args: {}", msg.args.join(","))));

        let message = Message::new("m").with_command("test").with_args(["a", "b"]);
        assert_eq!(router.dispatch(&message), Some(Ok("args: a,b".to_string())));
    }

    #[test]
    fn test_handler_error_is_returned() {
        let mut router = CommandRouter::new("m");
        router.register("fail", |_| Err(CommandError::Failed("boom".to_string())));

        let message = Message::new("m").with_command("fail");
        assert_eq!(
            router.dispatch(&message),
            Some(Err(CommandError::Failed("boom".to_string())))
        );
    }

    #[tokio::test]
    async fn test_serve_replies_on_output_topic() {
        let pubsub = Arc::new(FakePubSub::default());
        let router = CommandRouter::with_builtins("mqttbroker");

        let handle = tokio::spawn(router.serve(pubsub.clone(), "/gowon/input", "/gowon/output"));
        let input = pubsub.wait_for_subscriber("/gowon/input").await;

        // Foreign module, unknown command and garbage are all ignored
        input.deliver(&Message::new("gowon").with_command("test").encode());
        input.deliver(&Message::new("mqttbroker").with_command("nope").encode());
        input.deliver(b"not json");
        input.deliver(
            &Message::new("mqttbroker")
                .with_command("test")
                .with_dest("#chan")
                .encode(),
        );

        let (topic, payload) = pubsub.next_publish().await;
        assert_eq!(topic, "/gowon/output");
        let reply = Message::decode(&payload).unwrap();
        assert_eq!(
            reply,
            Message::new("mqttbroker").with_dest("#chan").with_msg("testing")
        );

        drop(input);
        handle.await.unwrap();
        assert_eq!(pubsub.published().len(), 1);
    }
}
