//! Gowon message envelope
//!
//! The JSON document exchanged on the broker topics and with the downstream
//! command service:
//!
//! ```json
//! {"module": "mqttbroker", "command": "test", "args": [], "dest": "#chan", "msg": ""}
//! ```
//!
//! `module` is required; every other field defaults to empty when absent.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Errors produced when decoding a message envelope
#[derive(Debug)]
pub enum MessageError {
    /// Payload is not a well-formed envelope (bad JSON, bad UTF-8, wrong field types)
    Malformed(serde_json::Error),
    /// A required field is absent or empty
    MissingField(&'static str),
}

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageError::Malformed(e) => write!(f, "malformed message: {}", e),
            MessageError::MissingField(field) => write!(f, "message is missing '{}'", field),
        }
    }
}

impl std::error::Error for MessageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MessageError::Malformed(e) => Some(e),
            MessageError::MissingField(_) => None,
        }
    }
}

impl From<serde_json::Error> for MessageError {
    fn from(e: serde_json::Error) -> Self {
        MessageError::Malformed(e)
    }
}

/// A gowon message
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Message {
    /// Originating or target component
    pub module: String,
    /// Action requested
    pub command: String,
    /// Positional arguments of the command
    pub args: Vec<String>,
    /// Where a reply should be delivered, opaque to the bridge
    pub dest: String,
    /// Free-form reply or result text
    pub msg: String,
}

impl Message {
    /// Create an empty message tagged with a module
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            ..Default::default()
        }
    }

    /// Builder: set the command
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = command.into();
        self
    }

    /// Builder: set the positional arguments
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Builder: set the reply destination
    pub fn with_dest(mut self, dest: impl Into<String>) -> Self {
        self.dest = dest.into();
        self
    }

    /// Builder: set the message text
    pub fn with_msg(mut self, msg: impl Into<String>) -> Self {
        self.msg = msg.into();
        self
    }

    /// Build a reply from `module` carrying `msg`, addressed to this message's destination
    pub fn reply(&self, module: &str, msg: impl Into<String>) -> Message {
        Message::new(module).with_dest(self.dest.clone()).with_msg(msg)
    }

    /// Decode a message from its wire form
    pub fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        let message: Message = serde_json::from_slice(bytes)?;
        if message.module.is_empty() {
            return Err(MessageError::MissingField("module"));
        }
        Ok(message)
    }

    /// Encode a message to its compact wire form
    pub fn encode(&self) -> Bytes {
        // A struct of strings always serializes
        Bytes::from(serde_json::to_vec(self).expect("message serialization cannot fail"))
    }

    /// Encode a message as indented JSON, used for HTTP responses
    pub fn encode_pretty(&self) -> Bytes {
        Bytes::from(serde_json::to_vec_pretty(self).expect("message serialization cannot fail"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn test_decode_full_message() {
        let raw = br##"{"module":"gowon","command":"weather","args":["london","uk"],"dest":"#chan","msg":"!weather london uk"}"##;
        let message = Message::decode(raw).unwrap();

        assert_eq!(message.module, "gowon");
        assert_eq!(message.command, "weather");
        assert_eq!(message.args, vec!["london", "uk"]);
        assert_eq!(message.dest, "#chan");
        assert_eq!(message.msg, "!weather london uk");
    }

    #[test]
    fn test_decode_defaults_optional_fields() {
        let message = Message::decode(br#"{"module":"x","command":"y"}"#).unwrap();
        assert_eq!(message, Message::new("x").with_command("y"));
    }

    #[test]
    fn test_decode_ignores_unknown_fields() {
        let message = Message::decode(br#"{"module":"x","nick":"someone"}"#).unwrap();
        assert_eq!(message, Message::new("x"));
    }

    #[test]
    fn test_decode_requires_module() {
        assert!(matches!(
            Message::decode(br#"{"command":"y"}"#),
            Err(MessageError::MissingField("module"))
        ));
        assert!(matches!(
            Message::decode(br#"{"module":"","command":"y"}"#),
            Err(MessageError::MissingField("module"))
        ));
    }

    #[test]
    fn test_decode_malformed() {
        let cases: [&[u8]; 7] = [
            b"",
            b"not json",
            b"{\"module\":\"x\"",
            b"\"module\"",
            b"{\"module\":42}",
            b"{\"module\":\"x\",\"args\":\"a b\"}",
            b"{\"module\":\"\xff\xfe\"}",
        ];
        for raw in cases {
            assert!(
                matches!(Message::decode(raw), Err(MessageError::Malformed(_))),
                "expected malformed: {:?}",
                String::from_utf8_lossy(raw)
            );
        }
    }

    #[test]
    fn test_reply_uses_own_module_and_original_dest() {
        let request = Message::new("gowon")
            .with_command("test")
            .with_dest("#chan")
            .with_msg("!test");
        let reply = request.reply("mqttbroker", "testing");

        assert_eq!(reply.module, "mqttbroker");
        assert_eq!(reply.dest, "#chan");
        assert_eq!(reply.msg, "testing");
        assert!(reply.command.is_empty());
        // The request is untouched
        assert_eq!(request.module, "gowon");
    }

    #[test]
    fn test_encode_pretty_is_indented() {
        let encoded = Message::new("mqttbroker").encode_pretty();
        let text = std::str::from_utf8(&encoded).unwrap();
        assert!(text.contains("\n  \"module\": \"mqttbroker\""));
        assert_eq!(Message::decode(&encoded).unwrap(), Message::new("mqttbroker"));
    }

    fn arb_message() -> impl Strategy<Value = Message> {
        (
            "[a-z]{1,12}",
            ".*",
            proptest::collection::vec(".*", 0..4),
            ".*",
            ".*",
        )
            .prop_map(|(module, command, args, dest, msg)| Message {
                module,
                command,
                args,
                dest,
                msg,
            })
    }

    proptest! {
        #[test]
        fn prop_encode_decode_roundtrip(message in arb_message()) {
            prop_assert_eq!(Message::decode(&message.encode()).unwrap(), message);
        }

        #[test]
        fn prop_decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
            let _ = Message::decode(&bytes);
        }

        #[test]
        fn prop_truncated_encoding_fails(message in arb_message(), cut in 1usize..8) {
            let encoded = message.encode();
            let len = encoded.len().saturating_sub(cut);
            prop_assert!(Message::decode(&encoded[..len]).is_err());
        }
    }
}
