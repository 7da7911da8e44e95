//! mqttbridge - gowon MQTT bridge
//!
//! Connects an MQTT v3.1.1 broker to the gowon command service: messages on
//! the broker's output topic are POSTed to the service, and messages POSTed
//! to the bridge's HTTP endpoint are published on the input topic.

pub mod bridge;
pub mod client;
pub mod codec;
pub mod config;
pub mod message;
pub mod protocol;
pub mod router;
pub mod topic;

pub use bridge::{HttpDownstream, InboundBridge, InboundServer, OutboundBridge};
pub use client::{BrokerClient, ConnectionHooks, ConnectionState, PubSub};
pub use config::Config;
pub use message::Message;
pub use protocol::QoS;
pub use router::CommandRouter;
