//! Client for the downstream command service

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::message::Message;

/// Error talking to the command service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownstreamError {
    /// Request could not be sent or the response not read
    Transport(String),
    /// Service answered with a non-success status
    Status { status: u16, command: String },
    /// Service answered 2xx with something that is not a message
    InvalidResponse(String),
}

impl fmt::Display for DownstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownstreamError::Transport(msg) => write!(f, "Transport error: {}", msg),
            DownstreamError::Status { status, command } => {
                write!(f, "Status {} for command '{}'", status, command)
            }
            DownstreamError::InvalidResponse(msg) => write!(f, "Invalid response: {}", msg),
        }
    }
}

impl std::error::Error for DownstreamError {}

/// The command-processing service messages are forwarded to
#[async_trait]
pub trait Downstream: Send + Sync {
    /// Deliver one message and return the service's reply
    async fn send(&self, message: &Message) -> Result<Message, DownstreamError>;
}

/// [`Downstream`] reached over HTTP at `POST {host}/message`
#[derive(Debug, Clone)]
pub struct HttpDownstream {
    client: reqwest::Client,
    url: String,
}

impl HttpDownstream {
    pub fn new(host: &str, timeout: Duration) -> Result<Self, DownstreamError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DownstreamError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            url: format!("{}/message", host.trim_end_matches('/')),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Downstream for HttpDownstream {
    async fn send(&self, message: &Message) -> Result<Message, DownstreamError> {
        debug!("POST {} (command '{}')", self.url, message.command);

        let response = self
            .client
            .post(&self.url)
            .json(message)
            .send()
            .await
            .map_err(|e| DownstreamError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DownstreamError::Status {
                status: status.as_u16(),
                command: message.command.clone(),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| DownstreamError::Transport(e.to_string()))?;
        Message::decode(&body).map_err(|e| DownstreamError::InvalidResponse(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_joins_host_and_path() {
        let downstream = HttpDownstream::new("http://gowon:8080", Duration::from_secs(1)).unwrap();
        assert_eq!(downstream.url(), "http://gowon:8080/message");

        let downstream = HttpDownstream::new("http://gowon:8080/", Duration::from_secs(1)).unwrap();
        assert_eq!(downstream.url(), "http://gowon:8080/message");
    }

    #[test]
    fn test_status_error_names_command() {
        let err = DownstreamError::Status {
            status: 502,
            command: "weather".to_string(),
        };
        assert_eq!(err.to_string(), "Status 502 for command 'weather'");
    }
}
