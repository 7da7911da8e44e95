//! HTTP endpoint republishing request bodies on the broker input topic

use std::convert::Infallible;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Body;
use hyper::header::{HeaderValue, ALLOW, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use hyper_util::server::graceful::GracefulShutdown;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::{log_failure, DeliveryError, Direction, FailureContext, FailureHook};
use crate::client::PubSub;
use crate::message::Message;
use crate::protocol::QoS;

/// The single route served
pub const MESSAGE_PATH: &str = "/message";

const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(10);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Pause after a failed accept, doubling while failures continue
fn accept_backoff(previous: Option<Duration>) -> Duration {
    match previous {
        None => ACCEPT_BACKOFF_MIN,
        Some(delay) => std::cmp::min(delay * 2, ACCEPT_BACKOFF_MAX),
    }
}

/// Turns `POST /message` requests into broker publishes
#[derive(Clone)]
pub struct InboundBridge {
    pubsub: Arc<dyn PubSub>,
    module: String,
    input_topic: String,
    on_failure: FailureHook,
}

impl InboundBridge {
    pub fn new(
        pubsub: Arc<dyn PubSub>,
        module: impl Into<String>,
        input_topic: impl Into<String>,
    ) -> Self {
        Self {
            pubsub,
            module: module.into(),
            input_topic: input_topic.into(),
            on_failure: log_failure(),
        }
    }

    /// Replace the default logging failure hook
    pub fn with_failure_hook(mut self, hook: FailureHook) -> Self {
        self.on_failure = hook;
        self
    }

    fn acknowledgement(&self) -> Bytes {
        Message::new(self.module.as_str()).encode_pretty()
    }

    fn report(&self, command: Option<String>, err: DeliveryError) {
        let ctx = FailureContext {
            direction: Direction::Inbound,
            topic: self.input_topic.clone(),
            command,
        };
        (self.on_failure)(&ctx, &err);
    }

    /// Handle one HTTP request
    pub async fn handle<B>(&self, req: Request<B>) -> Response<Full<Bytes>>
    where
        B: Body<Data = Bytes>,
        B::Error: fmt::Display,
    {
        if req.uri().path() != MESSAGE_PATH {
            return text_response(StatusCode::NOT_FOUND, "Not Found");
        }
        if req.method() != Method::POST {
            let mut response = text_response(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed");
            response
                .headers_mut()
                .insert(ALLOW, HeaderValue::from_static("POST"));
            return response;
        }

        let body = match req.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                self.report(None, DeliveryError::RequestBody(e.to_string()));
                return json_response(StatusCode::BAD_REQUEST, self.acknowledgement());
            }
        };

        debug!("Inbound message ({} bytes) -> '{}'", body.len(), self.input_topic);
        // The body goes out unchanged; decoding here only labels failures
        if let Err(e) = self
            .pubsub
            .publish(&self.input_topic, QoS::AtMostOnce, false, body.clone())
            .await
        {
            let command = Message::decode(&body).ok().map(|m| m.command);
            self.report(command, e.into());
        }

        json_response(StatusCode::OK, self.acknowledgement())
    }
}

fn json_response(status: StatusCode, body: Bytes) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("application/json; charset=utf-8"),
    );
    response
}

fn text_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
}

/// HTTP/1 server for the inbound bridge
pub struct InboundServer {
    listener: TcpListener,
    bridge: Arc<InboundBridge>,
    shutdown_grace: Duration,
}

impl InboundServer {
    pub async fn bind(
        addr: SocketAddr,
        bridge: InboundBridge,
        shutdown_grace: Duration,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            bridge: Arc::new(bridge),
            shutdown_grace,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` fires, then give open
    /// connections up to the shutdown grace period to finish.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        if let Ok(addr) = self.listener.local_addr() {
            info!("Inbound HTTP listening on http://{}{}", addr, MESSAGE_PATH);
        }
        let graceful = GracefulShutdown::new();
        let mut backoff = None;

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => {
                            backoff = None;
                            accepted
                        }
                        Err(e) => {
                            // e.g. EMFILE, which persists until connections close
                            let delay = accept_backoff(backoff);
                            backoff = Some(delay);
                            error!(
                                "Failed to accept HTTP connection: {}, retrying in {:?}",
                                e, delay
                            );
                            tokio::select! {
                                _ = tokio::time::sleep(delay) => {}
                                _ = shutdown.recv() => break,
                            }
                            continue;
                        }
                    };
                    debug!("HTTP connection from {}", peer);

                    let bridge = self.bridge.clone();
                    let service = service_fn(move |req| {
                        let bridge = bridge.clone();
                        async move { Ok::<_, Infallible>(bridge.handle(req).await) }
                    });
                    let conn = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service);
                    let conn = graceful.watch(conn);

                    tokio::spawn(async move {
                        if let Err(err) = conn.await {
                            debug!("Error serving HTTP connection from {}: {:?}", peer, err);
                        }
                    });
                }
                _ = shutdown.recv() => break,
            }
        }

        drop(self.listener);
        tokio::select! {
            _ = graceful.shutdown() => debug!("HTTP connections drained"),
            _ = tokio::time::sleep(self.shutdown_grace) => {
                warn!("HTTP connections still open after {:?}, closing", self.shutdown_grace);
            }
        }
        info!("Inbound HTTP server stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accept_backoff_doubles_to_cap() {
        let mut delay = accept_backoff(None);
        assert_eq!(delay, ACCEPT_BACKOFF_MIN);

        let mut seen = vec![delay];
        for _ in 0..10 {
            delay = accept_backoff(Some(delay));
            seen.push(delay);
        }
        assert_eq!(seen[1], Duration::from_millis(20));
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*seen.last().unwrap(), ACCEPT_BACKOFF_MAX);
    }
}
