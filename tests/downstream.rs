//! Downstream Service Integration Tests
//!
//! Drives `HttpDownstream` against a small hyper server standing in for
//! the command service.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::CONTENT_TYPE;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use pretty_assertions::assert_eq;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use mqttbridge::bridge::{Downstream, DownstreamError, HttpDownstream};
use mqttbridge::message::Message;

/// A request as seen by the fake service
#[derive(Debug)]
struct Received {
    method: String,
    path: String,
    content_type: Option<String>,
    body: Bytes,
}

/// Reply chosen from the command of the posted message
async fn respond(body: &Bytes) -> Response<Full<Bytes>> {
    let message = Message::decode(body).unwrap_or_default();
    match message.command.as_str() {
        "fail" => {
            let mut response = Response::new(Full::new(Bytes::from_static(b"boom")));
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            response
        }
        "garbage" => Response::new(Full::new(Bytes::from_static(b"<html>nope</html>"))),
        "slow" => {
            tokio::time::sleep(Duration::from_secs(2)).await;
            Response::new(Full::new(Message::new("gowon").encode()))
        }
        _ => {
            let reply = message.reply("gowon", format!("{} done", message.command));
            Response::new(Full::new(reply.encode()))
        }
    }
}

async fn start_service() -> (SocketAddr, mpsc::UnboundedReceiver<Received>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let tx = tx.clone();
            let service = service_fn(move |req: Request<Incoming>| {
                let tx = tx.clone();
                async move {
                    let method = req.method().to_string();
                    let path = req.uri().path().to_string();
                    let content_type = req
                        .headers()
                        .get(CONTENT_TYPE)
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    let body = req.into_body().collect().await.unwrap().to_bytes();
                    let response = respond(&body).await;
                    let _ = tx.send(Received {
                        method,
                        path,
                        content_type,
                        body,
                    });
                    Ok::<_, Infallible>(response)
                }
            });
            tokio::spawn(async move {
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    (addr, rx)
}

fn downstream_for(addr: SocketAddr, timeout: Duration) -> HttpDownstream {
    HttpDownstream::new(&format!("http://{}", addr), timeout).unwrap()
}

#[tokio::test]
async fn test_posts_message_and_decodes_reply() {
    let (addr, mut received) = start_service().await;
    let downstream = downstream_for(addr, Duration::from_secs(5));

    let message = Message::new("irc")
        .with_command("weather")
        .with_args(["london", "uk"])
        .with_dest("#chan");
    let reply = downstream.send(&message).await.unwrap();

    assert_eq!(reply.module, "gowon");
    assert_eq!(reply.dest, "#chan");
    assert_eq!(reply.msg, "weather done");

    let request = received.recv().await.unwrap();
    assert_eq!(request.method, "POST");
    assert_eq!(request.path, "/message");
    assert_eq!(request.content_type.as_deref(), Some("application/json"));
    assert_eq!(Message::decode(&request.body).unwrap(), message);
}

#[tokio::test]
async fn test_error_status_names_command() {
    let (addr, _received) = start_service().await;
    let downstream = downstream_for(addr, Duration::from_secs(5));

    let result = downstream
        .send(&Message::new("irc").with_command("fail"))
        .await;
    assert_eq!(
        result,
        Err(DownstreamError::Status {
            status: 500,
            command: "fail".to_string(),
        })
    );
}

#[tokio::test]
async fn test_non_message_reply_is_invalid() {
    let (addr, _received) = start_service().await;
    let downstream = downstream_for(addr, Duration::from_secs(5));

    let result = downstream
        .send(&Message::new("irc").with_command("garbage"))
        .await;
    assert!(matches!(result, Err(DownstreamError::InvalidResponse(_))));
}

#[tokio::test]
async fn test_slow_service_times_out() {
    let (addr, _received) = start_service().await;
    let downstream = downstream_for(addr, Duration::from_millis(200));

    let result = downstream
        .send(&Message::new("irc").with_command("slow"))
        .await;
    assert!(matches!(result, Err(DownstreamError::Transport(_))));
}

#[tokio::test]
async fn test_unreachable_service() {
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let downstream = downstream_for(addr, Duration::from_secs(1));

    let result = downstream.send(&Message::new("irc").with_command("x")).await;
    assert!(matches!(result, Err(DownstreamError::Transport(_))));
}
