//! Subscriptions and the table used to route incoming PUBLISH packets

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::Stream;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::protocol::QoS;
use crate::topic::topic_matches_filter;

/// A message received from the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: Arc<str>,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// Stream of messages matching one topic filter
///
/// The stream ends when the client is dropped or the filter is
/// unsubscribed. Dropping the subscription stops delivery; the filter is
/// left out of the next resubscribe.
#[derive(Debug)]
pub struct Subscription {
    filter: String,
    rx: mpsc::UnboundedReceiver<InboundMessage>,
}

impl Subscription {
    /// Create a subscription fed by the returned sender
    pub fn channel(filter: impl Into<String>) -> (mpsc::UnboundedSender<InboundMessage>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            tx,
            Self {
                filter: filter.into(),
                rx,
            },
        )
    }

    pub fn filter(&self) -> &str {
        &self.filter
    }

    /// Receive the next message, or `None` once the stream has ended
    pub async fn recv(&mut self) -> Option<InboundMessage> {
        self.rx.recv().await
    }
}

impl Stream for Subscription {
    type Item = InboundMessage;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

struct Entry {
    filter: String,
    qos: QoS,
    tx: mpsc::UnboundedSender<InboundMessage>,
}

/// Live subscriptions, shared between the client handle and its connection task
#[derive(Default)]
pub(crate) struct SubscriptionTable {
    entries: RwLock<Vec<Entry>>,
}

impl SubscriptionTable {
    pub fn insert(&self, filter: &str, qos: QoS) -> Subscription {
        let (tx, subscription) = Subscription::channel(filter);
        self.entries.write().push(Entry {
            filter: filter.to_string(),
            qos,
            tx,
        });
        subscription
    }

    /// Remove every subscription on `filter`, ending their streams
    pub fn remove(&self, filter: &str) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|e| e.filter != filter);
        entries.len() != before
    }

    /// Distinct filters with live receivers, at the highest requested QoS
    pub fn filters(&self) -> Vec<(String, QoS)> {
        let mut entries = self.entries.write();
        entries.retain(|e| !e.tx.is_closed());

        let mut filters: Vec<(String, QoS)> = Vec::with_capacity(entries.len());
        for entry in entries.iter() {
            match filters.iter_mut().find(|(f, _)| *f == entry.filter) {
                Some((_, qos)) => *qos = (*qos).max(entry.qos),
                None => filters.push((entry.filter.clone(), entry.qos)),
            }
        }
        filters
    }

    /// Deliver to every matching subscription. Returns false if none took it.
    pub fn dispatch(&self, message: &InboundMessage) -> bool {
        let mut delivered = false;
        let mut closed = false;

        for entry in self.entries.read().iter() {
            if !topic_matches_filter(&message.topic, &entry.filter) {
                continue;
            }
            if entry.tx.send(message.clone()).is_ok() {
                delivered = true;
            } else {
                closed = true;
            }
        }

        if closed {
            self.entries.write().retain(|e| !e.tx.is_closed());
        }
        delivered
    }
}
