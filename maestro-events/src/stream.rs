//! ABOUTME: Stream adapters over bus subscriptions
//! ABOUTME: Wraps broadcast receivers for use with StreamExt consumers

use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

use crate::event::BusEvent;

/// Firehose stream over the bus broadcast channel.
///
/// Lagged receivers skip ahead; progress consumers tolerate reconnection
/// per the external-interface contract, so lag is surfaced as a skip, not
/// an error.
pub struct AllEventsStream {
    inner: BroadcastStream<BusEvent>,
}

impl AllEventsStream {
    pub fn new(receiver: tokio::sync::broadcast::Receiver<BusEvent>) -> Self {
        Self {
            inner: BroadcastStream::new(receiver),
        }
    }
}

impl Stream for AllEventsStream {
    type Item = BusEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(event))) => return Poll::Ready(Some(event)),
                Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(skipped)))) => {
                    tracing::debug!(skipped, "event stream lagged, skipping ahead");
                    continue;
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Stream over a pattern/execution subscription
pub struct SubscriptionStream {
    inner: mpsc::UnboundedReceiver<BusEvent>,
}

impl SubscriptionStream {
    pub fn new(receiver: mpsc::UnboundedReceiver<BusEvent>) -> Self {
        Self { inner: receiver }
    }
}

impl Stream for SubscriptionStream {
    type Item = BusEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_recv(cx)
    }
}
