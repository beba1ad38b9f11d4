//! Out-of-band publishing of streamed handler results.
//!
//! A streaming handler's caller gets an immediate reply naming a stream id.
//! Frames are buffered under that id until a [`StreamConsumer`] attaches.
//! The stream expires after its time-to-live; an unread stream is then
//! discarded and a running publisher is disposed.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::{FutureExt, StreamExt};
use mesh_core::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::classify::{classify, panic_error};
use super::handler::ReplyStream;
use crate::error::AppError;

/// Message sent to a consumer when the stream outlives its time-to-live.
pub const STREAM_EXPIRED: &str = "Event stream expired";

/// Message reported when the publisher stops without an end-of-stream.
pub const STREAM_ABORTED: &str = "Event stream closed before completion";

/// One element of a published stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
    Data(Value),
    Error { status: u16, message: String },
    Eof,
}

// ---------------------------------------------------------------------------
// StreamRegistry
// ---------------------------------------------------------------------------

/// Streams waiting for a consumer, keyed by stream id.
#[derive(Debug)]
pub struct StreamRegistry {
    pending: Arc<DashMap<String, mpsc::Receiver<StreamFrame>>>,
    buffer: usize,
}

impl StreamRegistry {
    #[must_use]
    pub fn new(buffer: usize) -> Self {
        Self {
            pending: Arc::new(DashMap::new()),
            buffer: buffer.max(1),
        }
    }

    /// Creates a stream that is discarded after `ttl` unless attached.
    ///
    /// Returns the stream id and the publishing side.
    pub fn open(&self, ttl: Duration) -> (String, mpsc::Sender<StreamFrame>) {
        let id = format!("{}.stream", uuid::Uuid::new_v4().simple());
        let (tx, rx) = mpsc::channel(self.buffer);
        self.pending.insert(id.clone(), rx);

        let pending = Arc::clone(&self.pending);
        let expired = id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            if pending.remove(&expired).is_some() {
                tracing::debug!(stream = %expired, "unread stream discarded");
            }
        });
        (id, tx)
    }

    /// Takes the stream for reading. A stream can be attached once.
    #[must_use]
    pub fn attach(&self, id: &str) -> Option<StreamConsumer> {
        self.pending.remove(id).map(|(id, rx)| StreamConsumer {
            id,
            rx,
            done: false,
        })
    }

    /// Streams not yet attached.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

// ---------------------------------------------------------------------------
// StreamConsumer
// ---------------------------------------------------------------------------

/// Reading side of a published stream.
#[derive(Debug)]
pub struct StreamConsumer {
    id: String,
    rx: mpsc::Receiver<StreamFrame>,
    done: bool,
}

impl StreamConsumer {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Next element. `None` after end-of-stream or after an error.
    ///
    /// A publisher that goes away without sending end-of-stream yields a
    /// 500 error, so a cut-short stream never reads as complete.
    pub async fn next(&mut self) -> Option<Result<Value, AppError>> {
        if self.done {
            return None;
        }
        let frame = self.rx.recv().await;
        if !matches!(frame, Some(StreamFrame::Data(_))) {
            self.done = true;
        }
        match frame {
            Some(StreamFrame::Data(value)) => Some(Ok(value)),
            Some(StreamFrame::Error { status, message }) => Some(Err(AppError::new(status, message))),
            Some(StreamFrame::Eof) => None,
            None => Some(Err(AppError::new(500, STREAM_ABORTED))),
        }
    }

    /// Reads the remaining elements.
    ///
    /// # Errors
    ///
    /// Returns the error frame if the stream failed or expired.
    pub async fn read_all(mut self) -> Result<Vec<Value>, AppError> {
        let mut values = Vec::new();
        while let Some(item) = self.next().await {
            values.push(item?);
        }
        Ok(values)
    }
}

// ---------------------------------------------------------------------------
// Publishing
// ---------------------------------------------------------------------------

/// Drives `stream` into `tx` until it ends, fails, or `deadline` passes.
///
/// On expiry the source is dropped and the consumer gets a 408 frame. A
/// consumer going away also disposes the source.
pub(crate) async fn publish(
    route: &str,
    stream_id: &str,
    mut stream: ReplyStream,
    tx: mpsc::Sender<StreamFrame>,
    deadline: Instant,
) {
    let expired = || {
        tracing::warn!(route, stream = stream_id, "stream publisher expired");
        let _ = tx.try_send(StreamFrame::Error {
            status: 408,
            message: STREAM_EXPIRED.to_string(),
        });
    };

    loop {
        let next = tokio::select! {
            biased;
            () = tokio::time::sleep_until(deadline) => {
                expired();
                return;
            }
            item = AssertUnwindSafe(stream.next()).catch_unwind() => item,
        };

        let frame = match next {
            Ok(Some(Ok(value))) => StreamFrame::Data(value),
            Ok(Some(Err(e))) => {
                let classified = classify(&e);
                StreamFrame::Error {
                    status: classified.status,
                    message: classified.message,
                }
            }
            Ok(None) => StreamFrame::Eof,
            Err(panic) => {
                let classified = classify(&panic_error(panic.as_ref()));
                tracing::error!(
                    route,
                    stream = stream_id,
                    "stream failed - {}",
                    classified.message
                );
                StreamFrame::Error {
                    status: classified.status,
                    message: classified.message,
                }
            }
        };
        let terminal = !matches!(frame, StreamFrame::Data(_));

        match tokio::time::timeout_at(deadline, tx.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                tracing::debug!(route, stream = stream_id, "stream consumer gone");
                return;
            }
            Err(_) => {
                expired();
                return;
            }
        }
        if terminal {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use futures_util::stream;

    use super::*;

    fn values(n: i64) -> ReplyStream {
        stream::iter((0..n).map(|i| Ok(Value::Int(i)))).boxed()
    }

    #[tokio::test]
    async fn published_values_reach_consumer() {
        let registry = StreamRegistry::new(16);
        let (id, tx) = registry.open(Duration::from_secs(5));
        assert!(id.ends_with(".stream"));

        publish("a.b", &id, values(3), tx, Instant::now() + Duration::from_secs(5)).await;

        let consumer = registry.attach(&id).unwrap();
        assert_eq!(consumer.id(), id);
        let read = consumer.read_all().await.unwrap();
        assert_eq!(read, vec![Value::Int(0), Value::Int(1), Value::Int(2)]);
        assert!(registry.attach(&id).is_none());
    }

    #[tokio::test]
    async fn stream_error_ends_consumer_with_status() {
        let registry = StreamRegistry::new(16);
        let (id, tx) = registry.open(Duration::from_secs(5));
        let failing = stream::iter(vec![
            Ok(Value::Int(1)),
            Err(AppError::validation("bad element")),
            Ok(Value::Int(2)),
        ])
        .boxed();

        publish("a.b", &id, failing, tx, Instant::now() + Duration::from_secs(5)).await;

        let mut consumer = registry.attach(&id).unwrap();
        assert_eq!(consumer.next().await.unwrap().unwrap(), Value::Int(1));
        let err = consumer.next().await.unwrap().unwrap_err();
        assert!(matches!(err, AppError::Application { status: 400, .. }));
        assert!(consumer.next().await.is_none());
    }

    #[tokio::test]
    async fn panicking_stream_ends_with_500() {
        let registry = StreamRegistry::new(16);
        let (id, tx) = registry.open(Duration::from_secs(5));
        let panicking = stream::iter(1..=3)
            .map(|i| {
                if i == 3 {
                    panic!("stream boom");
                }
                Ok::<_, AppError>(Value::Int(i))
            })
            .boxed();

        publish("a.b", &id, panicking, tx, Instant::now() + Duration::from_secs(5)).await;

        let mut consumer = registry.attach(&id).unwrap();
        assert_eq!(consumer.next().await.unwrap().unwrap(), Value::Int(1));
        assert_eq!(consumer.next().await.unwrap().unwrap(), Value::Int(2));
        let err = consumer.next().await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            AppError::Application { status: 500, ref message } if message.contains("stream boom")
        ));
        assert!(consumer.next().await.is_none());
    }

    #[tokio::test]
    async fn publisher_gone_without_eof_is_an_error() {
        let registry = StreamRegistry::new(4);
        let (id, tx) = registry.open(Duration::from_secs(5));
        tx.send(StreamFrame::Data(Value::Int(1))).await.unwrap();
        drop(tx);

        let err = registry.attach(&id).unwrap().read_all().await.unwrap_err();
        assert!(matches!(
            err,
            AppError::Application { status: 500, ref message } if message == STREAM_ABORTED
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn endless_stream_expires_with_408() {
        let registry = StreamRegistry::new(16);
        let (id, tx) = registry.open(Duration::from_secs(60));
        let mut consumer = registry.attach(&id).unwrap();

        let endless = stream::pending::<Result<Value, AppError>>().boxed();
        let deadline = Instant::now() + Duration::from_millis(500);
        let publisher = tokio::spawn(async move {
            publish("a.b", "s", endless, tx, deadline).await;
        });

        let err = consumer.next().await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            AppError::Application { status: 408, ref message } if message == STREAM_EXPIRED
        ));
        publisher.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn unread_stream_is_discarded_after_ttl() {
        let registry = StreamRegistry::new(4);
        let (_id, _tx) = registry.open(Duration::from_secs(1));
        assert_eq!(registry.len(), 1);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn dropped_consumer_stops_publisher() {
        let registry = StreamRegistry::new(1);
        let (id, tx) = registry.open(Duration::from_secs(5));
        drop(registry.attach(&id));

        // Would block forever on a full buffer if the closed channel went unnoticed.
        publish("a.b", &id, values(100), tx, Instant::now() + Duration::from_secs(5)).await;
    }
}
