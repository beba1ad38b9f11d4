//! Request/reply correlation.
//!
//! Outgoing requests are tagged with a correlation id and the platform's
//! inbox route. The inbox task hands each reply to [`Correlator::resolve`],
//! which completes the matching pending request. Whichever of reply and
//! timeout removes the pending entry first wins; the other side finds
//! nothing and backs off, so every request resolves exactly once. A caller
//! that abandons its request withdraws the pending entry on drop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use mesh_core::clock::duration_millis;
use mesh_core::Envelope;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::bus::LocalBus;
use crate::config::RpcConfig;
use crate::error::RpcError;

enum ReplySlot {
    Single(oneshot::Sender<Envelope>),
    Batch(mpsc::UnboundedSender<Envelope>),
}

/// A waiting request. The ticket tells a reused correlation id apart from
/// the request that first held it.
struct Pending {
    ticket: u64,
    slot: ReplySlot,
}

/// Tracks requests waiting for a reply, keyed by correlation id.
pub struct Correlator {
    bus: Arc<LocalBus>,
    inbox: String,
    min_timeout: Duration,
    pending: DashMap<String, Pending>,
    tickets: AtomicU64,
}

/// Withdraws a request's pending entries when the request future ends,
/// however it ends.
struct Withdraw<'a> {
    correlator: &'a Correlator,
    ticket: u64,
    cids: Vec<String>,
}

impl Drop for Withdraw<'_> {
    fn drop(&mut self) {
        for cid in &self.cids {
            self.correlator.withdraw(cid, self.ticket);
        }
    }
}

fn new_cid() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Sequence number of a fork-join correlation id (`{base}-{n}`).
fn sequence(cid: &str) -> usize {
    cid.rsplit_once('-')
        .and_then(|(_, n)| n.parse().ok())
        .unwrap_or(usize::MAX)
}

impl Correlator {
    #[must_use]
    pub fn new(bus: Arc<LocalBus>, config: &RpcConfig) -> Self {
        Self {
            bus,
            inbox: config.inbox_route.clone(),
            min_timeout: config.min_timeout,
            pending: DashMap::new(),
            tickets: AtomicU64::new(1),
        }
    }

    /// Route replies are addressed to.
    #[must_use]
    pub fn inbox(&self) -> &str {
        &self.inbox
    }

    /// Requested timeout raised to the configured floor.
    #[must_use]
    pub fn effective_timeout(&self, timeout: Duration) -> Duration {
        timeout.max(self.min_timeout)
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn next_ticket(&self) -> u64 {
        self.tickets.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers `slot` under the preferred id, or a fresh one if that id is
    /// already waiting.
    fn claim(&self, preferred: Option<&str>, ticket: u64, slot: ReplySlot) -> String {
        let mut cid = preferred.map_or_else(new_cid, ToString::to_string);
        loop {
            match self.pending.entry(cid) {
                Entry::Vacant(vacant) => {
                    let key = vacant.key().clone();
                    vacant.insert(Pending { ticket, slot });
                    return key;
                }
                Entry::Occupied(_) => cid = new_cid(),
            }
        }
    }

    /// Removes the entry for `cid` if it still belongs to `ticket`.
    fn withdraw(&self, cid: &str, ticket: u64) -> bool {
        self.pending
            .remove_if(cid, |_, pending| pending.ticket == ticket)
            .is_some()
    }

    fn address(&self, event: &mut Envelope, cid: String, timeout: Duration) {
        event.correlation_id = Some(cid);
        event.reply_to = Some(self.inbox.clone());
        event.rpc_timeout_ms = Some(millis(timeout));
    }

    /// Sends `event` and waits for its reply.
    ///
    /// The caller's correlation id is kept unless another request is already
    /// waiting on it.
    ///
    /// # Errors
    ///
    /// - `RpcError::Timeout` if no reply arrives within the timeout.
    /// - `RpcError::Failed` if the reply carries an error status.
    /// - `RpcError::Send` if the destination route is unknown.
    pub async fn request(
        &self,
        mut event: Envelope,
        timeout: Duration,
    ) -> Result<Envelope, RpcError> {
        let timeout = self.effective_timeout(timeout);
        let ticket = self.next_ticket();
        let (tx, mut rx) = oneshot::channel();
        let cid = self.claim(event.correlation_id.as_deref(), ticket, ReplySlot::Single(tx));
        let _withdraw = Withdraw {
            correlator: self,
            ticket,
            cids: vec![cid.clone()],
        };
        self.address(&mut event, cid.clone(), timeout);

        let started = Instant::now();
        self.bus.send_event(&event)?;

        let reply = match tokio::time::timeout(timeout, &mut rx).await {
            Ok(reply) => reply.map_err(|_| RpcError::Cancelled)?,
            Err(_) => {
                if self.withdraw(&cid, ticket) {
                    return Err(self.timed_out(event.to.as_deref(), timeout));
                }
                // The reply won the race and is already in the channel.
                rx.await.map_err(|_| RpcError::Cancelled)?
            }
        };
        settle(reply, started)
    }

    /// Sends every event in parallel under one shared deadline.
    ///
    /// Replies are returned in request order. When the deadline passes with
    /// some replies outstanding, the ones received are returned.
    ///
    /// # Errors
    ///
    /// - `RpcError::Timeout` if no reply at all arrived in time.
    /// - `RpcError::Send` if any event could not be sent; nothing is awaited.
    pub async fn request_all(
        &self,
        events: Vec<Envelope>,
        timeout: Duration,
    ) -> Result<Vec<Envelope>, RpcError> {
        if events.is_empty() {
            return Ok(Vec::new());
        }
        let timeout = self.effective_timeout(timeout);
        let base = new_cid();
        let ticket = self.next_ticket();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut batch = Withdraw {
            correlator: self,
            ticket,
            cids: Vec::with_capacity(events.len()),
        };

        let started = Instant::now();
        for (n, mut event) in events.into_iter().enumerate() {
            let preferred = format!("{base}-{}", n + 1);
            let cid = self.claim(Some(&preferred), ticket, ReplySlot::Batch(tx.clone()));
            batch.cids.push(cid.clone());
            self.address(&mut event, cid, timeout);
            self.bus.send_event(&event)?;
        }
        // Only the pending entries hold senders from here on.
        drop(tx);

        let expected = batch.cids.len();
        let deadline = tokio::time::Instant::now() + timeout;
        let mut replies = Vec::with_capacity(expected);
        while replies.len() < expected {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(reply)) => replies.push(reply),
                Ok(None) => break,
                Err(_) => {
                    for cid in &batch.cids {
                        self.withdraw(cid, ticket);
                    }
                    while let Some(reply) = rx.recv().await {
                        replies.push(reply);
                    }
                    break;
                }
            }
        }

        if replies.is_empty() {
            return Err(self.timed_out(None, timeout));
        }
        if replies.len() < expected {
            tracing::warn!(
                received = replies.len(),
                expected,
                "fork-join completed with partial results"
            );
        }

        let round_trip = duration_millis(started.elapsed());
        replies.sort_by_key(|reply| sequence(reply.correlation_id.as_deref().unwrap_or("")));
        for reply in &mut replies {
            reply.round_trip_ms = Some(round_trip);
        }
        Ok(replies)
    }

    fn timed_out(&self, route: Option<&str>, timeout: Duration) -> RpcError {
        let route = route.unwrap_or("fork-join").to_string();
        metrics::counter!("mesh_rpc_timeouts_total", "route" => route).increment(1);
        RpcError::Timeout {
            timeout_ms: millis(timeout),
        }
    }

    /// Completes the request waiting on the reply's correlation id.
    ///
    /// Returns `false` for replies nobody is waiting on any more; those are
    /// discarded.
    pub fn resolve(&self, reply: Envelope) -> bool {
        let Some(cid) = reply.correlation_id.as_deref() else {
            tracing::debug!(id = %reply.id, "reply without correlation id discarded");
            return false;
        };
        let Some((cid, Pending { slot, .. })) = self.pending.remove(cid) else {
            tracing::debug!(cid, "late reply discarded");
            return false;
        };
        let sent = match slot {
            ReplySlot::Single(tx) => tx.send(reply).is_ok(),
            ReplySlot::Batch(tx) => tx.send(reply).is_ok(),
        };
        if !sent {
            tracing::debug!(cid = %cid, "requester gone, reply discarded");
        }
        sent
    }

    /// Drops every pending request. Waiters see `RpcError::Cancelled`.
    pub fn cancel_all(&self) {
        self.pending.clear();
    }
}

fn settle(mut reply: Envelope, started: Instant) -> Result<Envelope, RpcError> {
    if reply.is_error() {
        return Err(RpcError::Failed {
            status: reply.status_or_ok(),
            message: reply
                .error_message()
                .unwrap_or_else(|| format!("Request failed with status {}", reply.status_or_ok())),
        });
    }
    reply.round_trip_ms = Some(duration_millis(started.elapsed()));
    Ok(reply)
}

/// Drains the inbox route, resolving each reply.
pub(crate) async fn run_inbox(
    correlator: Arc<Correlator>,
    mut intake: mpsc::UnboundedReceiver<Bytes>,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = stop.cancelled() => break,
            next = intake.recv() => match next {
                Some(bytes) => match Envelope::from_bytes(&bytes) {
                    Ok(reply) => {
                        correlator.resolve(reply);
                    }
                    Err(e) => tracing::error!("Unable to decode reply - {e}"),
                },
                None => break,
            },
        }
    }
    correlator.cancel_all();
}
