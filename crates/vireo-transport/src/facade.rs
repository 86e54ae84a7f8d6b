//! The transport facade.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::radio::{Frame, Radio, RadioEvent, BROADCAST_ADDR};
use crate::{LinkState, Result, TransportError};

/// Facade tuning knobs.
#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// Minimum wall-clock interval between any two sends.
    pub min_send_interval: Duration,
    /// First reconnect delay; doubles per attempt.
    pub reconnect_base: Duration,
    /// Reconnect delay ceiling.
    pub reconnect_cap: Duration,
    /// Reconnect attempts before the transport gives up for good.
    pub reconnect_max_attempts: u32,
    /// Inbound frame buffer depth.
    pub frame_buffer: usize,
    /// Default reply-context lifetime.
    pub reply_context_ttl: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            min_send_interval: Duration::from_millis(3500),
            reconnect_base: Duration::from_secs(5),
            reconnect_cap: Duration::from_secs(300),
            reconnect_max_attempts: 10,
            frame_buffer: 256,
            reply_context_ttl: Duration::from_secs(300),
        }
    }
}

/// Context stashed against an outbound request id.
#[derive(Clone, Debug)]
struct ReplyContext {
    kind: String,
    data: serde_json::Value,
    expires_at: Instant,
}

/// A link ACK that arrived before anyone was waiting for it.
struct UnclaimedAck {
    delivered: bool,
    reason: String,
    arrived_at: Instant,
}

/// How long an unclaimed ACK stays claimable.
const UNCLAIMED_ACK_TTL: Duration = Duration::from_secs(120);

struct Inner {
    radio: Arc<dyn Radio>,
    config: TransportConfig,
    state: Mutex<LinkState>,
    /// Serializes sends and carries the pacing clock.
    pacing: tokio::sync::Mutex<Instant>,
    waiters: Mutex<HashMap<u32, oneshot::Sender<(bool, String)>>>,
    unclaimed: Mutex<HashMap<u32, UnclaimedAck>>,
    reply_contexts: Mutex<HashMap<u32, ReplyContext>>,
    fatal_tx: watch::Sender<bool>,
}

/// Shared handle to the transport facade.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

impl Transport {
    /// Start the facade over a radio adapter.
    ///
    /// Returns the handle, the inbound frame stream, and a watch that flips
    /// to `true` if the transport fails permanently.
    pub fn start(
        radio: Arc<dyn Radio>,
        config: TransportConfig,
    ) -> Result<(Transport, mpsc::Receiver<Frame>, watch::Receiver<bool>)> {
        let (event_tx, event_rx) = mpsc::channel::<RadioEvent>(config.frame_buffer);
        let (frame_tx, frame_rx) = mpsc::channel::<Frame>(config.frame_buffer);
        let (fatal_tx, fatal_rx) = watch::channel(false);

        // Pacing clock starts one interval in the past so the first send
        // leaves immediately.
        let pacing_start = Instant::now()
            .checked_sub(config.min_send_interval)
            .unwrap_or_else(Instant::now);

        let inner = Arc::new(Inner {
            radio,
            config,
            state: Mutex::new(LinkState::Connecting),
            pacing: tokio::sync::Mutex::new(pacing_start),
            waiters: Mutex::new(HashMap::new()),
            unclaimed: Mutex::new(HashMap::new()),
            reply_contexts: Mutex::new(HashMap::new()),
            fatal_tx,
        });

        inner.radio.start(event_tx)?;
        set_state(&inner, LinkState::Connected);
        info!("Transport connected");

        let transport = Transport {
            inner: inner.clone(),
        };
        tokio::spawn(event_pump(inner, event_rx, frame_tx));

        Ok((transport, frame_rx, fatal_rx))
    }

    /// Current link state.
    pub fn state(&self) -> LinkState {
        match self.inner.state.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Whether sends can proceed.
    pub fn connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    /// Our node identity, once the adapter knows it.
    pub fn node_id(&self) -> Option<String> {
        self.inner.radio.node_id()
    }

    /// Send a text datagram, honoring the pacing floor.
    ///
    /// Returns the adapter request id when an ACK was requested.
    pub async fn send_text(
        &self,
        text: &str,
        destination: &str,
        channel: u32,
        want_ack: bool,
    ) -> Result<Option<u32>> {
        if !self.connected() {
            return Err(TransportError::NotConnected);
        }

        // Holding the pacing lock across the sleep serializes all senders
        // at the radio, which is the global backpressure mechanism.
        let mut last_send = self.inner.pacing.lock().await;
        let elapsed = last_send.elapsed();
        if elapsed < self.inner.config.min_send_interval {
            let wait = self.inner.config.min_send_interval - elapsed;
            debug!("Pacing: waiting {}ms before send", wait.as_millis());
            tokio::time::sleep(wait).await;
        }

        if !self.connected() {
            return Err(TransportError::NotConnected);
        }

        let result = self
            .inner
            .radio
            .send_text(text, destination, channel, want_ack);
        *last_send = Instant::now();
        result
    }

    /// Send a direct message (channel 0, ACK requested).
    pub async fn send_dm(&self, text: &str, destination: &str) -> Result<Option<u32>> {
        self.send_text(text, destination, 0, true).await
    }

    /// Broadcast on a channel (no ACK possible).
    pub async fn send_broadcast(&self, text: &str, channel: u32) -> Result<()> {
        self.send_text(text, BROADCAST_ADDR, channel, false).await?;
        Ok(())
    }

    /// Send a direct message and wait for the per-hop link ACK.
    ///
    /// Returns `(delivered, reason)`; reason is empty on success. Protocol
    /// retry ladders key off the reason strings rather than errors.
    pub async fn send_dm_wait_ack(
        &self,
        text: &str,
        destination: &str,
        timeout: Duration,
    ) -> (bool, String) {
        let request_id = match self.send_dm(text, destination).await {
            Ok(Some(id)) => id,
            Ok(None) => return (false, "NO_REQUEST_ID".into()),
            Err(TransportError::NotConnected) => return (false, "NOT_CONNECTED".into()),
            Err(e) => return (false, e.to_string()),
        };

        // The ACK may already have been pumped before we got here.
        if let Some((delivered, reason)) = self.claim_unclaimed(request_id) {
            return (delivered, reason);
        }

        let (tx, rx) = oneshot::channel();
        lock(&self.inner.waiters).insert(request_id, tx);

        // Race again: the ACK could have landed between the check and the
        // waiter registration.
        if let Some((delivered, reason)) = self.claim_unclaimed(request_id) {
            lock(&self.inner.waiters).remove(&request_id);
            return (delivered, reason);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok((delivered, reason))) => (delivered, reason),
            Ok(Err(_)) => (false, "TRANSPORT_STOPPED".into()),
            Err(_) => {
                lock(&self.inner.waiters).remove(&request_id);
                warn!("ACK timeout for msg {request_id} to {destination}");
                (false, "TIMEOUT".into())
            }
        }
    }

    fn claim_unclaimed(&self, request_id: u32) -> Option<(bool, String)> {
        let mut unclaimed = lock(&self.inner.unclaimed);
        unclaimed
            .remove(&request_id)
            .map(|ack| (ack.delivered, ack.reason))
    }

    /// Stash context against a sent request id so a native reply to that
    /// frame can be interpreted later.
    pub fn set_reply_context(&self, request_id: u32, kind: &str, data: serde_json::Value) {
        let ttl = self.inner.config.reply_context_ttl;
        let mut contexts = lock(&self.inner.reply_contexts);
        contexts.insert(
            request_id,
            ReplyContext {
                kind: kind.to_string(),
                data,
                expires_at: Instant::now() + ttl,
            },
        );
        // Lazy expiry sweep.
        let now = Instant::now();
        contexts.retain(|_, ctx| ctx.expires_at > now);
    }

    /// Look up reply context by the inbound frame's reply-to id.
    ///
    /// Not consumed on read: several replies may target the same frame.
    pub fn get_reply_context(&self, reply_id: u32) -> Option<(String, serde_json::Value)> {
        let mut contexts = lock(&self.inner.reply_contexts);
        match contexts.get(&reply_id) {
            Some(ctx) if ctx.expires_at > Instant::now() => {
                Some((ctx.kind.clone(), ctx.data.clone()))
            }
            Some(_) => {
                contexts.remove(&reply_id);
                None
            }
            None => None,
        }
    }

    /// Tear down the transport.
    pub fn shutdown(&self) {
        set_state(&self.inner, LinkState::Disconnected);
        self.inner.radio.shutdown();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn set_state(inner: &Arc<Inner>, state: LinkState) {
    *lock(&inner.state) = state;
}

/// Pump adapter events into the facade: frames to the owner, ACKs to their
/// waiters, connection events to the reconnect machinery.
async fn event_pump(
    inner: Arc<Inner>,
    mut events: mpsc::Receiver<RadioEvent>,
    frames: mpsc::Sender<Frame>,
) {
    while let Some(event) = events.recv().await {
        match event {
            RadioEvent::Frame(frame) => {
                if frames.send(frame).await.is_err() {
                    // The engine is gone; stop pumping.
                    break;
                }
            }
            RadioEvent::LinkAck {
                request_id,
                delivered,
                reason,
            } => {
                let waiter = lock(&inner.waiters).remove(&request_id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send((delivered, reason));
                    }
                    None => {
                        let mut unclaimed = lock(&inner.unclaimed);
                        let now = Instant::now();
                        unclaimed.retain(|_, ack| now - ack.arrived_at < UNCLAIMED_ACK_TTL);
                        unclaimed.insert(
                            request_id,
                            UnclaimedAck {
                                delivered,
                                reason,
                                arrived_at: now,
                            },
                        );
                    }
                }
            }
            RadioEvent::Connected => {
                set_state(&inner, LinkState::Connected);
                info!("Radio connection established");
            }
            RadioEvent::Disconnected => {
                let already_reconnecting = {
                    let mut state = lock(&inner.state);
                    if *state == LinkState::Reconnecting {
                        true
                    } else {
                        *state = LinkState::Reconnecting;
                        false
                    }
                };
                warn!("Radio connection lost");
                if !already_reconnecting {
                    tokio::spawn(reconnect_loop(inner.clone()));
                }
            }
        }
    }
    debug!("Transport event pump stopped");
}

/// Reconnect with exponential backoff; fatal when attempts are exhausted.
async fn reconnect_loop(inner: Arc<Inner>) {
    let base = inner.config.reconnect_base;
    let cap = inner.config.reconnect_cap;
    let max_attempts = inner.config.reconnect_max_attempts;

    for attempt in 0..max_attempts {
        if *lock(&inner.state) == LinkState::Connected {
            return;
        }

        let delay = std::cmp::min(base * 2u32.saturating_pow(attempt), cap);
        info!(
            "Reconnect attempt {}/{max_attempts} in {}s",
            attempt + 1,
            delay.as_secs()
        );
        tokio::time::sleep(delay).await;

        match inner.radio.reconnect() {
            Ok(()) => {
                set_state(&inner, LinkState::Connected);
                info!("Reconnected to radio");
                return;
            }
            Err(e) => error!("Reconnect failed: {e}"),
        }
    }

    error!("Max reconnect attempts reached; transport stopped");
    set_state(&inner, LinkState::Disconnected);
    let _ = inner.fatal_tx.send(true);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockRadio;

    fn quick_config() -> TransportConfig {
        TransportConfig {
            min_send_interval: Duration::from_millis(3500),
            reconnect_base: Duration::from_millis(10),
            reconnect_cap: Duration::from_millis(50),
            reconnect_max_attempts: 3,
            ..TransportConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacing_floor_between_sends() {
        let radio = MockRadio::new();
        let (transport, _frames, _fatal) =
            Transport::start(radio.clone(), quick_config()).expect("start");

        let t0 = Instant::now();
        transport.send_dm("first", "!dest").await.expect("send");
        transport.send_dm("second", "!dest").await.expect("send");
        let elapsed = t0.elapsed();

        assert!(
            elapsed >= Duration::from_millis(3500),
            "second send departed after {elapsed:?}"
        );
        assert_eq!(radio.sent().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_ack_delivered() {
        let radio = MockRadio::new();
        radio.auto_ack(true);
        let (transport, _frames, _fatal) =
            Transport::start(radio.clone(), quick_config()).expect("start");

        let (delivered, reason) = transport
            .send_dm_wait_ack("MAILDAT|u|1/1|hi", "!dest", Duration::from_secs(30))
            .await;
        assert!(delivered, "reason: {reason}");
        assert!(reason.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_ack_nak() {
        let radio = MockRadio::new();
        radio.auto_ack(true);
        radio.fail_next_ack("MAX_RETRANSMIT");
        let (transport, _frames, _fatal) =
            Transport::start(radio.clone(), quick_config()).expect("start");

        let (delivered, reason) = transport
            .send_dm_wait_ack("chunk", "!dest", Duration::from_secs(30))
            .await;
        assert!(!delivered);
        assert_eq!(reason, "MAX_RETRANSMIT");
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_ack_timeout() {
        let radio = MockRadio::new();
        // No auto-ack: nothing ever answers.
        let (transport, _frames, _fatal) =
            Transport::start(radio.clone(), quick_config()).expect("start");

        let (delivered, reason) = transport
            .send_dm_wait_ack("chunk", "!dest", Duration::from_secs(5))
            .await;
        assert!(!delivered);
        assert_eq!(reason, "TIMEOUT");
    }

    #[tokio::test(start_paused = true)]
    async fn test_frames_reach_owner() {
        let radio = MockRadio::new();
        let (_transport, mut frames, _fatal) =
            Transport::start(radio.clone(), quick_config()).expect("start");

        radio.inject_frame("!peer1", "MAILREQ|u|a|ADV|c|MV51|1|1|ADV");
        let frame = frames.recv().await.expect("frame");
        assert_eq!(frame.from, "!peer1");
        assert!(frame.text.starts_with("MAILREQ|"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_exhaustion_is_fatal() {
        let radio = MockRadio::new();
        radio.refuse_reconnect(true);
        let (transport, _frames, mut fatal) =
            Transport::start(radio.clone(), quick_config()).expect("start");

        radio.drop_connection();
        // 3 attempts at 10/20/40ms (capped 50) then fatal.
        fatal.changed().await.expect("fatal signal");
        assert!(*fatal.borrow());
        assert_eq!(transport.state(), LinkState::Disconnected);
        assert!(matches!(
            transport.send_dm("late", "!dest").await,
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_recovers() {
        let radio = MockRadio::new();
        let (transport, _frames, _fatal) =
            Transport::start(radio.clone(), quick_config()).expect("start");

        radio.drop_connection();
        tokio::time::sleep(Duration::from_millis(1)).await;
        // First retry fires after 10ms and succeeds.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(transport.state(), LinkState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_context_roundtrip() {
        let radio = MockRadio::new();
        let (transport, _frames, _fatal) =
            Transport::start(radio.clone(), quick_config()).expect("start");

        transport.set_reply_context(42, "mail_read", serde_json::json!({"mail_id": 7}));
        let (kind, data) = transport.get_reply_context(42).expect("context");
        assert_eq!(kind, "mail_read");
        assert_eq!(data["mail_id"], 7);

        // Repeated reads are allowed.
        assert!(transport.get_reply_context(42).is_some());
        assert!(transport.get_reply_context(99).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_context_expires() {
        let radio = MockRadio::new();
        let config = TransportConfig {
            reply_context_ttl: Duration::from_secs(1),
            ..quick_config()
        };
        let (transport, _frames, _fatal) = Transport::start(radio, config).expect("start");

        transport.set_reply_context(42, "board_view", serde_json::json!({}));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(transport.get_reply_context(42).is_none());
    }
}
