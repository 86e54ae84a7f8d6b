//! Scriptable in-memory radio for tests.
//!
//! Records every send, can auto-answer link ACKs (with scripted failures),
//! and lets tests inject inbound frames and connection events.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;

use crate::radio::{Frame, Radio, RadioEvent};
use crate::{Result, TransportError};

/// A recorded outbound frame.
#[derive(Clone, Debug)]
pub struct SentFrame {
    pub text: String,
    pub destination: String,
    pub channel: u32,
    pub want_ack: bool,
}

#[derive(Default)]
struct MockState {
    events: Option<mpsc::Sender<RadioEvent>>,
    sent: Vec<SentFrame>,
    next_request_id: u32,
    auto_ack: bool,
    /// Scripted failure reasons consumed one per ACK-requesting send.
    ack_failures: VecDeque<String>,
    refuse_reconnect: bool,
    connected: bool,
}

/// The mock radio.
pub struct MockRadio {
    state: Mutex<MockState>,
}

impl MockRadio {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockState {
                next_request_id: 1,
                ..MockState::default()
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Auto-answer link ACKs for sends that request one.
    pub fn auto_ack(&self, enabled: bool) {
        self.lock().auto_ack = enabled;
    }

    /// Script the next ACK-requesting send to NAK with the given reason.
    pub fn fail_next_ack(&self, reason: &str) {
        self.lock().ack_failures.push_back(reason.to_string());
    }

    /// Make reconnect attempts fail.
    pub fn refuse_reconnect(&self, refuse: bool) {
        self.lock().refuse_reconnect = refuse;
    }

    /// Everything sent so far.
    pub fn sent(&self) -> Vec<SentFrame> {
        self.lock().sent.clone()
    }

    /// Sent frames whose text starts with the given prefix.
    pub fn sent_with_prefix(&self, prefix: &str) -> Vec<SentFrame> {
        self.lock()
            .sent
            .iter()
            .filter(|f| f.text.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Clear the send log.
    pub fn clear_sent(&self) {
        self.lock().sent.clear();
    }

    /// Deliver an inbound frame to the facade.
    pub fn inject_frame(&self, from: &str, text: &str) {
        self.inject_frame_on(from, text, 0, None);
    }

    /// Deliver an inbound frame with full addressing.
    pub fn inject_frame_on(&self, from: &str, text: &str, channel: u32, reply_id: Option<u32>) {
        let events = self.lock().events.clone();
        if let Some(events) = events {
            let _ = events.try_send(RadioEvent::Frame(Frame {
                from: from.to_string(),
                to: "!local".to_string(),
                text: text.to_string(),
                channel,
                reply_id,
            }));
        }
    }

    /// Simulate a dropped connection.
    pub fn drop_connection(&self) {
        let events = {
            let mut state = self.lock();
            state.connected = false;
            state.events.clone()
        };
        if let Some(events) = events {
            let _ = events.try_send(RadioEvent::Disconnected);
        }
    }
}

impl Radio for MockRadio {
    fn start(&self, events: mpsc::Sender<RadioEvent>) -> Result<()> {
        let mut state = self.lock();
        state.events = Some(events);
        state.connected = true;
        Ok(())
    }

    fn reconnect(&self) -> Result<()> {
        let mut state = self.lock();
        if state.refuse_reconnect {
            return Err(TransportError::Radio("mock reconnect refused".into()));
        }
        state.connected = true;
        Ok(())
    }

    fn shutdown(&self) {
        self.lock().connected = false;
    }

    fn send_text(
        &self,
        text: &str,
        destination: &str,
        channel: u32,
        want_ack: bool,
    ) -> Result<Option<u32>> {
        let mut state = self.lock();
        if !state.connected {
            return Err(TransportError::NotConnected);
        }

        state.sent.push(SentFrame {
            text: text.to_string(),
            destination: destination.to_string(),
            channel,
            want_ack,
        });

        if !want_ack {
            return Ok(None);
        }

        let request_id = state.next_request_id;
        state.next_request_id += 1;

        if state.auto_ack {
            let failure = state.ack_failures.pop_front();
            if let Some(events) = state.events.clone() {
                let ack = match failure {
                    Some(reason) => RadioEvent::LinkAck {
                        request_id,
                        delivered: false,
                        reason,
                    },
                    None => RadioEvent::LinkAck {
                        request_id,
                        delivered: true,
                        reason: String::new(),
                    },
                };
                let _ = events.try_send(ack);
            }
        }

        Ok(Some(request_id))
    }

    fn node_id(&self) -> Option<String> {
        Some("!local".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_sends() {
        let radio = MockRadio::new();
        let (tx, _rx) = mpsc::channel(8);
        radio.start(tx).expect("start");

        radio.send_text("hello", "!dest", 0, false).expect("send");
        radio.send_text("MAILREQ|x", "!dest", 0, true).expect("send");

        assert_eq!(radio.sent().len(), 2);
        assert_eq!(radio.sent_with_prefix("MAILREQ|").len(), 1);
    }

    #[test]
    fn test_disconnected_send_fails() {
        let radio = MockRadio::new();
        assert!(matches!(
            radio.send_text("x", "!dest", 0, false),
            Err(TransportError::NotConnected)
        ));
    }
}
