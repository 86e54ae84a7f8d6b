//! A stand-in radio for development runs without hardware.
//!
//! Accepts every send (acknowledging anything that asks) and never receives.
//! Useful for bringing a daemon up on a bench before a real adapter is
//! wired in.

use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::debug;

use crate::radio::{Radio, RadioEvent};
use crate::Result;

#[derive(Default)]
pub struct LoopbackRadio {
    events: Mutex<Option<mpsc::Sender<RadioEvent>>>,
    next_request_id: Mutex<u32>,
}

impl LoopbackRadio {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(None),
            next_request_id: Mutex::new(1),
        }
    }
}

impl Radio for LoopbackRadio {
    fn start(&self, events: mpsc::Sender<RadioEvent>) -> Result<()> {
        if let Ok(mut guard) = self.events.lock() {
            *guard = Some(events);
        }
        Ok(())
    }

    fn reconnect(&self) -> Result<()> {
        Ok(())
    }

    fn shutdown(&self) {}

    fn send_text(
        &self,
        text: &str,
        destination: &str,
        _channel: u32,
        want_ack: bool,
    ) -> Result<Option<u32>> {
        let preview: String = text.chars().take(50).collect();
        debug!("Loopback send to {destination}: {preview}");
        if !want_ack {
            return Ok(None);
        }

        let request_id = {
            let mut next = match self.next_request_id.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let id = *next;
            *next += 1;
            id
        };

        let events = match self.events.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        if let Some(events) = events {
            let _ = events.try_send(RadioEvent::LinkAck {
                request_id,
                delivered: true,
                reason: String::new(),
            });
        }
        Ok(Some(request_id))
    }

    fn node_id(&self) -> Option<String> {
        Some("!loopback".to_string())
    }
}
