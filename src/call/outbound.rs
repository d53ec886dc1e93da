//! Outbound audio: where synthesized speech for a call is delivered.
//!
//! The dialogue task only sees [`OutboundSink`]. In the server the sink is an
//! [`OutboundRouter`] that forwards to the media-stream actor which owns the
//! call's WebSocket.

use crate::synthesis::SpeechAudio;
use actix::prelude::*;
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::debug;

/// Synthesized reply for one call, delivered to its media stream.
#[derive(Debug, Clone, Message)]
#[rtype(result = "()")]
pub struct OutboundAudio {
    pub call_id: String,
    pub audio: SpeechAudio,
}

pub trait OutboundSink: Send + Sync {
    /// Deliver audio to the call. Returns false if the call has no live media channel.
    fn send(&self, call_id: &str, audio: SpeechAudio) -> bool;
}

/// Routes outbound audio to the actor registered for each call.
#[derive(Default)]
pub struct OutboundRouter {
    routes: RwLock<HashMap<String, Recipient<OutboundAudio>>>,
}

impl OutboundRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, call_id: &str, recipient: Recipient<OutboundAudio>) {
        self.routes.write().insert(call_id.to_string(), recipient);
    }

    pub fn unregister(&self, call_id: &str) {
        self.routes.write().remove(call_id);
    }

    /// Media streams that currently have a live call.
    pub fn len(&self) -> usize {
        self.routes.read().len()
    }
}

impl OutboundSink for OutboundRouter {
    fn send(&self, call_id: &str, audio: SpeechAudio) -> bool {
        let recipient = self.routes.read().get(call_id).cloned();
        match recipient {
            Some(recipient) if recipient.connected() => {
                recipient.do_send(OutboundAudio {
                    call_id: call_id.to_string(),
                    audio,
                });
                true
            }
            _ => {
                debug!(call_id = %call_id, "no media channel for outbound audio");
                false
            }
        }
    }
}

/// Collects outbound audio in memory for tests.
#[cfg(test)]
#[derive(Default)]
pub struct RecordingOutbound {
    sent: parking_lot::Mutex<Vec<(String, SpeechAudio)>>,
}

#[cfg(test)]
impl RecordingOutbound {
    pub fn sent(&self) -> Vec<(String, SpeechAudio)> {
        self.sent.lock().clone()
    }
}

#[cfg(test)]
impl OutboundSink for RecordingOutbound {
    fn send(&self, call_id: &str, audio: SpeechAudio) -> bool {
        self.sent.lock().push((call_id.to_string(), audio));
        true
    }
}
