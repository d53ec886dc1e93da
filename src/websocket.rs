//! # Media Stream WebSocket
//!
//! The telephony leg connects to `/ws/media` and streams the call's audio as
//! JSON text frames. One connection carries one call.
//!
//! ## Protocol (JSON, `event` tag, camelCase fields):
//! - **Telephony → Server**:
//!   - `connected`: connection handshake, ignored
//!   - `start {callId, toNumber}`: a call has been answered
//!   - `media {callId, payload, encoding, sampleRate}`: base64 audio, default 8kHz μ-law
//!   - `stop {callId}`: end of the inbound stream
//!   - `mark {callId, name}`: playback acknowledgement, logged
//!   - `status {callId, status, durationSeconds}`: call status, same as `/call/status`
//! - **Server → Telephony**:
//!   - `media {callId, payload, encoding: "mulaw", sampleRate: 8000}`: 20ms of speech per frame
//!   - `mark {callId, name}`: sent after each reply
//!   - `error {message}`: the last event could not be processed
//!
//! ## Actor model:
//! Each connection is an actix actor. It translates protocol messages into
//! [`CallEvent`]s for the pipeline, and receives [`OutboundAudio`] from the
//! dialogue task through the [`OutboundRouter`](crate::call::OutboundRouter).

use crate::audio::resampler::TELEPHONY_SAMPLE_RATE;
use crate::audio::{AudioEncoding, AudioFrame, AudioResampler};
use crate::call::events::parse_status;
use crate::call::{CallEvent, OutboundAudio};
use crate::error::PipelineError;
use crate::state::AppState;
use crate::synthesis::SpeechAudio;
use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// 20ms of μ-law audio at 8kHz
const OUTBOUND_FRAME_BYTES: usize = 160;

/// Messages received from the telephony leg.
#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum InboundMessage {
    Connected {
        #[serde(default)]
        protocol: Option<String>,
    },
    Start {
        call_id: String,
        #[serde(default)]
        to_number: Option<String>,
    },
    Media {
        call_id: String,
        payload: String,
        #[serde(default)]
        encoding: Option<String>,
        #[serde(default)]
        sample_rate: Option<u32>,
    },
    Stop {
        call_id: String,
    },
    Mark {
        #[serde(default)]
        call_id: Option<String>,
        #[serde(default)]
        name: Option<String>,
    },
    Status {
        call_id: String,
        status: String,
        #[serde(default)]
        duration_seconds: Option<u64>,
    },
}

/// Messages sent back to the telephony leg.
#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum OutboundMessage {
    Media {
        call_id: String,
        payload: String,
        encoding: AudioEncoding,
        sample_rate: u32,
    },
    Mark {
        call_id: String,
        name: String,
    },
    Error {
        message: String,
    },
}

impl InboundMessage {
    /// Translate into a pipeline event. `connected` and `mark` carry none.
    fn into_event(self, default_rate: u32) -> Result<Option<CallEvent>, PipelineError> {
        let event = match self {
            InboundMessage::Connected { .. } | InboundMessage::Mark { .. } => return Ok(None),
            InboundMessage::Start { call_id, to_number } => CallEvent::Start { call_id, to_number },
            InboundMessage::Media {
                call_id,
                payload,
                encoding,
                sample_rate,
            } => {
                let encoding = match encoding {
                    Some(encoding) => encoding.parse::<AudioEncoding>()?,
                    None => AudioEncoding::Mulaw,
                };
                let frame = AudioFrame::from_base64(&payload, encoding, sample_rate.unwrap_or(default_rate))?;
                CallEvent::Media { call_id, frame }
            }
            InboundMessage::Stop { call_id } => CallEvent::Stop { call_id },
            InboundMessage::Status {
                call_id,
                status,
                duration_seconds,
            } => CallEvent::Status {
                call_id,
                status: parse_status(&status)?,
                duration_seconds,
            },
        };
        Ok(Some(event))
    }
}

/// Split synthesized speech into outbound telephony frames.
pub fn outbound_frames(call_id: &str, audio: &SpeechAudio, resampler: &AudioResampler) -> Vec<OutboundMessage> {
    let mulaw = resampler.encode_outbound(&audio.samples(), audio.sample_rate);
    mulaw
        .chunks(OUTBOUND_FRAME_BYTES)
        .map(|chunk| OutboundMessage::Media {
            call_id: call_id.to_string(),
            payload: STANDARD.encode(chunk),
            encoding: AudioEncoding::Mulaw,
            sample_rate: TELEPHONY_SAMPLE_RATE,
        })
        .collect()
}

/// One telephony media stream.
pub struct MediaStreamSocket {
    state: AppState,
    resampler: AudioResampler,
    default_rate: u32,
    call_id: Option<String>,
    replies_sent: u64,
    last_heartbeat: Instant,
}

impl MediaStreamSocket {
    pub fn new(state: AppState) -> Self {
        let default_rate = state.get_config().audio.inbound_sample_rate;
        let resampler = AudioResampler::new(state.get_config().audio.target_sample_rate);
        Self {
            state,
            resampler,
            default_rate,
            call_id: None,
            replies_sent: 0,
            last_heartbeat: Instant::now(),
        }
    }

    fn send(&self, ctx: &mut ws::WebsocketContext<Self>, message: &OutboundMessage) {
        match serde_json::to_string(message) {
            Ok(json) => ctx.text(json),
            Err(e) => error!("failed to serialize outbound message: {}", e),
        }
    }

    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, message: String) {
        self.send(ctx, &OutboundMessage::Error { message });
    }

    fn handle_text(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        let message = match serde_json::from_str::<InboundMessage>(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("unreadable media stream message: {}", e);
                self.send_error(ctx, format!("invalid message: {}", e));
                return;
            }
        };

        if let InboundMessage::Mark { call_id, name } = &message {
            debug!(call_id = ?call_id, mark = ?name, "playback mark");
        }

        let is_media = matches!(message, InboundMessage::Media { .. });
        let event = match message.into_event(self.default_rate) {
            Ok(Some(event)) => event,
            Ok(None) => return,
            Err(e) if is_media => {
                // Undecodable media is dropped; the stream carries on
                self.state.pipeline.metrics().record(|m| m.frames_dropped += 1);
                debug!(call_id = ?self.call_id, "media frame dropped: {}", e);
                return;
            }
            Err(e) => {
                warn!(call_id = ?self.call_id, "event rejected: {}", e);
                self.send_error(ctx, e.to_string());
                return;
            }
        };

        let starting = match &event {
            CallEvent::Start { call_id, .. } => Some(call_id.clone()),
            _ => None,
        };

        match self.state.pipeline.handle_event(event) {
            Ok(()) => {
                if let Some(call_id) = starting {
                    self.state
                        .outbound
                        .register(&call_id, ctx.address().recipient());
                    self.call_id = Some(call_id);
                }
            }
            Err(PipelineError::UnknownCallId(_)) => {}
            Err(e) => self.send_error(ctx, e.to_string()),
        }
    }
}

impl Actor for MediaStreamSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!("media stream connected");

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(call_id = ?act.call_id, "media stream heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        let Some(call_id) = self.call_id.take() else {
            info!("media stream closed before a call started");
            return;
        };
        info!(call_id = %call_id, replies = self.replies_sent, "media stream closed");

        self.state.outbound.unregister(&call_id);
        // The call itself ends with its terminal status; only the audio stops here
        if let Some(handle) = self.state.pipeline.registry().get(&call_id) {
            handle.end_stream();
        }
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for MediaStreamSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => self.handle_text(&text, ctx),
            Ok(ws::Message::Binary(_)) => {
                warn!(call_id = ?self.call_id, "binary frames are not part of the media protocol");
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(call_id = ?self.call_id, "media stream close: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(call_id = ?self.call_id, "media stream protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

impl Handler<OutboundAudio> for MediaStreamSocket {
    type Result = ();

    fn handle(&mut self, msg: OutboundAudio, ctx: &mut Self::Context) {
        let frames = outbound_frames(&msg.call_id, &msg.audio, &self.resampler);
        debug!(call_id = %msg.call_id, frames = frames.len(), "streaming reply audio");
        for frame in &frames {
            self.send(ctx, frame);
        }

        self.replies_sent += 1;
        let mark = OutboundMessage::Mark {
            call_id: msg.call_id,
            name: format!("reply-{}", self.replies_sent),
        };
        self.send(ctx, &mark);
    }
}

/// WebSocket endpoint handler for `/ws/media`.
pub async fn media_stream(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!("media stream connection request from {:?}", req.connection_info().peer_addr());
    ws::start(MediaStreamSocket::new(state.get_ref().clone()), &req, stream)
}
