use meshchat_shared::protocol::MediaSignal;
use meshchat_shared::{Envelope, PeerIdentity};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::capture::MediaStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Idle,
    OfferSent,
    OfferReceived,
    Connected,
    Closed,
}

/// Call signaling with one remote peer. Every (re)offer starts a new call
/// id; an answer for an older id is stale and ignored.
#[derive(Debug)]
pub struct CallSession {
    pub local_user: PeerIdentity,
    pub remote_user: PeerIdentity,
    pub call_id: String,
    pub state: SignalingState,
    pub local_stream: Option<MediaStream>,
    pub remote_stream: Option<MediaStream>,
}

impl CallSession {
    pub fn new(local_user: PeerIdentity, remote_user: PeerIdentity) -> Self {
        Self {
            local_user,
            remote_user,
            call_id: String::new(),
            state: SignalingState::Idle,
            local_stream: None,
            remote_stream: None,
        }
    }

    pub fn create_offer(&mut self, stream: &MediaStream) -> Envelope {
        self.call_id = Uuid::new_v4().to_string();
        self.local_stream = Some(stream.clone());
        self.state = SignalingState::OfferSent;
        debug!(
            remote = %self.remote_user.short(),
            call = %self.call_id,
            tracks = stream.tracks.len(),
            "Creating call offer"
        );

        Envelope::MediaOffer(MediaSignal {
            call_id: self.call_id.clone(),
            body: descriptor(Some(stream)),
        })
    }

    /// Answer the pending offer, attaching our outgoing stream if any.
    pub fn create_answer(&mut self, stream: Option<&MediaStream>) -> Envelope {
        self.local_stream = stream.cloned();
        self.state = SignalingState::Connected;
        debug!(remote = %self.remote_user.short(), call = %self.call_id, "Creating call answer");

        Envelope::MediaAnswer(MediaSignal {
            call_id: self.call_id.clone(),
            body: descriptor(stream),
        })
    }

    pub fn handle_signal(&mut self, envelope: &Envelope) -> SignalingAction {
        match envelope {
            Envelope::MediaOffer(signal) => {
                self.call_id = signal.call_id.clone();
                self.remote_stream = parse_stream(signal);
                self.state = SignalingState::OfferReceived;
                debug!(from = %self.remote_user.short(), call = %signal.call_id, "Received call offer");
                SignalingAction::CreateAnswer
            }
            Envelope::MediaAnswer(signal) => {
                if signal.call_id != self.call_id || self.state != SignalingState::OfferSent {
                    debug!(from = %self.remote_user.short(), call = %signal.call_id, "Ignoring stale answer");
                    return SignalingAction::Ignore;
                }
                self.remote_stream = parse_stream(signal);
                self.state = SignalingState::Connected;
                debug!(from = %self.remote_user.short(), call = %signal.call_id, "Received call answer");
                SignalingAction::SetRemoteStream
            }
            Envelope::MediaEnd(_) => {
                self.state = SignalingState::Closed;
                self.remote_stream = None;
                debug!(from = %self.remote_user.short(), "Received hangup");
                SignalingAction::Close
            }
            _ => SignalingAction::Ignore,
        }
    }

    pub fn hangup(&mut self) -> Envelope {
        self.state = SignalingState::Closed;
        self.local_stream = None;

        Envelope::MediaEnd(MediaSignal {
            call_id: self.call_id.clone(),
            body: Value::Null,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingAction {
    CreateAnswer,
    SetRemoteStream,
    Close,
    Ignore,
}

fn descriptor(stream: Option<&MediaStream>) -> Value {
    stream
        .and_then(|s| serde_json::to_value(s).ok())
        .unwrap_or(Value::Null)
}

fn parse_stream(signal: &MediaSignal) -> Option<MediaStream> {
    if signal.body.is_null() {
        return None;
    }
    match serde_json::from_value(signal.body.clone()) {
        Ok(stream) => Some(stream),
        Err(e) => {
            warn!(call = %signal.call_id, error = %e, "Malformed stream descriptor");
            None
        }
    }
}
