// Call control for live audio/video over peer links: capture-device
// boundary, per-peer signaling and the media session manager.

pub mod capture;
pub mod manager;
pub mod signaling;

pub use capture::{CaptureDevices, MediaError, MediaStream, ScriptedDevices, Track, TrackKind};
pub use manager::{
    CaptureOutcome, CaptureRequest, CaptureState, MediaCallState, MediaEvent, MediaSessionManager,
    Outbound, Toggle,
};
pub use signaling::{CallSession, SignalingAction, SignalingState};
