//! Capture-device boundary.
//!
//! Hardware access (microphone, camera, screen) lives outside this crate;
//! the manager only sees [`Track`] handles obtained through
//! [`CaptureDevices`]. Streams travel between peers as descriptors.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::{self, BoxFuture};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("No {0} device available")]
    NoDevice(TrackKind),

    #[error("Permission to capture {0} denied")]
    PermissionDenied(TrackKind),

    #[error("{0} capture error: {1}")]
    Capture(TrackKind, String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
    Screen,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
            TrackKind::Screen => "screen",
        })
    }
}

/// A live capture track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    pub id: String,
    pub kind: TrackKind,
    pub label: String,
}

impl Track {
    pub fn new(kind: TrackKind, label: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            label: label.into(),
        }
    }
}

/// A bundle of tracks offered to a peer in one call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaStream {
    pub id: String,
    pub tracks: Vec<Track>,
}

impl MediaStream {
    pub fn new(tracks: Vec<Track>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tracks,
        }
    }

    pub fn has(&self, kind: TrackKind) -> bool {
        self.tracks.iter().any(|t| t.kind == kind)
    }
}

pub trait CaptureDevices: Send {
    /// Request one capture track. The future may sit on a permission prompt
    /// for as long as it likes; it owns everything it needs and can be
    /// awaited (or dropped) away from the devices.
    fn acquire(&self, kind: TrackKind) -> BoxFuture<'static, Result<Track, MediaError>>;

    /// Stop a track previously returned by [`CaptureDevices::acquire`].
    fn release(&mut self, track: &Track);
}

#[derive(Debug, Default)]
struct Script {
    denied: HashSet<TrackKind>,
    hung: HashSet<TrackKind>,
    live: Vec<Track>,
    acquisitions: usize,
}

/// Scripted devices for tests and headless runs. Clones share state, so a
/// test can keep a handle after moving one into a manager.
#[derive(Debug, Clone, Default)]
pub struct ScriptedDevices {
    script: Arc<Mutex<Script>>,
}

impl ScriptedDevices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every later acquisition of `kind` with `PermissionDenied`.
    pub fn deny(&self, kind: TrackKind) {
        self.lock().denied.insert(kind);
    }

    pub fn allow(&self, kind: TrackKind) {
        self.lock().denied.remove(&kind);
    }

    /// Later acquisitions of `kind` never resolve, like a prompt nobody
    /// answers.
    pub fn hang(&self, kind: TrackKind) {
        self.lock().hung.insert(kind);
    }

    pub fn resume(&self, kind: TrackKind) {
        self.lock().hung.remove(&kind);
    }

    /// Tracks acquired and not yet released.
    pub fn live_tracks(&self) -> Vec<Track> {
        self.lock().live.clone()
    }

    pub fn acquisitions(&self) -> usize {
        self.lock().acquisitions
    }

    fn lock(&self) -> MutexGuard<'_, Script> {
        lock(&self.script)
    }
}

fn lock(script: &Mutex<Script>) -> MutexGuard<'_, Script> {
    script.lock().unwrap_or_else(PoisonError::into_inner)
}

impl CaptureDevices for ScriptedDevices {
    fn acquire(&self, kind: TrackKind) -> BoxFuture<'static, Result<Track, MediaError>> {
        let script = Arc::clone(&self.script);
        let hung = {
            let mut guard = lock(&script);
            guard.acquisitions += 1;
            guard.hung.contains(&kind)
        };
        if hung {
            debug!(kind = %kind, "Scripted capture prompt left unanswered");
            return future::pending().boxed();
        }
        async move {
            let mut guard = lock(&script);
            if guard.denied.contains(&kind) {
                return Err(MediaError::PermissionDenied(kind));
            }
            let track = Track::new(kind, format!("scripted {kind}"));
            guard.live.push(track.clone());
            debug!(kind = %kind, track = %track.id, "Scripted capture started");
            Ok(track)
        }
        .boxed()
    }

    fn release(&mut self, track: &Track) {
        self.lock().live.retain(|t| t.id != track.id);
        debug!(kind = %track.kind, track = %track.id, "Scripted capture stopped");
    }
}
