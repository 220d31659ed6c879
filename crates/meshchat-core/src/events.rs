use tokio::sync::mpsc;

use meshchat_media::MediaEvent;
use meshchat_shared::{ConnectionStatus, Message, PeerIdentity};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// Everything a UI shell needs to react to. Delivered in the order the
/// session produced it.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// User-visible notification.
    Notice { level: NoticeLevel, text: String },
    StatusChanged(ConnectionStatus),
    PeerConnected(PeerIdentity),
    PeerDisconnected(PeerIdentity),
    /// A message received from the mesh (local sends are returned directly).
    MessageReceived(Message),
    /// Chat state changed; re-read [`crate::Session::state`].
    StateChanged,
    Media(MediaEvent),
}

pub type SessionEvents = mpsc::UnboundedReceiver<SessionEvent>;

/// Sending half of the event channel. A dropped receiver is not an error:
/// the session keeps running headless.
#[derive(Debug, Clone)]
pub(crate) struct EventSink {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl EventSink {
    pub(crate) fn channel() -> (Self, SessionEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("Event receiver dropped");
        }
    }

    pub(crate) fn notice(&self, level: NoticeLevel, text: impl Into<String>) {
        self.emit(SessionEvent::Notice {
            level,
            text: text.into(),
        });
    }
}
