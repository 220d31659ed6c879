//! # meshchat-core
//!
//! Session orchestration for a peer-to-peer chat node: chat state and its
//! reconciliation rules, typing indicator, completion-service bridge and
//! the [`Session`] object that drives the transport, media calls and
//! persistence for one local identity.

pub mod bot;
pub mod clock;
pub mod config;
pub mod events;
pub mod reconcile;
pub mod session;
pub mod state;
pub mod typing;

mod error;

use tracing_subscriber::{fmt, EnvFilter};

pub use bot::{BotProvider, ChatTurn, Completion, CompletionService, Role};
pub use config::SessionConfig;
pub use error::{CompletionError, SessionError};
pub use events::{NoticeLevel, SessionEvent, SessionEvents};
pub use reconcile::{
    plan_local, plan_remote, plan_send, Fanout, LocalAction, LocalPlan, Outcome, RemotePlan,
};
pub use session::Session;
pub use state::{Change, ChatState};
pub use typing::TypingDebouncer;

/// Install the global `tracing` subscriber. `RUST_LOG` overrides the
/// default filter. Calling it twice is harmless.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(
            "meshchat_core=debug,meshchat_net=debug,meshchat_media=info,meshchat_store=info,warn",
        )
    });

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();
}
