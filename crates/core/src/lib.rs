//! Voice-session core of the tutoring companion.
//!
//! A [`CompanionSession`] owns a speech capture adapter, a speech playback adapter and a
//! tutor client, and publishes everything that happens during a call on an [`EventBus`].
//! Platform speech engines plug in through the traits in [`engine`].

pub mod backend;
pub mod capture;
pub mod engine;
pub mod error;
pub mod events;
pub mod history;
pub mod playback;
pub mod session;
pub mod transcript;
pub mod tutor;
pub mod types;

#[cfg(test)]
mod test_support;

pub use error::SessionError;
pub use events::{EventBus, EventKind, SessionEvent, SpeechSource, SubscriptionId};
pub use session::{CompanionSession, SessionBuilder, SessionOptions};
pub use transcript::{Transcript, TranscriptEntry};
pub use tutor::{Tutor, TutorClient, UpstreamError};
pub use types::{CallStatus, Role, SessionConfig, VoiceProfile};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks `mutex`, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
