//! The session orchestrator.
//!
//! `CompanionSession` drives one tutoring call at a time through
//! INACTIVE → CONNECTING → ACTIVE → FINISHED, wiring finalized captured speech and typed
//! text into serialized conversation turns.
//!
//! Locking: the state lock is always taken before the capture or playback locks, never
//! after. Every event that must be ordered relative to `call-end` is pushed onto the bus
//! while the state lock is held.

use crate::capture::{CaptureAdapter, CaptureError, CaptureOptions, CapturedUtterance};
use crate::engine::{Capability, RecognitionEngine, SynthesisEngine, SynthesisVoice};
use crate::error::SessionError;
use crate::events::{EventBus, SessionEvent, TranscriptMessage};
use crate::history::{NoopHistory, SessionHistory};
use crate::lock;
use crate::playback::{PlaybackAdapter, PlaybackError, PendingUtterance};
use crate::transcript::{Transcript, TranscriptEntry};
use crate::tutor::Tutor;
use crate::types::{CallStatus, Role, SessionConfig, VoiceProfile};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const DEFAULT_OPENING_LINE: &str =
    "Hello, let's start the session. Today we'll be talking about {topic}.";

/// Library-level tunables of a session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub capture_restart_delay: Duration,
    /// Spoken when a call starts. `{topic}` is substituted.
    pub opening_line: String,
    /// Initial voice profile; rate, pitch and volume persist across calls.
    pub voice: VoiceProfile,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            capture_restart_delay: crate::capture::DEFAULT_RESTART_DELAY,
            opening_line: DEFAULT_OPENING_LINE.to_string(),
            voice: VoiceProfile::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TurnSource {
    Typed,
    Captured,
}

struct SessionState {
    status: CallStatus,
    /// Bumped whenever a call starts or ends. Work tagged with an older epoch is stale.
    epoch: u64,
    config: Option<SessionConfig>,
    transcript: Transcript,
    voice: VoiceProfile,
}

struct Inner {
    events: EventBus,
    capture: CaptureAdapter,
    playback: PlaybackAdapter,
    tutor: Arc<dyn Tutor>,
    history: Arc<dyn SessionHistory>,
    options: SessionOptions,
    state: Mutex<SessionState>,
    /// Held for the whole of a turn; Tokio's mutex queues waiters in FIFO order.
    turn_lock: tokio::sync::Mutex<()>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

pub struct SessionBuilder {
    tutor: Arc<dyn Tutor>,
    recognition: Option<Arc<dyn RecognitionEngine>>,
    synthesis: Option<Arc<dyn SynthesisEngine>>,
    history: Arc<dyn SessionHistory>,
    options: SessionOptions,
}

impl SessionBuilder {
    pub fn recognition(mut self, engine: Arc<dyn RecognitionEngine>) -> Self {
        self.recognition = Some(engine);
        self
    }

    pub fn synthesis(mut self, engine: Arc<dyn SynthesisEngine>) -> Self {
        self.synthesis = Some(engine);
        self
    }

    pub fn history(mut self, history: Arc<dyn SessionHistory>) -> Self {
        self.history = history;
        self
    }

    pub fn options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }

    /// Must be called within a Tokio runtime.
    pub fn build(self) -> CompanionSession {
        let SessionBuilder {
            tutor,
            recognition,
            synthesis,
            history,
            mut options,
        } = self;
        options.voice = options.voice.clamped();

        let events = EventBus::new();
        let (utterance_tx, utterance_rx) = mpsc::unbounded_channel();
        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let on_fatal = {
                let weak = weak.clone();
                Box::new(move |err: CaptureError| {
                    if let Some(inner) = weak.upgrade() {
                        inner.fail(SessionError::from(err));
                    }
                })
            };
            let capture = CaptureAdapter::new(
                recognition,
                CaptureOptions {
                    restart_delay: options.capture_restart_delay,
                },
                events.clone(),
                utterance_tx,
                on_fatal,
            );
            let playback = PlaybackAdapter::new(synthesis, events.clone());
            Inner {
                events,
                capture,
                playback,
                tutor,
                history,
                state: Mutex::new(SessionState {
                    status: CallStatus::Inactive,
                    epoch: 0,
                    config: None,
                    transcript: Transcript::new(),
                    voice: options.voice.clone(),
                }),
                options,
                turn_lock: tokio::sync::Mutex::new(()),
                driver: Mutex::new(None),
            }
        });

        let driver = tokio::spawn(drive_captured_turns(Arc::downgrade(&inner), utterance_rx));
        *lock(&inner.driver) = Some(driver);
        CompanionSession { inner }
    }
}

/// Handle to a voice tutoring session. Clones share the same session.
#[derive(Clone)]
pub struct CompanionSession {
    inner: Arc<Inner>,
}

impl CompanionSession {
    pub fn builder(tutor: Arc<dyn Tutor>) -> SessionBuilder {
        SessionBuilder {
            tutor,
            recognition: None,
            synthesis: None,
            history: Arc::new(NoopHistory),
            options: SessionOptions::default(),
        }
    }

    /// Starts a call and speaks the opening line.
    ///
    /// Returns once the opening line has finished playing (not merely been dispatched) and
    /// capture is armed, with the session ACTIVE. Until then the session is CONNECTING and
    /// `send_text` fails with `InvalidState`. If `stop` is called meanwhile, returns `Ok`
    /// with the session FINISHED.
    pub async fn start(&self, config: SessionConfig) -> Result<(), SessionError> {
        let inner = &self.inner;
        let (epoch, opening) = {
            let mut state = lock(&inner.state);
            if matches!(state.status, CallStatus::Connecting | CallStatus::Active) {
                return Err(SessionError::InvalidState(state.status));
            }
            if !inner.playback.is_available() {
                state.status = CallStatus::Finished;
                let err = SessionError::Startup("speech synthesis is not available".to_string());
                tracing::error!(error = %err, "Cannot start session.");
                inner.events.emit(SessionEvent::Error(err.clone()));
                return Err(err);
            }

            state.status = CallStatus::Connecting;
            state.epoch += 1;
            state.transcript.clear();
            if let Some(voice) = config.voice.as_deref() {
                state.voice = state.voice.clone().with_voice(voice).clamped();
            }
            inner.playback.set_muted(false);
            if let Err(err) = inner.capture.set_muted(false) {
                tracing::warn!(error = %err, "Failed to reset microphone mute.");
            }
            tracing::info!(
                companion_id = %config.companion_id,
                subject = %config.subject,
                topic = %config.topic,
                "Starting tutoring session."
            );

            let opening_line = inner.options.opening_line.replace("{topic}", &config.topic);
            state.config = Some(config);
            inner.events.emit(SessionEvent::CallStart);
            let entry = state.transcript.append(Role::Assistant, opening_line.clone());
            inner
                .events
                .emit(SessionEvent::Message(TranscriptMessage::from(&entry)));
            let opening = inner.playback.begin(&opening_line, &state.voice);
            (state.epoch, opening)
        };

        inner.await_playback(epoch, opening).await;

        let mut state = lock(&inner.state);
        if state.epoch != epoch || state.status != CallStatus::Connecting {
            tracing::debug!("Session ended before capture was armed.");
            return Ok(());
        }
        match inner.capture.arm(epoch) {
            Ok(()) => {}
            Err(CaptureError::Unsupported) => {
                tracing::warn!("Speech recognition unavailable; continuing text-only.");
            }
            Err(err) => {
                let err = SessionError::from(err);
                tracing::error!(error = %err, "Failed to arm speech capture.");
                inner.events.emit(SessionEvent::Error(err.clone()));
                let ended = inner.finish_locked(&mut state);
                drop(state);
                inner.notify_history(ended);
                return Err(err);
            }
        }
        state.status = CallStatus::Active;
        tracing::info!(epoch, "Session active.");
        Ok(())
    }

    /// Ends the call. Always legal; repeated calls are no-ops.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Runs one typed conversation turn.
    ///
    /// Only precondition violations are returned. Failures inside the turn are published
    /// as `error` events and leave the session ACTIVE.
    pub async fn send_text(&self, message: &str) -> Result<(), SessionError> {
        let text = message.trim();
        if text.is_empty() {
            return Err(SessionError::InvalidInput);
        }
        let epoch = {
            let state = lock(&self.inner.state);
            if state.status != CallStatus::Active {
                return Err(SessionError::InvalidState(state.status));
            }
            state.epoch
        };
        self.inner
            .run_turn(text.to_string(), epoch, TurnSource::Typed)
            .await;
        Ok(())
    }

    /// Pauses or resumes the microphone.
    pub fn set_muted(&self, muted: bool) {
        tracing::info!(muted, "Microphone mute changed.");
        if let Err(err) = self.inner.capture.set_muted(muted) {
            let err = SessionError::from(err);
            if err.is_fatal() {
                self.inner.fail(err);
            } else {
                self.inner.events.emit(SessionEvent::Error(err));
            }
        }
    }

    /// Muting cancels any utterance in progress.
    pub fn set_speaker_muted(&self, muted: bool) {
        tracing::info!(muted, "Speaker mute changed.");
        self.inner.playback.set_muted(muted);
    }

    /// Replaces the voice profile used for subsequent utterances.
    pub fn update_voice_settings(&self, profile: VoiceProfile) {
        let profile = profile.clamped();
        let mut state = lock(&self.inner.state);
        tracing::info!(
            voice = ?profile.voice,
            rate = profile.rate,
            pitch = profile.pitch,
            volume = profile.volume,
            "Voice settings updated."
        );
        state.voice = profile.clone();
        self.inner
            .events
            .emit(SessionEvent::VoiceSettingsUpdated(profile));
    }

    pub fn status(&self) -> CallStatus {
        lock(&self.inner.state).status
    }

    pub fn is_muted(&self) -> bool {
        self.inner.capture.is_muted()
    }

    pub fn is_speaker_muted(&self) -> bool {
        self.inner.playback.is_muted()
    }

    pub fn voice_settings(&self) -> VoiceProfile {
        lock(&self.inner.state).voice.clone()
    }

    pub fn config(&self) -> Option<SessionConfig> {
        lock(&self.inner.state).config.clone()
    }

    pub fn transcript(&self) -> Vec<TranscriptEntry> {
        lock(&self.inner.state).transcript.entries().to_vec()
    }

    /// Empties the transcript without ending the call.
    pub fn clear_history(&self) {
        lock(&self.inner.state).transcript.clear();
    }

    pub fn voices(&self) -> Vec<SynthesisVoice> {
        self.inner.playback.voices()
    }

    pub fn capture_capability(&self) -> Capability {
        self.inner.capture.capability()
    }

    pub fn playback_capability(&self) -> Capability {
        self.inner.playback.capability()
    }

    /// Subscribe and unsubscribe through this handle.
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Stops the call and tears down the background turn driver.
    pub fn shutdown(&self) {
        self.inner.stop();
        if let Some(driver) = lock(&self.inner.driver).take() {
            driver.abort();
        }
    }
}

impl Inner {
    fn stop(&self) {
        let ended = {
            let mut state = lock(&self.state);
            self.finish_locked(&mut state)
        };
        self.notify_history(ended);
    }

    /// Publishes a fatal error and ends the call.
    fn fail(&self, err: SessionError) {
        let ended = {
            let mut state = lock(&self.state);
            if !matches!(state.status, CallStatus::Connecting | CallStatus::Active) {
                tracing::debug!(error = %err, "Ignoring failure for a session that already ended.");
                return;
            }
            tracing::error!(error = %err, "Ending session after fatal error.");
            self.events.emit(SessionEvent::Error(err));
            self.finish_locked(&mut state)
        };
        self.notify_history(ended);
    }

    /// Moves to FINISHED. Returns the companion id if a live call was ended.
    fn finish_locked(&self, state: &mut SessionState) -> Option<String> {
        let live = matches!(state.status, CallStatus::Connecting | CallStatus::Active);
        state.status = CallStatus::Finished;
        if !live {
            return None;
        }
        state.epoch += 1;
        self.capture.disarm();
        self.playback.cancel();
        self.events.emit(SessionEvent::CallEnd);
        tracing::info!(turns = state.transcript.len(), "Session finished.");
        state
            .config
            .as_ref()
            .map(|config| config.companion_id.clone())
    }

    fn notify_history(&self, companion_id: Option<String>) {
        let Some(companion_id) = companion_id else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(%companion_id, "No runtime available; session history not updated.");
            return;
        };
        let history = self.history.clone();
        runtime.spawn(async move {
            if let Err(err) = history.session_ended(&companion_id).await {
                tracing::warn!(%companion_id, error = ?err, "Failed to update session history.");
            }
        });
    }

    fn is_current(state: &SessionState, epoch: u64) -> bool {
        state.epoch == epoch
            && matches!(state.status, CallStatus::Connecting | CallStatus::Active)
    }

    /// Publishes a per-turn error unless the call it belongs to is over.
    fn report(&self, epoch: u64, err: SessionError) {
        let state = lock(&self.state);
        if Self::is_current(&state, epoch) {
            self.events.emit(SessionEvent::Error(err));
        }
    }

    async fn await_playback(
        &self,
        epoch: u64,
        pending: Result<PendingUtterance<'_>, PlaybackError>,
    ) {
        let result = match pending {
            Ok(pending) => pending.finished().await,
            Err(err) => Err(err),
        };
        match result {
            Ok(outcome) => tracing::debug!(?outcome, "Utterance finished."),
            Err(err) => {
                tracing::warn!(error = %err, "Playback failed.");
                self.report(epoch, SessionError::from(err));
            }
        }
    }

    async fn run_turn(&self, text: String, epoch: u64, source: TurnSource) {
        let _turn = self.turn_lock.lock().await;

        let (config, history) = {
            let mut state = lock(&self.state);
            if state.epoch != epoch || state.status != CallStatus::Active {
                tracing::debug!(%text, "Dropping turn for a session that is no longer active.");
                return;
            }
            // Speech queued behind an earlier turn may outlive a mute.
            if source == TurnSource::Captured && self.capture.is_muted() {
                tracing::debug!(%text, "Dropping captured speech; microphone is muted.");
                return;
            }
            let Some(config) = state.config.clone() else {
                return;
            };
            let history = state.transcript.entries().to_vec();
            let entry = state.transcript.append(Role::User, text.clone());
            self.events
                .emit(SessionEvent::Message(TranscriptMessage::from(&entry)));
            (config, history)
        };

        let reply = self.tutor.get_reply(&text, &config, &history).await;

        let reply = {
            let mut state = lock(&self.state);
            if !Self::is_current(&state, epoch) {
                tracing::debug!("Discarding tutor reply for a session that has ended.");
                return;
            }
            match reply {
                Ok(reply) => {
                    let entry = state.transcript.append(Role::Assistant, reply.clone());
                    self.events
                        .emit(SessionEvent::Message(TranscriptMessage::from(&entry)));
                    self.playback.begin(&reply, &state.voice)
                }
                Err(err) => {
                    tracing::warn!(error = %err, "Tutor reply failed.");
                    self.events
                        .emit(SessionEvent::Error(SessionError::from(err)));
                    return;
                }
            }
        };

        self.await_playback(epoch, reply).await;
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(driver) = lock(&self.driver).take() {
            driver.abort();
        }
    }
}

async fn drive_captured_turns(
    inner: Weak<Inner>,
    mut utterances: mpsc::UnboundedReceiver<CapturedUtterance>,
) {
    while let Some(utterance) = utterances.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner
            .run_turn(utterance.text, utterance.session, TurnSource::Captured)
            .await;
    }
    tracing::debug!("Captured turn driver stopped.");
}
