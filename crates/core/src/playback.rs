use crate::engine::{
    Capability, SynthesisEngine, SynthesisVoice, Utterance, UtteranceEvent, UtteranceSink,
};
use crate::events::{EventBus, SessionEvent, SpeechSource};
use crate::lock;
use crate::types::VoiceProfile;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlaybackError {
    #[error("speech synthesis is not available")]
    Unavailable,
    #[error("speech synthesis error: {0}")]
    Synthesis(String),
    #[error("speech synthesis engine stopped reporting progress")]
    EngineGone,
}

/// How a `speak` call ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackOutcome {
    Completed,
    /// Interrupted by `cancel`, speaker mute, or a newer utterance.
    Cancelled,
    /// Speaker was muted; nothing was played.
    Muted,
}

struct InFlight {
    id: u64,
    started: bool,
    cancel: Option<oneshot::Sender<()>>,
}

#[derive(Default)]
struct PlaybackState {
    muted: bool,
    next_id: u64,
    current: Option<InFlight>,
}

/// Serializes text-to-speech so at most one utterance plays at a time.
///
/// Every `speech-start`/`speech-end` is emitted while the adapter state is locked, which
/// keeps the pair of one utterance strictly before the start of the next.
pub struct PlaybackAdapter {
    engine: Option<Arc<dyn SynthesisEngine>>,
    capability: Capability,
    events: EventBus,
    state: Mutex<PlaybackState>,
}

impl PlaybackAdapter {
    pub fn new(engine: Option<Arc<dyn SynthesisEngine>>, events: EventBus) -> Self {
        let capability = engine
            .as_ref()
            .map_or(Capability::Unsupported, |engine| engine.capability());
        if capability == Capability::Unsupported {
            tracing::warn!("Speech synthesis is not supported; playback is unavailable.");
        }
        Self {
            engine,
            capability,
            events,
            state: Mutex::new(PlaybackState::default()),
        }
    }

    pub fn capability(&self) -> Capability {
        self.capability
    }

    pub fn is_available(&self) -> bool {
        self.engine.is_some() && self.capability != Capability::Unsupported
    }

    pub fn is_muted(&self) -> bool {
        lock(&self.state).muted
    }

    pub fn is_speaking(&self) -> bool {
        lock(&self.state)
            .current
            .as_ref()
            .is_some_and(|current| current.started)
    }

    pub fn voices(&self) -> Vec<SynthesisVoice> {
        self.engine
            .as_ref()
            .map(|engine| engine.voices())
            .unwrap_or_default()
    }

    /// Speaks `text` with `profile`, replacing anything already playing.
    ///
    /// Resolves once the engine reports the end of this utterance, or as soon as it is
    /// cancelled.
    pub async fn speak(
        &self,
        text: &str,
        profile: &VoiceProfile,
    ) -> Result<PlaybackOutcome, PlaybackError> {
        self.begin(text, profile)?.finished().await
    }

    /// Hands the utterance to the engine without waiting for it to play.
    pub fn begin(
        &self,
        text: &str,
        profile: &VoiceProfile,
    ) -> Result<PendingUtterance<'_>, PlaybackError> {
        let Some(engine) = self.engine.clone().filter(|_| self.is_available()) else {
            return Err(PlaybackError::Unavailable);
        };

        let mut state = lock(&self.state);
        if state.muted {
            tracing::debug!("Speaker muted; skipping utterance.");
            return Ok(PendingUtterance {
                adapter: self,
                playing: None,
            });
        }
        self.cancel_locked(&mut state, engine.as_ref());

        let (event_tx, events) = mpsc::unbounded_channel();
        let (cancel_tx, cancelled) = oneshot::channel();
        let id = state.next_id;
        state.next_id += 1;
        let utterance = Utterance {
            text: text.to_string(),
            voice: select_voice(&engine.voices(), profile.voice.as_deref()),
            rate: profile.rate,
            pitch: profile.pitch,
            volume: profile.volume,
        };
        tracing::debug!(
            id,
            voice = ?utterance.voice.as_ref().map(|voice| &voice.name),
            rate = utterance.rate,
            "Dispatching utterance to synthesis engine."
        );
        state.current = Some(InFlight {
            id,
            started: false,
            cancel: Some(cancel_tx),
        });
        engine.speak(utterance, UtteranceSink::new(event_tx));

        Ok(PendingUtterance {
            adapter: self,
            playing: Some(Playing {
                id,
                events,
                cancelled,
            }),
        })
    }

    /// Stops the current utterance, if any.
    pub fn cancel(&self) {
        if let Some(engine) = &self.engine {
            let mut state = lock(&self.state);
            self.cancel_locked(&mut state, engine.as_ref());
        }
    }

    pub fn set_muted(&self, muted: bool) {
        let mut state = lock(&self.state);
        state.muted = muted;
        if muted {
            if let Some(engine) = &self.engine {
                self.cancel_locked(&mut state, engine.as_ref());
            }
        }
    }

    fn cancel_locked(&self, state: &mut PlaybackState, engine: &dyn SynthesisEngine) {
        let Some(mut current) = state.current.take() else {
            return;
        };
        tracing::debug!(id = current.id, "Cancelling utterance.");
        if let Some(cancel) = current.cancel.take() {
            let _ = cancel.send(());
        }
        engine.cancel();
        if current.started {
            self.events
                .emit(SessionEvent::SpeechEnd(SpeechSource::Playback));
        }
    }

    fn finish_locked(&self, state: &mut PlaybackState) {
        if let Some(current) = state.current.take() {
            if current.started {
                self.events
                    .emit(SessionEvent::SpeechEnd(SpeechSource::Playback));
            }
        }
    }
}

/// Exact name match against the available voices, else the first available voice.
pub fn select_voice(voices: &[SynthesisVoice], preferred: Option<&str>) -> Option<SynthesisVoice> {
    preferred
        .and_then(|name| voices.iter().find(|voice| voice.name == name))
        .or_else(|| voices.first())
        .cloned()
}

/// An utterance already handed to the engine.
pub struct PendingUtterance<'a> {
    adapter: &'a PlaybackAdapter,
    /// `None` when the speaker was muted and nothing was sent.
    playing: Option<Playing>,
}

struct Playing {
    id: u64,
    events: mpsc::UnboundedReceiver<UtteranceEvent>,
    cancelled: oneshot::Receiver<()>,
}

impl PendingUtterance<'_> {
    pub async fn finished(self) -> Result<PlaybackOutcome, PlaybackError> {
        let Some(Playing {
            id,
            mut events,
            mut cancelled,
        }) = self.playing
        else {
            return Ok(PlaybackOutcome::Muted);
        };
        let adapter = self.adapter;

        loop {
            tokio::select! {
                biased;
                _ = &mut cancelled => return Ok(PlaybackOutcome::Cancelled),
                event = events.recv() => {
                    let mut state = lock(&adapter.state);
                    let Some(current) = state.current.as_mut().filter(|current| current.id == id) else {
                        return Ok(PlaybackOutcome::Cancelled);
                    };
                    match event {
                        Some(UtteranceEvent::Start) => {
                            if !current.started {
                                current.started = true;
                                adapter.events.emit(SessionEvent::SpeechStart(SpeechSource::Playback));
                            }
                        }
                        Some(UtteranceEvent::End) => {
                            adapter.finish_locked(&mut state);
                            return Ok(PlaybackOutcome::Completed);
                        }
                        Some(UtteranceEvent::Error(reason)) => {
                            tracing::warn!(id, %reason, "Speech synthesis failed.");
                            adapter.finish_locked(&mut state);
                            return Err(PlaybackError::Synthesis(reason));
                        }
                        None => {
                            adapter.finish_locked(&mut state);
                            return Err(PlaybackError::EngineGone);
                        }
                    }
                }
            }
        }
    }
}
