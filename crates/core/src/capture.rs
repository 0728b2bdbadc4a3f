use crate::engine::{
    Capability, RecognitionEngine, RecognitionEvent, RecognitionSegment, RecognitionSink,
};
use crate::error::SessionError;
use crate::events::{EventBus, SessionEvent, SpeechSource};
use crate::lock;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Default pause before re-arming recognition after it ends on its own.
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaptureError {
    #[error("speech recognition is not supported on this platform")]
    Unsupported,
    #[error("speech recognition error: {class}")]
    Permission { class: String },
    #[error("speech recognition error: {class}")]
    Transient { class: String },
}

impl CaptureError {
    /// Maps a platform error class onto the capture error taxonomy.
    pub fn from_class(class: &str) -> Self {
        match class {
            "not-allowed" | "service-not-allowed" | "audio-capture" => CaptureError::Permission {
                class: class.to_string(),
            },
            "not-supported" => CaptureError::Unsupported,
            _ => CaptureError::Transient {
                class: class.to_string(),
            },
        }
    }

    pub fn is_fatal(&self) -> bool {
        !matches!(self, CaptureError::Transient { .. })
    }
}

/// A finalized utterance, tagged with the session that armed capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedUtterance {
    pub session: u64,
    pub text: String,
}

/// Invoked from the capture worker when recognition fails in a way that should end the call.
pub type FatalHandler = Box<dyn Fn(CaptureError) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct CaptureOptions {
    pub restart_delay: Duration,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            restart_delay: DEFAULT_RESTART_DELAY,
        }
    }
}

struct CaptureState {
    capability: Capability,
    /// The session wants to hear the user.
    listening: bool,
    muted: bool,
    session: u64,
    /// Number of the current recognition run. Events from older runs are stale.
    run: u64,
    /// `speech-start` was emitted for the current run and `speech-end` was not.
    running: bool,
}

struct CaptureShared {
    engine: Option<Arc<dyn RecognitionEngine>>,
    options: CaptureOptions,
    events: EventBus,
    utterances: mpsc::UnboundedSender<CapturedUtterance>,
    on_fatal: FatalHandler,
    engine_tx: mpsc::UnboundedSender<(u64, RecognitionEvent)>,
    state: Mutex<CaptureState>,
}

/// Turns a continuous recognition engine into finalized utterances.
pub struct CaptureAdapter {
    shared: Arc<CaptureShared>,
    worker: JoinHandle<()>,
}

impl CaptureAdapter {
    /// Must be called within a Tokio runtime; spawns the worker that consumes engine events.
    pub fn new(
        engine: Option<Arc<dyn RecognitionEngine>>,
        options: CaptureOptions,
        events: EventBus,
        utterances: mpsc::UnboundedSender<CapturedUtterance>,
        on_fatal: FatalHandler,
    ) -> Self {
        let capability = engine
            .as_ref()
            .map_or(Capability::Unsupported, |engine| engine.capability());
        if capability == Capability::Unsupported {
            tracing::warn!("Speech recognition is not supported; sessions will be text-only.");
        }

        let (engine_tx, engine_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(CaptureShared {
            engine,
            options,
            events,
            utterances,
            on_fatal,
            engine_tx,
            state: Mutex::new(CaptureState {
                capability,
                listening: false,
                muted: false,
                session: 0,
                run: 0,
                running: false,
            }),
        });
        let worker = tokio::spawn(run_worker(shared.clone(), engine_rx));
        Self { shared, worker }
    }

    pub fn capability(&self) -> Capability {
        lock(&self.shared.state).capability
    }

    pub fn is_listening(&self) -> bool {
        lock(&self.shared.state).listening
    }

    pub fn is_muted(&self) -> bool {
        lock(&self.shared.state).muted
    }

    /// Starts listening on behalf of `session`. Nothing reaches the engine while muted.
    pub fn arm(&self, session: u64) -> Result<(), CaptureError> {
        let shared = &self.shared;
        let Some(engine) = &shared.engine else {
            return Err(CaptureError::Unsupported);
        };
        let mut state = lock(&shared.state);
        if state.capability == Capability::Unsupported {
            return Err(CaptureError::Unsupported);
        }
        state.listening = true;
        state.session = session;
        if state.muted {
            tracing::debug!(session, "Capture armed while muted; engine stays idle.");
            return Ok(());
        }
        shared.start_run_locked(&mut state, engine.as_ref())
    }

    /// Stops listening and releases the engine.
    pub fn disarm(&self) {
        let shared = &self.shared;
        let mut state = lock(&shared.state);
        state.listening = false;
        shared.end_run_locked(&mut state);
    }

    /// Pauses or resumes capture. Resuming only restarts the engine while listening.
    pub fn set_muted(&self, muted: bool) -> Result<(), CaptureError> {
        let shared = &self.shared;
        let mut state = lock(&shared.state);
        if state.muted == muted {
            return Ok(());
        }
        state.muted = muted;
        if muted {
            shared.end_run_locked(&mut state);
            return Ok(());
        }
        match &shared.engine {
            Some(engine) if state.listening => shared.start_run_locked(&mut state, engine.as_ref()),
            _ => Ok(()),
        }
    }
}

impl Drop for CaptureAdapter {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

impl CaptureShared {
    fn start_run_locked(
        &self,
        state: &mut CaptureState,
        engine: &dyn RecognitionEngine,
    ) -> Result<(), CaptureError> {
        state.run += 1;
        state.running = false;
        let sink = RecognitionSink::new(state.run, self.engine_tx.clone());
        match engine.start(sink) {
            Ok(()) => {
                if state.capability == Capability::UnknownUntilProbed {
                    state.capability = Capability::Supported;
                }
                tracing::debug!(run = state.run, "Speech recognition started.");
                Ok(())
            }
            Err(err) => {
                let err = CaptureError::from_class(&err.class);
                if err == CaptureError::Unsupported {
                    state.capability = Capability::Unsupported;
                }
                if err.is_fatal() {
                    state.listening = false;
                }
                tracing::warn!(error = %err, "Failed to start speech recognition.");
                Err(err)
            }
        }
    }

    /// Invalidates the current run, closing its `speech-start` if one is open.
    fn end_run_locked(&self, state: &mut CaptureState) {
        state.run += 1;
        if state.running {
            state.running = false;
            self.events
                .emit(SessionEvent::SpeechEnd(SpeechSource::Capture));
        }
        if let Some(engine) = &self.engine {
            engine.stop();
        }
    }

    fn handle_event(self: &Arc<Self>, run: u64, event: RecognitionEvent) {
        match event {
            RecognitionEvent::Start => {
                let mut state = lock(&self.state);
                if run == state.run && !state.running {
                    state.running = true;
                    self.events
                        .emit(SessionEvent::SpeechStart(SpeechSource::Capture));
                }
            }
            RecognitionEvent::End => {
                let restart = {
                    let mut state = lock(&self.state);
                    if run != state.run {
                        return;
                    }
                    if state.running {
                        state.running = false;
                        self.events
                            .emit(SessionEvent::SpeechEnd(SpeechSource::Capture));
                    }
                    state.listening && !state.muted
                };
                if restart {
                    self.schedule_restart(run);
                }
            }
            RecognitionEvent::Result(segments) => {
                let state = lock(&self.state);
                if run != state.run || !state.listening || state.muted {
                    tracing::debug!(run, "Discarding recognition result outside an open run.");
                    return;
                }
                if let Some(text) = finalized_text(&segments) {
                    tracing::debug!(session = state.session, %text, "Finalized utterance.");
                    let utterance = CapturedUtterance {
                        session: state.session,
                        text,
                    };
                    if self.utterances.send(utterance).is_err() {
                        tracing::warn!("Utterance receiver dropped; discarding utterance.");
                    }
                }
            }
            RecognitionEvent::Error(class) => {
                let err = CaptureError::from_class(&class);
                if err.is_fatal() {
                    {
                        let mut state = lock(&self.state);
                        if run != state.run {
                            return;
                        }
                        if err == CaptureError::Unsupported {
                            state.capability = Capability::Unsupported;
                        }
                        state.listening = false;
                        self.end_run_locked(&mut state);
                    }
                    tracing::error!(error = %err, "Speech recognition failed fatally.");
                    (self.on_fatal)(err);
                } else {
                    tracing::warn!(error = %err, "Transient speech recognition error.");
                    self.events
                        .emit(SessionEvent::Error(SessionError::from(err)));
                }
            }
        }
    }

    fn schedule_restart(self: &Arc<Self>, run: u64) {
        let shared = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(shared.options.restart_delay).await;
            shared.restart_after(run);
        });
    }

    fn restart_after(&self, ended_run: u64) {
        let Some(engine) = &self.engine else {
            return;
        };
        let result = {
            let mut state = lock(&self.state);
            if state.run != ended_run || !state.listening || state.muted {
                return;
            }
            tracing::debug!(run = ended_run, "Re-arming speech recognition.");
            self.start_run_locked(&mut state, engine.as_ref())
        };
        match result {
            Ok(()) => {}
            Err(err) if err.is_fatal() => (self.on_fatal)(err),
            Err(err) => self
                .events
                .emit(SessionEvent::Error(SessionError::from(err))),
        }
    }
}

async fn run_worker(
    shared: Arc<CaptureShared>,
    mut engine_rx: mpsc::UnboundedReceiver<(u64, RecognitionEvent)>,
) {
    while let Some((run, event)) = engine_rx.recv().await {
        shared.handle_event(run, event);
    }
}

/// Concatenation of the final segments of a batch. Interim segments are dropped.
pub fn finalized_text(segments: &[RecognitionSegment]) -> Option<String> {
    let text: String = segments
        .iter()
        .filter(|segment| segment.is_final)
        .map(|segment| segment.transcript.as_str())
        .collect();
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}
