//! Contracts for the platform speech engines.
//!
//! Engines report progress through the sink handed to `start`/`speak`. Control methods are
//! called while adapter state is locked: they must return promptly and must not call back
//! into the adapter. Reporting through a sink is always safe.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Result of probing a platform capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    Supported,
    Unsupported,
    /// Presence is only known once the engine is first started.
    UnknownUntilProbed,
}

/// Error returned by an engine control method. `class` follows the platform's error
/// vocabulary, e.g. "not-allowed" or "network".
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{class}")]
pub struct EngineError {
    pub class: String,
}

impl EngineError {
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
        }
    }
}

/// One hypothesis within a recognition result batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecognitionSegment {
    pub transcript: String,
    pub is_final: bool,
}

impl RecognitionSegment {
    pub fn final_text(transcript: impl Into<String>) -> Self {
        Self {
            transcript: transcript.into(),
            is_final: true,
        }
    }

    pub fn interim(transcript: impl Into<String>) -> Self {
        Self {
            transcript: transcript.into(),
            is_final: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionEvent {
    Start,
    End,
    Result(Vec<RecognitionSegment>),
    Error(String),
}

/// Where a recognition run reports its events. Each call to
/// [`RecognitionEngine::start`] gets a sink tagged with its own run number.
#[derive(Debug, Clone)]
pub struct RecognitionSink {
    run: u64,
    tx: mpsc::UnboundedSender<(u64, RecognitionEvent)>,
}

impl RecognitionSink {
    pub(crate) fn new(run: u64, tx: mpsc::UnboundedSender<(u64, RecognitionEvent)>) -> Self {
        Self { run, tx }
    }

    pub fn send(&self, event: RecognitionEvent) {
        // The adapter is gone; nothing is listening for this run anymore.
        let _ = self.tx.send((self.run, event));
    }

    pub fn started(&self) {
        self.send(RecognitionEvent::Start);
    }

    pub fn ended(&self) {
        self.send(RecognitionEvent::End);
    }

    pub fn result(&self, segments: Vec<RecognitionSegment>) {
        self.send(RecognitionEvent::Result(segments));
    }

    pub fn error(&self, class: impl Into<String>) {
        self.send(RecognitionEvent::Error(class.into()));
    }
}

/// A continuous, interim-results-enabled speech recognizer.
pub trait RecognitionEngine: Send + Sync {
    fn capability(&self) -> Capability {
        Capability::UnknownUntilProbed
    }

    /// Begins a recognition run reporting to `sink`.
    fn start(&self, sink: RecognitionSink) -> Result<(), EngineError>;

    /// Ends the current run. The engine may still report `End` for it afterwards.
    fn stop(&self);
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynthesisVoice {
    pub name: String,
    pub lang: String,
}

impl SynthesisVoice {
    pub fn new(name: impl Into<String>, lang: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            lang: lang.into(),
        }
    }
}

/// A fully resolved request to speak text.
#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    pub text: String,
    pub voice: Option<SynthesisVoice>,
    pub rate: f32,
    pub pitch: f32,
    pub volume: f32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UtteranceEvent {
    Start,
    End,
    Error(String),
}

/// Where one utterance reports its playback progress.
#[derive(Debug, Clone)]
pub struct UtteranceSink {
    tx: mpsc::UnboundedSender<UtteranceEvent>,
}

impl UtteranceSink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<UtteranceEvent>) -> Self {
        Self { tx }
    }

    pub fn started(&self) {
        let _ = self.tx.send(UtteranceEvent::Start);
    }

    pub fn finished(&self) {
        let _ = self.tx.send(UtteranceEvent::End);
    }

    pub fn failed(&self, reason: impl Into<String>) {
        let _ = self.tx.send(UtteranceEvent::Error(reason.into()));
    }
}

/// A text-to-speech engine playing at most one utterance at a time.
pub trait SynthesisEngine: Send + Sync {
    fn capability(&self) -> Capability {
        Capability::Supported
    }

    fn voices(&self) -> Vec<SynthesisVoice>;

    /// Queues `utterance` for playback, reporting to `sink`.
    fn speak(&self, utterance: Utterance, sink: UtteranceSink);

    /// Drops whatever is playing or queued.
    fn cancel(&self);
}
