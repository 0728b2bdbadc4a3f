//! In-memory engines and collaborators for unit tests.

use crate::engine::{
    Capability, EngineError, RecognitionEngine, RecognitionSegment, RecognitionSink,
    SynthesisEngine, SynthesisVoice, Utterance, UtteranceSink,
};
use crate::events::{EventBus, SessionEvent};
use crate::history::SessionHistory;
use crate::transcript::TranscriptEntry;
use crate::tutor::{Tutor, UpstreamError};
use crate::types::SessionConfig;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

const WAIT_TIMEOUT: Duration = Duration::from_secs(2);
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Polls `condition` until it holds, panicking after a timeout.
pub async fn eventually(condition: impl Fn() -> bool) {
    tokio::time::timeout(WAIT_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    })
    .await
    .expect("condition not met in time");
}

/// Records every event published on a bus.
#[derive(Clone)]
pub struct EventLog {
    events: Arc<Mutex<Vec<SessionEvent>>>,
}

impl EventLog {
    pub fn attach(bus: &EventBus) -> Self {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        bus.subscribe_all(move |event| sink.lock().unwrap().push(event.clone()));
        Self { events }
    }

    pub fn events(&self) -> Vec<SessionEvent> {
        self.events.lock().unwrap().clone()
    }

    pub async fn wait_for(&self, predicate: impl Fn(&SessionEvent) -> bool) {
        self.wait_for_count(predicate, 1).await;
    }

    pub async fn wait_for_count(&self, predicate: impl Fn(&SessionEvent) -> bool, count: usize) {
        let events = self.events.clone();
        tokio::time::timeout(WAIT_TIMEOUT, async move {
            loop {
                let seen = events
                    .lock()
                    .unwrap()
                    .iter()
                    .filter(|event| predicate(*event))
                    .count();
                if seen >= count {
                    return;
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        })
        .await
        .expect("expected event was not published in time");
    }
}

/// Recognition engine driven by the test. Reports `Start` as soon as it is started and
/// `End` as soon as it is stopped.
pub struct FakeRecognizer {
    capability: Capability,
    sink: Mutex<Option<RecognitionSink>>,
    refuse_next: Mutex<Option<String>>,
    starts: AtomicUsize,
    stops: AtomicUsize,
}

impl FakeRecognizer {
    fn with_capability(capability: Capability) -> Self {
        Self {
            capability,
            sink: Mutex::new(None),
            refuse_next: Mutex::new(None),
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
        }
    }

    pub fn supported() -> Self {
        Self::with_capability(Capability::Supported)
    }

    pub fn unprobed() -> Self {
        Self::with_capability(Capability::UnknownUntilProbed)
    }

    pub fn unsupported() -> Self {
        Self::with_capability(Capability::Unsupported)
    }

    /// Makes the next `start` fail with `class`.
    pub fn refuse_next_start(&self, class: &str) {
        *self.refuse_next.lock().unwrap() = Some(class.to_string());
    }

    pub fn current_sink(&self) -> Option<RecognitionSink> {
        self.sink.lock().unwrap().clone()
    }

    pub fn say(&self, text: &str) {
        self.send_segments(vec![RecognitionSegment::final_text(text)]);
    }

    pub fn interim(&self, text: &str) {
        self.send_segments(vec![RecognitionSegment::interim(text)]);
    }

    fn send_segments(&self, segments: Vec<RecognitionSegment>) {
        if let Some(sink) = self.current_sink() {
            sink.result(segments);
        }
    }

    pub fn fail(&self, class: &str) {
        if let Some(sink) = self.current_sink() {
            sink.error(class);
        }
    }

    /// Ends the current run as if the platform timed out on silence.
    pub fn end_naturally(&self) {
        if let Some(sink) = self.sink.lock().unwrap().take() {
            sink.ended();
        }
    }

    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl RecognitionEngine for FakeRecognizer {
    fn capability(&self) -> Capability {
        self.capability
    }

    fn start(&self, sink: RecognitionSink) -> Result<(), EngineError> {
        if let Some(class) = self.refuse_next.lock().unwrap().take() {
            return Err(EngineError::new(class));
        }
        self.starts.fetch_add(1, Ordering::SeqCst);
        sink.started();
        *self.sink.lock().unwrap() = Some(sink);
        Ok(())
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        if let Some(sink) = self.sink.lock().unwrap().take() {
            sink.ended();
        }
    }
}

/// Synthesis engine that either finishes every utterance at once (`auto`) or holds it
/// until [`FakeSynthesizer::finish_pending`] (`manual`).
pub struct FakeSynthesizer {
    voices: Vec<SynthesisVoice>,
    manual: bool,
    spoken: Mutex<Vec<Utterance>>,
    pending: Mutex<Option<UtteranceSink>>,
    fail_next: Mutex<Option<String>>,
    cancels: AtomicUsize,
}

impl FakeSynthesizer {
    fn new(voices: Vec<SynthesisVoice>, manual: bool) -> Self {
        Self {
            voices,
            manual,
            spoken: Mutex::new(Vec::new()),
            pending: Mutex::new(None),
            fail_next: Mutex::new(None),
            cancels: AtomicUsize::new(0),
        }
    }

    fn default_voices() -> Vec<SynthesisVoice> {
        vec![
            SynthesisVoice::new("Alex", "en-US"),
            SynthesisVoice::new("Samantha", "en-US"),
        ]
    }

    pub fn auto(voices: Vec<SynthesisVoice>) -> Self {
        Self::new(voices, false)
    }

    pub fn manual(voices: Vec<SynthesisVoice>) -> Self {
        Self::new(voices, true)
    }

    pub fn auto_default() -> Self {
        Self::auto(Self::default_voices())
    }

    pub fn manual_default() -> Self {
        Self::manual(Self::default_voices())
    }

    pub fn fail_next(&self, reason: &str) {
        *self.fail_next.lock().unwrap() = Some(reason.to_string());
    }

    pub fn finish_pending(&self) {
        if let Some(sink) = self.pending.lock().unwrap().take() {
            sink.finished();
        }
    }

    pub fn spoken(&self) -> Vec<Utterance> {
        self.spoken.lock().unwrap().clone()
    }

    pub fn cancel_count(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }
}

impl SynthesisEngine for FakeSynthesizer {
    fn voices(&self) -> Vec<SynthesisVoice> {
        self.voices.clone()
    }

    fn speak(&self, utterance: Utterance, sink: UtteranceSink) {
        self.spoken.lock().unwrap().push(utterance);
        sink.started();
        if let Some(reason) = self.fail_next.lock().unwrap().take() {
            sink.failed(reason);
        } else if self.manual {
            *self.pending.lock().unwrap() = Some(sink);
        } else {
            sink.finished();
        }
    }

    fn cancel(&self) {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        if let Some(sink) = self.pending.lock().unwrap().take() {
            sink.failed("interrupted");
        }
    }
}

/// Tutor with queued outcomes. Falls back to echoing the input once the queue is empty.
pub struct ScriptedTutor {
    outcomes: Mutex<VecDeque<Result<String, UpstreamError>>>,
    calls: Mutex<Vec<(String, Vec<TranscriptEntry>)>>,
    gate: Mutex<Option<Arc<Semaphore>>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedTutor {
    pub fn new() -> Self {
        Self {
            outcomes: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            gate: Mutex::new(None),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn reply(&self, text: &str) {
        self.outcomes
            .lock()
            .unwrap()
            .push_back(Ok(text.to_string()));
    }

    pub fn fail(&self, err: UpstreamError) {
        self.outcomes.lock().unwrap().push_back(Err(err));
    }

    /// Replies wait until [`ScriptedTutor::release`] lets them through.
    pub fn hold_replies(&self) {
        *self.gate.lock().unwrap() = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release(&self, replies: usize) {
        if let Some(gate) = self.gate.lock().unwrap().as_ref() {
            gate.add_permits(replies);
        }
    }

    pub fn calls(&self) -> Vec<(String, Vec<TranscriptEntry>)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Tutor for ScriptedTutor {
    async fn get_reply(
        &self,
        user_input: &str,
        _config: &SessionConfig,
        history: &[TranscriptEntry],
    ) -> Result<String, UpstreamError> {
        self.calls
            .lock()
            .unwrap()
            .push((user_input.to_string(), history.to_vec()));
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.acquire().await.expect("gate closed").forget();
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        let outcome = self.outcomes.lock().unwrap().pop_front();
        outcome.unwrap_or_else(|| Ok(format!("Tutor reply to: {user_input}")))
    }
}

#[derive(Default)]
pub struct RecordingHistory {
    ended: Mutex<Vec<String>>,
}

impl RecordingHistory {
    pub fn ended(&self) -> Vec<String> {
        self.ended.lock().unwrap().clone()
    }
}

#[async_trait]
impl SessionHistory for RecordingHistory {
    async fn session_ended(&self, companion_id: &str) -> anyhow::Result<()> {
        self.ended.lock().unwrap().push(companion_id.to_string());
        Ok(())
    }
}
