//! A synthesis engine for terminals: utterances are printed and "played" for roughly as
//! long as reading them aloud would take.

use companion_core::engine::{SynthesisEngine, SynthesisVoice, Utterance, UtteranceSink};
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Speaking pace at rate 1.0.
const WORDS_PER_MINUTE: f32 = 180.0;

pub struct ConsoleSynthesizer {
    voices: Vec<SynthesisVoice>,
    words_per_minute: f32,
    current: Mutex<Option<(JoinHandle<()>, UtteranceSink)>>,
}

impl ConsoleSynthesizer {
    pub fn new() -> Self {
        Self {
            voices: vec![
                SynthesisVoice::new("Aria", "en-US"),
                SynthesisVoice::new("Oliver", "en-GB"),
                SynthesisVoice::new("Matilda", "en-AU"),
            ],
            words_per_minute: WORDS_PER_MINUTE,
            current: Mutex::new(None),
        }
    }

    pub fn with_words_per_minute(mut self, words_per_minute: f32) -> Self {
        self.words_per_minute = words_per_minute.max(1.0);
        self
    }

    fn current(&self) -> std::sync::MutexGuard<'_, Option<(JoinHandle<()>, UtteranceSink)>> {
        self.current
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Default for ConsoleSynthesizer {
    fn default() -> Self {
        Self::new()
    }
}

/// Time needed to say `text` at `rate` times the base pace.
pub fn speaking_time(text: &str, rate: f32, words_per_minute: f32) -> Duration {
    let words = text.split_whitespace().count() as f32;
    let rate = if rate.is_finite() { rate.max(0.1) } else { 1.0 };
    Duration::from_secs_f32(words * 60.0 / (words_per_minute * rate))
}

impl SynthesisEngine for ConsoleSynthesizer {
    fn voices(&self) -> Vec<SynthesisVoice> {
        self.voices.clone()
    }

    fn speak(&self, utterance: Utterance, sink: UtteranceSink) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            sink.failed("no async runtime for console playback");
            return;
        };

        let voice = utterance
            .voice
            .as_ref()
            .map_or("default", |voice| voice.name.as_str());
        println!("[{voice} {:.1}x] {}", utterance.rate, utterance.text);

        let duration = speaking_time(&utterance.text, utterance.rate, self.words_per_minute);
        tracing::debug!(?duration, "Console playback started.");
        sink.started();
        let done = sink.clone();
        let playing = runtime.spawn(async move {
            tokio::time::sleep(duration).await;
            done.finished();
        });

        if let Some((previous, _)) = self.current().replace((playing, sink)) {
            previous.abort();
        }
    }

    fn cancel(&self) {
        if let Some((playing, sink)) = self.current().take() {
            if !playing.is_finished() {
                playing.abort();
                sink.failed("interrupted");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use companion_core::EventBus;
    use companion_core::VoiceProfile;
    use companion_core::playback::{PlaybackAdapter, PlaybackOutcome};
    use std::sync::Arc;

    #[test]
    fn speaking_time_scales_with_words_and_rate() {
        let six_words = "one two three four five six";
        assert_eq!(speaking_time(six_words, 1.0, 180.0), Duration::from_secs(2));
        assert_eq!(speaking_time(six_words, 2.0, 180.0), Duration::from_secs(1));
        assert_eq!(speaking_time("", 1.0, 180.0), Duration::ZERO);
        assert_eq!(
            speaking_time(six_words, f32::NAN, 180.0),
            Duration::from_secs(2)
        );
    }

    #[tokio::test]
    async fn short_utterance_completes() {
        let engine = ConsoleSynthesizer::new().with_words_per_minute(60_000.0);
        let playback = PlaybackAdapter::new(Some(Arc::new(engine)), EventBus::new());

        let outcome = playback
            .speak("Gravity pulls masses together.", &VoiceProfile::default())
            .await
            .unwrap();

        assert_eq!(outcome, PlaybackOutcome::Completed);
    }

    #[tokio::test]
    async fn cancel_interrupts_playback() {
        let engine = ConsoleSynthesizer::new().with_words_per_minute(1.0);
        let playback = Arc::new(PlaybackAdapter::new(Some(Arc::new(engine)), EventBus::new()));

        let speaking = {
            let playback = playback.clone();
            tokio::spawn(async move {
                playback
                    .speak("a very slow sentence", &VoiceProfile::default())
                    .await
            })
        };
        while !playback.is_speaking() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        playback.cancel();

        assert_eq!(
            speaking.await.unwrap().unwrap(),
            PlaybackOutcome::Cancelled
        );
    }
}
