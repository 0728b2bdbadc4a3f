use serde::{Deserialize, Serialize};
use std::fmt;

/// The tutoring persona a session is started with.
///
/// Immutable for the lifetime of one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Identifier handed to the session-history collaborator when the call ends.
    pub companion_id: String,
    pub subject: String,
    pub topic: String,
    /// Conversational style, e.g. "socratic" or "casual".
    pub style: String,
    /// Tutor display name.
    pub name: String,
    /// Preferred synthesis voice. Replaces the voice identity of the active profile at start.
    #[serde(default)]
    pub voice: Option<String>,
}

impl SessionConfig {
    pub fn new(
        companion_id: impl Into<String>,
        subject: impl Into<String>,
        topic: impl Into<String>,
        style: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            companion_id: companion_id.into(),
            subject: subject.into(),
            topic: topic.into(),
            style: style.into(),
            name: name.into(),
            voice: None,
        }
    }

    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = Some(voice.into());
        self
    }
}

pub const RATE_RANGE: (f32, f32) = (0.1, 10.0);
pub const PITCH_RANGE: (f32, f32) = (0.0, 2.0);
pub const VOLUME_RANGE: (f32, f32) = (0.0, 1.0);

/// Tunable speech-synthesis parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceProfile {
    /// Exact name of a platform voice. `None` falls back to the first available voice.
    pub voice: Option<String>,
    pub rate: f32,
    pub pitch: f32,
    pub volume: f32,
}

impl Default for VoiceProfile {
    fn default() -> Self {
        Self {
            voice: None,
            rate: 1.0,
            pitch: 1.0,
            volume: 1.0,
        }
    }
}

impl VoiceProfile {
    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = Some(voice.into());
        self
    }

    pub fn with_rate(mut self, rate: f32) -> Self {
        self.rate = rate;
        self
    }

    pub fn with_pitch(mut self, pitch: f32) -> Self {
        self.pitch = pitch;
        self
    }

    pub fn with_volume(mut self, volume: f32) -> Self {
        self.volume = volume;
        self
    }

    /// Returns a copy with every parameter pulled into its legal range.
    /// A NaN parameter resets to its default.
    pub fn clamped(&self) -> Self {
        let defaults = Self::default();
        let clamp = |value: f32, (lo, hi): (f32, f32), fallback: f32| {
            if value.is_nan() {
                fallback
            } else {
                value.clamp(lo, hi)
            }
        };
        Self {
            voice: self.voice.clone().filter(|name| !name.trim().is_empty()),
            rate: clamp(self.rate, RATE_RANGE, defaults.rate),
            pitch: clamp(self.pitch, PITCH_RANGE, defaults.pitch),
            volume: clamp(self.volume, VOLUME_RANGE, defaults.volume),
        }
    }
}

/// Lifecycle of one call. Single source of truth for what the controls may do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallStatus {
    Inactive,
    Connecting,
    Active,
    Finished,
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallStatus::Inactive => "INACTIVE",
            CallStatus::Connecting => "CONNECTING",
            CallStatus::Active => "ACTIVE",
            CallStatus::Finished => "FINISHED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    /// Speaker label used when rendering history into a prompt.
    pub fn prompt_label(&self) -> &'static str {
        match self {
            Role::User => "Student",
            Role::Assistant => "Tutor",
        }
    }
}
