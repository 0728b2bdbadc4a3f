use crate::backend::CompletionBackend;
use crate::transcript::TranscriptEntry;
use crate::types::SessionConfig;
use async_trait::async_trait;
use std::sync::Arc;

/// Number of transcript entries given to the model as conversation context.
pub const DEFAULT_CONTEXT_WINDOW: usize = 10;

pub const DEFAULT_TUTOR_INSTRUCTIONS: &str = r#"You are a highly knowledgeable tutor teaching a real-time voice session with a student. Your goal is to teach the student about the topic and subject.

Tutor Guidelines:
- Stick to the given topic: "{topic}" and subject: "{subject}" and teach the student about it.
- Keep the conversation flowing smoothly while maintaining control.
- From time to time make sure that the student is following you and understands you.
- Break down the topic into smaller parts and teach the student one part at a time.
- Keep your style of conversation "{style}".
- Keep your responses short, like in a real voice conversation.
- Do not include any special characters in your responses - this is a voice conversation.
- Maximum response length should be 2-3 sentences for natural conversation flow.
- The student may communicate via voice or text - respond naturally to both."#;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpstreamError {
    #[error("language model request failed: {0}")]
    Request(String),
    #[error("language model returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("language model returned an empty reply")]
    EmptyReply,
}

/// Produces the tutor's next reply from the conversation so far.
#[async_trait]
pub trait Tutor: Send + Sync {
    /// `history` holds the entries that precede `user_input`, oldest first.
    async fn get_reply(
        &self,
        user_input: &str,
        config: &SessionConfig,
        history: &[TranscriptEntry],
    ) -> Result<String, UpstreamError>;
}

pub struct TutorClient {
    backend: Arc<dyn CompletionBackend>,
    model: String,
    instructions: String,
    context_window: usize,
}

impl TutorClient {
    pub fn new(backend: Arc<dyn CompletionBackend>, model: impl Into<String>) -> Self {
        Self {
            backend,
            model: model.into(),
            instructions: DEFAULT_TUTOR_INSTRUCTIONS.to_string(),
            context_window: DEFAULT_CONTEXT_WINDOW,
        }
    }

    /// Replaces the instruction template. `{topic}`, `{subject}` and `{style}` are substituted.
    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    pub fn with_context_window(mut self, window: usize) -> Self {
        self.context_window = window.max(1);
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn build_prompt(
        &self,
        user_input: &str,
        config: &SessionConfig,
        history: &[TranscriptEntry],
    ) -> String {
        let instructions = self
            .instructions
            .replace("{topic}", &config.topic)
            .replace("{subject}", &config.subject)
            .replace("{style}", &config.style);

        let start = history.len().saturating_sub(self.context_window);
        let conversation = history[start..]
            .iter()
            .map(|entry| format!("{}: {}", entry.role.prompt_label(), entry.content))
            .collect::<Vec<_>>()
            .join("\n");

        format!(
            "{instructions}\n\nPrevious conversation:\n{conversation}\n\nCurrent student message: {user_input}\n\nRespond as the tutor:"
        )
    }
}

#[async_trait]
impl Tutor for TutorClient {
    async fn get_reply(
        &self,
        user_input: &str,
        config: &SessionConfig,
        history: &[TranscriptEntry],
    ) -> Result<String, UpstreamError> {
        let prompt = self.build_prompt(user_input, config, history);
        tracing::debug!(model = %self.model, history = history.len(), "Requesting tutor reply.");

        let reply = self.backend.complete(&self.model, &prompt).await?;
        let reply = reply.trim();
        if reply.is_empty() {
            return Err(UpstreamError::EmptyReply);
        }
        Ok(reply.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockCompletionBackend;
    use crate::transcript::Transcript;
    use crate::types::Role;
    use std::sync::Mutex;

    fn physics() -> SessionConfig {
        SessionConfig::new("c-1", "physics", "inertia", "casual", "Newton")
    }

    #[test]
    fn prompt_has_instructions_history_and_current_message() {
        let tutor = TutorClient::new(Arc::new(MockCompletionBackend::new()), "gemini-1.5-flash");
        let mut transcript = Transcript::new();
        transcript.append(Role::Assistant, "Hello, let's start.");
        transcript.append(Role::User, "Hi there");

        let prompt = tutor.build_prompt("what is inertia", &physics(), transcript.entries());

        assert!(prompt.starts_with("You are a highly knowledgeable tutor"));
        assert!(prompt.contains(r#"topic: "inertia" and subject: "physics""#));
        assert!(prompt.contains(r#"Keep your style of conversation "casual""#));
        assert!(prompt.contains(
            "Previous conversation:\nTutor: Hello, let's start.\nStudent: Hi there\n\nCurrent student message: what is inertia\n\nRespond as the tutor:"
        ));
    }

    #[test]
    fn prompt_keeps_only_the_context_window() {
        let tutor = TutorClient::new(Arc::new(MockCompletionBackend::new()), "m")
            .with_instructions("Teach {topic}.")
            .with_context_window(2);
        let mut transcript = Transcript::new();
        for line in ["one", "two", "three"] {
            transcript.append(Role::User, line);
        }

        let prompt = tutor.build_prompt("four", &physics(), transcript.entries());
        assert_eq!(
            prompt,
            "Teach inertia.\n\nPrevious conversation:\nStudent: two\nStudent: three\n\nCurrent student message: four\n\nRespond as the tutor:"
        );
    }

    #[tokio::test]
    async fn reply_is_trimmed_and_prompt_is_sent_to_configured_model() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut backend = MockCompletionBackend::new();
        backend
            .expect_complete()
            .times(1)
            .returning(move |model, prompt| {
                sink.lock().unwrap().push((model.to_string(), prompt.to_string()));
                Box::pin(async move { Ok("  Inertia is resistance to change.\n".to_string()) })
            });
        let tutor = TutorClient::new(Arc::new(backend), "gemini-1.5-flash");

        let reply = tutor.get_reply("what is inertia", &physics(), &[]).await;

        assert_eq!(reply, Ok("Inertia is resistance to change.".to_string()));
        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].0, "gemini-1.5-flash");
        assert!(seen[0].1.contains("Current student message: what is inertia"));
    }

    #[tokio::test]
    async fn blank_reply_is_an_error() {
        let mut backend = MockCompletionBackend::new();
        backend
            .expect_complete()
            .returning(|_, _| Box::pin(async move { Ok("   ".to_string()) }));
        let tutor = TutorClient::new(Arc::new(backend), "m");

        assert_eq!(
            tutor.get_reply("hi", &physics(), &[]).await,
            Err(UpstreamError::EmptyReply)
        );
    }

    #[tokio::test]
    async fn backend_failure_is_passed_through() {
        let mut backend = MockCompletionBackend::new();
        backend.expect_complete().returning(|_, _| {
            Box::pin(async move {
                Err(UpstreamError::Status {
                    status: 503,
                    body: "overloaded".to_string(),
                })
            })
        });
        let tutor = TutorClient::new(Arc::new(backend), "m");

        let err = tutor.get_reply("hi", &physics(), &[]).await.unwrap_err();
        assert_eq!(err.to_string(), "language model returned HTTP 503: overloaded");
    }
}
