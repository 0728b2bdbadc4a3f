use crate::capture::CaptureError;
use crate::playback::PlaybackError;
use crate::tutor::UpstreamError;
use crate::types::CallStatus;

/// Every failure the orchestrator reports, either as a returned error or through the
/// `error` event.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SessionError {
    /// No usable speech engines. The session never becomes active.
    #[error("voice session could not start: {0}")]
    Startup(String),
    /// Ends the call.
    #[error(
        "microphone access is required for voice conversation (speech recognition error: {class}); enable microphone permissions and try again"
    )]
    Permission { class: String },
    #[error("speech recognition error: {class}")]
    TransientCapture { class: String },
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error(transparent)]
    Playback(#[from] PlaybackError),
    #[error("operation not allowed while the session is {0}")]
    InvalidState(CallStatus),
    #[error("message must not be empty")]
    InvalidInput,
}

impl SessionError {
    /// Whether this error moves the session to FINISHED on its own.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SessionError::Startup(_) | SessionError::Permission { .. })
    }
}

impl From<CaptureError> for SessionError {
    fn from(err: CaptureError) -> Self {
        match err {
            CaptureError::Unsupported => {
                SessionError::Startup("speech recognition is not supported".to_string())
            }
            CaptureError::Permission { class } => SessionError::Permission { class },
            CaptureError::Transient { class } => SessionError::TransientCapture { class },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_message_names_the_error_class() {
        let err = SessionError::from(CaptureError::Permission {
            class: "not-allowed".to_string(),
        });
        assert!(err.is_fatal());
        assert!(err.to_string().contains("not-allowed"));
        assert!(err.to_string().contains("enable microphone permissions"));
    }

    #[test]
    fn per_turn_errors_are_not_fatal() {
        assert!(!SessionError::Upstream(UpstreamError::EmptyReply).is_fatal());
        assert!(!SessionError::TransientCapture {
            class: "no-speech".to_string()
        }
        .is_fatal());
        assert!(!SessionError::InvalidState(CallStatus::Inactive).is_fatal());
    }
}
