use thiserror::Error;

/// Substrings that mark an SMTP/transport failure as transient rather than
/// permanent. Order and casing don't matter, the match is lowercase substring.
const TRANSIENT_MARKERS: &[&str] = &[
    "timeout",
    "connection",
    "temporarily",
    "try again",
    "unavailable",
    "service",
    "refused",
    "reset",
    "broken pipe",
];

/// Classifies an error message as transient (worth retrying) based on the
/// same keyword heuristic the upstream mail client uses when it can't give
/// us a structured status code.
pub fn is_transient_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    TRANSIENT_MARKERS.iter().any(|marker| lower.contains(marker))
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("queue error: {message}")]
    Queue {
        message: String,
        email_id: Option<i64>,
    },

    #[error("transport error: {message}")]
    Transport { message: String, transient: bool },

    #[error("template error: {message}")]
    Template {
        message: String,
        template_name: Option<String>,
    },

    #[error("{0}")]
    Other(String),
}

impl ServiceError {
    pub fn queue(message: impl Into<String>) -> Self {
        ServiceError::Queue {
            message: message.into(),
            email_id: None,
        }
    }

    pub fn queue_for(email_id: i64, message: impl Into<String>) -> Self {
        ServiceError::Queue {
            message: message.into(),
            email_id: Some(email_id),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        let message = message.into();
        let transient = is_transient_error(&message);
        ServiceError::Transport { message, transient }
    }

    /// Forces `transient = true` on a transport error, used once a send
    /// has exhausted all its attempts: spec.md requires the final
    /// failure to be unconditionally transient regardless of what its
    /// message happens to lexically match.
    pub fn force_transient(self) -> Self {
        match self {
            ServiceError::Transport { message, .. } => {
                ServiceError::Transport { message, transient: true }
            }
            other => other,
        }
    }

    pub fn template(message: impl Into<String>, template_name: Option<String>) -> Self {
        ServiceError::Template {
            message: message.into(),
            template_name,
        }
    }

    /// True if retrying later has a chance of succeeding.
    pub fn is_transient(&self) -> bool {
        match self {
            ServiceError::Transport { transient, .. } => *transient,
            ServiceError::Queue { .. } => true,
            _ => false,
        }
    }
}

impl From<sqlx::Error> for ServiceError {
    fn from(err: sqlx::Error) -> Self {
        if matches!(err, sqlx::Error::RowNotFound) {
            return ServiceError::queue("not found");
        }
        ServiceError::queue(err.to_string())
    }
}

impl From<tera::Error> for ServiceError {
    fn from(err: tera::Error) -> Self {
        ServiceError::template(err.to_string(), None)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn classifies_known_transient_markers() {
        assert!(is_transient_error("Connection refused by remote host"));
        assert!(is_transient_error("the server is TEMPORARILY unavailable"));
        assert!(is_transient_error("broken pipe"));
        assert!(is_transient_error("connection timeout"));
    }

    #[test]
    fn permanent_errors_are_not_misclassified() {
        assert!(!is_transient_error("mailbox does not exist"));
        assert!(!is_transient_error("authentication credentials rejected"));
    }

    #[test]
    fn transport_constructor_derives_transience_from_message() {
        let err = ServiceError::transport("connection reset by peer");
        assert!(err.is_transient());

        let err = ServiceError::transport("recipient address rejected");
        assert!(!err.is_transient());
    }
}
