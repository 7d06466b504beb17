use thiserror::Error;

#[derive(Debug, Error)]
pub enum TdbError {
    #[error("configuration error: {message}")]
    Configuration { message: String },
    #[error("creation error: {message} ({key})")]
    Creation { message: String, key: String },
    #[error("query constraint error: {message}")]
    QueryConstraint { message: String },
    #[error("cache value error: {message}")]
    CacheValue { message: String },
    #[error("engine {engine} unavailable: {message}")]
    EngineUnavailable { engine: String, message: String },
    #[error("writes disallowed: {message}")]
    WritesDisallowed { message: String },
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
    #[error("not found: {message}")]
    NotFound { message: String },
    #[error("storage error: {message}")]
    Storage { message: String },
}

/// Coarse classification so callers can pick status codes or retry policy
/// without matching on payloads.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    Configuration,
    Creation,
    QueryConstraint,
    CacheValue,
    EngineUnavailable,
    WritesDisallowed,
    InvalidInput,
    NotFound,
    Storage,
}

impl TdbError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn creation(message: impl Into<String>, key: impl Into<String>) -> Self {
        Self::Creation {
            message: message.into(),
            key: key.into(),
        }
    }

    pub fn query(message: impl Into<String>) -> Self {
        Self::QueryConstraint {
            message: message.into(),
        }
    }

    pub fn cache_value(message: impl Into<String>) -> Self {
        Self::CacheValue {
            message: message.into(),
        }
    }

    pub fn engine_unavailable(engine: impl Into<String>, message: impl Into<String>) -> Self {
        Self::EngineUnavailable {
            engine: engine.into(),
            message: message.into(),
        }
    }

    pub fn writes_disallowed(message: impl Into<String>) -> Self {
        Self::WritesDisallowed {
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration { .. } => ErrorKind::Configuration,
            Self::Creation { .. } => ErrorKind::Creation,
            Self::QueryConstraint { .. } => ErrorKind::QueryConstraint,
            Self::CacheValue { .. } => ErrorKind::CacheValue,
            Self::EngineUnavailable { .. } => ErrorKind::EngineUnavailable,
            Self::WritesDisallowed { .. } => ErrorKind::WritesDisallowed,
            Self::InvalidInput { .. } => ErrorKind::InvalidInput,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Storage { .. } => ErrorKind::Storage,
        }
    }
}

pub type TdbResult<T> = Result<T, TdbError>;

impl From<sea_orm::DbErr> for TdbError {
    fn from(value: sea_orm::DbErr) -> Self {
        TdbError::storage(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::{ErrorKind, TdbError};

    #[test]
    fn helper_constructors_set_variants() {
        assert_eq!(
            TdbError::configuration("ids").kind(),
            ErrorKind::Configuration
        );
        assert_eq!(TdbError::creation("dup", "k").kind(), ErrorKind::Creation);
        assert_eq!(TdbError::query("rule").kind(), ErrorKind::QueryConstraint);
        assert_eq!(TdbError::cache_value("incr").kind(), ErrorKind::CacheValue);
        assert_eq!(
            TdbError::engine_unavailable("main", "down").kind(),
            ErrorKind::EngineUnavailable
        );
        assert_eq!(
            TdbError::writes_disallowed("ro").kind(),
            ErrorKind::WritesDisallowed
        );
        assert_eq!(TdbError::invalid("bad").kind(), ErrorKind::InvalidInput);
        assert_eq!(TdbError::not_found("type").kind(), ErrorKind::NotFound);
        assert_eq!(TdbError::storage("disk").kind(), ErrorKind::Storage);
    }

    #[test]
    fn creation_error_reports_key() {
        let err = TdbError::creation("relation exists", "like:1:2");
        assert_eq!(
            err.to_string(),
            "creation error: relation exists (like:1:2)"
        );
    }
}
