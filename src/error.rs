//! Error types for the load balancer controller

use std::fmt;

use thiserror::Error;

/// Result alias used across the crate
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// A Service, Pod, load balancer or other object is missing
    #[error("Not found: {0}")]
    NotFound(String),

    /// Input state that will not self-correct without user action
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// A load balancer supplied by annotation cannot be reused by this Service
    #[error("Reuse rejected: {0}")]
    ReuseRejected(String),

    /// The cloud API rejected a request
    #[error("Cloud API error [{code}]: {message}")]
    CloudApi { code: String, message: String },

    /// Optimistic-lock failure on a cloud write
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A deadline or async job budget was exceeded
    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Finalizer error: {0}")]
    FinalizerError(String),

    /// Independent per-item failures collected by the apply stages
    #[error("{0}")]
    Aggregate(AggregateError),
}

impl Error {
    pub fn cloud(code: impl Into<String>, message: impl Into<String>) -> Self {
        Error::CloudApi {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Whether the error is worth a short requeue
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::KubeError(_)
            | Error::CloudApi { .. }
            | Error::Conflict(_)
            | Error::Timeout(_)
            | Error::FinalizerError(_) => true,
            Error::Aggregate(agg) => agg.errors.iter().any(Error::is_retriable),
            Error::NotFound(_)
            | Error::ValidationError(_)
            | Error::ReuseRejected(_)
            | Error::ConfigError(_)
            | Error::SerializationError(_)
            | Error::YamlError(_) => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::KubeError(kube::Error::Api(resp)) => resp.code == 404,
            _ => false,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }

    /// Short machine-readable kind, used in event reasons and logs
    pub fn kind(&self) -> &'static str {
        match self {
            Error::KubeError(_) => "kube",
            Error::NotFound(_) => "not_found",
            Error::ValidationError(_) => "validation",
            Error::ReuseRejected(_) => "reuse",
            Error::CloudApi { .. } => "cloud",
            Error::Conflict(_) => "conflict",
            Error::Timeout(_) => "timeout",
            Error::ConfigError(_) => "config",
            Error::SerializationError(_) | Error::YamlError(_) => "serialization",
            Error::FinalizerError(_) => "finalizer",
            Error::Aggregate(_) => "aggregate",
        }
    }
}

impl<E> From<kube::runtime::finalizer::Error<E>> for Error
where
    E: std::error::Error + 'static,
{
    fn from(err: kube::runtime::finalizer::Error<E>) -> Self {
        Error::FinalizerError(err.to_string())
    }
}

/// A collection of errors returned together instead of failing fast
#[derive(Debug, Default)]
pub struct AggregateError {
    pub errors: Vec<Error>,
}

impl AggregateError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, err: Error) {
        match err {
            Error::Aggregate(inner) => self.errors.extend(inner.errors),
            other => self.errors.push(other),
        }
    }

    pub fn extend(&mut self, errs: impl IntoIterator<Item = Error>) {
        for err in errs {
            self.push(err);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// `Ok(())` when nothing failed, the single error when one did,
    /// an aggregate otherwise
    pub fn into_result(mut self) -> Result<()> {
        match self.errors.len() {
            0 => Ok(()),
            1 => Err(self.errors.remove(0)),
            _ => Err(Error::Aggregate(self)),
        }
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self
            .errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        write!(f, "{} error(s): {}", self.errors.len(), joined)
    }
}

impl std::error::Error for AggregateError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::cloud("Throttling", "request was denied");
        assert_eq!(
            err.to_string(),
            "Cloud API error [Throttling]: request was denied"
        );
    }

    #[test]
    fn test_retriable_classification() {
        assert!(Error::Conflict("lb busy".into()).is_retriable());
        assert!(Error::Timeout("job".into()).is_retriable());
        assert!(!Error::ValidationError("bad port".into()).is_retriable());
        assert!(!Error::ReuseRejected("owned".into()).is_retriable());
    }

    #[test]
    fn test_aggregate_flattens_single_error() {
        let mut agg = AggregateError::new();
        agg.push(Error::NotFound("vsp-1".into()));
        assert!(matches!(agg.into_result(), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_aggregate_collects_and_classifies() {
        let mut agg = AggregateError::new();
        agg.push(Error::ValidationError("a".into()));
        agg.push(Error::Conflict("b".into()));
        let mut nested = AggregateError::new();
        nested.push(Error::Timeout("c".into()));
        nested.push(Error::Timeout("d".into()));
        agg.push(Error::Aggregate(nested));
        assert_eq!(agg.len(), 4);

        let err = agg.into_result().unwrap_err();
        assert!(err.is_retriable());
        assert!(err.to_string().starts_with("4 error(s): "));
    }

    #[test]
    fn test_empty_aggregate_is_ok() {
        assert!(AggregateError::new().into_result().is_ok());
    }
}
