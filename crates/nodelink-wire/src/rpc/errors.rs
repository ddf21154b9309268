//! RPC error model.
//!
//! A failed remote call is exactly one of two things for the caller:
//!
//! - [`RemoteOperationError`]: the call itself did not work (no route,
//!   refused method, ambiguous service, timeout, serialization problem).
//! - [`MethodException`]: the invoked method returned an error. Only its
//!   type name and message travel; the caller reconstructs a typed error
//!   through the [`ErrorFactoryRegistry`] when the type is known locally.
//!
//! Neither carries a source error.

use dashmap::DashMap;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Type name used for method errors that have no dedicated type.
pub const GENERIC_METHOD_ERROR: &str = "OperationFailure";

/// An error type that can be reconstructed on the calling node.
pub trait RemoteError: StdError + Send + Sync + 'static {
    /// Stable name identifying the type on both sides.
    const TYPE_NAME: &'static str;

    /// Build an instance from the transported message.
    fn from_message(message: String) -> Self;

    /// The message to transport.
    fn message(&self) -> String;
}

/// Error returned by a service method implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{type_name}: {message}")]
pub struct MethodError {
    pub type_name: String,
    pub message: String,
}

impl MethodError {
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            message: message.into(),
        }
    }

    /// Untyped failure.
    pub fn generic(message: impl Into<String>) -> Self {
        Self::new(GENERIC_METHOD_ERROR, message)
    }

    /// Invalid parameter count or content.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new("InvalidArgument", message)
    }

    pub fn from_remote_error<E: RemoteError>(error: &E) -> Self {
        Self::new(E::TYPE_NAME, error.message())
    }
}

/// Communication or administrative failure of a remote call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct RemoteOperationError {
    message: String,
}

impl RemoteOperationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// A method error as seen by the caller.
#[derive(Error)]
#[error("{type_name}: {message}")]
pub struct MethodException {
    type_name: String,
    message: String,
    reconstructed: Option<Box<dyn StdError + Send + Sync>>,
}

impl MethodException {
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether a typed error could be built for the remote type name.
    pub fn is_reconstructed(&self) -> bool {
        self.reconstructed.is_some()
    }

    /// The reconstructed typed error.
    pub fn downcast_ref<T: StdError + 'static>(&self) -> Option<&T> {
        self.reconstructed.as_ref()?.downcast_ref::<T>()
    }
}

impl fmt::Debug for MethodException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodException")
            .field("type_name", &self.type_name)
            .field("message", &self.message)
            .field("reconstructed", &self.reconstructed.is_some())
            .finish()
    }
}


/// What a caller sees when a remote call fails.
#[derive(Debug, Error)]
pub enum ServiceCallError {
    #[error(transparent)]
    RemoteOperation(#[from] RemoteOperationError),
    #[error(transparent)]
    Method(#[from] MethodException),
}

impl ServiceCallError {
    pub fn remote(message: impl Into<String>) -> Self {
        ServiceCallError::RemoteOperation(RemoteOperationError::new(message))
    }

    pub fn is_remote_operation(&self) -> bool {
        matches!(self, ServiceCallError::RemoteOperation(_))
    }
}

type ErrorFactory = Arc<dyn Fn(String) -> Box<dyn StdError + Send + Sync> + Send + Sync>;

/// Type name to constructor table used to rebuild method errors.
#[derive(Default)]
pub struct ErrorFactoryRegistry {
    factories: DashMap<String, ErrorFactory>,
}

impl ErrorFactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<E: RemoteError>(&self) {
        self.factories.insert(
            E::TYPE_NAME.to_string(),
            Arc::new(|message: String| {
                Box::new(E::from_message(message)) as Box<dyn StdError + Send + Sync>
            }),
        );
    }

    pub fn is_registered(&self, type_name: &str) -> bool {
        self.factories.contains_key(type_name)
    }

    /// Rebuild an error; unknown types stay untyped.
    pub fn reconstruct(&self, type_name: &str, message: &str) -> MethodException {
        let factory = self.factories.get(type_name).map(|f| Arc::clone(f.value()));
        MethodException {
            type_name: type_name.to_string(),
            message: message.to_string(),
            reconstructed: factory.map(|f| f(message.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct QuotaExceeded(String);

    impl fmt::Display for QuotaExceeded {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "quota exceeded: {}", self.0)
        }
    }

    impl StdError for QuotaExceeded {}

    impl RemoteError for QuotaExceeded {
        const TYPE_NAME: &'static str = "QuotaExceeded";

        fn from_message(message: String) -> Self {
            QuotaExceeded(message)
        }

        fn message(&self) -> String {
            self.0.clone()
        }
    }

    #[test]
    fn test_reconstruct_known_type() {
        let registry = ErrorFactoryRegistry::new();
        registry.register::<QuotaExceeded>();
        let sent = MethodError::from_remote_error(&QuotaExceeded("10 jobs".into()));
        let received = registry.reconstruct(&sent.type_name, &sent.message);
        assert!(received.is_reconstructed());
        assert_eq!(
            received.downcast_ref::<QuotaExceeded>(),
            Some(&QuotaExceeded("10 jobs".into()))
        );
        assert!(received.source().is_none());
    }

    #[test]
    fn test_unknown_type_stays_generic() {
        let registry = ErrorFactoryRegistry::new();
        let received = registry.reconstruct("SomethingElse", "bad");
        assert!(!received.is_reconstructed());
        assert_eq!(received.to_string(), "SomethingElse: bad");
    }

    #[test]
    fn test_service_call_error_has_no_source() {
        let err = ServiceCallError::remote("Request refused by destination instance");
        assert!(err.is_remote_operation());
        assert!(err.source().is_none());
        assert!(err.to_string().contains("refused"));
    }
}
