//! Error types for attrmesh Core

use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Expression error: {0}")]
    Expression(String),

    #[error("Unknown attribute: '{0}'")]
    UnknownAttribute(String),

    #[error("Instance build error: {0}")]
    InstanceBuild(String),

    #[error("{0}")]
    Handler(String),

    #[error("panic during handler dispatch: {0}")]
    HandlerPanic(String),

    #[error("handler does not support {0}")]
    Unsupported(&'static str),

    #[error("identity parameter is not a string: '{0}'")]
    IdentityNotString(String),

    #[error("{0}")]
    Dispatch(DispatchErrors),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration not found")]
    ConfigNotFound,

    #[error("Runtime is already listening for configuration changes")]
    AlreadyListening,

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Render a recovered panic payload
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<unknown>".to_string()
    }
}

/// Errors collected from every attempt of a single dispatch call, in encounter order.
#[derive(Debug, Default)]
pub struct DispatchErrors {
    errors: Vec<Error>,
}

impl DispatchErrors {
    pub fn new() -> Self {
        Self { errors: Vec::new() }
    }

    pub fn push(&mut self, err: Error) {
        self.errors.push(err);
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn errors(&self) -> &[Error] {
        &self.errors
    }

    /// Collapse into `Ok(())` when nothing failed.
    pub fn into_result(self) -> Result<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Dispatch(self))
        }
    }
}

impl fmt::Display for DispatchErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.errors.len() == 1 {
            writeln!(f, "1 error occurred:")?;
        } else {
            writeln!(f, "{} errors occurred:", self.errors.len())?;
        }
        for err in &self.errors {
            write!(f, "\n* {}", err)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_error_message() {
        let err = Error::IdentityNotString("ident".to_string());
        assert_eq!(err.to_string(), "identity parameter is not a string: 'ident'");
    }

    #[test]
    fn test_panic_error_message() {
        let err = Error::HandlerPanic("boom".to_string());
        assert_eq!(err.to_string(), "panic during handler dispatch: boom");
    }

    #[test]
    fn test_panic_message_payloads() {
        let payload = std::panic::catch_unwind(|| panic!("static")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "static");

        let payload = std::panic::catch_unwind(|| panic!("formatted {}", 42)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "formatted 42");

        let payload = std::panic::catch_unwind(|| std::panic::panic_any(7u8)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "<unknown>");
    }

    #[test]
    fn test_dispatch_errors_single() {
        let mut errs = DispatchErrors::new();
        errs.push(Error::Handler("error at dispatch check, as expected".to_string()));

        let err = errs.into_result().unwrap_err();
        assert_eq!(
            err.to_string(),
            "1 error occurred:\n\n* error at dispatch check, as expected"
        );
    }

    #[test]
    fn test_dispatch_errors_keep_order() {
        let mut errs = DispatchErrors::new();
        errs.push(Error::Handler("first".to_string()));
        errs.push(Error::Handler("second".to_string()));

        assert_eq!(errs.len(), 2);
        assert_eq!(errs.to_string(), "2 errors occurred:\n\n* first\n* second");
    }

    #[test]
    fn test_empty_dispatch_errors_is_ok() {
        assert!(DispatchErrors::new().into_result().is_ok());
    }
}
