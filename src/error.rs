use std::error::Error;
use std::fmt::{Display, Formatter};

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Generic,
    /// A required field is missing; user-facing, names the fields.
    Validation,
    /// Missing credential, failed token exchange or refresh.
    Auth,
    /// Operation or field not declared by the service configuration.
    Configuration,
    Storage,
    /// Non-2xx response or transport failure.
    RemoteCall,
}

#[derive(Debug, Clone)]
pub struct AppError {
    pub code: i32,
    pub kind: ErrorKind,
    pub message: String,
    pub status: Option<u16>,
}

impl AppError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let code = match kind {
            ErrorKind::Generic => 1,
            ErrorKind::Validation => 2,
            ErrorKind::Auth => 3,
            ErrorKind::Configuration => 4,
            ErrorKind::Storage => 5,
            ErrorKind::RemoteCall => 6,
        };

        Self {
            code,
            kind,
            message: message.into(),
            status: None,
        }
    }

    pub fn generic(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Generic, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Auth, message)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, message)
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Storage, message)
    }

    pub fn remote(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RemoteCall, message)
    }

    pub fn remote_status(status: u16, status_text: &str) -> Self {
        let mut err = Self::remote(format!("API call failed: {status} {status_text}"));
        err.status = Some(status);
        err
    }

    pub fn missing_fields(prefix: &str, labels: &[String]) -> Self {
        Self::validation(format!("{prefix}: {}", labels.join(", ")))
    }

    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Error for AppError {}
