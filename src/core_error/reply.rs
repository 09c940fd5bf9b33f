//! Structured operation results.
//!
//! Every operation finishes with a [`ReplyCode`]. Failures carry one
//! [`ErrorKind`] plus independent facets, so a rejected `PASS` can be both
//! critical and password-related at the same time.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Error,
    Canceled,
    WriteFailed,
    NotSupported,
    LinkNotDir,
    Timeout,
    /// Broken engine invariant, e.g. a reply for a missing operation.
    Internal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Failure {
    pub kind: ErrorKind,
    pub critical: bool,
    pub disconnected: bool,
    pub password_failed: bool,
}

impl Failure {
    fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            critical: false,
            disconnected: false,
            password_failed: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplyCode {
    Ok,
    WouldBlock,
    Failed(Failure),
}

impl ReplyCode {
    pub fn error() -> Self {
        ReplyCode::Failed(Failure::new(ErrorKind::Error))
    }

    pub fn critical() -> Self {
        ReplyCode::error().with_critical()
    }

    pub fn canceled() -> Self {
        ReplyCode::Failed(Failure::new(ErrorKind::Canceled))
    }

    pub fn internal() -> Self {
        ReplyCode::Failed(Failure::new(ErrorKind::Internal)).with_critical()
    }

    pub fn timeout() -> Self {
        ReplyCode::Failed(Failure::new(ErrorKind::Timeout)).with_disconnected()
    }

    pub fn of_kind(kind: ErrorKind) -> Self {
        ReplyCode::Failed(Failure::new(kind))
    }

    fn failure_mut(self, apply: impl FnOnce(&mut Failure)) -> Self {
        let mut failure = match self {
            ReplyCode::Failed(failure) => failure,
            _ => Failure::new(ErrorKind::Error),
        };
        apply(&mut failure);
        ReplyCode::Failed(failure)
    }

    pub fn with_critical(self) -> Self {
        self.failure_mut(|f| f.critical = true)
    }

    pub fn with_disconnected(self) -> Self {
        self.failure_mut(|f| f.disconnected = true)
    }

    pub fn with_password_failed(self) -> Self {
        self.failure_mut(|f| f.password_failed = true)
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, ReplyCode::Ok)
    }

    pub fn is_would_block(&self) -> bool {
        matches!(self, ReplyCode::WouldBlock)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ReplyCode::Failed(_))
    }

    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            ReplyCode::Failed(f) => Some(f.kind),
            _ => None,
        }
    }

    pub fn is_critical(&self) -> bool {
        matches!(self, ReplyCode::Failed(f) if f.critical)
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self, ReplyCode::Failed(f) if f.disconnected)
    }

    pub fn is_password_failed(&self) -> bool {
        matches!(self, ReplyCode::Failed(f) if f.password_failed)
    }

    pub fn is_canceled(&self) -> bool {
        self.kind() == Some(ErrorKind::Canceled)
    }

    /// Failures that end every nested operation instead of only the innermost one.
    pub fn terminates_stack(&self) -> bool {
        self.is_critical() || self.is_disconnected() || self.is_canceled()
    }
}

impl fmt::Display for ReplyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplyCode::Ok => write!(f, "ok"),
            ReplyCode::WouldBlock => write!(f, "would block"),
            ReplyCode::Failed(failure) => {
                write!(f, "{:?}", failure.kind)?;
                if failure.critical {
                    write!(f, "+critical")?;
                }
                if failure.disconnected {
                    write!(f, "+disconnected")?;
                }
                if failure.password_failed {
                    write!(f, "+password")?;
                }
                Ok(())
            }
        }
    }
}
