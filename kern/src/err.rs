//! Common error-handling support.
//!
//! Syscall-layer code spends too much time recording and classifying
//! errors; this module separates that concern with `Result`. A failure is
//! either something the caller can observe and recover from (an error code
//! in the return or reply slot) or evidence of a malfunctioning task, in
//! which case the task is killed.

use abi::{ErrorCode, FaultInfo, UsageError};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum UserError {
    /// Encoded into the syscall return or reply slot; the caller carries on.
    Recoverable(ErrorCode),
    /// Protocol violation; the offending task is killed.
    Unrecoverable(FaultInfo),
}

impl From<FaultInfo> for UserError {
    fn from(f: FaultInfo) -> Self {
        Self::Unrecoverable(f)
    }
}

impl From<UsageError> for UserError {
    fn from(e: UsageError) -> Self {
        Self::Unrecoverable(e.into())
    }
}

impl From<ErrorCode> for UserError {
    fn from(e: ErrorCode) -> Self {
        Self::Recoverable(e)
    }
}

impl UserError {
    /// Encodes this error the way it appears in a reply slot. Unrecoverable
    /// errors never reach a reply slot; they read as `Inval` should anyone
    /// ask anyway.
    pub fn as_retval(&self) -> isize {
        match self {
            UserError::Recoverable(c) => c.as_retval(),
            UserError::Unrecoverable(_) => ErrorCode::Inval.as_retval(),
        }
    }
}
