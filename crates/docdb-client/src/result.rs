//! The uniform result envelope returned by every session operation.

use crate::error::{Fault, FaultKind};

/// Outcome of one operation.
///
/// Operation-scoped failures never unwind the caller: they arrive here with
/// `success == false` and a structured [`Fault`]. `value` is only set when the
/// operation succeeded and produced something to read.
#[derive(Debug, Clone, PartialEq)]
pub struct OpResult<T> {
    /// False when the operation failed; `fault` then says why.
    pub success: bool,
    /// Human-readable failure message.
    pub message: Option<String>,
    /// Structured failure, present exactly when `success` is false.
    pub fault: Option<Fault>,
    /// Result of a successful read.
    pub value: Option<T>,
    /// Compare-and-swap value reported by the server, if any.
    pub cas: Option<u64>,
}

impl<T> OpResult<T> {
    /// A successful read.
    pub fn ok(value: T) -> Self {
        Self {
            success: true,
            message: None,
            fault: None,
            value: Some(value),
            cas: None,
        }
    }

    /// A successful operation without a value, such as a mutation.
    pub fn done() -> Self {
        Self {
            success: true,
            message: None,
            fault: None,
            value: None,
            cas: None,
        }
    }

    /// A failed operation.
    pub fn failed(fault: Fault) -> Self {
        Self {
            success: false,
            message: Some(fault.message.clone()),
            fault: Some(fault),
            value: None,
            cas: None,
        }
    }

    /// Attaches the cas reported by the server.
    pub fn with_cas(mut self, cas: u64) -> Self {
        self.cas = Some(cas);
        self
    }

    /// Same as reading `success`.
    pub fn is_success(&self) -> bool {
        self.success
    }

    /// The fault kind, if the operation failed.
    pub fn fault_kind(&self) -> Option<FaultKind> {
        self.fault.as_ref().map(|f| f.kind)
    }

    /// The value, if the operation succeeded with one.
    pub fn value(&self) -> Option<&T> {
        self.value.as_ref()
    }

    /// Converts into a standard `Result`, for callers that prefer `?`.
    ///
    /// A successful operation without a value yields `Ok(None)`.
    pub fn into_result(self) -> Result<Option<T>, Fault> {
        match self.fault {
            Some(fault) => Err(fault),
            None => Ok(self.value),
        }
    }

    /// Maps the value, keeping status, message and cas.
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> OpResult<U> {
        OpResult {
            success: self.success,
            message: self.message,
            fault: self.fault,
            value: self.value.map(f),
            cas: self.cas,
        }
    }
}

impl<T> From<Result<T, Fault>> for OpResult<T> {
    fn from(result: Result<T, Fault>) -> Self {
        match result {
            Ok(value) => OpResult::ok(value),
            Err(fault) => OpResult::failed(fault),
        }
    }
}
