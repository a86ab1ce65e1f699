use serde::Serialize;

use parley_types::ApiError;

/// Flat result shape for UI layers that render failures inline instead of
/// propagating them.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Outcome<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    /// The caller aborted the call. Not shown as a failure.
    pub cancelled: bool,
}

impl<T> Outcome<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            cancelled: false,
        }
    }

    pub fn failed(error: &ApiError) -> Self {
        Self {
            success: false,
            data: None,
            error: (!error.is_cancelled()).then(|| error.to_string()),
            cancelled: error.is_cancelled(),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        Outcome {
            success: self.success,
            data: self.data.map(f),
            error: self.error,
            cancelled: self.cancelled,
        }
    }
}

impl<T> From<Result<T, ApiError>> for Outcome<T> {
    fn from(result: Result<T, ApiError>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(e) => Self::failed(&e),
        }
    }
}
