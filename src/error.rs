// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! Error types used across the crate.
//!
//! Two kinds of errors are raised:
//!
//! 1. Expected errors, indicating invalid input from the caller: a bad
//!    argument type at resolution time ([`Error::Plan`]) or malformed data
//!    observed while processing a batch ([`Error::Execution`]). These abort
//!    the current batch and carry a message naming the aggregate and the
//!    offending argument.
//!
//! 2. Unexpected errors ([`Error::Internal`]), indicating that an internal
//!    invariant has been broken and suggesting a bug.
//!
//! Use the `plan_err!` / `exec_err!` / `internal_err!` macros to construct
//! and return them.

use std::error;
use std::fmt::{Display, Formatter};
use std::result;

use arrow::error::ArrowError;

/// Result type for operations that could result in an [`Error`].
pub type Result<T, E = Error> = result::Result<T, E>;

/// Aggregation error.
#[derive(Debug)]
pub enum Error {
    /// Error returned by arrow.
    ArrowError(ArrowError),
    /// Error when a feature is not yet implemented.
    NotImplemented(String),
    /// Error due to a broken internal invariant.
    ///
    /// This error should not happen in normal usage. It results from
    /// something that wasn't expected by the implementation and is most
    /// likely a bug; a caller should not be able to trigger it with
    /// malformed queries or data.
    Internal(String),
    /// Error while resolving the aggregate against its argument types.
    ///
    /// Raised when the caller asks for an unsupported input kind, passes
    /// the wrong number of arguments, or mistypes one of them.
    Plan(String),
    /// Error during execution of a batch due to malformed input, such as a
    /// null percentile or a weight outside the supported range.
    Execution(String),
    /// Error when memory needed to execute the aggregation cannot be
    /// acquired from the pool.
    ResourcesExhausted(String),
}

impl Error {
    /// The error message, without the variant prefix.
    pub fn message(&self) -> &str {
        match self {
            Error::ArrowError(_) => "",
            Error::NotImplemented(msg)
            | Error::Internal(msg)
            | Error::Plan(msg)
            | Error::Execution(msg)
            | Error::ResourcesExhausted(msg) => msg,
        }
    }

    /// Returns true for errors caused by caller input rather than bugs.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Error::Plan(_) | Error::Execution(_) | Error::NotImplemented(_)
        )
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::ArrowError(e) => write!(f, "Arrow error: {e}"),
            Error::NotImplemented(msg) => {
                write!(f, "This feature is not implemented: {msg}")
            }
            Error::Internal(msg) => write!(
                f,
                "Internal error: {msg}.\nThis issue was likely caused by a bug, \
                 please report it"
            ),
            Error::Plan(msg) => write!(f, "Error during planning: {msg}"),
            Error::Execution(msg) => write!(f, "Execution error: {msg}"),
            Error::ResourcesExhausted(msg) => {
                write!(f, "Resources exhausted: {msg}")
            }
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::ArrowError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ArrowError> for Error {
    fn from(e: ArrowError) -> Self {
        Error::ArrowError(e)
    }
}

/// Returns an [`Error::Plan`] from a `format!` style message.
#[macro_export]
macro_rules! plan_err {
    ($($args:expr),* $(,)?) => {
        Err($crate::error::Error::Plan(format!($($args),*)))
    };
}

/// Returns an [`Error::Execution`] from a `format!` style message.
#[macro_export]
macro_rules! exec_err {
    ($($args:expr),* $(,)?) => {
        Err($crate::error::Error::Execution(format!($($args),*)))
    };
}

/// Returns an [`Error::Internal`] from a `format!` style message.
#[macro_export]
macro_rules! internal_err {
    ($($args:expr),* $(,)?) => {
        Err($crate::error::Error::Internal(format!($($args),*)))
    };
}

/// Returns an [`Error::NotImplemented`] from a `format!` style message.
#[macro_export]
macro_rules! not_impl_err {
    ($($args:expr),* $(,)?) => {
        Err($crate::error::Error::NotImplemented(format!($($args),*)))
    };
}

/// Downcasts an `Array` to a concrete array type, returning
/// [`Error::Internal`] when the cast fails.
///
/// Intended for use inside functions returning `Result<_, Error>`; the
/// failure short-circuits with `?`.
#[macro_export]
macro_rules! downcast_value {
    ($VALUE:expr, $TYPE:ty) => {{
        $VALUE
            .as_any()
            .downcast_ref::<$TYPE>()
            .ok_or_else(|| {
                $crate::error::Error::Internal(format!(
                    "could not cast value to {}",
                    std::any::type_name::<$TYPE>()
                ))
            })?
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    fn do_plan() -> Result<()> {
        plan_err!("wrong number of arguments passed to {}", "approx_percentile")
    }

    #[test]
    fn error_display() {
        let err = do_plan().unwrap_err();
        assert!(err.is_user_error());
        assert_eq!(
            err.to_string(),
            "Error during planning: wrong number of arguments passed to \
             approx_percentile"
        );
    }

    #[test]
    fn internal_is_not_user_error() {
        let err: Error = Error::Internal("levels out of order".to_string());
        assert!(!err.is_user_error());
        assert!(err.to_string().contains("please report"));
    }

    #[test]
    fn arrow_error_conversion() {
        let arrow_err = ArrowError::ComputeError("overflow".to_string());
        let err: Error = arrow_err.into();
        assert!(matches!(err, Error::ArrowError(_)));
    }
}
