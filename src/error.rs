//! Error types for collection mutations and calculated values.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use crate::NodeId;

/// Errors raised by observable collection mutations.
///
/// All variants are programming errors, never expected or retryable. When one
/// is returned, listener bookkeeping has already been restored and a change
/// has been fired for whatever part of the mutation took effect.
#[derive(Debug, thiserror::Error)]
pub enum CollectionError {
    /// An index was outside the collection. Nothing was mutated.
    #[error("index {index} out of bounds for length {len}")]
    IndexOutOfBounds {
        /// The requested index.
        index: usize,
        /// The collection length at the time of the call.
        len: usize,
    },

    /// A user-supplied bulk action returned an error.
    ///
    /// The collection keeps whatever partial state the action reached.
    #[error("collection action failed: {0}")]
    ActionFailed(anyhow::Error),

    /// A user-supplied bulk action panicked.
    ///
    /// The collection keeps whatever partial state the action reached.
    #[error("collection action panicked: {message}")]
    ActionPanicked {
        /// The panic payload, if it was a string.
        message: String,
    },

    /// A container stopped tracking a node it was not tracking.
    #[error("tracking underflow: {node} is not tracked by its container")]
    TrackingUnderflow {
        /// The element node.
        node: NodeId,
    },
}

impl CollectionError {
    /// Returns the error returned by a failed bulk action.
    pub fn action_error(&self) -> Option<&anyhow::Error> {
        match self {
            CollectionError::ActionFailed(e) => Some(e),
            _ => None,
        }
    }
}

/// Errors raised when reading a calculated value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CalculationError {
    /// The calculation produced no value. The cache stays invalid.
    #[error("calculation of {node} returned no value")]
    AbsentResult {
        /// The calculated node.
        node: NodeId,
    },
}

/// Run a user-supplied action, turning both its error and a panic into a
/// [`CollectionError`].
pub(crate) fn run_guarded<R>(
    action: impl FnOnce() -> anyhow::Result<R>,
) -> Result<R, CollectionError> {
    match panic::catch_unwind(AssertUnwindSafe(action)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(CollectionError::ActionFailed(err)),
        Err(payload) => Err(CollectionError::ActionPanicked {
            message: panic_message(payload.as_ref()),
        }),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_guarded_ok() {
        assert_eq!(run_guarded(|| Ok(7)).unwrap(), 7);
    }

    #[test]
    fn test_run_guarded_wraps_error() {
        let err = run_guarded::<()>(|| Err(anyhow::anyhow!("disk on fire"))).unwrap_err();
        assert!(matches!(err, CollectionError::ActionFailed(_)));
        assert!(err.to_string().contains("disk on fire"));
        assert!(err.action_error().is_some());
    }

    #[test]
    fn test_run_guarded_wraps_panic() {
        let err = run_guarded::<()>(|| panic!("boom {}", 3)).unwrap_err();
        match err {
            CollectionError::ActionPanicked { message } => assert_eq!(message, "boom 3"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_display() {
        let err = CollectionError::IndexOutOfBounds { index: 4, len: 2 };
        assert_eq!(err.to_string(), "index 4 out of bounds for length 2");

        let err = CalculationError::AbsentResult {
            node: NodeId { slot: 0, serial: 9 },
        };
        assert_eq!(err.to_string(), "calculation of #9 returned no value");
    }
}
