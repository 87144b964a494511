//! Routing of asynchronous failures to application callbacks.
//!
//! Callbacks run on the admin coordinator thread and must return quickly. A
//! panicking callback is caught and logged so the coordinator keeps running.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use driver_protocol::Destination;

use crate::error::ClientError;

/// Receives every asynchronous failure not claimed by a narrower handler.
pub trait ErrorHandler: Send + Sync {
    fn on_error(&self, error: &ClientError);
}

impl<F> ErrorHandler for F
where
    F: Fn(&ClientError) + Send + Sync,
{
    fn on_error(&self, error: &ClientError) {
        self(error)
    }
}

/// Receives driver reports that a destination is unreachable or invalid.
pub trait InvalidDestinationHandler: Send + Sync {
    fn on_invalid_destination(&self, destination: &Destination, detail: &str);
}

impl<F> InvalidDestinationHandler for F
where
    F: Fn(&Destination, &str) + Send + Sync,
{
    fn on_invalid_destination(&self, destination: &Destination, detail: &str) {
        self(destination, detail)
    }
}

pub(crate) struct ErrorDispatch {
    general: Option<Arc<dyn ErrorHandler>>,
    invalid_destination: Option<Arc<dyn InvalidDestinationHandler>>,
}

impl ErrorDispatch {
    pub(crate) fn new(
        general: Option<Arc<dyn ErrorHandler>>,
        invalid_destination: Option<Arc<dyn InvalidDestinationHandler>>,
    ) -> Self {
        Self {
            general,
            invalid_destination,
        }
    }

    pub(crate) fn error(&self, error: &ClientError) {
        match &self.general {
            Some(handler) => {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler.on_error(error)));
                if outcome.is_err() {
                    tracing::error!(%error, "error handler panicked");
                }
            }
            None => tracing::error!(%error, "unhandled asynchronous client error"),
        }
    }

    /// Falls back to the general handler when no destination handler is set.
    pub(crate) fn invalid_destination(&self, destination: &Destination, detail: &str) {
        match &self.invalid_destination {
            Some(handler) => {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    handler.on_invalid_destination(destination, detail)
                }));
                if outcome.is_err() {
                    tracing::error!(%destination, "invalid destination handler panicked");
                }
            }
            None => self.error(&ClientError::InvalidDestination {
                destination: Some(destination.clone()),
                detail: detail.to_owned(),
            }),
        }
    }
}
