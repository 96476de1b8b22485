use std::time::Duration;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failure taxonomy of an upgrade run.
///
/// [`Error::Api`] is the transient class: it is the only one the retry
/// helper will re-attempt. Everything else is terminal for the migration.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{context}: {source}")]
    Api {
        context: String,
        #[source]
        source: kube::Error,
    },

    #[error("pod {pod:?} exited with code {exit_code}")]
    PodFailed { pod: String, exit_code: i32 },

    #[error("job {0:?} failed")]
    JobFailed(String),

    #[error("{0}")]
    BindingMismatch(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("did not complete within the configured timeout ({0:?})")]
    TimedOut(Duration),
}

impl Error {
    /// Wraps a Kubernetes API error with the operation that triggered it,
    /// for use as a `map_err` argument.
    pub fn api(context: impl Into<String>) -> impl FnOnce(kube::Error) -> Error {
        let context = context.into();
        move |source| Error::Api { context, source }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled | Error::TimedOut(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::Api { source, .. } if already_exists(source))
    }
}

/// Whether the API rejected the request because the object does not exist.
pub fn not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 404)
}

/// Whether the API rejected a create because the object already exists.
pub fn already_exists(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 409 && response.reason == "AlreadyExists")
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: String::new(),
            reason: reason.into(),
            code,
        })
    }

    #[test]
    fn classifies_not_found() {
        assert!(not_found(&api_error(404, "NotFound")));
        assert!(!not_found(&api_error(409, "AlreadyExists")));
    }

    #[test]
    fn classifies_already_exists() {
        assert!(already_exists(&api_error(409, "AlreadyExists")));
        assert!(!already_exists(&api_error(409, "Conflict")));
        assert!(!already_exists(&api_error(404, "NotFound")));
    }

    #[test]
    fn cancellation_covers_timeouts() {
        assert!(Error::Cancelled.is_cancelled());
        assert!(Error::TimedOut(Duration::from_secs(1)).is_cancelled());
        assert!(!Error::Validation("nope".into()).is_cancelled());
    }

    #[test]
    fn api_wrapper_keeps_context() {
        let err = Error::api("failed to get pv \"pv-1\"")(api_error(404, "NotFound"));
        assert!(err.to_string().starts_with("failed to get pv \"pv-1\":"));
    }
}
