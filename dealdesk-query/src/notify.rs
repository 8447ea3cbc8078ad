//! User-visible error notifications.

use dealdesk_core::{DealDeskError, ErrorKind};
use std::fmt;
use tracing::{error, warn};

use crate::mutation::MutationId;

/// One failure to surface to the user.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorNotice {
    /// Short title, e.g. "Update failed".
    pub title: String,
    /// What was being attempted, e.g. "update connection request status".
    pub context: String,
    pub error: DealDeskError,
    /// Set when the failure came from a mutation.
    pub mutation_id: Option<MutationId>,
}

impl ErrorNotice {
    pub fn new(context: impl Into<String>, error: DealDeskError) -> Self {
        Self {
            title: title_for(error.kind()).to_string(),
            context: context.into(),
            error,
            mutation_id: None,
        }
    }

    pub fn with_mutation(mut self, mutation_id: MutationId) -> Self {
        self.mutation_id = Some(mutation_id);
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }
}

impl fmt::Display for ErrorNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} ({})", self.title, self.context, self.error)
    }
}

fn title_for(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::Auth => "Please sign in again",
        ErrorKind::Validation => "Invalid input",
        ErrorKind::Transient => "Network problem",
        ErrorKind::Conflict => "Update failed",
        ErrorKind::Internal => "Something went wrong",
    }
}

/// Sink for user-visible failures. Every mutation error reaches it.
pub trait ErrorNotifier: Send + Sync {
    fn notify(&self, notice: ErrorNotice);
}

/// Logs notices through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl ErrorNotifier for TracingNotifier {
    fn notify(&self, notice: ErrorNotice) {
        let mutation_id = notice.mutation_id.map(|id| id.to_string());
        match notice.kind() {
            ErrorKind::Internal => error!(
                title = %notice.title,
                context = %notice.context,
                mutation_id = ?mutation_id,
                error = %notice.error,
                "Operation failed"
            ),
            _ => warn!(
                title = %notice.title,
                context = %notice.context,
                mutation_id = ?mutation_id,
                error = %notice.error,
                "Operation failed"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dealdesk_core::{AuthError, ConflictError, TableName};

    #[test]
    fn test_title_follows_error_kind() {
        let notice = ErrorNotice::new("approve user", AuthError::SessionExpired.into());
        assert_eq!(notice.title, "Please sign in again");

        let notice = ErrorNotice::new(
            "update request",
            ConflictError::ConcurrentModification {
                table: TableName::ConnectionRequests,
                id: "42".to_string(),
            }
            .into(),
        );
        assert_eq!(notice.title, "Update failed");
        assert!(notice.to_string().contains("update request"));
    }

    #[test]
    fn test_tracing_notifier_accepts_notices() {
        let id = MutationId::new();
        TracingNotifier.notify(
            ErrorNotice::new("move deal", AuthError::SessionExpired.into()).with_mutation(id),
        );
    }
}
