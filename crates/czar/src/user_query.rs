//! Per-user-query record and state machine.

use skyq_common::{QueryId, SessionId};

/// User-query lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserQueryState {
    /// Accepted, not yet rewritten/dispatched.
    Pending,
    /// Chunk jobs are being built and released.
    Dispatching,
    /// Jobs are running on the worker fleet.
    Executing,
    /// Result streams are being merged.
    Merging,
    /// The aggregation fix-up is running.
    Fixup,
    /// Result table is ready for the client.
    Complete,
    /// A permanent error stopped the query.
    Failed,
    /// The user cancelled the query.
    Cancelled,
}

impl UserQueryState {
    /// Whether the state is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            UserQueryState::Complete | UserQueryState::Failed | UserQueryState::Cancelled
        )
    }

    /// Uppercase name recorded in logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            UserQueryState::Pending => "PENDING",
            UserQueryState::Dispatching => "DISPATCHING",
            UserQueryState::Executing => "EXECUTING",
            UserQueryState::Merging => "MERGING",
            UserQueryState::Fixup => "FIXUP",
            UserQueryState::Complete => "COMPLETE",
            UserQueryState::Failed => "FAILED",
            UserQueryState::Cancelled => "CANCELLED",
        }
    }
}

/// One submitted user query, owned by the controller until the client drains
/// the result.
#[derive(Debug, Clone)]
pub struct UserQuery {
    /// Query identifier.
    pub id: QueryId,
    /// Original SQL text.
    pub sql: String,
    /// Default database the statement was resolved against.
    pub default_db: Option<String>,
    /// Session recorded in the message table.
    pub session: SessionId,
    /// Current lifecycle state.
    pub state: UserQueryState,
    /// Client-visible result table.
    pub result_table: String,
    /// Message table released to the shim on completion.
    pub message_table: String,
    /// First permanent error, for failed queries.
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::UserQueryState;

    #[test]
    fn terminal_states() {
        assert!(UserQueryState::Complete.is_terminal());
        assert!(UserQueryState::Failed.is_terminal());
        assert!(UserQueryState::Cancelled.is_terminal());
        assert!(!UserQueryState::Merging.is_terminal());
        assert!(!UserQueryState::Pending.is_terminal());
    }
}
