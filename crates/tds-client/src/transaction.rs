//! Transactions and isolation levels.

use tds_wire::tman::TmIsolationLevel;

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    /// Dirty reads allowed.
    ReadUncommitted,
    /// Only committed data is read. The server default.
    #[default]
    ReadCommitted,
    /// Rows read stay stable for the transaction.
    RepeatableRead,
    /// Full isolation.
    Serializable,
    /// Row-versioned point-in-time view.
    Snapshot,
}

impl IsolationLevel {
    /// The wire byte used in a begin-transaction request.
    #[must_use]
    pub const fn tm_level(self) -> TmIsolationLevel {
        match self {
            Self::ReadUncommitted => TmIsolationLevel::ReadUncommitted,
            Self::ReadCommitted => TmIsolationLevel::ReadCommitted,
            Self::RepeatableRead => TmIsolationLevel::RepeatableRead,
            Self::Serializable => TmIsolationLevel::Serializable,
            Self::Snapshot => TmIsolationLevel::Snapshot,
        }
    }

    /// The level's name in T-SQL.
    #[must_use]
    pub const fn as_sql(self) -> &'static str {
        match self {
            Self::ReadUncommitted => "READ UNCOMMITTED",
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
            Self::Snapshot => "SNAPSHOT",
        }
    }
}

/// An open transaction as the client tracks it.
///
/// The server's view lives in the descriptor stack; this records what the
/// caller asked for so commit and rollback can name the right scope.
#[derive(Debug, Clone)]
pub struct Transaction {
    /// Name passed to begin; may be empty.
    pub name: String,
    /// Isolation level it was begun with.
    pub isolation: IsolationLevel,
}

impl Transaction {
    /// Track a new transaction.
    #[must_use]
    pub fn new(name: impl Into<String>, isolation: IsolationLevel) -> Self {
        Self {
            name: name.into(),
            isolation,
        }
    }
}
