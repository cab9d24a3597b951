use thiserror::Error;

use crate::{
    ledger::LedgerError,
    types::{Address, EntityId, UserId},
};

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Ledger unavailable: {0}")]
    LedgerUnavailable(LedgerError),
    #[error("Ledger rejected the transaction: {0}")]
    Rejected(String),
    #[error("Another write for {0} is in progress")]
    InProgress(String),
    #[error("User {user} already voted in election {entity}")]
    AlreadyVoted { entity: EntityId, user: UserId },
    #[error("{voter} is already registered in election {entity}")]
    AlreadyRegistered { entity: EntityId, voter: Address },
    #[error("Election {0} has no deployed contract")]
    NotDeployed(EntityId),
    #[error("Ledger address conflict for election {entity}: {reason}")]
    AddressConflict { entity: EntityId, reason: String },
    #[error("Unknown election {0}")]
    UnknownEntity(EntityId),
    #[error("Unknown user {0}")]
    UnknownUser(UserId),
    #[error("Invalid address {0}")]
    InvalidAddress(String),
    #[error("Invalid transaction hash {0}")]
    InvalidHash(String),
    #[error("Receipt is missing the {0} log")]
    MissingLog(&'static str),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Pool(#[from] r2d2::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl From<LedgerError> for SyncError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::Reverted(reason) => SyncError::Rejected(reason),
            e => SyncError::LedgerUnavailable(e),
        }
    }
}

impl SyncError {
    /// Unique-constraint hit on the mirror, the last line of the per-key
    /// serialization. Other constraint failures (triggers, NOT NULL) do not
    /// count.
    pub fn is_constraint_violation(&self) -> bool {
        matches!(
            self,
            SyncError::Sqlite(rusqlite::Error::SqliteFailure(e, _))
                if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                    || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
        )
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
