pub mod aggregate;
pub mod commit;
pub mod config;
pub mod db;
pub mod errors;
pub mod events;
pub mod ledger;
pub mod mirror;
pub mod reconcile;
pub mod registry;
pub mod roles;
pub mod types;

#[cfg(test)]
mod testing;

pub use aggregate::{paginate, Audience, BlockRange, Collected, EventAggregator, Page};
pub use commit::{CommitOutcome, DeployOutcome, Operation, SweepReport};
pub use config::Config;
pub use errors::SyncError;
pub use events::ActivityEvent;
pub use ledger::{Ledger, LedgerCall, LedgerClient, LedgerError, LogFilter, RawLog, Receipt};
pub use mirror::Mirror;
pub use reconcile::{MembershipView, Reconciler, Results, VoteStatus};
pub use registry::{ContractKind, EntityRegistry, Instance};
pub use roles::{Capability, CapabilityAssertion, RoleResolver, UnknownPolicy};
pub use types::{Address, ElectionPhase, EntityId, SourceOfTruth, Tri, TxHash, UserId};

pub type Connection = r2d2::PooledConnection<r2d2_sqlite::SqliteConnectionManager>;
