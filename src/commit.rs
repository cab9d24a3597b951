use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::Mutex,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

use crate::{
    errors::SyncError,
    ledger::{LedgerCall, Receipt},
    mirror::{self, VoteFact},
    reconcile::Reconciler,
    types::{Address, ElectionPhase, EntityId, TxHash, UserId},
};

pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// The unit of write serialization.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncKey {
    Vote { entity: EntityId, user: UserId },
    Membership { entity: EntityId, address: Address },
    Entity(EntityId),
}

impl fmt::Display for SyncKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncKey::Vote { entity, user } => write!(f, "vote of user {user} in election {entity}"),
            SyncKey::Membership { entity, address } => {
                write!(f, "membership of {address} in election {entity}")
            }
            SyncKey::Entity(entity) => write!(f, "election {entity}"),
        }
    }
}

/// In-process write locks. Taking a held key fails at once rather than
/// waiting; the mirror's unique constraints back this up across processes.
#[derive(Default)]
pub struct KeyLocks {
    held: Mutex<HashSet<SyncKey>>,
}

pub struct KeyGuard<'a> {
    locks: &'a KeyLocks,
    key: SyncKey,
}

impl KeyLocks {
    pub fn try_lock(&self, key: SyncKey) -> Result<KeyGuard<'_>, SyncError> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if !held.insert(key.clone()) {
            return Err(SyncError::InProgress(key.to_string()));
        }
        Ok(KeyGuard { locks: self, key })
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        let mut held = self.locks.held.lock().unwrap_or_else(|e| e.into_inner());
        held.remove(&self.key);
    }
}

/// A state change requested by the application.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum Operation {
    RegisterVoter {
        voter: Address,
        /// The application user doing the registration. The ledger only ever
        /// sees the relayer.
        registered_by: Option<UserId>,
    },
    RemoveVoter {
        voter: Address,
    },
    CastVote {
        user_id: UserId,
        voter: Address,
        candidate_index: u32,
    },
    TransitionPhase {
        to: ElectionPhase,
    },
    UpdateConfig {
        config: serde_json::Value,
    },
}

impl Operation {
    pub fn key(&self, entity: EntityId) -> SyncKey {
        match self {
            Operation::RegisterVoter { voter, .. } | Operation::RemoveVoter { voter } => {
                SyncKey::Membership {
                    entity,
                    address: *voter,
                }
            }
            Operation::CastVote { user_id, .. } => SyncKey::Vote { entity, user: *user_id },
            Operation::TransitionPhase { .. } | Operation::UpdateConfig { .. } => {
                SyncKey::Entity(entity)
            }
        }
    }

    fn call(&self) -> LedgerCall {
        match self {
            Operation::RegisterVoter { voter, .. } => LedgerCall::RegisterVoter { voter: *voter },
            Operation::RemoveVoter { voter } => LedgerCall::RemoveVoter { voter: *voter },
            Operation::CastVote {
                voter, candidate_index, ..
            } => LedgerCall::CastVote {
                voter: *voter,
                candidate_index: *candidate_index,
            },
            Operation::TransitionPhase { to } => LedgerCall::SetPhase { phase: *to },
            Operation::UpdateConfig { config } => LedgerCall::UpdateConfig {
                config: config.clone(),
            },
        }
    }

    fn mirror_write(&self) -> MirrorWrite {
        match self {
            Operation::RegisterVoter { voter, registered_by } => MirrorWrite::Membership {
                voter: *voter,
                registered_by: *registered_by,
            },
            Operation::RemoveVoter { voter } => MirrorWrite::Removal { voter: *voter },
            Operation::CastVote {
                user_id,
                voter,
                candidate_index,
            } => MirrorWrite::Vote {
                user_id: *user_id,
                voter: *voter,
                candidate_index: *candidate_index,
            },
            Operation::TransitionPhase { to } => MirrorWrite::Phase(*to),
            Operation::UpdateConfig { config } => MirrorWrite::Config(config.clone()),
        }
    }
}

/// What the mirror has to record for a confirmed ledger change.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum MirrorWrite {
    Membership {
        voter: Address,
        registered_by: Option<UserId>,
    },
    Removal {
        voter: Address,
    },
    Vote {
        user_id: UserId,
        voter: Address,
        candidate_index: u32,
    },
    Phase(ElectionPhase),
    Config(serde_json::Value),
    Address(Address),
}

/// A ledger change that is final, with everything needed to re-derive its
/// mirror row without touching the ledger again.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConfirmedChange {
    pub entity_id: EntityId,
    pub write: MirrorWrite,
    pub tx_hash: TxHash,
    pub block_number: u64,
    pub confirmed_at: u64,
}

/// Confirmed changes whose mirror write failed, keyed like the locks.
#[derive(Default)]
pub struct Journal {
    pending: Mutex<HashMap<SyncKey, ConfirmedChange>>,
}

impl Journal {
    fn record(&self, key: SyncKey, change: ConfirmedChange) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.insert(key, change);
    }

    fn get(&self, key: &SyncKey) -> Option<ConfirmedChange> {
        let pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.get(key).cloned()
    }

    fn remove(&self, key: &SyncKey) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.remove(key);
    }

    fn snapshot(&self) -> Vec<(SyncKey, ConfirmedChange)> {
        let pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.iter().map(|(k, c)| (k.clone(), c.clone())).collect()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommitOutcome {
    pub tx_hash: TxHash,
    pub block_number: u64,
    pub mirror_updated: bool,
    /// The ledger change is final but the mirror does not have it yet.
    pub mirror_sync_pending: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeployOutcome {
    pub address: Address,
    pub commit: CommitOutcome,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SweepReport {
    pub healed: usize,
    pub still_pending: usize,
}

impl Reconciler {
    /// Submit, wait for confirmation, then mirror. A mirror failure after
    /// confirmation still reports success, flagged `mirror_sync_pending`.
    /// Nothing is ever re-submitted.
    pub async fn commit_state_change(
        &self,
        entity: EntityId,
        operation: Operation,
    ) -> Result<CommitOutcome, SyncError> {
        let key = operation.key(entity);
        let _guard = self.locks.try_lock(key.clone())?;
        let contract = self.registry.contract_of(entity)?;
        self.precheck(entity, &key, &operation)?;

        let call = operation.call();
        let receipt = self.ledger.submit_and_confirm(&contract, &call).await.map_err(|e| {
            log::warn!("{} for {key} failed: {e}", call.method());
            SyncError::from(e)
        })?;

        let change = ConfirmedChange {
            entity_id: entity,
            write: operation.mirror_write(),
            tx_hash: receipt.transaction_hash,
            block_number: receipt.block_number,
            confirmed_at: now_secs(),
        };
        Ok(self.mirror_or_journal(key, change))
    }

    /// Deploys the election's contract through the factory and records the new
    /// address on the election.
    ///
    /// The election is claimed in the mirror before anything is submitted and
    /// the transaction hash is kept on the row. A claimed election is never
    /// submitted again: a later call recovers the address from that receipt.
    pub async fn deploy_election(&self, entity: EntityId) -> Result<DeployOutcome, SyncError> {
        let key = SyncKey::Entity(entity);
        let _guard = self.locks.try_lock(key.clone())?;
        self.try_replay(&key);
        let election = {
            let connection = self.mirror.connection()?;
            mirror::get_election(&connection, entity)?.ok_or(SyncError::UnknownEntity(entity))?
        };
        if let Some(existing) = election.address {
            return Err(SyncError::AddressConflict {
                entity,
                reason: format!("already deployed at {existing}"),
            });
        }
        if election.deploying {
            return self.recover_deploy(entity, election.deploy_tx).await;
        }
        if self.journal.get(&key).is_some() {
            return Err(SyncError::InProgress(format!("{key} awaits its mirror write")));
        }
        {
            let connection = self.mirror.connection()?;
            if mirror::mark_deploying(&connection, entity)? == 0 {
                return Err(SyncError::InProgress(format!("deployment of {key}")));
            }
        }

        let call = LedgerCall::CreateElection { name: election.name };
        let tx = match self.ledger.submit(&self.registry.factory(), &call).await {
            Ok(tx) => tx,
            Err(e) => {
                // a transient failure may still have reached the ledger
                if !e.is_transient() {
                    self.release_deploy(entity);
                }
                return Err(e.into());
            }
        };
        if let Err(e) = self
            .mirror
            .connection()
            .and_then(|c| mirror::set_deploy_tx(&c, entity, &tx))
        {
            log::warn!("Could not record deployment {tx} of {key}: {e}");
        }
        let receipt = self.ledger.receipt(&tx).await?;
        if !receipt.success {
            self.release_deploy(entity);
            return Err(SyncError::Rejected(format!("{} in {tx}", call.method())));
        }
        self.attach_deployed(entity, receipt)
    }

    async fn recover_deploy(
        &self,
        entity: EntityId,
        deploy_tx: Option<TxHash>,
    ) -> Result<DeployOutcome, SyncError> {
        let Some(tx) = deploy_tx else {
            return Err(SyncError::InProgress(format!(
                "deployment of election {entity} was started but its transaction is unknown"
            )));
        };
        log::info!("Recovering deployment of election {entity} from {tx}");
        let receipt = self.ledger.receipt(&tx).await?;
        if !receipt.success {
            self.release_deploy(entity);
            return Err(SyncError::Rejected(format!("CreateElection in {tx}")));
        }
        self.attach_deployed(entity, receipt)
    }

    fn attach_deployed(
        &self,
        entity: EntityId,
        receipt: Receipt,
    ) -> Result<DeployOutcome, SyncError> {
        let address = receipt
            .find_log("ElectionCreated")
            .and_then(|l| l.arg("election"))
            .and_then(|v| v.as_address())
            .ok_or(SyncError::MissingLog("ElectionCreated"))?;
        let change = ConfirmedChange {
            entity_id: entity,
            write: MirrorWrite::Address(address),
            tx_hash: receipt.transaction_hash,
            block_number: receipt.block_number,
            confirmed_at: now_secs(),
        };
        let commit = self.mirror_or_journal(SyncKey::Entity(entity), change);
        Ok(DeployOutcome { address, commit })
    }

    fn release_deploy(&self, entity: EntityId) {
        if let Err(e) = self
            .mirror
            .connection()
            .and_then(|c| mirror::clear_deploying(&c, entity))
        {
            log::warn!("Could not release deployment claim of election {entity}: {e}");
        }
    }

    /// Brings the election row up to date with confirmed ledger changes:
    /// journaled phase, config or address writes, and a deployment whose
    /// address never reached the mirror. Skipped while a write holds the
    /// election.
    pub(crate) async fn heal_entity(&self, entity: EntityId) {
        let key = SyncKey::Entity(entity);
        let Ok(_guard) = self.locks.try_lock(key.clone()) else {
            return;
        };
        self.try_replay(&key);
        let election = match self
            .mirror
            .connection()
            .and_then(|c| mirror::get_election(&c, entity))
        {
            Ok(Some(election)) => election,
            _ => return,
        };
        if election.address.is_none() && election.deploying && election.deploy_tx.is_some() {
            if let Err(e) = self.recover_deploy(entity, election.deploy_tx).await {
                log::warn!("Deployment of election {entity} not recovered: {e}");
            }
        }
    }

    /// Creates the mirror row for a new election, attributed to the real
    /// creator, then deploys it.
    pub async fn create_election(
        &self,
        name: &str,
        creator: UserId,
    ) -> Result<(EntityId, DeployOutcome), SyncError> {
        let entity = {
            let connection = self.mirror.connection()?;
            mirror::get_user(&connection, creator)?.ok_or(SyncError::UnknownUser(creator))?;
            mirror::insert_election(&connection, name, Some(creator))?
        };
        let outcome = self.deploy_election(entity).await?;
        Ok((entity, outcome))
    }

    /// Replays every journaled change into the mirror.
    pub fn sweep_pending(&self) -> SweepReport {
        let mut report = SweepReport::default();
        for (key, change) in self.journal.snapshot() {
            match self.apply_change(&change) {
                Ok(()) => {
                    self.journal.remove(&key);
                    report.healed += 1;
                }
                Err(e) => {
                    log::warn!("Mirror still behind for {key}: {e}");
                    report.still_pending += 1;
                }
            }
        }
        if report.healed > 0 {
            log::info!("Sweep healed {} mirror rows", report.healed);
        }
        report
    }

    pub fn pending_count(&self) -> usize {
        self.journal.len()
    }

    fn precheck(
        &self,
        entity: EntityId,
        key: &SyncKey,
        operation: &Operation,
    ) -> Result<(), SyncError> {
        let journaled = self.journal.get(key).is_some();
        match operation {
            Operation::CastVote { user_id, .. } => {
                let connection = self.mirror.connection()?;
                if journaled || mirror::find_vote(&connection, entity, *user_id)?.is_some() {
                    return Err(SyncError::AlreadyVoted {
                        entity,
                        user: *user_id,
                    });
                }
            }
            Operation::RegisterVoter { voter, .. } => {
                let connection = self.mirror.connection()?;
                let active = mirror::find_active_membership(&connection, entity, voter)?;
                if journaled || active.is_some() {
                    return Err(SyncError::AlreadyRegistered { entity, voter: *voter });
                }
            }
            _ if journaled && !self.try_replay(key) => {
                return Err(SyncError::InProgress(format!("{key} awaits its mirror write")));
            }
            _ => {}
        }
        Ok(())
    }

    fn mirror_or_journal(&self, key: SyncKey, change: ConfirmedChange) -> CommitOutcome {
        let mut outcome = CommitOutcome {
            tx_hash: change.tx_hash,
            block_number: change.block_number,
            mirror_updated: true,
            mirror_sync_pending: false,
        };
        if let Err(e) = self.apply_change(&change) {
            log::warn!("Mirror write for {key} failed after {} confirmed: {e}", change.tx_hash);
            self.journal.record(key, change);
            outcome.mirror_updated = false;
            outcome.mirror_sync_pending = true;
        }
        outcome
    }

    /// Like `replay`, but a mirror that is still failing only logs.
    pub(crate) fn try_replay(&self, key: &SyncKey) -> bool {
        match self.replay(key) {
            Ok(healed) => healed,
            Err(e) => {
                log::warn!("Mirror still behind for {key}: {e}");
                false
            }
        }
    }

    /// Applies a journaled change for `key`, if any. `Ok(true)` when the
    /// mirror was healed.
    pub(crate) fn replay(&self, key: &SyncKey) -> Result<bool, SyncError> {
        let Some(change) = self.journal.get(key) else {
            return Ok(false);
        };
        self.apply_change(&change)?;
        self.journal.remove(key);
        log::info!("Healed {key} from {}", change.tx_hash);
        Ok(true)
    }

    /// Writes the mirror side of a confirmed change. Idempotent: a row that is
    /// already there counts as written.
    pub(crate) fn apply_change(&self, change: &ConfirmedChange) -> Result<(), SyncError> {
        let entity = change.entity_id;
        if let MirrorWrite::Address(address) = &change.write {
            return self.registry.attach_address(entity, address);
        }
        let connection = self.mirror.connection()?;
        match &change.write {
            MirrorWrite::Membership { voter, registered_by } => {
                if mirror::find_active_membership(&connection, entity, voter)?.is_none() {
                    let r = mirror::insert_membership(
                        &connection,
                        entity,
                        voter,
                        *registered_by,
                        change.block_number,
                    );
                    already_written(r)?;
                }
            }
            MirrorWrite::Removal { voter } => {
                mirror::deactivate_membership(&connection, entity, voter)?;
            }
            MirrorWrite::Vote {
                user_id,
                voter,
                candidate_index,
            } => match mirror::find_vote(&connection, entity, *user_id)? {
                Some(existing) if existing.tx_hash == change.tx_hash => {}
                Some(existing) => {
                    log::warn!(
                        "User {user_id} in election {entity} already has vote {}, ignoring {}",
                        existing.tx_hash,
                        change.tx_hash
                    );
                }
                None => {
                    let vote = VoteFact {
                        entity_id: entity,
                        user_id: *user_id,
                        voter_address: *voter,
                        candidate_index: *candidate_index,
                        tx_hash: change.tx_hash,
                        cast_at: change.confirmed_at,
                    };
                    already_written(mirror::insert_vote(&connection, &vote))?;
                }
            },
            MirrorWrite::Phase(phase) => {
                mirror::set_election_phase(&connection, entity, phase.code())?
            }
            MirrorWrite::Config(config) => {
                mirror::set_election_config(&connection, entity, config)?
            }
            MirrorWrite::Address(_) => {}
        }
        Ok(())
    }
}

/// A unique-constraint hit means another writer got there first.
fn already_written(r: Result<(), SyncError>) -> Result<(), SyncError> {
    match r {
        Err(e) if e.is_constraint_violation() => {
            log::debug!("Mirror row already present: {e}");
            Ok(())
        }
        r => r,
    }
}
