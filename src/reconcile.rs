use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{
    commit::{now_secs, ConfirmedChange, Journal, KeyLocks, MirrorWrite, SyncKey},
    errors::SyncError,
    ledger::{as_tri, Ledger, LedgerError, LogFilter, LogValue, RawLog},
    mirror::{self, Mirror},
    registry::EntityRegistry,
    types::{Address, ElectionPhase, EntityId, SourceOfTruth, Tri, TxHash, UserId},
};

/// Mirror first, ledger as fallback. An active mirror fact wins even when the
/// ledger disagrees or is down: the mirror holds attribution the relayed
/// ledger writes cannot.
pub fn membership_precedence(mirror_active: bool, ledger: Tri) -> (Tri, SourceOfTruth) {
    match (mirror_active, ledger) {
        (true, Tri::Yes) => (Tri::Yes, SourceOfTruth::Both),
        (true, _) => (Tri::Yes, SourceOfTruth::Mirror),
        (false, Tri::Yes) => (Tri::Yes, SourceOfTruth::Ledger),
        (false, Tri::No) => (Tri::No, SourceOfTruth::Neither),
        (false, Tri::Unknown) => (Tri::Unknown, SourceOfTruth::Neither),
    }
}

/// Acting is irreversible, so it needs the live ledger: the phase must accept
/// votes and the contract must say this address may vote. Never from the
/// mirror alone.
pub fn act_precedence(phase: Option<ElectionPhase>, may_act: Tri) -> Tri {
    let open = match phase {
        Some(p) => Tri::from(p.accepts_votes()),
        None => Tri::Unknown,
    };
    open.and(may_act)
}

pub fn acted_precedence(mirror_vote: bool, ledger: Tri) -> Tri {
    if mirror_vote {
        Tri::Yes
    } else {
        ledger
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MembershipView {
    pub entity_id: EntityId,
    pub principal: Address,
    pub is_member: Tri,
    pub can_act: Tri,
    pub has_acted: Tri,
    pub source: SourceOfTruth,
    pub phase: Option<ElectionPhase>,
    /// Some ledger read could not be answered; the view leans on the mirror.
    pub degraded: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VoteStatus {
    pub entity_id: EntityId,
    pub user_id: UserId,
    pub has_voted: Tri,
    pub candidate_index: Option<u32>,
    pub tx_hash: Option<TxHash>,
    pub source: SourceOfTruth,
    /// The mirror row was missing and has just been re-derived.
    pub healed: bool,
    pub degraded: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CandidateTally {
    pub index: u32,
    pub name: Option<String>,
    pub votes: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Results {
    pub entity_id: EntityId,
    pub candidates: Vec<CandidateTally>,
    pub winner: Option<u32>,
    pub source: SourceOfTruth,
    pub degraded: bool,
}

/// Produces one answer from the mirror and the ledger, and drives the
/// write-then-mirror sequence (see `commit`).
pub struct Reconciler {
    pub(crate) ledger: Arc<Ledger>,
    pub(crate) mirror: Mirror,
    pub(crate) registry: EntityRegistry,
    pub(crate) locks: KeyLocks,
    pub(crate) journal: Journal,
}

impl Reconciler {
    pub fn new(ledger: Arc<Ledger>, mirror: Mirror, registry: EntityRegistry) -> Self {
        Reconciler {
            ledger,
            mirror,
            registry,
            locks: KeyLocks::default(),
            journal: Journal::default(),
        }
    }

    /// Pure read: never writes the mirror.
    pub async fn resolve_membership(
        &self,
        entity: EntityId,
        principal: &Address,
    ) -> Result<MembershipView, SyncError> {
        let (fact, vote, contract) = {
            let connection = self.mirror.connection()?;
            let election = mirror::get_election(&connection, entity)?
                .ok_or(SyncError::UnknownEntity(entity))?;
            let fact = mirror::find_active_membership(&connection, entity, principal)?;
            let vote = mirror::find_vote_by_address(&connection, entity, principal)?;
            (fact, vote, election.address)
        };

        let (registered, voted, may_act, phase) = match contract {
            Some(c) => {
                let (registered, voted, may_act, phase) = tokio::join!(
                    self.ledger.is_registered(&c, principal),
                    self.ledger.has_voted(&c, principal),
                    self.ledger.can_vote(&c, principal),
                    self.ledger.phase(&c),
                );
                let phase = match phase {
                    Ok(p) => Some(p),
                    Err(e) => {
                        log::warn!("state() of election {entity}: ledger unavailable ({e})");
                        None
                    }
                };
                (
                    as_tri("isRegistered", registered),
                    as_tri("hasVoted", voted),
                    as_tri("canVote", may_act),
                    phase,
                )
            }
            None => {
                log::debug!("Election {entity} is not deployed, mirror only");
                (Tri::Unknown, Tri::Unknown, Tri::Unknown, None)
            }
        };

        let (is_member, source) = membership_precedence(fact.is_some(), registered);
        let degraded = !registered.is_known()
            || !voted.is_known()
            || !may_act.is_known()
            || phase.is_none();
        Ok(MembershipView {
            entity_id: entity,
            principal: *principal,
            is_member,
            can_act: act_precedence(phase, may_act),
            has_acted: acted_precedence(vote.is_some(), voted),
            source,
            phase,
            degraded,
        })
    }

    /// Membership read that also closes a mirror gap: a registration the
    /// ledger confirmed but the mirror never recorded.
    pub async fn membership_status(
        &self,
        entity: EntityId,
        principal: &Address,
    ) -> Result<MembershipView, SyncError> {
        self.heal_entity(entity).await;
        let key = SyncKey::Membership {
            entity,
            address: *principal,
        };
        // a journaled registration is confirmed even when the ledger is down
        self.replay(&key)?;
        let view = self.resolve_membership(entity, principal).await?;
        if view.source != SourceOfTruth::Ledger {
            return Ok(view);
        }
        let contract = self.registry.contract_of(entity)?;
        let filter = LogFilter::new(contract, "VoterRegistered").with_indexed("voter", *principal);
        let log = match self.latest_log(&filter).await {
            Ok(Some(log)) => log,
            Ok(None) => return Ok(view),
            Err(e) => {
                log::warn!("Cannot heal membership of {principal} in election {entity}: {e}");
                return Ok(view);
            }
        };
        let change = ConfirmedChange {
            entity_id: entity,
            write: MirrorWrite::Membership {
                voter: *principal,
                // the ledger only knows the relayer; the real registrar is lost
                registered_by: None,
            },
            tx_hash: log.transaction_hash,
            block_number: log.block_number,
            confirmed_at: now_secs(),
        };
        self.apply_change(&change)?;
        log::info!(
            "Healed membership of {principal} in election {entity} from {}",
            log.transaction_hash
        );
        let mut view = view;
        view.source = SourceOfTruth::Both;
        Ok(view)
    }

    /// Per-user vote read. Heals a missing mirror vote from the journaled
    /// confirmation, or failing that from the ledger's own `VoteCast` log.
    pub async fn vote_status(
        &self,
        entity: EntityId,
        user_id: UserId,
    ) -> Result<VoteStatus, SyncError> {
        self.heal_entity(entity).await;
        let (user, vote, contract) = {
            let connection = self.mirror.connection()?;
            let election = mirror::get_election(&connection, entity)?
                .ok_or(SyncError::UnknownEntity(entity))?;
            let user =
                mirror::get_user(&connection, user_id)?.ok_or(SyncError::UnknownUser(user_id))?;
            let vote = mirror::find_vote(&connection, entity, user_id)?;
            (user, vote, election.address)
        };
        let mut status = VoteStatus {
            entity_id: entity,
            user_id,
            has_voted: Tri::No,
            candidate_index: None,
            tx_hash: None,
            source: SourceOfTruth::Neither,
            healed: false,
            degraded: false,
        };
        if let Some(vote) = vote {
            status.has_voted = Tri::Yes;
            status.candidate_index = Some(vote.candidate_index);
            status.tx_hash = Some(vote.tx_hash);
            status.source = SourceOfTruth::Mirror;
            return Ok(status);
        }

        let key = SyncKey::Vote { entity, user: user_id };
        if self.replay(&key)? {
            return self.healed_vote(status);
        }

        let (Some(voter), Some(contract)) = (user.address, contract) else {
            // no address means nothing could have been cast on the ledger
            status.degraded = contract.is_none() && user.address.is_some();
            status.has_voted = if status.degraded { Tri::Unknown } else { Tri::No };
            return Ok(status);
        };
        match as_tri("hasVoted", self.ledger.has_voted(&contract, &voter).await) {
            Tri::Yes => {
                let filter = LogFilter::new(contract, "VoteCast").with_indexed("voter", voter);
                match self.latest_log(&filter).await {
                    Ok(Some(log)) => {
                        let change = self.vote_change_from_log(entity, user_id, voter, &log).await?;
                        self.apply_change(&change)?;
                        log::info!(
                            "Healed vote of user {user_id} in election {entity} from {}",
                            log.transaction_hash
                        );
                        self.healed_vote(status)
                    }
                    Ok(None) | Err(_) => {
                        status.has_voted = Tri::Yes;
                        status.source = SourceOfTruth::Ledger;
                        status.degraded = true;
                        Ok(status)
                    }
                }
            }
            Tri::No => Ok(status),
            Tri::Unknown => {
                status.has_voted = Tri::Unknown;
                status.degraded = true;
                Ok(status)
            }
        }
    }

    fn healed_vote(&self, mut status: VoteStatus) -> Result<VoteStatus, SyncError> {
        let connection = self.mirror.connection()?;
        let vote = mirror::find_vote(&connection, status.entity_id, status.user_id)?;
        status.healed = vote.is_some();
        if let Some(vote) = vote {
            status.has_voted = Tri::Yes;
            status.candidate_index = Some(vote.candidate_index);
            status.tx_hash = Some(vote.tx_hash);
            status.source = SourceOfTruth::Both;
        }
        Ok(status)
    }

    async fn latest_log(&self, filter: &LogFilter) -> Result<Option<RawLog>, LedgerError> {
        let head = self.ledger.block_number().await?;
        let logs = self.ledger.get_logs(filter, 0, head).await?;
        Ok(logs.into_iter().max_by_key(|l| (l.block_number, l.log_index)))
    }

    async fn vote_change_from_log(
        &self,
        entity: EntityId,
        user_id: UserId,
        voter: Address,
        log: &RawLog,
    ) -> Result<ConfirmedChange, SyncError> {
        let candidate_index = log
            .arg("candidateIndex")
            .and_then(LogValue::as_u64)
            .and_then(|v| u32::try_from(v).ok())
            .ok_or(SyncError::MissingLog("VoteCast.candidateIndex"))?;
        let confirmed_at = match self.ledger.block_timestamp(log.block_number).await {
            Ok(t) => t,
            Err(_) => now_secs(),
        };
        Ok(ConfirmedChange {
            entity_id: entity,
            write: MirrorWrite::Vote {
                user_id,
                voter,
                candidate_index,
            },
            tx_hash: log.transaction_hash,
            block_number: log.block_number,
            confirmed_at,
        })
    }

    /// Tally from the ledger, or from mirror votes when the ledger cannot
    /// answer.
    pub async fn election_results(&self, entity: EntityId) -> Result<Results, SyncError> {
        self.heal_entity(entity).await;
        let contract = self.registry.entity(entity)?.ledger_address;
        if let Some(contract) = contract {
            match self.ledger_results(&contract).await {
                Ok((candidates, winner)) => {
                    return Ok(Results {
                        entity_id: entity,
                        candidates,
                        winner,
                        source: SourceOfTruth::Ledger,
                        degraded: false,
                    })
                }
                Err(e) => log::warn!("Results of election {entity} from mirror: {e}"),
            }
        }
        let connection = self.mirror.connection()?;
        let candidates = mirror::count_votes(&connection, entity)?
            .into_iter()
            .map(|(index, votes)| CandidateTally {
                index,
                name: None,
                votes,
            })
            .collect();
        Ok(Results {
            entity_id: entity,
            candidates,
            winner: None,
            source: SourceOfTruth::Mirror,
            degraded: true,
        })
    }

    async fn ledger_results(
        &self,
        contract: &Address,
    ) -> Result<(Vec<CandidateTally>, Option<u32>), LedgerError> {
        let candidates = self.ledger.candidates(contract).await?;
        let mut tallies = Vec::with_capacity(candidates.len());
        for c in candidates {
            let votes = self.ledger.candidate_votes(contract, c.index).await?;
            tallies.push(CandidateTally {
                index: c.index,
                name: Some(c.name),
                votes,
            });
        }
        let winner = self.ledger.winner(contract).await?;
        Ok((tallies, winner))
    }
}
