//! In-memory ledger and mirror used by the unit tests.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;

use crate::{
    aggregate::EventAggregator,
    db::create_tables,
    ledger::{
        Candidate, Ledger, LedgerCall, LedgerClient, LedgerError, LogFilter, LogValue, RawLog,
        Receipt,
    },
    mirror::Mirror,
    reconcile::Reconciler,
    registry::EntityRegistry,
    roles::RoleResolver,
    types::{Address, ElectionPhase, TxHash},
};

pub fn addr(n: u8) -> Address {
    let mut bytes = [0u8; 20];
    bytes[19] = n;
    Address(bytes)
}

pub const RELAYER: u8 = 0xee;
pub const FACTORY: u8 = 0xf0;

/// Single-connection in-memory mirror: every checkout sees the same database.
pub fn memory_mirror() -> Mirror {
    let pool = Pool::builder()
        .max_size(1)
        .connection_timeout(Duration::from_secs(2))
        .build(SqliteConnectionManager::memory())
        .unwrap();
    create_tables(&pool.get().unwrap()).unwrap();
    Mirror::new(pool)
}

enum Code {
    Factory {
        owner: Address,
        creators: HashSet<Address>,
    },
    Election {
        phase: u8,
        chairperson: Address,
        voters: HashSet<Address>,
        voted: HashSet<Address>,
        candidates: Vec<String>,
        tally: Vec<u64>,
    },
}

#[derive(Default)]
struct State {
    head: u64,
    contracts: HashMap<Address, Code>,
    stalled: HashSet<Address>,
    logs: Vec<RawLog>,
    receipts: HashMap<TxHash, Receipt>,
    next_tx: u64,
    next_election: u8,
    reads: usize,
    submissions: usize,
    unreachable: bool,
    failing_logs: HashSet<(Address, String)>,
}

/// Deterministic ledger: each submission mines one block.
pub struct MemoryLedger {
    state: Mutex<State>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        let state = State {
            head: 100,
            next_election: 0xe0,
            ..State::default()
        };
        MemoryLedger {
            state: Mutex::new(state),
        }
    }

    pub fn deploy_factory(&self, address: Address, owner: Address) {
        let mut state = self.state.lock().unwrap();
        let mut creators = HashSet::new();
        creators.insert(addr(RELAYER));
        state.contracts.insert(address, Code::Factory { owner, creators });
    }

    /// Puts election code at `address` directly, with two candidates.
    pub fn deploy_election(&self, address: Address) -> Address {
        let mut state = self.state.lock().unwrap();
        state.contracts.insert(address, new_election());
        address
    }

    pub fn grant_creator(&self, factory: Address, account: Address) {
        let mut state = self.state.lock().unwrap();
        if let Some(Code::Factory { creators, .. }) = state.contracts.get_mut(&factory) {
            creators.insert(account);
        }
    }

    pub fn stall(&self, address: Address) {
        self.state.lock().unwrap().stalled.insert(address);
    }

    /// Makes `get_logs` fail for one event of one contract.
    pub fn fail_logs(&self, address: Address, event_name: &str) {
        let mut state = self.state.lock().unwrap();
        state.failing_logs.insert((address, event_name.to_string()));
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unwrap().unreachable = unreachable;
    }

    pub fn set_raw_phase(&self, contract: Address, code: u8) {
        let mut state = self.state.lock().unwrap();
        if let Some(Code::Election { phase, .. }) = state.contracts.get_mut(&contract) {
            *phase = code;
        }
    }

    pub fn set_phase(&self, contract: Address, p: ElectionPhase) {
        self.set_raw_phase(contract, p.code());
    }

    /// Registers directly on the ledger, bypassing the mirror.
    pub fn register_on_ledger(&self, contract: Address, voter: Address) {
        let mut state = self.state.lock().unwrap();
        if let Some(Code::Election { voters, .. }) = state.contracts.get_mut(&contract) {
            voters.insert(voter);
        }
    }

    pub fn set_head(&self, head: u64) {
        self.state.lock().unwrap().head = head;
    }

    pub fn head(&self) -> u64 {
        self.state.lock().unwrap().head
    }

    pub fn read_count(&self) -> usize {
        self.state.lock().unwrap().reads
    }

    pub fn submission_count(&self) -> usize {
        self.state.lock().unwrap().submissions
    }

    /// Appends a log at an explicit position, without touching contract state.
    pub fn push_log(
        &self,
        address: Address,
        event_name: &str,
        args: Vec<(&str, LogValue)>,
        block_number: u64,
        log_index: u32,
    ) {
        let mut state = self.state.lock().unwrap();
        let mut hash = [0u8; 32];
        hash[..8].copy_from_slice(&block_number.to_be_bytes());
        hash[8..12].copy_from_slice(&log_index.to_be_bytes());
        state.logs.push(RawLog {
            address,
            event_name: event_name.to_string(),
            args: args.into_iter().map(|(n, v)| (n.to_string(), v)).collect(),
            block_number,
            log_index,
            transaction_hash: TxHash(hash),
        });
        if block_number > state.head {
            state.head = block_number;
        }
    }

    fn enter(&self, contract: Option<&Address>) -> Result<bool, LedgerError> {
        let mut state = self.state.lock().unwrap();
        state.reads += 1;
        if state.unreachable {
            return Err(LedgerError::Unreachable("connection refused".to_string()));
        }
        Ok(contract.map(|c| state.stalled.contains(c)).unwrap_or(false))
    }

    async fn gate(&self, contract: Option<&Address>) -> Result<(), LedgerError> {
        if self.enter(contract)? {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    fn with_election<T>(
        &self,
        contract: &Address,
        f: impl FnOnce(u8, &Address, &HashSet<Address>, &HashSet<Address>, &[String], &[u64]) -> T,
    ) -> Result<T, LedgerError> {
        let state = self.state.lock().unwrap();
        match state.contracts.get(contract) {
            Some(Code::Election {
                phase,
                chairperson,
                voters,
                voted,
                candidates,
                tally,
            }) => Ok(f(*phase, chairperson, voters, voted, candidates, tally)),
            Some(Code::Factory { .. }) => Err(LedgerError::Decode(
                "factory has no election methods".to_string(),
            )),
            None => Err(LedgerError::NoCode(*contract)),
        }
    }

    fn with_factory<T>(
        &self,
        factory: &Address,
        f: impl FnOnce(&Address, &HashSet<Address>) -> T,
    ) -> Result<T, LedgerError> {
        let state = self.state.lock().unwrap();
        match state.contracts.get(factory) {
            Some(Code::Factory { owner, creators }) => Ok(f(owner, creators)),
            Some(Code::Election { .. }) => Err(LedgerError::Decode(
                "election has no factory methods".to_string(),
            )),
            None => Err(LedgerError::NoCode(*factory)),
        }
    }

    fn apply(&self, contract: &Address, call: &LedgerCall) -> Result<TxHash, LedgerError> {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        state.submissions += 1;
        let signer = addr(RELAYER);
        let mut emitted: Vec<(Address, &str, Vec<(&str, LogValue)>)> = vec![];
        let mut created = None;
        match (state.contracts.get_mut(contract), call) {
            (None, _) => return Err(LedgerError::NoCode(*contract)),
            (Some(Code::Factory { creators, .. }), LedgerCall::CreateElection { name }) => {
                if !creators.contains(&signer) {
                    return Err(LedgerError::Reverted("missing CREATOR_ROLE".to_string()));
                }
                let election = addr(state.next_election);
                created = Some(election);
                emitted.push((
                    *contract,
                    "ElectionCreated",
                    vec![
                        ("election", LogValue::Address(election)),
                        ("creator", LogValue::Address(signer)),
                        ("name", LogValue::String(name.clone())),
                    ],
                ));
            }
            (Some(Code::Election { phase, voters, voted, tally, .. }), call) => match call {
                LedgerCall::RegisterVoter { voter } => {
                    if !voters.insert(*voter) {
                        return Err(LedgerError::Reverted("already registered".to_string()));
                    }
                    emitted.push((
                        *contract,
                        "VoterRegistered",
                        vec![
                            ("voter", LogValue::Address(*voter)),
                            ("registeredBy", LogValue::Address(signer)),
                        ],
                    ));
                }
                LedgerCall::RemoveVoter { voter } => {
                    if !voters.remove(voter) {
                        return Err(LedgerError::Reverted("not registered".to_string()));
                    }
                    emitted.push(
                        (*contract, "VoterRemoved", vec![("voter", LogValue::Address(*voter))]),
                    );
                }
                LedgerCall::CastVote { voter, candidate_index } => {
                    if *phase != ElectionPhase::Voting.code() {
                        return Err(LedgerError::Reverted("voting closed".to_string()));
                    }
                    if !voters.contains(voter) {
                        return Err(LedgerError::Reverted("not registered".to_string()));
                    }
                    if voted.contains(voter) {
                        return Err(LedgerError::Reverted("already voted".to_string()));
                    }
                    let slot = tally
                        .get_mut(*candidate_index as usize)
                        .ok_or_else(|| LedgerError::Reverted("no such candidate".to_string()))?;
                    *slot += 1;
                    voted.insert(*voter);
                    emitted.push((
                        *contract,
                        "VoteCast",
                        vec![
                            ("voter", LogValue::Address(*voter)),
                            ("candidateIndex", LogValue::Uint(*candidate_index as u128)),
                        ],
                    ));
                }
                LedgerCall::SetPhase { phase: to } => {
                    let previous = *phase;
                    *phase = to.code();
                    emitted.push((
                        *contract,
                        "StateChanged",
                        vec![
                            ("previous", LogValue::Uint(previous as u128)),
                            ("current", LogValue::Uint(to.code() as u128)),
                        ],
                    ));
                }
                LedgerCall::UpdateConfig { .. } => {
                    let args = vec![("updatedBy", LogValue::Address(signer))];
                    emitted.push((*contract, "ConfigUpdated", args));
                }
                LedgerCall::CreateElection { .. } => {
                    return Err(LedgerError::Reverted("not a factory".to_string()));
                }
            },
            (Some(Code::Factory { .. }), _) => {
                return Err(LedgerError::Reverted("not an election".to_string()))
            }
        }
        if let Some(election) = created {
            state.contracts.insert(election, new_election());
            if let Some(Code::Election { chairperson, .. }) = state.contracts.get_mut(&election) {
                *chairperson = signer;
            }
            state.next_election += 1;
        }
        state.head += 1;
        state.next_tx += 1;
        let block_number = state.head;
        let mut hash = [0u8; 32];
        hash[0] = 0x7a;
        hash[24..].copy_from_slice(&state.next_tx.to_be_bytes());
        let tx = TxHash(hash);
        let logs: Vec<RawLog> = emitted
            .into_iter()
            .enumerate()
            .map(|(i, (address, name, args))| RawLog {
                address,
                event_name: name.to_string(),
                args: args.into_iter().map(|(n, v)| (n.to_string(), v)).collect(),
                block_number,
                log_index: i as u32,
                transaction_hash: tx,
            })
            .collect();
        state.logs.extend(logs.iter().cloned());
        state.receipts.insert(
            tx,
            Receipt {
                transaction_hash: tx,
                block_number,
                success: true,
                logs,
            },
        );
        Ok(tx)
    }
}

fn new_election() -> Code {
    Code::Election {
        phase: ElectionPhase::Created.code(),
        chairperson: addr(RELAYER),
        voters: HashSet::new(),
        voted: HashSet::new(),
        candidates: vec!["Ada".to_string(), "Grace".to_string()],
        tally: vec![0, 0],
    }
}

#[async_trait]
impl LedgerClient for MemoryLedger {
    async fn block_number(&self) -> Result<u64, LedgerError> {
        self.gate(None).await?;
        Ok(self.head())
    }

    async fn block_timestamp(&self, block: u64) -> Result<u64, LedgerError> {
        self.gate(None).await?;
        Ok(1_700_000_000 + block * 12)
    }

    fn signer(&self) -> Address {
        addr(RELAYER)
    }

    async fn phase(&self, contract: &Address) -> Result<u8, LedgerError> {
        self.gate(Some(contract)).await?;
        self.with_election(contract, |phase, _, _, _, _, _| phase)
    }

    async fn is_registered(
        &self,
        contract: &Address,
        voter: &Address,
    ) -> Result<bool, LedgerError> {
        self.gate(Some(contract)).await?;
        self.with_election(contract, |_, _, voters, _, _, _| voters.contains(voter))
    }

    async fn has_voted(&self, contract: &Address, voter: &Address) -> Result<bool, LedgerError> {
        self.gate(Some(contract)).await?;
        self.with_election(contract, |_, _, _, voted, _, _| voted.contains(voter))
    }

    async fn can_vote(&self, contract: &Address, voter: &Address) -> Result<bool, LedgerError> {
        self.gate(Some(contract)).await?;
        self.with_election(contract, |phase, _, voters, voted, _, _| {
            phase == ElectionPhase::Voting.code()
                && voters.contains(voter)
                && !voted.contains(voter)
        })
    }

    async fn candidates(&self, contract: &Address) -> Result<Vec<Candidate>, LedgerError> {
        self.gate(Some(contract)).await?;
        self.with_election(contract, |_, _, _, _, candidates, _| {
            candidates
                .iter()
                .enumerate()
                .map(|(i, name)| Candidate {
                    index: i as u32,
                    name: name.clone(),
                })
                .collect()
        })
    }

    async fn candidate_votes(&self, contract: &Address, index: u32) -> Result<u64, LedgerError> {
        self.gate(Some(contract)).await?;
        self.with_election(contract, |_, _, _, _, _, tally| tally.get(index as usize).copied())?
            .ok_or_else(|| LedgerError::Decode(format!("candidate {index}")))
    }

    async fn winner(&self, contract: &Address) -> Result<Option<u32>, LedgerError> {
        self.gate(Some(contract)).await?;
        self.with_election(contract, |phase, _, _, _, _, tally| {
            if phase != ElectionPhase::Ended.code() {
                return None;
            }
            let best = tally.iter().copied().max()?;
            let mut leaders = tally.iter().enumerate().filter(|(_, v)| **v == best);
            match (leaders.next(), leaders.next()) {
                (Some((i, _)), None) => Some(i as u32),
                _ => None,
            }
        })
    }

    async fn chairperson(&self, contract: &Address) -> Result<Address, LedgerError> {
        self.gate(Some(contract)).await?;
        self.with_election(contract, |_, chairperson, _, _, _, _| *chairperson)
    }

    async fn factory_owner(&self, factory: &Address) -> Result<Address, LedgerError> {
        self.gate(Some(factory)).await?;
        self.with_factory(factory, |owner, _| *owner)
    }

    async fn has_creator_role(
        &self,
        factory: &Address,
        account: &Address,
    ) -> Result<bool, LedgerError> {
        self.gate(Some(factory)).await?;
        self.with_factory(factory, |_, creators| creators.contains(account))
    }

    async fn submit(&self, contract: &Address, call: &LedgerCall) -> Result<TxHash, LedgerError> {
        self.gate(Some(contract)).await?;
        self.apply(contract, call)
    }

    async fn wait_for_receipt(&self, tx: &TxHash) -> Result<Receipt, LedgerError> {
        let state = self.state.lock().unwrap();
        state
            .receipts
            .get(tx)
            .cloned()
            .ok_or_else(|| LedgerError::Unreachable(format!("unknown transaction {tx}")))
    }

    async fn get_logs(
        &self,
        filter: &LogFilter,
        from: u64,
        to: u64,
    ) -> Result<Vec<RawLog>, LedgerError> {
        self.gate(Some(&filter.address)).await?;
        let state = self.state.lock().unwrap();
        if !state.contracts.contains_key(&filter.address) {
            return Err(LedgerError::NoCode(filter.address));
        }
        if state
            .failing_logs
            .contains(&(filter.address, filter.event_name.clone()))
        {
            return Err(LedgerError::Decode(format!("{} logs", filter.event_name)));
        }
        Ok(state
            .logs
            .iter()
            .filter(|l| filter.matches(l) && l.block_number >= from && l.block_number <= to)
            .cloned()
            .collect())
    }
}

/// Everything wired together the way a host process would, on top of the
/// in-memory ledger and mirror.
pub struct Harness {
    pub memory: Arc<MemoryLedger>,
    pub ledger: Arc<Ledger>,
    pub mirror: Mirror,
    pub registry: EntityRegistry,
}

impl Harness {
    pub fn new() -> Self {
        let memory = Arc::new(MemoryLedger::new());
        memory.deploy_factory(addr(FACTORY), addr(0x01));
        let ledger = Arc::new(Ledger::with_policy(
            memory.clone(),
            Duration::from_millis(50),
            1,
            Duration::from_millis(1),
        ));
        let mirror = memory_mirror();
        let registry = EntityRegistry::new(mirror.clone(), addr(FACTORY));
        Harness {
            memory,
            ledger,
            mirror,
            registry,
        }
    }

    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(self.ledger.clone(), self.mirror.clone(), self.registry.clone())
    }

    pub fn aggregator(&self) -> EventAggregator {
        EventAggregator::new(self.ledger.clone(), self.registry.clone(), 4, 1000)
    }

    pub fn roles(&self) -> RoleResolver {
        RoleResolver::new(self.ledger.clone(), self.mirror.clone(), self.registry.clone())
    }
}
