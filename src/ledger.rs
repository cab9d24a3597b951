use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::{
    config::Config,
    types::{Address, ElectionPhase, Tri, TxHash},
};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LedgerError {
    #[error("no contract code at {0}")]
    NoCode(Address),
    #[error("could not decode {0}")]
    Decode(String),
    #[error("ledger unreachable: {0}")]
    Unreachable(String),
    #[error("ledger call timed out after {0:?}")]
    Timeout(Duration),
    #[error("reverted: {0}")]
    Reverted(String),
}

impl LedgerError {
    /// The ledger could not answer. Distinct from a negative answer.
    pub fn is_unavailable(&self) -> bool {
        !matches!(self, LedgerError::Reverted(_))
    }

    /// Worth another attempt for a read.
    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerError::Unreachable(_) | LedgerError::Timeout(_))
    }
}

/// A decoded, ledger-native event or return value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum LogValue {
    Uint(u128),
    Int(i128),
    Bool(bool),
    Address(Address),
    Bytes(#[serde(with = "hex")] Vec<u8>),
    String(String),
    Array(Vec<LogValue>),
}

/// Largest integer a JSON consumer can hold without loss (2^53 - 1).
const JSON_SAFE_INTEGER: u128 = (1 << 53) - 1;

impl LogValue {
    pub fn to_json(&self) -> Value {
        match self {
            LogValue::Uint(v) if *v <= JSON_SAFE_INTEGER => Value::from(*v as u64),
            LogValue::Uint(v) => Value::String(v.to_string()),
            LogValue::Int(v) if v.unsigned_abs() <= JSON_SAFE_INTEGER => Value::from(*v as i64),
            LogValue::Int(v) => Value::String(v.to_string()),
            LogValue::Bool(b) => Value::Bool(*b),
            LogValue::Address(a) => Value::String(a.to_hex()),
            LogValue::Bytes(b) => Value::String(format!("0x{}", hex::encode(b))),
            LogValue::String(s) => Value::String(s.clone()),
            LogValue::Array(vs) => Value::Array(vs.iter().map(|v| v.to_json()).collect()),
        }
    }

    pub fn as_address(&self) -> Option<Address> {
        match self {
            LogValue::Address(a) => Some(*a),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            LogValue::Uint(v) => u64::try_from(*v).ok(),
            LogValue::Int(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }
}

/// One log entry as returned by a filter query.
#[derive(Clone, Debug, PartialEq)]
pub struct RawLog {
    pub address: Address,
    pub event_name: String,
    pub args: Vec<(String, LogValue)>,
    pub block_number: u64,
    pub log_index: u32,
    pub transaction_hash: TxHash,
}

impl RawLog {
    pub fn arg(&self, name: &str) -> Option<&LogValue> {
        self.args.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }
}

/// Per-event-name filter, optionally narrowed on one indexed address argument.
#[derive(Clone, Debug, PartialEq)]
pub struct LogFilter {
    pub address: Address,
    pub event_name: String,
    pub indexed: Option<(String, Address)>,
}

impl LogFilter {
    pub fn new(address: Address, event_name: &str) -> Self {
        LogFilter {
            address,
            event_name: event_name.to_string(),
            indexed: None,
        }
    }

    pub fn with_indexed(mut self, arg: &str, value: Address) -> Self {
        self.indexed = Some((arg.to_string(), value));
        self
    }

    pub fn matches(&self, log: &RawLog) -> bool {
        if log.address != self.address || log.event_name != self.event_name {
            return false;
        }
        match &self.indexed {
            Some((arg, value)) => log.arg(arg).and_then(LogValue::as_address) == Some(*value),
            None => true,
        }
    }
}

/// State-changing calls the core submits. Kept serializable so a confirmed
/// change can be journaled and replayed into the mirror.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "camelCase")]
pub enum LedgerCall {
    CreateElection { name: String },
    RegisterVoter { voter: Address },
    RemoveVoter { voter: Address },
    CastVote { voter: Address, candidate_index: u32 },
    SetPhase { phase: ElectionPhase },
    UpdateConfig { config: Value },
}

impl LedgerCall {
    pub fn method(&self) -> &'static str {
        match self {
            LedgerCall::CreateElection { .. } => "createElection",
            LedgerCall::RegisterVoter { .. } => "registerVoter",
            LedgerCall::RemoveVoter { .. } => "removeVoter",
            LedgerCall::CastVote { .. } => "vote",
            LedgerCall::SetPhase { .. } => "setState",
            LedgerCall::UpdateConfig { .. } => "updateConfig",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Receipt {
    pub transaction_hash: TxHash,
    pub block_number: u64,
    pub success: bool,
    pub logs: Vec<RawLog>,
}

impl Receipt {
    pub fn find_log(&self, event_name: &str) -> Option<&RawLog> {
        self.logs.iter().find(|l| l.event_name == event_name)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub index: u32,
    pub name: String,
}

/// Raw ledger surface. Implementations talk to one chain endpoint; every call
/// is scoped to a contract address where it makes sense.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    async fn block_number(&self) -> Result<u64, LedgerError>;
    async fn block_timestamp(&self, block: u64) -> Result<u64, LedgerError>;
    /// Identity every submission is signed with (the shared relayer).
    fn signer(&self) -> Address;

    async fn phase(&self, contract: &Address) -> Result<u8, LedgerError>;
    async fn is_registered(&self, contract: &Address, voter: &Address) -> Result<bool, LedgerError>;
    async fn has_voted(&self, contract: &Address, voter: &Address) -> Result<bool, LedgerError>;
    async fn can_vote(&self, contract: &Address, voter: &Address) -> Result<bool, LedgerError>;
    async fn candidates(&self, contract: &Address) -> Result<Vec<Candidate>, LedgerError>;
    async fn candidate_votes(&self, contract: &Address, index: u32) -> Result<u64, LedgerError>;
    async fn winner(&self, contract: &Address) -> Result<Option<u32>, LedgerError>;
    async fn chairperson(&self, contract: &Address) -> Result<Address, LedgerError>;
    async fn factory_owner(&self, factory: &Address) -> Result<Address, LedgerError>;
    async fn has_creator_role(
        &self,
        factory: &Address,
        account: &Address,
    ) -> Result<bool, LedgerError>;

    async fn submit(&self, contract: &Address, call: &LedgerCall) -> Result<TxHash, LedgerError>;
    async fn wait_for_receipt(&self, tx: &TxHash) -> Result<Receipt, LedgerError>;
    async fn get_logs(
        &self,
        filter: &LogFilter,
        from: u64,
        to: u64,
    ) -> Result<Vec<RawLog>, LedgerError>;
}

/// The shared ledger handle: one per process, passed by `Arc` to the
/// reconciler, the aggregator and the role resolver. Adds a timeout to every
/// call and bounded retries to reads.
pub struct Ledger {
    client: Arc<dyn LedgerClient>,
    timeout: Duration,
    retries: u32,
    backoff: Duration,
}

impl Ledger {
    pub fn new(client: Arc<dyn LedgerClient>, config: &Config) -> Self {
        Self::with_policy(
            client,
            Duration::from_millis(config.ledger_timeout_ms),
            config.read_retries,
            Duration::from_millis(config.retry_backoff_ms),
        )
    }

    pub fn with_policy(
        client: Arc<dyn LedgerClient>,
        timeout: Duration,
        retries: u32,
        backoff: Duration,
    ) -> Self {
        Ledger {
            client,
            timeout,
            retries,
            backoff,
        }
    }

    pub fn signer(&self) -> Address {
        self.client.signer()
    }

    async fn timed<T, Fut>(&self, fut: Fut) -> Result<T, LedgerError>
    where
        Fut: Future<Output = Result<T, LedgerError>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(r) => r,
            Err(_) => Err(LedgerError::Timeout(self.timeout)),
        }
    }

    async fn read<'a, T, F, Fut>(&'a self, what: &str, f: F) -> Result<T, LedgerError>
    where
        F: Fn(&'a dyn LedgerClient) -> Fut,
        Fut: Future<Output = Result<T, LedgerError>>,
    {
        let mut attempt = 0u32;
        loop {
            match self.timed(f(&*self.client)).await {
                Err(e) if e.is_transient() && attempt < self.retries => {
                    let delay = self.backoff * 2u32.pow(attempt);
                    log::debug!("{what} failed ({e}), retry in {delay:?}");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                r => return r,
            }
        }
    }

    pub async fn block_number(&self) -> Result<u64, LedgerError> {
        self.read("blockNumber", |c| c.block_number()).await
    }

    pub async fn block_timestamp(&self, block: u64) -> Result<u64, LedgerError> {
        self.read("getBlock", |c| c.block_timestamp(block)).await
    }

    pub async fn phase(&self, contract: &Address) -> Result<ElectionPhase, LedgerError> {
        let code = self.read("state", |c| c.phase(contract)).await?;
        ElectionPhase::from_code(code)
            .ok_or_else(|| LedgerError::Decode(format!("state() = {code}")))
    }

    pub async fn is_registered(
        &self,
        contract: &Address,
        voter: &Address,
    ) -> Result<bool, LedgerError> {
        self.read("isRegistered", |c| c.is_registered(contract, voter)).await
    }

    pub async fn has_voted(
        &self,
        contract: &Address,
        voter: &Address,
    ) -> Result<bool, LedgerError> {
        self.read("hasVoted", |c| c.has_voted(contract, voter)).await
    }

    pub async fn can_vote(&self, contract: &Address, voter: &Address) -> Result<bool, LedgerError> {
        self.read("canVote", |c| c.can_vote(contract, voter)).await
    }

    pub async fn candidates(&self, contract: &Address) -> Result<Vec<Candidate>, LedgerError> {
        self.read("getCandidates", |c| c.candidates(contract)).await
    }

    pub async fn candidate_votes(
        &self,
        contract: &Address,
        index: u32,
    ) -> Result<u64, LedgerError> {
        self.read("getVotes", |c| c.candidate_votes(contract, index)).await
    }

    pub async fn winner(&self, contract: &Address) -> Result<Option<u32>, LedgerError> {
        self.read("winner", |c| c.winner(contract)).await
    }

    pub async fn chairperson(&self, contract: &Address) -> Result<Address, LedgerError> {
        self.read("chairperson", |c| c.chairperson(contract)).await
    }

    pub async fn factory_owner(&self, factory: &Address) -> Result<Address, LedgerError> {
        self.read("owner", |c| c.factory_owner(factory)).await
    }

    pub async fn has_creator_role(
        &self,
        factory: &Address,
        account: &Address,
    ) -> Result<bool, LedgerError> {
        self.read("hasRole", |c| c.has_creator_role(factory, account)).await
    }

    pub async fn get_logs(
        &self,
        filter: &LogFilter,
        from: u64,
        to: u64,
    ) -> Result<Vec<RawLog>, LedgerError> {
        self.read("getLogs", |c| c.get_logs(filter, from, to)).await
    }

    /// Submits once. Never retried: a second submission would repeat the
    /// side effect.
    pub async fn submit(
        &self,
        contract: &Address,
        call: &LedgerCall,
    ) -> Result<TxHash, LedgerError> {
        let tx = self.timed(self.client.submit(contract, call)).await?;
        log::info!("Submitted {} to {contract}: {tx}", call.method());
        Ok(tx)
    }

    /// Receipt of an already submitted transaction. Reverted receipts are
    /// returned as is.
    pub async fn receipt(&self, tx: &TxHash) -> Result<Receipt, LedgerError> {
        self.read("getTransactionReceipt", |c| c.wait_for_receipt(tx)).await
    }

    pub async fn submit_and_confirm(
        &self,
        contract: &Address,
        call: &LedgerCall,
    ) -> Result<Receipt, LedgerError> {
        let tx = self.submit(contract, call).await?;
        let receipt = self.receipt(&tx).await?;
        if !receipt.success {
            return Err(LedgerError::Reverted(format!("{} in {tx}", call.method())));
        }
        Ok(receipt)
    }
}

/// Collapses a boolean ledger read into a tri-state, logging why it is
/// unknown.
pub fn as_tri(what: &str, r: Result<bool, LedgerError>) -> Tri {
    match r {
        Ok(b) => Tri::from(b),
        Err(e) => {
            log::warn!("{what}: ledger unavailable ({e})");
            Tri::Unknown
        }
    }
}
