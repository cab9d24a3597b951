use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    ledger::{LogValue, RawLog},
    registry::{ContractKind, Instance},
    types::{Address, TxHash},
};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ActionLabel {
    pub label: &'static str,
    pub icon: &'static str,
}

pub const DEFAULT_ICON: &str = "activity";

lazy_static::lazy_static! {
    static ref ACTION_LABELS: HashMap<&'static str, ActionLabel> = {
        let entries: &[(&str, &str, &str)] = &[
            ("ElectionCreated", "Election created", "plus-circle"),
            ("ElectionDeleted", "Election deleted", "trash"),
            ("CandidateAdded", "Candidate added", "user-plus"),
            ("CandidateRemoved", "Candidate removed", "user-minus"),
            ("VoterRegistered", "Voter registered", "user-check"),
            ("VoterRemoved", "Voter removed", "user-x"),
            ("VoterApproved", "Voter approved", "check-circle"),
            ("VoteCast", "Vote cast", "check-square"),
            ("StateChanged", "Election phase changed", "refresh-cw"),
            ("ElectionStarted", "Voting opened", "play"),
            ("ElectionEnded", "Voting closed", "square"),
            ("ConfigUpdated", "Election settings updated", "settings"),
            ("ResultsPublished", "Results published", "bar-chart"),
            ("WinnerDeclared", "Winner declared", "award"),
            ("CreatorAdded", "Creator added", "shield"),
            ("CreatorRemoved", "Creator removed", "shield-off"),
            ("RoleGranted", "Role granted", "key"),
            ("RoleRevoked", "Role revoked", "lock"),
            ("OwnershipTransferred", "Ownership transferred", "repeat"),
            ("Transfer", "Token transferred", "send"),
            ("BadgeMinted", "Participation badge minted", "star"),
        ];
        entries
            .iter()
            .map(|&(name, label, icon)| (name, ActionLabel { label, icon }))
            .collect()
    };
}

/// Label for an event name. Total: unknown names label themselves.
pub fn action_label(event_name: &str) -> (String, &'static str) {
    match ACTION_LABELS.get(event_name) {
        Some(a) => (a.label.to_string(), a.icon),
        None => (event_name.to_string(), DEFAULT_ICON),
    }
}

/// Events worth querying for each contract kind.
pub fn event_names(kind: ContractKind) -> &'static [&'static str] {
    match kind {
        ContractKind::Factory => &[
            "ElectionCreated",
            "ElectionDeleted",
            "CreatorAdded",
            "CreatorRemoved",
            "RoleGranted",
            "RoleRevoked",
            "OwnershipTransferred",
        ],
        ContractKind::Election => &[
            "CandidateAdded",
            "CandidateRemoved",
            "VoterRegistered",
            "VoterRemoved",
            "VoterApproved",
            "VoteCast",
            "StateChanged",
            "ElectionStarted",
            "ElectionEnded",
            "ConfigUpdated",
            "ResultsPublished",
            "WinnerDeclared",
        ],
    }
}

/// Event names carrying the indexed `voter` argument.
pub const VOTER_SCOPED_EVENTS: &[&str] =
    &["VoterRegistered", "VoterRemoved", "VoterApproved", "VoteCast"];

/// Argument names that may hold "who did this", in order of preference.
const ACTOR_FIELDS: &[&str] = &[
    "creator",
    "voter",
    "registeredBy",
    "approver",
    "minter",
    "chairperson",
    "owner",
    "account",
    "sender",
    "from",
];

const TIME_FIELDS: &[&str] = &["timestamp", "time", "createdAt", "castAt"];

/// Best effort: the first actor-like argument holding an address.
pub fn extract_actor(log: &RawLog) -> Option<Address> {
    ACTOR_FIELDS
        .iter()
        .find_map(|f| log.arg(f).and_then(LogValue::as_address))
}

pub fn extract_time(log: &RawLog) -> Option<u64> {
    TIME_FIELDS.iter().find_map(|f| log.arg(f).and_then(LogValue::as_u64))
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEvent {
    pub id: String,
    pub contract_kind: ContractKind,
    pub contract_address: Address,
    pub entity_id: Option<u32>,
    pub event_name: String,
    pub normalized_action: String,
    pub icon: String,
    pub actor_address: Option<Address>,
    pub raw_args: Value,
    pub block_number: u64,
    pub log_index: u32,
    pub transaction_hash: TxHash,
    pub occurred_at: Option<u64>,
}

pub fn event_id(block_number: u64, log_index: u32) -> String {
    format!("{block_number}:{log_index}")
}

/// Maps one raw log to the common activity shape. `occurred_at` is taken from
/// the arguments here; the aggregator fills it from the block when absent.
pub fn normalize(instance: &Instance, log: &RawLog) -> ActivityEvent {
    let (label, icon) = action_label(&log.event_name);
    let mut args = Map::new();
    for (name, value) in log.args.iter() {
        args.insert(name.clone(), value.to_json());
    }
    ActivityEvent {
        id: event_id(log.block_number, log.log_index),
        contract_kind: instance.kind,
        contract_address: log.address,
        entity_id: instance.entity_id,
        event_name: log.event_name.clone(),
        normalized_action: label,
        icon: icon.to_string(),
        actor_address: extract_actor(log),
        raw_args: Value::Object(args),
        block_number: log.block_number,
        log_index: log.log_index,
        transaction_hash: log.transaction_hash,
        occurred_at: extract_time(log),
    }
}
