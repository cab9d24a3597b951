use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
};

use futures::{stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::{
    config::Config,
    errors::SyncError,
    events::{event_names, normalize, ActivityEvent, VOTER_SCOPED_EVENTS},
    ledger::{Ledger, LogFilter, LogValue, RawLog},
    registry::{ContractKind, EntityRegistry, Instance},
    types::{Address, EntityId},
};

/// Whose feed is being assembled.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(tag = "audience", content = "address", rename_all = "lowercase")]
pub enum Audience {
    Owner,
    Creator(Address),
    Voter(Address),
}

/// Inclusive block range. Missing bounds default to a recent window ending at
/// the chain head.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct BlockRange {
    pub from: Option<u64>,
    pub to: Option<u64>,
}

impl BlockRange {
    pub fn new(from: u64, to: u64) -> Self {
        BlockRange {
            from: Some(from),
            to: Some(to),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SkippedInstance {
    pub kind: ContractKind,
    pub address: Address,
    pub entity_id: Option<EntityId>,
    pub reason: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Collected {
    /// Newest first, one entry per event id.
    pub events: Vec<ActivityEvent>,
    pub skipped: Vec<SkippedInstance>,
    pub from_block: u64,
    pub to_block: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub items: Vec<ActivityEvent>,
    pub total: usize,
    pub offset: usize,
    pub next_offset: Option<usize>,
}

pub fn paginate(events: &[ActivityEvent], offset: usize, limit: usize) -> Page {
    let start = offset.min(events.len());
    let end = start.saturating_add(limit).min(events.len());
    Page {
        items: events[start..end].to_vec(),
        total: events.len(),
        offset: start,
        next_offset: if end < events.len() { Some(end) } else { None },
    }
}

/// Read-only scanner over the ledger logs of every contract instance an
/// audience can see.
///
/// The future returned by [`EventAggregator::collect_events`] only reads, so
/// dropping it part way (a client navigating away) abandons the in-flight
/// queries without leaving anything half-written.
pub struct EventAggregator {
    ledger: Arc<Ledger>,
    registry: EntityRegistry,
    max_concurrent: usize,
    lookback: u64,
}

impl EventAggregator {
    pub fn new(
        ledger: Arc<Ledger>,
        registry: EntityRegistry,
        max_concurrent: usize,
        lookback: u64,
    ) -> Self {
        EventAggregator {
            ledger,
            registry,
            max_concurrent: max_concurrent.max(1),
            lookback,
        }
    }

    pub fn from_config(ledger: Arc<Ledger>, registry: EntityRegistry, config: &Config) -> Self {
        Self::new(ledger, registry, config.max_concurrent_queries, config.lookback_blocks)
    }

    fn instances(&self, audience: &Audience) -> Result<Vec<Instance>, SyncError> {
        match audience {
            Audience::Owner => self.registry.all_instances(),
            Audience::Creator(creator) => {
                let mut instances = vec![self.registry.factory_instance()];
                instances.extend(self.registry.instances_created_by(creator)?);
                Ok(instances)
            }
            Audience::Voter(voter) => self.registry.instances_registered(voter),
        }
    }

    async fn resolve_range(&self, range: BlockRange) -> Result<(u64, u64), SyncError> {
        let to = match range.to {
            Some(to) => to,
            None => self.ledger.block_number().await?,
        };
        let from = range.from.unwrap_or_else(|| to.saturating_sub(self.lookback));
        Ok((from, to))
    }

    pub async fn collect_events(
        &self,
        audience: &Audience,
        range: BlockRange,
    ) -> Result<Collected, SyncError> {
        let instances = self.instances(audience)?;
        let (from, to) = self.resolve_range(range).await?;
        let mut collected = Collected {
            events: vec![],
            skipped: vec![],
            from_block: from,
            to_block: to,
        };
        if from > to || instances.is_empty() {
            return Ok(collected);
        }

        let mut queries = vec![];
        for instance in instances.iter() {
            for name in event_names(instance.kind) {
                queries.push((*instance, LogFilter::new(instance.address, name)));
            }
            if let Audience::Voter(voter) = audience {
                if instance.kind == ContractKind::Election {
                    for name in VOTER_SCOPED_EVENTS {
                        let filter =
                            LogFilter::new(instance.address, name).with_indexed("voter", *voter);
                        queries.push((*instance, filter));
                    }
                }
            }
        }
        log::debug!(
            "Scanning {} instances with {} queries over blocks {from}..={to}",
            instances.len(),
            queries.len()
        );

        let ledger = &self.ledger;
        let results: Vec<_> = stream::iter(queries)
            .map(|(instance, filter)| async move {
                let logs = ledger.get_logs(&filter, from, to).await;
                (instance, logs)
            })
            .buffer_unordered(self.max_concurrent)
            .collect()
            .await;

        let mut skipped: HashMap<Address, SkippedInstance> = HashMap::new();
        for (instance, logs) in results.iter() {
            if let Err(e) = logs {
                skipped.entry(instance.address).or_insert_with(|| {
                    log::warn!("Skipping {:?} instance {}: {e}", instance.kind, instance.address);
                    SkippedInstance {
                        kind: instance.kind,
                        address: instance.address,
                        entity_id: instance.entity_id,
                        reason: e.to_string(),
                    }
                });
            }
        }

        // an instance is either complete or absent
        let own = own_elections(audience, &instances);
        let mut by_id = BTreeMap::new();
        for (instance, logs) in results.iter() {
            let Ok(logs) = logs else { continue };
            if skipped.contains_key(&instance.address) {
                continue;
            }
            for log in logs.iter().filter(|l| visible(audience, &own, instance, l)) {
                by_id
                    .entry((log.block_number, log.log_index))
                    .or_insert_with(|| normalize(instance, log));
            }
        }

        let mut events: Vec<ActivityEvent> = by_id.into_values().rev().collect();
        self.fill_times(&mut events).await;
        collected.events = events;
        collected.skipped = skipped.into_values().collect();
        collected.skipped.sort_by_key(|s| s.address);
        Ok(collected)
    }

    /// Uses the block time for events whose arguments carry none.
    async fn fill_times(&self, events: &mut [ActivityEvent]) {
        let mut blocks: Vec<u64> = events
            .iter()
            .filter(|e| e.occurred_at.is_none())
            .map(|e| e.block_number)
            .collect();
        blocks.dedup();
        if blocks.is_empty() {
            return;
        }
        let ledger = &self.ledger;
        let times: HashMap<u64, u64> = stream::iter(blocks)
            .map(|block| async move { (block, ledger.block_timestamp(block).await) })
            .buffer_unordered(self.max_concurrent)
            .filter_map(|(block, t)| async move {
                match t {
                    Ok(t) => Some((block, t)),
                    Err(e) => {
                        log::debug!("No timestamp for block {block}: {e}");
                        None
                    }
                }
            })
            .collect()
            .await;
        for e in events.iter_mut().filter(|e| e.occurred_at.is_none()) {
            e.occurred_at = times.get(&e.block_number).copied();
        }
    }
}

/// Elections a creator may see factory events about.
fn own_elections(audience: &Audience, instances: &[Instance]) -> HashSet<Address> {
    match audience {
        Audience::Creator(_) => instances
            .iter()
            .filter(|i| i.kind == ContractKind::Election)
            .map(|i| i.address)
            .collect(),
        _ => HashSet::new(),
    }
}

/// Factory events are shared by every creator. A creator only sees the ones
/// naming an election of theirs.
fn visible(audience: &Audience, own: &HashSet<Address>, instance: &Instance, log: &RawLog) -> bool {
    match audience {
        Audience::Creator(_) if instance.kind == ContractKind::Factory => log
            .arg("election")
            .and_then(LogValue::as_address)
            .map_or(false, |a| own.contains(&a)),
        _ => true,
    }
}
