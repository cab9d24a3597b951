use serde::{Deserialize, Serialize};

use crate::{
    errors::SyncError,
    mirror::{self, Mirror},
    types::{Address, EntityId},
};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContractKind {
    Factory,
    Election,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct EntityRef {
    pub entity_id: EntityId,
    pub ledger_address: Option<Address>,
}

/// A contract instance known to the registry.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct Instance {
    pub kind: ContractKind,
    pub address: Address,
    pub entity_id: Option<EntityId>,
}

impl Instance {
    fn election((entity_id, address): (EntityId, Address)) -> Self {
        Instance {
            kind: ContractKind::Election,
            address,
            entity_id: Some(entity_id),
        }
    }
}

/// Maps elections to their contract addresses and enumerates the contract
/// instances that exist for each kind.
#[derive(Clone)]
pub struct EntityRegistry {
    mirror: Mirror,
    factory: Address,
}

impl EntityRegistry {
    pub fn new(mirror: Mirror, factory: Address) -> Self {
        EntityRegistry { mirror, factory }
    }

    pub fn factory(&self) -> Address {
        self.factory
    }

    pub fn entity(&self, id: EntityId) -> Result<EntityRef, SyncError> {
        let connection = self.mirror.connection()?;
        let election = mirror::get_election(&connection, id)?.ok_or(SyncError::UnknownEntity(id))?;
        Ok(EntityRef {
            entity_id: id,
            ledger_address: election.address,
        })
    }

    pub fn contract_of(&self, id: EntityId) -> Result<Address, SyncError> {
        self.entity(id)?.ledger_address.ok_or(SyncError::NotDeployed(id))
    }

    pub fn entity_by_address(&self, address: &Address) -> Result<Option<EntityId>, SyncError> {
        let connection = self.mirror.connection()?;
        mirror::find_election_by_address(&connection, address)
    }

    /// Records the contract address of an election. Set once: re-attaching the
    /// same address is a no-op, anything else is a conflict.
    pub fn attach_address(&self, id: EntityId, address: &Address) -> Result<(), SyncError> {
        let connection = self.mirror.connection()?;
        let election = mirror::get_election(&connection, id)?.ok_or(SyncError::UnknownEntity(id))?;
        match election.address {
            Some(existing) if existing == *address => return Ok(()),
            Some(existing) => {
                return Err(SyncError::AddressConflict {
                    entity: id,
                    reason: format!("already deployed at {existing}"),
                })
            }
            None => {}
        }
        if let Some(other) = mirror::find_election_by_address(&connection, address)? {
            return Err(SyncError::AddressConflict {
                entity: id,
                reason: format!("{address} belongs to election {other}"),
            });
        }
        if mirror::set_election_address(&connection, id, address)? == 0 {
            return Err(SyncError::AddressConflict {
                entity: id,
                reason: "address was set concurrently".to_string(),
            });
        }
        log::info!("Election {id} attached to {address}");
        Ok(())
    }

    pub fn instances(&self, kind: ContractKind) -> Result<Vec<Instance>, SyncError> {
        match kind {
            ContractKind::Factory => Ok(vec![self.factory_instance()]),
            ContractKind::Election => {
                let connection = self.mirror.connection()?;
                let elections = mirror::list_deployed_elections(&connection)?;
                Ok(elections.into_iter().map(Instance::election).collect())
            }
        }
    }

    pub fn all_instances(&self) -> Result<Vec<Instance>, SyncError> {
        let mut instances = self.instances(ContractKind::Factory)?;
        instances.extend(self.instances(ContractKind::Election)?);
        Ok(instances)
    }

    /// Elections whose mirror creator has `creator` as address.
    pub fn instances_created_by(&self, creator: &Address) -> Result<Vec<Instance>, SyncError> {
        let connection = self.mirror.connection()?;
        let elections = mirror::list_elections_created_by(&connection, creator)?;
        Ok(elections.into_iter().map(Instance::election).collect())
    }

    /// Elections where `voter` has an active mirror membership.
    pub fn instances_registered(&self, voter: &Address) -> Result<Vec<Instance>, SyncError> {
        let connection = self.mirror.connection()?;
        let elections = mirror::list_elections_registered(&connection, voter)?;
        Ok(elections.into_iter().map(Instance::election).collect())
    }

    pub fn factory_instance(&self) -> Instance {
        Instance {
            kind: ContractKind::Factory,
            address: self.factory,
            entity_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mirror::{insert_election, insert_membership},
        testing::{addr, memory_mirror},
    };

    #[test]
    fn address_is_set_once_and_unique() {
        let mirror = memory_mirror();
        let registry = EntityRegistry::new(mirror.clone(), addr(0xf0));
        let (a, b) = {
            let c = mirror.connection().unwrap();
            (insert_election(&c, "a", None).unwrap(), insert_election(&c, "b", None).unwrap())
        };
        assert!(matches!(registry.contract_of(a), Err(SyncError::NotDeployed(_))));
        registry.attach_address(a, &addr(0xe1)).unwrap();
        registry.attach_address(a, &addr(0xe1)).unwrap();
        assert!(matches!(
            registry.attach_address(a, &addr(0xe2)),
            Err(SyncError::AddressConflict { .. })
        ));
        assert!(matches!(
            registry.attach_address(b, &addr(0xe1)),
            Err(SyncError::AddressConflict { .. })
        ));
        assert_eq!(registry.contract_of(a).unwrap(), addr(0xe1));
        assert_eq!(registry.entity_by_address(&addr(0xe1)).unwrap(), Some(a));
        assert!(matches!(registry.entity(77), Err(SyncError::UnknownEntity(77))));
    }

    #[test]
    fn enumerates_instances() {
        let mirror = memory_mirror();
        let registry = EntityRegistry::new(mirror.clone(), addr(0xf0));
        let (a, _b) = {
            let c = mirror.connection().unwrap();
            let a = insert_election(&c, "a", None).unwrap();
            let b = insert_election(&c, "b", None).unwrap();
            insert_membership(&c, a, &addr(0x11), None, 5).unwrap();
            (a, b)
        };
        registry.attach_address(a, &addr(0xe1)).unwrap();
        let all = registry.all_instances().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].kind, ContractKind::Factory);
        assert_eq!(all[1].entity_id, Some(a));
        assert_eq!(registry.instances_registered(&addr(0x11)).unwrap().len(), 1);
        assert!(registry.instances_registered(&addr(0x12)).unwrap().is_empty());
    }
}
