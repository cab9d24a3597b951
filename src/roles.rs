use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{
    errors::SyncError,
    ledger::{as_tri, Ledger},
    mirror::{self, Mirror, Role},
    registry::EntityRegistry,
    types::{Address, EntityId, Tri},
};

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum Capability {
    Owner,
    Creator,
    ElectionCreator(EntityId),
}

/// How a caller treats an `Unknown` answer.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub enum UnknownPolicy {
    #[default]
    Deny,
    /// Falls back to the mirror grant. Only for reversible actions that move
    /// nothing of value.
    UseMirrorRole,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CapabilityAssertion {
    pub principal_address: Address,
    pub capability: Capability,
    pub value: Tri,
    /// What the mirror alone would say.
    pub mirror_grant: bool,
}

impl CapabilityAssertion {
    pub fn permits(&self, policy: UnknownPolicy) -> bool {
        match (self.value, policy) {
            (Tri::Unknown, UnknownPolicy::UseMirrorRole) => self.mirror_grant,
            (v, _) => v.permits(),
        }
    }
}

pub struct RoleResolver {
    ledger: Arc<Ledger>,
    mirror: Mirror,
    registry: EntityRegistry,
}

impl RoleResolver {
    pub fn new(ledger: Arc<Ledger>, mirror: Mirror, registry: EntityRegistry) -> Self {
        RoleResolver {
            ledger,
            mirror,
            registry,
        }
    }

    pub async fn resolve(
        &self,
        principal: &Address,
        capability: Capability,
    ) -> Result<CapabilityAssertion, SyncError> {
        let (value, mirror_grant) = match capability {
            Capability::Owner => self.owner(principal).await?,
            Capability::Creator => self.creator(principal).await?,
            Capability::ElectionCreator(entity) => self.election_creator(principal, entity).await?,
        };
        log::debug!("{principal} {capability:?}: {}", value.display());
        Ok(CapabilityAssertion {
            principal_address: *principal,
            capability,
            value,
            mirror_grant,
        })
    }

    fn mirror_role(&self, principal: &Address) -> Result<Option<Role>, SyncError> {
        let connection = self.mirror.connection()?;
        let user = mirror::get_user_by_address(&connection, principal)?;
        Ok(user.map(|u| u.role))
    }

    async fn owner(&self, principal: &Address) -> Result<(Tri, bool), SyncError> {
        if self.mirror_role(principal)? == Some(Role::Owner) {
            return Ok((Tri::Yes, true));
        }
        let value = match self.ledger.factory_owner(&self.registry.factory()).await {
            Ok(owner) => Tri::from(owner == *principal),
            Err(e) => {
                log::warn!("owner(): ledger unavailable ({e})");
                Tri::Unknown
            }
        };
        Ok((value, false))
    }

    async fn creator(&self, principal: &Address) -> Result<(Tri, bool), SyncError> {
        let mirror_grant = matches!(
            self.mirror_role(principal)?,
            Some(Role::Creator | Role::Owner)
        );
        if !mirror_grant {
            return Ok((Tri::No, false));
        }
        let value = as_tri(
            "hasRole(CREATOR)",
            self.ledger.has_creator_role(&self.registry.factory(), principal).await,
        );
        Ok((value, true))
    }

    /// The ledger records the relayer as chairperson of every election, so
    /// only the mirror knows the real creator.
    async fn election_creator(
        &self,
        principal: &Address,
        entity: EntityId,
    ) -> Result<(Tri, bool), SyncError> {
        let (creator, contract) = {
            let connection = self.mirror.connection()?;
            let election = mirror::get_election(&connection, entity)?
                .ok_or(SyncError::UnknownEntity(entity))?;
            let creator = match election.created_by {
                Some(id) => Some(mirror::get_user(&connection, id)?.and_then(|u| u.address)),
                None => None,
            };
            (creator, election.address)
        };
        if let Some(address) = creator {
            let granted = address == Some(*principal);
            return Ok((Tri::from(granted), granted));
        }
        let Some(contract) = contract else {
            return Ok((Tri::Unknown, false));
        };
        let value = match self.ledger.chairperson(&contract).await {
            Ok(chair) => Tri::from(chair == *principal),
            Err(e) => {
                log::warn!("chairperson() of election {entity}: ledger unavailable ({e})");
                Tri::Unknown
            }
        };
        Ok((value, false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mirror::{insert_election, insert_user},
        testing::{addr, Harness, FACTORY, RELAYER},
    };

    fn user(h: &Harness, n: u8, role: Role) -> u32 {
        let c = h.mirror.connection().unwrap();
        insert_user(&c, Some(addr(n)), role).unwrap()
    }

    #[tokio::test]
    async fn mirror_owner_needs_no_ledger() {
        let h = Harness::new();
        user(&h, 0x0a, Role::Owner);
        h.memory.set_unreachable(true);
        let reads = h.memory.read_count();
        let a = h.roles().resolve(&addr(0x0a), Capability::Owner).await.unwrap();
        assert_eq!(a.value, Tri::Yes);
        assert_eq!(h.memory.read_count(), reads);

        // the factory owner on the ledger, unknown to the mirror
        h.memory.set_unreachable(false);
        let a = h.roles().resolve(&addr(0x01), Capability::Owner).await.unwrap();
        assert_eq!(a.value, Tri::Yes);
        assert!(!a.mirror_grant);
    }

    #[tokio::test]
    async fn creator_follows_ledger() {
        let h = Harness::new();
        user(&h, 0x0c, Role::Creator);
        let roles = h.roles();

        // granted in the mirror only: the ledger would revert the action
        let a = roles.resolve(&addr(0x0c), Capability::Creator).await.unwrap();
        assert_eq!(a.value, Tri::No);
        assert!(a.mirror_grant);
        assert!(!a.permits(UnknownPolicy::UseMirrorRole));

        h.memory.grant_creator(addr(FACTORY), addr(0x0c));
        let a = roles.resolve(&addr(0x0c), Capability::Creator).await.unwrap();
        assert_eq!(a.value, Tri::Yes);
    }

    #[tokio::test]
    async fn ledger_role_alone_is_not_enough() {
        let h = Harness::new();
        user(&h, 0x0d, Role::Voter);
        h.memory.grant_creator(addr(FACTORY), addr(0x0d));
        h.memory.grant_creator(addr(FACTORY), addr(0x0e));
        let roles = h.roles();

        let voter = roles.resolve(&addr(0x0d), Capability::Creator).await.unwrap();
        assert_eq!(voter.value, Tri::No);
        assert!(!voter.mirror_grant);
        // no mirror user at all
        let unknown = roles.resolve(&addr(0x0e), Capability::Creator).await.unwrap();
        assert_eq!(unknown.value, Tri::No);
        assert!(!unknown.permits(UnknownPolicy::UseMirrorRole));
    }

    #[tokio::test]
    async fn unknown_creator_denied_by_default() {
        let h = Harness::new();
        user(&h, 0x0c, Role::Creator);
        h.memory.stall(addr(FACTORY));
        let a = h.roles().resolve(&addr(0x0c), Capability::Creator).await.unwrap();
        assert_eq!(a.value, Tri::Unknown);
        assert!(!a.permits(UnknownPolicy::default()));
        assert!(a.permits(UnknownPolicy::UseMirrorRole));

        let stranger = h.roles().resolve(&addr(0x33), Capability::Creator).await.unwrap();
        assert!(!stranger.permits(UnknownPolicy::UseMirrorRole));
    }

    #[tokio::test]
    async fn election_creator_from_mirror_attribution() {
        let h = Harness::new();
        let alice = user(&h, 0xaa, Role::Creator);
        user(&h, 0xbb, Role::Creator);
        let (attributed, orphan) = {
            let c = h.mirror.connection().unwrap();
            (
                insert_election(&c, "attributed", Some(alice)).unwrap(),
                insert_election(&c, "orphan", None).unwrap(),
            )
        };
        h.registry.attach_address(attributed, &addr(0xe1)).unwrap();
        h.registry.attach_address(orphan, &addr(0xe2)).unwrap();
        h.memory.deploy_election(addr(0xe1));
        h.memory.deploy_election(addr(0xe2));
        let roles = h.roles();

        let a = roles.resolve(&addr(0xaa), Capability::ElectionCreator(attributed)).await.unwrap();
        assert_eq!(a.value, Tri::Yes);
        // the relayer is chairperson on the ledger but did not create it
        let r = roles
            .resolve(&addr(RELAYER), Capability::ElectionCreator(attributed))
            .await
            .unwrap();
        assert_eq!(r.value, Tri::No);
        let b = roles.resolve(&addr(0xbb), Capability::ElectionCreator(attributed)).await.unwrap();
        assert_eq!(b.value, Tri::No);

        let o = roles.resolve(&addr(RELAYER), Capability::ElectionCreator(orphan)).await.unwrap();
        assert_eq!(o.value, Tri::Yes);
        h.memory.stall(addr(0xe2));
        let o = roles.resolve(&addr(RELAYER), Capability::ElectionCreator(orphan)).await.unwrap();
        assert_eq!(o.value, Tri::Unknown);
    }
}
