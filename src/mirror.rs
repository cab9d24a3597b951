use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{
    params, params_from_iter,
    types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef},
    OptionalExtension,
};
use serde::{Deserialize, Serialize};

use crate::{
    db::get_connection,
    errors::SyncError,
    types::{Address, EntityId, SourceOfTruth, TxHash, UserId},
    Connection,
};

/// Cloneable handle on the relational mirror.
#[derive(Clone)]
pub struct Mirror {
    pool: Pool<SqliteConnectionManager>,
}

impl Mirror {
    pub fn new(pool: Pool<SqliteConnectionManager>) -> Self {
        Mirror { pool }
    }

    /// Connections must not be held across an `.await`.
    pub fn connection(&self) -> Result<Connection, SyncError> {
        get_connection(&self.pool)
    }
}

impl ToSql for Address {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.to_hex()))
    }
}

impl FromSql for Address {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        s.parse().map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

impl ToSql for TxHash {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.to_hex()))
    }
}

impl FromSql for TxHash {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        s.parse().map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    Owner,
    Creator,
    Voter,
}

impl Role {
    fn as_str(self) -> &'static str {
        match self {
            Role::Owner => "OWNER",
            Role::Creator => "CREATOR",
            Role::Voter => "VOTER",
        }
    }
}

impl ToSql for Role {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Role {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
            "OWNER" => Ok(Role::Owner),
            "CREATOR" => Ok(Role::Creator),
            "VOTER" => Ok(Role::Voter),
            _ => Err(FromSqlError::InvalidType),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserRow {
    pub id: UserId,
    pub address: Option<Address>,
    pub role: Role,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ElectionRow {
    pub id: EntityId,
    pub name: String,
    pub address: Option<Address>,
    pub created_by: Option<UserId>,
    pub phase: u8,
    pub config: Option<serde_json::Value>,
    /// A factory deployment was started and may have reached the ledger.
    pub deploying: bool,
    pub deploy_tx: Option<TxHash>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MembershipFact {
    pub entity_id: EntityId,
    pub principal_address: Address,
    pub is_active: bool,
    pub registered_by: Option<UserId>,
    pub registered_at: u64,
    pub source_of_truth: SourceOfTruth,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VoteFact {
    pub entity_id: EntityId,
    pub user_id: UserId,
    pub voter_address: Address,
    pub candidate_index: u32,
    pub tx_hash: TxHash,
    pub cast_at: u64,
}

pub fn insert_user(
    connection: &Connection,
    address: Option<Address>,
    role: Role,
) -> Result<UserId, SyncError> {
    connection.execute(
        "INSERT INTO users(address, role) VALUES (?1, ?2)",
        params![address, role],
    )?;
    Ok(connection.last_insert_rowid() as UserId)
}

pub fn get_user(connection: &Connection, id: UserId) -> Result<Option<UserRow>, SyncError> {
    let user = connection
        .query_row(
            "SELECT id_user, address, role FROM users WHERE id_user = ?1",
            [id],
            |r| {
                Ok(UserRow {
                    id: r.get(0)?,
                    address: r.get(1)?,
                    role: r.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(user)
}

pub fn get_user_by_address(
    connection: &Connection,
    address: &Address,
) -> Result<Option<UserRow>, SyncError> {
    let user = connection
        .query_row(
            "SELECT id_user, address, role FROM users WHERE address = ?1",
            [address],
            |r| {
                Ok(UserRow {
                    id: r.get(0)?,
                    address: r.get(1)?,
                    role: r.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(user)
}

pub fn insert_election(
    connection: &Connection,
    name: &str,
    created_by: Option<UserId>,
) -> Result<EntityId, SyncError> {
    connection.execute(
        "INSERT INTO elections(name, created_by) VALUES (?1, ?2)",
        params![name, created_by],
    )?;
    Ok(connection.last_insert_rowid() as EntityId)
}

pub fn get_election(
    connection: &Connection,
    id: EntityId,
) -> Result<Option<ElectionRow>, SyncError> {
    let row = connection
        .query_row(
            "SELECT id_election, name, address, created_by, phase, config, deploying, deploy_tx
            FROM elections WHERE id_election = ?1",
            [id],
            |r| {
                let config: Option<String> = r.get(5)?;
                Ok((
                    ElectionRow {
                        id: r.get(0)?,
                        name: r.get(1)?,
                        address: r.get(2)?,
                        created_by: r.get(3)?,
                        phase: r.get(4)?,
                        config: None,
                        deploying: r.get(6)?,
                        deploy_tx: r.get(7)?,
                    },
                    config,
                ))
            },
        )
        .optional()?;
    match row {
        Some((mut election, Some(config))) => {
            election.config = Some(serde_json::from_str(&config)?);
            Ok(Some(election))
        }
        Some((election, None)) => Ok(Some(election)),
        None => Ok(None),
    }
}

pub fn find_election_by_address(
    connection: &Connection,
    address: &Address,
) -> Result<Option<EntityId>, SyncError> {
    let id = connection
        .query_row(
            "SELECT id_election FROM elections WHERE address = ?1",
            [address],
            |r| r.get(0),
        )
        .optional()?;
    Ok(id)
}

/// Sets the ledger address only if none is recorded yet. Returns the number
/// of rows changed.
pub fn set_election_address(
    connection: &Connection,
    id: EntityId,
    address: &Address,
) -> Result<usize, SyncError> {
    let n = connection.execute(
        "UPDATE elections SET address = ?2 WHERE id_election = ?1 AND address IS NULL",
        params![id, address],
    )?;
    Ok(n)
}

/// Claims the deployment of an undeployed election. Returns 0 when another
/// deployment was already started.
pub fn mark_deploying(connection: &Connection, id: EntityId) -> Result<usize, SyncError> {
    let n = connection.execute(
        "UPDATE elections SET deploying = TRUE
        WHERE id_election = ?1 AND address IS NULL AND NOT deploying",
        [id],
    )?;
    Ok(n)
}

pub fn set_deploy_tx(connection: &Connection, id: EntityId, tx: &TxHash) -> Result<(), SyncError> {
    connection.execute(
        "UPDATE elections SET deploy_tx = ?2 WHERE id_election = ?1",
        params![id, tx],
    )?;
    Ok(())
}

/// Releases a deployment claim that never produced a ledger contract.
pub fn clear_deploying(connection: &Connection, id: EntityId) -> Result<(), SyncError> {
    connection.execute(
        "UPDATE elections SET deploying = FALSE, deploy_tx = NULL WHERE id_election = ?1",
        [id],
    )?;
    Ok(())
}

pub fn set_election_phase(
    connection: &Connection,
    id: EntityId,
    phase: u8,
) -> Result<(), SyncError> {
    connection.execute(
        "UPDATE elections SET phase = ?2 WHERE id_election = ?1",
        params![id, phase],
    )?;
    Ok(())
}

pub fn set_election_config(
    connection: &Connection,
    id: EntityId,
    config: &serde_json::Value,
) -> Result<(), SyncError> {
    connection.execute(
        "UPDATE elections SET config = ?2 WHERE id_election = ?1",
        params![id, serde_json::to_string(config)?],
    )?;
    Ok(())
}

fn list_addresses(
    connection: &Connection,
    sql: &str,
    param: Option<&Address>,
) -> Result<Vec<(EntityId, Address)>, SyncError> {
    let mut s = connection.prepare(sql)?;
    let rows = s.query_map(params_from_iter(param.iter()), |r| Ok((r.get(0)?, r.get(1)?)))?;
    let mut instances = vec![];
    for r in rows {
        instances.push(r?);
    }
    Ok(instances)
}

pub fn list_deployed_elections(
    connection: &Connection,
) -> Result<Vec<(EntityId, Address)>, SyncError> {
    list_addresses(
        connection,
        "SELECT id_election, address FROM elections WHERE address IS NOT NULL ORDER BY id_election",
        None,
    )
}

pub fn list_elections_created_by(
    connection: &Connection,
    creator: &Address,
) -> Result<Vec<(EntityId, Address)>, SyncError> {
    list_addresses(
        connection,
        "SELECT e.id_election, e.address FROM elections e JOIN users u ON u.id_user = e.created_by
        WHERE u.address = ?1 AND e.address IS NOT NULL ORDER BY e.id_election",
        Some(creator),
    )
}

pub fn list_elections_registered(
    connection: &Connection,
    voter: &Address,
) -> Result<Vec<(EntityId, Address)>, SyncError> {
    list_addresses(
        connection,
        "SELECT e.id_election, e.address FROM elections e
        JOIN memberships m ON m.election = e.id_election
        WHERE m.address = ?1 AND m.active AND e.address IS NOT NULL ORDER BY e.id_election",
        Some(voter),
    )
}

pub fn find_active_membership(
    connection: &Connection,
    entity: EntityId,
    address: &Address,
) -> Result<Option<MembershipFact>, SyncError> {
    let fact = connection
        .query_row(
            "SELECT registered_by, registered_at FROM memberships
            WHERE election = ?1 AND address = ?2 AND active",
            params![entity, address],
            |r| {
                Ok(MembershipFact {
                    entity_id: entity,
                    principal_address: *address,
                    is_active: true,
                    registered_by: r.get(0)?,
                    registered_at: r.get(1)?,
                    source_of_truth: SourceOfTruth::Mirror,
                })
            },
        )
        .optional()?;
    Ok(fact)
}

pub fn insert_membership(
    connection: &Connection,
    entity: EntityId,
    address: &Address,
    registered_by: Option<UserId>,
    registered_at: u64,
) -> Result<(), SyncError> {
    connection.execute(
        "INSERT INTO memberships(election, address, active, registered_by, registered_at)
        VALUES (?1, ?2, TRUE, ?3, ?4)",
        params![entity, address, registered_by, registered_at],
    )?;
    Ok(())
}

pub fn deactivate_membership(
    connection: &Connection,
    entity: EntityId,
    address: &Address,
) -> Result<usize, SyncError> {
    let n = connection.execute(
        "UPDATE memberships SET active = FALSE WHERE election = ?1 AND address = ?2 AND active",
        params![entity, address],
    )?;
    Ok(n)
}

fn vote_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<VoteFact> {
    Ok(VoteFact {
        entity_id: r.get(0)?,
        user_id: r.get(1)?,
        voter_address: r.get(2)?,
        candidate_index: r.get(3)?,
        tx_hash: r.get(4)?,
        cast_at: r.get(5)?,
    })
}

pub fn find_vote(
    connection: &Connection,
    entity: EntityId,
    user: UserId,
) -> Result<Option<VoteFact>, SyncError> {
    let vote = connection
        .query_row(
            "SELECT election, id_user, address, candidate, tx_hash, cast_at FROM votes
            WHERE election = ?1 AND id_user = ?2",
            params![entity, user],
            vote_from_row,
        )
        .optional()?;
    Ok(vote)
}

pub fn find_vote_by_address(
    connection: &Connection,
    entity: EntityId,
    address: &Address,
) -> Result<Option<VoteFact>, SyncError> {
    let vote = connection
        .query_row(
            "SELECT election, id_user, address, candidate, tx_hash, cast_at FROM votes
            WHERE election = ?1 AND address = ?2",
            params![entity, address],
            vote_from_row,
        )
        .optional()?;
    Ok(vote)
}

pub fn insert_vote(connection: &Connection, vote: &VoteFact) -> Result<(), SyncError> {
    connection.execute(
        "INSERT INTO votes(election, id_user, address, candidate, tx_hash, cast_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            vote.entity_id,
            vote.user_id,
            vote.voter_address,
            vote.candidate_index,
            vote.tx_hash,
            vote.cast_at
        ],
    )?;
    Ok(())
}

/// Mirror tally per candidate index.
pub fn count_votes(
    connection: &Connection,
    entity: EntityId,
) -> Result<Vec<(u32, u64)>, SyncError> {
    let mut s = connection.prepare(
        "SELECT candidate, COUNT(*) FROM votes WHERE election = ?1
        GROUP BY candidate ORDER BY candidate",
    )?;
    let rows = s.query_map([entity], |r| Ok((r.get::<_, u32>(0)?, r.get::<_, u64>(1)?)))?;
    let mut counts = vec![];
    for r in rows {
        counts.push(r?);
    }
    Ok(counts)
}
