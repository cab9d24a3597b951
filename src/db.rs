use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;

use crate::errors::SyncError;

pub fn create_tables(connection: &Connection) -> Result<(), SyncError> {
    connection.execute(
        "CREATE TABLE IF NOT EXISTS users(
        id_user INTEGER PRIMARY KEY NOT NULL,
        address TEXT UNIQUE,
        role TEXT NOT NULL DEFAULT 'VOTER')",
        [],
    )?;
    connection.execute(
        "CREATE TABLE IF NOT EXISTS elections(
        id_election INTEGER PRIMARY KEY NOT NULL,
        name TEXT NOT NULL,
        address TEXT UNIQUE,
        created_by INTEGER,
        phase INTEGER NOT NULL DEFAULT 0,
        config TEXT,
        deploying BOOL NOT NULL DEFAULT FALSE,
        deploy_tx TEXT,
        created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')))",
        [],
    )?;
    connection.execute(
        "CREATE TABLE IF NOT EXISTS memberships(
        id_membership INTEGER PRIMARY KEY NOT NULL,
        election INTEGER NOT NULL,
        address TEXT NOT NULL,
        active BOOL NOT NULL,
        registered_by INTEGER,
        registered_at INTEGER NOT NULL)",
        [],
    )?;
    // one active membership per (election, address)
    connection.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS i_membership_active
        ON memberships(election, address) WHERE active",
        [],
    )?;
    connection.execute(
        "CREATE TABLE IF NOT EXISTS votes(
        id_vote INTEGER PRIMARY KEY NOT NULL,
        election INTEGER NOT NULL,
        id_user INTEGER NOT NULL,
        address TEXT NOT NULL,
        candidate INTEGER NOT NULL,
        tx_hash TEXT NOT NULL UNIQUE,
        cast_at INTEGER NOT NULL,
        UNIQUE (election, id_user))",
        [],
    )?;
    Ok(())
}

pub fn drop_tables(connection: &Connection) -> Result<(), SyncError> {
    connection.execute("DROP TABLE IF EXISTS votes", [])?;
    connection.execute("DROP TABLE IF EXISTS memberships", [])?;
    connection.execute("DROP TABLE IF EXISTS elections", [])?;
    connection.execute("DROP TABLE IF EXISTS users", [])?;
    Ok(())
}

pub fn get_connection(
    pool: &Pool<SqliteConnectionManager>,
) -> Result<crate::Connection, SyncError> {
    let connection = pool.get()?;
    Ok(connection)
}
