use std::str::FromStr;

use anyhow::{Context, Result};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use serde::{Deserialize, Serialize};

use crate::{db::create_tables, types::Address};

/// Runtime settings, read from the environment (and `.env` if present).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub db_path: String,
    pub factory_address: Address,
    pub ledger_timeout_ms: u64,
    pub read_retries: u32,
    pub retry_backoff_ms: u64,
    pub max_concurrent_queries: usize,
    pub lookback_blocks: u64,
}

impl Config {
    pub fn new(db_path: &str, factory_address: Address) -> Self {
        Config {
            db_path: db_path.to_string(),
            factory_address,
            ledger_timeout_ms: 3000,
            read_retries: 2,
            retry_backoff_ms: 200,
            max_concurrent_queries: 16,
            lookback_blocks: 5000,
        }
    }

    pub fn from_env() -> Result<Self> {
        let _ = dotenv::dotenv();
        let db_path = dotenv::var("MIRROR_DB_PATH").context("MIRROR_DB_PATH is not set")?;
        let factory = dotenv::var("FACTORY_ADDRESS").context("FACTORY_ADDRESS is not set")?;
        let factory_address = factory
            .parse::<Address>()
            .with_context(|| format!("FACTORY_ADDRESS {factory}"))?;
        let mut config = Config::new(&db_path, factory_address);
        override_from_env("LEDGER_TIMEOUT_MS", &mut config.ledger_timeout_ms)?;
        override_from_env("LEDGER_READ_RETRIES", &mut config.read_retries)?;
        override_from_env("LEDGER_RETRY_BACKOFF_MS", &mut config.retry_backoff_ms)?;
        override_from_env("MAX_CONCURRENT_QUERIES", &mut config.max_concurrent_queries)?;
        override_from_env("EVENT_LOOKBACK_BLOCKS", &mut config.lookback_blocks)?;
        if config.max_concurrent_queries == 0 {
            anyhow::bail!("MAX_CONCURRENT_QUERIES must be at least 1");
        }
        Ok(config)
    }

    /// Opens the mirror database and makes sure the schema exists.
    pub fn open_pool(&self) -> Result<Pool<SqliteConnectionManager>> {
        let pool = Pool::new(SqliteConnectionManager::file(&self.db_path))?;
        let connection = pool.get()?;
        create_tables(&connection)?;
        Ok(pool)
    }
}

fn override_from_env<T>(key: &str, value: &mut T) -> Result<()>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    if let Ok(v) = dotenv::var(key) {
        *value = v.parse().with_context(|| format!("{key}={v}"))?;
    }
    Ok(())
}
