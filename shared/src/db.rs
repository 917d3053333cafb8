//! Database connection management.
//!
//! Handlers never hold a connection of their own. They borrow one from a
//! [`Database`] through a [`Session`], which opens it on first use and closes it
//! (or hands it back to the pool) when the invocation finishes. A request that
//! fails validation therefore never touches the database.

use std::ops::{Deref, DerefMut};
use std::time::Duration;

use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::{Connection, Postgres};
use tracing::info;

use crate::config::{Config, ConnectionMode};
use crate::Result;

/// Source of database connections, chosen once at start-up.
#[derive(Debug, Clone)]
pub enum Database {
    /// A fresh connection per invocation.
    PerRequest { url: String },
    /// Connections borrowed from a shared pool.
    Pooled(PgPool),
}

impl Database {
    /// Build the connection source described by the configuration.
    pub async fn from_config(config: &Config) -> Result<Self> {
        match config.connection_mode {
            ConnectionMode::PerRequest => Ok(Self::PerRequest {
                url: config.database_url.clone(),
            }),
            ConnectionMode::Pooled { max_connections } => {
                let pool = PgPoolOptions::new()
                    .max_connections(max_connections)
                    .acquire_timeout(Duration::from_secs(3))
                    .connect(&config.database_url)
                    .await?;
                info!("Database pool ready ({} connections)", max_connections);
                Ok(Self::Pooled(pool))
            }
        }
    }

    /// Obtain a connection according to the configured mode.
    pub async fn acquire(&self) -> Result<DbConnection> {
        match self {
            Self::PerRequest { url } => Ok(DbConnection::Owned(PgConnection::connect(url).await?)),
            Self::Pooled(pool) => Ok(DbConnection::Pooled(pool.acquire().await?)),
        }
    }
}

/// A connection obtained from a [`Database`].
pub enum DbConnection {
    Owned(PgConnection),
    Pooled(PoolConnection<Postgres>),
}

impl DbConnection {
    /// Close an owned connection; pooled connections go back to the pool.
    pub async fn release(self) -> Result<()> {
        match self {
            Self::Owned(conn) => conn.close().await?,
            Self::Pooled(conn) => drop(conn),
        }
        Ok(())
    }
}

impl Deref for DbConnection {
    type Target = PgConnection;

    fn deref(&self) -> &PgConnection {
        match self {
            Self::Owned(conn) => conn,
            Self::Pooled(conn) => &**conn,
        }
    }
}

impl DerefMut for DbConnection {
    fn deref_mut(&mut self) -> &mut PgConnection {
        match self {
            Self::Owned(conn) => conn,
            Self::Pooled(conn) => &mut **conn,
        }
    }
}

/// Lazily-acquired connection scoped to one invocation.
pub struct Session<'a> {
    db: &'a Database,
    conn: Option<DbConnection>,
}

impl<'a> Session<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db, conn: None }
    }

    /// Borrow the session's connection, opening it on first use.
    pub async fn conn(&mut self) -> Result<&mut PgConnection> {
        let conn = match self.conn.take() {
            Some(conn) => conn,
            None => self.db.acquire().await?,
        };
        Ok(&mut **self.conn.insert(conn))
    }

    /// Release the connection if one was opened.
    pub async fn close(mut self) -> Result<()> {
        match self.conn.take() {
            Some(conn) => conn.release().await,
            None => Ok(()),
        }
    }
}
