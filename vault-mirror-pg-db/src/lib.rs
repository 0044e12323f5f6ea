// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! PostgreSQL plumbing for the vault mirror: a `bb8` pool of
//! `diesel-async` connections and an embedded-migration runner.

use std::ops::{Deref, DerefMut};
use std::time::Duration;

use anyhow::anyhow;
use diesel::migration::{Migration, MigrationSource, MigrationVersion};
use diesel::pg::Pg;
use diesel::ConnectionError;
use diesel_async::async_connection_wrapper::AsyncConnectionWrapper;
use diesel_async::pooled_connection::bb8::{Pool, PooledConnection};
use diesel_async::pooled_connection::{AsyncDieselConnectionManager, ManagerConfig};
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use diesel_migrations::EmbeddedMigrations;
use futures::FutureExt;
use tracing::info;
use url::Url;

#[derive(clap::Args, Debug, Clone)]
pub struct DbArgs {
    // Number of connections to keep in the pool.
    #[arg(long, default_value_t = Self::default().db_connection_pool_size)]
    pub db_connection_pool_size: u32,

    // Time spent waiting for a pooled connection, in milliseconds.
    #[arg(long, default_value_t = Self::default().db_connection_timeout_ms)]
    pub db_connection_timeout_ms: u64,

    // Time spent waiting for statements to complete, in milliseconds.
    #[arg(long)]
    pub db_statement_timeout_ms: Option<u64>,
}

impl DbArgs {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.db_connection_timeout_ms)
    }

    pub fn statement_timeout(&self) -> Option<Duration> {
        self.db_statement_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for DbArgs {
    fn default() -> Self {
        Self {
            db_connection_pool_size: 16,
            db_connection_timeout_ms: 30_000,
            db_statement_timeout_ms: None,
        }
    }
}

#[derive(Clone)]
pub struct Db {
    pool: Pool<AsyncPgConnection>,
    database_url: String,
}

pub struct Connection<'a>(PooledConnection<'a, AsyncPgConnection>);

impl Db {
    // Pool that supports writes and reads. Clones share the same pool.
    pub async fn for_write(database_url: Url, config: DbArgs) -> anyhow::Result<Self> {
        Ok(Self {
            pool: pool(database_url.clone(), config).await?,
            database_url: database_url.to_string(),
        })
    }

    // Fails with a timeout if no connection frees up within [DbArgs::connection_timeout].
    pub async fn connect(&self) -> anyhow::Result<Connection<'_>> {
        Ok(Connection(self.pool.get().await?))
    }

    async fn drop_tables(&self) -> anyhow::Result<()> {
        info!("[PgDb] dropping all public tables");
        let mut conn = self.connect().await?;
        diesel::sql_query(
            "
        DO $$ DECLARE
            r RECORD;
        BEGIN
        FOR r IN (SELECT tablename FROM pg_tables WHERE schemaname = 'public')
            LOOP
                EXECUTE 'DROP TABLE IF EXISTS ' || quote_ident(r.tablename) || ' CASCADE';
            END LOOP;
        END $$;",
        )
        .execute(&mut conn)
        .await?;
        Ok(())
    }

    // Apply any pending migrations from `migrations` (generated with `embed_migrations!`).
    pub async fn run_migrations(
        &self,
        migrations: &'static EmbeddedMigrations,
    ) -> anyhow::Result<Vec<MigrationVersion<'static>>> {
        use diesel_migrations::MigrationHarness;

        info!("[PgDb] running migrations");
        let conn = AsyncPgConnection::establish(&self.database_url)
            .await
            .map_err(|e| anyhow!("Failed to connect for migrations: {}", e))?;
        let mut wrapper: AsyncConnectionWrapper<AsyncPgConnection> = conn.into();
        let source = StaticMigrations(migrations);

        let finished: Vec<MigrationVersion<'static>> = tokio::task::spawn_blocking(move || {
            wrapper
                .run_pending_migrations(source)
                .map(|versions| versions.iter().map(MigrationVersion::as_owned).collect::<Vec<_>>())
        })
        .await?
        .map_err(|e| anyhow!("Failed to run migrations: {:?}", e))?;

        info!("[PgDb] {} migration(s) applied", finished.len());
        Ok(finished)
    }
}

// Drop every table, then re-apply `migrations`.
pub async fn reset_database(
    database_url: Url,
    db_config: DbArgs,
    migrations: &'static EmbeddedMigrations,
) -> anyhow::Result<Db> {
    let db = Db::for_write(database_url, db_config).await?;
    db.drop_tables().await?;
    db.run_migrations(migrations).await?;
    Ok(db)
}

impl<'a> Deref for Connection<'a> {
    type Target = PooledConnection<'a, AsyncPgConnection>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Connection<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

async fn pool(
    database_url: Url,
    args: DbArgs,
) -> anyhow::Result<Pool<AsyncPgConnection>> {
    let statement_timeout = args.statement_timeout();

    let mut config = ManagerConfig::default();
    config.custom_setup = Box::new(move |url| {
        async move {
            let mut conn = AsyncPgConnection::establish(url).await?;

            if let Some(timeout) = statement_timeout {
                diesel::sql_query(format!("SET statement_timeout = {}", timeout.as_millis()))
                    .execute(&mut conn)
                    .await
                    .map_err(ConnectionError::CouldntSetupConfiguration)?;
            }

            Ok(conn)
        }
        .boxed()
    });

    let manager = AsyncDieselConnectionManager::new_with_config(database_url.as_str(), config);

    Ok(Pool::builder()
        .max_size(args.db_connection_pool_size)
        .connection_timeout(args.connection_timeout())
        .build(manager)
        .await?)
}

struct StaticMigrations(&'static EmbeddedMigrations);

impl MigrationSource<Pg> for StaticMigrations {
    fn migrations(&self) -> diesel::migration::Result<Vec<Box<dyn Migration<Pg>>>> {
        self.0.migrations()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_args_timeouts() {
        let args = DbArgs {
            db_statement_timeout_ms: Some(1_500),
            ..DbArgs::default()
        };
        assert_eq!(args.connection_timeout(), Duration::from_secs(30));
        assert_eq!(args.statement_timeout(), Some(Duration::from_millis(1_500)));
        assert_eq!(DbArgs::default().statement_timeout(), None);
    }

    #[tokio::test]
    #[ignore] // Requires TEST_DATABASE_URL environment variable
    async fn test_migrations_apply_once() {
        let database_url = std::env::var("TEST_DATABASE_URL")
            .expect("TEST_DATABASE_URL must be set")
            .parse()
            .unwrap();
        let db = reset_database(database_url, DbArgs::default(), &vault_mirror_schema::MIGRATIONS)
            .await
            .unwrap();

        let again = db
            .run_migrations(&vault_mirror_schema::MIGRATIONS)
            .await
            .unwrap();
        assert!(again.is_empty());

        let mut conn = db.connect().await.unwrap();
        diesel::sql_query("SELECT 1 FROM checkpoints")
            .execute(&mut conn)
            .await
            .unwrap();
    }
}
