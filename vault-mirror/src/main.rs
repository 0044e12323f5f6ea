// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use anyhow::Context;
use clap::Parser;
use prometheus::Registry;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use url::Url;
use vault_ledger::{EthLedgerSource, LedgerSource, LedgerSourceConfig};
use vault_mirror::metrics::{start_metrics_server, MirrorMetrics};
use vault_mirror::{
    CheckpointStore, IngestionEngine, MemoryStore, MirrorConfig, PgCheckpointStore,
    PgRecordStore, RecordStore,
};
use vault_mirror_pg_db::{Db, DbArgs};
use vault_mirror_schema::MIGRATIONS;

#[derive(Parser)]
#[clap(rename_all = "kebab-case", author, version)]
struct Args {
    #[command(flatten)]
    db_args: DbArgs,
    /// Without a database the mirror runs against a non-durable in-memory store
    #[clap(env, long)]
    database_url: Option<Url>,
    #[clap(env, long)]
    rpc_url: String,
    #[clap(env, long)]
    ws_url: Option<String>,
    #[clap(env, long)]
    vault_address: String,
    #[clap(env, long, default_value = "0.0.0.0:9184")]
    metrics_address: SocketAddr,
    #[clap(env, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => MirrorConfig::from_file(path)?,
        None => MirrorConfig::default(),
    };
    config.engine.validate()?;

    let cancel = CancellationToken::new();
    let registry = Registry::new();
    let metrics = Arc::new(MirrorMetrics::new(&registry));
    let metrics_handle =
        start_metrics_server(args.metrics_address, registry, cancel.child_token()).await?;

    let source = Arc::new(
        EthLedgerSource::new(LedgerSourceConfig {
            rpc_url: args.rpc_url.clone(),
            ws_url: args.ws_url.clone(),
            vault_address: args.vault_address.clone(),
            fetch: config.source.clone(),
        })
        .context("Failed to create ledger source")?,
    );

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("[Main] ctrl-c received, shutting down");
            }
            cancel.cancel();
        });
    }

    let result = match args.database_url {
        Some(database_url) => {
            let db = Db::for_write(database_url, args.db_args)
                .await
                .context("Failed to connect to database")?;
            db.run_migrations(&MIGRATIONS).await?;
            run_engine(
                config,
                source,
                Arc::new(PgCheckpointStore::new(db.clone())),
                Arc::new(PgRecordStore::new(db)),
                metrics,
                cancel.clone(),
            )
            .await
        }
        None => {
            tracing::warn!("[Main] no --database-url given, mirror state will not survive a restart");
            let store = Arc::new(MemoryStore::new());
            run_engine(config, source, store.clone(), store, metrics, cancel.clone()).await
        }
    };

    cancel.cancel();
    let _ = metrics_handle.await;
    result
}

async fn run_engine<L, C, R>(
    config: MirrorConfig,
    source: Arc<L>,
    checkpoints: Arc<C>,
    records: Arc<R>,
    metrics: Arc<MirrorMetrics>,
    cancel: CancellationToken,
) -> anyhow::Result<()>
where
    L: LedgerSource + 'static,
    C: CheckpointStore + 'static,
    R: RecordStore + 'static,
{
    let handle = IngestionEngine::new(config.engine, source, checkpoints, records)
        .with_metrics(metrics)
        .start(cancel);

    let mut halted = Vec::new();
    for (kind, result) in handle.join().await {
        match result {
            Ok(()) => tracing::info!("[Main] {} worker stopped", kind),
            Err(e) => {
                tracing::error!("[Main] {}", e);
                halted.push(kind);
            }
        }
    }

    if halted.is_empty() {
        Ok(())
    } else {
        Err(anyhow::anyhow!("workers halted: {:?}", halted))
    }
}
