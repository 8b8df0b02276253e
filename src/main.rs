use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

use basewatch::config::Config;
use basewatch::coordinator::Coordinator;
use basewatch::hasher::FileHasher;
use basewatch::logging::init_logging;
use basewatch::merkle::MerkleEngine;
use basewatch::rest::{server, RestStore};
use basewatch::store::{SiteStore, Store};

#[derive(Debug, Parser)]
#[command(name = "basewatch", about = "Continuous baseline integrity verification")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run this site's REST service
    Serve,
    /// Run one coordination pass and exit
    Coordinate,
    /// Compute the Merkle tree for one path under the baseline and print the
    /// resulting hash
    Hash { path: String },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env()?;
    init_logging(&config.log_config())?;

    match cli.command {
        Command::Serve => server::run(&config),
        Command::Coordinate => {
            let coordinator = build_coordinator(&config);
            std::process::exit(coordinator.run());
        }
        Command::Hash { path } => {
            let local = local_store(&config);
            let engine = build_engine(&config, local, config.new_session_id());
            let hash = engine
                .compute_merkle_tree(&path)
                .map_err(|failure| anyhow::anyhow!("{failure}"))?;
            println!("{hash}");
            Ok(())
        }
    }
}

// One composition root: config -> stores -> engine -> coordinator. Components
// only see the narrow interfaces of their neighbors.

fn local_store(config: &Config) -> Arc<RestStore> {
    Arc::new(RestStore::for_url(
        config.local_base_url(),
        config.retry_policy(),
    ))
}

fn build_engine(config: &Config, store: Arc<RestStore>, session_id: String) -> MerkleEngine {
    MerkleEngine::new(
        store as Arc<dyn Store>,
        FileHasher::new(config.hash_algorithm),
        config.baseline.clone(),
    )
    .with_session(session_id)
    .with_liveness(config.liveness_attempts, config.liveness_delay)
}

fn build_coordinator(config: &Config) -> Coordinator {
    let session_id = config.new_session_id();
    let local = local_store(config);
    let core: Arc<RestStore> = if config.is_core() {
        local.clone()
    } else {
        Arc::new(RestStore::for_url(
            config.core_base_url(),
            config.retry_policy(),
        ))
    };
    let engine = build_engine(config, local.clone(), session_id.clone());
    Coordinator::new(
        config.clone(),
        local as Arc<dyn SiteStore>,
        core as Arc<dyn SiteStore>,
        engine,
        session_id,
    )
}
