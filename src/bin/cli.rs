//! WARC indexer CLI
//!
//! Runs the indexing daemon and the maintenance commands around it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::json;
use tokio::sync::watch;
use warc_indexer::{
    error::Result,
    models::Config,
    pipeline::{
        Modulo, RangeBatchSource, ReindexCoordinator, RuleChangeReconciler, Stage,
        StagePipeline, TimeWindow, TokenBatchSource,
    },
    restrictions::RuleManager,
    services::{ArchiveClient, ArchiveSource, HttpRuleFeed, SearchEngine, SolrClient},
    storage::{CheckpointStore, ErrorDomain, LocalStorage, RuleStateStore},
};

/// WARC full-text indexer
#[derive(Parser, Debug)]
#[command(
    name = "warc-indexer",
    version,
    about = "Indexes archived web content under access restriction rules"
)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the enabled coordinators and the nightly rule reconciliation
    Run,

    /// Run one rule reconciliation and exit
    Reconcile,

    /// Validate the configuration file
    Validate,

    /// Print checkpoints, tracked errors and the last reconciliation as JSON
    Status,

    /// Stage the previous rule set; the next reconciliation restores it
    RollbackRules,

    /// Index one WARC now, bypassing the archive cache, and print the results
    IndexWarc {
        /// WARC id in the archive
        warc_id: u64,

        /// Only index the document at this offset
        #[arg(long)]
        offset: Option<i64>,
    },
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .init();
}

/// Clients and state shared by the commands.
struct Services {
    store: Arc<LocalStorage>,
    search: Arc<dyn SearchEngine>,
    manager: Arc<RuleManager>,
    pipeline: Arc<StagePipeline>,
}

impl Services {
    async fn connect(config: &Config) -> Result<Self> {
        let store = Arc::new(LocalStorage::new(&config.storage.dir));
        let user_agent = &config.archive.user_agent;
        let search: Arc<dyn SearchEngine> = Arc::new(SolrClient::new(&config.search, user_agent)?);
        let feed = Arc::new(HttpRuleFeed::new(
            config.restrictions.rules_url.clone(),
            user_agent,
            config.archive.timeout_secs,
        )?);
        let manager = Arc::new(RuleManager::initialise(Arc::clone(&store) as _, feed).await?);
        let pipeline = Arc::new(StagePipeline::new(
            manager.engine(),
            Arc::clone(&search),
            &config.pipeline,
            config.archive.pandora_collection_id,
        ));
        Ok(Self {
            store,
            search,
            manager,
            pipeline,
        })
    }

    fn reconciler(&self, config: &Config) -> Result<RuleChangeReconciler> {
        RuleChangeReconciler::new(
            Arc::clone(&self.manager),
            Arc::clone(&self.search),
            Arc::clone(&self.pipeline),
            &config.search,
            &config.restrictions,
        )
    }
}

fn modulo(config: &Config) -> Option<Modulo> {
    match (config.full.modulo_divisor, config.full.modulo_remainder) {
        (Some(divisor), Some(remainder)) => Some(Modulo { divisor, remainder }),
        _ => None,
    }
}

fn coordinators(
    config: &Config,
    services: &Services,
    archive: &Arc<dyn ArchiveSource>,
) -> Result<Vec<Arc<ReindexCoordinator>>> {
    let store: Arc<dyn CheckpointStore> = Arc::clone(&services.store) as _;
    let mut coordinators = Vec::new();

    if config.full.coordinator.enabled {
        let source = RangeBatchSource::new(
            Arc::clone(archive),
            Arc::clone(&store),
            config.archive.collection_id,
            config.full.coordinator.batch_size,
            modulo(config),
            Duration::from_secs(config.retry.upstream_retry_secs),
        );
        coordinators.push(Arc::new(ReindexCoordinator::new(
            Arc::new(source),
            Arc::clone(archive),
            Arc::clone(&store),
            Arc::clone(&services.pipeline),
            &config.full.coordinator,
            &config.retry,
        )));
    }

    if config.periodic.coordinator.enabled {
        let source = TokenBatchSource::new(
            Arc::clone(archive),
            Arc::clone(&store),
            config.archive.collection_id,
            config.periodic.coordinator.batch_size,
        );
        let mut coordinator = ReindexCoordinator::new(
            Arc::new(source),
            Arc::clone(archive),
            Arc::clone(&store),
            Arc::clone(&services.pipeline),
            &config.periodic.coordinator,
            &config.retry,
        );
        if let Some(window) = &config.periodic.window {
            coordinator = coordinator.with_window(
                TimeWindow::from_config(window)?,
                Duration::from_secs(config.periodic.window_recheck_secs),
            );
        }
        coordinators.push(Arc::new(coordinator));
    }

    Ok(coordinators)
}

async fn run_daemon(config: &Config) -> Result<()> {
    let services = Services::connect(config).await?;
    let archive: Arc<dyn ArchiveSource> = Arc::new(ArchiveClient::new(&config.archive)?);
    services.pipeline.start();

    let coordinators = coordinators(config, &services, &archive)?;
    if coordinators.is_empty() {
        log::warn!("Neither full nor periodic indexing is enabled");
    }
    for coordinator in &coordinators {
        coordinator.start().await?;
    }

    let reconciler = Arc::new(services.reconciler(config)?);
    let (stop_tx, stop_rx) = watch::channel(false);
    let scheduler = {
        let reconciler = Arc::clone(&reconciler);
        tokio::spawn(async move { reconciler.run_scheduled(stop_rx).await })
    };

    tokio::signal::ctrl_c().await?;
    log::info!("Shutdown requested, stopping...");

    stop_tx.send_replace(true);
    for coordinator in &coordinators {
        coordinator.stop().await;
    }
    if let Err(e) = scheduler.await {
        log::error!("Reconciliation scheduler ended abnormally: {}", e);
    }

    services.pipeline.wait_until_idle().await;
    services.pipeline.shutdown().await;
    for coordinator in &coordinators {
        let status = coordinator.status();
        log::info!(
            "[{}] {} WARCs completed, {} retried, {} quarantined",
            status.name,
            status.completed,
            status.retried,
            status.quarantined
        );
    }
    Ok(())
}

async fn index_warc(config: &Config, warc_id: u64, offset: Option<i64>) -> Result<()> {
    let services = Services::connect(config).await?;
    let archive: Arc<dyn ArchiveSource> = Arc::new(ArchiveClient::new(&config.archive)?);
    let store: Arc<dyn CheckpointStore> = Arc::clone(&services.store) as _;
    services.pipeline.start();

    // Never started; only used to load the WARC into the pipeline
    let source = RangeBatchSource::new(
        Arc::clone(&archive),
        Arc::clone(&store),
        config.archive.collection_id,
        config.full.coordinator.batch_size,
        None,
        Duration::from_secs(config.retry.upstream_retry_secs),
    );
    let coordinator = ReindexCoordinator::new(
        Arc::new(source),
        archive,
        store,
        Arc::clone(&services.pipeline),
        &config.full.coordinator,
        &config.retry,
    );
    let result = coordinator.index_one(warc_id, offset).await;
    services.pipeline.shutdown().await;

    let documents: Vec<_> = result?
        .iter()
        .map(|doc| {
            let errors: serde_json::Map<_, _> = Stage::ALL
                .iter()
                .filter_map(|stage| Some((stage.as_str().to_string(), json!(doc.error(*stage)?))))
                .collect();
            json!({
                "id": doc.id(),
                "url": doc.document().url,
                "errors": errors,
                "record": doc.record(),
            })
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&documents)?);
    Ok(())
}

async fn print_status(config: &Config) -> Result<()> {
    let store = LocalStorage::new(&config.storage.dir);
    let full_key = match modulo(config) {
        Some(m) => format!("full:{}", m.remainder),
        None => "full".to_string(),
    };
    let rules = store.load_rule_state().await?;
    let last_id = store.last_id(&full_key).await?;
    let full_errors = store.old_errors(ErrorDomain::Full).await?;
    let token = store.resumption_token().await?;
    let periodic_errors = store.old_errors(ErrorDomain::Periodic).await?;

    let status = json!({
        "full": {
            "key": full_key,
            "lastId": last_id,
            "errors": full_errors,
        },
        "periodic": {
            "resumptionToken": token,
            "errors": periodic_errors,
        },
        "rules": {
            "current": rules.current.as_ref().map(Vec::len),
            "staged": rules.new.as_ref().map(Vec::len),
            "previous": rules.previous.as_ref().map(Vec::len),
            "lastRun": rules.last_run,
        },
    });
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = Config::load_or_default(&cli.config);
    log::info!("Loaded configuration from {}", cli.config.display());

    match cli.command {
        Command::Run => {
            config.validate()?;
            log::info!("WARC indexer starting...");
            run_daemon(&config).await?;
        }

        Command::Reconcile => {
            config.validate()?;
            let services = Services::connect(&config).await?;
            let run = services.reconciler(&config)?.run().await?;
            log::info!(
                "Run {} complete: {} documents updated in {} searches",
                run.id,
                run.totals.written,
                run.totals.searches
            );
        }

        Command::Validate => {
            log::info!("Validating configuration...");
            if let Err(e) = config.validate() {
                log::error!("Config validation failed: {}", e);
                return Err(e);
            }
            log::info!("Config OK");
        }

        Command::Status => print_status(&config).await?,

        Command::RollbackRules => {
            let services = Services::connect(&config).await?;
            services.manager.rollback().await?;
            log::info!("Previous rules staged; the next reconciliation applies them");
        }

        Command::IndexWarc { warc_id, offset } => {
            config.validate()?;
            index_warc(&config, warc_id, offset).await?;
        }
    }

    log::info!("Done!");
    Ok(())
}
