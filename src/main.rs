use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use brokkr::admission::ChainEligibilityCache;
use brokkr::api::{self, Env};
use brokkr::auth::AuthCaches;
use brokkr::chain::{Client, CollateralCache};
use brokkr::config::{self, Config};
use brokkr::database::{DB_FILENAME, Reader, Writer};
use brokkr::{cmdlock, logging, metrics, poller, proposer, signer, stopper, tracker};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[clap(name = config::APP_NAME)]
struct Cli {
    #[clap(flatten)]
    config: Config,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Serve the authenticated SP-facing HTTP API
    Serve,
    /// Query metadata of recently-seen storage providers
    PollProviders {
        #[clap(long, help = "Query every SP that is known to the app")]
        requery_all: bool,
        #[clap(long, help = "How many SPs to query concurrently", default_value = "64")]
        query_concurrency: usize,
        #[clap(long, help = "Query timeout in seconds", default_value = "10")]
        query_timeout: u64,
    },
    /// Sign pending deal proposals
    SignPending,
    /// Propose pending deals to providers
    ProposePending {
        #[clap(
            long,
            help = "Amount of seconds to wait between proposals to same SP",
            default_value = "3"
        )]
        sleep_between_proposals: u64,
        #[clap(
            long,
            help = "Amount of seconds before aborting a specific proposal",
            default_value = "30"
        )]
        proposal_timeout: u64,
        #[clap(
            long,
            help = "Amount of seconds proposals for specific SP could take in total",
            default_value = "270"
        )]
        per_sp_timeout: u64,
    },
    /// Track state of filecoin deals related to known pieces
    TrackDeals,
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Serve => "serve",
            Command::PollProviders { .. } => "poll-providers",
            Command::SignPending => "sign-pending",
            Command::ProposePending { .. } => "propose-pending",
            Command::TrackDeals => "track-deals",
        }
    }
}

fn main() -> Result<()> {
    // must happen before the runtime spawns worker threads
    config::seed_env_from_toml()?;
    let cli = Cli::try_parse()?;
    logging::setup_with(cli.config.log_format);

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    let config = cli.config;
    let chain = Client::new_from_config(&config)?;
    let cancel_token = CancellationToken::new();
    let stopper_handle = stopper::run(cancel_token.clone())?;

    std::fs::create_dir_all(&config.data_dir)?;
    let reader = Reader::new(&config.data_dir, DB_FILENAME).await?;
    let writer = Writer::new(&config.data_dir, DB_FILENAME).await?;

    match cli.command {
        Command::Serve => {
            let env = Env {
                config: config.clone(),
                cancel_token: cancel_token.clone(),
                reader,
                writer,
                chain,
                reservation_lock: Arc::new(tokio::sync::Mutex::new(())),
                collateral: Arc::new(CollateralCache::default()),
                auth_caches: Arc::new(AuthCaches::default()),
                chain_eligibility: Arc::new(ChainEligibilityCache::default()),
            };
            let api_handle = api::run(env).await?;
            for handle in [stopper_handle, api_handle] {
                let _ = handle.await;
            }
            info!("Exited");
            Ok(())
        }
        command => {
            let name = command.name();
            let _lock = match cmdlock::acquire(name) {
                Ok(lock) => lock,
                Err(e) if e.downcast_ref::<cmdlock::Contended>().is_some() => {
                    // quiet on a failed lock unless someone is watching
                    if cmdlock::is_interactive() {
                        error!("{}", e);
                    }
                    std::process::exit(1);
                }
                Err(e) => return Err(e),
            };

            info!("=== BEGIN '{}' run", name);
            let t0 = Instant::now();
            let result = match command {
                Command::PollProviders {
                    requery_all,
                    query_concurrency,
                    query_timeout,
                } => {
                    poller::run(
                        cancel_token.clone(),
                        &writer,
                        &chain,
                        poller::PollOptions {
                            requery_all,
                            concurrency: query_concurrency,
                            timeout: Duration::from_secs(query_timeout),
                        },
                    )
                    .await
                }
                Command::SignPending => signer::run(cancel_token.clone(), &writer, &chain).await,
                Command::ProposePending {
                    sleep_between_proposals,
                    proposal_timeout,
                    per_sp_timeout,
                } => {
                    proposer::run(
                        cancel_token.clone(),
                        &writer,
                        proposer::ProposeOptions {
                            sleep_between_proposals: Duration::from_secs(sleep_between_proposals),
                            proposal_timeout: Duration::from_secs(proposal_timeout),
                            per_sp_timeout: Duration::from_secs(per_sp_timeout),
                        },
                    )
                    .await
                }
                Command::TrackDeals => {
                    tracker::run(
                        cancel_token.clone(),
                        &writer,
                        &chain,
                        config.lotus_lookback_epochs,
                    )
                    .await
                }
                Command::Serve => unreachable!("handled above"),
            };

            let took = t0.elapsed();
            let success = result.is_ok();
            if success {
                info!("=== FINISH '{}' run, took {:?}", name, took);
            } else {
                error!("=== FINISH '{}' run (failed), took {:?}", name, took);
            }
            metrics::push_run_metrics(&config, name, took.as_millis() as i64, success).await;

            cancel_token.cancel();
            let _ = stopper_handle.await;
            result
        }
    }
}
