use std::sync::Arc;

use color_eyre::eyre::Result;
use tokio::signal;
use tokio::sync::RwLock;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::info;
use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};

use sbt_rewards::api::{self, AppState};
use sbt_rewards::chain::{RemoteSigner, TonCenterClient};
use sbt_rewards::config::Config;
use sbt_rewards::db::Db;
use sbt_rewards::handlers::Handlers;
use sbt_rewards::metadata::MetadataFetcher;
use sbt_rewards::queue::{PgQueue, WorkerPool};
use sbt_rewards::scanner::{Heartbeat, Scanner, Watchdog};

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config = Config::read()?;

    // collaborators
    let db = Db::connect(&config.db).await?;
    let queue = Arc::new(PgQueue::new(db.clone()));
    let store = Arc::new(db);
    let chain = Arc::new(TonCenterClient::new(&config.chain)?);
    let wallet = Arc::new(RemoteSigner::new(&config.wallet)?);
    let metadata = MetadataFetcher::new(&config.metadata)?;
    let token = CancellationToken::new();

    let handlers = Arc::new(Handlers::new(
        store.clone(),
        chain.clone(),
        wallet,
        queue.clone(),
        metadata,
        &config,
    ));

    // setup each task
    let workers_heartbeat = Heartbeat::default();
    let workers = WorkerPool::new(queue.clone(), handlers, config.queue.clone(), token.clone())
        .with_heartbeat(workers_heartbeat.clone());

    let scanner_heartbeat = Heartbeat::default();
    let status = Arc::new(RwLock::new(Default::default()));
    let scanner = Scanner::new(
        chain,
        store,
        queue.clone(),
        config.scanner.clone(),
        scanner_heartbeat.clone(),
        status.clone(),
    );
    let watchdog = Watchdog::new(
        move |token| scanner.clone().run(token),
        scanner_heartbeat.clone(),
        config.scanner.watchdog_interval(),
        config.scanner.stall_timeout(),
        config.scanner.restart_delay(),
        token.clone(),
    );

    let api = config.http.clone().map(|http| {
        let state = AppState {
            scanner: scanner_heartbeat,
            workers: workers_heartbeat,
            status,
            broker: queue,
            stall_timeout: config.scanner.stall_timeout(),
        };
        api::start(state, http, token.clone())
    });

    // spawn tasks and track them
    let tracker = TaskTracker::new();
    tracker.spawn(workers.run());
    tracker.spawn(watchdog.run());
    if let Some(api) = api {
        tracker.spawn(api);
    }

    // termination handling
    signal::ctrl_c().await?;
    token.cancel();
    tracker.close();
    tracker.wait().await;

    info!("graceful shutdown achieved. Closing");

    Ok(())
}

fn setup() -> Result<()> {
    color_eyre::install()?;

    let filter = EnvFilter::from_default_env();

    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::NEW)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    Ok(())
}
