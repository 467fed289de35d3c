use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use log::{error, info};
use tokio::signal;

use fim::config::Args;
use fim::consumer::access::AccessState;
use fim::consumer::users::UsersState;
use fim::consumer::{BaseConsumer, Consumer};
use fim::dispatch::Dispatcher;
use fim::pipeline::Pipeline;
use fim::probe::AyaProbe;
use fim::process::ProcFs;
use fim::setup::{check_permission, raise_memlock_limit};
use fim::store::{SqliteStore, Store};

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();
    check_permission()?;
    env_logger::init();
    raise_memlock_limit();

    let store: Arc<dyn Store> = Arc::new(
        SqliteStore::open(&args.db)
            .with_context(|| format!("opening baseline store {}", args.db.display()))?,
    );

    let users = Arc::new(BaseConsumer::new(
        "users",
        UsersState::new(args.users_listener()),
        store.clone(),
    ));
    users.init().context("initializing users baseline")?;
    let access = Arc::new(BaseConsumer::new(
        "access",
        AccessState::new(args.access_listener()),
        store,
    ));
    access.init().context("initializing access baseline")?;

    let probe = Arc::new(AyaProbe::load(&args.probe)?);
    let (pipeline, outputs) = Pipeline::start(probe, Arc::new(ProcFs::default()))?;

    let consumers = vec![users as Arc<dyn Consumer>, access];
    let mut dispatcher = Dispatcher::new(&pipeline, consumers, args.poll_interval());
    dispatcher.reload();

    let shutdown = pipeline.shutdown();
    let dispatch = tokio::spawn(async move { dispatcher.run(outputs).await });

    info!("Waiting for Ctrl-C...");
    signal::ctrl_c().await?;
    info!("Exiting...");
    info!("{}", pipeline.stats());

    shutdown.cancel();
    if let Err(err) = dispatch.await {
        error!("dispatcher failed: {}", err);
    }
    pipeline.stop().await?;
    Ok(())
}
