use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands, QueryArgs, ServeArgs};
use client::TcClient;
use common::util::trace::initialize_tracing;
use common::TxConfig;
use coordinator::{Coordinator, TcServer, TimeoutScanner};
use resource::dispatch::BranchDispatcher;
use resource::{
    AtResourceHandler, HttpResourceHandler, MqResourceHandler, StaticResolver, TccRegistry,
    TccResourceHandler, XaResourceHandler,
};
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use store::{LockManager, MemoryStore};
use tracing::info;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    initialize_tracing()?;

    let args = Cli::parse();
    match args.command() {
        Commands::Serve(args) => serve(args).await?,
        Commands::Status(args) => status(args).await?,
        Commands::Rollback(args) => rollback(args).await?,
    }

    Ok(ExitCode::SUCCESS)
}

async fn serve(args: &ServeArgs) -> Result<()> {
    let config_path = args.config().as_ref().and_then(|p| p.to_str());
    let mut config = TxConfig::load(config_path)?;
    config.server.port = *args.port();

    let dispatcher = BranchDispatcher::shared(config.retry().clone());
    dispatcher.register_handler(Arc::new(AtResourceHandler::new(Arc::new(
        datasource::UndoLogManager::new(),
    ))));
    dispatcher.register_handler(Arc::new(TccResourceHandler::new(Arc::new(
        TccRegistry::new(),
    ))));
    dispatcher.register_handler(Arc::new(XaResourceHandler::new()));
    dispatcher.register_handler(Arc::new(MqResourceHandler::new()));
    dispatcher.register_handler(Arc::new(HttpResourceHandler::new(
        Arc::new(StaticResolver::new()),
        common::context::DEFAULT_RESOURCE_GROUP,
    )));

    let address: SocketAddr = config.server_address().parse()?;
    let coordinator = Coordinator::shared(
        config,
        MemoryStore::shared(),
        LockManager::shared(),
        dispatcher,
    );

    TimeoutScanner::new(coordinator.clone()).spawn();

    let server = TcServer::new(coordinator);
    server.run(address).await?;
    Ok(())
}

async fn connect(args: &QueryArgs) -> Result<Arc<TcClient>> {
    // environment-layered config so KEYSTONE__RPC__REQUEST_TIMEOUT_MS and
    // friends apply to one-shot queries too
    let config = TxConfig::load(None)?;
    let client =
        TcClient::connect_with_config(&format!("{}:{}", args.host(), args.port()), &config)
            .await?;
    Ok(client)
}

async fn status(args: &QueryArgs) -> Result<()> {
    let client = connect(args).await?;
    let status = client.global_status(args.xid()).await?;
    info!(xid = %args.xid(), %status, "queried global status");
    println!("{} -> {}", args.xid(), status);
    Ok(())
}

async fn rollback(args: &QueryArgs) -> Result<()> {
    let client = connect(args).await?;
    let status = client.rollback_global(args.xid()).await?;
    println!("{} -> {}", args.xid(), status);
    Ok(())
}
