use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use preorder_bot::{format_order, run_polling, BotHandler, TelegramConfig, TelegramTransport, Whitelist};
use preorder_core::{Clock, OrderType, SystemClock};
use preorder_storage::OrderStore;
use preorder_sync::{
    credentials_from_env, engine_from_config, maybe_build_scheduler, report_stats_text,
    run_sync_once_from_env, SyncConfig,
};
use preorder_web::AppState;
use tracing::{info, warn};

const DEFAULT_LOG_FILTER: &str = "preorder=info,preorder_core=info,preorder_client=info,\
preorder_sync=info,preorder_storage=info,preorder_web=info,preorder_bot=info";

#[derive(Debug, Parser)]
#[command(name = "preorder")]
#[command(about = "Pre-order tracker for the AmiAmi storefront")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch orders from the storefront and update the local store.
    Sync {
        #[arg(long, default_value_t = OrderType::Open)]
        order_type: OrderType,
    },
    /// Print stored orders.
    List {
        #[arg(long, default_value_t = OrderType::Open)]
        order_type: OrderType,
    },
    /// Print stats for open orders, or every stored order with --all.
    Stats {
        #[arg(long)]
        all: bool,
    },
    /// Run the HTTP API, the chat bot and the scheduler.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Sync {
        order_type: OrderType::Open,
    }) {
        Commands::Sync { order_type } => {
            let report = run_sync_once_from_env(order_type).await?;
            println!(
                "sync complete: run_id={} listed={} refreshed={} failed={} pruned={}",
                report.run_id,
                report.listed,
                report.refreshed.len(),
                report.failed.len(),
                report.pruned.len()
            );
            for info in &report.orders {
                println!("{}", format_order(info));
            }
        }
        Commands::List { order_type } => {
            let config = SyncConfig::from_env();
            let store = OrderStore::open(&config.store_file).await;
            for info in store.list_at(order_type, SystemClock.today()).await {
                println!("{}", format_order(&info));
            }
        }
        Commands::Stats { all } => {
            let config = SyncConfig::from_env();
            let store = OrderStore::open(&config.store_file).await;
            let filter = if all { OrderType::All } else { OrderType::Open };
            let orders = store.list_at(filter, SystemClock.today()).await;
            println!("{}", report_stats_text(&orders, config.jpy_to_usd));
        }
        Commands::Serve => serve().await?,
    }

    Ok(())
}

async fn serve() -> Result<()> {
    let config = SyncConfig::from_env();
    let engine = Arc::new(engine_from_config(&config, credentials_from_env()?).await?);

    // Held for the lifetime of the server; dropping it stops the jobs.
    let _scheduler = match maybe_build_scheduler(&config, engine.clone()).await? {
        Some(sched) => {
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.sync_cron, "scheduler started");
            Some(sched)
        }
        None => None,
    };

    match TelegramConfig::from_env() {
        Some(telegram) => {
            let whitelist =
                Whitelist::from_csv(&std::env::var("TELEGRAM_BOT_WHITELIST").unwrap_or_default());
            let handler = Arc::new(BotHandler::new(engine.clone(), whitelist, config.jpy_to_usd));
            let transport = TelegramTransport::new(&telegram).context("building telegram client")?;
            tokio::spawn(run_polling(handler, transport));
        }
        None => warn!("TELEGRAM_BOT_TOKEN not set, chat bot disabled"),
    }

    let port: u16 = std::env::var("PREORDER_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    preorder_web::serve(AppState::new(engine, config.jpy_to_usd), port).await
}
