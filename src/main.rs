use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use teloxide::prelude::*;
use tokio::sync::oneshot;
use tracing::{error, info};

use tg_enrollbot::batcher::ApprovalBatcher;
use tg_enrollbot::engine::ApprovalEngine;
use tg_enrollbot::handlers::{self, BotState};
use tg_enrollbot::notifier::{Notifier, TelegramNotifier};
use tg_enrollbot::{config, db, web};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/enrollbot.db", cfg.app.data_dir));

    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let bot = Bot::new(cfg.telegram.bot_token.clone());
    let notifier: Arc<dyn Notifier> = Arc::new(TelegramNotifier::new(bot.clone()));
    let batcher = ApprovalBatcher::new(
        pool.clone(),
        notifier.clone(),
        cfg.telegram.admin_id,
        cfg.approval_window(),
    );
    let engine = ApprovalEngine::new(
        pool.clone(),
        cfg.catalog(),
        notifier,
        batcher.clone(),
        cfg.telegram.admin_id,
    );

    let (stop_web, web_stopped) = oneshot::channel::<()>();
    let web_server = if cfg.web.enabled {
        let addr = cfg.web_addr()?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding web listener on {}", addr))?;
        let state = web::WebState {
            engine: engine.clone(),
            uploads_dir: PathBuf::from(cfg.uploads_dir()),
        };
        info!(%addr, "starting web server");
        Some(tokio::spawn(async move {
            let shutdown = async move {
                let _ = web_stopped.await;
            };
            if let Err(err) = web::serve(listener, state, shutdown).await {
                error!(?err, "web server stopped");
            }
        }))
    } else {
        None
    };

    let state = Arc::new(BotState {
        engine,
        payment: cfg.payment.clone(),
    });
    let handler = dptree::entry()
        .branch(Update::filter_message().endpoint(handlers::on_message))
        .branch(Update::filter_callback_query().endpoint(handlers::on_callback));

    info!("starting telegram bot");
    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    // No new approvals may arrive once the batches are drained.
    let _ = stop_web.send(());
    if let Some(server) = web_server {
        if let Err(err) = server.await {
            error!(?err, "web server task failed");
        }
    }

    let flushed = batcher.drain().await;
    info!(flushed, "shutdown complete");
    Ok(())
}
