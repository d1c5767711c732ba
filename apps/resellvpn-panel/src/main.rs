use std::io;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use resellvpn_db::repositories::{PromoRepository, UserRepository};
use resellvpn_panel::services::alloc::{AllocationStrategy, FirstActive};
use resellvpn_panel::services::notify::{Notifier, TelegramNotifier};
use resellvpn_panel::services::panel_client::PanelCredentials;
use resellvpn_panel::services::storage::FsObjectStorage;
use resellvpn_panel::services::sync_service::SyncService;
use resellvpn_panel::AppState;

#[derive(Parser)]
#[command(author, version, about = "VPN reseller platform core")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the reconciliation jobs.
    Serve,
    /// Administrative one-shots.
    Admin {
        #[command(subcommand)]
        subcommand: AdminCommands,
    },
}

#[derive(Subcommand)]
enum AdminCommands {
    /// Create a signup promo code.
    CreatePromo {
        code: String,
        #[arg(long, default_value_t = 1)]
        max_uses: i32,
    },
    /// Create a root reseller. Root signups require a valid promo code.
    CreateUser {
        #[arg(long)]
        promo: String,
        #[arg(long)]
        tg_id: Option<i64>,
        #[arg(long, default_value_t = 0.0)]
        profit_percent: f64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let file_appender = tracing_appender::rolling::never(".", "resellvpn.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "resellvpn_panel=debug,resellvpn_db=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stdout))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .init();

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL is not set")?;
    let pool = resellvpn_db::connect(&database_url).await?;

    match cli.command {
        Commands::Serve => run_server(pool).await?,
        Commands::Admin { subcommand } => match subcommand {
            AdminCommands::CreatePromo { code, max_uses } => {
                PromoRepository::new(pool).create(&code, max_uses).await?;
                println!("Promo code {} created ({} uses).", code, max_uses);
            }
            AdminCommands::CreateUser {
                promo,
                tg_id,
                profit_percent,
            } => {
                let promos = PromoRepository::new(pool.clone());
                promos
                    .get_valid(&promo)
                    .await?
                    .context("Promo code is invalid or exhausted")?;
                let user = UserRepository::new(pool)
                    .create("reseller", tg_id, None, profit_percent, 0.0)
                    .await?;
                if !promos.consume(&promo).await? {
                    println!("Warning: promo code {} ran out concurrently.", promo);
                }
                println!("User {} created.", user.id);
            }
        },
    }
    Ok(())
}

async fn run_server(pool: sqlx::PgPool) -> Result<()> {
    let creds = PanelCredentials {
        username: std::env::var("PANEL_USERNAME").context("PANEL_USERNAME is not set")?,
        password: std::env::var("PANEL_PASSWORD").context("PANEL_PASSWORD is not set")?,
    };
    let admin_chat_id: i64 = std::env::var("ADMIN_CHAT_ID")
        .context("ADMIN_CHAT_ID is not set")?
        .parse()
        .context("ADMIN_CHAT_ID must be a chat id")?;
    let production = std::env::var("APP_ENV").is_ok_and(|v| v == "production");
    let storage_root = std::env::var("STORAGE_ROOT").unwrap_or_else(|_| "./storage".to_string());

    let notifier: Arc<dyn Notifier> = Arc::new(TelegramNotifier::from_env());
    let alloc: Arc<dyn AllocationStrategy> = Arc::new(FirstActive);
    let state = AppState::new(
        pool,
        creds,
        notifier,
        Arc::new(FsObjectStorage::new(storage_root)),
        alloc,
        admin_chat_id,
        production,
    );

    SyncService::new(
        state.pool.clone(),
        state.panel.clone(),
        state.notifier.clone(),
        state.admin_chat_id,
        state.production,
    )
    .start();

    info!("core started; waiting for shutdown signal");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("shutting down");
    Ok(())
}
