use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use nua_recon::ReconConfig;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "nua-cli")]
#[command(about = "Nexxus user admin command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reconcile a YAML batch of target users against the backend.
    Reconcile {
        #[arg(long, default_value = "targets.yaml")]
        batch: PathBuf,
    },
    /// Inspect or remove records missing their other half.
    Orphans {
        #[command(subcommand)]
        command: OrphanCommands,
    },
    /// Explicitly reset one user's password.
    ResetPassword {
        email: String,
        #[arg(long)]
        password: String,
    },
    /// Run the JSON admin API.
    Serve,
}

#[derive(Debug, Subcommand)]
enum OrphanCommands {
    List,
    Remove {
        id: Uuid,
        /// Required; removal is refused without it.
        #[arg(long)]
        confirm: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Reconcile { batch } => {
            let summary = nua_recon::run_batch_from_env(&batch).await?;
            println!(
                "reconcile complete: run_id={} total={} created={} updated={} already_consistent={} failed={} reports={}",
                summary.run_id,
                summary.total,
                summary.created,
                summary.updated,
                summary.already_consistent,
                summary.failed,
                summary.reports_dir
            );
        }
        Commands::Orphans { command } => {
            let reconciler = nua_recon::build_reconciler(&ReconConfig::from_env())?;
            match command {
                OrphanCommands::List => {
                    let reports = reconciler.scan_orphans().await?;
                    if reports.is_empty() {
                        println!("no orphans found");
                    }
                    for report in reports {
                        println!("{:?} id={} email={}", report.kind, report.id, report.email);
                    }
                }
                OrphanCommands::Remove { id, confirm } => {
                    reconciler.remove_orphan_profile(id, confirm).await?;
                    println!("removed orphaned profile {id}");
                }
            }
        }
        Commands::ResetPassword { email, password } => {
            let reconciler = nua_recon::build_reconciler(&ReconConfig::from_env())?;
            let user_id = reconciler.reset_password(&email, &password).await?;
            println!("password reset for {email}: user_id={user_id}");
        }
        Commands::Serve => {
            let reconciler = nua_recon::build_reconciler(&ReconConfig::from_env())?;
            nua_web::serve_from_env(nua_web::AppState::new(reconciler)).await?;
        }
    }

    Ok(())
}
