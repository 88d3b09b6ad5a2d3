mod cmd;

use anyhow::Result;
use clap::{Parser, Subcommand};
use conductor::Config;

#[derive(Parser)]
#[command(name = "conductor")]
#[command(version, about = "Autonomous code-change run orchestration engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run pending database migrations and exit.
    Migrate,
    /// Start the HTTP surface, run-step workers, outbox writer, and janitor.
    Serve {
        #[arg(long, default_value = "127.0.0.1:8080")]
        bind: String,
    },
    /// Start a run for a task against a repo and queue its first step.
    Run {
        #[arg(long)]
        task: String,
        #[arg(long)]
        repo: String,
        #[arg(long, default_value = "main")]
        base_branch: String,
    },
    /// Record an operator action (approve_plan, retry, pause, ...) on a run.
    Operator {
        #[arg(long)]
        run: String,
        action: String,
        #[arg(long)]
        comment: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env()?;

    init_tracing(&config);

    match cli.command {
        Commands::Migrate => cmd::cmd_migrate(&config.db_path),
        Commands::Serve { bind } => cmd::cmd_serve(config, &bind).await,
        Commands::Run { task, repo, base_branch } => {
            cmd::cmd_run(&config.db_path, &task, &repo, &base_branch)
        }
        Commands::Operator { run, action, comment } => {
            cmd::cmd_operator(&config.db_path, &run, &action, comment.as_deref())
        }
    }
}

fn init_tracing(config: &Config) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);

    match config.log_format {
        conductor::config::LogFormat::Json => subscriber.json().init(),
        conductor::config::LogFormat::Pretty => subscriber.init(),
    }
}
