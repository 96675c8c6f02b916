//! Apparatus CLI - experiment tracking server
//!
//! Usage:
//!   apparatus serve --db sqlite:///apparatus.db --artifact-store-uri file://artifacts [--open]
//!   apparatus experiments --db sqlite:///apparatus.db
//!   apparatus runs --experiment <uuid> [--open-l0 <run>] [--open-l1 <run>]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use apparatus::{
    blob::ArtifactStore,
    hierarchy::{assemble, NestedRunView, OpenBranches},
    storage::Database,
    viewer::{start_viewer, AppState},
    Config, DEFAULT_EXPERIMENT_UUID,
};

/// Overrides `--db` when set
const DB_ENV: &str = "APPARATUS_DB_CONNECTION_STRING";

#[derive(Parser)]
#[command(name = "apparatus")]
#[command(about = "Track experiment runs, parameters, metrics and artifacts")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the tracking server and web viewer
    Serve {
        /// Database connection string
        #[arg(long, default_value = "sqlite:///apparatus.db")]
        db: String,
        /// Where artifact files are written
        #[arg(long, env = "APPARATUS_ARTIFACT_STORE_URI", default_value = "file://artifacts")]
        artifact_store_uri: String,
        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1")]
        host: std::net::Ipv4Addr,
        /// Port to listen on
        #[arg(short, long, env = "APPARATUS_PORT", default_value = "8080")]
        port: u16,
        /// Open in browser automatically
        #[arg(long)]
        open: bool,
    },
    /// List experiments
    Experiments {
        /// Database connection string
        #[arg(long, default_value = "sqlite:///apparatus.db")]
        db: String,
    },
    /// Print the nested runs of an experiment
    Runs {
        /// Experiment UUID
        #[arg(short, long, default_value = DEFAULT_EXPERIMENT_UUID)]
        experiment: String,
        /// Root run whose children are listed
        #[arg(long)]
        open_l0: Option<String>,
        /// Child run whose children are listed
        #[arg(long)]
        open_l1: Option<String>,
        /// Database connection string
        #[arg(long, default_value = "sqlite:///apparatus.db")]
        db: String,
    },
}

fn open_database(db_uri: String) -> Result<Database> {
    let db_uri = std::env::var(DB_ENV).unwrap_or(db_uri);
    let path = apparatus::parse_db_uri(&db_uri)?;
    Database::open(&path).with_context(|| format!("failed to open database {}", db_uri))
}

fn print_runs(views: &[NestedRunView], depth: usize) {
    for view in views {
        let marker = match (view.child_count, view.is_expanded()) {
            (0, _) => " ",
            (_, true) => "-",
            (_, false) => "+",
        };
        println!(
            "{}{} {:<36} {:<24} {}",
            "  ".repeat(depth),
            marker,
            view.run.uuid,
            view.run.name,
            view.run.created_at.format("%Y-%m-%d %H:%M:%S"),
        );
        print_runs(&view.children, depth + 1);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "apparatus=info".to_string()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            db,
            artifact_store_uri,
            host,
            port,
            open,
        } => {
            let db_uri = std::env::var(DB_ENV).unwrap_or(db);
            let config = Config {
                host: host.octets(),
                port,
                ..Config::from_uris(&db_uri, &artifact_store_uri)?
            };

            info!("Starting Apparatus...");
            info!("Database: {:?}", config.db_path);
            info!("Artifact store: {:?}", config.artifact_store);

            let database = Database::open(&config.db_path)?;
            let store = ArtifactStore::open(&config.artifact_store)?;

            if open {
                let url = format!("http://{}:{}/", host, port);
                let _ = open::that(&url);
            }

            start_viewer(AppState::new(database, store), config.host, config.port).await?;
        }

        Commands::Experiments { db } => {
            let database = open_database(db)?;
            let experiments = database.all_experiments()?;

            println!("{:<36} {:<24} {:>6}  {:<20}", "UUID", "Name", "Runs", "Last run");
            println!("{}", "-".repeat(90));

            for experiment in experiments {
                let last = experiment
                    .most_recent_run_at
                    .map(|ts| ts.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<36} {:<24} {:>6}  {:<20}",
                    experiment.uuid, experiment.name, experiment.run_count, last
                );
            }
        }

        Commands::Runs {
            experiment,
            open_l0,
            open_l1,
            db,
        } => {
            let database = open_database(db)?;
            let experiment_id = database
                .experiment_id_by_uuid(&experiment)?
                .with_context(|| format!("experiment {} not found", experiment))?;

            let roots = database.runs_by_experiment_and_level(experiment_id, 0)?;
            if roots.is_empty() {
                println!("No runs in experiment {}", experiment);
                return Ok(());
            }

            let open = OpenBranches::new(open_l0.as_deref(), open_l1.as_deref());
            let views = assemble(roots, &open, &database)?;
            print_runs(&views, 0);
        }
    }

    Ok(())
}
