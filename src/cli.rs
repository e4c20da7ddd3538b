//! Command-line front end over a local engine.
//!
//! Every command opens the WAL in `data_dir`, runs one operation and exits.
//!
//! ```bash
//! arbiter servers add gpu-a100-01 --gpu-type A100 --gpu-count 8
//! arbiter reserve --as alice "fine-tune llama tomorrow 9-13 on the a100"
//! arbiter list --pending-rejection --as alice
//! arbiter contest 01J... --as alice --reason "booked weeks ago"
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use thiserror::Error;
use ulid::Ulid;

use crate::config::{ArbiterConfig, ConfigError};
use crate::engine::{Engine, EngineError, ReservationFilter};
use crate::model::{Conflict, GpuServer, Reservation, ReservationStatus};
use crate::notify::NotifyHub;
use crate::oracle::parse::{format_ms, parse_time};

#[derive(Error, Debug)]
pub enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to render output: {0}")]
    Output(#[from] serde_json::Error),

    #[error("{0}")]
    Usage(String),
}

/// arbiter - GPU reservation arbitration
#[derive(Parser, Debug)]
#[command(name = "arbiter", version, about = "GPU reservation intake and arbitration")]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, env = "ARBITER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Manage GPU servers
    #[command(subcommand)]
    Servers(ServersCommands),
    /// Submit a natural-language reservation request
    Reserve(ReserveArgs),
    /// Accept a displacement notice (cancels your reservation)
    Confirm(ResolveArgs),
    /// Contest a displacement notice (restores your reservation)
    Contest(ResolveArgs),
    /// Cancel one of your reservations
    Cancel(ResolveArgs),
    /// List reservations
    List(ListArgs),
    /// Show one reservation and its conflict records
    Show(ShowArgs),
    /// Rewrite the WAL as a minimal snapshot
    Compact,
}

#[derive(Subcommand, Debug)]
pub enum ServersCommands {
    /// Register a server
    Add(ServerAddArgs),
    /// Change a server's name or description
    Update(ServerUpdateArgs),
    /// List servers
    List {
        /// Include deactivated servers
        #[arg(long)]
        all: bool,
    },
    /// Take a server out of selection
    Deactivate {
        /// Server name or id
        server: String,
    },
}

#[derive(Args, Debug)]
pub struct ServerAddArgs {
    /// Unique server name
    pub name: String,

    #[arg(short, long)]
    pub description: Option<String>,

    /// GPU model, e.g. A100
    #[arg(short = 't', long)]
    pub gpu_type: Option<String>,

    #[arg(short = 'n', long, default_value = "1")]
    pub gpu_count: u32,
}

#[derive(Args, Debug)]
pub struct ServerUpdateArgs {
    /// Server name or id
    pub server: String,

    /// New name
    #[arg(long)]
    pub name: Option<String>,

    #[arg(short, long)]
    pub description: Option<String>,

    #[arg(short = 't', long)]
    pub gpu_type: Option<String>,

    #[arg(short = 'n', long)]
    pub gpu_count: Option<u32>,
}

#[derive(Args, Debug)]
pub struct ReserveArgs {
    /// Request text, e.g. "train resnet tomorrow 14:00-18:00"
    pub text: String,

    /// Requester identity
    #[arg(long = "as", env = "ARBITER_REQUESTER")]
    pub requester: String,

    /// Reference time for relative expressions, "YYYY-MM-DD HH:MM" UTC
    #[arg(long)]
    pub at: Option<String>,
}

#[derive(Args, Debug)]
pub struct ResolveArgs {
    /// Reservation id
    pub reservation: Ulid,

    /// Requester identity
    #[arg(long = "as", env = "ARBITER_REQUESTER")]
    pub requester: String,

    #[arg(short, long)]
    pub reason: Option<String>,
}

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Only this requester's reservations
    #[arg(long = "as")]
    pub requester: Option<String>,

    /// Filter by status (pending, confirmed, pending_rejection, rejected, cancelled)
    #[arg(short, long)]
    pub status: Option<ReservationStatus>,

    /// Server name or id
    #[arg(long)]
    pub server: Option<String>,

    /// Only reservations waiting on a displacement answer
    #[arg(long)]
    pub pending_rejection: bool,
}

#[derive(Args, Debug)]
pub struct ShowArgs {
    /// Reservation id
    pub reservation: Ulid,
}

/// Load the config file (if any) and apply environment overrides.
pub fn load_config(cli: &Cli) -> Result<ArbiterConfig, CliError> {
    let config = ArbiterConfig::load(cli.config.as_deref())?.with_env_overrides();
    config.validate()?;
    Ok(config)
}

/// Run one command and return what should be printed.
pub async fn execute(cli: Cli, config: &ArbiterConfig) -> Result<String, CliError> {
    std::fs::create_dir_all(&config.data_dir)?;
    let engine = Engine::new(
        config.wal_path(),
        Arc::new(NotifyHub::new()),
        config.oracle.build_adapter(),
    )?;
    let json = cli.json;

    match cli.command {
        Commands::Servers(cmd) => match cmd {
            ServersCommands::Add(args) => {
                let server = engine
                    .create_server(&args.name, args.description, args.gpu_type, args.gpu_count)
                    .await?;
                render(json, &server, format_server)
            }
            ServersCommands::Update(args) => {
                let id = resolve_server(&engine, &args.server)?;
                let current = engine.get_server(id).await?;
                let server = engine
                    .update_server(
                        id,
                        args.name.as_deref().unwrap_or(&current.name),
                        args.description.or(current.description),
                        args.gpu_type.or(current.gpu_type),
                        args.gpu_count.unwrap_or(current.gpu_count),
                    )
                    .await?;
                render(json, &server, format_server)
            }
            ServersCommands::List { all } => {
                let servers = engine.list_servers(all).await;
                render(json, &servers, |s| lines(s, format_server))
            }
            ServersCommands::Deactivate { server } => {
                let id = resolve_server(&engine, &server)?;
                let server = engine.deactivate_server(id).await?;
                render(json, &server, format_server)
            }
        },
        Commands::Reserve(args) => {
            let reservation = match args.at.as_deref() {
                Some(at) => {
                    let reference = parse_time(at).map_err(|e| CliError::Usage(e.to_string()))?;
                    engine
                        .create_reservation_at(&args.requester, &args.text, reference)
                        .await?
                }
                None => engine.create_reservation(&args.requester, &args.text).await?,
            };
            render(json, &reservation, format_reservation)
        }
        Commands::Confirm(args) => {
            let r = engine
                .resolve_confirmation(args.reservation, &args.requester, true, args.reason.as_deref())
                .await?;
            render(json, &r, format_reservation)
        }
        Commands::Contest(args) => {
            let r = engine
                .resolve_confirmation(args.reservation, &args.requester, false, args.reason.as_deref())
                .await?;
            render(json, &r, format_reservation)
        }
        Commands::Cancel(args) => {
            let r = engine
                .cancel_reservation(args.reservation, &args.requester, args.reason.as_deref())
                .await?;
            render(json, &r, format_reservation)
        }
        Commands::List(args) => {
            let server_id = args
                .server
                .as_deref()
                .map(|s| resolve_server(&engine, s))
                .transpose()?;
            let filter = ReservationFilter {
                requester_id: args.requester,
                status: args.status,
                server_id,
                pending_rejection: args.pending_rejection,
            };
            let reservations = engine.list_reservations(&filter).await;
            render(json, &reservations, |r| lines(r, format_reservation))
        }
        Commands::Show(args) => {
            let reservation = engine.get_reservation(args.reservation).await?;
            let conflicts = engine.get_conflicts(args.reservation).await?;
            let detail = ReservationDetail {
                reservation,
                conflicts,
            };
            render(json, &detail, format_detail)
        }
        Commands::Compact => {
            engine.compact_wal().await?;
            Ok(format!("compacted {}", config.wal_path().display()))
        }
    }
}

/// Accept either a server id or its exact name.
fn resolve_server(engine: &Engine, key: &str) -> Result<Ulid, CliError> {
    if let Ok(id) = key.parse::<Ulid>()
        && engine.get_server_state(&id).is_some()
    {
        return Ok(id);
    }
    engine
        .find_server_by_name(key)
        .ok_or_else(|| CliError::Usage(format!("unknown server: {key}")))
}

#[derive(Serialize)]
struct ReservationDetail {
    reservation: Reservation,
    conflicts: Vec<Conflict>,
}

fn render<T: Serialize + ?Sized>(
    json: bool,
    value: &T,
    text: impl Fn(&T) -> String,
) -> Result<String, CliError> {
    if json {
        Ok(serde_json::to_string_pretty(value)?)
    } else {
        Ok(text(value))
    }
}

fn lines<T>(items: &[T], f: impl Fn(&T) -> String) -> String {
    items.iter().map(f).collect::<Vec<_>>().join("\n")
}

fn format_server(s: &GpuServer) -> String {
    format!(
        "{}  {:<24} {}x{}{}",
        s.id,
        s.name,
        s.gpu_count,
        s.gpu_type.as_deref().unwrap_or("gpu"),
        if s.active { "" } else { "  (inactive)" }
    )
}

fn format_reservation(r: &Reservation) -> String {
    let mut out = format!(
        "{}  {:<17} {} -> {}  prio {:>3}  {}  {}",
        r.id,
        r.status,
        format_ms(r.span.start),
        format_ms(r.span.end),
        r.priority,
        r.requester_id,
        r.purpose
    );
    if let Some(reason) = &r.rejection_reason {
        out.push_str(&format!("\n    reason: {reason}"));
    }
    if let Some(judgment) = &r.judgment_reason {
        out.push_str(&format!("\n    judgment: {judgment}"));
    }
    out
}

fn format_detail(d: &ReservationDetail) -> String {
    let mut out = format_reservation(&d.reservation);
    out.push_str(&format!("\n    request: {}", d.reservation.request_text));
    for c in &d.conflicts {
        out.push_str(&format!(
            "\n    conflict {}: new {} vs existing {} ({})",
            c.id,
            c.new_reservation_id,
            c.existing_reservation_id,
            if c.resolved {
                c.resolution.to_string()
            } else {
                "open".to_string()
            }
        ));
    }
    out
}
