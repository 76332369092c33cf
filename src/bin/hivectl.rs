//! hivectl, the management CLI for a running hived
//!
//! Each invocation sends one JSON-line command over the control socket and
//! pretty-prints the reply.

use clap::{Parser, Subcommand};
use hive::control::{Command, Reply};
use hive::wire::InviteTicket;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

#[derive(Parser)]
#[command(name = "hivectl", version, about = "Manage a running hived")]
struct Args {
    /// Control socket path
    #[arg(short, long, default_value = "./hive-data/control.sock")]
    socket: PathBuf,

    #[command(subcommand)]
    command: Cli,
}

#[derive(Subcommand)]
enum Cli {
    /// Create a new hive with this node as initiator
    Initiate,
    /// Issue an admission ticket for a candidate
    Invite {
        pubkey: String,
        #[arg(short, long, default_value = "24")]
        valid_hours: u64,
    },
    /// Send a HELLO to a hive member, optionally with a ticket
    Join {
        peer: String,
        /// Invite ticket JSON as produced by `invite`
        #[arg(short, long)]
        ticket: Option<String>,
    },
    /// Overall node status
    Status,
    /// List known members
    Members,
    /// List governance actions
    Pending,
    /// Approve a pending action
    Approve { id: u64 },
    /// Reject a pending action
    Reject { id: u64 },
    /// Change the governance mode (advisor, autonomous, oracle)
    SetMode { mode: String },
    /// Ask the fleet for promotion to full member
    RequestPromotion,
    /// Vouch for a candidate's promotion round
    Vouch { subject: String, request_id: String },
    /// Propose banning a peer
    ProposeBan {
        pubkey: String,
        #[arg(short, long, default_value = "operator decision")]
        reason: String,
    },
    /// Show the fleet's channel topology and inhibited targets
    Topology,
    /// Show recent planner decisions
    PlannerLog {
        #[arg(short, long)]
        limit: Option<usize>,
    },
}

fn to_command(cli: Cli) -> Result<Command, String> {
    Ok(match cli {
        Cli::Initiate => Command::Initiate,
        Cli::Invite { pubkey, valid_hours } => Command::Invite { pubkey, valid_hours },
        Cli::Join { peer, ticket } => {
            let ticket = match ticket {
                None => None,
                Some(raw) => Some(
                    serde_json::from_str::<InviteTicket>(&raw)
                        .map_err(|e| format!("bad ticket: {e}"))?,
                ),
            };
            Command::Join { peer, ticket }
        }
        Cli::Status => Command::Status,
        Cli::Members => Command::Members,
        Cli::Pending => Command::Pending,
        Cli::Approve { id } => Command::Approve { id },
        Cli::Reject { id } => Command::Reject { id },
        Cli::SetMode { mode } => Command::SetMode { mode },
        Cli::RequestPromotion => Command::RequestPromotion,
        Cli::Vouch { subject, request_id } => Command::Vouch { subject, request_id },
        Cli::ProposeBan { pubkey, reason } => Command::ProposeBan { pubkey, reason },
        Cli::Topology => Command::Topology,
        Cli::PlannerLog { limit } => Command::PlannerLog { limit },
    })
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let command = match to_command(args.command) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(2);
        }
    };

    let stream = match UnixStream::connect(&args.socket).await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("cannot reach hived at {}: {e}", args.socket.display());
            std::process::exit(1);
        }
    };
    let (read_half, mut write_half) = stream.into_split();

    let mut line = match serde_json::to_vec(&command) {
        Ok(raw) => raw,
        Err(e) => {
            eprintln!("cannot encode command: {e}");
            std::process::exit(2);
        }
    };
    line.push(b'\n');
    if let Err(e) = write_half.write_all(&line).await {
        eprintln!("write failed: {e}");
        std::process::exit(1);
    }

    let mut lines = BufReader::new(read_half).lines();
    match lines.next_line().await {
        Ok(Some(raw)) => match serde_json::from_str::<Reply>(&raw) {
            Ok(reply) => {
                let pretty = serde_json::to_string_pretty(&reply.detail)
                    .unwrap_or_else(|_| raw.clone());
                println!("{pretty}");
                if !reply.ok {
                    std::process::exit(1);
                }
            }
            Err(e) => {
                eprintln!("unparseable reply ({e}): {raw}");
                std::process::exit(1);
            }
        },
        Ok(None) => {
            eprintln!("hived closed the connection");
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("read failed: {e}");
            std::process::exit(1);
        }
    }
}
