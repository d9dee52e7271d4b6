//! CLI argument parsing for cohort.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "cohort",
    about = "Round-based multi-agent task coordinator",
    version
)]
pub struct Cli {
    /// Path to config file (default: ./cohort.yml when present)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Run directory holding the shared state file
    #[arg(short, long, global = true, default_value = ".cohort")]
    pub dir: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Bootstrap tasks and drive rounds until a stop condition fires
    Run {
        /// Merge configured tasks into existing state instead of replacing
        #[arg(long)]
        merge: bool,

        /// Halt for human review when plans await approval
        #[arg(long)]
        human_approval: bool,
    },
    /// Show the status summary for the run directory
    Status,
    /// List tasks with plan and phase state
    Tasks,
    /// Show a subject's mailbox
    Inbox {
        /// Receiver id
        receiver: String,

        /// Only messages with seq greater than this
        #[arg(long, default_value_t = 0)]
        since: u64,
    },
    /// Requeue tasks left in progress by an interrupted run
    Requeue,
}
