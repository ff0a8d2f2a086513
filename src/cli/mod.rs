//! CLI argument parsing and command dispatch

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "gridbench")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a test suite against a cluster of agents
    Coordinator {
        /// Newline-separated `publicIp[,privateIp]` agent entries
        #[arg(long)]
        agents_file: PathBuf,
        /// JSON suite descriptor
        #[arg(long)]
        suite: PathBuf,
        /// Port the agents listen on
        #[arg(long, default_value_t = 9500)]
        agent_port: u16,
        /// Override the suite's RUN duration in seconds
        #[arg(long)]
        duration_seconds: Option<u64>,
        /// Run the suite's tests concurrently
        #[arg(long)]
        parallel: bool,
        /// Abort the suite after the first failed test
        #[arg(long)]
        fail_fast: bool,
        /// Member workers per agent
        #[arg(long, default_value_t = 1)]
        members_per_agent: usize,
        /// Client workers per agent
        #[arg(long, default_value_t = 0)]
        clients_per_agent: usize,
        /// Skip the verify phases
        #[arg(long)]
        no_verify: bool,
        /// Log aggregate throughput while tests run
        #[arg(long)]
        monitor_performance: bool,
        /// Restart all workers between sequential tests
        #[arg(long)]
        refresh_workers: bool,
        /// Last phase synchronized across parallel tests
        #[arg(long, default_value = "setup")]
        last_phase_to_sync: String,
        /// Sleep after terminating workers so late failures arrive
        #[arg(long, default_value_t = 10)]
        cooldown_seconds: u64,
        /// How long to wait for workers to confirm shutdown
        #[arg(long, default_value_t = 120)]
        worker_shutdown_timeout_seconds: u64,
    },
    /// Run the agent daemon on a test-cluster host
    Agent {
        /// Interface to bind the endpoint to
        #[arg(long, default_value = "0.0.0.0")]
        bind_address: String,
        /// Port to bind the endpoint to
        #[arg(long, default_value_t = 9500)]
        port: u16,
        /// This agent's 1-based index from the agents file
        #[arg(long, default_value_t = 1)]
        address_index: u32,
        /// Address the coordinator reaches this agent on
        #[arg(long)]
        public_address: Option<String>,
        /// Root directory for per-suite worker homes
        #[arg(long, default_value = "workers")]
        workers_dir: PathBuf,
        /// Worker inactivity threshold; 0 disables timeout detection
        #[arg(long, default_value_t = 60)]
        last_seen_timeout_seconds: u64,
    },
    /// Worker child process; forked by agents, not user-facing
    #[command(hide = true)]
    Worker {
        /// The worker's simulator address
        #[arg(long)]
        address: String,
        /// Directory for artifact files
        #[arg(long)]
        worker_home: PathBuf,
    },
}
