//! gridbench - distributed benchmark orchestration for data-grid clusters

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use gridbench_agent::{Agent, AgentConfig};
use gridbench_coordinator::{config, Coordinator, CoordinatorParameters};
use gridbench_core::address::SimulatorAddress;
use gridbench_core::phase::TestPhase;
use gridbench_worker::{WorkerConfig, WorkerRuntime};

mod cli;

use cli::Commands;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::Cli::parse();

    let default_level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(default_level.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Coordinator {
            agents_file,
            suite,
            agent_port,
            duration_seconds,
            parallel,
            fail_fast,
            members_per_agent,
            clients_per_agent,
            no_verify,
            monitor_performance,
            refresh_workers,
            last_phase_to_sync,
            cooldown_seconds,
            worker_shutdown_timeout_seconds,
        } => {
            let registry = config::load_registry(&agents_file)?;
            let mut test_suite = config::load_suite(&suite)?;
            if let Some(duration) = duration_seconds {
                test_suite.duration_seconds = duration;
            }
            test_suite.fail_fast |= fail_fast;

            let last_phase: TestPhase = last_phase_to_sync
                .parse()
                .map_err(|err: String| anyhow::anyhow!(err))?;

            let mut parameters = CoordinatorParameters {
                agent_port,
                members_per_agent,
                clients_per_agent,
                parallel,
                refresh_workers,
                last_phase_to_sync: Some(last_phase),
                cooldown_seconds,
                worker_shutdown_timeout: std::time::Duration::from_secs(
                    worker_shutdown_timeout_seconds,
                ),
                ..CoordinatorParameters::default()
            };
            parameters.runner.verify_enabled = !no_verify;
            parameters.runner.monitor_performance = monitor_performance;

            info!(suite = %test_suite.id, tests = test_suite.size(), "gridbench coordinator starting");
            let coordinator = Coordinator::new(parameters, test_suite, registry);

            // Ctrl+C aborts in-flight broadcasts and runners.
            let cancel = coordinator.cancel_token().clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Interrupted, aborting the run");
                    cancel.cancel();
                }
            });

            let passed = coordinator.run().await?;
            if !passed {
                bail!("critical failures were detected");
            }
            Ok(())
        }

        Commands::Agent {
            bind_address,
            port,
            address_index,
            public_address,
            workers_dir,
            last_seen_timeout_seconds,
        } => {
            let worker_program =
                std::env::current_exe().context("could not resolve the agent binary path")?;
            let agent = Agent::new(AgentConfig {
                public_address: public_address.unwrap_or_else(|| bind_address.clone()),
                bind_address,
                port,
                address_index,
                workers_dir,
                worker_program,
                last_seen_timeout_seconds,
            });

            let cancel = CancellationToken::new();
            {
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        info!("Interrupted, shutting down the agent");
                        cancel.cancel();
                    }
                });
            }
            agent.run(cancel).await?;
            Ok(())
        }

        Commands::Worker {
            address,
            worker_home,
        } => {
            let address: SimulatorAddress = address
                .parse()
                .context("invalid worker address")?;
            let runtime = WorkerRuntime::new(WorkerConfig::new(address, worker_home));
            runtime.run().await?;
            Ok(())
        }
    }
}
