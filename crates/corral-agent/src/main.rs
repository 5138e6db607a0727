use std::sync::Arc;

use tokio::sync::mpsc;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod config;
mod control_tunnel;
mod groups;
mod instance_cleanup;
mod launcher;
mod messages;
mod port_alloc;
mod properties;
mod scheduler;
mod support;
mod telemetry;
mod template_sync;
mod workload;

use config::{AgentConfig, Layout};
use launcher::{LaunchSettings, Launcher, ScreenSpawner};
use scheduler::{Command, ResourceLimits, Scheduler};

fn init_tracing(layout: &Layout) -> tracing_appender::non_blocking::WorkerGuard {
    let file = tracing_appender::rolling::daily(layout.agent_logs_dir(), "corral-agent.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file);

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .with(fmt::layer().with_ansi(false).with_writer(file_writer))
        .init();
    guard
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AgentConfig::load()?;
    let layout = config.layout();
    layout.ensure()?;
    let _log_guard = init_tracing(&layout);

    let node = config.node_name();
    tracing::info!(%node, root = %layout.root().display(), "corral-agent starting");

    let agent_artifact = match &config.agent_artifact {
        Some(path) => path.clone(),
        None => std::env::current_exe()?,
    };
    let launcher = Launcher::new(
        layout,
        LaunchSettings {
            java_bin: config.java_bin.clone(),
            core_host: config.core_host.clone(),
            core_port: config.core_port,
            agent_artifact,
            port_range: config.port_range(),
        },
        Arc::new(template_sync::Sha1TreeHasher),
        Arc::new(ScreenSpawner::new(config.session_bin.clone())),
    );

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    let scheduler = Scheduler::new(
        Arc::new(launcher),
        Arc::new(telemetry::ProcProbe),
        ResourceLimits {
            cpu_max_load: config.cpu_max_load,
            ram_keep_free: config.ram_keep_free,
            ram: config.ram,
        },
        config.save_logs,
        outbound_tx,
    );
    let (handle, commands) = scheduler::channel();
    for group in config.groups.iter().cloned() {
        handle.send(Command::DeclareGroup(group))?;
    }

    let url = config
        .control_ws_url
        .as_deref()
        .and_then(control_tunnel::parse_ws_url);
    let tunnel = match url {
        Some(url) => control_tunnel::spawn(
            url,
            node,
            config.node_token.clone(),
            handle.clone(),
            outbound_rx,
        ),
        None => {
            tracing::warn!("no control-ws-url configured, outbound messages are only logged");
            tokio::spawn(async move {
                while let Some(msg) = outbound_rx.recv().await {
                    tracing::debug!(?msg, "outbound");
                }
            })
        }
    };

    let scheduler_task = tokio::spawn(scheduler.run(commands, config.tick_interval()));

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");

    // The tunnel holds a handle too; the scheduler exits once every handle is gone.
    tunnel.abort();
    let _ = tunnel.await;
    drop(handle);
    let _ = scheduler_task.await;

    tracing::info!("corral-agent stopped");
    Ok(())
}
