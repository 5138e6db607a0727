//! Launch queue and admission loop.
//!
//! The scheduler is a single actor: inbound commands arrive over a channel and
//! a fixed-period tick drains at most one server and one proxy workload before
//! publishing a resource snapshot. Launches of one kind never overlap because
//! the tick awaits each launch before moving on.

use std::{collections::VecDeque, sync::Arc, time::Duration};

use corral_group::GroupDescriptor;
use tokio::sync::mpsc;

use crate::config::Layout;
use crate::groups::GroupRegistry;
use crate::instance_cleanup;
use crate::launcher::{LaunchOutcome, Launcher};
use crate::messages::{Outbound, OutboundTx, publish};
use crate::telemetry::ResourceProbe;
use crate::workload::{Workload, WorkloadKind, valid_instance_name};

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Enqueue(Workload),
    Stopped { kind: WorkloadKind, name: String },
    DeclareGroup(GroupDescriptor),
    UndeclareGroup(String),
    DescribeGroup(String),
}

#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl SchedulerHandle {
    pub fn send(&self, cmd: Command) -> anyhow::Result<()> {
        self.tx
            .send(cmd)
            .map_err(|_| anyhow::anyhow!("scheduler is not running"))
    }
}

pub fn channel() -> (SchedulerHandle, mpsc::UnboundedReceiver<Command>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (SchedulerHandle { tx }, rx)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchSlot {
    Idle,
    Launching,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceLimits {
    /// 0.0..=1.0
    pub cpu_max_load: f64,
    pub ram_keep_free: u64,
    pub ram: u64,
}

pub struct Scheduler {
    server_queue: VecDeque<Workload>,
    proxy_queue: VecDeque<Workload>,
    server_slot: LaunchSlot,
    proxy_slot: LaunchSlot,
    launcher: Arc<Launcher>,
    probe: Arc<dyn ResourceProbe>,
    limits: ResourceLimits,
    save_logs: bool,
    registry: GroupRegistry,
    outbound: OutboundTx,
}

impl Scheduler {
    pub fn new(
        launcher: Arc<Launcher>,
        probe: Arc<dyn ResourceProbe>,
        limits: ResourceLimits,
        save_logs: bool,
        outbound: OutboundTx,
    ) -> Self {
        Self {
            server_queue: VecDeque::new(),
            proxy_queue: VecDeque::new(),
            server_slot: LaunchSlot::Idle,
            proxy_slot: LaunchSlot::Idle,
            launcher,
            probe,
            limits,
            save_logs,
            registry: GroupRegistry::default(),
            outbound,
        }
    }

    fn layout(&self) -> &Layout {
        self.launcher.layout()
    }

    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>, period: Duration) {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(period_ms = period.as_millis() as u64, "scheduler running");

        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(cmd) => self.apply(cmd),
                    None => break,
                },
                _ = ticker.tick() => self.tick().await,
            }
        }
        tracing::info!("scheduler stopped");
    }

    pub fn apply(&mut self, cmd: Command) {
        match cmd {
            Command::Enqueue(workload) => self.enqueue(workload),
            Command::Stopped { kind, name } => self.on_stopped(kind, &name),
            Command::DeclareGroup(desc) => {
                // Rejections are logged by the group model.
                let _ = self.registry.declare(desc);
            }
            Command::UndeclareGroup(name) => {
                if !self.registry.undeclare(&name) {
                    tracing::warn!(group = %name, "undeclare for unknown group");
                }
            }
            Command::DescribeGroup(name) => match self.registry.group_view(&name) {
                Some(group) => publish(&self.outbound, Outbound::GroupInfo { group }),
                None => tracing::warn!(group = %name, "group info requested for unknown group"),
            },
        }
    }

    /// Appends in arrival order; no dedup.
    pub fn enqueue(&mut self, workload: Workload) {
        tracing::debug!(kind = %workload.kind, name = %workload.name(), "queued workload");
        if workload.descriptor.is_launchable() {
            self.registry
                .track_starting(&workload, self.launcher.spawner());
        }
        match workload.kind {
            WorkloadKind::Server => self.server_queue.push_back(workload),
            WorkloadKind::Proxy => self.proxy_queue.push_back(workload),
        }
    }

    pub async fn tick(&mut self) {
        self.start_next(WorkloadKind::Server).await;
        self.start_next(WorkloadKind::Proxy).await;
        self.update_resources();
    }

    fn queue_mut(&mut self, kind: WorkloadKind) -> &mut VecDeque<Workload> {
        match kind {
            WorkloadKind::Server => &mut self.server_queue,
            WorkloadKind::Proxy => &mut self.proxy_queue,
        }
    }

    fn slot_mut(&mut self, kind: WorkloadKind) -> &mut LaunchSlot {
        match kind {
            WorkloadKind::Server => &mut self.server_slot,
            WorkloadKind::Proxy => &mut self.proxy_slot,
        }
    }

    /// Pops until a launchable entry turns up, skipping broken ones.
    fn next_launchable(&mut self, kind: WorkloadKind) -> Option<Workload> {
        loop {
            let workload = self.queue_mut(kind).pop_front()?;
            if workload.descriptor.is_launchable() {
                return Some(workload);
            }
            tracing::warn!(%kind, name = %workload.name(), "skipping queued workload without a valid name or group");
        }
    }

    async fn start_next(&mut self, kind: WorkloadKind) {
        let Some(workload) = self.next_launchable(kind) else {
            return;
        };

        *self.slot_mut(kind) = LaunchSlot::Launching;
        let launcher = self.launcher.clone();
        let job = workload.clone();
        let outcome = match tokio::task::spawn_blocking(move || launcher.launch(&job)).await {
            Ok(outcome) => outcome,
            Err(e) => LaunchOutcome::NotStarted {
                reason: format!("launch task failed: {e}"),
            },
        };
        *self.slot_mut(kind) = LaunchSlot::Idle;

        self.report(&workload, outcome);
    }

    fn report(&mut self, workload: &Workload, outcome: LaunchOutcome) {
        let d = &workload.descriptor;
        let msg = match (workload.kind, outcome) {
            (WorkloadKind::Server, LaunchOutcome::Started { port }) => {
                self.registry.mark_started(&d.name, port);
                Outbound::ServerStarted {
                    server: d.name.clone(),
                    token: d.token.clone(),
                    port,
                }
            }
            (WorkloadKind::Proxy, LaunchOutcome::Started { port }) => {
                self.registry.mark_started(&d.name, port);
                Outbound::ProxyStarted {
                    proxy: d.name.clone(),
                    token: d.token.clone(),
                    port,
                }
            }
            (
                WorkloadKind::Server,
                LaunchOutcome::NeedsSync {
                    template,
                    map,
                    differences,
                },
            ) => {
                self.registry.launch_failed(&d.name);
                Outbound::ServerTemplateRequest {
                    server: d.name.clone(),
                    template,
                    map,
                    differences,
                }
            }
            (
                WorkloadKind::Proxy,
                LaunchOutcome::NeedsSync {
                    template,
                    differences,
                    ..
                },
            ) => {
                self.registry.launch_failed(&d.name);
                Outbound::ProxyTemplateRequest {
                    proxy: d.name.clone(),
                    template,
                    differences,
                }
            }
            (kind, LaunchOutcome::NotStarted { reason }) => {
                tracing::debug!(%kind, name = %d.name, %reason, "reporting instance not started");
                self.registry.launch_failed(&d.name);
                let (name, token) = (d.name.clone(), d.token.clone());
                match kind {
                    WorkloadKind::Server => Outbound::ServerNotStarted { name, token },
                    WorkloadKind::Proxy => Outbound::ProxyNotStarted { name, token },
                }
            }
        };
        publish(&self.outbound, msg);
    }

    /// Ready only with an empty server queue, nothing launching and CPU below the ceiling.
    pub fn resources(&self) -> Outbound {
        let ready = self.server_queue.is_empty()
            && self.server_slot == LaunchSlot::Idle
            && self.proxy_slot == LaunchSlot::Idle
            && self.probe.cpu_load() <= self.limits.cpu_max_load;
        let available_ram = self
            .probe
            .free_memory_mb()
            .saturating_sub(self.limits.ram_keep_free);
        Outbound::Resources {
            ready,
            available_ram,
            max_ram: self.limits.ram,
        }
    }

    fn update_resources(&self) {
        publish(&self.outbound, self.resources());
    }

    fn on_stopped(&mut self, kind: WorkloadKind, name: &str) {
        if !valid_instance_name(name) {
            tracing::warn!(%kind, %name, "ignoring stop notification with invalid instance name");
            return;
        }
        let record = self.registry.stopped(name);
        instance_cleanup::on_workload_stopped(
            self.layout(),
            self.save_logs,
            kind,
            name,
            record.as_ref(),
            chrono::Local::now(),
        );
    }
}
