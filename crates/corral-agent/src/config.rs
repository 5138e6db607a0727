use std::{
    ops::RangeInclusive,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use corral_group::GroupDescriptor;

use crate::support::{env_bool, env_f64, env_string, env_u64};
use crate::workload::WorkloadKind;

const DEFAULT_CONFIG_PATH: &str = "corral.toml";

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct AgentConfig {
    pub data_root: PathBuf,
    pub control_ws_url: Option<String>,
    pub node_name: Option<String>,
    pub node_token: Option<String>,
    pub core_host: String,
    pub core_port: u16,
    pub cpu_max_load: f64,
    pub ram_keep_free: u64,
    pub ram: u64,
    pub save_logs: bool,
    pub tick_interval_ms: u64,
    pub java_bin: String,
    pub session_bin: String,
    pub port_range_start: u16,
    pub port_range_end: u16,
    pub agent_artifact: Option<PathBuf>,
    pub groups: Vec<GroupDescriptor>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("./data"),
            control_ws_url: None,
            node_name: None,
            node_token: None,
            core_host: "127.0.0.1".to_string(),
            core_port: 5000,
            cpu_max_load: 0.95,
            ram_keep_free: 1024,
            ram: 8192,
            save_logs: true,
            tick_interval_ms: 1000,
            java_bin: "java".to_string(),
            session_bin: "screen".to_string(),
            port_range_start: 40000,
            port_range_end: 50000,
            agent_artifact: None,
            groups: Vec::new(),
        }
    }
}

impl AgentConfig {
    /// Reads `CORRAL_CONFIG` (or `./corral.toml`), then applies env overrides.
    pub fn load() -> anyhow::Result<Self> {
        let path = env_string("CORRAL_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        let mut cfg = Self::from_file(&path)?;
        cfg.apply_env_overrides();
        cfg.normalize();
        Ok(cfg)
    }

    fn from_file(path: &Path) -> anyhow::Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(raw) => Self::from_toml_str(&raw).with_context(|| format!("parse {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e).with_context(|| format!("read {}", path.display())),
        }
    }

    pub fn from_toml_str(raw: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_string("CORRAL_DATA_ROOT") {
            self.data_root = PathBuf::from(v);
        }
        if let Some(v) = env_string("CORRAL_CONTROL_WS_URL") {
            self.control_ws_url = Some(v);
        }
        if let Some(v) = env_string("CORRAL_NODE_NAME") {
            self.node_name = Some(v);
        }
        if let Some(v) = env_string("CORRAL_NODE_TOKEN") {
            self.node_token = Some(v);
        }
        if let Some(v) = env_f64("CORRAL_CPU_MAX_LOAD") {
            self.cpu_max_load = v;
        }
        if let Some(v) = env_u64("CORRAL_RAM") {
            self.ram = v;
        }
        if let Some(v) = env_u64("CORRAL_RAM_KEEP_FREE") {
            self.ram_keep_free = v;
        }
        if let Some(v) = env_bool("CORRAL_SAVE_LOGS") {
            self.save_logs = v;
        }
    }

    fn normalize(&mut self) {
        if !self.data_root.is_absolute() {
            self.data_root = std::env::current_dir()
                .unwrap_or_else(|_| PathBuf::from("."))
                .join(&self.data_root);
        }
        // Best-effort canonicalization: don't fail if the directory doesn't exist yet.
        self.data_root = std::fs::canonicalize(&self.data_root).unwrap_or(self.data_root.clone());
        self.cpu_max_load = self.cpu_max_load.clamp(0.0, 1.0);
        if self.port_range_end < self.port_range_start {
            std::mem::swap(&mut self.port_range_start, &mut self.port_range_end);
        }
    }

    pub fn layout(&self) -> Layout {
        Layout::new(self.data_root.clone())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.clamp(100, 60_000))
    }

    pub fn port_range(&self) -> RangeInclusive<u16> {
        self.port_range_start..=self.port_range_end
    }

    pub fn node_name(&self) -> String {
        self.node_name
            .clone()
            .or_else(|| env_string("HOSTNAME"))
            .unwrap_or_else(|| "default".to_string())
    }
}

/// Filesystem layout under the data root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn templates_dir(&self, kind: WorkloadKind) -> PathBuf {
        self.root.join("templates").join(kind.label())
    }

    /// `templates/server/<group>_<map>`.
    pub fn map_dir(&self, kind: WorkloadKind, group: &str, map: &str) -> PathBuf {
        self.templates_dir(kind).join(format!("{group}_{map}"))
    }

    pub fn static_dir(&self, kind: WorkloadKind) -> PathBuf {
        self.root.join("static").join(kind.label())
    }

    pub fn temporary_dir(&self, kind: WorkloadKind) -> PathBuf {
        self.root.join("temporary").join(kind.label())
    }

    pub fn global_dir(&self, kind: WorkloadKind) -> PathBuf {
        self.root.join("global").join(kind.label())
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn agent_logs_dir(&self) -> PathBuf {
        self.root.join("agent-logs")
    }

    /// Where a workload's template lives: the static tree for static groups.
    pub fn group_template_dir(&self, kind: WorkloadKind, group: &str, is_static: bool) -> PathBuf {
        let base = if is_static {
            self.static_dir(kind)
        } else {
            self.templates_dir(kind)
        };
        base.join(group)
    }

    pub fn ensure(&self) -> anyhow::Result<()> {
        for kind in [WorkloadKind::Server, WorkloadKind::Proxy] {
            for dir in [
                self.templates_dir(kind),
                self.static_dir(kind),
                self.temporary_dir(kind),
                self.global_dir(kind),
            ] {
                std::fs::create_dir_all(&dir)
                    .with_context(|| format!("create {}", dir.display()))?;
            }
        }
        std::fs::create_dir_all(self.logs_dir()).context("create logs dir")?;
        std::fs::create_dir_all(self.agent_logs_dir()).context("create agent logs dir")?;
        Ok(())
    }
}
