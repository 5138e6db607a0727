use std::{
    fs,
    ops::RangeInclusive,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::Instant,
};

use anyhow::Context;

use crate::config::Layout;
use crate::port_alloc;
use crate::support::format_error_chain;
use crate::template_sync::{self, Differences, ExpectedHashes, TemplateTrees, TreeHasher};
use crate::workload::{InstanceProfile, Workload};

pub const PLUGIN_FILE: &str = "Corral.jar";

const JVM_TUNING_FLAGS: &[&str] = &[
    "-Dfile.encoding=UTF8",
    "-XX:+UseG1GC",
    "-XX:+UnlockExperimentalVMOptions",
    "-XX:MaxGCPauseMillis=10",
    "-XX:GCPauseIntervalMillis=100",
    "-XX:+UseAdaptiveSizePolicy",
    "-XX:ParallelGCThreads=2",
];

/// A fully resolved command, run inside a detached terminal session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub session: String,
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

pub trait Spawn: Send + Sync {
    fn spawn(&self, cmd: &LaunchCommand) -> anyhow::Result<()>;
    fn terminate(&self, session: &str) -> anyhow::Result<()>;
}

/// Starts instances in detached `screen` sessions named after the instance.
#[derive(Debug, Clone)]
pub struct ScreenSpawner {
    session_bin: String,
}

impl ScreenSpawner {
    pub fn new(session_bin: impl Into<String>) -> Self {
        Self {
            session_bin: session_bin.into(),
        }
    }

    fn run(&self, mut cmd: std::process::Command, what: &str) -> anyhow::Result<()> {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            unsafe {
                cmd.pre_exec(|| {
                    // New session: the instance must outlive the agent's process tree.
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let status = cmd
            .status()
            .with_context(|| format!("{what}: run {}", self.session_bin))?;
        if !status.success() {
            anyhow::bail!("{what}: {} exited with {status}", self.session_bin);
        }
        Ok(())
    }
}

impl Spawn for ScreenSpawner {
    fn spawn(&self, launch: &LaunchCommand) -> anyhow::Result<()> {
        let mut cmd = std::process::Command::new(&self.session_bin);
        cmd.arg("-dmS")
            .arg(&launch.session)
            .arg(&launch.program)
            .args(&launch.args)
            .current_dir(&launch.cwd);
        self.run(cmd, "start session")
    }

    fn terminate(&self, session: &str) -> anyhow::Result<()> {
        let mut cmd = std::process::Command::new(&self.session_bin);
        cmd.arg("-S").arg(session).arg("-X").arg("quit");
        self.run(cmd, "quit session")
    }
}

#[derive(Debug, Clone)]
pub struct LaunchSettings {
    pub java_bin: String,
    pub core_host: String,
    pub core_port: u16,
    /// File injected as the instance's plugin.
    pub agent_artifact: PathBuf,
    pub port_range: RangeInclusive<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchOutcome {
    Started {
        port: u16,
    },
    NeedsSync {
        template: Option<String>,
        map: Option<String>,
        differences: Differences,
    },
    NotStarted {
        reason: String,
    },
}

/// Sync check, materialization and spawn for one workload.
pub struct Launcher {
    layout: Layout,
    settings: LaunchSettings,
    hasher: Arc<dyn TreeHasher>,
    spawner: Arc<dyn Spawn>,
}

impl Launcher {
    pub fn new(
        layout: Layout,
        settings: LaunchSettings,
        hasher: Arc<dyn TreeHasher>,
        spawner: Arc<dyn Spawn>,
    ) -> Self {
        Self {
            layout,
            settings,
            hasher,
            spawner,
        }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn spawner(&self) -> Arc<dyn Spawn> {
        self.spawner.clone()
    }

    /// Directory the instance runs in.
    pub fn instance_dir(&self, workload: &Workload) -> PathBuf {
        let d = &workload.descriptor;
        if d.is_static {
            self.layout
                .group_template_dir(workload.kind, &d.group, true)
        } else {
            self.layout.temporary_dir(workload.kind).join(&d.name)
        }
    }

    fn trees(&self, workload: &Workload) -> TemplateTrees {
        let d = &workload.descriptor;
        let profile = workload.kind.profile();
        let map = d
            .map
            .as_deref()
            .filter(|_| profile.supports_maps())
            .map(|m| self.layout.map_dir(workload.kind, &d.group, m));
        TemplateTrees {
            template: self
                .layout
                .group_template_dir(workload.kind, &d.group, d.is_static),
            map,
            global: self.layout.global_dir(workload.kind),
        }
    }

    pub fn launch(&self, workload: &Workload) -> LaunchOutcome {
        let name = workload.name();
        tracing::info!(kind = %workload.kind, %name, "starting instance");
        match self.try_launch(workload) {
            Ok(outcome) => outcome,
            Err(e) => {
                let reason = format_error_chain(&e);
                tracing::error!(kind = %workload.kind, %name, error = %reason, "instance not started");
                if !workload.descriptor.is_static {
                    template_sync::remove_dir(&self.instance_dir(workload));
                }
                LaunchOutcome::NotStarted { reason }
            }
        }
    }

    fn try_launch(&self, workload: &Workload) -> anyhow::Result<LaunchOutcome> {
        let started = Instant::now();
        let d = &workload.descriptor;
        let profile = workload.kind.profile();
        let trees = self.trees(workload);

        if !trees.template.is_dir() {
            anyhow::bail!(
                "no template called {} found, expected directory {}",
                d.group,
                trees.template.display()
            );
        }

        let differences = template_sync::check(
            self.hasher.as_ref(),
            &trees,
            ExpectedHashes {
                template: &d.template_hash,
                map: d.map_hash.as_ref(),
                global: &d.global_hash,
            },
        )?;
        if !differences.is_empty() {
            tracing::info!(
                kind = %workload.kind,
                name = %d.name,
                template = differences.template_differences.len(),
                map = differences.map_differences.len(),
                global = differences.global_differences.len(),
                "template updates found, requesting sync"
            );
            let template = (!differences.template_differences.is_empty())
                .then(|| d.group.clone());
            let map = (!differences.map_differences.is_empty())
                .then(|| d.map.clone())
                .flatten();
            return Ok(LaunchOutcome::NeedsSync {
                template,
                map,
                differences,
            });
        }

        if let Some(map_dir) = &trees.map
            && !map_dir.is_dir()
        {
            anyhow::bail!(
                "no map called {} found for {}, expected directory {}",
                d.map.as_deref().unwrap_or_default(),
                d.group,
                map_dir.display()
            );
        }

        let instance_dir = self.instance_dir(workload);
        if d.is_static {
            template_sync::merge_static(&trees, &instance_dir)?;
        } else {
            template_sync::materialize_ephemeral(&trees, &instance_dir)?;
        }

        let binary = instance_dir.join(profile.binary_name());
        if !binary.is_file() {
            anyhow::bail!(
                "{} does not exist (case sensitive): {}",
                profile.binary_name(),
                binary.display()
            );
        }

        self.inject_plugin(&instance_dir)?;

        let port = port_alloc::find_free_port(self.settings.port_range.clone())
            .ok_or_else(|| anyhow::anyhow!("no free port in {:?}", self.settings.port_range))?;

        profile
            .configure(&instance_dir, &d.name, port)
            .context("write runtime config")?;

        tracing::info!(
            kind = %workload.kind,
            name = %d.name,
            secs = started.elapsed().as_secs_f64(),
            "prepared instance"
        );

        let cmd = self.build_command(workload, profile, &trees.template, &instance_dir, port);
        self.spawner.spawn(&cmd)?;
        tracing::info!(kind = %workload.kind, name = %d.name, port, "started session");

        Ok(LaunchOutcome::Started { port })
    }

    fn inject_plugin(&self, instance_dir: &Path) -> anyhow::Result<()> {
        let plugins = instance_dir.join("plugins");
        fs::create_dir_all(&plugins).with_context(|| format!("create {}", plugins.display()))?;
        let plugin = plugins.join(PLUGIN_FILE);
        if plugin.exists() {
            fs::remove_file(&plugin).with_context(|| format!("remove {}", plugin.display()))?;
        }
        fs::copy(&self.settings.agent_artifact, &plugin).with_context(|| {
            format!(
                "copy plugin {} -> {}",
                self.settings.agent_artifact.display(),
                plugin.display()
            )
        })?;
        Ok(())
    }

    pub fn build_command(
        &self,
        workload: &Workload,
        profile: &dyn InstanceProfile,
        template_dir: &Path,
        instance_dir: &Path,
        port: u16,
    ) -> LaunchCommand {
        let d = &workload.descriptor;
        let random_map = !d.is_static && profile.supports_maps() && d.map.is_some();
        let map_name = d
            .map
            .as_deref()
            .filter(|_| random_map)
            .unwrap_or("default");

        let mut args = vec!["-server".to_string(), format!("-Xmx{}M", d.ram)];
        args.extend(JVM_TUNING_FLAGS.iter().map(|s| s.to_string()));
        args.extend(profile.jvm_properties());
        args.extend([
            format!(
                "-Dcorral-corehost={}:{}",
                self.settings.core_host, self.settings.core_port
            ),
            format!("-Dcorral-randommap={random_map}"),
            format!("-Dcorral-mapname={map_name}"),
            format!("-Dcorral-servername={}", d.name),
            format!("-Dcorral-static={}", d.is_static),
            format!("-Dcorral-token={}", d.token),
            format!("-Dcorral-templatedirectory={}", template_dir.display()),
            format!("-Dcorral-temporarydirectory={}", instance_dir.display()),
            "-jar".to_string(),
            profile.binary_name().to_string(),
        ]);
        args.extend(profile.program_args(port));

        LaunchCommand {
            session: d.name.clone(),
            program: self.settings.java_bin.clone(),
            args,
            cwd: instance_dir.to_path_buf(),
        }
    }
}
