use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use corral_group::{GroupDescriptor, GroupError, GroupMember, GroupView, MemberView, ServerGroup};

use crate::launcher::Spawn;
use crate::workload::{Workload, WorkloadKind};

#[derive(Debug, Clone)]
struct InstanceStatus {
    state: String,
    port: Option<u16>,
}

/// A workload instance known to this node.
pub struct Instance {
    name: String,
    group: String,
    map: Option<String>,
    status: Mutex<InstanceStatus>,
    spawner: Arc<dyn Spawn>,
}

impl Instance {
    pub fn starting(workload: &Workload, spawner: Arc<dyn Spawn>) -> Self {
        Self {
            name: workload.descriptor.name.clone(),
            group: workload.descriptor.group.clone(),
            map: workload.descriptor.map.clone(),
            status: Mutex::new(InstanceStatus {
                state: "STARTING".to_string(),
                port: None,
            }),
            spawner,
        }
    }

    fn status(&self) -> std::sync::MutexGuard<'_, InstanceStatus> {
        self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_port(&self, port: u16) {
        self.status().port = Some(port);
    }
}

impl GroupMember for Instance {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> String {
        self.status().state.clone()
    }

    fn stop(&self) {
        if let Err(e) = self.spawner.terminate(&self.name) {
            tracing::warn!(name = %self.name, error = %e, "failed to stop instance session");
        }
        self.status().state = "OFFLINE".to_string();
    }

    fn to_view(&self) -> MemberView {
        let status = self.status().clone();
        MemberView {
            name: self.name.clone(),
            group: self.group.clone(),
            state: status.state,
            port: status.port,
            map: self.map.clone(),
        }
    }
}

/// What the node remembers about an instance between start and stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRecord {
    pub group: String,
    pub is_static: bool,
    /// Queue entries under this name that have not been launched yet.
    queued: usize,
    running: bool,
}

impl InstanceRecord {
    pub fn new(group: impl Into<String>, is_static: bool) -> Self {
        Self {
            group: group.into(),
            is_static,
            queued: 0,
            running: false,
        }
    }
}

/// Declared groups plus an index of the instances started on this node.
#[derive(Default)]
pub struct GroupRegistry {
    groups: HashMap<String, ServerGroup<Instance>>,
    instances: HashMap<String, InstanceRecord>,
}

impl GroupRegistry {
    /// Declares or replaces a group. Members of a replaced group are kept.
    pub fn declare(&mut self, desc: GroupDescriptor) -> Result<(), GroupError> {
        let mut group = ServerGroup::new(desc)?;
        if let Some(old) = self.groups.remove(group.name()) {
            for member in old.members() {
                group.add_starting_server(member.clone());
            }
        }
        tracing::info!(group = %group.name(), ram = group.ram(), "declared group");
        self.groups.insert(group.name().to_string(), group);
        Ok(())
    }

    /// Stops every member and forgets the group.
    pub fn undeclare(&mut self, name: &str) -> bool {
        let Some(mut group) = self.groups.remove(name) else {
            return false;
        };
        let names: Vec<String> = group.members().iter().map(|m| m.name.clone()).collect();
        group.stop_all_servers();
        for n in names {
            self.instances.remove(&n);
        }
        tracing::info!(group = %name, "undeclared group");
        true
    }

    pub fn group_view(&self, name: &str) -> Option<GroupView> {
        self.groups.get(name).map(|g| g.to_group_object())
    }

    /// Registers a queued workload. Server instances join their declared group.
    pub fn track_starting(&mut self, workload: &Workload, spawner: Arc<dyn Spawn>) {
        let d = &workload.descriptor;
        self.instances
            .entry(d.name.clone())
            .or_insert_with(|| InstanceRecord::new(d.group.clone(), d.is_static))
            .queued += 1;

        if workload.kind != WorkloadKind::Server {
            return;
        }
        match self.groups.get_mut(&d.group) {
            Some(group) if group.member(&d.name).is_some() => {
                tracing::debug!(name = %d.name, "instance already tracked, queued again");
            }
            Some(group) => {
                group.add_starting_server(Arc::new(Instance::starting(workload, spawner)));
            }
            None => {
                tracing::debug!(name = %d.name, group = %d.group, "instance group not declared on this node");
            }
        }
    }

    pub fn mark_started(&mut self, name: &str, port: u16) {
        let Some(record) = self.instances.get_mut(name) else {
            return;
        };
        record.queued = record.queued.saturating_sub(1);
        record.running = true;
        if let Some(member) = self
            .groups
            .get(&record.group)
            .and_then(|g| g.member(name))
        {
            member.set_port(port);
        }
    }

    /// One queued launch under `name` did not start. The instance is dropped
    /// only when nothing else under that name is queued or running.
    pub fn launch_failed(&mut self, name: &str) {
        let Some(record) = self.instances.get_mut(name) else {
            return;
        };
        record.queued = record.queued.saturating_sub(1);
        if record.queued == 0 && !record.running {
            self.remove(name);
        }
    }

    /// The running instance under `name` stopped. Returns what was known about
    /// it; the record survives while another launch under the name is queued.
    pub fn stopped(&mut self, name: &str) -> Option<InstanceRecord> {
        let record = self.instances.get_mut(name)?;
        record.running = false;
        let snapshot = record.clone();
        if record.queued == 0 {
            self.remove(name);
        }
        Some(snapshot)
    }

    fn remove(&mut self, name: &str) {
        let Some(record) = self.instances.remove(name) else {
            return;
        };
        if let Some(group) = self.groups.get_mut(&record.group) {
            group.remove_server(name);
        }
    }
}

/// `Lobby-12` belongs to `Lobby`.
pub fn group_from_name(name: &str) -> &str {
    match name.rsplit_once('-') {
        Some((group, suffix))
            if !group.is_empty()
                && !suffix.is_empty()
                && suffix.chars().all(|c| c.is_ascii_digit()) =>
        {
            group
        }
        _ => name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::testing::RecordingSpawner;
    use crate::workload::WorkloadDescriptor;

    fn workload(kind: WorkloadKind, name: &str, group: &str) -> Workload {
        Workload {
            kind,
            descriptor: WorkloadDescriptor {
                name: name.to_string(),
                group: group.to_string(),
                is_static: false,
                ram: 512,
                token: "t".to_string(),
                map: None,
                template_hash: Default::default(),
                map_hash: None,
                global_hash: Default::default(),
            },
        }
    }

    #[test]
    fn group_from_name_strips_numeric_suffix() {
        assert_eq!(group_from_name("Lobby-12"), "Lobby");
        assert_eq!(group_from_name("Bed-Wars-3"), "Bed-Wars");
        assert_eq!(group_from_name("Build"), "Build");
        assert_eq!(group_from_name("Build-x"), "Build-x");
    }

    #[test]
    fn starting_servers_join_declared_group() {
        let spawner = Arc::new(RecordingSpawner::default());
        let mut reg = GroupRegistry::default();
        reg.declare(GroupDescriptor::new("Lobby")).unwrap();

        reg.track_starting(&workload(WorkloadKind::Server, "Lobby-2", "Lobby"), spawner.clone());
        reg.track_starting(&workload(WorkloadKind::Server, "Lobby-1", "Lobby"), spawner.clone());
        reg.mark_started("Lobby-1", 40001);

        let view = reg.group_view("Lobby").unwrap();
        assert_eq!(view.members.len(), 2);
        assert_eq!(view.members[0].name, "Lobby-1");
        assert_eq!(view.members[0].port, Some(40001));
        assert_eq!(view.members[1].state, "STARTING");

        assert!(reg.stopped("Lobby-1").is_some());
        assert_eq!(reg.groups["Lobby"].members().len(), 1);
        assert_eq!(reg.groups["Lobby"].members()[0].name(), "Lobby-2");
        assert!(reg.stopped("Lobby-1").is_none());
    }

    #[test]
    fn undeclare_stops_members() {
        let spawner = Arc::new(RecordingSpawner::default());
        let mut reg = GroupRegistry::default();
        reg.declare(GroupDescriptor::new("Lobby")).unwrap();
        reg.track_starting(&workload(WorkloadKind::Server, "Lobby-1", "Lobby"), spawner.clone());

        assert!(reg.undeclare("Lobby"));
        assert_eq!(*spawner.terminated.lock().unwrap(), vec!["Lobby-1".to_string()]);
        assert!(reg.group_view("Lobby").is_none());
        assert!(!reg.instances.contains_key("Lobby-1"));
        assert!(!reg.undeclare("Lobby"));
    }

    #[test]
    fn redeclare_keeps_members() {
        let spawner = Arc::new(RecordingSpawner::default());
        let mut reg = GroupRegistry::default();
        reg.declare(GroupDescriptor::new("Lobby")).unwrap();
        reg.track_starting(&workload(WorkloadKind::Server, "Lobby-1", "Lobby"), spawner);

        let mut d = GroupDescriptor::new("Lobby");
        d.max_amount = 20;
        reg.declare(d).unwrap();

        let g = &reg.groups["Lobby"];
        assert_eq!(g.max_amount(), 20);
        assert_eq!(g.members().len(), 1);
    }

    #[test]
    fn invalid_group_is_not_declared() {
        let mut reg = GroupRegistry::default();
        let mut d = GroupDescriptor::new("Build");
        d.is_static = true;
        d.online_amount = 3;
        assert!(reg.declare(d).is_err());
        assert!(reg.group_view("Build").is_none());
    }

    #[test]
    fn proxies_are_indexed_but_not_grouped() {
        let spawner = Arc::new(RecordingSpawner::default());
        let mut reg = GroupRegistry::default();
        reg.declare(GroupDescriptor::new("Proxy")).unwrap();
        reg.track_starting(&workload(WorkloadKind::Proxy, "Proxy-1", "Proxy"), spawner);

        assert!(reg.instances.contains_key("Proxy-1"));
        assert!(reg.groups["Proxy"].members().is_empty());
    }

    #[test]
    fn failed_launch_keeps_record_for_queued_duplicate() {
        let spawner = Arc::new(RecordingSpawner::default());
        let mut reg = GroupRegistry::default();
        reg.declare(GroupDescriptor::new("Lobby")).unwrap();
        let w = workload(WorkloadKind::Server, "Lobby-1", "Lobby");
        reg.track_starting(&w, spawner.clone());
        reg.track_starting(&w, spawner);
        assert_eq!(reg.groups["Lobby"].members().len(), 1);

        reg.launch_failed("Lobby-1");
        assert!(reg.instances.contains_key("Lobby-1"));
        assert_eq!(reg.groups["Lobby"].members().len(), 1);

        reg.mark_started("Lobby-1", 40002);
        assert_eq!(reg.group_view("Lobby").unwrap().members[0].port, Some(40002));

        assert!(reg.stopped("Lobby-1").is_some());
        assert!(!reg.instances.contains_key("Lobby-1"));
        assert!(reg.groups["Lobby"].members().is_empty());
    }

    #[test]
    fn failed_duplicate_does_not_drop_running_instance() {
        let spawner = Arc::new(RecordingSpawner::default());
        let mut reg = GroupRegistry::default();
        reg.declare(GroupDescriptor::new("Lobby")).unwrap();
        let w = workload(WorkloadKind::Server, "Lobby-1", "Lobby");
        reg.track_starting(&w, spawner.clone());
        reg.track_starting(&w, spawner);

        reg.mark_started("Lobby-1", 40001);
        reg.launch_failed("Lobby-1");

        assert!(reg.instances.contains_key("Lobby-1"));
        assert_eq!(reg.groups["Lobby"].members().len(), 1);
    }

    #[test]
    fn last_failed_launch_drops_the_instance() {
        let spawner = Arc::new(RecordingSpawner::default());
        let mut reg = GroupRegistry::default();
        reg.declare(GroupDescriptor::new("Lobby")).unwrap();
        reg.track_starting(&workload(WorkloadKind::Server, "Lobby-1", "Lobby"), spawner);

        reg.launch_failed("Lobby-1");

        assert!(!reg.instances.contains_key("Lobby-1"));
        assert!(reg.groups["Lobby"].members().is_empty());
    }
}
