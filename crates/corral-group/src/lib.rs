use std::{
    fmt,
    hash::{Hash, Hasher},
    sync::Arc,
};

/// Lifecycle states that do not count towards a group's available capacity
/// unless the group says otherwise.
pub const DEFAULT_SORT_OUT_STATES: [&str; 3] = ["OFFLINE", "STARTING", "RESTARTING"];

/// Values at or below this are interpreted as GB.
const RAM_GB_THRESHOLD: u32 = 128;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GroupError {
    #[error("group name must be non-empty")]
    EmptyName,
    #[error("static groups ({0}) can only have 1 server, set online-amount to 1")]
    StaticOnlineAmount(String),
    #[error("static server group {0} has no base specified")]
    StaticWithoutBase(String),
}

fn default_online_amount() -> u32 {
    1
}

fn default_max_amount() -> u32 {
    10
}

fn default_ram() -> u32 {
    1024
}

fn default_priority() -> i32 {
    1
}

fn default_sort_out_states() -> Vec<String> {
    DEFAULT_SORT_OUT_STATES
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Declarative form of a group, as found in the agent config or pushed by the
/// control plane.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GroupDescriptor {
    pub name: String,
    #[serde(default = "default_online_amount")]
    pub online_amount: u32,
    #[serde(default = "default_max_amount")]
    pub max_amount: u32,
    #[serde(default = "default_ram")]
    pub ram: u32,
    #[serde(default, rename = "static")]
    pub is_static: bool,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default, rename = "base", skip_serializing_if = "Option::is_none")]
    pub base_name: Option<String>,
    #[serde(default = "default_sort_out_states")]
    pub sort_out_states: Vec<String>,
}

impl GroupDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            online_amount: default_online_amount(),
            max_amount: default_max_amount(),
            ram: default_ram(),
            is_static: false,
            priority: default_priority(),
            base_name: None,
            sort_out_states: default_sort_out_states(),
        }
    }
}

/// Read-only snapshot of one member instance.
///
/// Field order matters: the derived `Ord` sorts by name first.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberView {
    pub name: String,
    pub group: String,
    pub state: String,
    pub port: Option<u16>,
    pub map: Option<String>,
}

/// Read-only snapshot of a group and its members for external consumers.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupView {
    pub name: String,
    pub online_amount: u32,
    pub max_amount: u32,
    pub ram: u32,
    #[serde(rename = "static")]
    pub is_static: bool,
    pub priority: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_name: Option<String>,
    pub sort_out_states: Vec<String>,
    pub members: Vec<MemberView>,
}

/// An instance that can belong to a [`ServerGroup`].
pub trait GroupMember {
    fn name(&self) -> &str;
    fn state(&self) -> String;
    fn stop(&self);
    fn to_view(&self) -> MemberView;
}

/// Node-local mirror of a group's capacity contract and its current members.
///
/// Equality and hashing only consider the name.
#[derive(Debug)]
pub struct ServerGroup<M> {
    name: String,
    members: Vec<Arc<M>>,
    online_amount: u32,
    max_amount: u32,
    ram: u32,
    is_static: bool,
    priority: i32,
    base_name: Option<String>,
    sort_out_states: Vec<String>,
}

pub fn normalize_ram(ram: u32) -> u32 {
    if ram <= RAM_GB_THRESHOLD {
        ram.saturating_mul(1024)
    } else {
        ram
    }
}

fn validate(desc: &GroupDescriptor) -> Result<(), GroupError> {
    if desc.name.trim().is_empty() {
        return Err(GroupError::EmptyName);
    }
    if desc.is_static && desc.online_amount > 1 {
        return Err(GroupError::StaticOnlineAmount(desc.name.clone()));
    }
    if desc.is_static && desc.base_name.as_deref().is_none_or(|b| b.trim().is_empty()) {
        return Err(GroupError::StaticWithoutBase(desc.name.clone()));
    }
    Ok(())
}

impl<M: GroupMember> ServerGroup<M> {
    /// Builds a group from its descriptor. Invalid descriptors are logged and
    /// rejected as a whole; nothing is partially applied.
    pub fn new(desc: GroupDescriptor) -> Result<Self, GroupError> {
        if let Err(e) = validate(&desc) {
            tracing::error!(group = %desc.name, error = %e, "rejecting server group");
            return Err(e);
        }

        let ram = normalize_ram(desc.ram);
        if ram < RAM_GB_THRESHOLD {
            tracing::error!(
                group = %desc.name,
                ram,
                "server group has less than 128MB ram, instances will not start properly"
            );
        }

        Ok(Self {
            name: desc.name,
            members: Vec::new(),
            online_amount: desc.online_amount,
            max_amount: desc.max_amount,
            ram,
            is_static: desc.is_static,
            priority: desc.priority,
            base_name: desc.base_name,
            sort_out_states: desc.sort_out_states,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn online_amount(&self) -> u32 {
        self.online_amount
    }

    pub fn max_amount(&self) -> u32 {
        self.max_amount
    }

    pub fn ram(&self) -> u32 {
        self.ram
    }

    pub fn is_static(&self) -> bool {
        self.is_static
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn base_name(&self) -> Option<&str> {
        self.base_name.as_deref()
    }

    pub fn sort_out_states(&self) -> &[String] {
        &self.sort_out_states
    }

    pub fn members(&self) -> &[Arc<M>] {
        &self.members
    }

    pub fn member(&self, name: &str) -> Option<&Arc<M>> {
        self.members.iter().find(|m| m.name() == name)
    }

    /// Members whose state is not sorted out.
    pub fn available_count(&self) -> usize {
        self.members
            .iter()
            .filter(|m| {
                let state = m.state();
                !self.sort_out_states.iter().any(|s| *s == state)
            })
            .count()
    }

    /// Returns `false` (and logs) when a member with the same name is already present.
    pub fn add_starting_server(&mut self, member: Arc<M>) -> bool {
        if self.member(member.name()).is_some() {
            tracing::error!(
                group = %self.name,
                name = %member.name(),
                "tried to add already existing starting server"
            );
            return false;
        }
        self.members.push(member);
        true
    }

    pub fn remove_server(&mut self, name: &str) -> Option<Arc<M>> {
        let idx = self.members.iter().position(|m| m.name() == name)?;
        Some(self.members.remove(idx))
    }

    /// Stops every member present at call time and drops them from the group.
    pub fn stop_all_servers(&mut self) {
        let snapshot: Vec<Arc<M>> = self.members.clone();
        for member in &snapshot {
            member.stop();
        }
        self.members
            .retain(|m| !snapshot.iter().any(|s| Arc::ptr_eq(s, m)));
    }

    pub fn to_group_object(&self) -> GroupView {
        let mut members: Vec<MemberView> = self.members.iter().map(|m| m.to_view()).collect();
        members.sort();
        GroupView {
            name: self.name.clone(),
            online_amount: self.online_amount,
            max_amount: self.max_amount,
            ram: self.ram,
            is_static: self.is_static,
            priority: self.priority,
            base_name: self.base_name.clone(),
            sort_out_states: self.sort_out_states.clone(),
            members,
        }
    }

    pub fn to_descriptor(&self) -> GroupDescriptor {
        GroupDescriptor {
            name: self.name.clone(),
            online_amount: self.online_amount,
            max_amount: self.max_amount,
            ram: self.ram,
            is_static: self.is_static,
            priority: self.priority,
            base_name: self.base_name.clone(),
            sort_out_states: self.sort_out_states.clone(),
        }
    }
}

impl<M> PartialEq for ServerGroup<M> {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl<M> Eq for ServerGroup<M> {}

impl<M> Hash for ServerGroup<M> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl<M> fmt::Display for ServerGroup<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        collections::HashSet,
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
    };

    #[derive(Debug)]
    struct TestMember {
        name: String,
        state: Mutex<String>,
        stops: AtomicUsize,
    }

    impl TestMember {
        fn new(name: &str, state: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                state: Mutex::new(state.to_string()),
                stops: AtomicUsize::new(0),
            })
        }
    }

    impl GroupMember for TestMember {
        fn name(&self) -> &str {
            &self.name
        }

        fn state(&self) -> String {
            self.state.lock().unwrap().clone()
        }

        fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
            *self.state.lock().unwrap() = "OFFLINE".to_string();
        }

        fn to_view(&self) -> MemberView {
            MemberView {
                name: self.name.clone(),
                group: "Lobby".to_string(),
                state: self.state(),
                port: None,
                map: None,
            }
        }
    }

    fn group(desc: GroupDescriptor) -> ServerGroup<TestMember> {
        ServerGroup::new(desc).unwrap()
    }

    #[test]
    fn small_ram_is_read_as_gigabytes() {
        for ram in [1, 2, 64, 128] {
            let mut d = GroupDescriptor::new("Lobby");
            d.ram = ram;
            assert_eq!(group(d).ram(), ram * 1024);
        }
        for ram in [129, 512, 4096] {
            let mut d = GroupDescriptor::new("Lobby");
            d.ram = ram;
            assert_eq!(group(d).ram(), ram);
        }
    }

    #[test]
    fn static_group_with_many_online_is_rejected() {
        let mut d = GroupDescriptor::new("Build");
        d.is_static = true;
        d.base_name = Some("Build".to_string());
        d.online_amount = 2;
        let err = ServerGroup::<TestMember>::new(d).unwrap_err();
        assert_eq!(err, GroupError::StaticOnlineAmount("Build".to_string()));
    }

    #[test]
    fn static_group_requires_base() {
        let mut d = GroupDescriptor::new("Build");
        d.is_static = true;
        let err = ServerGroup::<TestMember>::new(d).unwrap_err();
        assert_eq!(err, GroupError::StaticWithoutBase("Build".to_string()));
    }

    #[test]
    fn static_group_with_single_instance_is_accepted() {
        let mut d = GroupDescriptor::new("Build");
        d.is_static = true;
        d.base_name = Some("Build".to_string());
        let g = group(d);
        assert!(g.is_static());
        assert_eq!(g.base_name(), Some("Build"));
    }

    #[test]
    fn descriptor_defaults_apply() {
        let d: GroupDescriptor = serde_json::from_str(r#"{"name":"Lobby"}"#).unwrap();
        assert_eq!(d, GroupDescriptor::new("Lobby"));
        assert_eq!(d.sort_out_states, vec!["OFFLINE", "STARTING", "RESTARTING"]);
    }

    #[test]
    fn descriptor_round_trips_through_group() {
        let d: GroupDescriptor = serde_json::from_str(
            r#"{"name":"Game","online-amount":3,"max-amount":8,"ram":2,"priority":5,"sort-out-states":["OFFLINE"]}"#,
        )
        .unwrap();
        let g = group(d);
        let out = g.to_descriptor();
        assert_eq!(out.ram, 2048);
        assert_eq!(out.priority, 5);
        assert_eq!(out.online_amount, 3);

        let json = serde_json::to_value(&out).unwrap();
        assert!(json.get("base").is_none());
        assert_eq!(json["max-amount"], 8);
    }

    #[test]
    fn duplicate_members_are_rejected() {
        let mut g = group(GroupDescriptor::new("Lobby"));
        assert!(g.add_starting_server(TestMember::new("Lobby-1", "STARTING")));
        assert!(!g.add_starting_server(TestMember::new("Lobby-1", "STARTING")));
        assert_eq!(g.members().len(), 1);
    }

    #[test]
    fn removing_absent_member_is_noop() {
        let mut g = group(GroupDescriptor::new("Lobby"));
        g.add_starting_server(TestMember::new("Lobby-1", "STARTING"));
        assert!(g.remove_server("Lobby-9").is_none());
        assert_eq!(g.members().len(), 1);
        assert!(g.remove_server("Lobby-1").is_some());
        assert!(g.members().is_empty());
    }

    #[test]
    fn stop_all_stops_each_member_once() {
        let mut g = group(GroupDescriptor::new("Lobby"));
        let a = TestMember::new("Lobby-1", "ONLINE");
        let b = TestMember::new("Lobby-2", "STARTING");
        g.add_starting_server(a.clone());
        g.add_starting_server(b.clone());

        g.stop_all_servers();

        assert!(g.members().is_empty());
        assert_eq!(a.stops.load(Ordering::SeqCst), 1);
        assert_eq!(b.stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn available_count_skips_sorted_out_states() {
        let mut g = group(GroupDescriptor::new("Lobby"));
        g.add_starting_server(TestMember::new("Lobby-1", "ONLINE"));
        g.add_starting_server(TestMember::new("Lobby-2", "STARTING"));
        g.add_starting_server(TestMember::new("Lobby-3", "INGAME"));
        assert_eq!(g.available_count(), 2);
    }

    #[test]
    fn group_object_is_sorted_snapshot() {
        let mut g = group(GroupDescriptor::new("Lobby"));
        let b = TestMember::new("Lobby-2", "ONLINE");
        g.add_starting_server(b.clone());
        g.add_starting_server(TestMember::new("Lobby-1", "STARTING"));

        let view = g.to_group_object();
        let names: Vec<&str> = view.members.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["Lobby-1", "Lobby-2"]);

        *b.state.lock().unwrap() = "INGAME".to_string();
        g.remove_server("Lobby-1");
        assert_eq!(view.members.len(), 2);
        assert_eq!(view.members[1].state, "ONLINE");
    }

    #[test]
    fn groups_compare_by_name() {
        let a = group(GroupDescriptor::new("Lobby"));
        let mut d = GroupDescriptor::new("Lobby");
        d.max_amount = 99;
        let b = group(d);
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(!set.insert(b));
        assert_eq!(set.iter().next().unwrap().to_string(), "Lobby");
    }
}
