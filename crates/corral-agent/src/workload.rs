use std::{collections::BTreeMap, path::Path};

use crate::properties;

/// Relative path (`/`-separated) to content hash.
pub type HashMapping = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadKind {
    Server,
    Proxy,
}

impl WorkloadKind {
    pub fn label(self) -> &'static str {
        match self {
            WorkloadKind::Server => "server",
            WorkloadKind::Proxy => "proxy",
        }
    }

    pub fn profile(self) -> &'static dyn InstanceProfile {
        match self {
            WorkloadKind::Server => &ServerProfile,
            WorkloadKind::Proxy => &ProxyProfile,
        }
    }
}

impl std::fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// A start request as pushed by the control plane. Immutable once enqueued.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadDescriptor {
    pub name: String,
    pub group: String,
    #[serde(default, rename = "static")]
    pub is_static: bool,
    pub ram: u32,
    pub token: String,
    #[serde(default)]
    pub map: Option<String>,
    #[serde(default)]
    pub template_hash: HashMapping,
    #[serde(default)]
    pub map_hash: Option<HashMapping>,
    #[serde(default)]
    pub global_hash: HashMapping,
}

impl WorkloadDescriptor {
    /// Entries without a usable identity cannot be launched and are skipped by the scheduler.
    pub fn is_launchable(&self) -> bool {
        valid_instance_name(&self.name) && valid_instance_name(&self.group)
    }
}

/// Names end up as a single path component under the data root.
pub fn valid_instance_name(name: &str) -> bool {
    !name.trim().is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workload {
    pub kind: WorkloadKind,
    pub descriptor: WorkloadDescriptor,
}

impl Workload {
    pub fn server(descriptor: WorkloadDescriptor) -> Self {
        Self {
            kind: WorkloadKind::Server,
            descriptor,
        }
    }

    pub fn proxy(descriptor: WorkloadDescriptor) -> Self {
        Self {
            kind: WorkloadKind::Proxy,
            descriptor,
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }
}

/// What differs between launching a game server and a proxy.
pub trait InstanceProfile: Send + Sync {
    /// Executable jar that must exist at the instance root.
    fn binary_name(&self) -> &'static str;

    fn supports_maps(&self) -> bool;

    /// Writes the runtime settings the agent owns into the instance directory.
    fn configure(&self, instance_dir: &Path, name: &str, port: u16) -> anyhow::Result<()>;

    /// Extra JVM system properties for this kind.
    fn jvm_properties(&self) -> Vec<String>;

    /// Arguments passed after `-jar <binary>`.
    fn program_args(&self, port: u16) -> Vec<String>;
}

pub struct ServerProfile;

impl InstanceProfile for ServerProfile {
    fn binary_name(&self) -> &'static str {
        "spigot.jar"
    }

    fn supports_maps(&self) -> bool {
        true
    }

    fn configure(&self, instance_dir: &Path, name: &str, _port: u16) -> anyhow::Result<()> {
        properties::set_properties(
            &instance_dir.join("server.properties"),
            &[("online-mode", "false"), ("server-name", name)],
        )
    }

    fn jvm_properties(&self) -> Vec<String> {
        vec!["-Dcom.mojang.eula.agree=true".to_string()]
    }

    fn program_args(&self, port: u16) -> Vec<String> {
        vec![
            "-o".to_string(),
            "false".to_string(),
            "-h".to_string(),
            "0.0.0.0".to_string(),
            "-p".to_string(),
            port.to_string(),
        ]
    }
}

pub struct ProxyProfile;

impl InstanceProfile for ProxyProfile {
    fn binary_name(&self) -> &'static str {
        "BungeeCord.jar"
    }

    fn supports_maps(&self) -> bool {
        false
    }

    // The proxy has no bind-port flag; the listener is set in its config instead.
    fn configure(&self, instance_dir: &Path, name: &str, port: u16) -> anyhow::Result<()> {
        properties::configure_proxy_yaml(&instance_dir.join("config.yml"), name, port)
    }

    fn jvm_properties(&self) -> Vec<String> {
        Vec::new()
    }

    fn program_args(&self, _port: u16) -> Vec<String> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_parses_control_plane_json() {
        let json = r#"{
            "name": "Lobby-1",
            "group": "Lobby",
            "static": false,
            "ram": 1024,
            "token": "abc",
            "map": "Castle",
            "templateHash": {"spigot.jar": "aa"},
            "mapHash": {"world/level.dat": "bb"},
            "globalHash": {}
        }"#;
        let d: WorkloadDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(d.name, "Lobby-1");
        assert_eq!(d.map.as_deref(), Some("Castle"));
        assert_eq!(d.template_hash.get("spigot.jar").map(String::as_str), Some("aa"));
        assert!(d.map_hash.is_some());
        assert!(d.is_launchable());
    }

    #[test]
    fn descriptor_without_identity_is_not_launchable() {
        let d: WorkloadDescriptor =
            serde_json::from_str(r#"{"name":"","group":"Lobby","ram":512,"token":"t"}"#).unwrap();
        assert!(!d.is_launchable());
    }

    #[test]
    fn path_like_names_are_rejected() {
        for bad in ["", "  ", ".", "..", "../../templates/server/Lobby", "a/b", "a\\b"] {
            assert!(!valid_instance_name(bad), "{bad:?} should be rejected");
        }
        assert!(valid_instance_name("Lobby-1"));
        assert!(valid_instance_name("Bed.Wars-2"));

        let d: WorkloadDescriptor = serde_json::from_str(
            r#"{"name":"../Lobby","group":"Lobby","ram":512,"token":"t"}"#,
        )
        .unwrap();
        assert!(!d.is_launchable());
        let d: WorkloadDescriptor =
            serde_json::from_str(r#"{"name":"Lobby-1","group":"..","ram":512,"token":"t"}"#)
                .unwrap();
        assert!(!d.is_launchable());
    }

    #[test]
    fn profiles_differ_per_kind() {
        assert_eq!(WorkloadKind::Server.profile().binary_name(), "spigot.jar");
        assert_eq!(WorkloadKind::Proxy.profile().binary_name(), "BungeeCord.jar");
        assert!(!WorkloadKind::Proxy.profile().supports_maps());
        assert_eq!(
            WorkloadKind::Server.profile().program_args(40001).last().map(String::as_str),
            Some("40001")
        );
        assert!(WorkloadKind::Proxy.profile().program_args(40001).is_empty());
    }
}
