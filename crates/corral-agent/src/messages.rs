use corral_group::{GroupDescriptor, GroupView};
use tokio::sync::mpsc;

use crate::template_sync::Differences;
use crate::workload::WorkloadDescriptor;

/// Frames sent to the control plane.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outbound {
    #[serde(rename_all = "camelCase")]
    Hello { node: String, agent_version: String },
    #[serde(rename_all = "camelCase")]
    Resources {
        ready: bool,
        available_ram: u64,
        max_ram: u64,
    },
    ServerTemplateRequest {
        server: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        template: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        map: Option<String>,
        differences: Differences,
    },
    ProxyTemplateRequest {
        proxy: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        template: Option<String>,
        differences: Differences,
    },
    ServerStarted { server: String, token: String, port: u16 },
    ProxyStarted { proxy: String, token: String, port: u16 },
    ServerNotStarted { name: String, token: String },
    ProxyNotStarted { name: String, token: String },
    GroupInfo { group: GroupView },
}

/// Frames received from the control plane.
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Inbound {
    ServerStart(WorkloadDescriptor),
    ProxyStart(WorkloadDescriptor),
    ServerStopped { name: String },
    ProxyStopped { name: String },
    GroupDeclare { group: GroupDescriptor },
    GroupUndeclare { name: String },
    GroupInfoRequest { name: String },
    #[serde(other)]
    Unknown,
}

pub type OutboundTx = mpsc::UnboundedSender<Outbound>;
pub type OutboundRx = mpsc::UnboundedReceiver<Outbound>;

pub fn publish(tx: &OutboundTx, msg: Outbound) {
    if let Err(e) = tx.send(msg) {
        tracing::warn!(message = ?e.0, "outbound channel closed, dropping message");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbound_uses_upper_snake_type_tags() {
        let msg = Outbound::Resources {
            ready: true,
            available_ram: 2048,
            max_ram: 8192,
        };
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], "RESOURCES");
        assert_eq!(v["availableRam"], 2048);
        assert_eq!(v["maxRam"], 8192);

        let msg = Outbound::ServerNotStarted {
            name: "Lobby-1".to_string(),
            token: "t".to_string(),
        };
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], "SERVER_NOT_STARTED");
        assert_eq!(v["name"], "Lobby-1");
    }

    #[test]
    fn template_request_omits_clean_trees() {
        let msg = Outbound::ServerTemplateRequest {
            server: "Lobby-1".to_string(),
            template: None,
            map: None,
            differences: Differences {
                global_differences: vec!["plugins/a.jar".to_string()],
                ..Default::default()
            },
        };
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], "SERVER_TEMPLATE_REQUEST");
        assert!(v.get("template").is_none());
        assert_eq!(v["differences"]["globalDifferences"][0], "plugins/a.jar");
        assert!(v["differences"].get("templateDifferences").is_none());
    }

    #[test]
    fn inbound_decodes_tagged_frames() {
        let frame = r#"{"type":"SERVER_START","name":"Lobby-1","group":"Lobby","ram":1024,"token":"t"}"#;
        match serde_json::from_str::<Inbound>(frame).unwrap() {
            Inbound::ServerStart(d) => assert_eq!(d.group, "Lobby"),
            other => panic!("unexpected frame: {other:?}"),
        }

        let frame = r#"{"type":"GROUP_DECLARE","group":{"name":"Lobby","ram":2}}"#;
        match serde_json::from_str::<Inbound>(frame).unwrap() {
            Inbound::GroupDeclare { group } => assert_eq!(group.ram, 2),
            other => panic!("unexpected frame: {other:?}"),
        }

        let frame = r#"{"type":"SOMETHING_NEW","x":1}"#;
        assert_eq!(serde_json::from_str::<Inbound>(frame).unwrap(), Inbound::Unknown);
    }
}
