//! The messages exchanged between the controller and a worker.
//!
//! Worker to controller messages are a tagged envelope with exactly one of
//! five kinds. Controller to worker messages are untagged: the initial
//! configuration object, then opaque request strings and pause toggles.

use lightvm_host::{ClientConfig, DatabaseSave, RELAY_DEFAULT_MAX_LOG_LEVEL};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// A message posted by a worker to its controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum WorkerMessage {
    /// A JSON-RPC response emitted by the VM.
    Jsonrpc { data: String },

    /// A persistence request, to be applied in order.
    Database { data: DatabaseSave },

    BestBlockUpdate { num: u32 },

    /// Ask the controller to create a nested worker.
    SpawnVmWorker { data: SpawnRequest },

    /// Ask the controller to tear down a nested worker.
    TerminateVmWorker { data: TerminateRequest },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpawnRequest {
    pub id: u64,

    /// Opaque handshake payload forwarded to the new worker.
    #[serde(rename = "workerMessage")]
    pub worker_message: JsonValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminateRequest {
    pub id: u64,
}

/// A message posted by the controller to a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ControllerMessage {
    /// Always the first message a worker receives.
    Config(WorkerConfig),

    /// An opaque JSON-RPC request.
    Request(String),

    /// Pause (`true`) or resume (`false`) syncing.
    Pause(bool),
}

/// The configuration object handed to a worker.
///
/// Only plain data crosses the thread boundary; the worker builds its own
/// callbacks that post results back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub chain_spec: String,

    #[serde(default)]
    pub database_content: Option<String>,

    #[serde(default)]
    pub relay_chain_spec: Option<String>,

    pub max_log_level: u32,

    #[serde(default = "default_tcp_enabled")]
    pub tcp_enabled: bool,
}

fn default_tcp_enabled() -> bool {
    true
}

impl WorkerConfig {
    /// Extract the data part of a client configuration. Workers log more
    /// by default than directly hosted instances.
    pub fn from_client_config(config: &ClientConfig) -> Option<Self> {
        Some(Self {
            chain_spec: config.chain_spec.clone()?,
            database_content: config.database_content.clone(),
            relay_chain_spec: config.relay_chain_spec.clone(),
            max_log_level: config.max_log_level.unwrap_or(RELAY_DEFAULT_MAX_LOG_LEVEL),
            tcp_enabled: !config.tcp_disabled,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn worker_message_envelope() {
        let message = WorkerMessage::BestBlockUpdate { num: 42 };
        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({ "kind": "best-block-update", "num": 42 })
        );

        let message = WorkerMessage::Jsonrpc {
            data: "{\"id\":1}".into(),
        };
        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({ "kind": "jsonrpc", "data": "{\"id\":1}" })
        );
    }

    #[test]
    fn spawn_request_wire_shape() {
        let parsed: WorkerMessage = serde_json::from_value(json!({
            "kind": "spawn-vm-worker",
            "data": { "id": 3, "workerMessage": { "module": "abc" } },
        }))
        .unwrap();
        assert_eq!(
            parsed,
            WorkerMessage::SpawnVmWorker {
                data: SpawnRequest {
                    id: 3,
                    worker_message: json!({ "module": "abc" }),
                }
            }
        );

        let parsed: WorkerMessage = serde_json::from_value(json!({
            "kind": "terminate-vm-worker",
            "data": { "id": 3 },
        }))
        .unwrap();
        assert_eq!(
            parsed,
            WorkerMessage::TerminateVmWorker {
                data: TerminateRequest { id: 3 }
            }
        );
    }

    #[test]
    fn database_message_carries_payload() {
        let parsed: WorkerMessage = serde_json::from_value(json!({
            "kind": "database",
            "data": { "chain": "state", "blocks": [] },
        }))
        .unwrap();
        match parsed {
            WorkerMessage::Database { data } => assert_eq!(data.chain, json!("state")),
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let parsed = serde_json::from_value::<WorkerMessage>(json!({ "kind": "reboot" }));
        assert!(parsed.is_err());
    }

    #[test]
    fn controller_messages_are_untagged() {
        let config: ControllerMessage = serde_json::from_value(json!({
            "chain_spec": "{}",
            "database_content": null,
            "relay_chain_spec": null,
            "max_log_level": 5,
        }))
        .unwrap();
        assert_eq!(
            config,
            ControllerMessage::Config(WorkerConfig {
                chain_spec: "{}".into(),
                database_content: None,
                relay_chain_spec: None,
                max_log_level: 5,
                tcp_enabled: true,
            })
        );

        let request: ControllerMessage = serde_json::from_value(json!("{\"id\":1}")).unwrap();
        assert_eq!(request, ControllerMessage::Request("{\"id\":1}".into()));

        let pause: ControllerMessage = serde_json::from_value(json!(true)).unwrap();
        assert_eq!(pause, ControllerMessage::Pause(true));
    }

    #[test]
    fn worker_config_defaults_to_verbose_logging() {
        let config = WorkerConfig::from_client_config(&ClientConfig::new("{}")).unwrap();
        assert_eq!(config.max_log_level, RELAY_DEFAULT_MAX_LOG_LEVEL);
        assert!(config.tcp_enabled);

        let config =
            WorkerConfig::from_client_config(&ClientConfig::new("{}").with_max_log_level(0))
                .unwrap();
        assert_eq!(config.max_log_level, 0);

        assert!(WorkerConfig::from_client_config(&ClientConfig::default()).is_none());
    }
}
