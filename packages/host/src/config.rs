//! Startup configuration for a VM instance.

use std::sync::Arc;

use serde_json::Value as JsonValue;

use crate::connection::{NetworkTransports, TransportFactory};
use crate::error::{BridgeError, Result};
use crate::sequencer::DatabaseSink;

/// Default maximum log level when the VM runs directly in the caller's context.
pub const DEFAULT_MAX_LOG_LEVEL: u32 = 3;

/// Default maximum log level when the VM runs behind the worker relay.
pub const RELAY_DEFAULT_MAX_LOG_LEVEL: u32 = 5;

/// Highest meaningful log level (trace).
pub const MAX_LOG_LEVEL: u32 = 5;

/// Receives best-block height updates.
pub type BestBlockCallback = Arc<dyn Fn(u32) + Send + Sync>;

/// Receives JSON-RPC responses emitted by the VM.
pub type JsonRpcCallback = Arc<dyn Fn(String) + Send + Sync>;

/// Configuration for starting a VM instance.
///
/// Only `chain_spec` is required. Log levels follow the VM's convention:
/// 0 = disabled, 1 = error, 2 = warn, 3 = info, 4 = debug, 5 = trace.
#[derive(Clone, Default)]
pub struct ClientConfig {
    /// Chain specification, as JSON text.
    pub chain_spec: Option<String>,

    /// Previously saved database content, if any.
    pub database_content: Option<String>,

    /// Relay chain specification for parachains. Forwarded, never interpreted.
    pub relay_chain_spec: Option<String>,

    /// Where persistence requests end up, in submission order.
    pub database_save_callback: Option<Arc<dyn DatabaseSink>>,

    pub best_block_update_callback: Option<BestBlockCallback>,

    pub json_rpc_callback: Option<JsonRpcCallback>,

    /// Maximum log level; [`DEFAULT_MAX_LOG_LEVEL`] when unset.
    pub max_log_level: Option<u32>,

    /// Whether raw TCP connections may be opened. Defaults to `true`.
    pub tcp_disabled: bool,

    /// Transport factory override; real network transports when unset.
    pub transports: Option<Arc<dyn TransportFactory>>,
}

impl ClientConfig {
    pub fn new(chain_spec: impl Into<String>) -> Self {
        Self {
            chain_spec: Some(chain_spec.into()),
            ..Default::default()
        }
    }

    /// Build a configuration from an untyped configuration object.
    ///
    /// Callbacks cannot be expressed in JSON and must be attached afterwards.
    pub fn from_json(value: &JsonValue) -> Result<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| BridgeError::Config("config must be an object".into()))?;

        let chain_spec = match object.get("chain_spec") {
            Some(JsonValue::String(s)) => s.clone(),
            _ => {
                return Err(BridgeError::Config(
                    "config must include a string chain_spec".into(),
                ))
            }
        };

        let optional_string = |key: &str| -> Result<Option<String>> {
            match object.get(key) {
                None | Some(JsonValue::Null) => Ok(None),
                Some(JsonValue::String(s)) => Ok(Some(s.clone())),
                Some(_) => Err(BridgeError::Config(format!(
                    "{} must be a string or null",
                    key
                ))),
            }
        };

        let max_log_level = match object.get("max_log_level") {
            None | Some(JsonValue::Null) => None,
            Some(v) => Some(
                v.as_u64()
                    .and_then(|level| u32::try_from(level).ok())
                    .ok_or_else(|| {
                        BridgeError::Config("max_log_level must be an integer".into())
                    })?,
            ),
        };

        let config = Self {
            chain_spec: Some(chain_spec),
            database_content: optional_string("database_content")?,
            relay_chain_spec: optional_string("relay_chain_spec")?,
            max_log_level,
            ..Default::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_database_content(mut self, content: impl Into<String>) -> Self {
        self.database_content = Some(content.into());
        self
    }

    pub fn with_relay_chain_spec(mut self, spec: impl Into<String>) -> Self {
        self.relay_chain_spec = Some(spec.into());
        self
    }

    pub fn with_database_sink(mut self, sink: Arc<dyn DatabaseSink>) -> Self {
        self.database_save_callback = Some(sink);
        self
    }

    pub fn with_best_block_callback(
        mut self,
        callback: impl Fn(u32) + Send + Sync + 'static,
    ) -> Self {
        self.best_block_update_callback = Some(Arc::new(callback));
        self
    }

    pub fn with_json_rpc_callback(
        mut self,
        callback: impl Fn(String) + Send + Sync + 'static,
    ) -> Self {
        self.json_rpc_callback = Some(Arc::new(callback));
        self
    }

    pub fn with_max_log_level(mut self, level: u32) -> Self {
        self.max_log_level = Some(level);
        self
    }

    pub fn with_tcp(mut self, enabled: bool) -> Self {
        self.tcp_disabled = !enabled;
        self
    }

    pub fn with_transports(mut self, transports: Arc<dyn TransportFactory>) -> Self {
        self.transports = Some(transports);
        self
    }

    /// Check the configuration before any VM work begins.
    pub fn validate(&self) -> Result<()> {
        if self.chain_spec.is_none() {
            return Err(BridgeError::Config(
                "config must include a string chain_spec".into(),
            ));
        }
        if let Some(level) = self.max_log_level {
            if level > MAX_LOG_LEVEL {
                return Err(BridgeError::Config(format!(
                    "max_log_level must be between 0 and {}, got {}",
                    MAX_LOG_LEVEL, level
                )));
            }
        }
        Ok(())
    }

    /// The effective maximum log level.
    pub fn log_level(&self) -> u32 {
        self.max_log_level.unwrap_or(DEFAULT_MAX_LOG_LEVEL)
    }

    pub(crate) fn transport_factory(&self) -> Arc<dyn TransportFactory> {
        match &self.transports {
            Some(factory) => factory.clone(),
            None => Arc::new(NetworkTransports::new(!self.tcp_disabled)),
        }
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("chain_spec_len", &self.chain_spec.as_ref().map(String::len))
            .field(
                "database_content_len",
                &self.database_content.as_ref().map(String::len),
            )
            .field("relay_chain_spec", &self.relay_chain_spec.is_some())
            .field("database_save_callback", &self.database_save_callback.is_some())
            .field(
                "best_block_update_callback",
                &self.best_block_update_callback.is_some(),
            )
            .field("json_rpc_callback", &self.json_rpc_callback.is_some())
            .field("max_log_level", &self.max_log_level)
            .field("tcp_disabled", &self.tcp_disabled)
            .finish()
    }
}
