//! Loading and starting VM instances.

use std::path::Path;

use base64::Engine as _;
use tokio::sync::{mpsc, watch};
use wasmtime::{Engine, Linker, Module, Store};

use crate::config::ClientConfig;
use crate::error::{BridgeError, Result};
use crate::host::{HostState, VmStatus};
use crate::imports::register_imports;
use crate::memory;
use crate::session::{vm_error, Controller, Session, SessionId, VmExports};

const WASM_MAGIC: &[u8] = b"\0asm";

/// The VM module, as WebAssembly binary (or text) bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct VmBytecode(Vec<u8>);

impl VmBytecode {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Decode a base64 text constant. Whitespace is ignored.
    pub fn from_base64(text: &str) -> Result<Self> {
        let compact: String = text.chars().filter(|c| !c.is_ascii_whitespace()).collect();
        base64::engine::general_purpose::STANDARD
            .decode(compact)
            .map(Self)
            .map_err(|e| BridgeError::Decode(format!("invalid base64 bytecode: {}", e)))
    }

    /// Read a module from disk.
    ///
    /// Files starting with the WebAssembly magic number are taken as is;
    /// other files are decoded as base64 when possible and otherwise handed
    /// to the engine unchanged, which also accepts the text format.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .map_err(|e| BridgeError::Decode(format!("{}: {}", path.display(), e)))?;

        if bytes.starts_with(WASM_MAGIC) {
            return Ok(Self(bytes));
        }
        match std::str::from_utf8(&bytes).map(Self::from_base64) {
            Ok(Ok(decoded)) if decoded.0.starts_with(WASM_MAGIC) => Ok(decoded),
            _ => Ok(Self(bytes)),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for VmBytecode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "VmBytecode({} bytes)", self.0.len())
    }
}

/// A compiled VM module, ready to be instantiated any number of times.
///
/// Every call to [`VmLoader::start`] creates a fresh instance with its own
/// host state; a terminated instance is never reused.
#[derive(Clone)]
pub struct VmLoader {
    engine: Engine,
    module: Module,
}

impl VmLoader {
    pub fn new(bytecode: &VmBytecode) -> Result<Self> {
        let engine = Engine::default();
        let module = Module::new(&engine, bytecode.as_bytes())
            .map_err(|e| BridgeError::wasm("compile", e))?;
        Ok(Self { engine, module })
    }

    /// Instantiate the module, run its `init` export and spawn the session
    /// that drives it.
    ///
    /// Must be called from within a tokio runtime. The configuration is
    /// validated before any VM work begins.
    pub async fn start(&self, config: ClientConfig) -> Result<Controller> {
        config.validate()?;
        tokio::runtime::Handle::try_current().map_err(|_| {
            BridgeError::Config("VM instances must be started within a tokio runtime".into())
        })?;

        let session = SessionId::new();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(VmStatus::Active);

        let state = HostState::new(session, &config, events_tx.clone(), status_tx);
        let mut store = Store::new(&self.engine, state);

        let mut linker = Linker::new(&self.engine);
        register_imports(&mut linker)?;
        let instance = linker
            .instantiate(&mut store, &self.module)
            .map_err(|e| BridgeError::wasm("instantiate", e))?;
        let exports = VmExports::resolve(&mut store, &instance)?;

        if let Err(err) = initialize(&mut store, &exports, &config) {
            store.data_mut().terminate(err.clone());
            tracing::error!(%session, error = %err, "VM initialization failed");
            return Err(err);
        }

        tracing::info!(%session, "VM instance started");
        tokio::spawn(Session::new(store, exports, events_rx).run());
        Ok(Controller::new(session, events_tx, status_rx))
    }
}

/// Copy the startup parameters into VM memory and call `init`.
fn initialize(
    store: &mut Store<HostState>,
    exports: &VmExports,
    config: &ClientConfig,
) -> Result<()> {
    let chain_spec = config
        .chain_spec
        .as_deref()
        .ok_or_else(|| BridgeError::Config("config must include a string chain_spec".into()))?;

    if let Some(relay_chain_spec) = &config.relay_chain_spec {
        tracing::debug!(
            len = relay_chain_spec.len(),
            "relay chain spec provided; init takes no relay chain parameter"
        );
    }

    let (chain_spec_ptr, chain_spec_len) =
        memory::alloc_and_write(store, &exports.memory, &exports.alloc, chain_spec.as_bytes())?;
    // Empty content is passed as (0, 0) without allocating.
    let (database_ptr, database_len) = match config.database_content.as_deref() {
        Some(content) if !content.is_empty() => {
            memory::alloc_and_write(store, &exports.memory, &exports.alloc, content.as_bytes())?
        }
        _ => (0, 0),
    };

    exports
        .init
        .call(
            &mut *store,
            (
                chain_spec_ptr,
                chain_spec_len,
                database_ptr,
                database_len,
                config.log_level(),
            ),
        )
        .map_err(vm_error)
}

/// Compile `bytecode` and start one instance of it.
pub async fn start(bytecode: &VmBytecode, config: ClientConfig) -> Result<Controller> {
    config.validate()?;
    VmLoader::new(bytecode)?.start(config).await
}
