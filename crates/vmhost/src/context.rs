//! Execution-context lifecycle: creation, configuration, hand-off to the engine's
//! message dispatch, and the records the host keeps for every live context.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, error};
use vmhost_contracts::SERVICE_CONTEXT_NAME;

use crate::assets;
use crate::engine::{
    context_name, ContextHandle, ContextRequest, ContextSpec, Embedder, Engine, EngineError,
    EngineResult, LibraryHandle, RecordId,
};
use crate::host_io;
use crate::options::{LaunchConfig, PackageResolution};
use crate::service;
use crate::snapshot;

const MAIN_ENTRY: &str = "main";
const LOAD_SCRIPT_SPAN: &str = "LoadScript";

pub const PACKAGE_CONFLICT_MESSAGE: &str =
    "Invalid arguments - Cannot simultaneously specify package root and package map.";
pub const NOT_RUNNABLE_MESSAGE: &str = "Invalid context state - Unable to make it runnable";

/// Host-side state of one engine context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionContextRecord {
    pub script_uri: String,
    pub packages: PackageResolution,
    pub builtin_library: Option<LibraryHandle>,
    /// Timing span opened while the script loads.
    pub load_async_id: Option<i64>,
}

impl ExecutionContextRecord {
    pub fn new(script_uri: &str, packages: PackageResolution) -> Self {
        ExecutionContextRecord {
            script_uri: script_uri.to_string(),
            packages,
            builtin_library: None,
            load_async_id: None,
        }
    }
}

/// Side table of [`ExecutionContextRecord`]s keyed by [`RecordId`].
///
/// A record is inserted right before its context is created and removed only by the
/// engine's teardown callback, or directly when the engine refuses to create the
/// context at all.
#[derive(Debug)]
pub struct ContextRegistry {
    next_id: AtomicU64,
    records: Mutex<HashMap<RecordId, ExecutionContextRecord>>,
}

impl Default for ContextRegistry {
    fn default() -> Self {
        ContextRegistry {
            next_id: AtomicU64::new(1),
            records: Mutex::new(HashMap::new()),
        }
    }
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> std::sync::MutexGuard<'_, HashMap<RecordId, ExecutionContextRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, record: ExecutionContextRecord) -> RecordId {
        let id = RecordId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.records().insert(id, record);
        id
    }

    pub fn with_record<R>(
        &self,
        id: RecordId,
        f: impl FnOnce(&mut ExecutionContextRecord) -> R,
    ) -> Option<R> {
        self.records().get_mut(&id).map(f)
    }

    pub fn get(&self, id: RecordId) -> Option<ExecutionContextRecord> {
        self.records().get(&id).cloned()
    }

    pub fn remove(&self, id: RecordId) -> Option<ExecutionContextRecord> {
        self.records().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A context created and configured by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreatedContext {
    pub handle: ContextHandle,
    pub record: RecordId,
}

/// The host half of the embedding: creates and configures contexts and answers the
/// engine's callbacks.
pub struct ContextHost {
    config: Arc<LaunchConfig>,
    context_snapshot: Option<Vec<u8>>,
    registry: ContextRegistry,
}

impl ContextHost {
    pub fn new(config: Arc<LaunchConfig>, context_snapshot: Option<Vec<u8>>) -> Self {
        ContextHost {
            config,
            context_snapshot,
            registry: ContextRegistry::new(),
        }
    }

    pub fn config(&self) -> &LaunchConfig {
        &self.config
    }

    pub fn registry(&self) -> &ContextRegistry {
        &self.registry
    }

    pub fn builtin_library(&self, record: RecordId) -> Option<LibraryHandle> {
        self.registry.with_record(record, |r| r.builtin_library).flatten()
    }

    /// Creates the main context from the launch configuration. On success the
    /// context is runnable and not entered.
    pub fn create_main_context(&self, engine: &dyn Engine) -> EngineResult<CreatedContext> {
        let config = Arc::clone(&self.config);
        self.create_and_setup(engine, &config.script, MAIN_ENTRY, &config.packages)?
            .ok_or_else(|| EngineError::runtime("main context creation was declined"))
    }

    fn create_and_setup(
        &self,
        engine: &dyn Engine,
        uri: &str,
        entry: &str,
        packages: &PackageResolution,
    ) -> EngineResult<Option<CreatedContext>> {
        if self.config.mode.runs_full_snapshot() && uri == SERVICE_CONTEXT_NAME {
            debug!("not creating the service context while running a full snapshot");
            return Ok(None);
        }

        let name = context_name(uri, entry);
        let record = self
            .registry
            .insert(ExecutionContextRecord::new(uri, packages.clone()));
        let spec = ContextSpec {
            uri,
            entry,
            snapshot: self.context_snapshot.as_deref(),
            record,
        };
        let handle = match engine.create_context(spec) {
            Ok(handle) => handle,
            Err(message) => {
                // The engine never saw the record, so no teardown will come for it.
                self.registry.remove(record);
                debug!(context = %name, "context creation failed");
                return Err(EngineError::runtime(message));
            }
        };
        debug!(context = %name, "context created");

        engine.enter_scope();
        let service = engine.is_service_context(handle);
        if let Err(err) = self.configure(engine, record, service, uri, packages) {
            // Leave nothing half-configured behind.
            engine.exit_scope();
            engine.shutdown_context();
            debug!(context = %name, kind = %err.kind, "context shut down during setup");
            return Err(err);
        }
        engine.exit_scope();
        engine.exit_context();

        if service {
            debug!(context = %name, "service context configured");
            return Ok(Some(CreatedContext { handle, record }));
        }

        if !engine.make_runnable(handle) {
            engine.enter_context(handle);
            engine.shutdown_context();
            return Err(EngineError::api(NOT_RUNNABLE_MESSAGE));
        }
        debug!(context = %name, "context runnable");
        Ok(Some(CreatedContext { handle, record }))
    }

    fn configure(
        &self,
        engine: &dyn Engine,
        record: RecordId,
        service: bool,
        uri: &str,
        packages: &PackageResolution,
    ) -> EngineResult<()> {
        let config = &self.config;

        if self.context_snapshot.is_some() {
            engine.install_native_resolvers()?;
        }
        engine.install_library_tag_handler()?;

        if service {
            engine
                .setup_service(
                    config.service.as_ref(),
                    config.mode.runs_precompiled_snapshot(),
                )
                .map_err(EngineError::runtime)?;
            if config.compile_all {
                engine.compile_all()?;
            }
            return Ok(());
        }

        let builtin = engine.prepare_for_script_loading(config.trace_loading)?;
        self.registry
            .with_record(record, |r| r.builtin_library = Some(builtin));

        if !config.mode.runs_full_snapshot() {
            engine.setup_service_load_port()?;
        }
        engine.setup_package_resolution(packages)?;
        engine.install_environment_lookup()?;

        if !config.mode.resumes_from_snapshot() {
            let source = snapshot::load_script_source(uri).map_err(|err| {
                EngineError::runtime(format!("Unable to read script '{uri}': {err}"))
            })?;
            if config.trace_loading {
                debug!(script = uri, source = source.as_str(), "loading script");
            }
            let async_id = engine.load_script(uri, &source)?;
            self.registry.with_record(record, |r| r.load_async_id = async_id);

            engine.run_loop()?;

            if let Some(id) = self.registry.with_record(record, |r| r.load_async_id).flatten() {
                engine.timeline_async_end(LOAD_SCRIPT_SPAN, id);
            }
            engine.setup_io_library(uri)?;
        } else if config.mode.runs_full_snapshot() {
            engine.setup_io_library(uri)?;
        }
        Ok(())
    }
}

impl Embedder for ContextHost {
    fn create_context(
        &self,
        engine: &dyn Engine,
        request: &ContextRequest<'_>,
    ) -> Result<Option<ContextHandle>, String> {
        let packages = match (request.package_root, request.package_config) {
            (Some(_), Some(_)) => return Err(PACKAGE_CONFLICT_MESSAGE.to_string()),
            (Some(root), None) => PackageResolution::Root(root.to_string()),
            (None, Some(map)) => PackageResolution::Map(map.to_string()),
            (None, None) => PackageResolution::None,
        };
        self.create_and_setup(engine, request.uri, request.entry, &packages)
            .map(|created| created.map(|c| c.handle))
            .map_err(|err| err.message)
    }

    fn context_teardown(&self, record: RecordId) {
        match self.registry.remove(record) {
            Some(removed) => {
                debug!(script = %removed.script_uri, "context record released");
            }
            None => {
                error!(?record, "teardown for an unknown execution context record");
                std::process::abort();
            }
        }
    }

    fn environment_lookup(&self, name: &[u8]) -> Result<Option<&str>, String> {
        self.config
            .environment
            .lookup_utf8(name)
            .map_err(|err| err.to_string())
    }

    fn service_assets(&self) -> Result<Vec<u8>, String> {
        assets::service_assets().map_err(|err| err.to_string())
    }

    fn fill_entropy(&self, buf: &mut [u8]) -> bool {
        host_io::fill_entropy(buf)
    }

    fn service_request(
        &self,
        engine: &dyn Engine,
        method: &str,
        params: &[(&str, &str)],
    ) -> Option<String> {
        service::handle_request(engine, method, params)
    }

    fn stream_listen(&self, engine: &dyn Engine, stream_id: &str) -> bool {
        service::set_stream_capture(engine, stream_id, true)
    }

    fn stream_cancel(&self, engine: &dyn Engine, stream_id: &str) {
        service::set_stream_capture(engine, stream_id, false);
    }
}
