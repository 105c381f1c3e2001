//! The seam between the host and the managed-runtime engine.
//!
//! [`Engine`] is everything the host asks of the engine; [`Embedder`] is everything
//! the engine asks of the host. Both sides only exchange plain ids
//! ([`ContextHandle`], [`RecordId`], [`LibraryHandle`]): the engine never holds a
//! pointer into host memory, and per-context host state lives in a side table keyed
//! by [`RecordId`].

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;

use crate::options::{PackageResolution, ServiceBind};
use crate::service::CapturedStream;
use crate::snapshot::{FullSnapshot, PrecompiledSnapshot, ScriptSource, SnapshotBlob};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineErrorKind {
    Api,
    Compilation,
    RestartRequest,
    Runtime,
}

impl EngineErrorKind {
    /// Classifies an engine failure. A restart request is checked before anything
    /// else, then compilation errors, then API misuse.
    pub fn classify(is_restart: bool, is_compilation: bool, is_api: bool) -> Self {
        if is_restart {
            EngineErrorKind::RestartRequest
        } else if is_compilation {
            EngineErrorKind::Compilation
        } else if is_api {
            EngineErrorKind::Api
        } else {
            EngineErrorKind::Runtime
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EngineErrorKind::Api => "api",
            EngineErrorKind::Compilation => "compilation",
            EngineErrorKind::RestartRequest => "restart-request",
            EngineErrorKind::Runtime => "runtime",
        }
    }
}

impl fmt::Display for EngineErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct EngineError {
    pub kind: EngineErrorKind,
    pub message: String,
}

impl EngineError {
    pub fn new(kind: EngineErrorKind, message: impl Into<String>) -> Self {
        EngineError {
            kind,
            message: message.into(),
        }
    }

    pub fn api(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::Api, message)
    }

    pub fn compilation(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::Compilation, message)
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::Runtime, message)
    }

    pub fn restart() -> Self {
        Self::new(EngineErrorKind::RestartRequest, "restart requested")
    }

    pub fn is_restart(&self) -> bool {
        self.kind == EngineErrorKind::RestartRequest
    }

    pub fn is_compilation(&self) -> bool {
        self.kind == EngineErrorKind::Compilation
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Opaque id of an engine-managed execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextHandle(pub u64);

/// Opaque id of a library inside the current context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LibraryHandle(pub u64);

/// Key of an [`ExecutionContextRecord`](crate::context::ExecutionContextRecord) in
/// the host's side table. The engine hands it back when it tears the context down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId(pub u64);

/// Address of a symbol inside a loaded shared library.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolAddr(pub *const u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryPoint {
    pub library: &'static str,
    pub class: &'static str,
    pub function: &'static str,
}

pub struct InitParams<'a> {
    pub vm_snapshot: Option<&'a [u8]>,
    pub instructions: Option<SymbolAddr>,
    pub data: Option<SymbolAddr>,
    pub executable: &'a str,
    pub executable_args: &'a [String],
    pub working_directory: &'a Path,
}

pub struct ContextSpec<'a> {
    pub uri: &'a str,
    pub entry: &'a str,
    /// Context heap snapshot to resume from; `None` compiles from source.
    pub snapshot: Option<&'a [u8]>,
    pub record: RecordId,
}

/// A context creation request issued by the engine itself (for example for the
/// service context). Nothing guarantees the two package options are exclusive.
#[derive(Debug, Clone, Copy)]
pub struct ContextRequest<'a> {
    pub uri: &'a str,
    pub entry: &'a str,
    pub package_root: Option<&'a str>,
    pub package_config: Option<&'a str>,
}

/// Callbacks the engine invokes on the host.
pub trait Embedder {
    /// Creates and configures a context on behalf of the engine. `Ok(None)` declines
    /// the request without an error.
    fn create_context(
        &self,
        engine: &dyn Engine,
        request: &ContextRequest<'_>,
    ) -> Result<Option<ContextHandle>, String>;

    /// Invoked exactly once per context, when the engine destroys it.
    fn context_teardown(&self, record: RecordId);

    fn environment_lookup(&self, name: &[u8]) -> Result<Option<&str>, String>;

    fn service_assets(&self) -> Result<Vec<u8>, String>;

    fn fill_entropy(&self, buf: &mut [u8]) -> bool;

    fn service_request(
        &self,
        engine: &dyn Engine,
        method: &str,
        params: &[(&str, &str)],
    ) -> Option<String>;

    fn stream_listen(&self, engine: &dyn Engine, stream_id: &str) -> bool;

    fn stream_cancel(&self, engine: &dyn Engine, stream_id: &str);
}

/// Operations the host drives on the engine.
///
/// Calls that operate on "the current context" follow the engine's notion of the
/// context entered on the calling thread. `create_context` leaves the new context
/// entered.
pub trait Engine {
    fn version(&self) -> String;
    fn set_flags(&self, flags: &[String]);
    fn start_event_handler(&self);
    fn stop_event_handler(&self);
    fn initialize(&self, params: InitParams<'_>, embedder: Arc<dyn Embedder>)
        -> Result<(), String>;
    fn cleanup(&self) -> Result<(), String>;
    fn terminate_exit_code_handler(&self);
    fn global_exit_code(&self) -> i32;

    fn create_context(&self, spec: ContextSpec<'_>) -> Result<ContextHandle, String>;
    fn is_service_context(&self, context: ContextHandle) -> bool;
    fn enter_context(&self, context: ContextHandle);
    fn exit_context(&self);
    fn enter_scope(&self);
    fn exit_scope(&self);
    /// Shuts down the current context. The engine calls
    /// [`Embedder::context_teardown`] for it before returning.
    fn shutdown_context(&self);
    fn make_runnable(&self, context: ContextHandle) -> bool;

    fn install_native_resolvers(&self) -> EngineResult<()>;
    fn install_library_tag_handler(&self) -> EngineResult<()>;
    fn install_environment_lookup(&self) -> EngineResult<()>;
    fn setup_service(
        &self,
        bind: Option<&ServiceBind>,
        running_precompiled: bool,
    ) -> Result<(), String>;
    /// Prepares the builtin libraries and returns the builtin library handle.
    fn prepare_for_script_loading(&self, trace_loading: bool) -> EngineResult<LibraryHandle>;
    fn setup_service_load_port(&self) -> EngineResult<()>;
    fn setup_package_resolution(&self, packages: &PackageResolution) -> EngineResult<()>;
    /// Starts loading the root script. Returns the id of the timing span opened for
    /// the load, if any.
    fn load_script(&self, uri: &str, source: &ScriptSource) -> EngineResult<Option<i64>>;
    fn timeline_async_end(&self, label: &str, async_id: i64);
    /// Dispatches messages until the current context has no live ports.
    fn run_loop(&self) -> EngineResult<()>;
    fn setup_io_library(&self, uri: &str) -> EngineResult<()>;

    /// Looks up the builtin library of the current context.
    fn builtin_library(&self) -> EngineResult<LibraryHandle>;
    fn has_root_library(&self) -> bool;
    fn import_root_library(&self, builtin: LibraryHandle) -> EngineResult<()>;
    fn load_service_for_precompilation(&self) -> Result<(), String>;
    fn compile_all(&self) -> EngineResult<()>;
    fn precompile(&self, entry_points: &[EntryPoint], reset_fields: bool) -> EngineResult<()>;
    /// Looks up the main closure through `builtin` and posts the startup message.
    fn start_main(&self, builtin: LibraryHandle, args: &[String]) -> EngineResult<()>;
    fn invoke_io_service_handler(&self, keys: &[&str], values: &[&str]) -> EngineResult<String>;
    /// Makes the I/O library mirror writes on `stream` to the service.
    fn set_stream_capture(&self, stream: CapturedStream, enabled: bool);

    fn create_script_snapshot(&self) -> EngineResult<SnapshotBlob>;
    fn create_full_snapshot(&self) -> EngineResult<FullSnapshot>;
    fn create_precompiled_snapshot(&self) -> EngineResult<PrecompiledSnapshot>;
}

/// Diagnostic name of a context: the script's file name and its entry point.
pub fn context_name(script_uri: &str, entry: &str) -> String {
    let base = script_uri.rsplit('/').next().unwrap_or(script_uri);
    format!("{base}/{entry}")
}
