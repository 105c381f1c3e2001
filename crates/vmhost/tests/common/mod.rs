#![allow(dead_code)]

//! A scripted in-process engine.
//!
//! Programs are plain text, one statement per line:
//!
//! - `print <text>` appends `<text>` to the program output,
//! - `print env:<name>` appends the `-D` value of `<name>` (or `<absent>`),
//! - `exit <n>` sets the global exit code,
//! - `throw <text>` makes the main run loop fail with a runtime error,
//! - `compile-error` makes loading fail with a compilation error,
//! - `deferred-compile-error` fails the main run loop with a compilation error.
//!
//! Snapshots are deterministic: every context snapshot is the program text itself.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use vmhost::engine::{
    ContextHandle, ContextRequest, ContextSpec, Embedder, Engine, EngineError, EngineResult,
    EntryPoint, InitParams, LibraryHandle, RecordId,
};
use vmhost::options::{PackageResolution, ServiceBind};
use vmhost::service::CapturedStream;
use vmhost::snapshot::{
    FullSnapshot, PrecompiledSnapshot, ScriptSource, SnapshotBlob, SnapshotKind,
};
use vmhost::{parse_args, Invocation, LaunchConfig};
use vmhost_contracts::SERVICE_CONTEXT_NAME;

pub const VM_GLOBALS: &[u8] = b"scripted-vm-globals";
const BUILTIN_LIBRARY: LibraryHandle = LibraryHandle(7);

pub fn create_temp_dir(prefix: &str) -> PathBuf {
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let base = std::env::temp_dir();
    let pid = std::process::id();
    for _ in 0..10_000 {
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = base.join(format!("{prefix}_{pid}_{n}"));
        if std::fs::create_dir(&path).is_ok() {
            return path;
        }
    }
    panic!("failed to create temp dir under {}", base.display());
}

pub fn rm_rf(path: &Path) {
    let _ = std::fs::remove_dir_all(path);
}

pub fn write_script(dir: &Path, name: &str, program: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, program).expect("write script");
    path
}

pub fn launch_config(args: &[&str]) -> LaunchConfig {
    let mut argv = vec!["vmhost"];
    argv.extend_from_slice(args);
    match parse_args(&argv).expect("parse args") {
        Invocation::Run(config) => *config,
        other => panic!("expected a run invocation, got {other:?}"),
    }
}

#[derive(Debug, Clone)]
struct ScriptedContext {
    record: RecordId,
    uri: String,
    service: bool,
    program: Option<String>,
}

#[derive(Default)]
struct State {
    calls: Vec<String>,
    flags: Vec<String>,
    output: Vec<String>,
    contexts: BTreeMap<u64, ScriptedContext>,
    current: Option<u64>,
    next_context: u64,
    next_async_id: i64,
    main_started: bool,
    restarts_remaining: u32,
    failures: HashMap<String, EngineError>,
    make_runnable_fails: bool,
    request_service_context: bool,
    init_vm_snapshot: Option<Vec<u8>>,
    loaded_sources: Vec<&'static str>,
    created_records: Vec<RecordId>,
    torn_down_records: Vec<RecordId>,
    global_exit_code: i32,
    closed_spans: Vec<(String, i64)>,
}

#[derive(Default)]
pub struct ScriptedEngine {
    state: RefCell<State>,
    embedder: RefCell<Option<Arc<dyn Embedder>>>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// The main run loop asks for a restart `n` times before it may succeed.
    pub fn with_restarts(self, n: u32) -> Self {
        self.state.borrow_mut().restarts_remaining = n;
        self
    }

    /// Every call to `method` fails with `err`.
    pub fn failing(self, method: &str, err: EngineError) -> Self {
        self.state
            .borrow_mut()
            .failures
            .insert(method.to_string(), err);
        self
    }

    pub fn with_unrunnable_contexts(self) -> Self {
        self.state.borrow_mut().make_runnable_fails = true;
        self
    }

    /// Ask the host for the service context while initializing.
    pub fn with_service_context(self) -> Self {
        self.state.borrow_mut().request_service_context = true;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.borrow().calls.clone()
    }

    pub fn call_count(&self, name: &str) -> usize {
        self.state
            .borrow()
            .calls
            .iter()
            .filter(|c| c.as_str() == name)
            .count()
    }

    pub fn flags(&self) -> Vec<String> {
        self.state.borrow().flags.clone()
    }

    pub fn output(&self) -> Vec<String> {
        self.state.borrow().output.clone()
    }

    pub fn init_vm_snapshot(&self) -> Option<Vec<u8>> {
        self.state.borrow().init_vm_snapshot.clone()
    }

    pub fn loaded_sources(&self) -> Vec<&'static str> {
        self.state.borrow().loaded_sources.clone()
    }

    pub fn live_contexts(&self) -> usize {
        self.state.borrow().contexts.len()
    }

    pub fn created_records(&self) -> Vec<RecordId> {
        self.state.borrow().created_records.clone()
    }

    pub fn torn_down_records(&self) -> Vec<RecordId> {
        self.state.borrow().torn_down_records.clone()
    }

    pub fn closed_spans(&self) -> Vec<(String, i64)> {
        self.state.borrow().closed_spans.clone()
    }

    fn log(&self, call: &str) {
        self.state.borrow_mut().calls.push(call.to_string());
    }

    fn check(&self, call: &str) -> EngineResult<()> {
        self.log(call);
        match self.state.borrow().failures.get(call) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn embedder(&self) -> Arc<dyn Embedder> {
        self.embedder
            .borrow()
            .clone()
            .expect("engine initialized with an embedder")
    }

    fn current_program(&self) -> String {
        let state = self.state.borrow();
        state
            .current
            .and_then(|id| state.contexts.get(&id))
            .and_then(|c| c.program.clone())
            .unwrap_or_default()
    }

    fn set_current_program(&self, program: String) {
        let mut state = self.state.borrow_mut();
        if let Some(id) = state.current {
            if let Some(ctx) = state.contexts.get_mut(&id) {
                ctx.program = Some(program);
            }
        }
    }

    fn teardown(&self, id: u64) {
        let removed = self.state.borrow_mut().contexts.remove(&id);
        if let Some(ctx) = removed {
            self.state.borrow_mut().torn_down_records.push(ctx.record);
            self.embedder().context_teardown(ctx.record);
        }
    }

    fn execute(&self, program: &str) -> EngineResult<()> {
        for line in program.lines() {
            let line = line.trim();
            if let Some(text) = line.strip_prefix("print ") {
                let text = match text.strip_prefix("env:") {
                    Some(name) => self
                        .embedder()
                        .environment_lookup(name.as_bytes())
                        .map_err(EngineError::api)?
                        .unwrap_or("<absent>")
                        .to_string(),
                    None => text.to_string(),
                };
                self.state.borrow_mut().output.push(text);
            } else if let Some(code) = line.strip_prefix("exit ") {
                self.state.borrow_mut().global_exit_code = code.parse().unwrap_or(255);
            } else if line == "deferred-compile-error" {
                return Err(EngineError::compilation("deferred library failed to compile"));
            } else if let Some(message) = line.strip_prefix("throw ") {
                return Err(EngineError::runtime(format!("Unhandled exception: {message}")));
            }
        }
        Ok(())
    }
}

impl Engine for ScriptedEngine {
    fn version(&self) -> String {
        "scripted-1.0".to_string()
    }

    fn set_flags(&self, flags: &[String]) {
        self.log("set_flags");
        self.state.borrow_mut().flags = flags.to_vec();
    }

    fn start_event_handler(&self) {
        self.log("start_event_handler");
    }

    fn stop_event_handler(&self) {
        self.log("stop_event_handler");
    }

    fn initialize(
        &self,
        params: InitParams<'_>,
        embedder: Arc<dyn Embedder>,
    ) -> Result<(), String> {
        self.check("initialize").map_err(|e| e.message)?;
        self.state.borrow_mut().init_vm_snapshot = params.vm_snapshot.map(<[u8]>::to_vec);
        *self.embedder.borrow_mut() = Some(Arc::clone(&embedder));

        if self.state.borrow().request_service_context {
            let request = ContextRequest {
                uri: SERVICE_CONTEXT_NAME,
                entry: "main",
                package_root: None,
                package_config: None,
            };
            embedder.create_context(self, &request)?;
        }
        Ok(())
    }

    fn cleanup(&self) -> Result<(), String> {
        self.log("cleanup");
        let remaining: Vec<u64> = self.state.borrow().contexts.keys().copied().collect();
        for id in remaining {
            self.teardown(id);
        }
        self.embedder.borrow_mut().take();
        Ok(())
    }

    fn terminate_exit_code_handler(&self) {
        self.log("terminate_exit_code_handler");
    }

    fn global_exit_code(&self) -> i32 {
        self.state.borrow().global_exit_code
    }

    fn create_context(&self, spec: ContextSpec<'_>) -> Result<ContextHandle, String> {
        self.check(&format!("create_context:{}", spec.entry))
            .map_err(|e| e.message)?;
        let program = match spec.snapshot {
            Some(bytes) => Some(String::from_utf8(bytes.to_vec()).map_err(|e| e.to_string())?),
            None => None,
        };
        let mut state = self.state.borrow_mut();
        state.next_context += 1;
        let id = state.next_context;
        state.contexts.insert(
            id,
            ScriptedContext {
                record: spec.record,
                uri: spec.uri.to_string(),
                service: spec.uri == SERVICE_CONTEXT_NAME,
                program,
            },
        );
        state.created_records.push(spec.record);
        state.current = Some(id);
        state.main_started = false;
        Ok(ContextHandle(id))
    }

    fn is_service_context(&self, context: ContextHandle) -> bool {
        self.state
            .borrow()
            .contexts
            .get(&context.0)
            .is_some_and(|c| c.service)
    }

    fn enter_context(&self, context: ContextHandle) {
        self.log("enter_context");
        self.state.borrow_mut().current = Some(context.0);
    }

    fn exit_context(&self) {
        self.log("exit_context");
        self.state.borrow_mut().current = None;
    }

    fn enter_scope(&self) {
        self.log("enter_scope");
    }

    fn exit_scope(&self) {
        self.log("exit_scope");
    }

    fn shutdown_context(&self) {
        self.log("shutdown_context");
        let current = self.state.borrow_mut().current.take();
        if let Some(id) = current {
            self.teardown(id);
        }
    }

    fn make_runnable(&self, _context: ContextHandle) -> bool {
        self.log("make_runnable");
        !self.state.borrow().make_runnable_fails
    }

    fn install_native_resolvers(&self) -> EngineResult<()> {
        self.check("install_native_resolvers")
    }

    fn install_library_tag_handler(&self) -> EngineResult<()> {
        self.check("install_library_tag_handler")
    }

    fn install_environment_lookup(&self) -> EngineResult<()> {
        self.check("install_environment_lookup")
    }

    fn setup_service(
        &self,
        _bind: Option<&ServiceBind>,
        _running_precompiled: bool,
    ) -> Result<(), String> {
        self.check("setup_service").map_err(|e| e.message)
    }

    fn prepare_for_script_loading(&self, _trace_loading: bool) -> EngineResult<LibraryHandle> {
        self.check("prepare_for_script_loading")?;
        Ok(BUILTIN_LIBRARY)
    }

    fn setup_service_load_port(&self) -> EngineResult<()> {
        self.check("setup_service_load_port")
    }

    fn setup_package_resolution(&self, _packages: &PackageResolution) -> EngineResult<()> {
        self.check("setup_package_resolution")
    }

    fn load_script(&self, uri: &str, source: &ScriptSource) -> EngineResult<Option<i64>> {
        self.check("load_script")?;
        let program = match source {
            ScriptSource::Text(bytes) | ScriptSource::Snapshot(bytes) => {
                String::from_utf8_lossy(bytes).into_owned()
            }
            ScriptSource::Uri => {
                return Err(EngineError::runtime(format!("Unable to load '{uri}'")));
            }
        };
        self.state.borrow_mut().loaded_sources.push(source.as_str());
        if program.lines().any(|l| l.trim() == "compile-error") {
            return Err(EngineError::compilation(format!("'{uri}': error: unexpected token")));
        }
        self.set_current_program(program);
        let mut state = self.state.borrow_mut();
        state.next_async_id += 1;
        Ok(Some(state.next_async_id))
    }

    fn timeline_async_end(&self, label: &str, async_id: i64) {
        self.state
            .borrow_mut()
            .closed_spans
            .push((label.to_string(), async_id));
    }

    fn run_loop(&self) -> EngineResult<()> {
        self.check("run_loop")?;
        if !self.state.borrow().main_started {
            return Ok(());
        }
        {
            let mut state = self.state.borrow_mut();
            if state.restarts_remaining > 0 {
                state.restarts_remaining -= 1;
                return Err(EngineError::restart());
            }
        }
        let program = self.current_program();
        self.execute(&program)
    }

    fn setup_io_library(&self, _uri: &str) -> EngineResult<()> {
        self.check("setup_io_library")
    }

    fn builtin_library(&self) -> EngineResult<LibraryHandle> {
        self.check("builtin_library")?;
        Ok(BUILTIN_LIBRARY)
    }

    fn has_root_library(&self) -> bool {
        let state = self.state.borrow();
        state
            .current
            .and_then(|id| state.contexts.get(&id))
            .is_some_and(|c| c.program.is_some())
    }

    fn import_root_library(&self, builtin: LibraryHandle) -> EngineResult<()> {
        self.check("import_root_library")?;
        assert_eq!(builtin, BUILTIN_LIBRARY);
        Ok(())
    }

    fn load_service_for_precompilation(&self) -> Result<(), String> {
        self.check("load_service_for_precompilation")
            .map_err(|e| e.message)
    }

    fn compile_all(&self) -> EngineResult<()> {
        self.check("compile_all")
    }

    fn precompile(&self, entry_points: &[EntryPoint], reset_fields: bool) -> EngineResult<()> {
        self.check("precompile")?;
        assert!(reset_fields);
        assert!(!entry_points.is_empty());
        Ok(())
    }

    fn start_main(&self, builtin: LibraryHandle, _args: &[String]) -> EngineResult<()> {
        self.check("start_main")?;
        assert_eq!(builtin, BUILTIN_LIBRARY);
        self.state.borrow_mut().main_started = true;
        Ok(())
    }

    fn invoke_io_service_handler(&self, keys: &[&str], values: &[&str]) -> EngineResult<String> {
        self.check("invoke_io_service_handler")?;
        let pairs: Vec<String> = keys
            .iter()
            .zip(values)
            .map(|(k, v)| format!("\"{k}\":\"{v}\""))
            .collect();
        Ok(format!("{{\"type\":\"IO\",{}}}", pairs.join(",")))
    }

    fn set_stream_capture(&self, stream: CapturedStream, enabled: bool) {
        self.log(&format!("set_stream_capture:{}:{enabled}", stream.id()));
    }

    fn create_script_snapshot(&self) -> EngineResult<SnapshotBlob> {
        self.check("create_script_snapshot")?;
        Ok(SnapshotBlob::new(
            SnapshotKind::ContextHeap,
            self.current_program().into_bytes(),
        ))
    }

    fn create_full_snapshot(&self) -> EngineResult<FullSnapshot> {
        self.check("create_full_snapshot")?;
        Ok(FullSnapshot {
            vm: SnapshotBlob::new(SnapshotKind::VmGlobals, VM_GLOBALS.to_vec()),
            context: SnapshotBlob::new(
                SnapshotKind::ContextHeap,
                self.current_program().into_bytes(),
            ),
        })
    }

    fn create_precompiled_snapshot(&self) -> EngineResult<PrecompiledSnapshot> {
        self.check("create_precompiled_snapshot")?;
        let program = self.current_program();
        Ok(PrecompiledSnapshot {
            vm: SnapshotBlob::new(SnapshotKind::VmGlobals, VM_GLOBALS.to_vec()),
            context: SnapshotBlob::new(SnapshotKind::ContextHeap, program.clone().into_bytes()),
            instructions: SnapshotBlob::new(
                SnapshotKind::CompiledInstructions,
                format!("\t.text\n# {}\n", program.replace('\n', " ; ")).into_bytes(),
            ),
        })
    }
}
