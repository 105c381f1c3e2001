//! Picks the run mode, drives the engine through it, and turns the terminal result
//! into a process exit code.

use std::sync::Arc;

use tracing::{debug, info};
use vmhost_contracts::{API_ERROR_EXIT_CODE, COMPILATION_ERROR_EXIT_CODE, ERROR_EXIT_CODE};

use crate::context::{ContextHost, CreatedContext};
use crate::engine::{Engine, EngineError, EngineErrorKind, EntryPoint, InitParams};
use crate::options::{LaunchConfig, RunMode};
use crate::snapshot::{self, LoadedSnapshots, SnapshotError};

pub const LOAD_DEFERRED_EAGERLY_FLAG: &str = "--load_deferred_eagerly";

const fn entry(library: &'static str, class: &'static str, function: &'static str) -> EntryPoint {
    EntryPoint {
        library,
        class,
        function,
    }
}

/// Entry points only reachable through native callbacks. The precompiler cannot
/// discover them on its own, so they are compiled explicitly.
pub const STANDALONE_ENTRY_POINTS: &[EntryPoint] = &[
    entry("vm:_builtin", "::", "_getMainClosure"),
    entry("vm:_builtin", "::", "_getPrintClosure"),
    entry("vm:_builtin", "::", "_getUriBaseClosure"),
    entry("vm:_builtin", "::", "_resolveUri"),
    entry("vm:_builtin", "::", "_setWorkingDirectory"),
    entry("vm:_builtin", "::", "_setPackageRoot"),
    entry("vm:_builtin", "::", "_loadPackagesMap"),
    entry("vm:_builtin", "::", "_loadDataAsync"),
    entry("vm:io", "::", "_makeUint8ListView"),
    entry("vm:io", "::", "_makeDatagram"),
    entry("vm:io", "::", "_setupHooks"),
    entry("vm:io", "::", "_getWatchSignalInternal"),
    entry("vm:io", "CertificateException", "CertificateException."),
    entry("vm:io", "Directory", "Directory."),
    entry("vm:io", "File", "File."),
    entry("vm:io", "FileSystemException", "FileSystemException."),
    entry("vm:io", "HandshakeException", "HandshakeException."),
    entry("vm:io", "Link", "Link."),
    entry("vm:io", "OSError", "OSError."),
    entry("vm:io", "TlsException", "TlsException."),
    entry("vm:io", "X509Certificate", "X509Certificate._"),
    entry("vm:io", "_ExternalBuffer", "set:data"),
    entry("vm:io", "_Platform", "set:_nativeScript"),
    entry("vm:io", "_ProcessStartStatus", "set:_errorCode"),
    entry("vm:io", "_ProcessStartStatus", "set:_errorMessage"),
    entry("vm:io", "_SecureFilterImpl", "get:ENCRYPTED_SIZE"),
    entry("vm:io", "_SecureFilterImpl", "get:SIZE"),
    entry("vm:vmservice_io", "::", "main"),
];

/// Terminal result of one bootstrap iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapOutcome {
    Success,
    CompilationError(String),
    ApiError(String),
    RestartRequested,
    RuntimeError(String),
}

impl From<EngineError> for BootstrapOutcome {
    fn from(err: EngineError) -> Self {
        match err.kind {
            EngineErrorKind::RestartRequest => BootstrapOutcome::RestartRequested,
            EngineErrorKind::Compilation => BootstrapOutcome::CompilationError(err.message),
            EngineErrorKind::Api => BootstrapOutcome::ApiError(err.message),
            EngineErrorKind::Runtime => BootstrapOutcome::RuntimeError(err.message),
        }
    }
}

impl From<SnapshotError> for BootstrapOutcome {
    fn from(err: SnapshotError) -> Self {
        BootstrapOutcome::RuntimeError(err.to_string())
    }
}

impl BootstrapOutcome {
    /// Exit code of a terminal outcome; `None` for a restart, which never leaves
    /// the driver.
    pub fn exit_code(&self, global_exit_code: i32) -> Option<i32> {
        match self {
            BootstrapOutcome::Success => Some(global_exit_code),
            BootstrapOutcome::CompilationError(_) => Some(COMPILATION_ERROR_EXIT_CODE.into()),
            BootstrapOutcome::ApiError(_) => Some(API_ERROR_EXIT_CODE.into()),
            BootstrapOutcome::RuntimeError(_) => Some(ERROR_EXIT_CODE.into()),
            BootstrapOutcome::RestartRequested => None,
        }
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            BootstrapOutcome::CompilationError(m)
            | BootstrapOutcome::ApiError(m)
            | BootstrapOutcome::RuntimeError(m) => Some(m),
            BootstrapOutcome::Success | BootstrapOutcome::RestartRequested => None,
        }
    }
}

/// What a launch did, for the binary and for tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSummary {
    pub exit_code: i32,
    /// Bootstrap iterations run, restarts included.
    pub iterations: u32,
    pub outcome: BootstrapOutcome,
}

/// Engine flags for a launch: the command line's, plus what the mode requires.
pub fn engine_flags_for(config: &LaunchConfig) -> Vec<String> {
    let mut flags = config.engine_flags.clone();
    if matches!(
        config.mode,
        RunMode::GenerateScriptSnapshot { .. }
            | RunMode::GenerateFullSnapshotAfterRun { .. }
            | RunMode::RunFullSnapshot { .. }
    ) {
        flags.push(LOAD_DEFERRED_EAGERLY_FLAG.to_string());
    }
    flags
}

fn read_mode_snapshots(mode: &RunMode) -> Result<LoadedSnapshots, SnapshotError> {
    match mode {
        RunMode::RunPrecompiledSnapshot { dir } => snapshot::load_precompiled_snapshot(dir),
        RunMode::RunFullSnapshot { base } => snapshot::read_full_snapshot(base),
        _ => Ok(LoadedSnapshots::default()),
    }
}

fn early_exit(engine: &dyn Engine, config: &LaunchConfig, message: &str) -> LaunchSummary {
    if config.vm_shutdown {
        engine.stop_event_handler();
    }
    eprintln!("{message}");
    LaunchSummary {
        exit_code: ERROR_EXIT_CODE.into(),
        iterations: 0,
        outcome: BootstrapOutcome::RuntimeError(message.to_string()),
    }
}

/// Runs the whole launch: engine setup, bootstrap iterations until one does not ask
/// for a restart, and engine teardown.
pub fn launch(engine: &dyn Engine, config: Arc<LaunchConfig>) -> LaunchSummary {
    engine.set_flags(&engine_flags_for(&config));

    let working_directory = match std::env::current_dir() {
        Ok(dir) => dir,
        Err(err) => {
            eprintln!("Error determining current directory: {err}");
            return LaunchSummary {
                exit_code: ERROR_EXIT_CODE.into(),
                iterations: 0,
                outcome: BootstrapOutcome::RuntimeError(err.to_string()),
            };
        }
    };

    engine.start_event_handler();

    // Snapshots go to the engine at initialization, so they are read first.
    let loaded = match read_mode_snapshots(&config.mode) {
        Ok(loaded) => loaded,
        Err(err) => return early_exit(engine, &config, &err.to_string()),
    };
    let LoadedSnapshots { vm, context, image } = loaded;

    let host = Arc::new(ContextHost::new(Arc::clone(&config), context));
    let params = InitParams {
        vm_snapshot: vm.as_deref(),
        instructions: image.as_ref().map(|i| i.instructions),
        data: image.as_ref().map(|i| i.data),
        executable: &config.executable,
        executable_args: &config.executable_args,
        working_directory: &working_directory,
    };
    if let Err(err) = engine.initialize(params, host.clone()) {
        return early_exit(engine, &config, &format!("VM initialization failed: {err}"));
    }
    debug!(mode = %config.mode, "engine initialized");

    let mut iterations: u32 = 0;
    let outcome = loop {
        iterations = iterations.saturating_add(1);
        match run_main_context(engine, &host, &config) {
            BootstrapOutcome::RestartRequested => info!("Restarting VM"),
            outcome => break outcome,
        }
    };
    if let Some(message) = outcome.message() {
        eprintln!("{message}");
    }

    engine.terminate_exit_code_handler();
    let global_exit_code = engine.global_exit_code();
    if let Err(err) = engine.cleanup() {
        eprintln!("VM cleanup failed: {err}");
    }
    if config.vm_shutdown {
        engine.stop_event_handler();
    }
    // The precompiled image backs engine memory until cleanup has run.
    drop(image);

    let exit_code = outcome
        .exit_code(global_exit_code)
        .unwrap_or(ERROR_EXIT_CODE.into());
    LaunchSummary {
        exit_code,
        iterations,
        outcome,
    }
}

/// One bootstrap iteration: a fresh main context, run according to the mode, then
/// shut down.
pub fn run_main_context(
    engine: &dyn Engine,
    host: &ContextHost,
    config: &LaunchConfig,
) -> BootstrapOutcome {
    let main = match host.create_main_context(engine) {
        Ok(main) => main,
        Err(err) => return err.into(),
    };

    engine.enter_context(main.handle);
    engine.enter_scope();
    let outcome = match drive_main(engine, host, config, main) {
        Ok(()) => BootstrapOutcome::Success,
        Err(outcome) => outcome,
    };
    engine.exit_scope();
    engine.shutdown_context();
    debug!(outcome = ?outcome, "main context shut down");
    outcome
}

fn drive_main(
    engine: &dyn Engine,
    host: &ContextHost,
    config: &LaunchConfig,
    main: CreatedContext,
) -> Result<(), BootstrapOutcome> {
    if let RunMode::GenerateScriptSnapshot { file } = &config.mode {
        let blob = engine.create_script_snapshot()?;
        snapshot::write_script_snapshot(file, &blob)?;
        return Ok(());
    }

    let builtin = match host.builtin_library(main.record) {
        Some(lib) => lib,
        None => engine.builtin_library()?,
    };
    engine.import_root_library(builtin)?;

    if config.mode.generates_precompiled_snapshot() {
        engine.load_service_for_precompilation().map_err(|err| {
            BootstrapOutcome::RuntimeError(format!("VM service loading failed: {err}"))
        })?;
    }

    if config.compile_all {
        engine.compile_all()?;
    }

    if let RunMode::GeneratePrecompiledSnapshot { dir } = &config.mode {
        engine.precompile(STANDALONE_ENTRY_POINTS, true)?;
        let snapshot = engine.create_precompiled_snapshot()?;
        snapshot::write_precompiled_snapshot(dir, &snapshot)?;
        return Ok(());
    }

    if !engine.has_root_library() {
        return Err(BootstrapOutcome::RuntimeError(format!(
            "Unable to find root library for '{}'",
            config.script
        )));
    }

    engine.start_main(builtin, &config.script_args)?;

    let result = engine.run_loop();
    if let RunMode::GenerateFullSnapshotAfterRun { base } = &config.mode {
        let skip = matches!(&result, Err(err) if err.is_compilation() || err.is_restart());
        if !skip {
            let snapshot = engine.create_full_snapshot()?;
            snapshot::write_full_snapshot(base, &snapshot)?;
        }
    }
    result?;
    Ok(())
}
