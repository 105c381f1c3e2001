mod common;

use std::sync::Arc;

use common::{create_temp_dir, launch_config, rm_rf, write_script, ScriptedEngine};
use vmhost::bootstrap::{self, BootstrapOutcome};
use vmhost::context::{ContextHost, NOT_RUNNABLE_MESSAGE, PACKAGE_CONFLICT_MESSAGE};
use vmhost::engine::{ContextRequest, Embedder, Engine, EngineError, InitParams};
use vmhost::service::GET_IO_METHOD;

fn script_arg(path: &std::path::Path) -> String {
    path.to_string_lossy().into_owned()
}

#[test]
fn normal_run_prints_and_exits_with_global_code() {
    let dir = create_temp_dir("vmhost_lifecycle_normal");
    let script = write_script(&dir, "app.vm", "print hello\nprint world\nexit 3\n");
    let script = script_arg(&script);

    let engine = ScriptedEngine::new();
    let summary = bootstrap::launch(&engine, Arc::new(launch_config(&[&script])));

    assert_eq!(summary.outcome, BootstrapOutcome::Success);
    assert_eq!(summary.exit_code, 3);
    assert_eq!(summary.iterations, 1);
    assert_eq!(engine.output(), vec!["hello", "world"]);
    assert_eq!(engine.loaded_sources(), vec!["text"]);
    assert_eq!(engine.closed_spans(), vec![("LoadScript".to_string(), 1)]);
    assert_eq!(engine.live_contexts(), 0);
    assert_eq!(engine.call_count("stop_event_handler"), 1);
    assert_eq!(engine.call_count("cleanup"), 1);

    rm_rf(&dir);
}

#[test]
fn lifecycle_calls_follow_setup_order() {
    let dir = create_temp_dir("vmhost_lifecycle_order");
    let script = script_arg(&write_script(&dir, "app.vm", "print ok\n"));

    let engine = ScriptedEngine::new();
    bootstrap::launch(&engine, Arc::new(launch_config(&[&script])));

    let calls = engine.calls();
    let position = |name: &str| {
        calls
            .iter()
            .position(|c| c == name)
            .unwrap_or_else(|| panic!("{name} was never called: {calls:?}"))
    };
    assert!(position("set_flags") < position("start_event_handler"));
    assert!(position("start_event_handler") < position("initialize"));
    assert!(position("initialize") < position("create_context:main"));
    assert!(position("install_library_tag_handler") < position("prepare_for_script_loading"));
    assert!(position("prepare_for_script_loading") < position("setup_service_load_port"));
    assert!(position("setup_package_resolution") < position("install_environment_lookup"));
    assert!(position("install_environment_lookup") < position("load_script"));
    assert!(position("setup_io_library") < position("make_runnable"));
    assert!(position("make_runnable") < position("import_root_library"));
    assert!(position("start_main") < position("shutdown_context"));
    assert!(position("terminate_exit_code_handler") < position("cleanup"));
    // No context snapshot, no resolvers.
    assert_eq!(engine.call_count("install_native_resolvers"), 0);
    assert_eq!(engine.call_count("compile_all"), 0);

    rm_rf(&dir);
}

#[test]
fn restart_requests_rerun_the_main_context() {
    let dir = create_temp_dir("vmhost_lifecycle_restart");
    let script = script_arg(&write_script(&dir, "app.vm", "print once\n"));

    let engine = ScriptedEngine::new().with_restarts(2);
    let summary = bootstrap::launch(&engine, Arc::new(launch_config(&[&script])));

    assert_eq!(summary.outcome, BootstrapOutcome::Success);
    assert_eq!(summary.exit_code, 0);
    assert_eq!(summary.iterations, 3);
    assert_eq!(engine.output(), vec!["once"]);
    assert_eq!(engine.created_records().len(), 3);
    assert_eq!(engine.torn_down_records().len(), 3);
    assert_eq!(engine.call_count("initialize"), 1);
    assert_eq!(engine.call_count("cleanup"), 1);

    rm_rf(&dir);
}

#[test]
fn compilation_error_exits_254() {
    let dir = create_temp_dir("vmhost_lifecycle_compile");
    let script = script_arg(&write_script(&dir, "bad.vm", "print never\ncompile-error\n"));

    let engine = ScriptedEngine::new();
    let summary = bootstrap::launch(&engine, Arc::new(launch_config(&[&script])));

    let BootstrapOutcome::CompilationError(message) = &summary.outcome else {
        panic!("unexpected outcome {:?}", summary.outcome);
    };
    assert!(message.contains("unexpected token"), "{message}");
    assert_eq!(summary.exit_code, 254);
    assert!(engine.output().is_empty());
    assert_eq!(engine.call_count("make_runnable"), 0);
    assert_eq!(engine.call_count("start_main"), 0);
    assert_eq!(engine.created_records(), engine.torn_down_records());

    rm_rf(&dir);
}

#[test]
fn unrunnable_context_is_an_api_error() {
    let dir = create_temp_dir("vmhost_lifecycle_runnable");
    let script = script_arg(&write_script(&dir, "app.vm", "print never\n"));

    let engine = ScriptedEngine::new().with_unrunnable_contexts();
    let summary = bootstrap::launch(&engine, Arc::new(launch_config(&[&script])));

    assert_eq!(
        summary.outcome,
        BootstrapOutcome::ApiError(NOT_RUNNABLE_MESSAGE.to_string())
    );
    assert_eq!(summary.exit_code, 253);
    assert_eq!(engine.call_count("start_main"), 0);
    assert_eq!(engine.torn_down_records().len(), 1);

    rm_rf(&dir);
}

#[test]
fn uncaught_exception_exits_255() {
    let dir = create_temp_dir("vmhost_lifecycle_throw");
    let program = "print before\nthrow oops\nprint after\n";
    let script = script_arg(&write_script(&dir, "app.vm", program));

    let engine = ScriptedEngine::new();
    let summary = bootstrap::launch(&engine, Arc::new(launch_config(&[&script])));

    assert_eq!(
        summary.outcome,
        BootstrapOutcome::RuntimeError("Unhandled exception: oops".to_string())
    );
    assert_eq!(summary.exit_code, 255);
    assert_eq!(engine.output(), vec!["before"]);

    rm_rf(&dir);
}

#[test]
fn missing_script_reaches_the_engine_as_a_uri() {
    let dir = create_temp_dir("vmhost_lifecycle_missing");
    let script = script_arg(&dir.join("absent.vm"));

    let engine = ScriptedEngine::new();
    let summary = bootstrap::launch(&engine, Arc::new(launch_config(&[&script])));

    let BootstrapOutcome::RuntimeError(message) = &summary.outcome else {
        panic!("unexpected outcome {:?}", summary.outcome);
    };
    assert!(message.contains("absent.vm"), "{message}");
    assert_eq!(summary.exit_code, 255);
    assert_eq!(engine.live_contexts(), 0);

    rm_rf(&dir);
}

#[test]
fn failed_context_creation_releases_the_record() {
    let dir = create_temp_dir("vmhost_lifecycle_create");
    let script = script_arg(&write_script(&dir, "app.vm", "print never\n"));
    let config = Arc::new(launch_config(&[&script]));

    let engine = ScriptedEngine::new().failing(
        "create_context:main",
        EngineError::runtime("out of memory"),
    );
    let host = Arc::new(ContextHost::new(Arc::clone(&config), None));
    let outcome = bootstrap::run_main_context(&engine, &host, &config);

    assert_eq!(
        outcome,
        BootstrapOutcome::RuntimeError("out of memory".to_string())
    );
    assert!(host.registry().is_empty());
    assert!(engine.torn_down_records().is_empty());

    rm_rf(&dir);
}

#[test]
fn registry_is_empty_after_each_iteration() {
    let dir = create_temp_dir("vmhost_lifecycle_registry");
    let script = script_arg(&write_script(&dir, "app.vm", "print ok\n"));
    let config = Arc::new(launch_config(&[&script]));

    let engine = ScriptedEngine::new();
    let host = Arc::new(ContextHost::new(Arc::clone(&config), None));
    let cwd = std::env::current_dir().expect("cwd");
    let params = InitParams {
        vm_snapshot: None,
        instructions: None,
        data: None,
        executable: &config.executable,
        executable_args: &config.executable_args,
        working_directory: &cwd,
    };
    engine.initialize(params, host.clone()).expect("initialize");

    for _ in 0..2 {
        let outcome = bootstrap::run_main_context(&engine, &host, &config);
        assert_eq!(outcome, BootstrapOutcome::Success);
        assert!(host.registry().is_empty());
    }
    assert_eq!(engine.output(), vec!["ok", "ok"]);
    engine.cleanup().expect("cleanup");

    rm_rf(&dir);
}

#[test]
fn environment_defines_are_visible_to_the_program() {
    let dir = create_temp_dir("vmhost_lifecycle_env");
    let script = script_arg(&write_script(
        &dir,
        "app.vm",
        "print env:GREETING\nprint env:EMPTY\nprint env:MISSING\n",
    ));

    let engine = ScriptedEngine::new();
    let config = launch_config(&["-DGREETING=hello", "-DEMPTY=", &script]);
    let summary = bootstrap::launch(&engine, Arc::new(config));

    assert_eq!(summary.exit_code, 0);
    assert_eq!(engine.output(), vec!["hello", "", "<absent>"]);

    rm_rf(&dir);
}

#[test]
fn service_context_is_configured_and_torn_down() {
    let dir = create_temp_dir("vmhost_lifecycle_service");
    let script = script_arg(&write_script(&dir, "app.vm", "print ok\n"));

    let engine = ScriptedEngine::new().with_service_context();
    let config = launch_config(&["--enable-vm-service:0", "--compile_all", &script]);
    let summary = bootstrap::launch(&engine, Arc::new(config));

    assert_eq!(summary.exit_code, 0);
    assert_eq!(engine.call_count("setup_service"), 1);
    // Once for the service context and once for the main context.
    assert_eq!(engine.call_count("compile_all"), 2);
    // The service context is never made runnable by the host.
    assert_eq!(engine.call_count("make_runnable"), 1);
    let mut created = engine.created_records();
    let mut torn_down = engine.torn_down_records();
    created.sort();
    torn_down.sort();
    assert_eq!(created.len(), 2);
    assert_eq!(created, torn_down);

    rm_rf(&dir);
}

#[test]
fn service_setup_failure_aborts_initialization() {
    let dir = create_temp_dir("vmhost_lifecycle_service_fail");
    let script = script_arg(&write_script(&dir, "app.vm", "print never\n"));

    let engine = ScriptedEngine::new()
        .with_service_context()
        .failing("setup_service", EngineError::runtime("address in use"));
    let summary = bootstrap::launch(&engine, Arc::new(launch_config(&[&script])));

    assert_eq!(summary.exit_code, 255);
    assert_eq!(summary.iterations, 0);
    let BootstrapOutcome::RuntimeError(message) = &summary.outcome else {
        panic!("unexpected outcome {:?}", summary.outcome);
    };
    assert!(message.contains("address in use"), "{message}");
    assert_eq!(engine.torn_down_records().len(), 1);
    assert!(engine.output().is_empty());

    rm_rf(&dir);
}

#[test]
fn embedder_rejects_conflicting_package_options() {
    let config = Arc::new(launch_config(&["app.vm"]));
    let host = ContextHost::new(config, None);
    let engine = ScriptedEngine::new();
    let request = ContextRequest {
        uri: "worker.vm",
        entry: "main",
        package_root: Some("/pkgs"),
        package_config: Some("/pkgs/.packages"),
    };

    let err = host.create_context(&engine, &request).expect_err("conflict");
    assert_eq!(err, PACKAGE_CONFLICT_MESSAGE);
    assert!(host.registry().is_empty());
    assert!(engine.calls().is_empty());
}

#[test]
fn get_io_requests_go_through_the_engine() {
    let config = Arc::new(launch_config(&["app.vm"]));
    let host = ContextHost::new(config, None);

    let engine = ScriptedEngine::new();
    let reply = host
        .service_request(&engine, GET_IO_METHOD, &[("isolateId", "1")])
        .expect("getIO handled");
    let v: serde_json::Value = serde_json::from_str(&reply).expect("json");
    assert_eq!(v["type"], "IO");
    assert_eq!(v["isolateId"], "1");

    assert!(host.service_request(&engine, "getVersion", &[]).is_none());

    let failing = ScriptedEngine::new().failing(
        "invoke_io_service_handler",
        EngineError::runtime("no handler"),
    );
    let reply = host
        .service_request(&failing, GET_IO_METHOD, &[])
        .expect("getIO handled");
    let v: serde_json::Value = serde_json::from_str(&reply).expect("json");
    assert_eq!(v["type"], "Error");
    assert_eq!(v["text"], "Internal error no handler");
}

#[test]
fn stream_capture_is_forwarded_to_the_engine() {
    let host = ContextHost::new(Arc::new(launch_config(&["app.vm"])), None);
    let engine = ScriptedEngine::new();
    assert!(host.stream_listen(&engine, "Stdout"));
    assert!(host.stream_listen(&engine, "Stderr"));
    host.stream_cancel(&engine, "Stdout");
    assert!(!host.stream_listen(&engine, "Nope"));
    host.stream_cancel(&engine, "Nope");
    assert_eq!(
        engine.calls(),
        vec![
            "set_stream_capture:Stdout:true",
            "set_stream_capture:Stderr:true",
            "set_stream_capture:Stdout:false",
        ]
    );

    let mut buf = [0u8; 32];
    assert!(host.fill_entropy(&mut buf));
}

#[test]
fn no_shutdown_keeps_the_event_handler_running() {
    let dir = create_temp_dir("vmhost_lifecycle_noshutdown");
    let script = script_arg(&write_script(&dir, "app.vm", "print ok\n"));

    let engine = ScriptedEngine::new();
    let summary = bootstrap::launch(
        &engine,
        Arc::new(launch_config(&["--shutdown=false", &script])),
    );

    assert_eq!(summary.exit_code, 0);
    assert_eq!(engine.call_count("stop_event_handler"), 0);
    assert!(engine.flags().iter().any(|f| f == "--no-shutdown"));

    rm_rf(&dir);
}
