use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use tracing::warn;
use vmhost::native::NativeEngine;
use vmhost::options::{self, Invocation};
use vmhost::{bootstrap, logging, usage, Engine};
use vmhost_contracts::ERROR_EXIT_CODE;

fn main() -> ExitCode {
    // The engine recurses deeply while compiling; run on a thread with a larger
    // stack so behavior is the same on every platform.
    let handle = std::thread::Builder::new()
        .name("vmhost-main".to_string())
        .stack_size(8 * 1024 * 1024)
        .spawn(run);

    match handle {
        Ok(handle) => match handle.join() {
            Ok(code) => code,
            Err(panic) => {
                if let Some(message) = panic.downcast_ref::<&str>() {
                    eprintln!("vmhost panicked: {message}");
                } else if let Some(message) = panic.downcast_ref::<String>() {
                    eprintln!("vmhost panicked: {message}");
                } else {
                    eprintln!("vmhost panicked");
                }
                ExitCode::from(ERROR_EXIT_CODE)
            }
        },
        Err(err) => {
            eprintln!("failed to spawn vmhost main thread: {err}");
            run()
        }
    }
}

fn run() -> ExitCode {
    match try_main() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::from(ERROR_EXIT_CODE)
        }
    }
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from((code & 0xff) as u8)
}

fn try_main() -> Result<ExitCode> {
    let argv: Vec<String> = std::env::args_os()
        .map(|a| a.to_string_lossy().into_owned())
        .collect();

    let invocation = match options::parse_args(&argv) {
        Ok(invocation) => invocation,
        Err(err) => {
            eprintln!("{err}");
            usage::print_usage(false, None);
            return Ok(ExitCode::from(ERROR_EXIT_CODE));
        }
    };

    match invocation {
        Invocation::Help { verbose } => {
            let engine = if verbose {
                NativeEngine::locate_and_load().ok()
            } else {
                None
            };
            usage::print_usage(verbose, engine.as_ref().map(|e| e as &dyn Engine));
            Ok(ExitCode::SUCCESS)
        }
        Invocation::Version => {
            let engine = NativeEngine::locate_and_load()?;
            usage::print_version(&engine);
            Ok(ExitCode::SUCCESS)
        }
        Invocation::PrintFlags { engine_flags } => {
            let engine = NativeEngine::locate_and_load()?;
            engine.set_flags(&engine_flags);
            Ok(ExitCode::SUCCESS)
        }
        Invocation::Run(config) => {
            logging::init_logging(config.trace_loading);
            for warning in &config.warnings {
                warn!("{warning}");
            }
            let engine = NativeEngine::locate_and_load()?;
            let summary = bootstrap::launch(&engine, Arc::new(*config));
            Ok(exit_code(summary.exit_code))
        }
    }
}
