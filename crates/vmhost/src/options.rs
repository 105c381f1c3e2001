use std::fmt;
use std::net::Ipv4Addr;

use thiserror::Error;
use vmhost_contracts::{DEFAULT_SERVICE_IP, DEFAULT_SERVICE_PORT};

use crate::environment::EnvironmentTable;

/// Engine flag every launch starts with.
pub const BASE_ENGINE_FLAG: &str = "--no_write_protect_code";

const FLAG_PREFIX: &str = "--";
const PACKAGE_ROOT_SHORT: &str = "-p";
const CHECKED_SHORT: &str = "-c";

const OBSERVE_ENGINE_FLAGS: &[&str] = &[
    "--pause-contexts-on-exit",
    "--pause-contexts-on-unhandled-exceptions",
    "--warn-on-pause-with-no-debugger",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("No value given to -D option: '-D{0}'")]
    MissingDefineValue(String),
    #[error("No name given to -D option")]
    MissingDefineName,
    #[error("Invalid option specification : '{0}'")]
    InvalidOption(String),
    #[error("unrecognized {flag} option syntax. Use {flag}[:<port number>[/<IPv4 address>]]")]
    ServiceSyntax { flag: &'static str },
    #[error(
        "--snapshot and --full-snapshot-after-run options cannot be specified at the same time"
    )]
    ScriptAndFullSnapshot,
    #[error("No script path given")]
    MissingScript,
    #[error("Specifying both a packages directory and a packages file is invalid.")]
    PackageRootAndMap,
    #[error("Specifying {first} and {second} is invalid.")]
    ConflictingModes {
        first: &'static str,
        second: &'static str,
    },
    #[error("Specifying an option to generate a snapshot and run using a snapshot is invalid.")]
    GenerateAndRun,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PackageResolution {
    #[default]
    None,
    Root(String),
    Map(String),
}

impl PackageResolution {
    pub fn root(&self) -> Option<&str> {
        match self {
            PackageResolution::Root(p) => Some(p),
            _ => None,
        }
    }

    pub fn map(&self) -> Option<&str> {
        match self {
            PackageResolution::Map(p) => Some(p),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RunMode {
    #[default]
    Normal,
    GenerateScriptSnapshot {
        file: String,
    },
    GenerateFullSnapshotAfterRun {
        base: String,
    },
    RunFullSnapshot {
        base: String,
    },
    GeneratePrecompiledSnapshot {
        dir: String,
    },
    RunPrecompiledSnapshot {
        dir: String,
    },
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Normal => "normal",
            RunMode::GenerateScriptSnapshot { .. } => "generate-script-snapshot",
            RunMode::GenerateFullSnapshotAfterRun { .. } => "generate-full-snapshot-after-run",
            RunMode::RunFullSnapshot { .. } => "run-full-snapshot",
            RunMode::GeneratePrecompiledSnapshot { .. } => "generate-precompiled-snapshot",
            RunMode::RunPrecompiledSnapshot { .. } => "run-precompiled-snapshot",
        }
    }

    /// The command-line flag that selects this mode.
    pub fn flag(&self) -> &'static str {
        match self {
            RunMode::Normal => "",
            RunMode::GenerateScriptSnapshot { .. } => "--snapshot",
            RunMode::GenerateFullSnapshotAfterRun { .. } => "--full-snapshot-after-run",
            RunMode::RunFullSnapshot { .. } => "--run-full-snapshot",
            RunMode::GeneratePrecompiledSnapshot { .. } => "--gen-precompiled-snapshot",
            RunMode::RunPrecompiledSnapshot { .. } => "--run-precompiled-snapshot",
        }
    }

    pub fn runs_full_snapshot(&self) -> bool {
        matches!(self, RunMode::RunFullSnapshot { .. })
    }

    pub fn runs_precompiled_snapshot(&self) -> bool {
        matches!(self, RunMode::RunPrecompiledSnapshot { .. })
    }

    pub fn generates_precompiled_snapshot(&self) -> bool {
        matches!(self, RunMode::GeneratePrecompiledSnapshot { .. })
    }

    /// True when the main context is resumed from a snapshot and no source is loaded.
    pub fn resumes_from_snapshot(&self) -> bool {
        self.runs_full_snapshot() || self.runs_precompiled_snapshot()
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceBind {
    pub ip: String,
    pub port: u16,
}

impl Default for ServiceBind {
    fn default() -> Self {
        ServiceBind {
            ip: DEFAULT_SERVICE_IP.to_string(),
            port: DEFAULT_SERVICE_PORT,
        }
    }
}

/// Everything the command line decided, built once and read everywhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchConfig {
    pub executable: String,
    /// Arguments that preceded the script path.
    pub executable_args: Vec<String>,
    pub engine_flags: Vec<String>,
    pub script: String,
    pub script_args: Vec<String>,
    pub packages: PackageResolution,
    pub mode: RunMode,
    pub service: Option<ServiceBind>,
    pub environment: EnvironmentTable,
    pub compile_all: bool,
    pub trace_loading: bool,
    pub vm_shutdown: bool,
    /// Non-fatal command-line issues, reported once logging is up.
    pub warnings: Vec<String>,
}

/// What the process should do with its command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    Run(Box<LaunchConfig>),
    Help { verbose: bool },
    Version,
    PrintFlags { engine_flags: Vec<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Accepted,
    Declined,
}

type OptionHandler = fn(&mut LaunchBuilder, &str) -> Result<Verdict, ConfigError>;

// Matched by prefix, first accepting entry wins.
const MAIN_OPTIONS: &[(&str, OptionHandler)] = &[
    ("-D", LaunchBuilder::define),
    ("-h", LaunchBuilder::help),
    ("--help", LaunchBuilder::help),
    ("--packages=", LaunchBuilder::packages_file),
    ("--package-root=", LaunchBuilder::package_root_long),
    ("-v", LaunchBuilder::verbose),
    ("--verbose", LaunchBuilder::verbose),
    ("--version", LaunchBuilder::version),
    ("--compile_all", LaunchBuilder::compile_all),
    ("--enable-vm-service", LaunchBuilder::enable_service),
    ("--gen-precompiled-snapshot", LaunchBuilder::gen_precompiled),
    ("--observe", LaunchBuilder::observe),
    ("--run-precompiled-snapshot", LaunchBuilder::run_precompiled),
    ("--shutdown", LaunchBuilder::shutdown),
    ("--snapshot=", LaunchBuilder::script_snapshot),
    ("--full-snapshot-after-run=", LaunchBuilder::full_snapshot_after_run),
    ("--run-full-snapshot=", LaunchBuilder::run_full_snapshot),
    ("--trace-loading", LaunchBuilder::trace_loading),
];

struct LaunchBuilder {
    engine_flags: Vec<String>,
    environment: EnvironmentTable,
    package_root: Option<String>,
    packages_file: Option<String>,
    script_snapshot: Option<String>,
    full_snapshot_after_run: Option<String>,
    run_full_snapshot: Option<String>,
    gen_precompiled: Option<String>,
    run_precompiled: Option<String>,
    service: Option<ServiceBind>,
    compile_all: bool,
    trace_loading: bool,
    vm_shutdown: bool,
    help: bool,
    version: bool,
    verbose: bool,
    print_flags: bool,
    warnings: Vec<String>,
}

impl LaunchBuilder {
    fn new() -> Self {
        LaunchBuilder {
            engine_flags: vec![BASE_ENGINE_FLAG.to_string()],
            environment: EnvironmentTable::new(),
            package_root: None,
            packages_file: None,
            script_snapshot: None,
            full_snapshot_after_run: None,
            run_full_snapshot: None,
            gen_precompiled: None,
            run_precompiled: None,
            service: None,
            compile_all: false,
            trace_loading: false,
            vm_shutdown: true,
            help: false,
            version: false,
            verbose: false,
            print_flags: false,
            warnings: Vec::new(),
        }
    }

    fn process_main_option(&mut self, arg: &str) -> Result<bool, ConfigError> {
        for (name, handler) in MAIN_OPTIONS {
            let Some(value) = arg.strip_prefix(name) else {
                continue;
            };
            if handler(self, value)? == Verdict::Accepted {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn define(&mut self, value: &str) -> Result<Verdict, ConfigError> {
        if value.is_empty() {
            self.warnings
                .push("No arguments given to -D option".to_string());
            return Ok(Verdict::Accepted);
        }
        let Some((name, val)) = value.split_once('=') else {
            return Err(ConfigError::MissingDefineValue(value.to_string()));
        };
        if name.is_empty() {
            return Err(ConfigError::MissingDefineName);
        }
        self.environment.define(name, val);
        Ok(Verdict::Accepted)
    }

    fn help(&mut self, value: &str) -> Result<Verdict, ConfigError> {
        Ok(set_if_bare(value, &mut self.help))
    }

    fn verbose(&mut self, value: &str) -> Result<Verdict, ConfigError> {
        Ok(set_if_bare(value, &mut self.verbose))
    }

    fn version(&mut self, value: &str) -> Result<Verdict, ConfigError> {
        Ok(set_if_bare(value, &mut self.version))
    }

    fn compile_all(&mut self, value: &str) -> Result<Verdict, ConfigError> {
        Ok(set_if_bare(value, &mut self.compile_all))
    }

    fn trace_loading(&mut self, value: &str) -> Result<Verdict, ConfigError> {
        Ok(set_if_bare(value, &mut self.trace_loading))
    }

    fn packages_file(&mut self, value: &str) -> Result<Verdict, ConfigError> {
        let path = path_value(value)
            .ok_or_else(|| ConfigError::InvalidOption(format!("--packages={value}")))?;
        self.packages_file = Some(path.to_string());
        Ok(Verdict::Accepted)
    }

    fn package_root_long(&mut self, value: &str) -> Result<Verdict, ConfigError> {
        let path = path_value(value)
            .ok_or_else(|| ConfigError::InvalidOption(format!("--package-root={value}")))?;
        self.package_root = Some(path.to_string());
        Ok(Verdict::Accepted)
    }

    fn enable_service(&mut self, value: &str) -> Result<Verdict, ConfigError> {
        let bind = parse_service_bind(value).ok_or(ConfigError::ServiceSyntax {
            flag: "--enable-vm-service",
        })?;
        self.service = Some(bind);
        Ok(Verdict::Accepted)
    }

    fn observe(&mut self, value: &str) -> Result<Verdict, ConfigError> {
        let bind =
            parse_service_bind(value).ok_or(ConfigError::ServiceSyntax { flag: "--observe" })?;
        self.service = Some(bind);
        self.engine_flags
            .extend(OBSERVE_ENGINE_FLAGS.iter().map(|f| f.to_string()));
        Ok(Verdict::Accepted)
    }

    fn gen_precompiled(&mut self, value: &str) -> Result<Verdict, ConfigError> {
        self.gen_precompiled = Some(strip_separator(value).to_string());
        self.engine_flags.push("--precompilation".to_string());
        Ok(Verdict::Accepted)
    }

    fn run_precompiled(&mut self, value: &str) -> Result<Verdict, ConfigError> {
        self.run_precompiled = Some(strip_separator(value).to_string());
        self.engine_flags.push("--precompilation".to_string());
        Ok(Verdict::Accepted)
    }

    fn shutdown(&mut self, value: &str) -> Result<Verdict, ConfigError> {
        let enabled = match value {
            "" => true,
            _ => match strip_separator_strict(value) {
                Some("true") => true,
                Some("false") => false,
                _ => return Ok(Verdict::Declined),
            },
        };
        self.vm_shutdown = enabled;
        self.engine_flags.push(
            if enabled {
                "--shutdown"
            } else {
                "--no-shutdown"
            }
            .to_string(),
        );
        Ok(Verdict::Accepted)
    }

    fn script_snapshot(&mut self, value: &str) -> Result<Verdict, ConfigError> {
        if value.is_empty() {
            return Err(ConfigError::InvalidOption("--snapshot=".to_string()));
        }
        if self.full_snapshot_after_run.is_some() {
            return Err(ConfigError::ScriptAndFullSnapshot);
        }
        self.script_snapshot = Some(value.to_string());
        Ok(Verdict::Accepted)
    }

    fn full_snapshot_after_run(&mut self, value: &str) -> Result<Verdict, ConfigError> {
        if value.is_empty() {
            return Err(ConfigError::InvalidOption(
                "--full-snapshot-after-run=".to_string(),
            ));
        }
        if self.script_snapshot.is_some() {
            return Err(ConfigError::ScriptAndFullSnapshot);
        }
        self.full_snapshot_after_run = Some(value.to_string());
        Ok(Verdict::Accepted)
    }

    fn run_full_snapshot(&mut self, value: &str) -> Result<Verdict, ConfigError> {
        if value.is_empty() {
            return Err(ConfigError::InvalidOption(
                "--run-full-snapshot=".to_string(),
            ));
        }
        self.run_full_snapshot = Some(value.to_string());
        Ok(Verdict::Accepted)
    }

    fn wants_early_exit(&self) -> Option<Invocation> {
        if self.help {
            Some(Invocation::Help {
                verbose: self.verbose,
            })
        } else if self.version {
            Some(Invocation::Version)
        } else if self.print_flags {
            Some(Invocation::PrintFlags {
                engine_flags: self.engine_flags.clone(),
            })
        } else {
            None
        }
    }

    fn select_mode(&self) -> Result<RunMode, ConfigError> {
        if self.run_full_snapshot.is_some() && self.run_precompiled.is_some() {
            return Err(ConfigError::ConflictingModes {
                first: "--run-full-snapshot",
                second: "--run-precompiled-snapshot",
            });
        }

        let generating = self.script_snapshot.is_some()
            || self.full_snapshot_after_run.is_some()
            || self.gen_precompiled.is_some();
        let running = self.run_full_snapshot.is_some() || self.run_precompiled.is_some();
        if generating && running {
            return Err(ConfigError::GenerateAndRun);
        }

        let selected: Vec<RunMode> = [
            self.script_snapshot
                .clone()
                .map(|file| RunMode::GenerateScriptSnapshot { file }),
            self.full_snapshot_after_run
                .clone()
                .map(|base| RunMode::GenerateFullSnapshotAfterRun { base }),
            self.run_full_snapshot
                .clone()
                .map(|base| RunMode::RunFullSnapshot { base }),
            self.gen_precompiled
                .clone()
                .map(|dir| RunMode::GeneratePrecompiledSnapshot { dir }),
            self.run_precompiled
                .clone()
                .map(|dir| RunMode::RunPrecompiledSnapshot { dir }),
        ]
        .into_iter()
        .flatten()
        .collect();

        match selected.as_slice() {
            [] => Ok(RunMode::Normal),
            [mode] => Ok(mode.clone()),
            [first, second, ..] => Err(ConfigError::ConflictingModes {
                first: first.flag(),
                second: second.flag(),
            }),
        }
    }
}

fn set_if_bare(value: &str, flag: &mut bool) -> Verdict {
    if !value.is_empty() {
        return Verdict::Declined;
    }
    *flag = true;
    Verdict::Accepted
}

fn path_value(value: &str) -> Option<&str> {
    if value.is_empty() || value.starts_with('-') {
        None
    } else {
        Some(value)
    }
}

fn strip_separator(value: &str) -> &str {
    strip_separator_strict(value).unwrap_or(value)
}

fn strip_separator_strict(value: &str) -> Option<&str> {
    value.strip_prefix(':').or_else(|| value.strip_prefix('='))
}

/// Parses the `[:<port>[/<ipv4>]]` suffix shared by `--enable-vm-service` and
/// `--observe`. `=` is accepted in place of `:`.
pub fn parse_service_bind(value: &str) -> Option<ServiceBind> {
    if value.is_empty() {
        return Some(ServiceBind::default());
    }
    let rest = strip_separator_strict(value)?;
    let (port, ip) = match rest.split_once('/') {
        Some((port, ip)) => (port, Some(ip)),
        None => (rest, None),
    };
    let port: u16 = port.parse().ok()?;
    let ip = match ip {
        Some(ip) => {
            ip.parse::<Ipv4Addr>().ok()?;
            ip.to_string()
        }
        None => DEFAULT_SERVICE_IP.to_string(),
    };
    Some(ServiceBind { ip, port })
}

fn is_valid_flag(arg: &str) -> bool {
    arg.len() > FLAG_PREFIX.len() && arg.starts_with(FLAG_PREFIX)
}

/// Turns `argv` (including the executable name) into an [`Invocation`].
///
/// Flag-level errors surface as soon as the offending argument is scanned; the
/// cross-flag checks run only after the script path has been found. Help, version
/// and print-flags requests only take effect when the command line cannot run.
pub fn parse_args<S: AsRef<str>>(argv: &[S]) -> Result<Invocation, ConfigError> {
    let mut builder = LaunchBuilder::new();
    match parse_into(&mut builder, argv) {
        Ok(config) => Ok(Invocation::Run(Box::new(config))),
        Err(err) => builder.wants_early_exit().ok_or(err),
    }
}

fn parse_into<S: AsRef<str>>(
    b: &mut LaunchBuilder,
    argv: &[S],
) -> Result<LaunchConfig, ConfigError> {
    let argv: Vec<&str> = argv.iter().map(AsRef::as_ref).collect();
    let executable = argv.first().copied().unwrap_or_default().to_string();

    let mut i = 1;
    while i < argv.len() {
        let arg = argv[i];
        if b.process_main_option(arg)? {
            i += 1;
            continue;
        }

        if let Some(attached) = arg.strip_prefix(PACKAGE_ROOT_SHORT) {
            let path = match path_value(attached) {
                Some(path) => path,
                None => {
                    i += 1;
                    argv.get(i)
                        .copied()
                        .and_then(path_value)
                        .ok_or_else(|| ConfigError::InvalidOption(arg.to_string()))?
                }
            };
            b.package_root = Some(path.to_string());
            i += 1;
            continue;
        }
        if arg.starts_with(CHECKED_SHORT) {
            b.engine_flags.push("--checked".to_string());
            i += 1;
            continue;
        }
        if !is_valid_flag(arg) {
            break;
        }

        if arg.starts_with("--print-flags") || arg.starts_with("--print_flags") {
            b.print_flags = true;
        }
        b.engine_flags.push(arg.to_string());
        i += 1;
    }

    let executable_args: Vec<String> = argv
        .get(1..i)
        .unwrap_or(&[])
        .iter()
        .map(|s| s.to_string())
        .collect();

    let Some(script) = argv.get(i) else {
        return Err(ConfigError::MissingScript);
    };
    let script_args: Vec<String> = argv[i + 1..].iter().map(|s| s.to_string()).collect();

    let packages = match (b.package_root.take(), b.packages_file.take()) {
        (Some(_), Some(_)) => return Err(ConfigError::PackageRootAndMap),
        (Some(root), None) => PackageResolution::Root(root),
        (None, Some(map)) => PackageResolution::Map(map),
        (None, None) => PackageResolution::None,
    };
    let mode = b.select_mode()?;

    Ok(LaunchConfig {
        executable,
        executable_args,
        engine_flags: b.engine_flags.clone(),
        script: script.to_string(),
        script_args,
        packages,
        mode,
        service: b.service.clone(),
        environment: b.environment.clone(),
        compile_all: b.compile_all,
        trace_loading: b.trace_loading,
        vm_shutdown: b.vm_shutdown,
        warnings: std::mem::take(&mut b.warnings),
    })
}
