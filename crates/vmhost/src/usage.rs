use crate::engine::Engine;

const HEADER: &str = "\
Usage: vmhost [<vm-flags>] <script-file> [<script-options>]

Executes the script passed as <script-file>.
";

const COMMON_OPTIONS: &str = "\
--checked or -c
  Insert runtime type checks and enable assertions (checked mode).
--help or -h
  Display this message (add -v or --verbose for information about
  all VM options).
--package-root=<path> or -p<path>
  Where to find packages, that is, \"package:...\" imports.
--packages=<path>
  Where to find a package spec file.
--observe[:<port>[/<bind-address>]]
  Run with a default set of options for debugging. The service will be
  available at http://127.0.0.1:8181/ (default port is 8181, default
  bind address is 127.0.0.1). Contexts pause at exit and when they throw
  unhandled exceptions.
--version
  Print the VM version.
";

const VERBOSE_OPTIONS: &str = "
--snapshot=<file_name>
  Loads the script and writes a script snapshot to the given file.

--full-snapshot-after-run=<base>
  Runs the script, then writes <base>.vmisolate and <base>.isolate.

--run-full-snapshot=<base>
  Runs from the full snapshot written by --full-snapshot-after-run.

--gen-precompiled-snapshot[:<dir>]
  Compiles ahead of time and writes a precompiled snapshot to <dir>.

--run-precompiled-snapshot[:<dir>]
  Runs from a precompiled snapshot in <dir>.

--trace-loading
  Enables tracing of library and script loading.

--enable-vm-service[:<port>[/<bind-address>]]
  Enables the VM service and listens on the given port for connections
  (default port number is 8181, default bind address is 127.0.0.1).

The following options are only used for VM development and may
be changed in any future version:
";

pub fn usage_text(verbose: bool) -> String {
    let mut out = String::from(HEADER);
    out.push('\n');
    if verbose {
        out.push_str("Supported options:\n");
        out.push_str(COMMON_OPTIONS);
        out.push_str(VERBOSE_OPTIONS);
    } else {
        out.push_str("Common options:\n");
        out.push_str(COMMON_OPTIONS);
    }
    out
}

/// Prints usage to stderr. In verbose mode the engine, when available, appends its
/// own flag list.
pub fn print_usage(verbose: bool, engine: Option<&dyn Engine>) {
    eprint!("{}", usage_text(verbose));
    if verbose {
        if let Some(engine) = engine {
            engine.set_flags(&["--print_flags".to_string()]);
        }
    }
}

pub fn print_version(engine: &dyn Engine) {
    eprintln!("VM version: {}", engine.version());
}
