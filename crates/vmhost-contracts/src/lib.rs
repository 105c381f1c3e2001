//! Shared, version-pinned identifiers.
//!
//! These constants are the single source of truth for exit codes, snapshot file
//! names and report schema strings that appear in machine-readable I/O or on disk.

pub const VMHOST_SNAPSHOT_REPORT_SCHEMA_VERSION: &str = "vmhost-snapshot.report@0.1.0";

/// Exit code for embedding-API misuse (for example an invalid context state).
pub const API_ERROR_EXIT_CODE: u8 = 253;
/// Exit code for a script that fails to parse or compile.
pub const COMPILATION_ERROR_EXIT_CODE: u8 = 254;
/// Exit code for every other failure, including bad command lines.
pub const ERROR_EXIT_CODE: u8 = 255;

pub const SCRIPT_SNAPSHOT_MAGIC: [u8; 4] = [0xf5, 0xf5, 0xdc, 0xdc];

pub const VM_SNAPSHOT_SUFFIX: &str = "vmisolate";
pub const CONTEXT_SNAPSHOT_SUFFIX: &str = "isolate";

pub const PRECOMPILED_VM_SNAPSHOT_NAME: &str = "precompiled.vmisolate";
pub const PRECOMPILED_CONTEXT_SNAPSHOT_NAME: &str = "precompiled.isolate";
pub const PRECOMPILED_INSTRUCTIONS_NAME: &str = "precompiled.S";

pub const PRECOMPILED_INSTRUCTIONS_SYMBOL: &str = "kInstructionsSnapshot";
pub const PRECOMPILED_DATA_SYMBOL: &str = "kDataSnapshot";

#[cfg(target_os = "macos")]
pub const PRECOMPILED_LIBRARY_NAME: &str = "libprecompiled.dylib";
#[cfg(windows)]
pub const PRECOMPILED_LIBRARY_NAME: &str = "precompiled.dll";
#[cfg(not(any(target_os = "macos", windows)))]
pub const PRECOMPILED_LIBRARY_NAME: &str = "libprecompiled.so";

#[cfg(target_os = "macos")]
pub const ENGINE_LIBRARY_NAME: &str = "libvmengine.dylib";
#[cfg(windows)]
pub const ENGINE_LIBRARY_NAME: &str = "vmengine.dll";
#[cfg(not(any(target_os = "macos", windows)))]
pub const ENGINE_LIBRARY_NAME: &str = "libvmengine.so";

/// Symbol an engine library exports to hand out its C ABI function table.
pub const ENGINE_API_SYMBOL: &str = "vmhost_engine_api_v1";
pub const ENGINE_API_VERSION: u32 = 1;

/// Name the engine uses when it asks the host to create the service context.
pub const SERVICE_CONTEXT_NAME: &str = "vm-service";

pub const DEFAULT_SERVICE_IP: &str = "127.0.0.1";
pub const DEFAULT_SERVICE_PORT: u16 = 8181;
