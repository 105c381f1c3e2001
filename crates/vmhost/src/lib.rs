//! Host executable core for an embedded managed-runtime engine: command-line
//! parsing, snapshot files, execution-context lifecycle and the bootstrap loop.

pub mod assets;
pub mod bootstrap;
pub mod context;
pub mod engine;
pub mod environment;
pub mod host_io;
pub mod logging;
pub mod native;
pub mod native_lib;
pub mod options;
pub mod service;
pub mod snapshot;
pub mod usage;

pub use bootstrap::{launch, BootstrapOutcome, LaunchSummary};
pub use engine::{Embedder, Engine, EngineError, EngineErrorKind, EngineResult};
pub use options::{parse_args, ConfigError, Invocation, LaunchConfig, RunMode};
