//! Snapshot files on disk.
//!
//! Three formats exist:
//!
//! - script snapshot: one buffer behind [`SCRIPT_SNAPSHOT_MAGIC`],
//! - full snapshot: `<base>.vmisolate` and `<base>.isolate`,
//! - precompiled snapshot: `precompiled.vmisolate`, `precompiled.isolate` and
//!   `precompiled.S`, the latter linked into a shared library by a later build step
//!   and read back through two exported symbols.
//!
//! Only presence and symbol resolution are checked on load. The contents are
//! trusted as is.

use std::fmt;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;
use vmhost_contracts::{
    CONTEXT_SNAPSHOT_SUFFIX, PRECOMPILED_CONTEXT_SNAPSHOT_NAME, PRECOMPILED_DATA_SYMBOL,
    PRECOMPILED_INSTRUCTIONS_NAME, PRECOMPILED_INSTRUCTIONS_SYMBOL, PRECOMPILED_LIBRARY_NAME,
    PRECOMPILED_VM_SNAPSHOT_NAME, SCRIPT_SNAPSHOT_MAGIC, VM_SNAPSHOT_SUFFIX,
};

use crate::engine::SymbolAddr;
use crate::native_lib::SharedLibrary;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotKind {
    VmGlobals,
    ContextHeap,
    CompiledInstructions,
    CompiledData,
}

impl SnapshotKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SnapshotKind::VmGlobals => "vm-globals",
            SnapshotKind::ContextHeap => "context-heap",
            SnapshotKind::CompiledInstructions => "compiled-instructions",
            SnapshotKind::CompiledData => "compiled-data",
        }
    }
}

impl fmt::Display for SnapshotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotBlob {
    pub kind: SnapshotKind,
    pub bytes: Vec<u8>,
}

impl SnapshotBlob {
    pub fn new(kind: SnapshotKind, bytes: Vec<u8>) -> Self {
        SnapshotBlob { kind, bytes }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullSnapshot {
    pub vm: SnapshotBlob,
    pub context: SnapshotBlob,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrecompiledSnapshot {
    pub vm: SnapshotBlob,
    pub context: SnapshotBlob,
    pub instructions: SnapshotBlob,
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Unable to open file {} for snapshot: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Unable to write snapshot file {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Unable to read snapshot file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Snapshot file {} is empty", path.display())]
    Empty { path: PathBuf },
    #[error("Failed to load library {}: {reason}", path.display())]
    LibraryLoad { path: PathBuf, reason: String },
    #[error("Failed to resolve {kind} symbol '{symbol}' in {}", library.display())]
    SymbolMissing {
        kind: SnapshotKind,
        symbol: &'static str,
        library: PathBuf,
    },
}

/// How the main script reaches the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptSource {
    /// Script snapshot payload, magic number stripped.
    Snapshot(Vec<u8>),
    /// Plain source text as read from disk.
    Text(Vec<u8>),
    /// Not a local file; the engine's loader resolves the URI.
    Uri,
}

impl ScriptSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScriptSource::Snapshot(_) => "snapshot",
            ScriptSource::Text(_) => "text",
            ScriptSource::Uri => "uri",
        }
    }
}

/// Splits a script snapshot into its payload; `None` when the magic is absent.
pub fn strip_script_magic(bytes: &[u8]) -> Option<&[u8]> {
    bytes.strip_prefix(&SCRIPT_SNAPSHOT_MAGIC[..])
}

pub fn classify_script(bytes: Vec<u8>) -> ScriptSource {
    match strip_script_magic(&bytes) {
        Some(payload) => ScriptSource::Snapshot(payload.to_vec()),
        None => ScriptSource::Text(bytes),
    }
}

pub fn load_script_source(script: &str) -> io::Result<ScriptSource> {
    let path = Path::new(script);
    if !path.is_file() {
        return Ok(ScriptSource::Uri);
    }
    Ok(classify_script(std::fs::read(path)?))
}

/// `<dir>/<name>`, or `<name>` when `dir` is empty.
pub fn qualified_path(dir: &str, name: &str) -> PathBuf {
    if dir.is_empty() {
        PathBuf::from(name)
    } else {
        Path::new(dir).join(name)
    }
}

pub fn full_snapshot_paths(base: &str) -> (PathBuf, PathBuf) {
    (
        PathBuf::from(format!("{base}.{VM_SNAPSHOT_SUFFIX}")),
        PathBuf::from(format!("{base}.{CONTEXT_SNAPSHOT_SUFFIX}")),
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrecompiledPaths {
    pub vm: PathBuf,
    pub context: PathBuf,
    pub instructions: PathBuf,
    pub library: PathBuf,
}

pub fn precompiled_paths(dir: &str) -> PrecompiledPaths {
    PrecompiledPaths {
        vm: qualified_path(dir, PRECOMPILED_VM_SNAPSHOT_NAME),
        context: qualified_path(dir, PRECOMPILED_CONTEXT_SNAPSHOT_NAME),
        instructions: qualified_path(dir, PRECOMPILED_INSTRUCTIONS_NAME),
        library: qualified_path(dir, PRECOMPILED_LIBRARY_NAME),
    }
}

pub fn write_snapshot_file(path: &Path, magic: bool, bytes: &[u8]) -> Result<(), SnapshotError> {
    let mut file = File::create(path).map_err(|source| SnapshotError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let write_err = |source| SnapshotError::Write {
        path: path.to_path_buf(),
        source,
    };
    if magic {
        file.write_all(&SCRIPT_SNAPSHOT_MAGIC).map_err(write_err)?;
    }
    file.write_all(bytes).map_err(write_err)?;
    file.flush().map_err(write_err)?;
    Ok(())
}

pub fn read_snapshot_file(path: &Path) -> Result<Vec<u8>, SnapshotError> {
    let bytes = std::fs::read(path).map_err(|source| match source.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => SnapshotError::Open {
            path: path.to_path_buf(),
            source,
        },
        _ => SnapshotError::Read {
            path: path.to_path_buf(),
            source,
        },
    })?;
    if bytes.is_empty() {
        return Err(SnapshotError::Empty {
            path: path.to_path_buf(),
        });
    }
    Ok(bytes)
}

fn write_blob(path: &Path, magic: bool, blob: &SnapshotBlob) -> Result<(), SnapshotError> {
    debug!(kind = %blob.kind, bytes = blob.len(), path = %path.display(), "writing snapshot");
    write_snapshot_file(path, magic, &blob.bytes)
}

pub fn write_script_snapshot(file: &str, blob: &SnapshotBlob) -> Result<(), SnapshotError> {
    write_blob(Path::new(file), true, blob)
}

pub fn write_full_snapshot(base: &str, snapshot: &FullSnapshot) -> Result<(), SnapshotError> {
    let (vm, context) = full_snapshot_paths(base);
    write_blob(&vm, false, &snapshot.vm)?;
    write_blob(&context, false, &snapshot.context)?;
    Ok(())
}

pub fn write_precompiled_snapshot(
    dir: &str,
    snapshot: &PrecompiledSnapshot,
) -> Result<(), SnapshotError> {
    let paths = precompiled_paths(dir);
    write_blob(&paths.vm, false, &snapshot.vm)?;
    write_blob(&paths.context, false, &snapshot.context)?;
    write_blob(&paths.instructions, false, &snapshot.instructions)?;
    Ok(())
}

/// The compiled-code library of a precompiled snapshot. The symbol addresses point
/// into the library, so it stays loaded as long as this value lives.
#[derive(Debug)]
pub struct PrecompiledImage {
    _library: SharedLibrary,
    pub instructions: SymbolAddr,
    pub data: SymbolAddr,
}

impl PrecompiledImage {
    pub fn load(path: &Path) -> Result<Self, SnapshotError> {
        let library = SharedLibrary::open(path).map_err(|reason| SnapshotError::LibraryLoad {
            path: path.to_path_buf(),
            reason,
        })?;
        let resolve = |kind: SnapshotKind, symbol: &'static str| {
            library
                .symbol(symbol)
                .map(|ptr| SymbolAddr(ptr.as_ptr() as *const u8))
                .ok_or_else(|| SnapshotError::SymbolMissing {
                    kind,
                    symbol,
                    library: path.to_path_buf(),
                })
        };
        let instructions = resolve(
            SnapshotKind::CompiledInstructions,
            PRECOMPILED_INSTRUCTIONS_SYMBOL,
        )?;
        let data = resolve(SnapshotKind::CompiledData, PRECOMPILED_DATA_SYMBOL)?;
        Ok(PrecompiledImage {
            _library: library,
            instructions,
            data,
        })
    }
}

/// Snapshots read before the engine is initialized.
#[derive(Debug, Default)]
pub struct LoadedSnapshots {
    pub vm: Option<Vec<u8>>,
    pub context: Option<Vec<u8>>,
    pub image: Option<PrecompiledImage>,
}

pub fn read_full_snapshot(base: &str) -> Result<LoadedSnapshots, SnapshotError> {
    let (vm, context) = full_snapshot_paths(base);
    Ok(LoadedSnapshots {
        vm: Some(read_snapshot_file(&vm)?),
        context: Some(read_snapshot_file(&context)?),
        image: None,
    })
}

pub fn load_precompiled_snapshot(dir: &str) -> Result<LoadedSnapshots, SnapshotError> {
    let paths = precompiled_paths(dir);
    let vm = read_snapshot_file(&paths.vm)?;
    let context = read_snapshot_file(&paths.context)?;
    let image = PrecompiledImage::load(&paths.library)?;
    Ok(LoadedSnapshots {
        vm: Some(vm),
        context: Some(context),
        image: Some(image),
    })
}
