use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use sha2::{Digest, Sha256};
use vmhost::snapshot::{full_snapshot_paths, precompiled_paths, strip_script_magic};
use vmhost_contracts::VMHOST_SNAPSHOT_REPORT_SCHEMA_VERSION;

#[derive(Parser)]
#[command(name = "vmhost-snapshot")]
#[command(about = "Reports sizes and digests of vmhost snapshot files.", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// A single snapshot file; script snapshots are recognized by their magic number.
    Inspect {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
    /// The two buffers of a full snapshot written by --full-snapshot-after-run.
    Full {
        #[arg(value_name = "BASE")]
        base: String,
    },
    /// The three files written by --gen-precompiled-snapshot.
    Precompiled {
        #[arg(long, value_name = "DIR")]
        dir: Option<String>,
    },
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Inspect { .. } => "inspect",
            Command::Full { .. } => "full",
            Command::Precompiled { .. } => "precompiled",
        }
    }
}

#[derive(Debug, Serialize)]
struct Report {
    schema_version: &'static str,
    command: &'static str,
    ok: bool,
    files: Vec<FileReport>,
}

#[derive(Debug, Serialize)]
struct FileReport {
    role: &'static str,
    path: String,
    exists: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    kind: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sha256: Option<String>,
}

fn main() -> ExitCode {
    match try_main() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::from(2)
        }
    }
}

fn try_main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let files = match &cli.command {
        Command::Inspect { file } => vec![describe("script", file, true)?],
        Command::Full { base } => {
            let (vm, context) = full_snapshot_paths(base);
            vec![
                describe("vm", &vm, false)?,
                describe("context", &context, false)?,
            ]
        }
        Command::Precompiled { dir } => {
            let paths = precompiled_paths(dir.as_deref().unwrap_or_default());
            vec![
                describe("vm", &paths.vm, false)?,
                describe("context", &paths.context, false)?,
                describe("instructions", &paths.instructions, false)?,
            ]
        }
    };

    let report = Report {
        schema_version: VMHOST_SNAPSHOT_REPORT_SCHEMA_VERSION,
        command: cli.command.name(),
        ok: files.iter().all(|f| f.exists),
        files,
    };
    let json = serde_json::to_string_pretty(&report).context("serialize report")?;
    println!("{json}");

    Ok(if report.ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}

fn describe(role: &'static str, path: &Path, detect_magic: bool) -> Result<FileReport> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Ok(FileReport {
                role,
                path: path.display().to_string(),
                exists: false,
                kind: None,
                size: None,
                payload_size: None,
                sha256: None,
            });
        }
        Err(err) => {
            return Err(err).with_context(|| format!("read snapshot file: {}", path.display()))
        }
    };

    let (kind, payload) = match strip_script_magic(&bytes).filter(|_| detect_magic) {
        Some(payload) => ("script", payload),
        None => ("raw", bytes.as_slice()),
    };
    Ok(FileReport {
        role,
        path: path.display().to_string(),
        exists: true,
        kind: Some(kind),
        size: Some(bytes.len()),
        payload_size: Some(payload.len()),
        sha256: Some(sha256_hex(payload)),
    })
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        out.push_str(&format!("{b:02x}"));
    }
    out
}
