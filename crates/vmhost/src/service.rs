//! Hooks the introspection service calls back into the host.

use serde_json::json;

use crate::engine::Engine;

pub const STDOUT_STREAM_ID: &str = "Stdout";
pub const STDERR_STREAM_ID: &str = "Stderr";

pub const GET_IO_METHOD: &str = "getIO";

/// A standard stream the service can mirror to its clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapturedStream {
    Stdout,
    Stderr,
}

impl CapturedStream {
    pub fn from_id(stream_id: &str) -> Option<Self> {
        match stream_id {
            STDOUT_STREAM_ID => Some(CapturedStream::Stdout),
            STDERR_STREAM_ID => Some(CapturedStream::Stderr),
            _ => None,
        }
    }

    pub fn id(self) -> &'static str {
        match self {
            CapturedStream::Stdout => STDOUT_STREAM_ID,
            CapturedStream::Stderr => STDERR_STREAM_ID,
        }
    }
}

/// Turns mirroring of a standard stream on or off in the engine's I/O library.
/// Returns false for a stream the host does not know.
pub fn set_stream_capture(engine: &dyn Engine, stream_id: &str, enabled: bool) -> bool {
    match CapturedStream::from_id(stream_id) {
        Some(stream) => {
            engine.set_stream_capture(stream, enabled);
            true
        }
        None => false,
    }
}

pub fn request_error_json(message: &str) -> String {
    json!({
        "type": "Error",
        "text": format!("Internal error {message}"),
    })
    .to_string()
}

/// Answers a service request the host registered a handler for. `None` when the
/// method is not handled here.
pub fn handle_request(
    engine: &dyn Engine,
    method: &str,
    params: &[(&str, &str)],
) -> Option<String> {
    if method != GET_IO_METHOD {
        return None;
    }
    let keys: Vec<&str> = params.iter().map(|(k, _)| *k).collect();
    let values: Vec<&str> = params.iter().map(|(_, v)| *v).collect();
    Some(
        engine
            .invoke_io_service_handler(&keys, &values)
            .unwrap_or_else(|err| request_error_json(&err.message)),
    )
}
