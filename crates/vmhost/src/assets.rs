//! Inflating the bundled service assets.

use std::io::{self, Write};

use flate2::write::GzDecoder;
use thiserror::Error;

/// Upper bound of input handed to the decoder per call.
pub const INFLATE_CHUNK_SIZE: usize = 256 * 1024;

static SERVICE_ASSETS_ARCHIVE: &[u8] = include_bytes!("../assets/service_assets.tar.gz");

#[derive(Debug, Error)]
pub enum InflateError {
    #[error("no compressed input")]
    Empty,
    #[error("inflate made no progress at input offset {offset}")]
    Stalled { offset: usize },
    #[error("corrupt gzip stream: {0}")]
    Corrupt(#[source] io::Error),
}

/// Incremental gzip inflater. Input may arrive in slices of any size; the result
/// does not depend on where the slice boundaries fall.
pub struct Inflater {
    decoder: GzDecoder<Vec<u8>>,
    consumed: usize,
    stalled: bool,
}

impl Default for Inflater {
    fn default() -> Self {
        Self::new()
    }
}

impl Inflater {
    pub fn new() -> Self {
        Inflater {
            decoder: GzDecoder::new(Vec::new()),
            consumed: 0,
            stalled: false,
        }
    }

    /// Compressed bytes accepted so far.
    pub fn consumed(&self) -> usize {
        self.consumed
    }

    pub fn feed(&mut self, mut input: &[u8]) -> Result<(), InflateError> {
        while !input.is_empty() && !self.stalled {
            let take = input.len().min(INFLATE_CHUNK_SIZE);
            let n = self
                .decoder
                .write(&input[..take])
                .map_err(InflateError::Corrupt)?;
            if n == 0 {
                // Either the stream trailer was reached or the decoder is stuck;
                // `finish` tells the two apart.
                self.stalled = true;
                break;
            }
            self.consumed += n;
            input = &input[n..];
        }
        Ok(())
    }

    pub fn finish(self) -> Result<Vec<u8>, InflateError> {
        let offset = self.consumed;
        let stalled = self.stalled;
        self.decoder.finish().map_err(|err| {
            if stalled {
                InflateError::Stalled { offset }
            } else {
                InflateError::Corrupt(err)
            }
        })
    }
}

pub fn decompress(input: &[u8]) -> Result<Vec<u8>, InflateError> {
    if input.is_empty() {
        return Err(InflateError::Empty);
    }
    let mut inflater = Inflater::new();
    inflater.feed(input)?;
    inflater.finish()
}

/// The service asset tarball, inflated.
pub fn service_assets() -> Result<Vec<u8>, InflateError> {
    decompress(SERVICE_ASSETS_ARCHIVE)
}
