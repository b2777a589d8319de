// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Transfer encodings and the decoders that undo them.
//!
//! All functions here are blocking; the pipeline runs them on the blocking
//! pool.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use flate2::read::MultiGzDecoder;
use thiserror::Error;
use url::Url;

use crate::resolver::PACK_SUFFIX;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("corrupt gzip stream: {0}")]
    Gzip(#[source] io::Error),

    #[error("failed to run {}: {source}", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{} exited with {status}: {stderr}", program.display())]
    UnpackFailed {
        program: PathBuf,
        status: String,
        stderr: String,
    },

    #[error("I/O error while decoding: {0}")]
    Io(#[from] io::Error),
}

/// How the bytes on the wire relate to the file that ends up in the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Identity,
    Gzip,
    /// Gzip-compressed pack200 archive.
    PackGzip,
}

impl Encoding {
    /// Pack200 wins over plain gzip; either the `Content-Encoding` header or
    /// a `.pack.gz` URL is enough to select it.
    pub fn detect(content_encoding: Option<&str>, url: &Url) -> Self {
        let tokens: Vec<String> = content_encoding
            .unwrap_or_default()
            .split(',')
            .map(|t| t.trim().to_ascii_lowercase())
            .collect();
        if tokens.iter().any(|t| t == "pack200-gzip") || url.path().ends_with(PACK_SUFFIX) {
            Encoding::PackGzip
        } else if tokens.iter().any(|t| t == "gzip" || t == "x-gzip") {
            Encoding::Gzip
        } else {
            Encoding::Identity
        }
    }

    /// Extension of the staged, still-encoded copy.
    pub fn suffix(self) -> &'static str {
        match self {
            Encoding::Identity => "",
            Encoding::Gzip => ".gz",
            Encoding::PackGzip => PACK_SUFFIX,
        }
    }
}

/// Expands a pack200 stream into a jar.
pub trait Unpacker: Send + Sync {
    fn unpack(&self, pack: &mut dyn Read, jar: &Path) -> Result<(), DecodeError>;
}

/// Runs `unpack200 - <jar>` with the pack stream on stdin.
#[derive(Debug, Clone)]
pub struct Unpack200Command {
    program: PathBuf,
}

impl Unpack200Command {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for Unpack200Command {
    fn default() -> Self {
        Self::new("unpack200")
    }
}

impl Unpacker for Unpack200Command {
    fn unpack(&self, pack: &mut dyn Read, jar: &Path) -> Result<(), DecodeError> {
        let spawn_error = |source| DecodeError::Spawn {
            program: self.program.clone(),
            source,
        };
        let mut child = Command::new(&self.program)
            .arg("-")
            .arg(jar)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(spawn_error)?;

        if let Some(mut stdin) = child.stdin.take() {
            match io::copy(pack, &mut stdin) {
                Ok(_) => {}
                // A child that dies early closes the pipe; its exit status says why.
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                    tracing::debug!(error = %e, "unpack200 stdin closed early");
                }
                Err(e) => {
                    drop(stdin);
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(DecodeError::Gzip(e));
                }
            }
        }
        let output = child.wait_with_output().map_err(spawn_error)?;
        if !output.status.success() {
            return Err(DecodeError::UnpackFailed {
                program: self.program.clone(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

/// Decompress a (possibly multi-member) gzip file. Returns the decoded size.
pub fn gunzip(src: &Path, dest: &Path) -> Result<u64, DecodeError> {
    let mut decoder = MultiGzDecoder::new(BufReader::new(File::open(src)?));
    let mut out = BufWriter::new(File::create(dest)?);
    let mut buf = vec![0u8; 64 * 1024];
    let mut written = 0u64;
    loop {
        let n = decoder.read(&mut buf).map_err(DecodeError::Gzip)?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n])?;
        written += n as u64;
    }
    out.into_inner().map_err(|e| e.into_error())?.sync_all()?;
    Ok(written)
}

/// Gunzip a `.pack.gz` file and hand the pack stream to `unpacker`.
///
/// The gzip stream is read to its end even when the unpacker stops early, so
/// a bad trailer fails the decode no matter what the unpacker did with the
/// error it saw.
pub fn unpack(src: &Path, dest: &Path, unpacker: &dyn Unpacker) -> Result<(), DecodeError> {
    let mut pack = CheckedReader::new(MultiGzDecoder::new(BufReader::new(File::open(src)?)));
    let unpacked = unpacker.unpack(&mut pack, dest);
    if let Some(e) = pack.error.take() {
        return Err(DecodeError::Gzip(e));
    }
    unpacked?;
    io::copy(&mut pack, &mut io::sink()).map_err(DecodeError::Gzip)?;
    Ok(())
}

/// Remembers the first read error of the wrapped reader.
struct CheckedReader<R> {
    inner: R,
    error: Option<io::Error>,
}

impl<R> CheckedReader<R> {
    fn new(inner: R) -> Self {
        Self { inner, error: None }
    }
}

impl<R: Read> Read for CheckedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf).inspect_err(|e| {
            if self.error.is_none() && e.kind() != io::ErrorKind::Interrupted {
                self.error = Some(io::Error::new(e.kind(), e.to_string()));
            }
        })
    }
}
