//! Compiled artifacts and the compiler contract.
//!
//! Turning template text into something executable is the job of an external
//! compiler. This module only fixes the shape of what a compiler produces: an
//! [`Artifact`] that can be serialized to bytes and restored without loss, so
//! the cache layer can persist it.

use serde::{Deserialize, Serialize};
use stencil_common::ContentHash;

/// An opaque compiled unit produced from raw template text.
///
/// Artifacts are immutable once created and are shared behind `Arc` by the
/// cache and every caller that resolved them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Name the artifact was compiled under.
    pub name: String,
    /// Hash of the raw text it was compiled from.
    pub source_hash: ContentHash,
    /// Identifier of the compiler (and its configuration) that produced it.
    pub compiler: String,
    /// Compiler-specific executable payload.
    pub code: Vec<u8>,
}

/// Failure to encode or decode an [`Artifact`].
#[derive(Debug, Clone, thiserror::Error)]
#[error("artifact codec error: {reason}")]
pub struct CodecError {
    /// Description of the failure.
    pub reason: String,
}

impl Artifact {
    /// Builds an artifact for `raw` text compiled by `compiler`.
    pub fn new(name: impl Into<String>, raw: &[u8], compiler: impl Into<String>, code: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            source_hash: ContentHash::from_bytes(raw),
            compiler: compiler.into(),
            code,
        }
    }

    /// Serializes the artifact to a byte stream.
    pub fn serialize(&self) -> Result<Vec<u8>, CodecError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard()).map_err(|e| CodecError {
            reason: e.to_string(),
        })
    }

    /// Restores an artifact from bytes produced by [`Artifact::serialize`].
    ///
    /// Trailing bytes after a complete artifact are rejected.
    pub fn deserialize(bytes: &[u8]) -> Result<Self, CodecError> {
        let (artifact, read): (Self, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard()).map_err(|e| {
                CodecError {
                    reason: e.to_string(),
                }
            })?;
        if read != bytes.len() {
            return Err(CodecError {
                reason: format!("{} trailing bytes", bytes.len() - read),
            });
        }
        Ok(artifact)
    }

    /// Approximate in-memory size in bytes, used for size budgets.
    pub fn size(&self) -> u64 {
        (self.name.len() + self.compiler.len() + self.code.len() + 16) as u64
    }
}

/// Malformed source text, with the position the compiler stopped at.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{name}:{line}:{column}: {message}")]
pub struct CompileError {
    /// Name of the script being compiled.
    pub name: String,
    /// 1-indexed line of the failure.
    pub line: u32,
    /// 1-indexed column (in bytes) of the failure.
    pub column: u32,
    /// Description of the problem.
    pub message: String,
}

impl CompileError {
    /// Creates a new compile error.
    pub fn new(name: impl Into<String>, line: u32, column: u32, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            line,
            column,
            message: message.into(),
        }
    }
}

/// Deterministic text-to-artifact translation.
///
/// Implementations must produce equal artifacts for equal input and
/// configuration; the cache relies on this to treat a stored artifact as
/// interchangeable with a fresh compilation.
pub trait Compiler: Send + Sync {
    /// Identifier of this compiler and its configuration.
    fn id(&self) -> &str;

    /// Compiles raw template bytes into an artifact.
    fn compile(&self, name: &str, raw: &[u8]) -> Result<Artifact, CompileError>;
}

/// Reference compiler that accepts UTF-8 text verbatim.
///
/// The artifact's code is the text itself. Invalid UTF-8 is reported with
/// the line and column of the first offending byte.
#[derive(Debug, Clone, Default)]
pub struct PlainCompiler;

impl PlainCompiler {
    /// Identifier recorded in every artifact this compiler produces.
    pub const ID: &'static str = "plain/1";
}

impl Compiler for PlainCompiler {
    fn id(&self) -> &str {
        Self::ID
    }

    fn compile(&self, name: &str, raw: &[u8]) -> Result<Artifact, CompileError> {
        if let Err(e) = std::str::from_utf8(raw) {
            let (line, column) = line_col(raw, e.valid_up_to());
            return Err(CompileError::new(name, line, column, "invalid UTF-8 sequence"));
        }
        Ok(Artifact::new(name, raw, Self::ID, raw.to_vec()))
    }
}

/// Converts a byte offset into 1-indexed (line, column) coordinates.
pub fn line_col(text: &[u8], offset: usize) -> (u32, u32) {
    let offset = offset.min(text.len());
    let before = &text[..offset];
    let line = before.iter().filter(|&&b| b == b'\n').count() + 1;
    let line_start = before
        .iter()
        .rposition(|&b| b == b'\n')
        .map(|i| i + 1)
        .unwrap_or(0);
    (line as u32, (offset - line_start + 1) as u32)
}
