//! Loading and emitting module files.
//!
//! The pipeline only ever touches the file system through [`ModuleIo`]. The
//! default codec serializes the module graph with bincode and compresses the
//! payload with zstd (level 3: balanced speed/compression).

use super::Module;
use crate::error::CodecError;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

/// The module-file codec collaborator.
pub trait ModuleIo {
    /// Parse a module file into the mutable graph.
    fn load(&self, path: &Path) -> Result<Module, CodecError>;

    /// Emit the module back to disk, creating the output directory if
    /// needed.
    fn write(&self, module: &Module, path: &Path) -> Result<(), CodecError>;
}

/// Default bincode + zstd codec.
#[derive(Debug, Clone)]
pub struct BincodeModuleIo {
    compression_level: i32,
}

impl Default for BincodeModuleIo {
    fn default() -> Self {
        Self {
            compression_level: 3,
        }
    }
}

impl BincodeModuleIo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_compression_level(compression_level: i32) -> Self {
        Self { compression_level }
    }
}

impl ModuleIo for BincodeModuleIo {
    fn load(&self, path: &Path) -> Result<Module, CodecError> {
        let compressed = fs::read(path).map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                CodecError::NotFound(path.to_path_buf())
            } else {
                CodecError::Io(e)
            }
        })?;
        let payload = zstd::decode_all(compressed.as_slice())
            .map_err(|e| CodecError::Malformed(format!("zstd: {e}")))?;
        let (module, consumed) =
            bincode::decode_from_slice::<Module, _>(&payload, bincode::config::standard())
                .map_err(|e| CodecError::Malformed(format!("bincode: {e}")))?;
        if consumed != payload.len() {
            return Err(CodecError::Malformed(format!(
                "trailing bytes after module payload ({} of {})",
                consumed,
                payload.len()
            )));
        }
        Ok(module)
    }

    fn write(&self, module: &Module, path: &Path) -> Result<(), CodecError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let payload = bincode::encode_to_vec(module, bincode::config::standard())
            .map_err(|e| CodecError::Malformed(format!("bincode: {e}")))?;
        let compressed = zstd::encode_all(payload.as_slice(), self.compression_level)
            .map_err(|e| CodecError::Malformed(format!("zstd: {e}")))?;
        fs::write(path, compressed)?;
        Ok(())
    }
}
