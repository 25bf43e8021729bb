mod engine;
pub mod native_copy;
pub mod simulated;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use serde::{Deserialize, Serialize};

pub use engine::{EngineSettings, TransferEngine};
pub use native_copy::NativeCopier;
pub use simulated::SimulatedCopier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CopierType {
    #[default]
    Native,
    Simulated,
}

/// One file to copy from the mounted source to the mounted share.
#[derive(Debug, Clone)]
pub struct FileCopyRequest {
    pub source: PathBuf,
    pub destination: PathBuf,
    /// Size recorded in the manifest
    pub expected_size: u64,
}

/// Error information from a file copy operation
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct FileCopyError {
    pub message: String,
    /// The source or destination went away mid-copy
    pub is_device_removed: bool,
}

/// Copies a single file. Called from the blocking pool.
pub trait FileCopier: Send + Sync {
    /// Copy `request.source` to `request.destination`, storing the bytes
    /// written so far into `progress`. Returns the number of bytes written.
    fn copy_file(&self, request: &FileCopyRequest, progress: &AtomicU64) -> Result<u64, FileCopyError>;
}

pub fn create_copier(kind: CopierType) -> Arc<dyn FileCopier> {
    match kind {
        CopierType::Native => Arc::new(NativeCopier::default()),
        CopierType::Simulated => Arc::new(SimulatedCopier::default()),
    }
}
