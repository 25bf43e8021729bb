use std::io::{self, Read};
use std::path::Path;

use tracing::debug;

const HASH_BUFFER_SIZE: usize = 128 * 1024;

/// Outcome of checking one destination file against its enumeration hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    Match,
    /// BLAKE3 of source and destination differ
    Mismatch,
    MissingInDestination,
    Unreadable(String),
}

impl VerifyOutcome {
    pub fn is_match(&self) -> bool {
        matches!(self, Self::Match)
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Match => "match".to_string(),
            Self::Mismatch => "hash mismatch".to_string(),
            Self::MissingInDestination => "missing in destination".to_string(),
            Self::Unreadable(e) => format!("unreadable: {}", e),
        }
    }
}

/// Hash a file using BLAKE3, streaming in chunks to handle large files.
pub fn hash_file(path: &Path) -> io::Result<blake3::Hash> {
    let file = std::fs::File::open(path)?;
    let mut reader = io::BufReader::with_capacity(HASH_BUFFER_SIZE, file);
    let mut hasher = blake3::Hasher::new();

    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hasher.finalize())
}

/// Re-hash `destination` and compare it with the hash taken at enumeration.
///
/// Blocking; run on the blocking pool.
pub fn verify_file(destination: &Path, expected: &[u8; 32]) -> VerifyOutcome {
    if !destination.exists() {
        return VerifyOutcome::MissingInDestination;
    }

    match hash_file(destination) {
        Ok(actual) if actual.as_bytes() == expected => VerifyOutcome::Match,
        Ok(_) => VerifyOutcome::Mismatch,
        Err(e) => {
            debug!(
                file = %destination.display(),
                error = %e,
                "Failed to hash destination file"
            );
            VerifyOutcome::Unreadable(e.to_string())
        }
    }
}
