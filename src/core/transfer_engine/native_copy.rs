use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use tracing::debug;

use super::{FileCopier, FileCopyError, FileCopyRequest};

/// Buffer size for file I/O operations (128KB for optimal throughput)
pub(crate) const BUFFER_SIZE: usize = 128 * 1024;

/// Native file copier.
///
/// - Large buffered I/O for performance
/// - Parent directories created on demand
/// - Metadata preservation (permissions, timestamps)
/// - Per-file fsync for durability
pub struct NativeCopier {
    /// Whether to fsync each file after writing (safer but slower)
    pub sync_files: bool,
}

impl Default for NativeCopier {
    fn default() -> Self {
        Self { sync_files: true }
    }
}

impl FileCopier for NativeCopier {
    fn copy_file(&self, request: &FileCopyRequest, progress: &AtomicU64) -> Result<u64, FileCopyError> {
        copy_single_file(
            &request.source,
            &request.destination,
            self.sync_files,
            progress,
            |_| {},
        )
    }
}

fn copy_error(context: &str, e: &io::Error) -> FileCopyError {
    FileCopyError {
        message: format!("{}: {}", context, e),
        is_device_removed: is_device_removed_error(e),
    }
}

/// Copy a single file with metadata preservation.
///
/// `pace` is called after every chunk with the chunk's length.
pub(crate) fn copy_single_file(
    source: &Path,
    dest: &Path,
    sync_file: bool,
    progress: &AtomicU64,
    mut pace: impl FnMut(usize),
) -> Result<u64, FileCopyError> {
    progress.store(0, Ordering::Release);

    let source_metadata =
        fs::metadata(source).map_err(|e| copy_error("Failed to read source metadata", &e))?;

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| copy_error("Failed to create destination directory", &e))?;
    }

    let source_file = File::open(source).map_err(|e| copy_error("Failed to open source file", &e))?;
    let mut reader = BufReader::with_capacity(BUFFER_SIZE, source_file);

    let dest_file =
        File::create(dest).map_err(|e| copy_error("Failed to create destination file", &e))?;
    let mut writer = BufWriter::with_capacity(BUFFER_SIZE, dest_file);

    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut bytes_written: u64 = 0;

    loop {
        let bytes_read = reader
            .read(&mut buffer)
            .map_err(|e| copy_error("Failed to read from source", &e))?;

        if bytes_read == 0 {
            break;
        }

        writer
            .write_all(&buffer[..bytes_read])
            .map_err(|e| copy_error("Failed to write to destination", &e))?;

        bytes_written += bytes_read as u64;
        progress.store(bytes_written, Ordering::Release);
        pace(bytes_read);
    }

    writer
        .flush()
        .map_err(|e| copy_error("Failed to flush destination file", &e))?;

    if sync_file {
        let inner = writer
            .into_inner()
            .map_err(|e| copy_error("Failed to get inner file handle", e.error()))?;
        inner
            .sync_all()
            .map_err(|e| copy_error("Failed to sync file", &e))?;
    }

    // CIFS mounts with fixed modes reject chmod; never fatal
    if let Err(e) = fs::set_permissions(dest, source_metadata.permissions()) {
        debug!(dest = %dest.display(), error = %e, "Failed to set file permissions");
    }

    if let Err(e) = preserve_timestamps(&source_metadata, dest) {
        debug!(dest = %dest.display(), error = %e, "Failed to preserve file timestamps");
    }

    Ok(bytes_written)
}

/// Preserve access and modification timestamps from source to destination
fn preserve_timestamps(source_metadata: &fs::Metadata, dest: &Path) -> Result<()> {
    let atime = filetime::FileTime::from_last_access_time(source_metadata);
    let mtime = filetime::FileTime::from_last_modification_time(source_metadata);

    filetime::set_file_times(dest, atime, mtime)?;
    Ok(())
}

/// Check if an I/O error indicates the device has been removed
pub(crate) fn is_device_removed_error(error: &io::Error) -> bool {
    match error.kind() {
        ErrorKind::NotFound => true,
        ErrorKind::PermissionDenied => false,
        ErrorKind::BrokenPipe => true,
        ErrorKind::ConnectionReset => true,
        ErrorKind::ConnectionAborted => true,
        ErrorKind::NotConnected => true,
        _ => {
            if let Some(os_error) = error.raw_os_error() {
                matches!(
                    os_error,
                    libc::EIO
                        | libc::ENODEV
                        | libc::ENXIO
                        | libc::ENOMEDIUM
                        | libc::EMEDIUMTYPE
                        | libc::EHOSTDOWN
                        | libc::ESTALE
                )
            } else {
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    #[test]
    fn test_is_device_removed_error_eio() {
        let error = io::Error::from_raw_os_error(libc::EIO);
        assert!(is_device_removed_error(&error));
    }

    #[test]
    fn test_is_device_removed_error_stale_share() {
        let error = io::Error::from_raw_os_error(libc::ESTALE);
        assert!(is_device_removed_error(&error));
    }

    #[test]
    fn test_is_device_removed_error_permission_denied() {
        let error = io::Error::new(ErrorKind::PermissionDenied, "permission denied");
        assert!(!is_device_removed_error(&error));
    }

    #[test]
    fn test_copy_creates_parents_and_preserves_metadata() {
        let temp = tempdir().unwrap();
        let source = temp.path().join("clip.mov");
        let dest = temp.path().join("nas/project/DCIM/clip.mov");

        let content = vec![42u8; BUFFER_SIZE + 100];
        fs::write(&source, &content).unwrap();
        fs::set_permissions(&source, fs::Permissions::from_mode(0o640)).unwrap();
        let mtime = filetime::FileTime::from_unix_time(1_700_000_000, 0);
        filetime::set_file_mtime(&source, mtime).unwrap();

        let progress = AtomicU64::new(0);
        let request = FileCopyRequest {
            source: source.clone(),
            destination: dest.clone(),
            expected_size: content.len() as u64,
        };
        let written = NativeCopier::default().copy_file(&request, &progress).unwrap();

        assert_eq!(written, content.len() as u64);
        assert_eq!(progress.load(Ordering::Acquire), written);
        assert_eq!(fs::read(&dest).unwrap(), content);

        let meta = fs::metadata(&dest).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o640);
        assert_eq!(filetime::FileTime::from_last_modification_time(&meta), mtime);
    }

    #[test]
    fn test_copy_missing_source_is_error() {
        let temp = tempdir().unwrap();
        let progress = AtomicU64::new(0);
        let request = FileCopyRequest {
            source: temp.path().join("gone.mov"),
            destination: temp.path().join("out.mov"),
            expected_size: 1,
        };

        let err = NativeCopier::default().copy_file(&request, &progress).unwrap_err();
        assert!(err.message.contains("source"));
        assert!(err.is_device_removed);
    }

    #[test]
    fn test_pace_sees_every_chunk() {
        let temp = tempdir().unwrap();
        let source = temp.path().join("a");
        let dest = temp.path().join("b");
        fs::write(&source, vec![1u8; BUFFER_SIZE * 3]).unwrap();

        let mut seen = 0usize;
        let progress = AtomicU64::new(0);
        copy_single_file(&source, &dest, false, &progress, |n| seen += n).unwrap();
        assert_eq!(seen, BUFFER_SIZE * 3);
    }
}
