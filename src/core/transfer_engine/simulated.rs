use std::sync::atomic::AtomicU64;
use std::time::Duration;

use super::native_copy::copy_single_file;
use super::{FileCopier, FileCopyError, FileCopyRequest};

/// Copier for `--simulation` runs: real copies, throttled to a fixed rate so
/// progress, ETA and milestones can be watched on a workstation.
pub struct SimulatedCopier {
    pub speed_mb_per_sec: u64,
}

impl Default for SimulatedCopier {
    fn default() -> Self {
        Self {
            speed_mb_per_sec: 100,
        }
    }
}

impl FileCopier for SimulatedCopier {
    fn copy_file(&self, request: &FileCopyRequest, progress: &AtomicU64) -> Result<u64, FileCopyError> {
        let bytes_per_sec = self.speed_mb_per_sec.max(1) * 1024 * 1024;
        copy_single_file(&request.source, &request.destination, false, progress, |chunk| {
            std::thread::sleep(Duration::from_secs_f64(chunk as f64 / bytes_per_sec as f64));
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::time::Instant;
    use tempfile::tempdir;

    #[test]
    fn test_simulated_copy_is_throttled() {
        let temp = tempdir().unwrap();
        let source = temp.path().join("clip.mov");
        std::fs::write(&source, vec![0u8; 512 * 1024]).unwrap();

        let copier = SimulatedCopier { speed_mb_per_sec: 5 };
        let progress = AtomicU64::new(0);
        let start = Instant::now();
        let written = copier
            .copy_file(
                &FileCopyRequest {
                    source,
                    destination: temp.path().join("out/clip.mov"),
                    expected_size: 512 * 1024,
                },
                &progress,
            )
            .unwrap();

        assert_eq!(written, 512 * 1024);
        assert_eq!(progress.load(Ordering::Acquire), written);
        // 0.5 MiB at 5 MiB/s
        assert!(start.elapsed() >= Duration::from_millis(90));
    }
}
