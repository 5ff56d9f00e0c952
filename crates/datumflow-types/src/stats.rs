//! Per-datum processing statistics.

use serde::{Deserialize, Serialize};

/// Mutable accumulator of timings and byte counts for one datum.
///
/// Threaded by `&mut` through staging, user-code execution, and upload so
/// each phase adds its share; the final value is persisted with the datum's
/// stats commit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessStats {
    pub download_secs: f64,
    pub download_bytes: u64,
    pub process_secs: f64,
    pub upload_secs: f64,
    pub upload_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_zeroed() {
        let stats = ProcessStats::default();
        assert_eq!(stats.download_bytes, 0);
        assert_eq!(stats.upload_bytes, 0);
        assert_eq!(stats.download_secs, 0.0);
        assert_eq!(stats.process_secs, 0.0);
        assert_eq!(stats.upload_secs, 0.0);
    }

    #[test]
    fn phases_accumulate() {
        let mut stats = ProcessStats::default();
        stats.download_secs += 0.5;
        stats.download_bytes += 1024;
        stats.process_secs += 2.0;
        stats.process_secs += 1.0;
        assert_eq!(stats.download_bytes, 1024);
        assert!((stats.process_secs - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn serde_roundtrip() {
        let stats = ProcessStats {
            download_secs: 0.25,
            download_bytes: 4096,
            process_secs: 1.5,
            upload_secs: 0.1,
            upload_bytes: 512,
        };
        let json = serde_json::to_string(&stats).unwrap();
        let back: ProcessStats = serde_json::from_str(&json).unwrap();
        assert_eq!(back, stats);
    }
}
