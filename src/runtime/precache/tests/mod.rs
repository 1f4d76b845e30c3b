//! 预缓存规划、节流与归档测试

use crate::runtime::error::LoadError;
use crate::runtime::format::{ExportSpec, PackageIndex, PackageWriter, PROLOGUE_SIZE};
use crate::runtime::io::{AsyncFileSystem, CompletionMode, MemoryFileSystem, ReadCallback};
use crate::runtime::precache::*;

fn span(index: u32, offset: u64, size: u64) -> ExportSpan {
    ExportSpan { index, offset, size }
}

fn never(_: u32) -> bool {
    false
}

fn not_resident(_: &ExportSpan) -> bool {
    false
}

fn noop() -> ReadCallback {
    Box::new(|_| {})
}

#[cfg(test)]
mod planner_tests {
    use super::*;

    #[test]
    fn test_adjacent_exports_coalesce() {
        let plan = plan_read(
            span(0, 100, 100),
            &[span(1, 210, 50)],
            &PrecacheLimits::default(),
            true,
            &never,
            &not_resident,
        );
        assert_eq!(plan.read.offset, 100);
        assert_eq!(plan.read.len, 160);
        assert_eq!(plan.read.exports, vec![0, 1]);
        assert_eq!(plan.merged, 1);
    }

    #[test]
    fn test_distant_exports_split() {
        let plan = plan_read(
            span(0, 100, 100),
            &[span(1, 100_000, 100)],
            &PrecacheLimits::default(),
            true,
            &never,
            &not_resident,
        );
        assert_eq!(plan.read.len, 100);
        assert_eq!(plan.merged, 0);
    }

    #[test]
    fn test_block_cap() {
        let limits = PrecacheLimits {
            max_block: 150,
            ..Default::default()
        };
        let plan = plan_read(span(0, 0, 100), &[span(1, 100, 100)], &limits, true, &never, &not_resident);
        assert_eq!(plan.merged, 0);
    }

    #[test]
    fn test_export_count_cap() {
        let limits = PrecacheLimits {
            max_exports: 2,
            ..Default::default()
        };
        let following: Vec<_> = (1..10).map(|i| span(i, i as u64 * 10, 10)).collect();
        let plan = plan_read(span(0, 0, 10), &following, &limits, true, &never, &not_resident);
        assert_eq!(plan.read.exports, vec![0, 1, 2]);
    }

    #[test]
    fn test_covered_export_between_stops_merge() {
        let covered = |i: u32| i == 1;
        let plan = plan_read(
            span(0, 0, 10),
            &[span(2, 20, 10)],
            &PrecacheLimits::default(),
            true,
            &covered,
            &not_resident,
        );
        assert_eq!(plan.merged, 0);
    }

    #[test]
    fn test_resident_export_is_released() {
        let resident = |s: &ExportSpan| s.index == 1;
        let plan = plan_read(
            span(0, 0, 10),
            &[span(1, 10, 10)],
            &PrecacheLimits::default(),
            true,
            &never,
            &resident,
        );
        assert_eq!(plan.resident, Some(1));
        assert_eq!(plan.merged, 0);
    }

    #[test]
    fn test_no_coalescing_when_disabled() {
        let plan = plan_read(
            span(0, 100, 100),
            &[span(1, 200, 50)],
            &PrecacheLimits::default(),
            false,
            &never,
            &not_resident,
        );
        assert_eq!(plan.merged, 0);
    }
}

#[cfg(test)]
mod throttle_tests {
    use super::*;

    #[test]
    fn test_pause_and_resume() {
        let throttle = IoThrottle::new(100, 100);
        assert!(throttle.accepting());
        assert_eq!(throttle.request_ready(60), None);
        assert_eq!(throttle.request_ready(60), Some(ThrottleChange::Paused));
        assert!(!throttle.accepting());
        assert_eq!(throttle.finish_request(10), None);
        assert!(!throttle.accepting());
        assert_eq!(throttle.finish_request(20), Some(ThrottleChange::Resumed));
        assert!(throttle.accepting());
        assert_eq!(throttle.unprocessed(), 90);
    }

    #[test]
    fn test_incoming_backlog_pauses() {
        let throttle = IoThrottle::new(100, 4);
        assert_eq!(throttle.note_incoming_backlog(4), None);
        assert_eq!(throttle.note_incoming_backlog(5), Some(ThrottleChange::Paused));
        assert_eq!(throttle.update(), Some(ThrottleChange::Resumed));
    }

    #[test]
    fn test_finish_never_underflows() {
        let throttle = IoThrottle::new(0, 100);
        throttle.finish_request(50);
        assert_eq!(throttle.unprocessed(), 0);
    }
}

#[cfg(test)]
mod archive_tests {
    use super::*;

    fn package(payload: usize, imports: usize) -> Vec<u8> {
        let mut writer = PackageWriter::new();
        for i in 0..imports {
            writer.add_package_import(format!("/Game/Imported/Package_With_A_Long_Name_{}", i));
        }
        writer.add_export(ExportSpec::new("Only", PackageIndex::Null, vec![5u8; payload]));
        writer.finish().unwrap()
    }

    fn open(fs: &MemoryFileSystem, path: &str, limits: SummaryLimits) -> PrecacheArchive {
        PrecacheArchive::open(fs.open_async_read(path), limits, noop())
    }

    #[test]
    fn test_summary_ready_in_one_read() {
        let fs = MemoryFileSystem::new(CompletionMode::Immediate);
        fs.insert("/Game/A.upkg", package(64, 1));
        let mut archive = open(&fs, "/Game/A.upkg", SummaryLimits::default());
        assert_eq!(archive.poll_summary(&mut noop), SummaryPoll::Ready);
        assert_eq!(archive.phase(), ArchivePhase::WaitingForFirstExport);
        assert!(archive.header_bytes().is_some());
        assert_eq!(fs.reads_issued(), 1);
    }

    #[test]
    fn test_large_header_reads_only_tail() {
        let fs = MemoryFileSystem::new(CompletionMode::Immediate);
        let bytes = package(16, 40);
        fs.insert("/Game/A.upkg", bytes.clone());
        let limits = SummaryLimits {
            max_summary: 64,
            min_summary: 16,
            ..Default::default()
        };
        let mut archive = open(&fs, "/Game/A.upkg", limits);
        assert_eq!(archive.poll_summary(&mut noop), SummaryPoll::Ready);
        assert_eq!(fs.reads_issued(), 2);
        let header_size = archive.header_size().unwrap() as usize;
        assert_eq!(fs.bytes_served() as usize, header_size);
        assert_eq!(archive.header_bytes().unwrap(), &bytes[PROLOGUE_SIZE..header_size]);
    }

    #[test]
    fn test_header_limit() {
        let fs = MemoryFileSystem::new(CompletionMode::Immediate);
        fs.insert("/Game/A.upkg", package(16, 40));
        let limits = SummaryLimits {
            max_header: 32,
            ..Default::default()
        };
        let mut archive = open(&fs, "/Game/A.upkg", limits);
        assert!(matches!(
            archive.poll_summary(&mut noop),
            SummaryPoll::Failed(LoadError::HeaderTooLarge { .. })
        ));
    }

    #[test]
    fn test_missing_file() {
        let fs = MemoryFileSystem::new(CompletionMode::Immediate);
        let mut archive = open(&fs, "/Game/Missing.upkg", SummaryLimits::default());
        assert!(matches!(
            archive.poll_summary(&mut noop),
            SummaryPoll::Failed(LoadError::FileNotFound { .. })
        ));
    }

    #[test]
    fn test_manual_completion_stays_pending() {
        let fs = MemoryFileSystem::new(CompletionMode::Manual);
        fs.insert("/Game/A.upkg", package(16, 0));
        let mut archive = open(&fs, "/Game/A.upkg", SummaryLimits::default());
        assert_eq!(archive.poll_summary(&mut noop), SummaryPoll::Pending);
        fs.complete_pending();
        assert_eq!(archive.poll_summary(&mut noop), SummaryPoll::Pending);
        assert_eq!(archive.phase(), ArchivePhase::WaitingForSummary);
        fs.complete_pending();
        assert_eq!(archive.poll_summary(&mut noop), SummaryPoll::Ready);
    }

    #[test]
    fn test_block_window() {
        let fs = MemoryFileSystem::new(CompletionMode::Immediate);
        fs.insert("/Game/A.upkg", package(16, 0));
        let mut archive = open(&fs, "/Game/A.upkg", SummaryLimits::default());
        archive.poll_summary(&mut noop);
        archive.adopt_block(1000, vec![1, 2, 3, 4]);
        assert_eq!(archive.phase(), ArchivePhase::ProcessingExports);
        assert_eq!(archive.slice(1001, 2), Some(&[2u8, 3][..]));
        assert!(archive.slice(1003, 2).is_none());
        archive.flush_block();
        assert_eq!(archive.window_len(), 0);
    }

    #[test]
    fn test_blocking_read_fallback() {
        let fs = MemoryFileSystem::new(CompletionMode::Immediate);
        let bytes = package(16, 0);
        fs.insert("/Game/A.upkg", bytes.clone());
        let mut archive = open(&fs, "/Game/A.upkg", SummaryLimits::default());
        archive.poll_summary(&mut noop);
        archive.flush_block();
        let end = bytes.len() as u64;
        let got = archive.read_blocking(end - 16, 16).unwrap().to_vec();
        assert_eq!(got, vec![5u8; 16]);
    }

    #[test]
    fn test_blocking_read_reuses_block_prefix() {
        let fs = MemoryFileSystem::new(CompletionMode::Immediate);
        let bytes: Vec<u8> = (0..40_100u32).map(|i| (i % 251) as u8).collect();
        fs.insert("/Game/A.upkg", bytes.clone());
        let mut archive = open(&fs, "/Game/A.upkg", SummaryLimits::default());
        archive.adopt_block(0, bytes[..16_384].to_vec());
        let served = fs.bytes_served();

        let got = archive.read_blocking(35, 40_000).unwrap().to_vec();
        assert_eq!(got, &bytes[35..40_035]);
        assert_eq!(fs.bytes_served() - served, 40_035 - 16_384);
    }

    #[test]
    fn test_blocking_read_fills_head_and_tail() {
        let fs = MemoryFileSystem::new(CompletionMode::Immediate);
        let bytes: Vec<u8> = (0..1_000u32).map(|i| (i % 251) as u8).collect();
        fs.insert("/Game/A.upkg", bytes.clone());
        let mut archive = open(&fs, "/Game/A.upkg", SummaryLimits::default());
        archive.adopt_block(100, bytes[100..200].to_vec());
        let served = fs.bytes_served();

        let got = archive.read_blocking(50, 250).unwrap().to_vec();
        assert_eq!(got, &bytes[50..300]);
        assert_eq!(fs.bytes_served() - served, 50 + 100);
        assert_eq!(archive.block_range(), (50, 250));
    }
}
