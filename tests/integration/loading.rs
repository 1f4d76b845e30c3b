//! Basic loading tests
//!
//! Single packages, duplicate requests, progress and statistics.

use std::sync::Arc;
use std::time::Duration;

use asyncload::runtime::io::CompletionMode;
use asyncload::runtime::object::ObjectFlags;
use asyncload::runtime::scheduler::{LoadResult, PackageRequest, TickState};

use crate::common::*;

/// A single package loads and its exports carry their payloads.
#[test]
fn test_single_package_loads() {
    let fs = memory_fs(CompletionMode::Immediate);
    insert_package(&fs, "/Game/Door", simple_package(&[("Door", b"oak"), ("Knob", b"brass")]));
    let loader = loader(&fs);
    let recorder = Recorder::new();

    let id = loader.request_load(recorder.request("/Game/Door")).unwrap();
    loader.flush(Some(id)).unwrap();

    assert!(loader.is_request_complete(id));
    let delivered = recorder.delivered();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].result, LoadResult::Succeeded);
    let package = delivered[0].object.as_ref().expect("package object on success");
    assert_eq!(package.path(), "/Game/Door");
    assert!(package.has_flags(ObjectFlags::LOAD_COMPLETED));

    assert_eq!(object_data(&loader, "/Game/Door.Door"), b"oak");
    assert_eq!(object_data(&loader, "/Game/Door.Knob"), b"brass");
    let knob = loader.store().find("/Game/Door.Knob").unwrap();
    assert!(!knob.has_flags(ObjectFlags::NEED_LOAD));
    assert!(!knob.has_flags(ObjectFlags::NEED_POST_LOAD));
}

/// Two requests for the same package share one loader and both callbacks fire.
#[test]
fn test_duplicate_requests_share_a_loader() {
    let fs = memory_fs(CompletionMode::Immediate);
    insert_package(&fs, "/Game/Door", simple_package(&[("Door", b"oak")]));
    let loader = loader(&fs);
    let recorder = Recorder::new();

    loader.request_load(recorder.request("/Game/Door")).unwrap();
    loader.request_load(recorder.request("/Game/Door")).unwrap();
    loader.flush(None).unwrap();

    assert_eq!(
        recorder.results(),
        vec![
            ("/Game/Door".to_string(), LoadResult::Succeeded),
            ("/Game/Door".to_string(), LoadResult::Succeeded),
        ]
    );
    assert_eq!(loader.stats().packages_created, 1);
    assert_eq!(fs.open_count("/Game/Door.upkg"), 1);
}

/// A request for a package already in flight joins it.
#[test]
fn test_request_joins_in_flight_package() {
    let fs = memory_fs(CompletionMode::Immediate);
    insert_package(&fs, "/Game/Door", simple_package(&[("Door", b"oak")]));
    let loader = loader(&fs);
    let recorder = Recorder::new();

    loader.request_load(recorder.request("/Game/Door")).unwrap();
    assert_eq!(loader.tick(true, false, Duration::ZERO, None).unwrap(), TickState::TimedOut);
    assert_eq!(loader.live_package_loaders(), 1);

    loader.request_load(recorder.request("/Game/Door")).unwrap();
    loader.flush(None).unwrap();

    assert_eq!(recorder.len(), 2);
    assert_eq!(loader.stats().packages_created, 1);
}

/// Loading a resident package again finishes without reading the file.
#[test]
fn test_resident_package_is_not_reread() {
    let fs = memory_fs(CompletionMode::Immediate);
    insert_package(&fs, "/Game/Door", simple_package(&[("Door", b"oak")]));
    let loader = loader(&fs);
    let recorder = Recorder::new();

    loader.request_load(recorder.request("/Game/Door")).unwrap();
    loader.flush(None).unwrap();
    loader.request_load(recorder.request("/Game/Door")).unwrap();
    loader.flush(None).unwrap();

    assert_eq!(recorder.len(), 2);
    assert!(recorder.delivered().iter().all(|d| d.result == LoadResult::Succeeded));
    assert_eq!(fs.open_count("/Game/Door.upkg"), 1);
}

/// A request can read a file under another name.
#[test]
fn test_name_to_load() {
    let fs = memory_fs(CompletionMode::Immediate);
    insert_package(&fs, "/Game/Door_Saved", simple_package(&[("Door", b"saved")]));
    let loader = loader(&fs);
    let recorder = Recorder::new();

    loader
        .request_load(recorder.request("/Game/Door").with_name_to_load("/Game/Door_Saved"))
        .unwrap();
    loader.flush(None).unwrap();

    assert_eq!(recorder.result_of("/Game/Door"), LoadResult::Succeeded);
    assert_eq!(object_data(&loader, "/Game/Door.Door"), b"saved");
}

/// Progress is unknown before and after loading, and the loader is idle once done.
#[test]
fn test_progress_and_counters() {
    let fs = memory_fs(CompletionMode::Manual);
    insert_package(&fs, "/Game/Door", simple_package(&[("Door", b"oak")]));
    let loader = loader(&fs);
    let recorder = Recorder::new();

    assert_eq!(loader.get_percent_complete("/Game/Door"), -1.0);
    assert!(!loader.is_loading());

    loader.request_load(recorder.request("/Game/Door")).unwrap();
    assert!(loader.is_loading());
    assert_eq!(loader.num_queued_packages(), 1);

    loader.tick(false, false, Duration::ZERO, None).unwrap();
    assert_eq!(loader.num_queued_packages(), 0);
    assert_eq!(loader.num_async_packages(), 1);
    assert!(fs.pending_reads() > 0);
    let percent = loader.get_percent_complete("/Game/Door");
    assert!(percent == -1.0 || (0.0..=100.0).contains(&percent));

    for _ in 0..1000 {
        fs.complete_pending();
        if loader.tick(false, false, Duration::ZERO, None).unwrap() == TickState::Complete {
            break;
        }
    }

    assert_eq!(recorder.result_of("/Game/Door"), LoadResult::Succeeded);
    assert_eq!(loader.get_percent_complete("/Game/Door"), -1.0);
    assert_eq!(loader.num_async_packages(), 0);
    assert_eq!(loader.live_package_loaders(), 0);
    assert!(!loader.is_loading());
}

/// Statistics count packages, events and reads.
#[test]
fn test_stats() {
    let fs = memory_fs(CompletionMode::Immediate);
    insert_package(&fs, "/Game/A", simple_package(&[("A", b"a")]));
    insert_package(&fs, "/Game/B", simple_package(&[("B", b"b")]));
    let loader = loader(&fs);
    let recorder = Recorder::new();

    loader.request_load(recorder.request("/Game/A")).unwrap();
    loader.request_load(recorder.request("/Game/B")).unwrap();
    loader.request_load(recorder.request("/Game/Missing")).unwrap();
    loader.flush(None).unwrap();

    let stats = loader.stats();
    assert_eq!(stats.packages_created, 3);
    assert_eq!(stats.packages_completed, 2);
    assert_eq!(stats.packages_failed, 1);
    assert_eq!(stats.packages_canceled, 0);
    assert!(stats.events_executed > 0);
    assert!(fs.bytes_served() > 0);
}

/// Time-sliced ticking reaches the same result as one flush.
#[test]
fn test_time_sliced_ticks() {
    let fs = memory_fs(CompletionMode::Immediate);
    for i in 0..8 {
        let name = format!("/Game/P{}", i);
        insert_package(&fs, &name, simple_package(&[("Data", name.as_bytes())]));
    }
    let loader = loader(&fs);
    let recorder = Recorder::new();
    for i in 0..8 {
        loader.request_load(recorder.request(&format!("/Game/P{}", i))).unwrap();
    }

    let ticks = tick_until_complete(&loader, Duration::ZERO, 10_000);

    assert!(ticks > 1);
    assert_eq!(recorder.len(), 8);
    for i in 0..8 {
        let name = format!("/Game/P{}", i);
        assert_eq!(recorder.result_of(&name), LoadResult::Succeeded);
        assert_eq!(object_data(&loader, &format!("{}.Data", name)), name.as_bytes());
    }
}

/// A callback may queue another load; it is picked up by the same flush.
#[test]
fn test_callback_requests_more_loads() {
    let fs = memory_fs(CompletionMode::Immediate);
    insert_package(&fs, "/Game/A", simple_package(&[("A", b"a")]));
    insert_package(&fs, "/Game/B", simple_package(&[("B", b"b")]));
    let loader = Arc::new(loader(&fs));
    let recorder = Recorder::new();

    let follow_up = recorder.request("/Game/B");
    let chained = Arc::clone(&loader);
    loader
        .request_load(PackageRequest::new("/Game/A").on_complete(move |_, _, result| {
            assert_eq!(result, LoadResult::Succeeded);
            chained.request_load(follow_up).unwrap();
        }))
        .unwrap();
    loader.flush(None).unwrap();

    assert_eq!(recorder.result_of("/Game/B"), LoadResult::Succeeded);
}
