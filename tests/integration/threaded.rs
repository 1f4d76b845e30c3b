//! Background loading thread tests

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use asyncload::runtime::format::{ExportSpec, PackageIndex, PackageWriter};
use asyncload::runtime::io::{CompletionMode, MemoryFileSystem};
use asyncload::runtime::scheduler::{LoadResult, PackageRequest, TickState};
use asyncload::LoaderConfig;
use parking_lot::Mutex;

use crate::common::*;

fn threaded_config() -> LoaderConfig {
    LoaderConfig {
        use_background_thread: true,
        ..LoaderConfig::default()
    }
}

/// Packages `/Game/T0` .. `/Game/T{count-1}`, each importing the one before.
fn insert_chain(
    fs: &MemoryFileSystem,
    count: usize,
) {
    for i in 0..count {
        let mut writer = PackageWriter::new();
        if i > 0 {
            let previous = writer.add_package_import(format!("/Game/T{}", i - 1));
            writer.add_object_import("/Script/Core", "Class", "Data", previous);
        }
        writer.add_export(ExportSpec::new("Data", PackageIndex::Null, vec![i as u8; 128]));
        insert_package(fs, &format!("/Game/T{}", i), writer.finish().unwrap());
    }
}

/// Flushing with a loading thread and threaded I/O loads a chain.
#[test]
fn test_threaded_flush() {
    let fs = memory_fs(CompletionMode::Threaded);
    insert_chain(&fs, 6);
    let loader = loader_with(&fs, threaded_config());
    assert!(loader.is_loading_multithreaded());
    let recorder = Recorder::new();

    let id = loader.request_load(recorder.request("/Game/T5")).unwrap();
    loader.flush(Some(id)).unwrap();

    assert_eq!(recorder.result_of("/Game/T5"), LoadResult::Succeeded);
    for i in 0..6 {
        assert_eq!(object_data(&loader, &format!("/Game/T{}.Data", i)), vec![i as u8; 128]);
    }
}

/// Requests may come from other threads; callbacks still run on the ticking thread.
#[test]
fn test_requests_from_other_threads() {
    let fs = memory_fs(CompletionMode::Threaded);
    insert_chain(&fs, 8);
    let loader = loader_with(&fs, threaded_config());
    let recorder = Recorder::new();
    let foreground = thread::current().id();
    let callback_threads = Arc::new(Mutex::new(Vec::new()));

    thread::scope(|scope| {
        for i in 0..8 {
            let loader = &loader;
            let recorder = &recorder;
            let callback_threads = Arc::clone(&callback_threads);
            scope.spawn(move || {
                let name = format!("/Game/T{}", i);
                loader.request_load(recorder.request(&name)).unwrap();
                loader
                    .request_load(PackageRequest::new(name).on_complete(move |_, _, _| {
                        callback_threads.lock().push(thread::current().id());
                    }))
                    .unwrap();
            });
        }
    });

    let mut ticks = 0;
    while loader.tick(true, false, Duration::from_millis(5), None).unwrap() != TickState::Complete {
        ticks += 1;
        assert!(ticks < 100_000, "threaded load did not finish");
        thread::sleep(Duration::from_millis(1));
    }

    assert_eq!(recorder.len(), 8);
    for i in 0..8 {
        assert_eq!(recorder.result_of(&format!("/Game/T{}", i)), LoadResult::Succeeded);
    }
    let threads = callback_threads.lock();
    assert_eq!(threads.len(), 8);
    assert!(threads.iter().all(|id| *id == foreground));
}

/// Foreground-only calls are refused from other threads.
#[test]
fn test_tick_only_on_foreground() {
    let fs = memory_fs(CompletionMode::Threaded);
    let loader = loader_with(&fs, threaded_config());

    thread::scope(|scope| {
        scope.spawn(|| {
            assert!(loader.tick(false, false, Duration::ZERO, None).is_err());
            assert!(loader.flush(None).is_err());
            assert!(loader.cancel_all().is_err());
        });
    });
}

/// Shutting down joins the loading thread and rejects new requests.
#[test]
fn test_shutdown_with_loading_thread() {
    let fs = memory_fs(CompletionMode::Threaded);
    insert_chain(&fs, 2);
    let mut loader = loader_with(&fs, threaded_config());
    let recorder = Recorder::new();
    loader.request_load(recorder.request("/Game/T1")).unwrap();
    loader.flush(None).unwrap();

    loader.shutdown();
    assert!(loader.request_load(recorder.request("/Game/T0")).is_err());
    assert_eq!(recorder.result_of("/Game/T1"), LoadResult::Succeeded);
}
