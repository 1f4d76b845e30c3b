//! Package failure tests
//!
//! Missing files, malformed headers and guid checks all end in a
//! `Failed` callback without disturbing other packages.

use asyncload::runtime::format::{ExportSpec, PackageIndex, PackageWriter, MIN_FILE_VERSION};
use asyncload::runtime::io::CompletionMode;
use asyncload::runtime::object::ObjectFlags;
use asyncload::runtime::scheduler::{LoadFlags, LoadResult};
use asyncload::LoaderConfig;

use crate::common::*;

fn door() -> Vec<u8> {
    simple_package(&[("Door", b"oak")])
}

/// A missing file fails the request with no object.
#[test]
fn test_missing_file_fails() {
    let fs = memory_fs(CompletionMode::Immediate);
    let loader = loader(&fs);
    let recorder = Recorder::new();

    let id = loader.request_load(recorder.request("/Game/Nowhere")).unwrap();
    loader.flush(Some(id)).unwrap();

    let delivered = recorder.delivered();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].result, LoadResult::Failed);
    assert!(delivered[0].object.is_none());
    assert_eq!(loader.live_package_loaders(), 0);
}

/// Once a file is known to be missing it is not opened again.
#[test]
fn test_known_missing_is_not_reopened() {
    let fs = memory_fs(CompletionMode::Immediate);
    let loader = loader(&fs);
    let recorder = Recorder::new();

    loader.request_load(recorder.request("/Game/Nowhere")).unwrap();
    loader.flush(None).unwrap();
    loader
        .request_load(recorder.request("/Game/Nowhere").with_flags(LoadFlags::QUIET))
        .unwrap();
    loader.flush(None).unwrap();

    assert_eq!(
        recorder.results(),
        vec![
            ("/Game/Nowhere".to_string(), LoadResult::Failed),
            ("/Game/Nowhere".to_string(), LoadResult::Failed),
        ]
    );
    assert_eq!(fs.open_count("/Game/Nowhere.upkg"), 1);
}

/// A failing package does not affect others loading beside it.
#[test]
fn test_failure_is_isolated() {
    let fs = memory_fs(CompletionMode::Immediate);
    insert_package(&fs, "/Game/Door", door());
    let mut broken = door();
    broken[0] ^= 0xFF;
    insert_package(&fs, "/Game/Broken", broken);
    let loader = loader(&fs);
    let recorder = Recorder::new();

    loader.request_load(recorder.request("/Game/Broken")).unwrap();
    loader.request_load(recorder.request("/Game/Door")).unwrap();
    loader.flush(None).unwrap();

    assert_eq!(recorder.result_of("/Game/Broken"), LoadResult::Failed);
    assert_eq!(recorder.result_of("/Game/Door"), LoadResult::Succeeded);
    assert_eq!(object_data(&loader, "/Game/Door.Door"), b"oak");
}

/// A file without the package magic fails.
#[test]
fn test_bad_magic() {
    let fs = memory_fs(CompletionMode::Immediate);
    let mut bytes = door();
    bytes[..4].copy_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
    insert_package(&fs, "/Game/Door", bytes);
    let loader = loader(&fs);
    let recorder = Recorder::new();

    loader.request_load(recorder.request("/Game/Door")).unwrap();
    loader.flush(None).unwrap();

    assert_eq!(recorder.result_of("/Game/Door"), LoadResult::Failed);
    let package = loader.store().find("/Game/Door");
    assert!(package.map_or(true, |p| !p.has_flags(ObjectFlags::LOAD_COMPLETED)));
}

/// Files older than the oldest supported version fail.
#[test]
fn test_version_too_old() {
    let fs = memory_fs(CompletionMode::Immediate);
    let mut writer = PackageWriter::new().with_version(MIN_FILE_VERSION - 1);
    writer.add_export(ExportSpec::new("Door", PackageIndex::Null, b"oak".to_vec()));
    insert_package(&fs, "/Game/Door", writer.finish().unwrap());
    let loader = loader(&fs);
    let recorder = Recorder::new();

    loader.request_load(recorder.request("/Game/Door")).unwrap();
    loader.flush(None).unwrap();

    assert_eq!(recorder.result_of("/Game/Door"), LoadResult::Failed);
    assert!(loader.store().find("/Game/Door.Door").is_none());
}

/// A header larger than the configured limit fails before it is read.
#[test]
fn test_header_too_large() {
    let fs = memory_fs(CompletionMode::Immediate);
    let mut writer = PackageWriter::new();
    for i in 0..64 {
        writer.add_export(ExportSpec::new(format!("Export{}", i), PackageIndex::Null, vec![i as u8; 8]));
    }
    insert_package(&fs, "/Game/Big", writer.finish().unwrap());
    let config = LoaderConfig {
        max_header_size: 64,
        ..LoaderConfig::default()
    };
    let loader = loader_with(&fs, config);
    let recorder = Recorder::new();

    loader.request_load(recorder.request("/Game/Big")).unwrap();
    loader.flush(None).unwrap();

    assert_eq!(recorder.result_of("/Game/Big"), LoadResult::Failed);
}

/// A truncated file fails instead of reading past its end.
#[test]
fn test_truncated_file() {
    let fs = memory_fs(CompletionMode::Immediate);
    let bytes = door();
    insert_package(&fs, "/Game/Door", bytes[..bytes.len() / 2].to_vec());
    let loader = loader(&fs);
    let recorder = Recorder::new();

    loader.request_load(recorder.request("/Game/Door")).unwrap();
    loader.flush(None).unwrap();

    assert_eq!(recorder.result_of("/Game/Door"), LoadResult::Failed);
}

/// The guid in the request must match the file.
#[test]
fn test_guid_mismatch() {
    let fs = memory_fs(CompletionMode::Immediate);
    let mut writer = PackageWriter::new().with_guid(7);
    writer.add_export(ExportSpec::new("Door", PackageIndex::Null, b"oak".to_vec()));
    insert_package(&fs, "/Game/Door", writer.finish().unwrap());
    let loader = loader(&fs);
    let recorder = Recorder::new();

    loader.request_load(recorder.request("/Game/Door").with_guid(8)).unwrap();
    loader.flush(None).unwrap();
    assert_eq!(recorder.result_of("/Game/Door"), LoadResult::Failed);

    let matching = Recorder::new();
    loader.request_load(matching.request("/Game/Door").with_guid(7)).unwrap();
    loader.flush(None).unwrap();
    assert_eq!(matching.result_of("/Game/Door"), LoadResult::Succeeded);
}

/// Invalid names are rejected when the request is made.
#[test]
fn test_invalid_names_rejected() {
    let fs = memory_fs(CompletionMode::Immediate);
    let loader = loader(&fs);

    assert!(loader.request_load(asyncload::PackageRequest::new("")).is_err());
    assert!(loader.request_load(asyncload::PackageRequest::new("Game/Door")).is_err());
    assert!(!loader.is_loading());
}
