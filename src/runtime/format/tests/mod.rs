//! 包文件格式单元测试
//!
//! 覆盖序言校验、表解码与预加载依赖的切分

use crate::runtime::error::LoadError;
use crate::runtime::format::*;

fn two_export_package() -> Vec<u8> {
    let mut writer = PackageWriter::new().with_guid(7);
    let engine = writer.add_package_import("/Script/Engine");
    let class = writer.add_object_import("/Script/Core", "Class", "Actor", engine);
    let first = writer.add_export(ExportSpec::new("Door", class, vec![1u8; 40]));
    writer.add_export(
        ExportSpec::new("Frame", class, vec![2u8; 24])
            .with_outer(first)
            .with_gap(8)
            .serialize_before_create(first)
            .create_before_create(class),
    );
    writer.finish().unwrap()
}

#[cfg(test)]
mod prologue_tests {
    use super::*;

    #[test]
    fn test_prologue_parse_roundtrip() {
        let bytes = two_export_package();
        let prologue = Prologue::parse(&bytes).unwrap();
        assert_eq!(prologue.magic, PACKAGE_MAGIC);
        assert_eq!(prologue.version, CURRENT_FILE_VERSION);
        assert!(prologue.header_size as usize > PROLOGUE_SIZE);
    }

    #[test]
    fn test_prologue_rejects_bad_magic() {
        let mut bytes = two_export_package();
        bytes[0] ^= 0xFF;
        assert!(matches!(Prologue::parse(&bytes), Err(LoadError::BadMagic { .. })));
    }

    #[test]
    fn test_prologue_rejects_version_window() {
        let mut old = PackageWriter::new().with_version(MIN_FILE_VERSION - 1);
        old.add_export(ExportSpec::new("A", PackageIndex::Null, vec![0]));
        let bytes = old.finish().unwrap();
        assert!(matches!(Prologue::parse(&bytes), Err(LoadError::VersionTooOld { .. })));

        let mut new = PackageWriter::new().with_version(CURRENT_FILE_VERSION + 1);
        new.add_export(ExportSpec::new("A", PackageIndex::Null, vec![0]));
        let bytes = new.finish().unwrap();
        assert!(matches!(Prologue::parse(&bytes), Err(LoadError::VersionTooNew { .. })));
    }

    #[test]
    fn test_prologue_truncated() {
        assert!(matches!(
            Prologue::parse(&[0xC1, 0x83]),
            Err(LoadError::Truncated { needed: 12, available: 2 })
        ));
    }
}

#[cfg(test)]
mod header_tests {
    use super::*;

    fn decode(bytes: &[u8]) -> (Prologue, PackageHeader) {
        let prologue = Prologue::parse(bytes).unwrap();
        let header = PackageHeader::decode(&bytes[PROLOGUE_SIZE..prologue.header_size as usize]).unwrap();
        (prologue, header)
    }

    #[test]
    fn test_header_decode_tables() {
        let bytes = two_export_package();
        let (prologue, header) = decode(&bytes);
        assert_eq!(header.guid, 7);
        assert_eq!(header.imports.len(), 2);
        assert_eq!(header.exports.len(), 2);
        header
            .validate(prologue.header_size as u64, bytes.len() as u64)
            .unwrap();
    }

    #[test]
    fn test_export_payloads_are_located() {
        let bytes = two_export_package();
        let (prologue, header) = decode(&bytes);
        let first = &header.exports[0];
        let second = &header.exports[1];
        assert_eq!(first.serial_offset, prologue.header_size as u64);
        assert_eq!(second.serial_offset, first.serial_end().unwrap() + 8);
        let payload = &bytes[second.serial_offset as usize..second.serial_end().unwrap() as usize];
        assert!(payload.iter().all(|b| *b == 2));
    }

    #[test]
    fn test_preload_dependency_split() {
        let bytes = two_export_package();
        let (_, header) = decode(&bytes);
        let none = header.preload_dependencies(0);
        assert!(none.serialize_before_create.is_empty());
        let deps = header.preload_dependencies(1);
        assert!(deps.serialize_before_serialize.is_empty());
        assert!(deps.create_before_serialize.is_empty());
        assert_eq!(deps.serialize_before_create, &[PackageIndex::Export(0)]);
        assert_eq!(deps.create_before_create, &[PackageIndex::Import(1)]);
    }

    #[test]
    fn test_paths() {
        let bytes = two_export_package();
        let (_, header) = decode(&bytes);
        assert_eq!(header.import_path(1), "/Script/Engine.Actor");
        assert_eq!(header.import_relative_path(1), "Actor");
        assert_eq!(header.outermost_import(1), 0);
        assert_eq!(header.export_relative_path(1), "Door.Frame");
    }

    #[test]
    fn test_validate_rejects_out_of_range_dependency() {
        let bytes = two_export_package();
        let (prologue, mut header) = decode(&bytes);
        header.preload_dependencies[0] = PackageIndex::Export(9);
        let err = header
            .validate(prologue.header_size as u64, bytes.len() as u64)
            .unwrap_err();
        assert!(matches!(err, LoadError::CorruptTables { .. }));
    }

    #[test]
    fn test_validate_rejects_payload_past_end() {
        let bytes = two_export_package();
        let (prologue, header) = decode(&bytes);
        let err = header
            .validate(prologue.header_size as u64, bytes.len() as u64 - 1)
            .unwrap_err();
        assert!(matches!(err, LoadError::Truncated { .. }));
    }

    #[test]
    fn test_validate_rejects_overflowing_payload_range() {
        let bytes = two_export_package();
        let (prologue, mut header) = decode(&bytes);
        header.exports[1].serial_offset = u64::MAX - 4;
        header.exports[1].serial_size = 16;
        assert_eq!(header.exports[1].serial_end(), None);
        let err = header
            .validate(prologue.header_size as u64, bytes.len() as u64)
            .unwrap_err();
        assert!(matches!(err, LoadError::CorruptTables { .. }));
    }

    #[test]
    fn test_validate_rejects_huge_dependency_run() {
        let bytes = two_export_package();
        let (prologue, mut header) = decode(&bytes);
        header.exports[1].first_dependency = i32::MAX;
        header.exports[1].create_before_create = u32::MAX;
        let err = header
            .validate(prologue.header_size as u64, bytes.len() as u64)
            .unwrap_err();
        assert!(matches!(err, LoadError::CorruptTables { .. }));
    }

    #[test]
    fn test_validate_rejects_empty_package() {
        let header = PackageHeader::default();
        assert_eq!(header.validate(12, 12), Err(LoadError::NoExports));
    }

    #[test]
    fn test_garbage_tables_are_corrupt() {
        let garbage = [0xFFu8; 32];
        assert!(matches!(
            PackageHeader::decode(&garbage),
            Err(LoadError::CorruptTables { .. })
        ));
    }
}
