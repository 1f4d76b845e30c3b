//! 包加载器单元测试
//!
//! 覆盖包表的检出与弱引用、活动列表排序、就绪集合以及完成与取消

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::ready::{pop, ReadySets};
use super::*;
use crate::runtime::error::LoadError;
use crate::runtime::object::{ObjectDesc, ObjectFlags, ObjectStore};
use crate::runtime::scheduler::incoming::IoRegistry;
use crate::runtime::scheduler::queue::LoadOrder;
use crate::runtime::scheduler::request::LoadResult;

fn counter() -> Arc<AtomicUsize> {
    Arc::new(AtomicUsize::new(0))
}

fn insert(
    table: &mut PackageTable,
    live: &Arc<AtomicUsize>,
    name: &str,
) -> WeakPackageRef {
    let weak = table.insert_with(|weak| PackageLoader::new(weak, PackageDesc::new(name), None, LiveToken::new(live)));
    table.register_name(name, weak);
    weak
}

#[cfg(test)]
mod table_tests {
    use super::*;

    #[test]
    fn test_insert_and_lookup() {
        let live = counter();
        let mut table = PackageTable::new();
        let a = insert(&mut table, &live, "/Game/A");
        let b = insert(&mut table, &live, "/Game/B");
        assert_eq!(table.len(), 2);
        assert_ne!(a, b);
        assert_eq!(table.find_by_name("/Game/A"), Some(a));
        assert_eq!(table.get(b).map(|p| p.name()), Some("/Game/B"));
        assert_eq!(live.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_removed_handle_goes_stale() {
        let live = counter();
        let mut table = PackageTable::new();
        let a = insert(&mut table, &live, "/Game/A");
        let removed = table.remove(a);
        assert!(removed.is_some());
        drop(removed);
        assert_eq!(live.load(Ordering::SeqCst), 0);
        assert!(table.find_by_name("/Game/A").is_none());

        // The slot is reused under a new serial.
        let b = insert(&mut table, &live, "/Game/B");
        assert_eq!(b.slot(), a.slot());
        assert_ne!(b.serial(), a.serial());
        assert!(table.get(a).is_none());
        assert!(!table.contains(a));
        assert!(matches!(table.check_out(a), Err(FatalError::StalePackage { .. })));
    }

    #[test]
    fn test_check_out_is_exclusive() {
        let live = counter();
        let mut table = PackageTable::new();
        let a = insert(&mut table, &live, "/Game/A");
        let loader = table.check_out(a).unwrap();
        assert!(table.get(a).is_none());
        assert!(table.contains(a));
        match table.check_out(a) {
            Err(FatalError::Reentrant { package }) => assert_eq!(package, "/Game/A"),
            other => panic!("expected reentrant error, got {:?}", other.map(|l| l.weak())),
        }
        table.check_in(loader);
        assert!(table.get(a).is_some());
    }

    #[test]
    fn test_release_name_keeps_newer_registration() {
        let live = counter();
        let mut table = PackageTable::new();
        let a = insert(&mut table, &live, "/Game/A");
        let b = insert(&mut table, &live, "/Game/A");
        table.release_name("/Game/A", a);
        assert_eq!(table.find_by_name("/Game/A"), Some(b));
    }

    #[test]
    fn test_active_list_orders_by_priority() {
        let live = counter();
        let mut table = PackageTable::new();
        let low = insert(&mut table, &live, "/Game/Low");
        let high = insert(&mut table, &live, "/Game/High");
        let mid = insert(&mut table, &live, "/Game/Mid");
        table.activate(low, 0);
        table.activate(high, 10);
        table.activate(mid, 5);
        assert_eq!(table.active().collect::<Vec<_>>(), vec![high, mid, low]);

        // Re-activating moves an entry instead of duplicating it.
        table.activate(low, 20);
        assert_eq!(table.active().collect::<Vec<_>>(), vec![low, high, mid]);
        table.deactivate(high);
        assert_eq!(table.active_len(), 2);
        assert!(!table.is_active(high));
    }

    #[test]
    fn test_equal_priority_keeps_arrival_order() {
        let live = counter();
        let mut table = PackageTable::new();
        let first = insert(&mut table, &live, "/Game/First");
        let second = insert(&mut table, &live, "/Game/Second");
        table.activate(first, 1);
        table.activate(second, 1);
        assert_eq!(table.active().collect::<Vec<_>>(), vec![first, second]);
    }
}

#[cfg(test)]
mod ready_tests {
    use super::*;

    #[test]
    fn test_pop_takes_lowest_index_in_order() {
        let mut set: BTreeSet<u32> = [4, 1, 9].into_iter().collect();
        let mut order = LoadOrder::deterministic();
        assert_eq!(pop(&mut set, &mut order), Some(1));
        assert_eq!(pop(&mut set, &mut order), Some(4));
        assert_eq!(pop(&mut set, &mut order), Some(9));
        assert_eq!(pop(&mut set, &mut order), None);
    }

    #[test]
    fn test_randomized_pop_drains_everything() {
        let mut set: BTreeSet<u32> = (0..32).collect();
        let mut order = LoadOrder::randomized(7);
        let mut seen = BTreeSet::new();
        while let Some(index) = pop(&mut set, &mut order) {
            assert!(seen.insert(index));
        }
        assert_eq!(seen.len(), 32);
    }

    #[test]
    fn test_io_alone_is_not_work() {
        let mut ready = ReadySets::default();
        ready.exports_io_startable.insert(0);
        assert!(!ready.any_work());
        ready.exports_serializable.insert(0);
        assert!(ready.any_work());
        ready.clear();
        assert!(!ready.any_work());
        assert!(ready.exports_io_startable.is_empty());
    }
}

#[cfg(test)]
mod loader_tests {
    use super::*;

    fn loader(name: &str) -> PackageLoader {
        let live = counter();
        PackageLoader::new(WeakPackageRef::new(0, 1), PackageDesc::new(name), None, LiveToken::new(&live))
    }

    #[test]
    fn test_new_loader_state() {
        let package = loader("/Game/A");
        assert_eq!(package.state(), PackageState::NewPackage);
        assert_eq!(package.desc().name_to_load, "/Game/A");
        assert_eq!(package.load_percentage(), 0.0);
        assert!(!package.failed());
        assert_eq!(package.import_count(), 0);
    }

    #[test]
    fn test_priority_only_rises() {
        let mut package = loader("/Game/A");
        assert!(package.raise_priority(5));
        assert!(!package.raise_priority(3));
        assert_eq!(package.priority(), 5);
    }

    #[test]
    fn test_dependency_refs_never_underflow() {
        let mut package = loader("/Game/A");
        package.add_dependency_ref();
        package.release_dependency_ref();
        package.release_dependency_ref();
        assert_eq!(package.dependency_refs(), 0);
    }

    #[test]
    fn test_complete_reports_success_and_marks_package() {
        let store = ObjectStore::new();
        let object = {
            let guard = store.gc_guard();
            store.register(&guard, ObjectDesc::new("/Game/A", ObjectFlags::PACKAGE | ObjectFlags::NEED_LOAD))
        };
        let mut package = loader("/Game/A");
        package.package_object = Some(object.clone());
        package.add_request(RequestId(1), None);

        let completion = package.complete(false);
        assert_eq!(completion.result, LoadResult::Succeeded);
        assert_eq!(completion.request_ids, vec![RequestId(1)]);
        assert!(completion.object.is_some());
        assert!(object.has_flags(ObjectFlags::LOAD_COMPLETED));
        assert!(!object.has_flags(ObjectFlags::NEED_LOAD));
        assert_eq!(package.state(), PackageState::Complete);
    }

    #[test]
    fn test_complete_after_failure_reports_no_object() {
        let store = ObjectStore::new();
        let object = {
            let guard = store.gc_guard();
            store.register(&guard, ObjectDesc::new("/Game/A", ObjectFlags::PACKAGE | ObjectFlags::NEED_LOAD))
        };
        let mut package = loader("/Game/A");
        package.package_object = Some(object.clone());
        package.failure = Some(LoadError::NoExports);

        let completion = package.complete(false);
        assert_eq!(completion.result, LoadResult::Failed);
        assert!(completion.object.is_none());
        assert!(object.has_flags(ObjectFlags::LOAD_FAILED));
        assert!(!object.has_flags(ObjectFlags::NEED_LOAD));
    }

    #[test]
    fn test_cancel_fails_unfinished_exports() {
        let store = ObjectStore::new();
        let export = {
            let guard = store.gc_guard();
            store.register(&guard, ObjectDesc::new("/Game/A.Thing", ObjectFlags::NEED_LOAD | ObjectFlags::NEED_POST_LOAD))
        };
        let mut package = loader("/Game/A");
        package.exports.push(ExportSlot {
            path: "/Game/A.Thing".to_string(),
            object: Some(export.clone()),
            failed: false,
        });
        let mut io = IoRegistry::new();
        io.waiting_summaries.insert(package.weak());

        assert_eq!(package.cancel(&mut io), 0);
        assert!(!io.any_outstanding());
        assert!(export.has_flags(ObjectFlags::LOAD_FAILED));
        assert!(!export.has_flags(ObjectFlags::NEED_POST_LOAD));
        assert_eq!(package.complete(true).result, LoadResult::Canceled);
    }
}
