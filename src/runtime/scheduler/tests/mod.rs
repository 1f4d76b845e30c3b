//! Scheduler 单元测试
//!
//! 测试事件队列排序、请求校验与排队、I/O 收件箱、共享状态和加载器门面

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use quickcheck::quickcheck;

use crate::runtime::boot::{BootNotificationManager, NoBootstrap};
use crate::runtime::error::{LoaderError, RequestError};
use crate::runtime::io::{CompletionMode, MemoryFileSystem};
use crate::runtime::object::DefaultSerializer;
use crate::runtime::object::ObjectStore;
use crate::runtime::package::WeakPackageRef;
use crate::runtime::scheduler::{
    AsyncLoader, Event, EventKind, EventQueue, IncomingQueue, IoCompletion, LoadFlags, LoadOrder, PackageRequest,
    ReadToken, RequestId, RequestQueue, Shared, TickState, TimeBudget, TraceHeartbeat,
};
use crate::util::config::LoaderConfig;

fn pkg(slot: u32) -> WeakPackageRef {
    WeakPackageRef::new(slot, slot as u64 + 1)
}

fn shared() -> Shared {
    Shared::new(
        LoaderConfig::default(),
        Arc::new(MemoryFileSystem::new(CompletionMode::Immediate)),
        Arc::new(ObjectStore::new()),
        Arc::new(DefaultSerializer),
        BootNotificationManager::new(Arc::new(NoBootstrap)),
        Arc::new(TraceHeartbeat),
    )
}

fn loader() -> AsyncLoader {
    AsyncLoader::builder()
        .file_system(Arc::new(MemoryFileSystem::new(CompletionMode::Immediate)))
        .build()
        .unwrap()
}

#[cfg(test)]
mod event_queue_tests {
    use super::*;

    fn event(
        slot: u32,
        kind: EventKind,
    ) -> Event {
        Event { package: pkg(slot), kind }
    }

    #[test]
    fn test_package_priority_wins() {
        let mut queue = EventQueue::new();
        queue.push(event(0, EventKind::SetupImports), 0, 0, 1);
        queue.push(event(1, EventKind::SetupImports), 5, 0, 2);
        assert_eq!(queue.pop().map(|e| e.package), Some(pkg(1)));
        assert_eq!(queue.pop().map(|e| e.package), Some(pkg(0)));
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_system_priority_breaks_ties() {
        let mut queue = EventQueue::new();
        queue.push(event(0, EventKind::ProcessImportsAndExports), 0, -1, 1);
        queue.push(event(0, EventKind::CreateLinker), 0, i32::MAX, 1);
        queue.push(event(0, EventKind::SetupExports), 0, 0, 1);
        let kinds: Vec<_> = std::iter::from_fn(|| queue.pop()).map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![EventKind::CreateLinker, EventKind::SetupExports, EventKind::ProcessImportsAndExports]
        );
    }

    #[test]
    fn test_older_package_first_then_insertion_order() {
        let mut queue = EventQueue::new();
        queue.push(event(1, EventKind::SetupImports), 0, 0, 7);
        queue.push(event(0, EventKind::SetupImports), 0, 0, 3);
        queue.push(event(0, EventKind::SetupExports), 0, 0, 3);
        assert_eq!(queue.pop(), Some(event(0, EventKind::SetupImports)));
        assert_eq!(queue.pop(), Some(event(0, EventKind::SetupExports)));
        assert_eq!(queue.pop(), Some(event(1, EventKind::SetupImports)));
    }

    #[test]
    fn test_remove_package_drops_only_its_events() {
        let mut queue = EventQueue::new();
        let mut order = LoadOrder::deterministic();
        queue.schedule(&mut order, pkg(0), 0, EventKind::SetupImports, 0);
        queue.schedule(&mut order, pkg(1), 0, EventKind::SetupImports, 0);
        queue.schedule(&mut order, pkg(0), 0, EventKind::SetupExports, 0);
        queue.remove_package(pkg(0));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop().map(|e| e.package), Some(pkg(1)));
    }

    #[test]
    fn test_randomized_order_is_reproducible() {
        let mut a = LoadOrder::randomized(42);
        let mut b = LoadOrder::randomized(42);
        let left: Vec<_> = (0..16).map(|_| a.pick(10)).collect();
        let right: Vec<_> = (0..16).map(|_| b.pick(10)).collect();
        assert_eq!(left, right);
        assert!(left.iter().all(|i| *i < 10));
        assert_eq!(LoadOrder::deterministic().pick(10), 0);
        assert_eq!(LoadOrder::deterministic().serial(9), 9);
    }

    quickcheck! {
        fn prop_pop_order_never_rises(entries: Vec<(i8, i8)>) -> bool {
            let mut queue = EventQueue::new();
            for (i, (package_priority, system_priority)) in entries.iter().enumerate() {
                let slot = i as u32;
                queue.push(
                    event(slot, EventKind::SetupImports),
                    *package_priority as i32,
                    *system_priority as i32,
                    slot as u64,
                );
            }
            let mut last: Option<(i32, i32, u32)> = None;
            while let Some(popped) = queue.pop() {
                let (pp, sp) = entries[popped.package.slot() as usize];
                let key = (pp as i32, sp as i32, popped.package.slot());
                if let Some((lp, ls, lslot)) = last {
                    if (key.0, key.1) > (lp, ls) {
                        return false;
                    }
                    if (key.0, key.1) == (lp, ls) && key.2 < lslot {
                        return false;
                    }
                }
                last = Some(key);
            }
            true
        }
    }
}

#[cfg(test)]
mod request_tests {
    use super::*;
    use crate::runtime::scheduler::{validate_package_name, QueuedRequest};

    #[test]
    fn test_valid_names() {
        assert!(validate_package_name("/Game/Maps/Entry").is_ok());
        assert!(validate_package_name("/Engine/Fonts/Roboto_Bold-2").is_ok());
    }

    #[test]
    fn test_invalid_names() {
        assert_eq!(validate_package_name(""), Err(RequestError::EmptyName));
        for bad in ["Game/A", "/Game/A/", "/Game//A", "/Game/A.upkg", "/Game/A B"] {
            assert!(
                matches!(validate_package_name(bad), Err(RequestError::InvalidPackageName { .. })),
                "{} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_request_builder() {
        let request = PackageRequest::new("/Game/A")
            .with_name_to_load("/Game/A_Cooked")
            .with_guid(7)
            .with_priority(3)
            .with_flags(LoadFlags::QUIET);
        assert_eq!(request.file_name(), "/Game/A_Cooked");
        assert_eq!(request.guid, Some(7));
        assert_eq!(request.priority, 3);
        assert!(request.flags.contains(LoadFlags::QUIET));
        assert!(request.validate().is_ok());
        assert!(PackageRequest::new("/Game/A").with_name_to_load("bad").validate().is_err());
    }

    #[test]
    fn test_drain_by_priority_keeps_arrival_order() {
        let queue = RequestQueue::new();
        for (id, (name, priority)) in [("/Game/A", 0), ("/Game/B", 5), ("/Game/C", 0), ("/Game/D", 5)]
            .into_iter()
            .enumerate()
        {
            queue.push(QueuedRequest {
                id: RequestId(id as u64),
                request: PackageRequest::new(name).with_priority(priority),
            });
        }
        assert_eq!(queue.len(), 4);
        let names: Vec<_> = queue.drain_by_priority().into_iter().map(|q| q.request.name).collect();
        assert_eq!(names, vec!["/Game/B", "/Game/D", "/Game/A", "/Game/C"]);
        assert!(queue.is_empty());
    }
}

#[cfg(test)]
mod incoming_tests {
    use super::*;

    #[test]
    fn test_wait_times_out_when_empty() {
        let incoming = IncomingQueue::new();
        assert!(!incoming.wait(Duration::from_millis(5)));
    }

    #[test]
    fn test_callbacks_push_completions() {
        let incoming = Arc::new(IncomingQueue::new());
        (incoming.summary_callback(pkg(3)))(false);
        (incoming.read_callback(ReadToken(9)))(true);
        assert_eq!(incoming.len(), 2);
        assert!(incoming.wait(Duration::from_millis(5)));
        let drained = incoming.drain();
        assert_eq!(drained, vec![IoCompletion::Summary(pkg(3)), IoCompletion::Read(ReadToken(9))]);
        assert!(incoming.is_empty());
    }

    #[test]
    fn test_push_from_another_thread_wakes_waiter() {
        let incoming = Arc::new(IncomingQueue::new());
        let pusher = Arc::clone(&incoming);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            pusher.push(IoCompletion::Read(ReadToken(1)));
        });
        assert!(incoming.wait(Duration::from_secs(5)));
        handle.join().unwrap();
        assert_eq!(incoming.drain().len(), 1);
    }
}

#[cfg(test)]
mod shared_tests {
    use super::*;

    #[test]
    fn test_request_ids_and_completion() {
        let shared = shared();
        let first = shared.enqueue(PackageRequest::new("/Game/A")).unwrap();
        let second = shared.enqueue(PackageRequest::new("/Game/B")).unwrap();
        assert!(second > first);
        assert!(!shared.is_request_complete(first));
        assert!(!shared.is_request_complete(RequestId(99)));
        assert!(shared.is_loading());

        shared.complete_requests(&[first]);
        assert!(shared.is_request_complete(first));
        assert!(!shared.is_request_complete(second));
        assert_eq!(shared.pending_requests(), 1);
    }

    #[test]
    fn test_invalid_request_rejected_before_queueing() {
        let shared = shared();
        assert!(shared.enqueue(PackageRequest::new("NoSlash")).is_err());
        assert!(shared.requests.is_empty());
        assert!(!shared.is_loading());
    }

    #[test]
    fn test_suspend_nests() {
        let shared = shared();
        assert_eq!(shared.suspend(), 1);
        assert_eq!(shared.suspend(), 2);
        assert_eq!(shared.resume(), Ok(1));
        assert!(shared.is_suspended());
        assert_eq!(shared.resume(), Ok(0));
        assert_eq!(shared.resume(), Err(RequestError::NotSuspended));
    }

    #[test]
    fn test_progress_never_goes_down() {
        let shared = shared();
        shared.publish_progress("/Game/A", 40.0);
        shared.publish_progress("/Game/A", 10.0);
        assert_eq!(shared.progress("/Game/A"), Some(40.0));
        shared.clear_progress("/Game/A");
        assert_eq!(shared.progress("/Game/A"), None);
    }

    #[test]
    fn test_shut_down_rejects_requests() {
        let shared = shared();
        shared.shut_down();
        assert_eq!(shared.enqueue(PackageRequest::new("/Game/A")), Err(RequestError::ShutDown));
    }

    #[test]
    fn test_time_budget() {
        assert!(!TimeBudget::unlimited().exceeded());
        assert!(TimeBudget::unlimited().remaining().is_none());
        let zero = TimeBudget::new(Some(Duration::ZERO));
        assert!(zero.exceeded());
        assert_eq!(zero.remaining(), Some(Duration::ZERO));
    }
}

#[cfg(test)]
mod loader_tests {
    use super::*;

    #[test]
    fn test_build_requires_file_system() {
        let result = AsyncLoader::builder().build();
        assert!(matches!(result, Err(LoaderError::Config(_))));
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let config = LoaderConfig {
            max_package_summary_size: 0,
            ..LoaderConfig::default()
        };
        let result = AsyncLoader::builder()
            .config(config)
            .file_system(Arc::new(MemoryFileSystem::new(CompletionMode::Immediate)))
            .build();
        assert!(matches!(result, Err(LoaderError::Config(_))));
    }

    #[test]
    fn test_idle_loader() {
        let loader = loader();
        assert!(!loader.is_loading());
        assert!(!loader.is_loading_multithreaded());
        assert_eq!(loader.get_percent_complete("/Game/A"), -1.0);
        assert_eq!(loader.num_queued_packages(), 0);
        assert_eq!(loader.live_package_loaders(), 0);
        assert_eq!(loader.tick(true, false, Duration::from_millis(5), None).unwrap(), TickState::Complete);
        assert!(loader.flush(None).is_ok());
    }

    #[test]
    fn test_foreground_only_operations() {
        let loader = loader();
        thread::scope(|scope| {
            scope.spawn(|| {
                assert_eq!(
                    loader.suspend(),
                    Err(RequestError::NotForegroundThread { operation: "suspend" })
                );
                assert!(matches!(
                    loader.flush(None),
                    Err(LoaderError::Request(RequestError::NotForegroundThread { .. }))
                ));
                // Requests are fine from anywhere.
                assert!(loader.request_load(PackageRequest::new("/Game/A")).is_ok());
            });
        });
        assert_eq!(loader.num_queued_packages(), 1);
    }

    #[test]
    fn test_flush_refused_while_suspended() {
        let loader = loader();
        loader.suspend().unwrap();
        assert!(matches!(loader.flush(None), Err(LoaderError::Request(RequestError::Suspended))));
        loader.resume().unwrap();
    }

    #[test]
    fn test_cancel_queued_requests() {
        let loader = loader();
        let canceled = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        for name in ["/Game/A", "/Game/B"] {
            let canceled = Arc::clone(&canceled);
            loader
                .request_load(PackageRequest::new(name).on_complete(move |_, object, result| {
                    assert!(object.is_none());
                    assert_eq!(result, crate::runtime::scheduler::LoadResult::Canceled);
                    canceled.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                }))
                .unwrap();
        }
        loader.cancel_all().unwrap();
        assert_eq!(canceled.load(std::sync::atomic::Ordering::SeqCst), 2);
        assert!(!loader.is_loading());
    }

    #[test]
    fn test_shutdown_rejects_new_requests() {
        let mut loader = loader();
        loader.shutdown();
        assert_eq!(loader.request_load(PackageRequest::new("/Game/A")), Err(RequestError::ShutDown));
    }
}
