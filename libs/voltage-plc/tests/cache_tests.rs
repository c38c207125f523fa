//! Connection cache lifecycle: borrow, return, waits, watchdog and breakage

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::{fast_cache_config, CountingFactory};
use parking_lot::Mutex;
use tracing_test::traced_test;
use voltage_plc::cache::CacheEventHook;
use voltage_plc::{
    CacheConfig, CacheEvent, CacheState, ConnectionCache, ConnectionKey, PlcError,
    PlcResponseCode, SingleTagOptimizer,
};

fn cache_with(factory: &CountingFactory, config: CacheConfig) -> Arc<ConnectionCache> {
    Arc::new(ConnectionCache::new(
        ConnectionKey::new("mock://x"),
        factory.as_factory(),
        config,
    ))
}

fn recording_cache(
    factory: &CountingFactory,
    config: CacheConfig,
) -> (Arc<ConnectionCache>, Arc<Mutex<Vec<CacheEvent>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let hook: CacheEventHook = Arc::new(move |event: CacheEvent| sink.lock().push(event));
    let cache = ConnectionCache::with_metrics_hook(
        ConnectionKey::new("mock://x"),
        factory.as_factory(),
        config,
        Some(hook),
    );
    (Arc::new(cache), events)
}

fn state_sequence(events: &[CacheEvent]) -> Vec<CacheState> {
    let mut sequence = Vec::new();
    for event in events {
        if let CacheEvent::StateChanged { from, to, .. } = event {
            if sequence.is_empty() {
                sequence.push(*from);
            }
            sequence.push(*to);
        }
    }
    sequence
}

#[tokio::test]
async fn test_second_borrow_without_release_fails() {
    let factory = CountingFactory::new();
    let cache = cache_with(&factory, fast_cache_config());

    let first = cache.get_connection().await.unwrap();
    let err = cache.get_connection().await.unwrap_err();
    assert!(matches!(err, PlcError::BorrowConflict { .. }));
    assert!(first.is_connected());
    assert_eq!(cache.stats().rejections, 1);
}

#[tokio::test]
async fn test_return_then_borrow_reuses_connection() {
    let factory = CountingFactory::new();
    let (cache, events) = recording_cache(&factory, fast_cache_config());

    let first = cache.get_connection().await.unwrap();
    let value = first
        .read_request_builder()
        .unwrap()
        .add_tag_address("v", "%MW0")
        .build()
        .unwrap()
        .execute()
        .await
        .unwrap();
    assert_eq!(value.get_i64("v").unwrap(), 42);
    first.close().unwrap();

    let second = cache.get_connection().await.unwrap();
    assert!(second.is_valid());
    assert_eq!(factory.created(), 1);
    assert_eq!(
        state_sequence(&events.lock()),
        vec![
            CacheState::Disconnected,
            CacheState::Connecting,
            CacheState::Available,
            CacheState::Borrowed,
            CacheState::Available,
            CacheState::Borrowed,
        ]
    );
    assert_ne!(first.lease_id(), second.lease_id());
    assert_eq!(second.connection_id(), format!("mock://x-{}", second.lease_id()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_borrows_only_one_wins() {
    let factory = CountingFactory::new();
    let cache = cache_with(&factory, fast_cache_config());

    let attempts: Vec<_> = (0..16)
        .map(|_| {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get_connection().await })
        })
        .collect();

    let mut leases = Vec::new();
    let mut conflicts = 0;
    for attempt in attempts {
        match attempt.await.unwrap() {
            Ok(lease) => leases.push(lease),
            Err(PlcError::BorrowConflict { .. }) => conflicts += 1,
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    assert_eq!(leases.len(), 1);
    assert_eq!(conflicts, 15);
    assert_eq!(cache.state(), CacheState::Borrowed);
    assert_eq!(factory.created(), 1);
}

#[tokio::test]
async fn test_broken_connection_forces_fresh_connect() {
    let factory = CountingFactory::new();
    let cache = cache_with(&factory, fast_cache_config());

    let lease = cache.get_connection().await.unwrap();
    cache.handle_broken_connection();
    assert_eq!(cache.state(), CacheState::Disconnected);
    assert!(!lease.is_valid());
    assert!(matches!(
        lease.read_request_builder().err(),
        Some(PlcError::LeaseInvalidated(_))
    ));

    let fresh = cache.get_connection().await.unwrap();
    assert!(fresh.is_connected());
    assert_eq!(factory.created(), 2);
    assert_eq!(cache.stats().broken_connections, 1);
}

#[tokio::test]
async fn test_transport_failure_during_request_discards_connection() {
    let factory = CountingFactory::new();
    let cache = cache_with(&factory, fast_cache_config());

    let lease = cache.get_connection().await.unwrap();
    factory.last_driver().break_next_request();
    let err = lease
        .read_request_builder()
        .unwrap()
        .add_tag_address("v", "%MW0")
        .build()
        .unwrap()
        .execute()
        .await
        .unwrap_err();
    assert!(matches!(err, PlcError::ConnectionBroken(_)));
    assert_eq!(cache.state(), CacheState::Disconnected);
    assert!(!lease.is_valid());

    // Close of the discarded connection happens in the background
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(factory.last_driver().closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_failed_split_part_discards_connection() {
    let factory = CountingFactory::new();
    factory.use_optimizer(Arc::new(SingleTagOptimizer));
    let cache = cache_with(&factory, fast_cache_config());

    let lease = cache.get_connection().await.unwrap();
    factory.last_driver().fail_address("%MW2");
    let response = lease
        .read_request_builder()
        .unwrap()
        .add_tag_address("a", "%MW0")
        .add_tag_address("b", "%MW2")
        .build()
        .unwrap()
        .execute()
        .await
        .unwrap();

    // The caller still gets the tags that made it
    assert_eq!(response.get_i64("a").unwrap(), 42);
    assert_eq!(response.response_code("b").unwrap(), PlcResponseCode::InternalError);
    assert_eq!(cache.state(), CacheState::Disconnected);
    assert!(!lease.is_valid());
    assert_eq!(cache.stats().broken_connections, 1);
}

#[tokio::test]
async fn test_reset_during_connect_fails_that_connect() {
    let factory = CountingFactory::new();
    *factory.connect_delay.lock() = Duration::from_millis(100);
    let cache = cache_with(&factory, fast_cache_config());

    let connecting = {
        let cache = cache.clone();
        tokio::spawn(async move { cache.get_connection().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(cache.state(), CacheState::Connecting);

    cache.handle_broken_connection();
    assert_eq!(cache.state(), CacheState::Disconnected);
    match connecting.await.unwrap() {
        Err(PlcError::ConnectionFailed { reason, .. }) => {
            assert!(reason.contains("reset during connect"), "reason: {}", reason)
        },
        other => panic!("expected ConnectionFailed, got {:?}", other),
    }

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(factory.last_driver().closes.load(Ordering::SeqCst), 1);

    *factory.connect_delay.lock() = Duration::ZERO;
    let lease = cache.get_connection().await.unwrap();
    assert!(lease.is_connected());
    assert_eq!(factory.created(), 2);
}

#[tokio::test]
async fn test_abandoned_connect_closes_half_open_connection() {
    let factory = CountingFactory::new();
    *factory.connect_delay.lock() = Duration::from_millis(200);
    let cache = cache_with(&factory, fast_cache_config());

    let attempt = tokio::time::timeout(Duration::from_millis(30), cache.get_connection()).await;
    assert!(attempt.is_err());
    assert_eq!(cache.state(), CacheState::Disconnected);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(factory.last_driver().closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
#[traced_test]
async fn test_watchdog_revokes_overdue_lease() {
    let factory = CountingFactory::new();
    let cache = cache_with(&factory, fast_cache_config());

    let stale = cache.get_connection().await.unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_eq!(cache.state(), CacheState::Disconnected);
    assert!(matches!(
        stale.read_request_builder().err(),
        Some(PlcError::LeaseInvalidated(_))
    ));
    assert!(matches!(stale.close(), Err(PlcError::LeaseInvalidated(_))));
    assert!(logs_contain("Error trying to return lease from invalid connection"));
    assert_eq!(cache.stats().watchdog_triggers, 1);

    // The next borrower gets a fresh connection
    let fresh = cache.get_connection().await.unwrap();
    assert!(fresh.is_valid());
    assert_eq!(factory.created(), 2);
}

#[tokio::test]
async fn test_prepared_request_fails_after_lease_returned() {
    let factory = CountingFactory::new();
    let cache = cache_with(&factory, fast_cache_config());

    let lease = cache.get_connection().await.unwrap();
    let request = lease
        .read_request_builder()
        .unwrap()
        .add_tag_address("v", "%MW0")
        .build()
        .unwrap();
    lease.close().unwrap();

    let err = request.execute().await.unwrap_err();
    assert!(matches!(err, PlcError::LeaseInvalidated(_)));
    assert!(matches!(lease.close(), Err(PlcError::LeaseInvalidated(_))));
    assert_eq!(cache.state(), CacheState::Available);
}

#[tokio::test]
async fn test_dropped_lease_is_returned() {
    let factory = CountingFactory::new();
    let cache = cache_with(&factory, fast_cache_config());

    {
        let _lease = cache.get_connection().await.unwrap();
        assert_eq!(cache.state(), CacheState::Borrowed);
    }
    assert_eq!(cache.state(), CacheState::Available);
    assert_eq!(cache.stats().returns, 1);
}

#[tokio::test]
async fn test_waiter_gets_connection_once_released() {
    let factory = CountingFactory::new();
    let config = CacheConfig {
        max_wait_time_ms: Some(1000),
        ..fast_cache_config()
    };
    let cache = cache_with(&factory, config);

    let holder = cache.get_connection().await.unwrap();
    let waiter = {
        let cache = cache.clone();
        tokio::spawn(async move { cache.get_connection().await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(cache.stats().waiting, 1);

    holder.close().unwrap();
    let lease = waiter.await.unwrap().unwrap();
    assert!(lease.is_valid());
    assert_eq!(factory.created(), 1);
}

#[tokio::test]
async fn test_waiter_times_out() {
    let factory = CountingFactory::new();
    let config = CacheConfig {
        max_wait_time_ms: Some(50),
        max_lease_time_ms: 5000,
        ..fast_cache_config()
    };
    let (cache, events) = recording_cache(&factory, config);

    let _holder = cache.get_connection().await.unwrap();
    let err = cache.get_connection().await.unwrap_err();
    match err {
        PlcError::BorrowTimeout { waited_ms, .. } => assert!(waited_ms >= 50),
        other => panic!("expected borrow timeout, got {}", other),
    }
    assert!(events
        .lock()
        .iter()
        .any(|e| matches!(e, CacheEvent::BorrowTimeout { .. })));
}

#[tokio::test]
async fn test_idle_connection_closed_by_watchdog() {
    let factory = CountingFactory::new();
    let config = CacheConfig {
        max_idle_time_ms: Some(50),
        ..fast_cache_config()
    };
    let cache = cache_with(&factory, config);

    cache.get_connection().await.unwrap().close().unwrap();
    assert_eq!(cache.state(), CacheState::Available);
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(cache.state(), CacheState::Disconnected);
    assert_eq!(cache.stats().idle_closes, 1);
    assert_eq!(factory.last_driver().closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_slow_request_times_out_and_breaks_connection() {
    let factory = CountingFactory::new();
    let config = CacheConfig {
        request_timeout_ms: 50,
        max_lease_time_ms: 5000,
        ..fast_cache_config()
    };
    let cache = cache_with(&factory, config);

    let lease = cache.get_connection().await.unwrap();
    factory.last_driver().set_delay(Duration::from_millis(300));
    let err = lease
        .read_request_builder()
        .unwrap()
        .add_tag_address("v", "%MW0")
        .build()
        .unwrap()
        .execute()
        .await
        .unwrap_err();

    assert!(matches!(err, PlcError::Timeout(_)));
    assert_eq!(cache.state(), CacheState::Disconnected);
    assert!(!lease.is_valid());
}

#[tokio::test]
async fn test_connect_failure_leaves_cache_reusable() {
    let factory = CountingFactory::new();
    factory.fail_connect.store(true, Ordering::SeqCst);
    let cache = cache_with(&factory, fast_cache_config());

    let err = cache.get_connection().await.unwrap_err();
    assert!(matches!(err, PlcError::ConnectionFailed { .. }));
    assert_eq!(cache.state(), CacheState::Disconnected);

    factory.fail_connect.store(false, Ordering::SeqCst);
    let lease = cache.get_connection().await.unwrap();
    assert!(lease.is_connected());
    let stats = cache.stats();
    assert_eq!(stats.connect_failures, 1);
    assert_eq!(stats.connects, 1);
}

#[tokio::test]
async fn test_close_invalidates_lease_and_wakes_waiters() {
    let factory = CountingFactory::new();
    let config = CacheConfig {
        max_wait_time_ms: Some(2000),
        ..fast_cache_config()
    };
    let cache = cache_with(&factory, config);

    let lease = cache.get_connection().await.unwrap();
    let waiter = {
        let cache = cache.clone();
        tokio::spawn(async move { cache.get_connection().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    cache.close().await.unwrap();
    assert_eq!(cache.state(), CacheState::Closed);
    assert!(!lease.is_valid());
    assert!(matches!(
        waiter.await.unwrap(),
        Err(PlcError::CacheClosed { .. })
    ));
    assert!(matches!(
        cache.get_connection().await,
        Err(PlcError::CacheClosed { .. })
    ));
    assert_eq!(factory.last_driver().closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_subscription_events_reach_consumer() {
    let factory = CountingFactory::new();
    let cache = cache_with(&factory, fast_cache_config());
    let lease = cache.get_connection().await.unwrap();

    let response = lease
        .subscription_request_builder()
        .unwrap()
        .add_change_of_state_tag_address("level", "%MW0")
        .build()
        .unwrap()
        .execute()
        .await
        .unwrap();
    let handles = response.handles();
    assert_eq!(handles.len(), 1);

    let mut events = lease.register_consumer(&handles, 8).unwrap();
    assert!(factory.last_driver().emit(&handles[0], 99));
    let event = events.recv().await.unwrap();
    assert_eq!(event.tag_name, "level");
    assert_eq!(event.value.unwrap().as_i64().unwrap(), 99);

    let released = lease
        .unsubscription_request_builder()
        .unwrap()
        .add_handles(handles.clone())
        .build()
        .unwrap()
        .execute()
        .await
        .unwrap();
    assert!(released.all_ok());
    assert!(!factory.last_driver().emit(&handles[0], 100));
}
