mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use ccregistry::{Device, DeviceEventKind, DeviceId, MEDIA_SERVER_DISABLED, Registry};
use common::{eventually, next_event, wait_idle};
use parking_lot::Mutex;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_async_subscriber_receives_events() {
    let registry = Registry::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);

    let _sub = registry.subscribe(move |event| {
        let sink = Arc::clone(&sink);
        async move {
            sink.lock().push(event.name());
            Ok(())
        }
    });

    registry.register_device(Device::new("dev1", "One", "dlna"));
    wait_idle(&registry).await;

    assert_eq!(*seen.lock(), vec!["device_added"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_faulty_subscribers_do_not_disturb_others() {
    let registry = Registry::new();
    let delivered = Arc::new(AtomicUsize::new(0));

    let _failing = registry.subscribe(|_| async { Err(anyhow::anyhow!("always failing")) });
    let _panicking = registry.subscribe(|event| async move {
        if event.device_id().as_str().ends_with('7') {
            panic!("subscriber bug");
        }
        Ok(())
    });
    let _sync_failing = registry.subscribe_sync(|_| anyhow::bail!("sync failure"));
    let counter = Arc::clone(&delivered);
    let _counting = registry.subscribe(move |_| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });

    for i in 0..1000 {
        registry.register_device(Device::new(format!("dev{i}"), "Bulk", "dlna"));
    }
    wait_idle(&registry).await;

    assert_eq!(delivered.load(Ordering::SeqCst), 1000);
    assert_eq!(registry.list_devices().len(), 1000);
    assert_eq!(registry.in_flight_tasks(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sync_subscriber_can_read_the_catalog() {
    let registry = Registry::new();
    let handle = registry.handle();
    let observed = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&observed);

    let _sub = registry.subscribe_sync(move |event| {
        // rappel bloquant : relire le catalogue depuis le callback est permis
        let count = handle.upgrade().map(|r| r.list_devices().len()).unwrap_or(0);
        sink.lock().push((event.name(), count));
        Ok(())
    });

    registry.register_device(Device::new("dev1", "One", "dial"));
    wait_idle(&registry).await;

    assert_eq!(*observed.lock(), vec![("device_added", 1)]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unsubscribe_stops_delivery_and_is_idempotent() {
    let registry = Registry::new();
    let delivered = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&delivered);

    let sub = registry.subscribe_sync(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    registry.register_device(Device::new("dev1", "One", "dlna"));
    wait_idle(&registry).await;

    sub.unsubscribe();
    sub.unsubscribe();
    assert!(!sub.is_active());

    registry.handle().publish(DeviceEventKind::DeviceHeartbeat {
        device_id: DeviceId::from("dev1"),
    });
    wait_idle(&registry).await;

    assert_eq!(delivered.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_streams_are_independent() {
    let registry = Registry::new();
    let mut first = registry.events();
    let mut second = registry.events();

    registry.register_device(Device::new("dev1", "One", "dlna"));
    registry.register_device(Device::new("dev2", "Two", "dlna"));

    // le premier lecteur consomme tout avant que le second ne lise
    assert_eq!(next_event(&mut first).await.device_id().as_str(), "dev1");
    assert_eq!(next_event(&mut first).await.device_id().as_str(), "dev2");
    assert_eq!(next_event(&mut second).await.device_id().as_str(), "dev1");
    assert_eq!(next_event(&mut second).await.device_id().as_str(), "dev2");
}

#[tokio::test]
async fn test_stream_only_sees_later_events() {
    let registry = Registry::new();
    registry.register_device(Device::new("early", "Early", "dlna"));

    let mut events = registry.events();
    registry.register_device(Device::new("late", "Late", "dlna"));

    assert_eq!(next_event(&mut events).await.device_id().as_str(), "late");
}

#[tokio::test]
async fn test_dropped_stream_does_not_block_publishing() {
    let registry = Registry::new();
    drop(registry.events());

    for i in 0..10 {
        registry.register_device(Device::new(format!("dev{i}"), "Dev", "dlna"));
    }

    assert_eq!(registry.list_devices().len(), 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_status_events_from_adapter_handle() {
    let registry = Registry::new();
    registry.start(MEDIA_SERVER_DISABLED, 0).await.unwrap();
    let mut events = registry.events();
    let handle = registry.handle();

    tokio::task::spawn_blocking(move || {
        handle.publish(DeviceEventKind::VolumeUpdated {
            device_id: DeviceId::from("dev1"),
            level: 0.4,
            muted: false,
        });
    })
    .await
    .unwrap();

    match next_event(&mut events).await.kind {
        DeviceEventKind::VolumeUpdated { level, muted, .. } => {
            assert_eq!(level, 0.4);
            assert!(!muted);
        }
        other => panic!("unexpected event {other:?}"),
    }

    registry.stop().await.unwrap();
    eventually(|| registry.in_flight_tasks() == 0).await;
}
