use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use registry::{DeviceRegistry, DeviceTeardown, RegistryError};
use types::DeviceState;

fn device(last_octet: u8) -> DeviceState {
    DeviceState::manual(
        format!("Inverter {last_octet}"),
        format!("192.168.1.{last_octet}"),
        502,
        1,
    )
}

#[test]
fn upsert_inserts_once() {
    let registry = DeviceRegistry::new();
    let first = device(10);

    registry.upsert(first.clone()).expect("insert");
    let mut renamed = first.clone();
    renamed.identity.name = "Other".to_string();
    assert_eq!(
        registry.upsert(renamed),
        Err(RegistryError::AlreadyExists(first.id().to_string()))
    );

    assert_eq!(registry.list(), vec![first.clone()]);
    assert_eq!(registry.get(first.id()), Some(first));
    // the rejected insert did not produce a revision
    assert_eq!(registry.snapshot().revision, 1);
}

#[test]
fn update_replaces_only_known_devices() {
    let registry = DeviceRegistry::new();
    let mut known = device(11);
    registry.upsert(known.clone()).expect("insert");

    known.panel_location = "roof east".to_string();
    registry.update(known.clone()).expect("update");
    assert_eq!(registry.get(known.id()).expect("present").panel_location, "roof east");

    let unknown = device(12);
    assert_eq!(
        registry.update(unknown.clone()),
        Err(RegistryError::NotFound(unknown.id().to_string()))
    );
    assert_eq!(registry.list().len(), 1);
}

#[test]
fn modify_applies_in_place() {
    let registry = DeviceRegistry::new();
    let known = device(13);
    registry.upsert(known.clone()).expect("insert");

    let updated = registry
        .modify(known.id(), |state| state.mark_online(1_700_000_000_000))
        .expect("modify");
    assert!(updated.is_online);
    assert_eq!(registry.get(known.id()), Some(updated));
    assert!(registry.modify("missing", |_| {}).is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_disjoint_upserts_all_land() {
    let registry = Arc::new(DeviceRegistry::new());
    let mut handles = Vec::new();
    for octet in 1..=64u8 {
        let registry = registry.clone();
        handles.push(tokio::spawn(async move { registry.upsert(device(octet)) }));
    }
    for handle in handles {
        handle.await.expect("join").expect("upsert");
    }

    let mut ids: Vec<String> = registry.list().iter().map(|d| d.id().to_string()).collect();
    ids.sort();
    let mut expected: Vec<String> = (1..=64u8).map(|o| device(o).id().to_string()).collect();
    expected.sort();
    assert_eq!(ids, expected);
    assert_eq!(registry.snapshot().revision, 64);
}

#[tokio::test]
async fn revisions_arrive_in_commit_order() {
    let registry = DeviceRegistry::new();
    let mut revisions = registry.revisions();
    let watcher = registry.subscribe();

    let a = device(1);
    registry.upsert(a.clone()).expect("a");
    registry.upsert(device(2)).expect("b");
    registry
        .modify(a.id(), |state| state.mark_online(5))
        .expect("modify");

    for expected in 1..=3u64 {
        let snapshot = revisions.recv().await.expect("revision");
        assert_eq!(snapshot.revision, expected);
    }
    let latest = watcher.borrow().clone();
    assert_eq!(latest.revision, 3);
    assert!(latest.get(a.id()).expect("a").is_online);
}

struct RecordingTeardown {
    registry: Arc<DeviceRegistry>,
    /// (device id, still registered when torn down)
    calls: Mutex<Vec<(String, bool)>>,
}

#[async_trait]
impl DeviceTeardown for RecordingTeardown {
    async fn teardown(&self, device_id: &str) {
        let present = self.registry.get(device_id).is_some();
        self.calls
            .lock()
            .expect("lock")
            .push((device_id.to_string(), present));
    }
}

#[tokio::test]
async fn remove_tears_down_before_forgetting() {
    let registry = Arc::new(DeviceRegistry::new());
    let hook = Arc::new(RecordingTeardown {
        registry: registry.clone(),
        calls: Mutex::new(Vec::new()),
    });
    let weak: Weak<dyn DeviceTeardown> = Arc::downgrade(&hook) as Weak<dyn DeviceTeardown>;
    registry.attach_teardown(weak);

    let known = device(20);
    registry.upsert(known.clone()).expect("insert");

    let removed = registry.remove(known.id()).await.expect("remove");
    assert_eq!(removed, known);
    assert!(registry.get(known.id()).is_none());
    assert_eq!(
        hook.calls.lock().expect("lock").clone(),
        vec![(known.id().to_string(), true)]
    );

    assert_eq!(
        registry.remove(known.id()).await,
        Err(RegistryError::NotFound(known.id().to_string()))
    );
    assert_eq!(hook.calls.lock().expect("lock").len(), 1);
}

#[tokio::test]
async fn remove_without_teardown_hook() {
    let registry = DeviceRegistry::new();
    let known = device(21);
    registry.upsert(known.clone()).expect("insert");
    registry.remove(known.id()).await.expect("remove");
    assert!(registry.list().is_empty());
}
