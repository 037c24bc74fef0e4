use std::sync::atomic::AtomicUsize;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Notify;

use super::*;
use crate::download::{ConnectivityFlag, ConnectivityOracle};
use crate::test::{
    self, Notification, RecordingListener, Script, ScriptedTransport, TestDecoder, TestImage,
};

const A: &str = "http://x/a.png";
const B: &str = "http://x/b.png";

struct Harness {
    transport: Arc<ScriptedTransport>,
    connectivity: Arc<ConnectivityFlag>,
    listener: Arc<RecordingListener>,
    coordinator: DownloadCoordinator<TestDecoder>,
    events: SlotEvents<TestImage>,
    slots: Vec<SlotBinding>,
}

impl Harness {
    fn new(options: CoordinatorOptions) -> Self {
        Self::build(options, None)
    }

    fn with_oracle(options: CoordinatorOptions, oracle: Arc<dyn ConnectivityOracle>) -> Self {
        Self::build(options, Some(oracle))
    }

    fn build(options: CoordinatorOptions, oracle: Option<Arc<dyn ConnectivityOracle>>) -> Self {
        let transport = ScriptedTransport::new();
        transport.script(A, Script::chunks(vec![vec![1; 100], vec![1; 50]]));
        transport.script(B, Script::chunks(vec![vec![2; 100]]));

        let connectivity = Arc::new(ConnectivityFlag::default());
        let oracle = oracle.unwrap_or_else(|| connectivity.clone() as Arc<dyn ConnectivityOracle>);
        let loader = ResourceLoader::new(transport.clone()).with_connectivity(oracle);
        let listener = RecordingListener::new();
        let (coordinator, events) = DownloadCoordinator::new(
            Arc::new(test::memory_cache(10)),
            loader,
            listener.clone(),
            options,
        );

        Self {
            transport,
            connectivity,
            listener,
            coordinator,
            events,
            slots: (0..4).map(SlotBinding::new).collect(),
        }
    }

    fn bind(&mut self, slot: SlotId, key: &str) -> BindOutcome {
        self.coordinator.bind(&mut self.slots[slot], key)
    }

    /// Routes events to their slots until no more events arrive.
    async fn settle(&mut self) {
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(100), self.events.recv()).await
        {
            let slot = &mut self.slots[event.slot_id];
            self.coordinator.handle_event(slot, event);
        }
    }

    fn progress(&self) -> Vec<Notification> {
        self.listener
            .notifications()
            .into_iter()
            .filter(|n| matches!(n, Notification::Progress(..)))
            .collect()
    }

    fn statuses(&self, slot: SlotId) -> Vec<(&'static str, Status)> {
        self.listener
            .statuses(slot)
            .into_iter()
            .map(|(key, status)| {
                let key = match key.as_str() {
                    A => "a",
                    B => "b",
                    "" => "",
                    _ => "other",
                };
                (key, status)
            })
            .collect()
    }
}

fn image(byte: u8, len: usize) -> TestImage {
    TestImage(vec![byte; len])
}

#[tokio::test]
async fn test_fetch_and_deliver() {
    test::setup();
    let mut harness = Harness::new(Default::default());

    assert_eq!(harness.bind(0, A), BindOutcome::Scheduled);
    assert_eq!(harness.slots[0].status(), Status::Queued);
    harness.settle().await;

    assert_eq!(
        harness.statuses(0),
        [
            ("a", Status::Queued),
            ("a", Status::Fetching),
            ("a", Status::Delivered)
        ]
    );
    assert_eq!(harness.listener.resources(0), [image(1, 150)]);
    assert_eq!(harness.slots[0].status(), Status::Delivered);
    assert!(harness.slots[0].active_fetch().is_none());
    assert!(harness.coordinator.cache().contains_key_in_memory(A));

    assert_eq!(
        harness.progress(),
        [
            Notification::Progress(0, 100, -1),
            Notification::Progress(0, 150, -1)
        ]
    );
}

#[tokio::test]
async fn test_progress_of_every_read() {
    test::setup();
    let mut harness = Harness::new(Default::default());
    harness.transport.script(
        A,
        Script::chunks(vec![vec![1; 1024], vec![2; 1024], vec![3; 512]]),
    );

    harness.bind(0, A);
    harness.settle().await;

    assert_eq!(
        harness.progress(),
        [
            Notification::Progress(0, 1024, -1),
            Notification::Progress(0, 2048, -1),
            Notification::Progress(0, 2560, -1),
        ]
    );
    assert_eq!(harness.slots[0].status(), Status::Delivered);
}

#[tokio::test]
async fn test_queued_until_a_fetch_slot_is_free() {
    test::setup();
    let mut harness = Harness::new(CoordinatorOptions {
        max_concurrent_fetches: 1,
        ..Default::default()
    });
    let gate = Arc::new(Notify::new());
    harness.transport.script(
        A,
        Script::chunks(vec![vec![1; 100]]).with_gate(gate.clone()),
    );

    harness.bind(0, A);
    harness.bind(1, B);
    harness.settle().await;

    assert_eq!(harness.slots[0].status(), Status::Fetching);
    assert_eq!(harness.statuses(1), [("b", Status::Queued)]);
    assert_eq!(harness.transport.opens(B), 0);

    gate.notify_one();
    harness.settle().await;
    assert_eq!(harness.slots[0].status(), Status::Delivered);
    assert_eq!(
        harness.statuses(1),
        [
            ("b", Status::Queued),
            ("b", Status::Fetching),
            ("b", Status::Delivered)
        ]
    );
}

/// Reports connectivity on the first check only.
#[derive(Debug, Default)]
struct OnlineOnce {
    checks: AtomicUsize,
}

impl ConnectivityOracle for OnlineOnce {
    fn is_online(&self) -> bool {
        self.checks.fetch_add(1, Ordering::SeqCst) == 0
    }
}

#[tokio::test]
async fn test_connectivity_is_checked_once() {
    test::setup();
    let oracle = Arc::new(OnlineOnce::default());
    let mut harness = Harness::with_oracle(Default::default(), oracle.clone());

    harness.bind(0, A);
    harness.settle().await;

    assert_eq!(
        harness.statuses(0),
        [
            ("a", Status::Queued),
            ("a", Status::Fetching),
            ("a", Status::Delivered)
        ]
    );
    assert_eq!(oracle.checks.load(Ordering::SeqCst), 1);

    // the next attempt sees the connection gone, before anything started
    harness.coordinator.cache().clear(true);
    harness.bind(1, A);
    harness.settle().await;
    assert_eq!(
        harness.statuses(1),
        [("a", Status::Queued), ("a", Status::NoConnection)]
    );
    assert_eq!(oracle.checks.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_offline() {
    test::setup();
    let mut harness = Harness::new(Default::default());
    harness.connectivity.set_online(false);

    assert!(harness.bind(1, A).is_handled());
    harness.settle().await;

    assert_eq!(
        harness.statuses(1),
        [("a", Status::Queued), ("a", Status::NoConnection)]
    );
    assert_eq!(harness.transport.opens(A), 0);
    assert!(harness.listener.resources(1).is_empty());

    // the slot can be bound again once online
    harness.connectivity.set_online(true);
    assert_eq!(harness.bind(1, A), BindOutcome::Scheduled);
    harness.settle().await;
    assert_eq!(harness.slots[1].status(), Status::Delivered);
    assert_eq!(harness.transport.opens(A), 1);
}

#[tokio::test]
async fn test_bind_twice_fetches_once() {
    test::setup();
    let mut harness = Harness::new(Default::default());

    assert_eq!(harness.bind(0, A), BindOutcome::Scheduled);
    assert_eq!(harness.bind(0, A), BindOutcome::AlreadyPending);
    assert!(!BindOutcome::AlreadyPending.is_handled());
    harness.settle().await;

    assert_eq!(harness.transport.opens(A), 1);
    assert_eq!(harness.listener.resources(0).len(), 1);
}

#[tokio::test]
async fn test_cache_hit_is_delivered_synchronously() {
    test::setup();
    let mut harness = Harness::new(Default::default());
    harness
        .coordinator
        .cache()
        .put(A, Bytes::from(vec![7; 10]))
        .unwrap();

    assert_eq!(harness.bind(0, A), BindOutcome::FromCache);
    // delivered before anything else happened
    assert_eq!(
        harness.listener.notifications(),
        [
            Notification::Resource(0, image(7, 10)),
            Notification::Status(0, A.into(), Status::Delivered),
        ]
    );

    // a delivered slot is not pending, binding again serves the cache again
    assert_eq!(harness.bind(0, A), BindOutcome::FromCache);
    harness.settle().await;
    assert_eq!(harness.transport.opens(A), 0);
}

#[tokio::test]
async fn test_async_cache_check() {
    test::setup();
    let mut harness = Harness::new(CoordinatorOptions {
        cache_first_sync: false,
        ..Default::default()
    });
    harness
        .coordinator
        .cache()
        .put(A, Bytes::from(vec![7; 10]))
        .unwrap();

    assert_eq!(harness.bind(0, A), BindOutcome::Scheduled);
    harness.settle().await;

    assert_eq!(
        harness.statuses(0),
        [("a", Status::Queued), ("a", Status::Delivered)]
    );
    assert_eq!(harness.listener.resources(0), [image(7, 10)]);
    assert_eq!(harness.transport.opens(A), 0);
}

#[tokio::test]
async fn test_rebind_cancels_stale_fetch() {
    test::setup();
    let mut harness = Harness::new(Default::default());
    let gate = Arc::new(Notify::new());
    harness.transport.script(
        A,
        Script::chunks(vec![vec![1; 100]]).with_gate(gate.clone()),
    );

    harness.bind(0, A);
    harness.settle().await;
    assert_eq!(harness.transport.opens(A), 1);

    harness.bind(0, B);
    gate.notify_one();
    harness.settle().await;

    assert_eq!(
        harness.statuses(0),
        [
            ("a", Status::Queued),
            ("a", Status::Fetching),
            ("b", Status::Queued),
            ("b", Status::Fetching),
            ("b", Status::Delivered),
        ]
    );
    assert_eq!(harness.listener.resources(0), [image(2, 100)]);
    assert_eq!(harness.transport.open_bodies(), 0);
    assert!(!harness.coordinator.cache().contains_key_in_memory(A));
}

#[tokio::test]
async fn test_rebind_before_fetch_started() {
    test::setup();
    let mut harness = Harness::new(Default::default());

    // the fetch of `a` never got to run
    harness.bind(0, A);
    harness.bind(0, B);
    harness.settle().await;

    assert_eq!(harness.transport.opens(A), 0);
    assert_eq!(harness.listener.resources(0), [image(2, 100)]);
    assert_eq!(harness.slots[0].current_key(), Some(B));
}

#[tokio::test]
async fn test_shared_fetch_survives_rebind() {
    test::setup();
    let mut harness = Harness::new(Default::default());
    let gate = Arc::new(Notify::new());
    harness.transport.script(
        A,
        Script::chunks(vec![vec![1; 100]]).with_gate(gate.clone()),
    );

    harness.bind(0, A);
    harness.bind(1, A);
    harness.settle().await;

    harness.bind(0, B);
    gate.notify_one();
    harness.settle().await;

    // slot 0 moved on and never sees `a`, slot 1 still gets it
    assert_eq!(harness.listener.resources(0), [image(2, 100)]);
    assert_eq!(harness.listener.resources(1), [image(1, 100)]);
    assert!(
        !harness
            .statuses(0)
            .contains(&("a", Status::Delivered))
    );
    assert_eq!(harness.transport.opens(A), 1);
}

#[tokio::test]
async fn test_errors() {
    test::setup();
    let mut harness = Harness::new(Default::default());
    harness
        .transport
        .script("http://x/corrupt.png", Script::chunks(vec![b"corrupt".to_vec()]));
    harness
        .transport
        .script("http://x/empty.png", Script::chunks(vec![]));

    harness.bind(0, "http://x/corrupt.png");
    harness.bind(1, "http://x/empty.png");
    harness.bind(2, "http://x/missing.png");
    harness.settle().await;

    for slot in 0..3 {
        assert_eq!(harness.slots[slot].status(), Status::Error);
        assert!(harness.listener.resources(slot).is_empty());
    }
    assert!(harness.coordinator.cache().is_empty());
}

#[tokio::test]
async fn test_empty_key() {
    test::setup();
    let mut harness = Harness::new(Default::default());

    assert_eq!(harness.bind(0, ""), BindOutcome::Invalid);
    assert!(!BindOutcome::Invalid.is_handled());
    assert_eq!(harness.statuses(0), [("", Status::Error)]);

    // an empty key also abandons the previous key
    harness.bind(1, A);
    harness.bind(1, "");
    harness.settle().await;
    assert_eq!(harness.slots[1].current_key(), None);
    assert!(harness.listener.resources(1).is_empty());
}

#[tokio::test]
async fn test_stale_events_are_discarded() {
    test::setup();
    let mut harness = Harness::new(Default::default());

    harness.bind(0, A);
    let event = harness.events.recv().await.unwrap();
    assert!(matches!(event.kind, SlotEventKind::Started));

    // routed to the wrong slot
    let stale = SlotEvent {
        slot_id: 0,
        generation: event.generation,
        kind: SlotEventKind::Started,
    };
    assert!(!harness.coordinator.handle_event(&mut harness.slots[1], stale));

    // from an older generation
    let stale = SlotEvent {
        slot_id: 0,
        generation: event.generation - 1,
        kind: SlotEventKind::Started,
    };
    assert!(!harness.coordinator.handle_event(&mut harness.slots[0], stale));

    assert!(harness.coordinator.handle_event(&mut harness.slots[0], event));
    assert_eq!(harness.slots[0].status(), Status::Fetching);
}

#[tokio::test]
async fn test_release() {
    test::setup();
    let mut harness = Harness::new(Default::default());
    let gate = Arc::new(Notify::new());
    harness.transport.script(
        A,
        Script::chunks(vec![vec![1; 100]]).with_gate(gate.clone()),
    );

    harness.bind(0, A);
    harness.settle().await;
    harness.coordinator.release(&mut harness.slots[0]);
    assert_eq!(harness.slots[0].status(), Status::Idle);
    assert_eq!(harness.slots[0].current_key(), None);

    gate.notify_one();
    harness.settle().await;
    assert!(harness.listener.resources(0).is_empty());
    assert_eq!(harness.transport.open_bodies(), 0);
}

#[tokio::test]
async fn test_dropped_binding_cancels() {
    test::setup();
    let mut harness = Harness::new(Default::default());
    let gate = Arc::new(Notify::new());
    harness.transport.script(
        A,
        Script::chunks(vec![vec![1; 100]]).with_gate(gate.clone()),
    );

    harness.bind(3, A);
    harness.settle().await;
    let slot = harness.slots.pop().unwrap();
    assert!(slot.active_fetch().is_some());
    drop(slot);

    gate.notify_one();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.transport.open_bodies(), 0);
    assert!(!harness.coordinator.cache().contains_key_in_memory(A));
}

#[tokio::test]
async fn test_shutdown() {
    test::setup();
    let mut harness = Harness::new(Default::default());
    let gate = Arc::new(Notify::new());
    harness.transport.script(
        A,
        Script::chunks(vec![vec![1; 100]]).with_gate(gate.clone()),
    );

    harness.bind(0, A);
    harness.settle().await;
    harness.coordinator.shutdown();
    assert!(harness.coordinator.is_shut_down());

    gate.notify_one();
    harness.settle().await;
    assert!(harness.listener.resources(0).is_empty());
    assert_eq!(harness.transport.open_bodies(), 0);

    // nothing is fetched anymore
    harness.bind(1, B);
    harness.settle().await;
    assert_eq!(harness.transport.opens(B), 0);
}
