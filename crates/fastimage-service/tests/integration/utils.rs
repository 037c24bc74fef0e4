use std::sync::{Arc, Mutex};
use std::time::Duration;

use fastimage_service::caching::{CacheContents, CacheError, Decoder, TwoTierCache};
use fastimage_service::config::Config;
use fastimage_service::coordinator::{
    CoordinatorOptions, DownloadCoordinator, SlotBinding, SlotEvents, SlotId, SlotListener,
    Status,
};
use fastimage_service::download::ResourceLoader;
use fastimage_test as test;

pub use test::{ImageServer, TempDir, image_bytes};

const PNG_SIGNATURE: &[u8] = b"\x89PNG\r\n\x1a\n";

/// A decoded image: the raw bytes behind a valid signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Png(pub Vec<u8>);

/// Accepts anything that starts with the PNG signature.
#[derive(Debug, Default)]
pub struct PngDecoder;

impl Decoder for PngDecoder {
    type Resource = Png;

    fn decode(&self, bytes: &[u8]) -> CacheContents<Png> {
        if !bytes.starts_with(PNG_SIGNATURE) {
            return Err(CacheError::DecodeError("missing png signature".into()));
        }
        Ok(Png(bytes.to_vec()))
    }
}

/// Records the final state every slot reached.
#[derive(Debug, Default)]
pub struct Recorder {
    statuses: Mutex<Vec<(SlotId, String, Status)>>,
    resources: Mutex<Vec<(SlotId, usize)>>,
}

impl Recorder {
    pub fn statuses(&self, slot_id: SlotId) -> Vec<(String, Status)> {
        self.statuses
            .lock()
            .unwrap()
            .iter()
            .filter(|(slot, _, _)| *slot == slot_id)
            .map(|(_, key, status)| (key.clone(), *status))
            .collect()
    }

    /// The lengths of the resources delivered to `slot_id`.
    pub fn resources(&self, slot_id: SlotId) -> Vec<usize> {
        self.resources
            .lock()
            .unwrap()
            .iter()
            .filter(|(slot, _)| *slot == slot_id)
            .map(|(_, len)| *len)
            .collect()
    }
}

impl SlotListener<Png> for Recorder {
    fn on_status_changed(&self, slot_id: SlotId, key: &str, status: Status) {
        self.statuses
            .lock()
            .unwrap()
            .push((slot_id, key.to_owned(), status));
    }

    fn on_resource_available(&self, resource: Arc<Png>, slot_id: SlotId) {
        self.resources.lock().unwrap().push((slot_id, resource.0.len()));
    }
}

/// A coordinator with a number of slots, and the cache directory backing it.
pub struct Setup {
    pub coordinator: DownloadCoordinator<PngDecoder>,
    pub events: SlotEvents<Png>,
    pub slots: Vec<SlotBinding>,
    pub recorder: Arc<Recorder>,
}

impl Setup {
    pub fn bind(&mut self, slot: SlotId, key: &str) -> fastimage_service::coordinator::BindOutcome {
        self.coordinator.bind(&mut self.slots[slot], key)
    }

    /// Routes events until no slot waits for a fetch anymore.
    pub async fn run_until_idle(&mut self) {
        let drive = async {
            while self.slots.iter().any(|slot| slot.status().is_pending()) {
                let Some(event) = self.events.recv().await else {
                    break;
                };
                let slot = &mut self.slots[event.slot_id];
                self.coordinator.handle_event(slot, event);
            }
        };
        tokio::time::timeout(Duration::from_secs(10), drive)
            .await
            .expect("slots did not settle");
    }

    pub fn cache(&self) -> &Arc<TwoTierCache<PngDecoder>> {
        self.coordinator.cache()
    }
}

/// Sets up a coordinator with `slots` slots, backed by a temporary cache directory.
///
/// The `update_config` closure can modify the default configuration. The directory is deleted
/// when the returned [`TempDir`] is dropped, keep it as a guard until the test has finished.
pub fn setup_coordinator(slots: usize, update_config: impl FnOnce(&mut Config)) -> (Setup, TempDir) {
    test::setup();
    let cache_dir = test::tempdir();

    let mut config = Config {
        cache_dir: Some(cache_dir.path().to_owned()),
        ..Default::default()
    };
    update_config(&mut config);

    (setup_with_config(slots, &config), cache_dir)
}

pub fn setup_with_config(slots: usize, config: &Config) -> Setup {
    let cache = TwoTierCache::from_config(PngDecoder, config).unwrap();
    let loader = ResourceLoader::from_config(config).unwrap();
    let recorder = Arc::new(Recorder::default());
    let (coordinator, events) = DownloadCoordinator::new(
        Arc::new(cache),
        loader,
        recorder.clone(),
        CoordinatorOptions::from_config(config),
    );

    Setup {
        coordinator,
        events,
        slots: (0..slots).map(SlotBinding::new).collect(),
        recorder,
    }
}
