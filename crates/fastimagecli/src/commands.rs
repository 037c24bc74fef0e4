use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use console::style;
use fastimage_service::caching::TwoTierCache;
use fastimage_service::config::Config;
use fastimage_service::coordinator::{
    BindOutcome, CoordinatorOptions, DownloadCoordinator, SlotBinding, SlotId, SlotListener,
    Status,
};
use fastimage_service::download::{ConnectivityFlag, Progress, ResourceLoader};

use crate::decoder::{SniffedImage, SniffingDecoder};

/// Prints every notification of every slot.
#[derive(Debug, Default)]
struct StatusPrinter {
    progress: bool,
    delivered: AtomicUsize,
    failed: AtomicUsize,
}

impl SlotListener<SniffedImage> for StatusPrinter {
    fn on_status_changed(&self, slot_id: SlotId, key: &str, status: Status) {
        let label = format!("{status:<13}");
        let label = match status {
            Status::Delivered => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                style(label).green()
            }
            Status::Error | Status::NoConnection => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                style(label).red()
            }
            _ => style(label).dim(),
        };
        println!("[slot {slot_id}] {label} {key}");
    }

    fn on_resource_available(&self, resource: Arc<SniffedImage>, slot_id: SlotId) {
        println!(
            "[slot {slot_id}] {} image, {} bytes",
            resource.format, resource.len
        );
    }

    fn on_progress(&self, slot_id: SlotId, progress: Progress) {
        if self.progress {
            println!(
                "[slot {slot_id}] {:>5.1}% ({} bytes)",
                progress.percent(),
                progress.bytes_so_far
            );
        }
    }
}

fn open_cache(config: &Config) -> Result<TwoTierCache<SniffingDecoder>> {
    TwoTierCache::from_config(SniffingDecoder, config).context("failed to open the cache")
}

fn open_disk_cache(config: &Config) -> Result<TwoTierCache<SniffingDecoder>> {
    let cache = open_cache(config)?;
    if cache.cache_dir().is_none() {
        anyhow::bail!("no cache directory configured");
    }
    Ok(cache)
}

/// Binds `slot` to the next URL that needs a fetch, skipping the ones served from the cache.
fn bind_next(
    coordinator: &DownloadCoordinator<SniffingDecoder>,
    slot: &mut SlotBinding,
    urls: &mut impl Iterator<Item = String>,
) {
    for url in urls.by_ref() {
        if coordinator.bind(slot, &url) == BindOutcome::Scheduled {
            return;
        }
    }
}

pub async fn fetch(
    config: &Config,
    urls: Vec<String>,
    slots: usize,
    progress: bool,
    offline: bool,
) -> Result<()> {
    let cache = Arc::new(open_cache(config)?);
    let loader = ResourceLoader::from_config(config)
        .context("failed to create the http client")?
        .with_connectivity(Arc::new(ConnectivityFlag::new(!offline)));
    let printer = Arc::new(StatusPrinter {
        progress,
        ..Default::default()
    });
    let (coordinator, mut events) = DownloadCoordinator::new(
        cache.clone(),
        loader,
        printer.clone(),
        CoordinatorOptions::from_config(config),
    );

    let mut urls = urls.into_iter();
    let mut slots: Vec<_> = (0..slots.max(1)).map(SlotBinding::new).collect();
    for slot in &mut slots {
        bind_next(&coordinator, slot, &mut urls);
    }

    while slots.iter().any(|slot| slot.status().is_pending()) {
        let Some(event) = events.recv().await else {
            break;
        };
        let slot = &mut slots[event.slot_id];
        if coordinator.handle_event(slot, event) && !slot.status().is_pending() {
            bind_next(&coordinator, slot, &mut urls);
        }
    }
    cache.flush().await;

    let failed = printer.failed.load(Ordering::Relaxed);
    println!(
        "{} delivered, {} failed",
        printer.delivered.load(Ordering::Relaxed),
        failed
    );
    if failed > 0 {
        anyhow::bail!("{failed} images could not be loaded");
    }
    Ok(())
}

pub fn invalidate(config: &Config, prefix: &str) -> Result<()> {
    let cache = open_disk_cache(config)?;
    cache.invalidate_prefix(prefix);
    tracing::info!("Invalidated images starting with `{}`", prefix);
    Ok(())
}

pub fn clear(config: &Config) -> Result<()> {
    let cache = open_disk_cache(config)?;
    cache.clear(true);
    tracing::info!("Cleared the cache");
    Ok(())
}

pub fn path(config: &Config, url: &str) -> Result<()> {
    let cache = open_disk_cache(config)?;
    let path = cache
        .cache_file_path(url)
        .context("no cache directory configured")?;
    let state = if cache.contains_key(url) {
        "cached"
    } else {
        "not cached"
    };
    println!("{} ({state})", path.display());
    Ok(())
}

pub fn cleanup(config: &Config) -> Result<()> {
    let cache = open_disk_cache(config)?;
    let removed = cache.cleanup().context("failed to clean up the cache")?;
    println!("Removed {removed} expired images");
    Ok(())
}
