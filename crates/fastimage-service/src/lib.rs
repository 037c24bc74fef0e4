//! A two-tier resource cache coupled with a per-slot download coordinator.
//!
//! Consumers (typically rows of a recycled list view) own a [`SlotBinding`](coordinator::SlotBinding)
//! each, and ask the [`DownloadCoordinator`](coordinator::DownloadCoordinator) to show a resource
//! identified by its URL in that slot. The coordinator serves the resource from the
//! [`TwoTierCache`](caching::TwoTierCache) when possible, and otherwise schedules a cancellable
//! fetch through the [`ResourceLoader`](download::ResourceLoader). Results are only ever delivered
//! to a slot that is still bound to the key they were fetched for.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod coordinator;
pub mod download;
pub mod logging;
pub mod utils;
