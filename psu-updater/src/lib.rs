// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Firmware lifecycle management for hot-pluggable power supplies
//!
//! The [`ItemUpdater`] keeps track of every firmware version known for the
//! PSUs of a system and of the PSUs themselves. Each version has an
//! [`Activation`], which flashes that version onto the compatible PSUs one
//! at a time. All of it is driven from a single event loop, the
//! [`UpdaterManager`], that is fed through an [`UpdaterHandle`].

pub mod activation;
pub mod association;
pub mod config;
pub mod context;
pub mod fakes;
pub mod image_store;
pub mod inventory;
pub mod item_updater;
pub mod manager;
pub mod manifest;
pub mod tools;
pub mod update_unit;
pub mod version;

pub use activation::{Activation, ActivationStatus, RequestedActivation};
pub use config::Config;
pub use context::UpdaterContext;
pub use item_updater::ItemUpdater;
pub use manager::{
    DiscoveryWait, ShutdownInProgress, UpdaterHandle, UpdaterManager,
};
pub use version::{Version, VersionId, VersionPurpose};

use image_store::ImageStore;
use slog::{info, o, Logger};
use std::sync::Arc;
use tokio::runtime::Handle;
use tools::{SystemdExecutor, UploadDirImageManager, VendorTools};

/// Run the PSU updater until interrupted.
pub async fn run_updater(config: Config, log: Logger) -> Result<(), String> {
    let log = log.new(o!("component" => "psu-updater"));
    let rt = Handle::current();

    let updater_manager = UpdaterManager::new(&log);
    let handle = updater_manager.get_handle();

    let image_store =
        ImageStore::new(&config.images, &config.updater.manifest_file);
    let tools =
        Arc::new(VendorTools::new(&log, rt.clone(), config.tools.clone()));
    let executor = Arc::new(SystemdExecutor::new(
        &log,
        rt,
        &config.tools,
        handle.clone(),
    ));
    let image_manager =
        Arc::new(UploadDirImageManager::new(&log, image_store.clone()));
    let ctx = Arc::new(UpdaterContext {
        log: log.clone(),
        config: config.updater.clone(),
        image_store: image_store.clone(),
        inventory: tools.clone(),
        comparator: tools,
        executor,
        image_manager,
    });

    let discovery = DiscoveryWait {
        settle: config.polling.discovery_settle(),
        deadline: config.polling.discovery_deadline(),
    };
    let event_loop = tokio::spawn(updater_manager.run(ctx, discovery));
    let poller = manager::spawn_inventory_poller(
        &log,
        handle.clone(),
        config.polling.inventory_interval(),
    );
    let watcher = manager::spawn_upload_watcher(
        &log,
        handle.clone(),
        image_store,
        config.updater.software_object_path.clone(),
        config.polling.upload_interval(),
    );

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| format!("waiting for interrupt: {e}"))?;
    info!(log, "interrupted");

    poller.abort();
    watcher.abort();
    // The executor holds a handle too, so the loop has to be told to stop.
    if handle.shutdown().await.is_ok() {
        event_loop
            .await
            .map_err(|e| format!("event loop failed: {e}"))?;
    }
    Ok(())
}
