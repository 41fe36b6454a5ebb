// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The event loop that owns the coordinator, and the tasks feeding it

use crate::activation::{
    ActivationStatus, ActivationSummary, RequestedActivation,
};
use crate::association::AssociationSet;
use crate::context::UpdaterContext;
use crate::image_store::ImageStore;
use crate::inventory::{PsuInventory, PsuStatus};
use crate::item_updater::ItemUpdater;
use crate::manifest::Manifest;
use crate::update_unit::JobResult;
use crate::version::{VersionId, VersionPurpose};
use camino::Utf8PathBuf;
use display_error_chain::DisplayErrorChain;
use slog::{debug, error, info, o, warn, Logger};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

// Notifications arrive in bursts when PSUs are plugged in; leave room for
// them plus a few outstanding queries.
const CHANNEL_CAPACITY: usize = 64;

/// How often PSU enumeration is retried while waiting for discovery.
const DISCOVERY_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Channel errors result only from shutdown of the event loop.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("PSU updater is shutting down")]
pub struct ShutdownInProgress;

#[derive(Debug)]
enum UpdaterRequest {
    PresenceChanged {
        psu: String,
        present: bool,
    },
    ModelChanged {
        psu: String,
        model: String,
    },
    PsuInterfacesAdded {
        psu: String,
        has_psu_interface: bool,
        present: Option<bool>,
    },
    VersionDiscovered {
        object_path: String,
        version: String,
        purpose: VersionPurpose,
        file_path: Option<Utf8PathBuf>,
    },
    JobCompleted {
        unit: String,
        result: JobResult,
    },
    PollInventory,
    RequestActivation {
        id: VersionId,
        requested: RequestedActivation,
        reply_tx: oneshot::Sender<Option<ActivationStatus>>,
    },
    GetActivations {
        reply_tx: oneshot::Sender<Vec<ActivationSummary>>,
    },
    GetAssociations {
        reply_tx: oneshot::Sender<AssociationSet>,
    },
    GetPsuStatus {
        reply_tx: oneshot::Sender<BTreeMap<String, PsuStatus>>,
    },
    Erase {
        id: VersionId,
        reply_tx: oneshot::Sender<bool>,
    },
    DeleteAll {
        reply_tx: oneshot::Sender<Vec<VersionId>>,
    },
    Shutdown {
        reply_tx: oneshot::Sender<()>,
    },
}

/// A mechanism for interacting with the `UpdaterManager`
#[derive(Debug, Clone)]
pub struct UpdaterHandle {
    tx: mpsc::Sender<UpdaterRequest>,
}

impl UpdaterHandle {
    async fn send(
        &self,
        request: UpdaterRequest,
    ) -> Result<(), ShutdownInProgress> {
        self.tx.send(request).await.map_err(|_| ShutdownInProgress)
    }

    async fn query<T>(
        &self,
        make_request: impl FnOnce(oneshot::Sender<T>) -> UpdaterRequest,
    ) -> Result<T, ShutdownInProgress> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(make_request(reply_tx)).await?;
        reply_rx.await.map_err(|_| ShutdownInProgress)
    }

    pub async fn presence_changed(
        &self,
        psu: String,
        present: bool,
    ) -> Result<(), ShutdownInProgress> {
        self.send(UpdaterRequest::PresenceChanged { psu, present }).await
    }

    pub async fn model_changed(
        &self,
        psu: String,
        model: String,
    ) -> Result<(), ShutdownInProgress> {
        self.send(UpdaterRequest::ModelChanged { psu, model }).await
    }

    pub async fn psu_interfaces_added(
        &self,
        psu: String,
        has_psu_interface: bool,
        present: Option<bool>,
    ) -> Result<(), ShutdownInProgress> {
        self.send(UpdaterRequest::PsuInterfacesAdded {
            psu,
            has_psu_interface,
            present,
        })
        .await
    }

    pub async fn version_discovered(
        &self,
        object_path: String,
        version: String,
        purpose: VersionPurpose,
        file_path: Option<Utf8PathBuf>,
    ) -> Result<(), ShutdownInProgress> {
        self.send(UpdaterRequest::VersionDiscovered {
            object_path,
            version,
            purpose,
            file_path,
        })
        .await
    }

    pub async fn job_completed(
        &self,
        unit: String,
        result: JobResult,
    ) -> Result<(), ShutdownInProgress> {
        self.send(UpdaterRequest::JobCompleted { unit, result }).await
    }

    pub async fn poll_inventory(&self) -> Result<(), ShutdownInProgress> {
        self.send(UpdaterRequest::PollInventory).await
    }

    /// Returns the resulting status, or `None` if the version is unknown.
    pub async fn request_activation(
        &self,
        id: VersionId,
        requested: RequestedActivation,
    ) -> Result<Option<ActivationStatus>, ShutdownInProgress> {
        self.query(|reply_tx| UpdaterRequest::RequestActivation {
            id,
            requested,
            reply_tx,
        })
        .await
    }

    pub async fn get_activations(
        &self,
    ) -> Result<Vec<ActivationSummary>, ShutdownInProgress> {
        self.query(|reply_tx| UpdaterRequest::GetActivations { reply_tx })
            .await
    }

    /// The active, functional and updateable images.
    pub async fn get_associations(
        &self,
    ) -> Result<AssociationSet, ShutdownInProgress> {
        self.query(|reply_tx| UpdaterRequest::GetAssociations { reply_tx })
            .await
    }

    pub async fn get_psu_status(
        &self,
    ) -> Result<BTreeMap<String, PsuStatus>, ShutdownInProgress> {
        self.query(|reply_tx| UpdaterRequest::GetPsuStatus { reply_tx }).await
    }

    pub async fn erase(
        &self,
        id: VersionId,
    ) -> Result<bool, ShutdownInProgress> {
        self.query(|reply_tx| UpdaterRequest::Erase { id, reply_tx }).await
    }

    pub async fn delete_all(
        &self,
    ) -> Result<Vec<VersionId>, ShutdownInProgress> {
        self.query(|reply_tx| UpdaterRequest::DeleteAll { reply_tx }).await
    }

    /// Stop the event loop once the requests queued so far are handled.
    pub async fn shutdown(&self) -> Result<(), ShutdownInProgress> {
        self.query(|reply_tx| UpdaterRequest::Shutdown { reply_tx }).await
    }
}

/// How long to wait for PSUs to show up before the first scan.
#[derive(Clone, Copy, Debug)]
pub struct DiscoveryWait {
    /// Done once no new PSU has appeared for this long...
    pub settle: Duration,
    /// ...or this much time has passed in total.
    pub deadline: Duration,
}

/// Poll PSU enumeration until it stops changing. Returns the PSUs seen.
///
/// PSUs do not all show up at once after boot. Scanning too early would
/// activate an image on some PSUs only, and then again on the late ones.
pub fn wait_for_psu_discovery(
    log: &Logger,
    inventory: &dyn PsuInventory,
    wait: DiscoveryWait,
) -> BTreeSet<String> {
    let start = Instant::now();
    let mut last_change = start;
    let mut seen = BTreeSet::new();
    loop {
        match inventory.psu_paths() {
            Ok(paths) => {
                for psu in paths {
                    if !seen.contains(&psu) {
                        info!(log, "discovered PSU"; "psu" => &psu);
                        seen.insert(psu);
                        last_change = Instant::now();
                    }
                }
            }
            Err(err) => {
                debug!(log, "PSU inventory not available yet";
                    "error" => %DisplayErrorChain::new(&err),
                );
            }
        }

        let now = Instant::now();
        if now.duration_since(last_change) >= wait.settle {
            break;
        }
        if now.duration_since(start) >= wait.deadline {
            warn!(log, "PSU discovery did not settle before the deadline";
                "found" => seen.len(),
            );
            break;
        }
        let until_settled = wait.settle - now.duration_since(last_change);
        let until_deadline = wait.deadline - now.duration_since(start);
        std::thread::sleep(
            DISCOVERY_POLL_INTERVAL.min(until_settled).min(until_deadline),
        );
    }
    info!(log, "PSU discovery done";
        "found" => seen.len(),
        "elapsed" => ?start.elapsed(),
    );
    seen
}

/// The entity that owns all activation and inventory state
///
/// Every change goes through a single loop running on a blocking thread:
/// each request is handled to completion before the next one is received,
/// so the coordinator needs no locking. Collaborator calls made from the
/// loop are synchronous and individually bounded.
pub struct UpdaterManager {
    log: Logger,
    tx: mpsc::Sender<UpdaterRequest>,
    rx: mpsc::Receiver<UpdaterRequest>,
}

impl UpdaterManager {
    pub fn new(log: &Logger) -> UpdaterManager {
        let log = log.new(o!("component" => "UpdaterManager"));
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        UpdaterManager { log, tx, rx }
    }

    pub fn get_handle(&self) -> UpdaterHandle {
        UpdaterHandle { tx: self.tx.clone() }
    }

    /// Wait for PSU discovery, scan everything once, then handle requests
    /// until shut down or until every handle is dropped.
    pub async fn run(
        self,
        ctx: Arc<UpdaterContext>,
        discovery: DiscoveryWait,
    ) {
        let log = self.log.clone();
        let result = tokio::task::spawn_blocking(move || {
            self.run_blocking(ctx, discovery)
        })
        .await;
        if let Err(err) = result {
            error!(log, "event loop panicked";
                "error" => %DisplayErrorChain::new(&err),
            );
        }
    }

    fn run_blocking(self, ctx: Arc<UpdaterContext>, discovery: DiscoveryWait) {
        // Only handles keep the channel open.
        let UpdaterManager { log, tx, mut rx } = self;
        drop(tx);

        wait_for_psu_discovery(&log, ctx.inventory.as_ref(), discovery);
        let mut updater = ItemUpdater::new(ctx);
        updater.process_psu_image_and_sync();
        info!(log, "initial scan done";
            "versions" => updater.version_strings().len(),
            "psus" => updater.psu_status().len(),
        );

        while let Some(request) = rx.blocking_recv() {
            debug!(log, "handling request"; "request" => ?request);
            match request {
                UpdaterRequest::PresenceChanged { psu, present } => {
                    updater.on_presence_changed(&psu, present);
                }
                UpdaterRequest::ModelChanged { psu, model } => {
                    updater.on_model_changed(&psu, &model);
                }
                UpdaterRequest::PsuInterfacesAdded {
                    psu,
                    has_psu_interface,
                    present,
                } => {
                    updater.on_psu_interfaces_added(
                        &psu,
                        has_psu_interface,
                        present,
                    );
                }
                UpdaterRequest::VersionDiscovered {
                    object_path,
                    version,
                    purpose,
                    file_path,
                } => {
                    updater.on_version_discovered(
                        &object_path,
                        &version,
                        purpose,
                        file_path.as_deref(),
                    );
                }
                UpdaterRequest::JobCompleted { unit, result } => {
                    updater.on_job_completed(&unit, result);
                }
                UpdaterRequest::PollInventory => updater.poll_inventory(),
                UpdaterRequest::RequestActivation {
                    id,
                    requested,
                    reply_tx,
                } => {
                    let status = updater.request_activation(&id, requested);
                    let _ = reply_tx.send(status);
                }
                UpdaterRequest::GetActivations { reply_tx } => {
                    let _ = reply_tx.send(updater.activations());
                }
                UpdaterRequest::GetAssociations { reply_tx } => {
                    let _ = reply_tx.send(updater.associations().clone());
                }
                UpdaterRequest::GetPsuStatus { reply_tx } => {
                    let _ = reply_tx.send(updater.psu_status().clone());
                }
                UpdaterRequest::Erase { id, reply_tx } => {
                    let _ = reply_tx.send(updater.erase(&id));
                }
                UpdaterRequest::DeleteAll { reply_tx } => {
                    let _ = reply_tx.send(updater.delete_all());
                }
                UpdaterRequest::Shutdown { reply_tx } => {
                    info!(log, "shutting down");
                    let _ = reply_tx.send(());
                    break;
                }
            }
        }
    }
}

/// Ask the event loop to re-read the PSU inventory every `period`.
pub fn spawn_inventory_poller(
    log: &Logger,
    handle: UpdaterHandle,
    period: Duration,
) -> JoinHandle<()> {
    let log = log.new(o!("component" => "InventoryPoller"));
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; the initial scan covers it.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if handle.poll_inventory().await.is_err() {
                debug!(log, "updater stopped");
                return;
            }
        }
    })
}

/// An image found in the upload directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadedImage {
    pub object_path: String,
    pub version: String,
    pub purpose: VersionPurpose,
    pub dir: Utf8PathBuf,
}

/// Images in the upload directory that are not in `seen` yet. Directories
/// that have disappeared are forgotten so that they are reported again if
/// they come back.
pub fn scan_uploads(
    log: &Logger,
    store: &ImageStore,
    software_object_path: &str,
    seen: &mut BTreeSet<Utf8PathBuf>,
) -> Vec<UploadedImage> {
    let entries = match store.upload_dir().read_dir_utf8() {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            seen.clear();
            return Vec::new();
        }
        Err(err) => {
            warn!(log, "failed to read upload directory";
                "dir" => %store.upload_dir(),
                "error" => %err,
            );
            return Vec::new();
        }
    };

    let mut present = BTreeSet::new();
    let mut found = Vec::new();
    for entry in entries.flatten() {
        if !entry.file_type().is_ok_and(|t| t.is_dir()) {
            continue;
        }
        let dir = entry.path().to_owned();
        present.insert(dir.clone());
        if seen.contains(&dir) {
            continue;
        }
        // The manifest may still be being written; retry on the next scan.
        let Ok(manifest) = Manifest::from_file(&store.manifest_path(&dir))
        else {
            continue;
        };
        seen.insert(dir.clone());
        if manifest.version.is_empty() {
            warn!(log, "uploaded image has no version"; "dir" => %dir);
            continue;
        }
        found.push(UploadedImage {
            object_path: format!(
                "{}/{}",
                software_object_path,
                entry.file_name()
            ),
            version: manifest.version,
            purpose: VersionPurpose::parse(&manifest.purpose),
            dir,
        });
    }
    seen.retain(|dir| present.contains(dir));
    found
}

/// Report images dropped into the upload directory to the event loop.
pub fn spawn_upload_watcher(
    log: &Logger,
    handle: UpdaterHandle,
    store: ImageStore,
    software_object_path: String,
    period: Duration,
) -> JoinHandle<()> {
    let log = log.new(o!("component" => "UploadWatcher"));
    tokio::spawn(async move {
        let mut seen = BTreeSet::new();
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            for image in
                scan_uploads(&log, &store, &software_object_path, &mut seen)
            {
                info!(log, "found uploaded image";
                    "dir" => %image.dir,
                    "version" => &image.version,
                );
                let result = handle
                    .version_discovered(
                        image.object_path,
                        image.version,
                        image.purpose,
                        Some(image.dir),
                    )
                    .await;
                if result.is_err() {
                    debug!(log, "updater stopped");
                    return;
                }
            }
        }
    })
}
