// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use camino::{Utf8Path, Utf8PathBuf};
use camino_tempfile::Utf8TempDir;
use psu_updater::activation::ActivationSummary;
use psu_updater::config::ImagesConfig;
use psu_updater::fakes::FakeBackends;
use psu_updater::image_store::ImageStore;
use psu_updater::update_unit::JobResult;
use psu_updater::{DiscoveryWait, UpdaterHandle, UpdaterManager, VersionId};
use slog::{o, Logger};
use std::time::Duration;
use tokio::task::JoinHandle;

pub const PSU0: &str = "/com/example/inventory/psu0";
pub const PSU1: &str = "/com/example/inventory/psu1";
pub const SOFTWARE: &str = "/xyz/openbmc_project/software";

pub struct TestContext {
    _root: Utf8TempDir,
    pub log: Logger,
    pub images: ImagesConfig,
    pub store: ImageStore,
    pub fakes: FakeBackends,
    pub handle: UpdaterHandle,
    event_loop: JoinHandle<()>,
}

/// Fakes and image directories, before the event loop is started so that
/// tests can populate them first.
pub struct TestSetup {
    root: Utf8TempDir,
    pub images: ImagesConfig,
    pub fakes: FakeBackends,
}

impl TestSetup {
    pub fn new() -> Self {
        let root = camino_tempfile::tempdir().unwrap();
        let images = ImagesConfig {
            builtin_dir: root.path().join("builtin"),
            persist_dir: root.path().join("persist"),
            upload_dir: root.path().join("upload"),
            always_use_builtin: false,
        };
        std::fs::create_dir_all(&images.builtin_dir).unwrap();
        std::fs::create_dir_all(&images.persist_dir).unwrap();
        Self { root, images, fakes: FakeBackends::new() }
    }

    pub fn start(self) -> TestContext {
        let log = Logger::root(slog::Discard, o!());
        let store = ImageStore::new(&self.images, "MANIFEST");
        let ctx = self.fakes.context(&log, store.clone());
        let manager = UpdaterManager::new(&log);
        let handle = manager.get_handle();
        let discovery = DiscoveryWait {
            settle: Duration::ZERO,
            deadline: Duration::from_secs(1),
        };
        let event_loop = tokio::spawn(manager.run(ctx, discovery));
        TestContext {
            _root: self.root,
            log,
            images: self.images,
            store,
            fakes: self.fakes,
            handle,
            event_loop,
        }
    }
}

impl TestContext {
    pub async fn activations(&self) -> Vec<ActivationSummary> {
        self.handle.get_activations().await.unwrap()
    }

    pub async fn activation(&self, version: &str) -> Option<ActivationSummary> {
        self.activations()
            .await
            .into_iter()
            .find(|a| a.version == version)
    }

    /// Report the outcome of the most recently started update unit, and
    /// wait for the event loop to handle it.
    pub async fn complete_last_unit(&self, result: JobResult) {
        let unit = self.fakes.executor.last_started().unwrap();
        self.handle.job_completed(unit, result).await.unwrap();
        self.activations().await;
    }

    pub async fn teardown(self) {
        self.handle.shutdown().await.unwrap();
        self.event_loop.await.unwrap();
    }
}

pub fn write_image(dir: &Utf8Path, version: &str, model: &str) {
    std::fs::create_dir_all(dir).unwrap();
    std::fs::write(
        dir.join("MANIFEST"),
        format!(
            "purpose=xyz.openbmc_project.Software.Version.VersionPurpose.PSU\n\
             version={version}\n\
             extended_version=manufacturer=ACME,model={model}\n"
        ),
    )
    .unwrap();
    std::fs::write(dir.join("image.bin"), version.as_bytes()).unwrap();
}

pub fn id(version: &str) -> VersionId {
    VersionId::for_version(version).unwrap()
}

pub fn object_path(version: &str) -> String {
    format!("{SOFTWARE}/{}", id(version))
}

pub fn targets(summary: &ActivationSummary) -> Vec<String> {
    let mut targets: Vec<String> = summary
        .associations
        .targets(psu_updater::association::ACTIVATION_ROLE)
        .map(str::to_string)
        .collect();
    targets.sort();
    targets
}

pub fn upload_dir(images: &ImagesConfig, name: &str) -> Utf8PathBuf {
    images.upload_dir.join(name)
}
