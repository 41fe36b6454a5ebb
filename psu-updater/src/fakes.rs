// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory collaborators for tests

use crate::config::UpdaterConfig;
use crate::context::UpdaterContext;
use crate::image_store::{ImageManager, ImageStore};
use crate::inventory::{PsuInventory, ToolError, VersionComparator};
use crate::update_unit::{ExecutorError, UpdateExecutor};
use crate::version::VersionId;
use camino::{Utf8Path, Utf8PathBuf};
use slog::Logger;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FakePsu {
    pub present: bool,
    pub model: String,
    pub manufacturer: String,
    pub version: String,
}

impl FakePsu {
    pub fn present(model: &str, version: &str) -> Self {
        Self {
            present: true,
            model: model.to_string(),
            manufacturer: String::new(),
            version: version.to_string(),
        }
    }

    pub fn absent() -> Self {
        Self::default()
    }

    pub fn with_manufacturer(mut self, manufacturer: &str) -> Self {
        self.manufacturer = manufacturer.to_string();
        self
    }
}

/// PSU inventory backed by a map that tests mutate directly.
#[derive(Default)]
pub struct FakeInventory {
    psus: Mutex<BTreeMap<String, FakePsu>>,
    unavailable: AtomicBool,
}

impl FakeInventory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, path: &str, psu: FakePsu) {
        self.psus.lock().unwrap().insert(path.to_string(), psu);
    }

    pub fn remove(&self, path: &str) {
        self.psus.lock().unwrap().remove(path);
    }

    pub fn update<F: FnOnce(&mut FakePsu)>(&self, path: &str, f: F) {
        let mut psus = self.psus.lock().unwrap();
        f(psus.entry(path.to_string()).or_default());
    }

    /// Make every query fail, as if the inventory service were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn with_psu<T>(
        &self,
        path: &str,
        f: impl FnOnce(&FakePsu) -> T,
    ) -> Result<T, ToolError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ToolError::Unavailable("inventory is down".into()));
        }
        self.psus
            .lock()
            .unwrap()
            .get(path)
            .map(f)
            .ok_or_else(|| ToolError::Unavailable(format!("no PSU at {path}")))
    }
}

impl PsuInventory for FakeInventory {
    fn psu_paths(&self) -> Result<Vec<String>, ToolError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ToolError::Unavailable("inventory is down".into()));
        }
        Ok(self.psus.lock().unwrap().keys().cloned().collect())
    }

    fn is_present(&self, psu: &str) -> Result<bool, ToolError> {
        self.with_psu(psu, |p| p.present)
    }

    fn model(&self, psu: &str) -> Result<String, ToolError> {
        self.with_psu(psu, |p| p.model.clone())
    }

    fn manufacturer(&self, psu: &str) -> Result<String, ToolError> {
        self.with_psu(psu, |p| p.manufacturer.clone())
    }

    fn version(&self, psu: &str) -> Result<String, ToolError> {
        self.with_psu(psu, |p| p.version.clone())
    }
}

/// Records the units it is asked to start; never runs anything.
#[derive(Default)]
pub struct FakeExecutor {
    started: Mutex<Vec<String>>,
    fail_start: AtomicBool,
}

impl FakeExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    pub fn last_started(&self) -> Option<String> {
        self.started.lock().unwrap().last().cloned()
    }
}

impl UpdateExecutor for FakeExecutor {
    fn start(&self, unit: &str) -> Result<(), ExecutorError> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(ExecutorError::Rejected {
                unit: unit.to_string(),
                message: "start refused by test".to_string(),
            });
        }
        self.started.lock().unwrap().push(unit.to_string());
        Ok(())
    }
}

/// Picks the lexicographically greatest version.
pub struct LexicographicComparator;

impl VersionComparator for LexicographicComparator {
    fn latest(
        &self,
        versions: &BTreeSet<String>,
    ) -> Result<Option<String>, ToolError> {
        Ok(versions.iter().max().cloned())
    }
}

#[derive(Default)]
pub struct FakeImageManager {
    deleted: Mutex<Vec<(VersionId, Utf8PathBuf)>>,
}

impl FakeImageManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn deleted(&self) -> Vec<(VersionId, Utf8PathBuf)> {
        self.deleted.lock().unwrap().clone()
    }
}

impl ImageManager for FakeImageManager {
    fn delete_image(
        &self,
        version_id: &VersionId,
        image_dir: &Utf8Path,
    ) -> Result<(), std::io::Error> {
        self.deleted
            .lock()
            .unwrap()
            .push((version_id.clone(), image_dir.to_owned()));
        Ok(())
    }
}

/// A full set of fake collaborators.
pub struct FakeBackends {
    pub inventory: Arc<FakeInventory>,
    pub executor: Arc<FakeExecutor>,
    pub image_manager: Arc<FakeImageManager>,
}

impl FakeBackends {
    pub fn new() -> Self {
        Self {
            inventory: FakeInventory::new(),
            executor: FakeExecutor::new(),
            image_manager: FakeImageManager::new(),
        }
    }

    pub fn context(
        &self,
        log: &Logger,
        image_store: ImageStore,
    ) -> Arc<UpdaterContext> {
        Arc::new(UpdaterContext {
            log: log.clone(),
            config: UpdaterConfig::default(),
            image_store,
            inventory: self.inventory.clone(),
            comparator: Arc::new(LexicographicComparator),
            executor: self.executor.clone(),
            image_manager: self.image_manager.clone(),
        })
    }
}
