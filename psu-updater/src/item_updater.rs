// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Coordinator for PSU inventory and firmware versions
//!
//! The [`ItemUpdater`] owns every [`Activation`], keyed by version id, along
//! with the reverse index from PSU inventory path to the version it runs. It
//! reacts to PSU and image discovery events and converges present PSUs onto
//! the latest image.

use crate::activation::{
    Activation, ActivationStatus, ActivationSummary, RequestedActivation,
};
use crate::association::{
    ActivationListener, AssociationInterface, AssociationSet, ACTIVATION_ROLE,
    ACTIVE_ROLE, FUNCTIONAL_ROLE, UPDATEABLE_ROLE,
};
use crate::context::UpdaterContext;
use crate::image_store::{ScanError, StoredImage};
use crate::inventory::{PsuDiscoveryState, PsuStatus, PsuTable};
use crate::update_unit::JobResult;
use crate::version::{Version, VersionId, VersionPurpose};
use camino::Utf8Path;
use display_error_chain::DisplayErrorChain;
use slog::{debug, error, info, o, warn, Logger};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

pub struct ItemUpdater {
    log: Logger,
    ctx: Arc<UpdaterContext>,
    activations: BTreeMap<VersionId, Activation>,
    /// Version string of every activation.
    version_strings: BTreeSet<String>,
    /// PSU inventory path to the version it is running.
    psu_activations: BTreeMap<String, VersionId>,
    psu_status: BTreeMap<String, PsuStatus>,
    /// PSUs whose PSU interface has been seen, possibly ahead of their Item
    /// interface.
    psu_interface_paths: BTreeSet<String>,
    /// Active, functional and updateable images.
    associations: AssociationSet,
}

impl ItemUpdater {
    pub fn new(ctx: Arc<UpdaterContext>) -> Self {
        let log = ctx.log.new(o!("component" => "ItemUpdater"));
        Self {
            log,
            ctx,
            activations: BTreeMap::new(),
            version_strings: BTreeSet::new(),
            psu_activations: BTreeMap::new(),
            psu_status: BTreeMap::new(),
            psu_interface_paths: BTreeSet::new(),
            associations: AssociationSet::new(),
        }
    }

    pub fn activation(&self, id: &VersionId) -> Option<&Activation> {
        self.activations.get(id)
    }

    pub fn activations(&self) -> Vec<ActivationSummary> {
        self.activations.values().map(Activation::summary).collect()
    }

    pub fn associations(&self) -> &AssociationSet {
        &self.associations
    }

    pub fn psu_status(&self) -> &BTreeMap<String, PsuStatus> {
        &self.psu_status
    }

    pub fn psu_activation(&self, psu: &str) -> Option<&VersionId> {
        self.psu_activations.get(psu)
    }

    pub fn version_strings(&self) -> &BTreeSet<String> {
        &self.version_strings
    }

    /// Run `f` on the activation for `id` with `self` as its context.
    ///
    /// The activation is taken out of the map for the duration of the call
    /// so that it can be borrowed alongside the coordinator.
    fn with_activation<T>(
        &mut self,
        id: &VersionId,
        f: impl FnOnce(&mut Activation, &mut Self) -> T,
    ) -> Option<T> {
        let mut activation = self.activations.remove(id)?;
        let result = f(&mut activation, self);
        self.activations.insert(id.clone(), activation);
        Some(result)
    }

    fn insert_activation(&mut self, activation: Activation) {
        self.version_strings.insert(activation.version().version().to_string());
        self.activations.insert(activation.id().clone(), activation);
    }

    /// Set the requested activation of the version `id`. Returns the
    /// resulting status, or `None` if there is no such version.
    pub fn request_activation(
        &mut self,
        id: &VersionId,
        requested: RequestedActivation,
    ) -> Option<ActivationStatus> {
        let status = self.with_activation(id, |activation, updater| {
            activation.request_activation(requested, updater)
        });
        if status.is_none() {
            warn!(self.log, "activation requested for unknown version";
                "version_id" => %id,
            );
        }
        status
    }

    /// A firmware image became visible.
    pub fn on_version_discovered(
        &mut self,
        object_path: &str,
        version: &str,
        purpose: VersionPurpose,
        file_path: Option<&Utf8Path>,
    ) {
        if purpose != VersionPurpose::Psu {
            debug!(self.log, "ignoring non-PSU image";
                "object_path" => object_path,
                "purpose" => ?purpose,
            );
            return;
        }
        let Some(file_path) = file_path.filter(|p| !p.as_str().is_empty())
        else {
            return;
        };
        let store = &self.ctx.image_store;
        if store.always_use_builtin() && !store.is_builtin(file_path) {
            info!(self.log, "ignoring image outside the builtin directory";
                "path" => %file_path,
            );
            return;
        }
        let id = match VersionId::for_version(version) {
            Ok(id) => id,
            Err(err) => {
                error!(self.log, "cannot identify image";
                    "object_path" => object_path,
                    "error" => %err,
                );
                return;
            }
        };
        if self.activations.contains_key(&id) {
            debug!(self.log, "image already known"; "version_id" => %id);
            return;
        }

        let extended_version = match store.extended_version(file_path) {
            Ok(extended_version) => extended_version,
            Err(err) => {
                warn!(self.log, "failed to read image manifest";
                    "path" => %file_path,
                    "error" => %DisplayErrorChain::new(&err),
                );
                String::new()
            }
        };
        info!(self.log, "discovered PSU image";
            "version_id" => %id,
            "version" => version,
            "path" => %file_path,
        );
        let version = Version::new(
            id,
            version.to_string(),
            extended_version,
            purpose,
            Some(file_path.to_owned()),
        );
        let activation = Activation::new(
            self.ctx.clone(),
            version,
            ActivationStatus::Ready,
            AssociationSet::with(
                ACTIVATION_ROLE,
                self.ctx.config.inventory_path_base.clone(),
            ),
        );
        self.insert_activation(activation);
    }

    /// Register every PSU in the inventory and react to its presence.
    pub fn process_psu_image(&mut self) {
        let psu_paths = match self.ctx.inventory.psu_paths() {
            Ok(paths) => paths,
            Err(err) => {
                // The inventory may not be populated yet.
                debug!(self.log, "failed to enumerate PSUs";
                    "error" => %DisplayErrorChain::new(&err),
                );
                return;
            }
        };
        for psu in psu_paths {
            self.add_psu_to_status_map(&psu);
            match self.ctx.inventory.is_present(&psu) {
                Ok(present) => {
                    if let Some(status) = self.psu_status.get_mut(&psu) {
                        status.present = present;
                    }
                    self.handle_psu_presence_changed(&psu);
                }
                Err(err) => {
                    debug!(self.log, "PSU presence not available yet";
                        "psu" => &psu,
                        "error" => %DisplayErrorChain::new(&err),
                    );
                }
            }
        }
    }

    fn add_psu_to_status_map(&mut self, psu: &str) {
        if !self.psu_status.contains_key(psu) {
            debug!(self.log, "tracking PSU"; "psu" => psu);
            self.psu_status.insert(psu.to_string(), PsuStatus::default());
        }
    }

    /// Bring the activations in line with the recorded presence of `psu`.
    pub fn handle_psu_presence_changed(&mut self, psu: &str) {
        let inventory = &self.ctx.inventory;
        let Some(status) = self.psu_status.get_mut(psu) else {
            return;
        };

        if !status.present {
            status.model.clear();
            status.manufacturer.clear();
            if self.psu_activations.contains_key(psu) {
                info!(self.log, "PSU removed"; "psu" => psu);
                self.remove_psu_object(psu);
            }
            return;
        }

        match inventory.model(psu) {
            Ok(model) => status.model = model,
            Err(err) => {
                debug!(self.log, "PSU model not available yet";
                    "psu" => psu,
                    "error" => %DisplayErrorChain::new(&err),
                );
            }
        }
        if let Ok(manufacturer) = inventory.manufacturer(psu) {
            status.manufacturer = manufacturer;
        }
        let version = match inventory.version(psu) {
            Ok(version) => version,
            Err(err) => {
                debug!(self.log, "PSU version not available yet";
                    "psu" => psu,
                    "error" => %DisplayErrorChain::new(&err),
                );
                return;
            }
        };
        if !version.is_empty() && !self.psu_activations.contains_key(psu) {
            self.create_psu_object(psu, &version);
        }
    }

    /// Record that `psu` runs `version`.
    fn create_psu_object(&mut self, psu: &str, version: &str) {
        let id = match VersionId::for_version(version) {
            Ok(id) => id,
            Err(err) => {
                error!(self.log, "cannot identify PSU version";
                    "psu" => psu,
                    "error" => %err,
                );
                return;
            }
        };

        if let Some(activation) = self.activations.get_mut(&id) {
            activation.associations_mut().add(ACTIVATION_ROLE, psu);
        } else {
            info!(self.log, "found running PSU firmware";
                "psu" => psu,
                "version" => version,
                "version_id" => %id,
            );
            let version = Version::new(
                id.clone(),
                version.to_string(),
                String::new(),
                VersionPurpose::Psu,
                None,
            );
            let activation = Activation::new(
                self.ctx.clone(),
                version,
                ActivationStatus::Active,
                AssociationSet::with(ACTIVATION_ROLE, psu),
            );
            let object_path = activation.object_path().to_string();
            self.insert_activation(activation);
            self.create_active_association(&object_path);
            self.add_functional_association(&object_path);
            self.add_updateable_association(&object_path);
        }
        self.psu_activations.insert(psu.to_string(), id);
    }

    /// Forget that `psu` runs anything, and drop its version once nothing
    /// else refers to it.
    fn remove_psu_object(&mut self, psu: &str) {
        let Some(id) = self.psu_activations.remove(psu) else {
            error!(self.log, "no activation found for PSU"; "psu" => psu);
            return;
        };
        let Some(activation) = self.activations.get_mut(&id) else {
            error!(self.log, "PSU refers to a missing activation";
                "psu" => psu,
                "version_id" => %id,
            );
            return;
        };
        activation.associations_mut().remove_target(psu);
        if activation.associations().is_empty() {
            self.erase(&id);
        }
    }

    /// Remove the activation and version for `id`.
    pub fn erase(&mut self, id: &VersionId) -> bool {
        let Some(activation) = self.activations.remove(id) else {
            error!(self.log, "failed to find version to remove";
                "version_id" => %id,
            );
            return false;
        };
        info!(self.log, "removing version";
            "version_id" => %id,
            "version" => activation.version().version(),
        );
        self.version_strings.remove(activation.version().version());
        self.remove_association(activation.object_path());
        self.psu_activations.retain(|_, version_id| version_id != id);
        true
    }

    /// Remove every version that is neither active nor being activated.
    pub fn delete_all(&mut self) -> Vec<VersionId> {
        let ids: Vec<VersionId> = self
            .activations
            .values()
            .filter(|a| {
                !matches!(
                    a.status(),
                    ActivationStatus::Active | ActivationStatus::Activating
                )
            })
            .map(|a| a.id().clone())
            .collect();
        for id in &ids {
            self.erase(id);
        }
        ids
    }

    /// The presence of a tracked PSU changed.
    pub fn on_presence_changed(&mut self, psu: &str, present: bool) {
        let Some(status) = self.psu_status.get_mut(psu) else {
            debug!(self.log, "presence change for untracked PSU"; "psu" => psu);
            return;
        };
        status.present = present;
        self.handle_psu_presence_changed(psu);
        if present {
            self.process_stored_image();
            self.sync_to_latest_image();
        }
    }

    /// The model of a tracked PSU became known or changed.
    pub fn on_model_changed(&mut self, psu: &str, model: &str) {
        let Some(status) = self.psu_status.get_mut(psu) else {
            debug!(self.log, "model change for untracked PSU"; "psu" => psu);
            return;
        };
        status.model = model.to_string();
        if !status.present {
            return;
        }
        // The version usually becomes readable together with the model.
        self.handle_psu_presence_changed(psu);
        self.process_stored_image();
        self.sync_to_latest_image();
    }

    /// Interfaces were added to an inventory object.
    ///
    /// A PSU is only registered once both its PSU interface and its Item
    /// interface (carrying `present`) have been seen, which may happen in
    /// separate notifications.
    pub fn on_psu_interfaces_added(
        &mut self,
        psu: &str,
        has_psu_interface: bool,
        present: Option<bool>,
    ) {
        if has_psu_interface {
            self.psu_interface_paths.insert(psu.to_string());
        }
        let Some(present) = present else {
            return;
        };
        if !self.psu_interface_paths.contains(psu)
            || self.psu_status.contains_key(psu)
        {
            return;
        }
        info!(self.log, "PSU added to inventory";
            "psu" => psu,
            "present" => present,
        );
        self.add_psu_to_status_map(psu);
        if let Some(status) = self.psu_status.get_mut(psu) {
            status.present = present;
        }
        self.handle_psu_presence_changed(psu);
        if present {
            self.process_stored_image();
            self.sync_to_latest_image();
        }
    }

    /// Re-read the inventory and feed any differences through the same
    /// handlers as notifications.
    ///
    /// PSUs that are present but whose version could not be read yet are
    /// retried on every poll.
    pub fn poll_inventory(&mut self) {
        let psu_paths = match self.ctx.inventory.psu_paths() {
            Ok(paths) => paths,
            Err(err) => {
                warn!(self.log, "failed to enumerate PSUs";
                    "error" => %DisplayErrorChain::new(&err),
                );
                return;
            }
        };
        for psu in psu_paths {
            let present = match self.ctx.inventory.is_present(&psu) {
                Ok(present) => present,
                Err(err) => {
                    debug!(self.log, "PSU presence not available";
                        "psu" => &psu,
                        "error" => %DisplayErrorChain::new(&err),
                    );
                    continue;
                }
            };
            let Some(status) = self.psu_status.get(&psu) else {
                self.on_psu_interfaces_added(&psu, true, Some(present));
                continue;
            };
            if status.present != present {
                self.on_presence_changed(&psu, present);
                continue;
            }
            let state = status
                .discovery_state(self.psu_activations.contains_key(&psu));
            if state == PsuDiscoveryState::Absent {
                continue;
            }
            let model = self.ctx.inventory.model(&psu).unwrap_or_default();
            if !model.is_empty() && model != status.model {
                self.on_model_changed(&psu, &model);
                continue;
            }
            match state {
                PsuDiscoveryState::PresentNoModel
                | PsuDiscoveryState::PresentWithModel => {
                    // Its running version may be readable by now.
                    self.handle_psu_presence_changed(&psu);
                    if self.psu_activations.contains_key(&psu) {
                        self.process_stored_image();
                        self.sync_to_latest_image();
                    }
                }
                PsuDiscoveryState::Absent | PsuDiscoveryState::Associated => (),
            }
        }
    }

    /// Look for stored images for the model of the known PSUs.
    pub fn process_stored_image(&mut self) {
        let ctx = self.ctx.clone();
        let model = self.known_model();
        for dir in ctx.image_store.scan_dirs() {
            match ctx.image_store.scan_directory(dir, model.as_deref()) {
                Ok(Some(image)) => self.add_stored_image(image),
                Ok(None) => (),
                Err(ScanError::NotFound(err)) => {
                    warn!(self.log, "unable to find PSU firmware in directory";
                        "dir" => %dir,
                        "error" => %err,
                    );
                }
                Err(ScanError::Malformed(err)) => {
                    error!(self.log, "unable to find PSU firmware in directory";
                        "dir" => %dir,
                        "error" => %DisplayErrorChain::new(&err),
                    );
                }
            }
        }
    }

    /// Model of any PSU found so far. Inventory information may not be
    /// available yet.
    fn known_model(&self) -> Option<String> {
        self.psu_status
            .values()
            .find(|status| !status.model.is_empty())
            .map(|status| status.model.clone())
    }

    fn add_stored_image(&mut self, image: StoredImage) {
        info!(self.log, "found PSU firmware image directory";
            "path" => %image.dir,
        );
        let id = match VersionId::for_version(&image.version) {
            Ok(id) => id,
            Err(err) => {
                error!(self.log, "cannot identify stored image";
                    "path" => %image.dir,
                    "error" => %err,
                );
                return;
            }
        };

        if let Some(activation) = self.activations.get_mut(&id) {
            // A running PSU uses this version; it becomes installable.
            let version = activation.version_mut();
            version.set_path(image.dir);
            if version.extended_version().is_empty() {
                version.set_extended_version(image.extended_version);
            }
            return;
        }

        let version = Version::new(
            id,
            image.version,
            image.extended_version,
            VersionPurpose::Psu,
            Some(image.dir),
        );
        let activation = Activation::new(
            self.ctx.clone(),
            version,
            ActivationStatus::Ready,
            AssociationSet::new(),
        );
        self.insert_activation(activation);
    }

    /// The version every PSU should run.
    pub fn latest_version_id(&self) -> Option<VersionId> {
        let store = &self.ctx.image_store;
        let latest = if store.always_use_builtin() {
            self.activations
                .values()
                .map(Activation::version)
                .find(|v| v.path().is_some_and(|p| store.is_builtin(p)))
                .map(|v| v.version().to_string())
        } else {
            match self.ctx.comparator.latest(&self.version_strings) {
                Ok(latest) => latest,
                Err(err) => {
                    error!(self.log, "failed to compare versions";
                        "error" => %DisplayErrorChain::new(&err),
                    );
                    None
                }
            }
        };
        let latest = latest.filter(|v| !v.is_empty())?;

        let id = self
            .activations
            .values()
            .find(|a| a.version().version() == latest)
            .map(|a| a.id().clone());
        if id.is_none() {
            error!(self.log, "unable to find version id for latest version";
                "version" => latest,
            );
        }
        id
    }

    /// Activate the latest image if a present PSU does not run it.
    pub fn sync_to_latest_image(&mut self) {
        let Some(id) = self.latest_version_id() else {
            return;
        };
        let Some(activation) = self.activations.get(&id) else {
            error!(self.log, "unable to find activation for latest version";
                "version_id" => %id,
            );
            return;
        };
        if activation.status() == ActivationStatus::Failed
            && activation.job_failed()
        {
            debug!(self.log, "latest version failed to install, not retrying";
                "version_id" => %id,
            );
            return;
        }

        let psu_paths = match self.ctx.inventory.psu_paths() {
            Ok(paths) => paths,
            Err(err) => {
                warn!(self.log, "failed to enumerate PSUs";
                    "error" => %DisplayErrorChain::new(&err),
                );
                return;
            }
        };
        let behind = psu_paths.iter().any(|psu| {
            self.psu_status.get(psu).is_some_and(|s| s.present)
                && !activation.associations().is_associated(psu)
        });
        if behind {
            info!(self.log, "automatically updating PSUs"; "version_id" => %id);
            self.request_activation(&id, RequestedActivation::Active);
        }
    }

    pub fn process_psu_image_and_sync(&mut self) {
        self.process_psu_image();
        self.process_stored_image();
        self.sync_to_latest_image();
    }

    /// Deliver the completion of an update unit to the activation running
    /// it.
    pub fn on_job_completed(&mut self, unit: &str, result: JobResult) {
        let id = self
            .activations
            .values()
            .find(|a| a.current_unit() == Some(unit))
            .map(|a| a.id().clone());
        let Some(id) = id else {
            debug!(self.log, "ignoring unrelated unit"; "unit" => unit);
            return;
        };
        self.with_activation(&id, |activation, updater| {
            activation.on_job_completed(unit, result, updater)
        });
    }
}

impl AssociationInterface for ItemUpdater {
    fn create_active_association(&mut self, path: &str) {
        self.associations.add(ACTIVE_ROLE, path);
    }

    fn add_functional_association(&mut self, path: &str) {
        self.associations.add(FUNCTIONAL_ROLE, path);
    }

    fn add_updateable_association(&mut self, path: &str) {
        self.associations.add(UPDATEABLE_ROLE, path);
    }

    fn remove_association(&mut self, path: &str) {
        self.associations.remove_target(path);
    }
}

impl PsuTable for ItemUpdater {
    fn known_psus(&self) -> Vec<(String, PsuStatus)> {
        self.psu_status
            .iter()
            .map(|(psu, status)| (psu.clone(), status.clone()))
            .collect()
    }
}

impl ActivationListener for ItemUpdater {
    fn on_update_done(&mut self, version_id: &VersionId, psu: &str) {
        // A PSU only belongs to the image it runs.
        let previous: Vec<VersionId> = self
            .activations
            .iter()
            .filter(|(id, activation)| {
                *id != version_id
                    && activation.associations().is_associated(psu)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in previous {
            let empty = self.activations.get_mut(&id).is_some_and(|a| {
                a.associations_mut().remove_target(psu);
                a.associations().is_empty()
            });
            if empty {
                self.erase(&id);
            }
        }
        self.psu_activations.insert(psu.to_string(), version_id.clone());
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::ImagesConfig;
    use crate::fakes::{FakeBackends, FakePsu};
    use crate::image_store::ImageStore;
    use camino::Utf8PathBuf;
    use camino_tempfile::Utf8TempDir;

    const PSU0: &str = "/com/example/inventory/psu0";
    const PSU1: &str = "/com/example/inventory/psu1";

    struct Harness {
        _root: Utf8TempDir,
        images: ImagesConfig,
        fakes: FakeBackends,
        updater: ItemUpdater,
    }

    fn harness_with(always_use_builtin: bool) -> Harness {
        let root = camino_tempfile::tempdir().unwrap();
        let images = ImagesConfig {
            builtin_dir: root.path().join("builtin"),
            persist_dir: root.path().join("persist"),
            upload_dir: root.path().join("upload"),
            always_use_builtin,
        };
        std::fs::create_dir_all(&images.builtin_dir).unwrap();
        let log = Logger::root(slog::Discard, o!());
        let fakes = FakeBackends::new();
        let ctx = fakes.context(&log, ImageStore::new(&images, "MANIFEST"));
        let updater = ItemUpdater::new(ctx);
        Harness { _root: root, images, fakes, updater }
    }

    fn harness() -> Harness {
        harness_with(false)
    }

    fn write_image(dir: &Utf8Path, version: &str, model: &str) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(
            dir.join("MANIFEST"),
            format!(
                "purpose=PSU\nversion={version}\n\
                 extended_version=model={model}\n"
            ),
        )
        .unwrap();
    }

    fn id(version: &str) -> VersionId {
        VersionId::for_version(version).unwrap()
    }

    fn targets(h: &Harness, version: &str) -> Vec<String> {
        h.updater
            .activation(&id(version))
            .expect("activation should exist")
            .associations()
            .targets(ACTIVATION_ROLE)
            .map(str::to_string)
            .collect()
    }

    /// Complete the last started update unit.
    fn complete(h: &mut Harness, result: JobResult) {
        let unit = h.fakes.executor.last_started().unwrap();
        h.updater.on_job_completed(&unit, result);
    }

    #[test]
    fn test_not_create_object_on_not_present() {
        let mut h = harness();
        h.fakes.inventory.insert(PSU0, FakePsu::absent());
        h.updater.process_psu_image();
        assert!(h.updater.activations().is_empty());
        assert!(h.updater.associations().is_empty());
        assert_eq!(
            h.updater.psu_status().get(PSU0),
            Some(&PsuStatus::default())
        );
    }

    #[test]
    fn test_create_one_psu_on_present() {
        let mut h = harness();
        h.fakes.inventory.insert(PSU0, FakePsu::present("M1", "version0"));
        h.updater.process_psu_image();

        let activations = h.updater.activations();
        assert_eq!(activations.len(), 1);
        assert_eq!(activations[0].status, ActivationStatus::Active);
        assert_eq!(activations[0].path, None);
        assert_eq!(targets(&h, "version0"), vec![PSU0]);
        assert_eq!(h.updater.psu_activation(PSU0), Some(&id("version0")));

        let object_path =
            format!("/xyz/openbmc_project/software/{}", id("version0"));
        assert_eq!(activations[0].object_path, object_path);
        for role in [ACTIVE_ROLE, FUNCTIONAL_ROLE, UPDATEABLE_ROLE] {
            assert_eq!(
                h.updater.associations().targets(role).collect::<Vec<_>>(),
                vec![object_path.as_str()]
            );
        }
        assert_eq!(h.updater.psu_status()[PSU0].model, "M1");
    }

    #[test]
    fn test_create_two_psus_with_same_version() {
        let mut h = harness();
        h.fakes.inventory.insert(PSU0, FakePsu::present("M1", "version0"));
        h.fakes.inventory.insert(PSU1, FakePsu::present("M1", "version0"));
        h.updater.process_psu_image();

        assert_eq!(h.updater.activations().len(), 1);
        assert_eq!(targets(&h, "version0"), vec![PSU0, PSU1]);
        assert_eq!(h.updater.associations().len(), 3);
    }

    #[test]
    fn test_create_two_psus_with_different_version() {
        let mut h = harness();
        h.fakes.inventory.insert(PSU0, FakePsu::present("M1", "version0"));
        h.fakes.inventory.insert(PSU1, FakePsu::present("M1", "version1"));
        h.updater.process_psu_image();

        assert_eq!(h.updater.activations().len(), 2);
        assert_eq!(targets(&h, "version0"), vec![PSU0]);
        assert_eq!(targets(&h, "version1"), vec![PSU1]);
    }

    #[test]
    fn test_on_one_psu_removed() {
        let mut h = harness();
        h.fakes.inventory.insert(PSU0, FakePsu::present("M1", "version0"));
        h.updater.process_psu_image();
        assert_eq!(h.updater.activations().len(), 1);

        h.fakes.inventory.update(PSU0, |psu| psu.present = false);
        h.updater.on_presence_changed(PSU0, false);
        assert!(h.updater.activations().is_empty());
        assert!(h.updater.version_strings().is_empty());
        assert!(h.updater.associations().is_empty());
        assert_eq!(h.updater.psu_activation(PSU0), None);
        assert_eq!(h.updater.psu_status()[PSU0].model, "");
    }

    #[test]
    fn test_on_one_psu_added() {
        let mut h = harness();
        h.fakes.inventory.insert(PSU0, FakePsu::absent());
        h.updater.process_psu_image();
        assert!(h.updater.activations().is_empty());

        h.fakes.inventory.insert(PSU0, FakePsu::present("M1", "version0"));
        h.updater.on_presence_changed(PSU0, true);
        assert_eq!(targets(&h, "version0"), vec![PSU0]);
    }

    #[test]
    fn test_on_one_psu_removed_and_added() {
        let mut h = harness();
        h.fakes.inventory.insert(PSU0, FakePsu::present("M1", "version0"));
        h.updater.process_psu_image();

        h.fakes.inventory.update(PSU0, |psu| psu.present = false);
        h.updater.on_presence_changed(PSU0, false);
        assert!(h.updater.activations().is_empty());

        // The PSU comes back before its version can be read.
        h.fakes.inventory.update(PSU0, |psu| {
            psu.present = true;
            psu.version = String::new();
        });
        h.updater.on_presence_changed(PSU0, true);
        assert!(h.updater.activations().is_empty());

        h.fakes.inventory.update(PSU0, |psu| psu.version = "version0".into());
        h.updater.poll_inventory();
        assert_eq!(targets(&h, "version0"), vec![PSU0]);
    }

    #[test]
    fn test_two_psus_removed_and_added_with_different_versions() {
        let mut h = harness();
        h.fakes.inventory.insert(PSU0, FakePsu::present("M1", "version0"));
        h.fakes.inventory.insert(PSU1, FakePsu::present("M1", "version0"));
        h.updater.process_psu_image();
        assert_eq!(targets(&h, "version0"), vec![PSU0, PSU1]);

        h.fakes.inventory.update(PSU0, |psu| psu.present = false);
        h.updater.on_presence_changed(PSU0, false);
        assert_eq!(targets(&h, "version0"), vec![PSU1]);

        h.fakes.inventory.update(PSU1, |psu| psu.present = false);
        h.updater.on_presence_changed(PSU1, false);
        assert!(h.updater.activations().is_empty());

        h.fakes.inventory.insert(PSU0, FakePsu::present("M1", "version0"));
        h.fakes.inventory.insert(PSU1, FakePsu::present("M1", "version1"));
        h.updater.on_presence_changed(PSU0, true);
        h.updater.on_presence_changed(PSU1, true);
        assert_eq!(h.updater.activations().len(), 2);
        assert_eq!(targets(&h, "version0"), vec![PSU0]);
        assert_eq!(targets(&h, "version1"), vec![PSU1]);
    }

    #[test]
    fn test_version_discovered() {
        let mut h = harness();
        let upload = h.images.upload_dir.join("abcdef01");
        write_image(&upload, "version1", "M1");

        h.updater.on_version_discovered(
            "/xyz/openbmc_project/software/abcdef01",
            "version1",
            VersionPurpose::Psu,
            Some(&upload),
        );
        let activation = h.updater.activation(&id("version1")).unwrap();
        assert_eq!(activation.status(), ActivationStatus::Ready);
        assert_eq!(activation.version().model(), "M1");
        assert_eq!(activation.version().path(), Some(&upload));
        assert_eq!(
            activation
                .associations()
                .targets(ACTIVATION_ROLE)
                .collect::<Vec<_>>(),
            vec!["/xyz/openbmc_project/inventory/system"]
        );
        assert!(h.updater.version_strings().contains("version1"));

        // Other purposes and images without a file are ignored.
        h.updater.on_version_discovered(
            "/xyz/openbmc_project/software/bmc",
            "bmc-version",
            VersionPurpose::Other,
            Some(&upload),
        );
        h.updater.on_version_discovered(
            "/xyz/openbmc_project/software/nofile",
            "version2",
            VersionPurpose::Psu,
            None,
        );
        assert_eq!(h.updater.activations().len(), 1);
    }

    #[test]
    fn test_version_discovered_builtin_only() {
        let mut h = harness_with(true);
        let upload = h.images.upload_dir.join("abcdef01");
        write_image(&upload, "version1", "M1");
        h.updater.on_version_discovered(
            "/xyz/openbmc_project/software/abcdef01",
            "version1",
            VersionPurpose::Psu,
            Some(&upload),
        );
        assert!(h.updater.activations().is_empty());
    }

    #[test]
    fn test_stored_image_creates_ready_activation_and_syncs() {
        let mut h = harness();
        let stored = h.images.builtin_dir.join("M1");
        write_image(&stored, "version1", "M1");
        h.fakes.inventory.insert(PSU0, FakePsu::present("M1", "version0"));

        h.updater.process_psu_image_and_sync();

        let activation = h.updater.activation(&id("version1")).unwrap();
        assert_eq!(activation.version().path(), Some(&stored));
        assert_eq!(activation.status(), ActivationStatus::Activating);
        assert_eq!(activation.current_psu(), Some(PSU0));

        complete(&mut h, JobResult::Done);
        let activation = h.updater.activation(&id("version1")).unwrap();
        assert_eq!(activation.status(), ActivationStatus::Active);
        assert_eq!(targets(&h, "version1"), vec![PSU0]);
        // The old version lost its only PSU.
        assert!(h.updater.activation(&id("version0")).is_none());
        assert_eq!(h.updater.psu_activation(PSU0), Some(&id("version1")));
        let object_path = activation.object_path().to_string();
        assert_eq!(
            h.updater.associations().targets(ACTIVE_ROLE).collect::<Vec<_>>(),
            vec![object_path.as_str()]
        );
        // A builtin image is not copied anywhere.
        assert!(!h.images.persist_dir.exists());
        assert!(h.fakes.image_manager.deleted().is_empty());
    }

    #[test]
    fn test_stored_image_for_running_version_sets_path() {
        let mut h = harness();
        let stored = h.images.builtin_dir.join("M1");
        write_image(&stored, "version0", "M1");
        h.fakes.inventory.insert(PSU0, FakePsu::present("M1", "version0"));

        h.updater.process_psu_image_and_sync();

        assert_eq!(h.updater.activations().len(), 1);
        let activation = h.updater.activation(&id("version0")).unwrap();
        assert_eq!(activation.status(), ActivationStatus::Active);
        assert_eq!(activation.version().path(), Some(&stored));
        assert_eq!(activation.version().model(), "M1");
        assert!(h.fakes.executor.started().is_empty());
    }

    #[test]
    fn test_stored_image_waits_for_model() {
        let mut h = harness();
        write_image(&h.images.builtin_dir.join("M1"), "version1", "M1");
        h.fakes.inventory.insert(PSU0, FakePsu::present("", ""));
        h.updater.process_psu_image_and_sync();
        assert!(h.updater.activations().is_empty());

        h.fakes.inventory.insert(PSU0, FakePsu::present("M1", "version0"));
        h.updater.on_model_changed(PSU0, "M1");
        assert_eq!(h.updater.activations().len(), 2);
        assert_eq!(
            h.updater.activation(&id("version1")).unwrap().status(),
            ActivationStatus::Activating
        );
    }

    #[test]
    fn test_malformed_stored_image_is_skipped() {
        let mut h = harness();
        write_image(&h.images.builtin_dir.join("M1"), "version1", "M2");
        h.fakes.inventory.insert(PSU0, FakePsu::present("M1", "version0"));
        h.updater.process_psu_image_and_sync();
        assert_eq!(h.updater.activations().len(), 1);
        assert!(h.fakes.executor.started().is_empty());
    }

    #[test]
    fn test_sync_skips_failed_latest() {
        let mut h = harness();
        write_image(&h.images.builtin_dir.join("M1"), "version1", "M1");
        h.fakes.inventory.insert(PSU0, FakePsu::present("M1", "version0"));
        h.updater.process_psu_image_and_sync();
        complete(&mut h, JobResult::Failed);
        let activation = h.updater.activation(&id("version1")).unwrap();
        assert_eq!(activation.status(), ActivationStatus::Failed);
        assert!(activation.job_failed());

        h.updater.sync_to_latest_image();
        assert_eq!(h.fakes.executor.started().len(), 1);
        // The PSU keeps running its old version.
        assert_eq!(h.updater.psu_activation(PSU0), Some(&id("version0")));

        // An explicit request retries.
        assert_eq!(
            h.updater.request_activation(
                &id("version1"),
                RequestedActivation::Active
            ),
            Some(ActivationStatus::Activating)
        );
        assert_eq!(h.fakes.executor.started().len(), 2);
    }

    #[test]
    fn test_sync_retries_when_nothing_was_installable() {
        let mut h = harness();
        let stored = h.images.builtin_dir.join("M1");
        std::fs::create_dir_all(&stored).unwrap();
        std::fs::write(
            stored.join("MANIFEST"),
            "purpose=PSU\nversion=version2\n\
             extended_version=manufacturer=ACME,model=M1\n",
        )
        .unwrap();
        h.fakes.inventory.insert(
            PSU0,
            FakePsu::present("M1", "version0").with_manufacturer("OTHER"),
        );
        h.updater.process_psu_image_and_sync();
        let activation = h.updater.activation(&id("version2")).unwrap();
        assert_eq!(activation.status(), ActivationStatus::Failed);
        assert!(!activation.job_failed());
        assert!(h.fakes.executor.started().is_empty());

        // A compatible PSU is plugged in later.
        h.fakes.inventory.insert(PSU1, FakePsu::present("M1", "version1"));
        h.updater.on_psu_interfaces_added(PSU1, true, Some(true));
        let activation = h.updater.activation(&id("version2")).unwrap();
        assert_eq!(activation.status(), ActivationStatus::Activating);
        assert_eq!(activation.current_psu(), Some(PSU1));

        complete(&mut h, JobResult::Done);
        assert_eq!(targets(&h, "version2"), vec![PSU1]);
        assert_eq!(h.updater.psu_activation(PSU0), Some(&id("version0")));
    }

    #[test]
    fn test_associations_reference_known_psus() {
        let mut h = harness();
        h.fakes.inventory.insert(PSU0, FakePsu::present("M1", "version0"));
        let upload = h.images.upload_dir.join("abcdef01");
        write_image(&upload, "version3", "M1");
        h.updater.on_version_discovered(
            "/xyz/openbmc_project/software/abcdef01",
            "version3",
            VersionPurpose::Psu,
            Some(&upload),
        );

        // PSU0 has not been registered, so there is nothing to update.
        assert_eq!(
            h.updater.request_activation(
                &id("version3"),
                RequestedActivation::Active
            ),
            Some(ActivationStatus::Failed)
        );
        assert!(h.fakes.executor.started().is_empty());

        h.updater.process_psu_image();
        assert_eq!(
            h.updater.request_activation(
                &id("version3"),
                RequestedActivation::Active
            ),
            Some(ActivationStatus::Activating)
        );
        complete(&mut h, JobResult::Done);
        assert_eq!(
            h.updater.activation(&id("version3")).unwrap().status(),
            ActivationStatus::Active
        );

        let sentinel = h.updater.ctx.config.inventory_path_base.clone();
        for activation in h.updater.activations() {
            for psu in activation.associations.targets(ACTIVATION_ROLE) {
                assert!(
                    psu == sentinel || h.updater.psu_status().contains_key(psu),
                    "{psu} is associated but not registered"
                );
            }
        }
    }

    #[test]
    fn test_latest_version_builtin_only() {
        let mut h = harness_with(true);
        write_image(&h.images.builtin_dir.join("M1"), "version1", "M1");
        // Lexicographically newer, but not builtin.
        h.fakes.inventory.insert(PSU0, FakePsu::present("M1", "version9"));
        h.updater.process_psu_image();
        h.updater.process_stored_image();
        assert_eq!(h.updater.latest_version_id(), Some(id("version1")));

        let mut h = harness();
        write_image(&h.images.builtin_dir.join("M1"), "version1", "M1");
        h.fakes.inventory.insert(PSU0, FakePsu::present("M1", "version9"));
        h.updater.process_psu_image();
        h.updater.process_stored_image();
        assert_eq!(h.updater.latest_version_id(), Some(id("version9")));
    }

    #[test]
    fn test_psu_interfaces_added_separately() {
        let mut h = harness();
        h.fakes.inventory.insert(PSU0, FakePsu::present("M1", "version0"));

        // Item interface first: not known to be a PSU yet.
        h.updater.on_psu_interfaces_added(PSU0, false, Some(true));
        assert!(h.updater.psu_status().is_empty());

        h.updater.on_psu_interfaces_added(PSU0, true, None);
        assert!(h.updater.psu_status().is_empty());

        h.updater.on_psu_interfaces_added(PSU0, false, Some(true));
        assert!(h.updater.psu_status()[PSU0].present);
        assert_eq!(targets(&h, "version0"), vec![PSU0]);
    }

    #[test]
    fn test_poll_detects_changes() {
        let mut h = harness();
        h.fakes.inventory.insert(PSU0, FakePsu::present("M1", "version0"));
        h.updater.process_psu_image();

        h.fakes.inventory.insert(PSU1, FakePsu::present("M1", "version1"));
        h.fakes.inventory.update(PSU0, |psu| psu.present = false);
        h.updater.poll_inventory();

        assert!(h.updater.activation(&id("version0")).is_none());
        assert_eq!(targets(&h, "version1"), vec![PSU1]);
    }

    #[test]
    fn test_poll_retries_unreadable_version() {
        let mut h = harness();
        h.fakes.inventory.insert(PSU0, FakePsu::present("M1", ""));
        h.updater.process_psu_image();
        let state = |h: &Harness| {
            h.updater.psu_status()[PSU0]
                .discovery_state(h.updater.psu_activation(PSU0).is_some())
        };
        assert_eq!(state(&h), PsuDiscoveryState::PresentWithModel);
        assert!(h.updater.activations().is_empty());

        h.updater.poll_inventory();
        assert_eq!(state(&h), PsuDiscoveryState::PresentWithModel);

        h.fakes.inventory.update(PSU0, |psu| psu.version = "version0".into());
        h.updater.poll_inventory();
        assert_eq!(state(&h), PsuDiscoveryState::Associated);
        assert_eq!(targets(&h, "version0"), vec![PSU0]);
    }

    #[test]
    fn test_erase_and_delete_all() {
        let mut h = harness();
        h.fakes.inventory.insert(PSU0, FakePsu::present("M1", "version0"));
        h.updater.process_psu_image();
        let upload: Utf8PathBuf = h.images.upload_dir.join("abcdef01");
        write_image(&upload, "version1", "M2");
        h.updater.on_version_discovered(
            "/xyz/openbmc_project/software/abcdef01",
            "version1",
            VersionPurpose::Psu,
            Some(&upload),
        );
        assert_eq!(h.updater.activations().len(), 2);

        assert_eq!(h.updater.delete_all(), vec![id("version1")]);
        assert_eq!(h.updater.activations().len(), 1);
        assert!(!h.updater.version_strings().contains("version1"));

        assert!(h.updater.erase(&id("version0")));
        assert!(!h.updater.erase(&id("version0")));
        assert!(h.updater.associations().is_empty());
        assert_eq!(h.updater.psu_activation(PSU0), None);
    }

    #[test]
    fn test_two_psus_converge() {
        let mut h = harness();
        write_image(&h.images.builtin_dir.join("M1"), "version2", "M1");
        h.fakes.inventory.insert(PSU0, FakePsu::present("M1", "version0"));
        h.fakes.inventory.insert(PSU1, FakePsu::present("M1", "version1"));
        h.updater.process_psu_image_and_sync();

        let activation = h.updater.activation(&id("version2")).unwrap();
        assert_eq!(activation.queue_len(), 2);
        complete(&mut h, JobResult::Done);
        complete(&mut h, JobResult::Done);

        let activation = h.updater.activation(&id("version2")).unwrap();
        assert_eq!(activation.status(), ActivationStatus::Active);
        assert_eq!(activation.progress(), 100);
        let mut psus = targets(&h, "version2");
        psus.sort();
        assert_eq!(psus, vec![PSU0, PSU1]);
        assert_eq!(h.updater.activations().len(), 1);
        assert_eq!(h.updater.version_strings().len(), 1);
    }
}
