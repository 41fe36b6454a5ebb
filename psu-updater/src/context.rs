// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Collaborators and settings shared by the coordinator and its activations

use crate::config::UpdaterConfig;
use crate::image_store::{ImageManager, ImageStore};
use crate::inventory::{PsuInventory, VersionComparator};
use crate::update_unit::UpdateExecutor;
use crate::version::VersionId;
use slog::Logger;
use std::sync::Arc;

pub struct UpdaterContext {
    pub log: Logger,
    pub config: UpdaterConfig,
    pub image_store: ImageStore,
    pub inventory: Arc<dyn PsuInventory>,
    pub comparator: Arc<dyn VersionComparator>,
    pub executor: Arc<dyn UpdateExecutor>,
    pub image_manager: Arc<dyn ImageManager>,
}

impl UpdaterContext {
    /// Object path of the activation/version pair for `id`.
    pub fn object_path(&self, id: &VersionId) -> String {
        format!("{}/{}", self.config.software_object_path, id)
    }
}
