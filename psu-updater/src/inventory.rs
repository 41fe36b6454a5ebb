// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! PSU inventory: what we know about each power supply, and the
//! collaborators we ask about them

use crate::version::Version;
use serde::Serialize;
use std::collections::BTreeSet;
use std::time::Duration;
use thiserror::Error;

/// Presence and identity of one PSU, keyed by inventory path.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PsuStatus {
    pub present: bool,
    /// Empty until discovered.
    pub model: String,
    /// Empty if the PSU does not report one.
    pub manufacturer: String,
}

/// Where a PSU is in discovery. A path with no entry in the PSU table has
/// not been discovered at all.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum PsuDiscoveryState {
    Absent,
    PresentNoModel,
    PresentWithModel,
    /// Present, and associated with the activation of its running firmware.
    Associated,
}

impl PsuStatus {
    pub fn discovery_state(&self, associated: bool) -> PsuDiscoveryState {
        match (self.present, self.model.is_empty(), associated) {
            (false, _, _) => PsuDiscoveryState::Absent,
            (true, _, true) => PsuDiscoveryState::Associated,
            (true, true, false) => PsuDiscoveryState::PresentNoModel,
            (true, false, false) => PsuDiscoveryState::PresentWithModel,
        }
    }
}

/// The PSUs registered with the coordinator. Only these are ever updated
/// or associated with an image.
pub trait PsuTable {
    /// Every registered PSU, ordered by inventory path.
    fn known_psus(&self) -> Vec<(String, PsuStatus)>;
}

/// Whether `image` can be installed on `psu`.
///
/// The model must match. The manufacturer must match too, unless the PSU
/// does not report one.
pub fn is_compatible(psu: &PsuStatus, image: &Version) -> bool {
    psu.model == image.model()
        && (psu.manufacturer.is_empty()
            || psu.manufacturer == image.manufacturer())
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("failed to start {command}")]
    Start {
        command: String,
        #[source]
        err: std::io::Error,
    },
    #[error("{command} timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },
    #[error("{command} failed ({status}): {stderr}")]
    Failed { command: String, status: String, stderr: String },
    #[error("unexpected output from {command}: {output:?}")]
    Parse { command: String, output: String },
    #[error("{0}")]
    Unavailable(String),
}

/// Source of PSU inventory information.
///
/// Every call is bounded; an implementation that cannot answer in time
/// returns `ToolError::Timeout` rather than blocking.
pub trait PsuInventory: Send + Sync {
    /// Inventory paths of every known PSU slot, present or not.
    fn psu_paths(&self) -> Result<Vec<String>, ToolError>;
    fn is_present(&self, psu: &str) -> Result<bool, ToolError>;
    fn model(&self, psu: &str) -> Result<String, ToolError>;
    fn manufacturer(&self, psu: &str) -> Result<String, ToolError>;
    /// Version of the firmware the PSU is running. Empty if not known yet.
    fn version(&self, psu: &str) -> Result<String, ToolError>;
}

/// Picks the newest of a set of version strings.
pub trait VersionComparator: Send + Sync {
    fn latest(
        &self,
        versions: &BTreeSet<String>,
    ) -> Result<Option<String>, ToolError>;
}
