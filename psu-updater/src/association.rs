// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tagged relationships between firmware images and the things that run them

use crate::inventory::PsuTable;
use crate::version::VersionId;
use serde::Serialize;

/// A forward/reverse role pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct AssociationRole {
    pub forward: &'static str,
    pub reverse: &'static str,
}

/// Which PSUs an image targets or has been installed on.
pub const ACTIVATION_ROLE: AssociationRole =
    AssociationRole { forward: "inventory", reverse: "activation" };
/// An image that is active on at least one PSU.
pub const ACTIVE_ROLE: AssociationRole =
    AssociationRole { forward: "active", reverse: "software_version" };
/// An image that is currently running.
pub const FUNCTIONAL_ROLE: AssociationRole =
    AssociationRole { forward: "functional", reverse: "software_version" };
/// An image that may be updated.
pub const UPDATEABLE_ROLE: AssociationRole =
    AssociationRole { forward: "updateable", reverse: "software_version" };

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Association {
    pub role: AssociationRole,
    pub target: String,
}

impl Association {
    pub fn new(role: AssociationRole, target: impl Into<String>) -> Self {
        Self { role, target: target.into() }
    }
}

/// An ordered list of associations without duplicates.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct AssociationSet {
    entries: Vec<Association>,
}

impl AssociationSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(role: AssociationRole, target: impl Into<String>) -> Self {
        let mut set = Self::new();
        set.add(role, target);
        set
    }

    /// Add an association. Returns false if the identical triple is already
    /// present.
    pub fn add(
        &mut self,
        role: AssociationRole,
        target: impl Into<String>,
    ) -> bool {
        let association = Association::new(role, target);
        if self.entries.contains(&association) {
            return false;
        }
        self.entries.push(association);
        true
    }

    /// Remove every association pointing at `target`, whatever its role.
    /// Returns true if anything was removed.
    pub fn remove_target(&mut self, target: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|a| a.target != target);
        self.entries.len() != before
    }

    /// Whether any association points at `target`.
    pub fn is_associated(&self, target: &str) -> bool {
        self.entries.iter().any(|a| a.target == target)
    }

    pub fn targets(
        &self,
        role: AssociationRole,
    ) -> impl Iterator<Item = &str> + '_ {
        self.entries
            .iter()
            .filter(move |a| a.role == role)
            .map(|a| a.target.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Association> + '_ {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Coordinator-scope associations an activation may change when it finishes.
pub trait AssociationInterface {
    fn create_active_association(&mut self, path: &str);
    fn add_functional_association(&mut self, path: &str);
    fn add_updateable_association(&mut self, path: &str);
    fn remove_association(&mut self, path: &str);
}

/// Notifications from an activation to its owner.
pub trait ActivationListener {
    /// `psu` finished updating to the image identified by `version_id`.
    fn on_update_done(&mut self, version_id: &VersionId, psu: &str);
}

/// Everything an activation may call back into while it runs.
pub trait ActivationContext:
    AssociationInterface + ActivationListener + PsuTable
{
}

impl<T: AssociationInterface + ActivationListener + PsuTable>
    ActivationContext for T
{
}
