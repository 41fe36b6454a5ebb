// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Identity and metadata of PSU firmware versions

use camino::Utf8PathBuf;
use serde::Serialize;
use sha2::{Digest, Sha512};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Short, stable identifier for a version string.
///
/// The id is the first four bytes of the SHA-512 digest of the raw version
/// string, rendered as eight lowercase hex characters. It is used as the map
/// key for activations and as the last component of their object path, so it
/// must stay byte-for-byte stable.
#[derive(
    Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize,
)]
#[serde(transparent)]
pub struct VersionId(String);

#[derive(Debug, Error, PartialEq, Eq)]
#[error("cannot derive a version id from an empty version string")]
pub struct VersionIdError;

impl VersionId {
    /// Compute the id for `version`.
    pub fn for_version(version: &str) -> Result<Self, VersionIdError> {
        if version.is_empty() {
            return Err(VersionIdError);
        }
        let digest = Sha512::digest(version.as_bytes());
        Ok(Self(hex::encode(&digest[..4])))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a firmware image is for. Only `Psu` images are processed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum VersionPurpose {
    Unknown,
    Other,
    Psu,
}

impl VersionPurpose {
    /// Parse a purpose as published by the image manager.
    ///
    /// Both the bare name (`PSU`) and the fully-qualified enumeration value
    /// (`xyz.openbmc_project.Software.Version.VersionPurpose.PSU`) are
    /// accepted.
    pub fn parse(value: &str) -> Self {
        let name = value.rsplit('.').next().unwrap_or(value).trim();
        match name {
            "" => VersionPurpose::Unknown,
            "PSU" => VersionPurpose::Psu,
            _ => VersionPurpose::Other,
        }
    }
}

/// Manufacturer and model parsed from a manifest's `extended_version`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ExtendedVersion {
    pub manufacturer: String,
    pub model: String,
    /// Every `key=value` pair found, including the two above.
    pub fields: BTreeMap<String, String>,
}

impl ExtendedVersion {
    /// Parse a comma-separated list of `key=value` pairs.
    ///
    /// Entries without `=` are ignored; unknown keys are kept in `fields`.
    pub fn parse(raw: &str) -> Self {
        let fields: BTreeMap<String, String> = raw
            .split(',')
            .filter_map(|entry| {
                let (key, value) = entry.split_once('=')?;
                Some((key.trim().to_string(), value.trim().to_string()))
            })
            .collect();
        let manufacturer =
            fields.get("manufacturer").cloned().unwrap_or_default();
        let model = fields.get("model").cloned().unwrap_or_default();
        Self { manufacturer, model, fields }
    }
}

/// Metadata record for one distinct firmware image.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Version {
    id: VersionId,
    version: String,
    extended_version: String,
    info: ExtendedVersion,
    purpose: VersionPurpose,
    /// Directory holding the image. `None` for the running firmware of a
    /// PSU that has no stored copy.
    path: Option<Utf8PathBuf>,
}

impl Version {
    pub fn new(
        id: VersionId,
        version: String,
        extended_version: String,
        purpose: VersionPurpose,
        path: Option<Utf8PathBuf>,
    ) -> Self {
        let info = ExtendedVersion::parse(&extended_version);
        Self { id, version, extended_version, info, purpose, path }
    }

    pub fn id(&self) -> &VersionId {
        &self.id
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn extended_version(&self) -> &str {
        &self.extended_version
    }

    pub fn manufacturer(&self) -> &str {
        &self.info.manufacturer
    }

    pub fn model(&self) -> &str {
        &self.info.model
    }

    pub fn purpose(&self) -> VersionPurpose {
        self.purpose
    }

    pub fn path(&self) -> Option<&Utf8PathBuf> {
        self.path.as_ref()
    }

    pub fn set_path(&mut self, path: Utf8PathBuf) {
        self.path = Some(path);
    }

    /// Adopt the extended version of a stored image for a record that was
    /// created from a running PSU and so had none.
    pub fn set_extended_version(&mut self, extended_version: String) {
        self.info = ExtendedVersion::parse(&extended_version);
        self.extended_version = extended_version;
    }
}
