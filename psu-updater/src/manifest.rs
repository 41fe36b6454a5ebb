// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reader for the `key=value` manifest shipped alongside a firmware image

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;

pub const MANIFEST_VERSION: &str = "version";
pub const MANIFEST_EXTENDED_VERSION: &str = "extended_version";
pub const MANIFEST_PURPOSE: &str = "purpose";

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("manifest does not exist: {path}")]
    NotFound { path: Utf8PathBuf },
    #[error("error reading manifest {path}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
}

/// The recognized contents of a manifest. Missing keys are empty.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Manifest {
    pub version: String,
    pub extended_version: String,
    pub purpose: String,
}

impl Manifest {
    pub fn from_file(path: &Utf8Path) -> Result<Self, ManifestError> {
        let contents = std::fs::read_to_string(path).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                ManifestError::NotFound { path: path.to_owned() }
            } else {
                ManifestError::Io { path: path.to_owned(), err }
            }
        })?;
        Ok(Self::parse(&contents))
    }

    /// Parse manifest text. For a key that appears more than once, the last
    /// occurrence wins.
    pub fn parse(contents: &str) -> Self {
        let mut manifest = Manifest::default();
        for line in contents.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim_end_matches('\r').to_string();
            match key {
                MANIFEST_VERSION => manifest.version = value,
                MANIFEST_EXTENDED_VERSION => {
                    manifest.extended_version = value
                }
                MANIFEST_PURPOSE => manifest.purpose = value,
                _ => (),
            }
        }
        manifest
    }
}
