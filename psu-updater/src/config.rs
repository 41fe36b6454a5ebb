// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Configuration related types used by psu-updater

use crate::update_unit::UpdateUnitTemplate;
use camino::{Utf8Path, Utf8PathBuf};
use dropshot::ConfigLogging;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Config {
    /// Service-wide logging configuration.
    pub log: ConfigLogging,
    #[serde(default)]
    pub updater: UpdaterConfig,
    #[serde(default)]
    pub images: ImagesConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub polling: PollingConfig,
}

impl Config {
    /// Load a `Config` from the given TOML file
    pub fn from_file<P: AsRef<Utf8Path>>(
        path: P,
    ) -> Result<Config, LoadError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .map_err(|err| LoadError::Io { path: path.to_owned(), err })?;
        toml::from_str(&data)
            .map_err(|err| LoadError::Parse { path: path.to_owned(), err })
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("error reading \"{path}\"")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("error parsing \"{path}\"")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        err: toml::de::Error,
    },
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(default)]
pub struct UpdaterConfig {
    /// Prefix of the object path of each activation.
    pub software_object_path: String,
    /// Sentinel target associated with an image that is not installed
    /// anywhere yet.
    pub inventory_path_base: String,
    pub update_unit_template: UpdateUnitTemplate,
    pub manifest_file: String,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            software_object_path: "/xyz/openbmc_project/software".to_string(),
            inventory_path_base: "/xyz/openbmc_project/inventory/system"
                .to_string(),
            update_unit_template: UpdateUnitTemplate::default(),
            manifest_file: "MANIFEST".to_string(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(default)]
pub struct ImagesConfig {
    pub builtin_dir: Utf8PathBuf,
    pub persist_dir: Utf8PathBuf,
    pub upload_dir: Utf8PathBuf,
    /// Only ever install the image from `builtin_dir`.
    pub always_use_builtin: bool,
}

impl Default for ImagesConfig {
    fn default() -> Self {
        Self {
            builtin_dir: "/usr/share/obmc/psu".into(),
            persist_dir: "/var/lib/obmc/psu".into(),
            upload_dir: "/tmp/images".into(),
            always_use_builtin: false,
        }
    }
}

/// Vendor tools. Each is an argv prefix; the PSU inventory path (or the
/// version strings, for `compare_versions`) is appended.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Prints one PSU inventory path per line.
    pub list_psus: Vec<String>,
    /// Prints `true` or `false`.
    pub psu_present: Vec<String>,
    pub psu_model: Vec<String>,
    pub psu_manufacturer: Vec<String>,
    pub psu_version: Vec<String>,
    /// Prints the latest of the given versions.
    pub compare_versions: Vec<String>,
    /// `systemctl`-compatible command used to start update units.
    pub systemctl: Utf8PathBuf,
    pub timeout_secs: u64,
    /// Upper bound on how long one update unit may run.
    pub update_timeout_secs: u64,
}

impl ToolsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn update_timeout(&self) -> Duration {
        Duration::from_secs(self.update_timeout_secs)
    }
}

impl Default for ToolsConfig {
    fn default() -> Self {
        fn argv(args: &[&str]) -> Vec<String> {
            args.iter().map(|s| s.to_string()).collect()
        }
        Self {
            list_psus: argv(&["psutils", "--list"]),
            psu_present: argv(&["psutils", "--present"]),
            psu_model: argv(&["psutils", "--get-model"]),
            psu_manufacturer: argv(&["psutils", "--get-manufacturer"]),
            psu_version: argv(&["psutils", "--get-version"]),
            compare_versions: argv(&["psutils", "--compare"]),
            systemctl: "/usr/bin/systemctl".into(),
            timeout_secs: 10,
            update_timeout_secs: 30 * 60,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(default)]
pub struct PollingConfig {
    /// How often PSU presence and identity are re-read.
    pub inventory_interval_secs: u64,
    /// How often the upload directory is checked for new images.
    pub upload_interval_secs: u64,
    /// At startup, wait until no new PSU has appeared for this long...
    pub discovery_settle_secs: u64,
    /// ...but never longer than this.
    pub discovery_deadline_secs: u64,
}

impl PollingConfig {
    pub fn inventory_interval(&self) -> Duration {
        Duration::from_secs(self.inventory_interval_secs)
    }

    pub fn upload_interval(&self) -> Duration {
        Duration::from_secs(self.upload_interval_secs)
    }

    pub fn discovery_settle(&self) -> Duration {
        Duration::from_secs(self.discovery_settle_secs)
    }

    pub fn discovery_deadline(&self) -> Duration {
        Duration::from_secs(self.discovery_deadline_secs)
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            inventory_interval_secs: 10,
            upload_interval_secs: 5,
            discovery_settle_secs: 30,
            discovery_deadline_secs: 300,
        }
    }
}
