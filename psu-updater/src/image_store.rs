// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Filesystem layout of stored PSU images
//!
//! Images live in `<dir>/<model>/`, next to a manifest. The builtin directory
//! ships with the system; the persist directory holds a single copy per model
//! of the last image activated from the upload directory.

use crate::config::ImagesConfig;
use crate::manifest::{Manifest, ManifestError};
use crate::version::{ExtendedVersion, VersionId};
use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;

/// A directory is missing. Not an error: the layout may legitimately not
/// have a stored copy yet.
#[derive(Debug, Error)]
#[error("directory does not exist: {path}")]
pub struct NotFound {
    pub path: Utf8PathBuf,
}

/// A directory exists but does not hold a usable image.
#[derive(Debug, Error)]
pub enum ImageDirError {
    #[error("path is not a directory: {path}")]
    NotADirectory { path: Utf8PathBuf },
    #[error("path is not a file: {path}")]
    NotAFile { path: Utf8PathBuf },
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error(
        "invalid information in manifest: path={path}, version={version:?}, \
         model={model:?}"
    )]
    InvalidManifest { path: Utf8PathBuf, version: String, model: String },
    #[error(
        "model in manifest does not match path: model={model}, path={path}"
    )]
    ModelMismatch { model: String, path: Utf8PathBuf },
    #[error("error reading {path}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum ScanError {
    #[error(transparent)]
    NotFound(#[from] NotFound),
    #[error(transparent)]
    Malformed(#[from] ImageDirError),
}

/// A valid image found in a model subdirectory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredImage {
    pub dir: Utf8PathBuf,
    pub version: String,
    pub extended_version: String,
}

#[derive(Clone, Debug)]
pub struct ImageStore {
    builtin_dir: Utf8PathBuf,
    persist_dir: Utf8PathBuf,
    upload_dir: Utf8PathBuf,
    always_use_builtin: bool,
    manifest_file: String,
}

impl ImageStore {
    pub fn new(config: &ImagesConfig, manifest_file: &str) -> Self {
        Self {
            builtin_dir: config.builtin_dir.clone(),
            persist_dir: config.persist_dir.clone(),
            upload_dir: config.upload_dir.clone(),
            always_use_builtin: config.always_use_builtin,
            manifest_file: manifest_file.to_string(),
        }
    }

    pub fn always_use_builtin(&self) -> bool {
        self.always_use_builtin
    }

    pub fn upload_dir(&self) -> &Utf8Path {
        &self.upload_dir
    }

    /// Directories to look for stored images in, in priority order.
    pub fn scan_dirs(&self) -> Vec<&Utf8Path> {
        let mut dirs = vec![self.builtin_dir.as_path()];
        if !self.always_use_builtin {
            dirs.push(self.persist_dir.as_path());
        }
        dirs
    }

    pub fn is_builtin(&self, path: &Utf8Path) -> bool {
        path.starts_with(&self.builtin_dir)
    }

    pub fn is_uploaded(&self, path: &Utf8Path) -> bool {
        path.starts_with(&self.upload_dir)
    }

    pub fn manifest_path(&self, image_dir: &Utf8Path) -> Utf8PathBuf {
        image_dir.join(&self.manifest_file)
    }

    /// The raw `extended_version` of the image in `image_dir`, or empty if
    /// its manifest cannot be read.
    pub fn extended_version(
        &self,
        image_dir: &Utf8Path,
    ) -> Result<String, ManifestError> {
        Manifest::from_file(&self.manifest_path(image_dir))
            .map(|m| m.extended_version)
    }

    /// Find the `model` subdirectory of `dir`.
    ///
    /// Returns `Ok(None)` if no model is known yet.
    pub fn find_model_directory(
        &self,
        dir: &Utf8Path,
        model: Option<&str>,
    ) -> Result<Option<Utf8PathBuf>, ScanError> {
        check_dir(dir)?;
        let Some(model) = model else {
            return Ok(None);
        };
        let model_dir = dir.join(model);
        check_dir(&model_dir)?;
        Ok(Some(model_dir))
    }

    /// Look for a valid image for `model` in `dir`.
    pub fn scan_directory(
        &self,
        dir: &Utf8Path,
        model: Option<&str>,
    ) -> Result<Option<StoredImage>, ScanError> {
        let Some(model_dir) = self.find_model_directory(dir, model)? else {
            return Ok(None);
        };

        let manifest_path = self.manifest_path(&model_dir);
        match manifest_path.symlink_metadata() {
            Ok(metadata) if metadata.is_file() => (),
            Ok(_) => {
                return Err(ImageDirError::NotAFile { path: manifest_path }
                    .into());
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(ImageDirError::Manifest(ManifestError::NotFound {
                    path: manifest_path,
                })
                .into());
            }
            Err(err) => {
                return Err(
                    ImageDirError::Io { path: manifest_path, err }.into()
                );
            }
        }

        let manifest =
            Manifest::from_file(&manifest_path).map_err(ImageDirError::from)?;
        let info = ExtendedVersion::parse(&manifest.extended_version);
        if manifest.version.is_empty() || info.model.is_empty() {
            return Err(ImageDirError::InvalidManifest {
                path: manifest_path,
                version: manifest.version,
                model: info.model,
            }
            .into());
        }
        if model_dir.file_name() != Some(info.model.as_str()) {
            return Err(ImageDirError::ModelMismatch {
                model: info.model,
                path: model_dir,
            }
            .into());
        }

        Ok(Some(StoredImage {
            dir: model_dir,
            version: manifest.version,
            extended_version: manifest.extended_version,
        }))
    }

    /// Copy the image in `src` to the persist directory for `model`,
    /// replacing whatever was stored there. Returns the new location.
    ///
    /// Images that are not in the upload directory are already stored and
    /// are left where they are (`Ok(None)`).
    pub fn persist(
        &self,
        src: &Utf8Path,
        model: &str,
    ) -> Result<Option<Utf8PathBuf>, std::io::Error> {
        if !self.is_uploaded(src) {
            return Ok(None);
        }
        let dst = self.persist_dir.join(model);
        match std::fs::remove_dir_all(&dst) {
            Ok(()) => (),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => (),
            Err(err) => return Err(err),
        }
        std::fs::create_dir_all(&dst)?;
        for entry in src.read_dir_utf8()? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                std::fs::copy(entry.path(), dst.join(entry.file_name()))?;
            }
        }
        Ok(Some(dst))
    }
}

fn check_dir(dir: &Utf8Path) -> Result<(), ScanError> {
    match dir.metadata() {
        Ok(metadata) if metadata.is_dir() => Ok(()),
        Ok(_) => {
            Err(ImageDirError::NotADirectory { path: dir.to_owned() }.into())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            Err(NotFound { path: dir.to_owned() }.into())
        }
        Err(err) => Err(ImageDirError::Io { path: dir.to_owned(), err }.into()),
    }
}

/// Removes an image that was uploaded for activation once it has been
/// installed and stored.
pub trait ImageManager: Send + Sync {
    fn delete_image(
        &self,
        version_id: &VersionId,
        image_dir: &Utf8Path,
    ) -> Result<(), std::io::Error>;
}
