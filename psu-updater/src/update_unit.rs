// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The external unit that flashes one PSU with one image

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub const DEFAULT_UPDATE_UNIT_TEMPLATE: &str = "psu-update@.service";

/// Separator between the two unit instance arguments, as systemd escapes a
/// space.
const ESCAPED_SPACE: &str = "\\x20";

/// Escape one instance argument: `/` becomes `-` and a space becomes `\x20`.
pub fn escape_unit_arg(arg: &str) -> String {
    let mut escaped = String::with_capacity(arg.len());
    for c in arg.chars() {
        match c {
            '/' => escaped.push('-'),
            ' ' => escaped.push_str(ESCAPED_SPACE),
            c => escaped.push(c),
        }
    }
    escaped
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unit template {0:?} must contain '@'")]
pub struct InvalidUnitTemplate(String);

/// A templated unit name such as `psu-update@.service`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UpdateUnitTemplate {
    template: String,
    at: usize,
}

impl UpdateUnitTemplate {
    pub fn new(
        template: impl Into<String>,
    ) -> Result<Self, InvalidUnitTemplate> {
        let template = template.into();
        match template.find('@') {
            Some(at) => Ok(Self { template, at }),
            None => Err(InvalidUnitTemplate(template)),
        }
    }

    /// The unit that updates the PSU at `psu_path` with the image stored at
    /// `image_path`.
    pub fn unit_name(&self, psu_path: &str, image_path: &str) -> String {
        let (prefix, suffix) = self.template.split_at(self.at + 1);
        format!(
            "{prefix}{}{ESCAPED_SPACE}{}{suffix}",
            escape_unit_arg(psu_path),
            escape_unit_arg(image_path),
        )
    }
}

impl Default for UpdateUnitTemplate {
    fn default() -> Self {
        Self {
            template: DEFAULT_UPDATE_UNIT_TEMPLATE.to_string(),
            at: DEFAULT_UPDATE_UNIT_TEMPLATE.find('@').unwrap_or(0),
        }
    }
}

impl TryFrom<String> for UpdateUnitTemplate {
    type Error = InvalidUnitTemplate;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<UpdateUnitTemplate> for String {
    fn from(value: UpdateUnitTemplate) -> Self {
        value.template
    }
}

impl fmt::Display for UpdateUnitTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.template)
    }
}

/// How a flashing job ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum JobResult {
    Done,
    Failed,
    DependencyFailed,
}

impl JobResult {
    /// Map a systemd job result string. Results that say nothing about the
    /// update (e.g. `skipped`) yield `None`.
    pub fn from_systemd(result: &str) -> Option<Self> {
        match result {
            "done" => Some(JobResult::Done),
            "failed" | "timeout" | "canceled" => Some(JobResult::Failed),
            "dependency" => Some(JobResult::DependencyFailed),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("failed to start unit {unit}")]
    Start {
        unit: String,
        #[source]
        err: std::io::Error,
    },
    #[error("unit {unit} was rejected: {message}")]
    Rejected { unit: String, message: String },
}

/// Starts flashing units.
///
/// Starting is synchronous and must not block for long; the outcome of the
/// job is delivered later as a `JobCompleted` event keyed by unit name.
pub trait UpdateExecutor: Send + Sync {
    fn start(&self, unit: &str) -> Result<(), ExecutorError>;
}
