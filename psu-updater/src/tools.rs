// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Production collaborators backed by external commands
//!
//! The PSU inventory and version comparison come from vendor tools, update
//! units are started with `systemctl`. Every command runs on the tokio
//! runtime and is bounded by a timeout, so a stuck tool turns into an error
//! instead of stalling the event loop.

use crate::config::ToolsConfig;
use crate::image_store::{ImageManager, ImageStore};
use crate::inventory::{PsuInventory, ToolError, VersionComparator};
use crate::manager::UpdaterHandle;
use crate::update_unit::{ExecutorError, JobResult, UpdateExecutor};
use crate::version::VersionId;
use camino::{Utf8Path, Utf8PathBuf};
use slog::{debug, error, info, o, warn, Logger};
use std::collections::BTreeSet;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::process::Command;
use tokio::runtime::Handle;

fn command_to_string(command: &Command) -> String {
    let command = command.as_std();
    std::iter::once(command.get_program())
        .chain(command.get_args())
        .map(|s| s.to_string_lossy().into())
        .collect::<Vec<String>>()
        .join(" ")
}

/// Vendor command-line tools answering inventory and version questions.
///
/// Methods block the calling thread until the tool exits; they must not be
/// called from within an async task.
pub struct VendorTools {
    log: Logger,
    rt: Handle,
    config: ToolsConfig,
    counter: AtomicU64,
}

impl VendorTools {
    pub fn new(log: &Logger, rt: Handle, config: ToolsConfig) -> Self {
        let log = log.new(o!("component" => "VendorTools"));
        Self { log, rt, config, counter: AtomicU64::new(0) }
    }

    /// Run `argv` followed by `args` and return its standard output.
    fn run(
        &self,
        argv: &[String],
        args: &[&str],
    ) -> Result<String, ToolError> {
        let Some((program, prefix)) = argv.split_first() else {
            return Err(ToolError::Unavailable("no command configured".into()));
        };
        let mut command = Command::new(program);
        command
            .args(prefix)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        let command_str = command_to_string(&command);
        let id = self.counter.fetch_add(1, Ordering::SeqCst);
        debug!(self.log, "running command";
            "id" => id,
            "command" => &command_str,
        );

        let timeout = self.config.timeout();
        let output = self
            .rt
            .block_on(async {
                tokio::time::timeout(timeout, command.output()).await
            })
            .map_err(|_| ToolError::Timeout {
                command: command_str.clone(),
                timeout,
            })?
            .map_err(|err| ToolError::Start {
                command: command_str.clone(),
                err,
            })?;

        debug!(self.log, "finished command";
            "id" => id,
            "result" => if output.status.success() { "OK" } else { "ERROR" },
        );
        if !output.status.success() {
            return Err(ToolError::Failed {
                command: command_str,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr)
                    .trim()
                    .to_string(),
            });
        }
        String::from_utf8(output.stdout).map_err(|err| ToolError::Parse {
            command: command_str,
            output: String::from_utf8_lossy(err.as_bytes()).into_owned(),
        })
    }

    fn run_trimmed(
        &self,
        argv: &[String],
        args: &[&str],
    ) -> Result<String, ToolError> {
        self.run(argv, args).map(|out| out.trim().to_string())
    }
}

impl PsuInventory for VendorTools {
    fn psu_paths(&self) -> Result<Vec<String>, ToolError> {
        let out = self.run(&self.config.list_psus, &[])?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn is_present(&self, psu: &str) -> Result<bool, ToolError> {
        let out = self.run_trimmed(&self.config.psu_present, &[psu])?;
        match out.as_str() {
            "true" | "1" => Ok(true),
            "false" | "0" => Ok(false),
            _ => Err(ToolError::Parse {
                command: self.config.psu_present.join(" "),
                output: out,
            }),
        }
    }

    fn model(&self, psu: &str) -> Result<String, ToolError> {
        self.run_trimmed(&self.config.psu_model, &[psu])
    }

    fn manufacturer(&self, psu: &str) -> Result<String, ToolError> {
        self.run_trimmed(&self.config.psu_manufacturer, &[psu])
    }

    fn version(&self, psu: &str) -> Result<String, ToolError> {
        self.run_trimmed(&self.config.psu_version, &[psu])
    }
}

impl VersionComparator for VendorTools {
    fn latest(
        &self,
        versions: &BTreeSet<String>,
    ) -> Result<Option<String>, ToolError> {
        if versions.is_empty() {
            return Ok(None);
        }
        let args: Vec<&str> = versions.iter().map(String::as_str).collect();
        let latest = self.run_trimmed(&self.config.compare_versions, &args)?;
        Ok(Some(latest).filter(|v| !v.is_empty()))
    }
}

/// Starts update units with `systemctl start` and reports how they ended to
/// the event loop.
pub struct SystemdExecutor {
    log: Logger,
    rt: Handle,
    systemctl: Utf8PathBuf,
    timeout: Duration,
    updater: UpdaterHandle,
}

impl SystemdExecutor {
    pub fn new(
        log: &Logger,
        rt: Handle,
        config: &ToolsConfig,
        updater: UpdaterHandle,
    ) -> Self {
        let log = log.new(o!("component" => "SystemdExecutor"));
        Self {
            log,
            rt,
            systemctl: config.systemctl.clone(),
            timeout: config.update_timeout(),
            updater,
        }
    }
}

impl UpdateExecutor for SystemdExecutor {
    fn start(&self, unit: &str) -> Result<(), ExecutorError> {
        let _guard = self.rt.enter();
        let mut command = Command::new(&self.systemctl);
        command
            .arg("start")
            .arg(unit)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let child = command.spawn().map_err(|err| ExecutorError::Start {
            unit: unit.to_string(),
            err,
        })?;
        info!(self.log, "started update unit"; "unit" => unit);

        let log = self.log.new(o!("unit" => unit.to_string()));
        let systemctl = self.systemctl.clone();
        let unit = unit.to_string();
        let timeout = self.timeout;
        let updater = self.updater.clone();
        self.rt.spawn(async move {
            let result =
                match tokio::time::timeout(timeout, child.wait_with_output())
                    .await
                {
                    Ok(Ok(output)) if output.status.success() => {
                        JobResult::Done
                    }
                    Ok(Ok(output)) => {
                        let stderr = String::from_utf8_lossy(&output.stderr);
                        let unit_result =
                            unit_result(&log, &systemctl, &unit, timeout)
                                .await;
                        warn!(log, "update unit failed";
                            "status" => %output.status,
                            "stderr" => stderr.trim(),
                            "unit_result" => ?unit_result,
                        );
                        failed_start_result(unit_result.as_deref())
                    }
                    Ok(Err(err)) => {
                        error!(log, "failed to wait for update unit";
                            "error" => %err,
                        );
                        JobResult::Failed
                    }
                    Err(_) => {
                        error!(log, "update unit timed out";
                            "timeout" => ?timeout,
                        );
                        JobResult::Failed
                    }
                };
            if updater.job_completed(unit, result).await.is_err() {
                debug!(log, "updater stopped before the unit finished");
            }
        });
        Ok(())
    }
}

/// Read the `Result` property of a unit whose start job failed.
async fn unit_result(
    log: &Logger,
    systemctl: &Utf8Path,
    unit: &str,
    timeout: Duration,
) -> Option<String> {
    let mut command = Command::new(systemctl);
    command
        .args(["show", "-p", "Result", "--value", unit])
        .stdin(Stdio::null())
        .kill_on_drop(true);
    match tokio::time::timeout(timeout, command.output()).await {
        Ok(Ok(output)) if output.status.success() => {
            let result = String::from_utf8_lossy(&output.stdout);
            Some(result.trim().to_string())
        }
        Ok(Ok(output)) => {
            warn!(log, "failed to query unit result";
                "status" => %output.status,
            );
            None
        }
        Ok(Err(err)) => {
            warn!(log, "failed to query unit result"; "error" => %err);
            None
        }
        Err(_) => {
            warn!(log, "unit result query timed out"; "timeout" => ?timeout);
            None
        }
    }
}

/// Outcome of a `systemctl start` that exited non-zero, given the unit's
/// `Result` property.
///
/// A unit whose result is still `success` never ran, so its start job was
/// failed by one of its dependencies.
fn failed_start_result(unit_result: Option<&str>) -> JobResult {
    match unit_result {
        Some("success") => JobResult::DependencyFailed,
        Some(result) => {
            JobResult::from_systemd(result).unwrap_or(JobResult::Failed)
        }
        None => JobResult::Failed,
    }
}

/// Removes uploaded images from the upload directory.
pub struct UploadDirImageManager {
    log: Logger,
    store: ImageStore,
}

impl UploadDirImageManager {
    pub fn new(log: &Logger, store: ImageStore) -> Self {
        let log = log.new(o!("component" => "UploadDirImageManager"));
        Self { log, store }
    }
}

impl ImageManager for UploadDirImageManager {
    fn delete_image(
        &self,
        version_id: &VersionId,
        image_dir: &Utf8Path,
    ) -> Result<(), std::io::Error> {
        if !self.store.is_uploaded(image_dir) {
            debug!(self.log, "not an uploaded image, keeping it";
                "path" => %image_dir,
            );
            return Ok(());
        }
        match std::fs::remove_dir_all(image_dir) {
            Ok(()) => {
                info!(self.log, "deleted uploaded image";
                    "version_id" => %version_id,
                    "path" => %image_dir,
                );
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }
}
