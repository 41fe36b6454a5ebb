// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-image activation state machine
//!
//! An [`Activation`] drives one firmware image onto every present,
//! compatible PSU that is not already running it, one PSU at a time. It only
//! reaches back into its owner through [`ActivationContext`].

use crate::association::{ActivationContext, AssociationSet, ACTIVATION_ROLE};
use crate::context::UpdaterContext;
use crate::inventory::is_compatible;
use crate::update_unit::JobResult;
use crate::version::{Version, VersionId};
use camino::Utf8PathBuf;
use display_error_chain::DisplayErrorChain;
use serde::Serialize;
use slog::{debug, error, info, o, warn, Logger};
use std::collections::VecDeque;
use std::sync::Arc;

/// Progress reported once the first PSU has been dispatched.
const INITIAL_PROGRESS: u8 = 10;
/// Share of the progress bar spread across the queued PSUs.
const QUEUE_PROGRESS: usize = 80;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ActivationStatus {
    /// Image known but not installed anywhere.
    Ready,
    Activating,
    /// Installed on every PSU it was meant for.
    Active,
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum RequestedActivation {
    None,
    Active,
}

/// Objects that only exist while an activation is in progress.
#[derive(Debug)]
struct TransitionMarkers {
    log: Logger,
}

impl TransitionMarkers {
    fn create(log: &Logger) -> Self {
        debug!(log, "created blocks-transition and progress markers");
        Self { log: log.clone() }
    }
}

impl Drop for TransitionMarkers {
    fn drop(&mut self) {
        debug!(self.log, "removed blocks-transition and progress markers");
    }
}

/// Point-in-time view of an activation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ActivationSummary {
    pub id: VersionId,
    pub object_path: String,
    pub version: String,
    pub extended_version: String,
    pub path: Option<Utf8PathBuf>,
    pub status: ActivationStatus,
    pub requested: RequestedActivation,
    pub progress: u8,
    pub associations: AssociationSet,
    pub queue_len: usize,
    pub current_psu: Option<String>,
    pub job_failed: bool,
}

pub struct Activation {
    log: Logger,
    ctx: Arc<UpdaterContext>,
    object_path: String,
    version: Version,
    status: ActivationStatus,
    requested: RequestedActivation,
    associations: AssociationSet,

    queue: VecDeque<String>,
    progress_step: u8,
    progress: u8,
    current_psu: Option<String>,
    current_unit: Option<String>,
    markers: Option<TransitionMarkers>,
    activate_again: bool,
    /// The last run ended because an update unit failed, as opposed to
    /// finding nothing to install on.
    job_failed: bool,
}

impl Activation {
    pub fn new(
        ctx: Arc<UpdaterContext>,
        version: Version,
        status: ActivationStatus,
        associations: AssociationSet,
    ) -> Self {
        let object_path = ctx.object_path(version.id());
        let log = ctx.log.new(o!(
            "component" => "Activation",
            "version_id" => version.id().to_string(),
        ));
        debug!(log, "created activation";
            "status" => ?status,
            "version" => version.version(),
        );
        Self {
            log,
            ctx,
            object_path,
            version,
            status,
            requested: RequestedActivation::None,
            associations,
            queue: VecDeque::new(),
            progress_step: 0,
            progress: 0,
            current_psu: None,
            current_unit: None,
            markers: None,
            activate_again: false,
            job_failed: false,
        }
    }

    pub fn id(&self) -> &VersionId {
        self.version.id()
    }

    pub fn object_path(&self) -> &str {
        &self.object_path
    }

    pub fn version(&self) -> &Version {
        &self.version
    }

    pub fn version_mut(&mut self) -> &mut Version {
        &mut self.version
    }

    pub fn status(&self) -> ActivationStatus {
        self.status
    }

    pub fn requested(&self) -> RequestedActivation {
        self.requested
    }

    pub fn associations(&self) -> &AssociationSet {
        &self.associations
    }

    pub fn associations_mut(&mut self) -> &mut AssociationSet {
        &mut self.associations
    }

    pub fn progress(&self) -> u8 {
        self.progress
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn current_psu(&self) -> Option<&str> {
        self.current_psu.as_deref()
    }

    pub fn current_unit(&self) -> Option<&str> {
        self.current_unit.as_deref()
    }

    /// Whether the blocks-transition and progress markers exist.
    pub fn blocks_transition(&self) -> bool {
        self.markers.is_some()
    }

    /// Whether another run is armed for when the current one succeeds.
    pub fn activate_again(&self) -> bool {
        self.activate_again
    }

    /// Whether this is `Failed` because an update unit did not succeed.
    /// Such a failure is only retried on an explicit request.
    pub fn job_failed(&self) -> bool {
        self.job_failed
    }

    pub fn summary(&self) -> ActivationSummary {
        ActivationSummary {
            id: self.id().clone(),
            object_path: self.object_path.clone(),
            version: self.version.version().to_string(),
            extended_version: self.version.extended_version().to_string(),
            path: self.version.path().cloned(),
            status: self.status,
            requested: self.requested,
            progress: self.progress,
            associations: self.associations.clone(),
            queue_len: self.queue.len(),
            current_psu: self.current_psu.clone(),
            job_failed: self.job_failed,
        }
    }

    /// Handle a change of the requested activation.
    ///
    /// A request that arrives while a run is in flight does not restart it;
    /// it is replayed once the run succeeds.
    pub fn request_activation(
        &mut self,
        requested: RequestedActivation,
        cx: &mut dyn ActivationContext,
    ) -> ActivationStatus {
        match requested {
            RequestedActivation::None => {
                self.requested = RequestedActivation::None;
            }
            RequestedActivation::Active
                if self.status == ActivationStatus::Activating =>
            {
                info!(self.log, "activation in progress, will activate again");
                self.activate_again = true;
            }
            RequestedActivation::Active => {
                self.requested = RequestedActivation::Active;
                let status = self.start_activation(cx);
                self.leave_or_stay(status);
                if self.status != ActivationStatus::Activating {
                    self.requested = RequestedActivation::None;
                }
            }
        }
        self.status
    }

    /// Route the completion of an update unit. Returns false if the unit is
    /// not the one this activation is waiting for.
    pub fn on_job_completed(
        &mut self,
        unit: &str,
        result: JobResult,
        cx: &mut dyn ActivationContext,
    ) -> bool {
        if self.current_unit.as_deref() != Some(unit) {
            return false;
        }
        match result {
            JobResult::Done => self.on_update_done(cx),
            JobResult::Failed | JobResult::DependencyFailed => {
                warn!(self.log, "update unit did not succeed";
                    "unit" => unit,
                    "result" => ?result,
                );
                self.on_update_failed();
            }
        }
        true
    }

    /// Leaving `Activating` removes the transition markers.
    fn leave_or_stay(&mut self, status: ActivationStatus) {
        if status != ActivationStatus::Activating {
            self.markers = None;
        }
        self.status = status;
    }

    /// Outcome of a start that found nothing to install on.
    fn soft_failure(&self, previous: ActivationStatus) -> ActivationStatus {
        if previous == ActivationStatus::Active {
            ActivationStatus::Active
        } else {
            ActivationStatus::Failed
        }
    }

    fn start_activation(
        &mut self,
        cx: &mut dyn ActivationContext,
    ) -> ActivationStatus {
        let previous = self.status;
        if self.version.path().is_none() {
            warn!(self.log, "no image file to install");
            return previous;
        }

        let psus = cx.known_psus();
        if psus.is_empty() {
            warn!(self.log, "no PSU inventory found");
            return self.soft_failure(previous);
        }

        self.queue.clear();
        let mut compatible = 0;
        for (psu, status) in psus {
            if !status.present {
                continue;
            }
            // A PSU whose model is not known yet is picked up by a later run.
            if status.model.is_empty() || !is_compatible(&status, &self.version)
            {
                info!(self.log, "PSU is not compatible";
                    "psu" => &psu,
                    "model" => &status.model,
                    "manufacturer" => &status.manufacturer,
                );
                continue;
            }
            compatible += 1;
            if self.associations.is_associated(&psu) {
                info!(self.log, "PSU is already running the image";
                    "psu" => &psu,
                );
                continue;
            }
            self.queue.push_back(psu);
        }

        if compatible == 0 {
            warn!(self.log, "no compatible PSU found");
            return self.soft_failure(previous);
        }
        if self.queue.is_empty() {
            info!(self.log, "all compatible PSUs already run the image");
            return previous;
        }

        info!(self.log, "starting activation"; "queued" => self.queue.len());
        self.markers = Some(TransitionMarkers::create(&self.log));
        self.job_failed = false;
        self.progress = 0;
        self.progress_step =
            u8::try_from(QUEUE_PROGRESS / self.queue.len()).unwrap_or(0);
        if !self.dispatch_next(cx) {
            return ActivationStatus::Failed;
        }
        self.progress = INITIAL_PROGRESS;
        ActivationStatus::Activating
    }

    /// Start the update unit for the PSU at the head of the queue, or
    /// finish the run if the queue is empty. Returns false if the unit
    /// could not be started.
    fn dispatch_next(&mut self, cx: &mut dyn ActivationContext) -> bool {
        let Some(psu) = self.queue.front().cloned() else {
            self.finish_activation(cx);
            return true;
        };
        let Some(image) = self.version.path() else {
            error!(self.log, "image file disappeared"; "psu" => &psu);
            self.on_update_failed();
            return false;
        };
        let template = &self.ctx.config.update_unit_template;
        let unit = template.unit_name(&psu, image.as_str());
        self.current_psu = Some(psu.clone());
        self.current_unit = Some(unit.clone());
        match self.ctx.executor.start(&unit) {
            Ok(()) => {
                info!(self.log, "started PSU update";
                    "psu" => &psu,
                    "unit" => &unit,
                );
                true
            }
            Err(err) => {
                error!(self.log, "failed to start PSU update";
                    "psu" => &psu,
                    "error" => %DisplayErrorChain::new(&err),
                );
                self.on_update_failed();
                false
            }
        }
    }

    fn on_update_done(&mut self, cx: &mut dyn ActivationContext) {
        let Some(psu) = self.current_psu.take() else {
            return;
        };
        self.current_unit = None;
        info!(self.log, "PSU update done"; "psu" => &psu);

        self.progress = self.progress.saturating_add(self.progress_step);
        self.associations.add(ACTIVATION_ROLE, psu.clone());
        cx.on_update_done(self.version.id(), &psu);
        self.queue.pop_front();
        self.dispatch_next(cx);
    }

    fn on_update_failed(&mut self) {
        let psu = self
            .current_psu
            .take()
            .or_else(|| self.queue.front().cloned())
            .unwrap_or_default();
        error!(self.log, "failed to update PSU";
            "psu" => psu,
            "abandoned" => self.queue.len().saturating_sub(1),
        );
        self.queue.clear();
        self.current_unit = None;
        self.requested = RequestedActivation::None;
        self.activate_again = false;
        self.job_failed = true;
        self.leave_or_stay(ActivationStatus::Failed);
    }

    fn finish_activation(&mut self, cx: &mut dyn ActivationContext) {
        let uploaded = self.store_image();
        self.progress = 100;
        if let Some(uploaded) = uploaded {
            let id = self.version.id();
            if let Err(err) = self.ctx.image_manager.delete_image(id, &uploaded)
            {
                warn!(self.log, "failed to delete uploaded image";
                    "path" => %uploaded,
                    "error" => %DisplayErrorChain::new(&err),
                );
            }
        }

        cx.create_active_association(&self.object_path);
        cx.add_functional_association(&self.object_path);
        cx.add_updateable_association(&self.object_path);

        self.requested = RequestedActivation::None;
        self.leave_or_stay(ActivationStatus::Active);
        info!(self.log, "activation finished");

        if self.activate_again {
            self.activate_again = false;
            info!(self.log, "activating again");
            self.request_activation(RequestedActivation::Active, cx);
        }
    }

    /// Copy an uploaded image to the persist directory and point the
    /// version at the copy. Returns the uploaded location if it was stored.
    fn store_image(&mut self) -> Option<Utf8PathBuf> {
        let src = self.version.path()?.clone();
        let model = self.version.model().to_string();
        if model.is_empty() {
            warn!(self.log, "image has no model, not storing it";
                "path" => %src,
            );
            return None;
        }
        match self.ctx.image_store.persist(&src, &model) {
            Ok(Some(dst)) => {
                info!(self.log, "stored image"; "from" => %src, "to" => %dst);
                self.version.set_path(dst);
                Some(src)
            }
            Ok(None) => None,
            Err(err) => {
                error!(self.log, "failed to store image";
                    "path" => %src,
                    "error" => %DisplayErrorChain::new(&err),
                );
                None
            }
        }
    }
}
