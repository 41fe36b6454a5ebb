// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::setup::{
    id, object_path, targets, write_image, TestSetup, PSU0, PSU1,
};
use psu_updater::association::{ACTIVE_ROLE, FUNCTIONAL_ROLE};
use psu_updater::fakes::FakePsu;
use psu_updater::update_unit::JobResult;
use psu_updater::{ActivationStatus, RequestedActivation, ShutdownInProgress};

#[tokio::test]
async fn startup_updates_every_psu_to_stored_image() {
    let setup = TestSetup::new();
    setup.fakes.inventory.insert(PSU0, FakePsu::present("m", "v1"));
    setup.fakes.inventory.insert(PSU1, FakePsu::present("m", "v1"));
    write_image(&setup.images.builtin_dir.join("m"), "v2", "m");
    let cptestctx = setup.start();

    // The initial scan finds both PSUs behind and starts the first one.
    let v2 = cptestctx.activation("v2").await.unwrap();
    assert_eq!(v2.status, ActivationStatus::Activating);
    assert_eq!(v2.progress, 10);
    assert_eq!(v2.queue_len, 2);
    assert_eq!(cptestctx.fakes.executor.started().len(), 1);

    cptestctx.complete_last_unit(JobResult::Done).await;
    let v2 = cptestctx.activation("v2").await.unwrap();
    assert_eq!(v2.status, ActivationStatus::Activating);
    assert_eq!(v2.progress, 50);
    assert_eq!(cptestctx.fakes.executor.started().len(), 2);

    cptestctx.complete_last_unit(JobResult::Done).await;
    let activations = cptestctx.activations().await;
    assert_eq!(activations.len(), 1, "v1 is gone: {activations:?}");
    let v2 = &activations[0];
    assert_eq!(v2.id, id("v2"));
    assert_eq!(v2.status, ActivationStatus::Active);
    assert_eq!(v2.requested, RequestedActivation::None);
    assert_eq!(v2.progress, 100);
    assert_eq!(targets(v2), vec![PSU0.to_string(), PSU1.to_string()]);

    let associations = cptestctx.handle.get_associations().await.unwrap();
    let active: Vec<&str> = associations.targets(ACTIVE_ROLE).collect();
    assert_eq!(active, vec![object_path("v2").as_str()]);
    let functional: Vec<&str> =
        associations.targets(FUNCTIONAL_ROLE).collect();
    assert_eq!(functional, vec![object_path("v2").as_str()]);

    cptestctx.teardown().await;
}

#[tokio::test]
async fn hot_plugged_psu_is_brought_up_to_date() {
    let setup = TestSetup::new();
    setup.fakes.inventory.insert(PSU0, FakePsu::present("m", "v2"));
    setup.fakes.inventory.insert(PSU1, FakePsu::absent());
    write_image(&setup.images.builtin_dir.join("m"), "v2", "m");
    let cptestctx = setup.start();

    let v2 = cptestctx.activation("v2").await.unwrap();
    assert_eq!(v2.status, ActivationStatus::Active);
    assert!(v2.path.is_some());
    assert!(cptestctx.fakes.executor.started().is_empty());
    let status = cptestctx.handle.get_psu_status().await.unwrap();
    assert!(status[PSU0].present);
    assert!(!status[PSU1].present);

    cptestctx.fakes.inventory.insert(PSU1, FakePsu::present("m", "v1"));
    cptestctx
        .handle
        .presence_changed(PSU1.to_string(), true)
        .await
        .unwrap();

    let v1 = cptestctx.activation("v1").await.unwrap();
    assert_eq!(targets(&v1), vec![PSU1.to_string()]);
    let v2 = cptestctx.activation("v2").await.unwrap();
    assert_eq!(v2.status, ActivationStatus::Activating);
    assert_eq!(v2.current_psu.as_deref(), Some(PSU1));

    cptestctx.complete_last_unit(JobResult::Done).await;
    assert!(cptestctx.activation("v1").await.is_none());
    let v2 = cptestctx.activation("v2").await.unwrap();
    assert_eq!(v2.status, ActivationStatus::Active);
    assert_eq!(targets(&v2), vec![PSU0.to_string(), PSU1.to_string()]);

    // Pulling a PSU only drops its association.
    cptestctx.fakes.inventory.update(PSU1, |psu| psu.present = false);
    cptestctx.handle.poll_inventory().await.unwrap();
    let v2 = cptestctx.activation("v2").await.unwrap();
    assert_eq!(targets(&v2), vec![PSU0.to_string()]);

    cptestctx.teardown().await;
}

#[tokio::test]
async fn failed_update_is_not_retried_automatically() {
    let setup = TestSetup::new();
    setup.fakes.inventory.insert(PSU0, FakePsu::present("m", "v1"));
    write_image(&setup.images.builtin_dir.join("m"), "v2", "m");
    let cptestctx = setup.start();

    cptestctx.complete_last_unit(JobResult::Failed).await;
    let v2 = cptestctx.activation("v2").await.unwrap();
    assert_eq!(v2.status, ActivationStatus::Failed);
    assert_eq!(v2.requested, RequestedActivation::None);
    assert!(targets(&v2).is_empty());

    // Events that would normally converge the PSUs leave it alone.
    cptestctx
        .handle
        .model_changed(PSU0.to_string(), "m".to_string())
        .await
        .unwrap();
    cptestctx.handle.poll_inventory().await.unwrap();
    cptestctx.activations().await;
    assert_eq!(cptestctx.fakes.executor.started().len(), 1);

    // An explicit request starts over.
    let status = cptestctx
        .handle
        .request_activation(id("v2"), RequestedActivation::Active)
        .await
        .unwrap();
    assert_eq!(status, Some(ActivationStatus::Activating));
    assert_eq!(cptestctx.fakes.executor.started().len(), 2);
    cptestctx.complete_last_unit(JobResult::Done).await;
    let v2 = cptestctx.activation("v2").await.unwrap();
    assert_eq!(v2.status, ActivationStatus::Active);
    assert_eq!(targets(&v2), vec![PSU0.to_string()]);

    cptestctx.teardown().await;
}

#[tokio::test]
async fn requests_for_unknown_versions() {
    let setup = TestSetup::new();
    setup.fakes.inventory.insert(PSU0, FakePsu::present("m", "v1"));
    let cptestctx = setup.start();

    let status = cptestctx
        .handle
        .request_activation(id("v9"), RequestedActivation::Active)
        .await
        .unwrap();
    assert_eq!(status, None);
    assert!(!cptestctx.handle.erase(id("v9")).await.unwrap());

    // The running version is active, so there is nothing to delete.
    assert!(cptestctx.handle.delete_all().await.unwrap().is_empty());
    assert!(cptestctx.handle.erase(id("v1")).await.unwrap());
    assert!(cptestctx.activations().await.is_empty());
    let associations = cptestctx.handle.get_associations().await.unwrap();
    assert!(associations.is_empty());

    cptestctx.teardown().await;
}

#[tokio::test]
async fn handle_fails_after_shutdown() {
    let setup = TestSetup::new();
    let cptestctx = setup.start();
    let handle = cptestctx.handle.clone();
    cptestctx.teardown().await;

    assert_eq!(handle.get_activations().await, Err(ShutdownInProgress));
    assert_eq!(handle.poll_inventory().await, Err(ShutdownInProgress));
}
