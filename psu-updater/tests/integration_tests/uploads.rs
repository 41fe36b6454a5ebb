// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::setup::{
    id, targets, upload_dir, write_image, TestSetup, PSU0, SOFTWARE,
};
use psu_updater::fakes::FakePsu;
use psu_updater::manager::spawn_upload_watcher;
use psu_updater::update_unit::JobResult;
use psu_updater::{ActivationStatus, RequestedActivation, VersionPurpose};
use std::time::Duration;

const INVENTORY_BASE: &str = "/xyz/openbmc_project/inventory/system";

#[tokio::test]
async fn uploaded_image_is_activated_and_stored() {
    let setup = TestSetup::new();
    setup.fakes.inventory.insert(PSU0, FakePsu::present("m", "v2"));
    write_image(&setup.images.builtin_dir.join("m"), "v2", "m");
    let cptestctx = setup.start();

    let watcher = spawn_upload_watcher(
        &cptestctx.log,
        cptestctx.handle.clone(),
        cptestctx.store.clone(),
        SOFTWARE.to_string(),
        Duration::from_millis(10),
    );

    // Move the image in whole so the watcher never sees a partial manifest.
    let staging = cptestctx.images.upload_dir.with_file_name("staging");
    write_image(&staging, "v3", "m");
    let uploaded = upload_dir(&cptestctx.images, "1a2b3c4d");
    std::fs::create_dir_all(&cptestctx.images.upload_dir).unwrap();
    std::fs::rename(&staging, &uploaded).unwrap();

    let mut v3 = None;
    for _ in 0..500 {
        v3 = cptestctx.activation("v3").await;
        if v3.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let v3 = v3.expect("uploaded image was not discovered");
    assert_eq!(v3.status, ActivationStatus::Ready);
    assert_eq!(v3.path.as_ref(), Some(&uploaded));
    assert_eq!(targets(&v3), vec![INVENTORY_BASE.to_string()]);

    let status = cptestctx
        .handle
        .request_activation(id("v3"), RequestedActivation::Active)
        .await
        .unwrap();
    assert_eq!(status, Some(ActivationStatus::Activating));
    cptestctx.complete_last_unit(JobResult::Done).await;
    watcher.abort();

    let activations = cptestctx.activations().await;
    assert_eq!(activations.len(), 1, "v2 is gone: {activations:?}");
    let v3 = &activations[0];
    assert_eq!(v3.status, ActivationStatus::Active);
    assert_eq!(
        targets(v3),
        vec![PSU0.to_string(), INVENTORY_BASE.to_string()]
    );

    // The image now lives in the persist directory, and the upload is
    // handed back for deletion.
    let persisted = cptestctx.images.persist_dir.join("m");
    assert_eq!(v3.path.as_ref(), Some(&persisted));
    assert_eq!(
        std::fs::read_to_string(persisted.join("image.bin")).unwrap(),
        "v3"
    );
    assert_eq!(
        cptestctx.fakes.image_manager.deleted(),
        vec![(id("v3"), uploaded)]
    );

    cptestctx.teardown().await;
}

#[tokio::test]
async fn builtin_only_ignores_other_images() {
    let mut setup = TestSetup::new();
    setup.images.always_use_builtin = true;
    setup.fakes.inventory.insert(PSU0, FakePsu::present("m", "v1"));
    write_image(&setup.images.builtin_dir.join("m"), "v2", "m");
    write_image(&setup.images.persist_dir.join("m"), "v3", "m");
    let cptestctx = setup.start();

    // The persisted image is newer but never considered.
    assert!(cptestctx.activation("v3").await.is_none());
    let v2 = cptestctx.activation("v2").await.unwrap();
    assert_eq!(v2.status, ActivationStatus::Activating);

    let uploaded = upload_dir(&cptestctx.images, "1a2b3c4d");
    write_image(&uploaded, "v9", "m");
    cptestctx
        .handle
        .version_discovered(
            format!("{SOFTWARE}/1a2b3c4d"),
            "v9".to_string(),
            VersionPurpose::Psu,
            Some(uploaded),
        )
        .await
        .unwrap();
    assert!(cptestctx.activation("v9").await.is_none());

    cptestctx.teardown().await;
}

#[tokio::test]
async fn non_psu_images_are_ignored() {
    let setup = TestSetup::new();
    setup.fakes.inventory.insert(PSU0, FakePsu::present("m", "v1"));
    let cptestctx = setup.start();

    let uploaded = upload_dir(&cptestctx.images, "bmc");
    std::fs::create_dir_all(&uploaded).unwrap();
    cptestctx
        .handle
        .version_discovered(
            format!("{SOFTWARE}/bmc"),
            "bmc-2.0".to_string(),
            VersionPurpose::Other,
            Some(uploaded),
        )
        .await
        .unwrap();

    let activations = cptestctx.activations().await;
    assert_eq!(activations.len(), 1);
    assert_eq!(activations[0].version, "v1");

    cptestctx.teardown().await;
}
