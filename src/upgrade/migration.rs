use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, PodSecurityContext, PodSpec};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Client;
use tracing::{debug, info};

use crate::cancel::Cancellation;
use crate::config::{
    CLAIM_PHASE_BOUND, POST_HOOK_SCRIPT_FILE, PREPARE_SCRIPT_FILE, RECLAIM_RETAIN,
};
use crate::error::{Error, Result};
use crate::ext::ClaimExt;
use crate::names;
use crate::pod_runner::PodRunner;
use crate::quantity;
use crate::retry::{retry_on_error, Backoff};
use crate::secrets;
use crate::upgrade::action::UpgradeAction;
use crate::volumes::{claim_volume, secret_volume, VolumeOps};

/// One volume migration: where the data lives now and where it ends up.
pub struct DataMigration {
    pub namespace: String,
    pub source_pvc_name: String,
    /// May equal the source name; the swap then reuses it.
    pub target_pvc_name: String,
    pub storage_class: String,
    pub disk_size: String,
}

/// Migrates the data behind the source claim onto a fresh volume and
/// swaps that volume in under the target claim name.
///
/// The sequence is strict: the upgrade pod writes converted data onto a
/// temporary claim, both backing volumes are pinned to the Retain reclaim
/// policy, and only then are any claims deleted. Retain-before-delete is
/// the invariant that keeps the reclaim controller from ever destroying a
/// volume that still holds postgres data. The temporary volume is then
/// rebound to the target name by clearing its claim ref and pre-binding
/// it to the not-yet-existing target claim.
///
/// The script secret is removed on every exit path. The temporary claim
/// and the reclaim flips are deliberately never rolled back: a spare
/// Retain volume is recoverable, an uncertain Delete volume is not.
pub async fn run_data_migration(
    client: &Client,
    cancel: &Cancellation,
    migration: &DataMigration,
    action: &UpgradeAction,
) -> Result<()> {
    let namespace = &migration.namespace;
    let upgrade_pod_name = names::upgrade_pod_name(&action.name, &migration.source_pvc_name);
    let volumes = VolumeOps::new(client.clone());

    // validate everything before the cluster is touched
    volumes
        .validate_storage_class(&migration.storage_class)
        .await?;
    let source_pvc = volumes
        .claim_and_wait_for_volume(cancel, namespace, &migration.source_pvc_name)
        .await?;
    let size = quantity::parse_storage_size(&migration.disk_size)?;

    // stage the scripts under the upgrade pod's name
    let secret = secrets::script_secret(
        namespace,
        &upgrade_pod_name,
        &[
            (PREPARE_SCRIPT_FILE, action.prepare_script),
            (POST_HOOK_SCRIPT_FILE, action.post_hook_script),
        ],
    );
    secrets::create_or_update(client, &secret).await?;

    let result = swap_volumes(
        client,
        cancel,
        migration,
        action,
        &volumes,
        &source_pvc,
        &upgrade_pod_name,
        &size,
    )
    .await;

    // the script secret never outlives the migration
    if let Err(err) = secrets::delete(client, namespace, &upgrade_pod_name).await {
        debug!("failed to clean up script secret {upgrade_pod_name:?}: {err}");
    }
    result
}

#[allow(clippy::too_many_arguments)]
async fn swap_volumes(
    client: &Client,
    cancel: &Cancellation,
    migration: &DataMigration,
    action: &UpgradeAction,
    volumes: &VolumeOps,
    source_pvc: &PersistentVolumeClaim,
    upgrade_pod_name: &str,
    size: &Quantity,
) -> Result<()> {
    let namespace = &migration.namespace;
    let tmp_claim_name = names::tmp_claim_name(&migration.source_pvc_name);

    match volumes
        .create_claim(namespace, &tmp_claim_name, &migration.storage_class, size)
        .await
    {
        Ok(()) => info!("temporary pvc {tmp_claim_name:?} created"),
        Err(err) if err.is_already_exists() => info!("using existing pvc {tmp_claim_name:?}"),
        Err(err) => return Err(err),
    }

    // run pg_upgrade from the source claim onto the temporary claim
    let runner = PodRunner::new(client.clone());
    runner
        .run_pod(
            cancel,
            namespace,
            upgrade_pod_name,
            upgrade_pod(migration, action, upgrade_pod_name, &tmp_claim_name),
        )
        .await?;

    // the claim object is kept around for its volume name
    let tmp_pvc = volumes
        .claim_and_wait_for_volume(cancel, namespace, &tmp_claim_name)
        .await?;
    let tmp_volume_name = tmp_pvc
        .volume_name()
        .ok_or_else(|| {
            Error::BindingMismatch(format!("pvc {tmp_claim_name:?} lost its volume binding"))
        })?
        .to_string();
    let tmp_pvc = &tmp_pvc;
    let tmp_volume_name = tmp_volume_name.as_str();

    // Both volumes must survive their claims being deleted below; pin
    // them to Retain first.
    retry_on_error(cancel, Backoff::default(), || async move {
        volumes.set_reclaim_policy(source_pvc, RECLAIM_RETAIN).await?;
        volumes.set_reclaim_policy(tmp_pvc, RECLAIM_RETAIN).await
    })
    .await?;

    info!("deleting temp pvc {tmp_claim_name:?} (persistent volume is retained)");
    volumes.delete_claim(namespace, &tmp_claim_name).await?;
    info!(
        "deleting source pvc {:?} (persistent volume is retained)",
        migration.source_pvc_name
    );
    volumes
        .delete_claim(namespace, &migration.source_pvc_name)
        .await?;
    // the target may reuse the source name, so its absence must be
    // observed before the new claim is created
    volumes
        .wait_for_claim_deletion(cancel, namespace, &migration.source_pvc_name)
        .await?;

    // rebind the upgraded volume to the target claim name
    retry_on_error(cancel, Backoff::default(), || async move {
        volumes.clear_claim_ref(tmp_pvc).await?;
        volumes
            .set_claim_ref(tmp_volume_name, namespace, &migration.target_pvc_name)
            .await
    })
    .await?;

    retry_on_error(cancel, Backoff::default(), || async move {
        match volumes
            .create_claim(
                namespace,
                &migration.target_pvc_name,
                &migration.storage_class,
                size,
            )
            .await
        {
            // left over from an interrupted run; the binding check below decides
            Err(err) if err.is_already_exists() => {
                info!("target pvc {:?} already exists", migration.target_pvc_name);
                Ok(())
            }
            other => other,
        }
    })
    .await?;
    info!("created final pvc {:?}", migration.target_pvc_name);

    retry_on_error(cancel, Backoff::default(), || async move {
        verify_target_binding(cancel, volumes, migration, tmp_volume_name).await
    })
    .await?;

    let post_hook_pod_name = names::post_hook_pod_name(&action.name, &migration.source_pvc_name);
    info!("running the post upgrade hook pod {post_hook_pod_name:?}...");
    runner
        .run_pod(
            cancel,
            namespace,
            &post_hook_pod_name,
            post_hook_pod(migration, action, &post_hook_pod_name, upgrade_pod_name),
        )
        .await?;
    info!("completed running the post upgrade hook pod");
    Ok(())
}

/// Confirms the target claim is bound to the upgraded volume with the
/// expected storage class.
async fn verify_target_binding(
    cancel: &Cancellation,
    volumes: &VolumeOps,
    migration: &DataMigration,
    expected_volume: &str,
) -> Result<()> {
    let target = volumes
        .claim_and_wait_for_volume(cancel, &migration.namespace, &migration.target_pvc_name)
        .await?;

    if target.phase() != Some(CLAIM_PHASE_BOUND) {
        return Err(Error::BindingMismatch(format!(
            "pvc {:?} is not bound",
            migration.target_pvc_name
        )));
    }
    if target.volume_name() != Some(expected_volume) {
        return Err(Error::BindingMismatch(format!(
            "pvc {:?} is not bound to the upgraded volume {:?}",
            migration.target_pvc_name, expected_volume
        )));
    }
    if target.storage_class() != Some(migration.storage_class.as_str()) {
        return Err(Error::BindingMismatch(format!(
            "pvc {:?} has storage class {:?} instead of {:?}",
            migration.target_pvc_name,
            target.storage_class().unwrap_or_default(),
            migration.storage_class
        )));
    }

    info!(
        "data migrated to pv {:?} bound to pvc {:?} with storage class {:?}",
        expected_volume, migration.target_pvc_name, migration.storage_class
    );
    Ok(())
}

/// The pod that converts the data: the prepare script runs as an init
/// container, then the image entrypoint performs pg_upgrade.
fn upgrade_pod(
    migration: &DataMigration,
    action: &UpgradeAction,
    pod_name: &str,
    tmp_claim_name: &str,
) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(pod_name.to_string()),
            namespace: Some(migration.namespace.clone()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            security_context: Some(task_pod_security_context()),
            init_containers: Some(vec![action.prepare.clone()]),
            containers: vec![action.upgrade.clone()],
            restart_policy: Some("Never".to_string()),
            volumes: Some(vec![
                claim_volume("old", &migration.source_pvc_name),
                claim_volume("new", tmp_claim_name),
                // the secret carries the scripts and shares the pod's name
                secret_volume("scripts", pod_name),
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// The pod that fixes ownership on the upgraded data, mounted from the
/// final target claim.
fn post_hook_pod(
    migration: &DataMigration,
    action: &UpgradeAction,
    pod_name: &str,
    scripts_secret_name: &str,
) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(pod_name.to_string()),
            namespace: Some(migration.namespace.clone()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            security_context: Some(task_pod_security_context()),
            containers: vec![action.post_hook.clone()],
            restart_policy: Some("Never".to_string()),
            volumes: Some(vec![
                claim_volume("new", &migration.target_pvc_name),
                secret_volume("scripts", scripts_secret_name),
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

// OnRootMismatch lets a ReadWriteOnce volume change hands between uids
// without a full recursive chown on every mount.
fn task_pod_security_context() -> PodSecurityContext {
    PodSecurityContext {
        run_as_non_root: Some(false),
        fs_group_change_policy: Some("OnRootMismatch".to_string()),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upgrade::UpgradeSettings;

    fn migration() -> DataMigration {
        DataMigration {
            namespace: "db".into(),
            source_pvc_name: "data-pg-0".into(),
            target_pvc_name: "data-pg-upgraded".into(),
            storage_class: "standard".into(),
            disk_size: "10G".into(),
        }
    }

    fn action() -> UpgradeAction {
        let settings = UpgradeSettings {
            current_version: "14".into(),
            target_version: "16".into(),
            ..Default::default()
        };
        UpgradeAction::build(&settings, "postgres", "")
    }

    #[test]
    fn upgrade_pod_wires_prepare_and_upgrade_containers() {
        let pod = upgrade_pod(&migration(), &action(), "pg-upgrade-data-pg-0", "tmp-data-pg-0");

        assert_eq!(pod.metadata.name.as_deref(), Some("pg-upgrade-data-pg-0"));
        assert_eq!(pod.metadata.namespace.as_deref(), Some("db"));

        let spec = pod.spec.unwrap();
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));

        let init = spec.init_containers.unwrap();
        assert_eq!(init.len(), 1);
        assert_eq!(init[0].name, "prepare");
        assert_eq!(spec.containers.len(), 1);
        assert_eq!(spec.containers[0].name, "upgrade-postgres");
    }

    #[test]
    fn upgrade_pod_mounts_source_temp_and_scripts() {
        let pod = upgrade_pod(&migration(), &action(), "pg-upgrade-data-pg-0", "tmp-data-pg-0");
        let volumes = pod.spec.unwrap().volumes.unwrap();

        assert_eq!(volumes.len(), 3);
        assert_eq!(
            volumes[0].persistent_volume_claim.as_ref().unwrap().claim_name,
            "data-pg-0"
        );
        assert_eq!(
            volumes[1].persistent_volume_claim.as_ref().unwrap().claim_name,
            "tmp-data-pg-0"
        );
        assert_eq!(
            volumes[2].secret.as_ref().unwrap().secret_name.as_deref(),
            Some("pg-upgrade-data-pg-0")
        );
    }

    #[test]
    fn task_pods_relax_the_root_policy_for_volume_handover() {
        let pod = upgrade_pod(&migration(), &action(), "pod", "tmp");
        let security = pod.spec.unwrap().security_context.unwrap();
        assert_eq!(security.run_as_non_root, Some(false));
        assert_eq!(security.fs_group_change_policy.as_deref(), Some("OnRootMismatch"));
    }

    #[test]
    fn post_hook_pod_mounts_the_target_claim_and_shared_secret() {
        let pod = post_hook_pod(
            &migration(),
            &action(),
            "post-upgrade-pg-upgrade-data-pg-0",
            "pg-upgrade-data-pg-0",
        );

        let spec = pod.spec.unwrap();
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        assert!(spec.init_containers.is_none());
        assert_eq!(spec.containers[0].name, "posthook");

        let volumes = spec.volumes.unwrap();
        assert_eq!(volumes.len(), 2);
        assert_eq!(
            volumes[0].persistent_volume_claim.as_ref().unwrap().claim_name,
            "data-pg-upgraded"
        );
        assert_eq!(
            volumes[1].secret.as_ref().unwrap().secret_name.as_deref(),
            Some("pg-upgrade-data-pg-0")
        );
    }
}
