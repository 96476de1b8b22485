use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{
    ObjectReference, PersistentVolume, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimVolumeSource, ResourceRequirements, SecretVolumeSource, Volume,
    VolumeMount,
};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{DeleteParams, PostParams};
use kube::{Api, Client};
use tracing::info;

use crate::cancel::Cancellation;
use crate::config::{
    ACCESS_MODE_RWO, CLAIM_BIND_POLL, CLAIM_DELETE_POLL, JOB_POLL, RECLAIM_SETTLE,
};
use crate::error::{self, Error, Result};
use crate::ext::{ClaimExt, UpgraderResourceExt};

/// Low-level PersistentVolume / PersistentVolumeClaim operations.
///
/// Only ReadWriteOnce claims are supported. None of these operations own
/// the objects they touch; callers sequence them so that no volume with
/// live data can fall into the reclaim controller's hands.
pub struct VolumeOps {
    client: Client,
}

impl VolumeOps {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn claims(&self, namespace: &str) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn volumes(&self) -> Api<PersistentVolume> {
        Api::all(self.client.clone())
    }

    /// Fetches a claim and polls until it is bound to a volume.
    ///
    /// Fails with NotFound when the claim does not exist on the first
    /// fetch; a deadline interrupts the wait within one poll period.
    pub async fn claim_and_wait_for_volume(
        &self,
        cancel: &Cancellation,
        namespace: &str,
        name: &str,
    ) -> Result<PersistentVolumeClaim> {
        let claims = self.claims(namespace);
        let mut claim = claims.get(name).await.map_err(|err| {
            if error::not_found(&err) {
                Error::NotFound(format!("pvc {namespace}/{name}"))
            } else {
                Error::api(format!("failed to get pvc {namespace}/{name}"))(err)
            }
        })?;

        loop {
            if claim.volume_name().is_some() {
                return Ok(claim);
            }
            info!("waiting for pvc {} to be bound to a volume...", claim.full_name());
            cancel.sleep(CLAIM_BIND_POLL).await?;
            claim = claims
                .get(name)
                .await
                .map_err(Error::api(format!("failed to get pvc {namespace}/{name}")))?;
        }
    }

    /// Fails with NotFound unless the storage class exists.
    pub async fn validate_storage_class(&self, name: &str) -> Result<()> {
        let storage_classes = Api::<StorageClass>::all(self.client.clone());
        match storage_classes
            .get_opt(name)
            .await
            .map_err(Error::api(format!("failed to check storage class {name:?}")))?
        {
            Some(_) => Ok(()),
            None => Err(Error::NotFound(format!("storage class {name:?}"))),
        }
    }

    /// Sets the reclaim policy of the volume backing `claim`.
    ///
    /// Idempotent: when the policy already matches, no write is issued.
    pub async fn set_reclaim_policy(
        &self,
        claim: &PersistentVolumeClaim,
        policy: &str,
    ) -> Result<()> {
        let volume_name = bound_volume_name(claim)?;
        let volumes = self.volumes();
        let mut volume = volumes
            .get(volume_name)
            .await
            .map_err(Error::api(format!("failed to get pv {volume_name:?}")))?;

        let spec = volume.spec.get_or_insert_with(Default::default);
        if spec.persistent_volume_reclaim_policy.as_deref() == Some(policy) {
            info!("pv {volume_name} already has {policy} as the reclaim policy");
            return Ok(());
        }

        info!("updating reclaim policy of pv {volume_name} to {policy}...");
        spec.persistent_volume_reclaim_policy = Some(policy.to_string());
        volumes
            .replace(volume_name, &PostParams::default(), &volume)
            .await
            .map_err(Error::api(format!(
                "failed to update reclaim policy of pv {volume_name:?}"
            )))?;

        // give the api some time to catch up
        tokio::time::sleep(RECLAIM_SETTLE).await;
        Ok(())
    }

    /// Clears the claim reference of the volume backing `claim`, so a
    /// claim with a different name can bind it later.
    pub async fn clear_claim_ref(&self, claim: &PersistentVolumeClaim) -> Result<()> {
        let volume_name = bound_volume_name(claim)?;
        let volumes = self.volumes();
        let mut volume = volumes
            .get(volume_name)
            .await
            .map_err(Error::api(format!("failed to get pv {volume_name:?}")))?;

        volume.spec.get_or_insert_with(Default::default).claim_ref = None;
        volumes
            .replace(volume_name, &PostParams::default(), &volume)
            .await
            .map_err(Error::api(format!(
                "failed to remove claim ref of pv {volume_name:?}"
            )))?;
        info!("removed the claim ref of pv {volume_name}");
        Ok(())
    }

    /// Points the volume at a claim that does not exist yet. With no UID
    /// in the reference the binding is deterministic once the claim is
    /// created.
    pub async fn set_claim_ref(
        &self,
        volume_name: &str,
        namespace: &str,
        claim_name: &str,
    ) -> Result<()> {
        let volumes = self.volumes();
        let mut volume = volumes
            .get(volume_name)
            .await
            .map_err(Error::api(format!("failed to get pv {volume_name:?}")))?;

        volume.spec.get_or_insert_with(Default::default).claim_ref = Some(ObjectReference {
            namespace: Some(namespace.to_string()),
            name: Some(claim_name.to_string()),
            ..Default::default()
        });
        volumes
            .replace(volume_name, &PostParams::default(), &volume)
            .await
            .map_err(Error::api(format!(
                "failed to update claim ref of pv {volume_name:?}"
            )))?;
        info!("set the claim ref of pv {volume_name} to {namespace}/{claim_name}");
        Ok(())
    }

    /// Creates a ReadWriteOnce claim. AlreadyExists surfaces as an API
    /// error the caller can treat as recoverable.
    pub async fn create_claim(
        &self,
        namespace: &str,
        name: &str,
        storage_class: &str,
        size: &Quantity,
    ) -> Result<()> {
        self.claims(namespace)
            .create(
                &PostParams::default(),
                &new_claim(namespace, name, storage_class, size),
            )
            .await
            .map_err(Error::api(format!("failed to create pvc {namespace}/{name}")))?;
        info!("created pvc {namespace}/{name}");
        Ok(())
    }

    pub async fn delete_claim(&self, namespace: &str, name: &str) -> Result<()> {
        self.claims(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map_err(Error::api(format!("failed to delete pvc {namespace}/{name}")))?;
        Ok(())
    }

    /// Polls until the claim is gone from the API.
    pub async fn wait_for_claim_deletion(
        &self,
        cancel: &Cancellation,
        namespace: &str,
        name: &str,
    ) -> Result<()> {
        let claims = self.claims(namespace);
        loop {
            match claims
                .get_opt(name)
                .await
                .map_err(Error::api(format!("failed to check pvc {namespace}/{name}")))?
            {
                None => {
                    info!("pvc {namespace}/{name} is deleted");
                    return Ok(());
                }
                Some(_) => info!("pvc {namespace}/{name} is still being deleted..."),
            }
            cancel.sleep(CLAIM_DELETE_POLL).await?;
        }
    }

    /// Polls a job until it reports success or failure.
    pub async fn wait_for_job(
        &self,
        cancel: &Cancellation,
        namespace: &str,
        name: &str,
    ) -> Result<()> {
        let jobs = Api::<Job>::namespaced(self.client.clone(), namespace);
        loop {
            let job = jobs
                .get(name)
                .await
                .map_err(Error::api(format!("failed to get job {namespace}/{name}")))?;
            let status = job.status.unwrap_or_default();
            if status.active.unwrap_or(0) > 0 {
                info!("job {name} still running");
            }
            if status.failed.unwrap_or(0) > 0 {
                return Err(Error::JobFailed(name.to_string()));
            }
            if status.succeeded.unwrap_or(0) > 0 {
                info!("job {name} succeeded");
                return Ok(());
            }
            cancel.sleep(JOB_POLL).await?;
        }
    }
}

fn bound_volume_name(claim: &PersistentVolumeClaim) -> Result<&str> {
    claim
        .volume_name()
        .ok_or_else(|| Error::Validation(format!("pvc {} has no bound volume", claim.full_name())))
}

/// A ReadWriteOnce claim spec with the given storage class and size.
pub fn new_claim(
    namespace: &str,
    name: &str,
    storage_class: &str,
    size: &Quantity,
) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            storage_class_name: Some(storage_class.to_string()),
            access_modes: Some(vec![ACCESS_MODE_RWO.to_string()]),
            resources: Some(ResourceRequirements {
                requests: Some(BTreeMap::from([("storage".to_string(), size.clone())])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn claim_volume(name: &str, claim_name: &str) -> Volume {
    Volume {
        name: name.to_string(),
        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
            claim_name: claim_name.to_string(),
            read_only: Some(false),
        }),
        ..Default::default()
    }
}

pub fn secret_volume(name: &str, secret_name: &str) -> Volume {
    Volume {
        name: name.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret_name.to_string()),
            optional: Some(false),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn mount(name: &str, path: &str, read_only: bool) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        read_only: Some(read_only),
        ..Default::default()
    }
}

pub fn sub_path_mount(name: &str, path: &str, sub_path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        sub_path: Some(sub_path.to_string()),
        ..Default::default()
    }
}
