use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::ResourceExt;

pub trait UpgraderResourceExt: ResourceExt {
    fn full_name(&self) -> String;
}

impl<K: ResourceExt> UpgraderResourceExt for K {
    fn full_name(&self) -> String {
        format!(
            "{}/{}",
            self.namespace().unwrap_or_else(|| "<>".into()),
            self.name_any()
        )
    }
}

/// Accessors for the claim fields the migration keeps reaching for.
pub trait ClaimExt {
    /// The bound volume name, if the claim has one and it is non-empty.
    fn volume_name(&self) -> Option<&str>;
    fn storage_class(&self) -> Option<&str>;
    /// The requested storage quantity.
    fn requested_storage(&self) -> Option<&Quantity>;
    fn phase(&self) -> Option<&str>;
}

impl ClaimExt for PersistentVolumeClaim {
    fn volume_name(&self) -> Option<&str> {
        self.spec
            .as_ref()?
            .volume_name
            .as_deref()
            .filter(|name| !name.is_empty())
    }

    fn storage_class(&self) -> Option<&str> {
        self.spec.as_ref()?.storage_class_name.as_deref()
    }

    fn requested_storage(&self) -> Option<&Quantity> {
        self.spec
            .as_ref()?
            .resources
            .as_ref()?
            .requests
            .as_ref()?
            .get("storage")
    }

    fn phase(&self) -> Option<&str> {
        self.status.as_ref()?.phase.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        PersistentVolumeClaimSpec, PersistentVolumeClaimStatus, ResourceRequirements,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn claim() -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some("data-pg-0".into()),
                namespace: Some("db".into()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                volume_name: Some("pv-123".into()),
                storage_class_name: Some("standard".into()),
                resources: Some(ResourceRequirements {
                    requests: Some(BTreeMap::from([(
                        "storage".to_string(),
                        Quantity("10G".into()),
                    )])),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            status: Some(PersistentVolumeClaimStatus {
                phase: Some("Bound".into()),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn full_name_joins_namespace_and_name() {
        assert_eq!(claim().full_name(), "db/data-pg-0");
    }

    #[test]
    fn claim_accessors() {
        let claim = claim();
        assert_eq!(claim.volume_name(), Some("pv-123"));
        assert_eq!(claim.storage_class(), Some("standard"));
        assert_eq!(claim.requested_storage().unwrap().0, "10G");
        assert_eq!(claim.phase(), Some("Bound"));
    }

    #[test]
    fn empty_volume_name_counts_as_unbound() {
        let mut claim = claim();
        claim.spec.as_mut().unwrap().volume_name = Some(String::new());
        assert_eq!(claim.volume_name(), None);
    }
}
