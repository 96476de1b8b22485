use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use kube::api::PostParams;
use kube::{Api, Client};
use tracing::info;

use crate::error::{Error, Result};

/// Writes replica counts through the scale subresource. The call returns
/// as soon as the new count is accepted; it does not wait for the
/// workload to actually reach it.
pub struct WorkloadScaler {
    client: Client,
    namespace: String,
}

impl WorkloadScaler {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
        }
    }

    pub async fn scale_statefulset(&self, name: &str, replicas: i32) -> Result<()> {
        let api = Api::<StatefulSet>::namespaced(self.client.clone(), &self.namespace);
        let mut scale = api
            .get_scale(name)
            .await
            .map_err(Error::api(format!("failed to get scale of statefulset {name:?}")))?;
        scale.spec.get_or_insert_with(Default::default).replicas = Some(replicas);
        api.replace_scale(
            name,
            &PostParams::default(),
            serialize_scale(&scale)?,
        )
        .await
        .map_err(Error::api(format!("failed to scale statefulset {name:?}")))?;
        info!("scaled statefulset {name} to {replicas} replicas");
        Ok(())
    }

    pub async fn scale_deployment(&self, name: &str, replicas: i32) -> Result<()> {
        let api = Api::<Deployment>::namespaced(self.client.clone(), &self.namespace);
        let mut scale = api
            .get_scale(name)
            .await
            .map_err(Error::api(format!("failed to get scale of deployment {name:?}")))?;
        scale.spec.get_or_insert_with(Default::default).replicas = Some(replicas);
        api.replace_scale(
            name,
            &PostParams::default(),
            serialize_scale(&scale)?,
        )
        .await
        .map_err(Error::api(format!("failed to scale deployment {name:?}")))?;
        info!("scaled deployment {name} to {replicas} replicas");
        Ok(())
    }
}

fn serialize_scale(scale: &k8s_openapi::api::autoscaling::v1::Scale) -> Result<Vec<u8>> {
    serde_json::to_vec(scale)
        .map_err(|err| Error::Validation(format!("failed to serialize scale: {err}")))
}
