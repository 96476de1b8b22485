use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::{DeleteParams, PostParams};
use kube::{Api, Client};

use crate::error::{self, Error, Result};

/// An Opaque secret mapping file names to script payloads.
pub fn script_secret(namespace: &str, name: &str, files: &[(&str, &str)]) -> Secret {
    let data = files
        .iter()
        .map(|(file, contents)| (file.to_string(), ByteString(contents.as_bytes().to_vec())))
        .collect::<BTreeMap<_, _>>();

    Secret {
        type_: Some("Opaque".to_string()),
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    }
}

/// Creates the secret, replacing it when one with the same name exists.
pub async fn create_or_update(client: &Client, secret: &Secret) -> Result<()> {
    let namespace = secret.metadata.namespace.as_deref().unwrap_or_default();
    let name = secret.metadata.name.as_deref().unwrap_or_default();
    let secrets = Api::<Secret>::namespaced(client.clone(), namespace);

    match secrets.create(&PostParams::default(), secret).await {
        Ok(_) => Ok(()),
        Err(err) if error::already_exists(&err) => {
            secrets
                .replace(name, &PostParams::default(), secret)
                .await
                .map_err(Error::api(format!("unable to update secret {namespace}/{name}")))?;
            Ok(())
        }
        Err(err) => Err(Error::api(format!("unable to create secret {namespace}/{name}"))(err)),
    }
}

/// Deletes the secret; absence is not an error.
pub async fn delete(client: &Client, namespace: &str, name: &str) -> Result<()> {
    let secrets = Api::<Secret>::namespaced(client.clone(), namespace);
    match secrets.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(err) if error::not_found(&err) => Ok(()),
        Err(err) => Err(Error::api(format!("failed to delete secret {namespace}/{name}"))(err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_secret_carries_all_files() {
        let secret = script_secret(
            "db",
            "pg-upgrade-data-pg-0",
            &[("prepare.sh", "echo prepare"), ("posthook.sh", "echo post")],
        );

        assert_eq!(secret.type_.as_deref(), Some("Opaque"));
        assert_eq!(secret.metadata.name.as_deref(), Some("pg-upgrade-data-pg-0"));
        assert_eq!(secret.metadata.namespace.as_deref(), Some("db"));

        let data = secret.data.unwrap();
        assert_eq!(data.len(), 2);
        assert_eq!(data["prepare.sh"].0, b"echo prepare");
        assert_eq!(data["posthook.sh"].0, b"echo post");
    }
}
