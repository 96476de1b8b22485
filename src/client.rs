use kube::{Client, Config};

use crate::error::{Error, Result};

/// Creates a Kubernetes client from the configured kubecontext, falling
/// back to the in-cluster service account environment.
pub async fn create_client() -> Result<Client> {
    if let Ok(client) = Client::try_default().await {
        return Ok(client);
    }

    let config = Config::incluster_env()
        .map_err(|err| Error::Validation(format!("failed to load kubernetes configuration: {err}")))?;
    Client::try_from(config).map_err(Error::api("failed to create kubernetes client"))
}

/// The namespace to operate in: the explicit choice when given, the
/// kubecontext default otherwise.
pub fn resolve_namespace(client: &Client, namespace: &str) -> String {
    if namespace.is_empty() {
        client.default_namespace().to_string()
    } else {
        namespace.to_string()
    }
}
