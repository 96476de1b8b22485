use k8s_openapi::api::apps::v1::StatefulSet;
use kube::{Api, Client};
use tracing::info;

use crate::cancel::Cancellation;
use crate::client;
use crate::config::{DEFAULT_DATA_SUB_PATH, DEFAULT_INIT_DB_USER, DEFAULT_UPGRADE_IMAGE};
use crate::error::{self, Error, Result};
use crate::ext::ClaimExt;
use crate::scaler::WorkloadScaler;
use crate::upgrade::action::UpgradeAction;
use crate::upgrade::migration::{run_data_migration, DataMigration};
use crate::volumes::VolumeOps;

pub mod action;
pub mod discover;
pub mod migration;

/// Everything one upgrade invocation was asked to do. Empty strings mean
/// "use the default" or "discover it".
#[derive(Clone, Debug)]
pub struct UpgradeSettings {
    /// Image base; the tag is derived from the two versions.
    pub upgrade_image: String,
    pub init_db_args: String,
    pub disk_size: String,
    pub current_version: String,
    pub target_version: String,
    /// Postgres container in the StatefulSet; discovered by image when empty.
    pub container_name: String,
    pub init_db_user: String,
    pub source_pvc_name: String,
    pub target_pvc_name: String,
    pub sub_path: String,
}

impl Default for UpgradeSettings {
    fn default() -> Self {
        Self {
            upgrade_image: DEFAULT_UPGRADE_IMAGE.to_string(),
            init_db_args: String::new(),
            disk_size: String::new(),
            current_version: String::new(),
            target_version: String::new(),
            container_name: String::new(),
            init_db_user: String::new(),
            source_pvc_name: String::new(),
            target_pvc_name: String::new(),
            sub_path: String::new(),
        }
    }
}

impl UpgradeSettings {
    /// The full upgrade image coordinate, e.g.
    /// `tianon/postgres-upgrade:14-to-16`.
    pub fn image(&self) -> String {
        format!(
            "{}:{}-to-{}",
            self.upgrade_image, self.current_version, self.target_version
        )
    }

    pub fn user(&self) -> &str {
        if self.init_db_user.is_empty() {
            DEFAULT_INIT_DB_USER
        } else {
            &self.init_db_user
        }
    }

    pub fn sub_path(&self) -> &str {
        if self.sub_path.is_empty() {
            DEFAULT_DATA_SUB_PATH
        } else {
            &self.sub_path
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.target_version.is_empty() {
            return Err(Error::Validation("missing target postgres version".into()));
        }
        if !self.current_version.is_empty() && self.current_version == self.target_version {
            return Err(Error::Validation(format!(
                "current postgres version is equal to target postgres version: {:?}",
                self.current_version
            )));
        }
        Ok(())
    }
}

/// Drives a whole upgrade: discovery, drain, migration.
pub struct UpgradeRunner {
    namespace: String,
    client: Client,
    settings: UpgradeSettings,
}

impl UpgradeRunner {
    /// Builds a runner against the configured kubecontext. An empty
    /// namespace resolves to the kubecontext default.
    pub async fn new(namespace: &str, settings: UpgradeSettings) -> Result<Self> {
        settings.validate()?;
        let client = client::create_client().await?;
        Ok(Self::with_client(client, namespace, settings))
    }

    pub fn with_client(client: Client, namespace: &str, settings: UpgradeSettings) -> Self {
        let namespace = client::resolve_namespace(&client, namespace);
        Self {
            namespace,
            client,
            settings,
        }
    }

    /// Upgrades the database behind a StatefulSet: discovers the postgres
    /// container, its user, init-db arguments and current version, scales
    /// the workload to zero and migrates its data volume. Scaling back up
    /// is left to the operator once they have verified the result.
    pub async fn run_for_statefulset(&self, cancel: &Cancellation, name: &str) -> Result<()> {
        let statefulsets = Api::<StatefulSet>::namespaced(self.client.clone(), &self.namespace);
        let sts = statefulsets.get(name).await.map_err(|err| {
            if error::not_found(&err) {
                Error::NotFound(format!("statefulset {}/{}", self.namespace, name))
            } else {
                Error::api(format!("failed to get statefulset {name:?}"))(err)
            }
        })?;

        let container_name = (!self.settings.container_name.is_empty())
            .then_some(self.settings.container_name.as_str());
        let container = discover::find_postgres_container(&sts, container_name)?;
        let env = container.env.as_deref().unwrap_or_default();

        let mut user = discover::env_value(env, &["POSTGRES_USER", "POSTGRES_INITSCRIPTS_USERNAME"])
            .unwrap_or_default()
            .trim()
            .to_string();
        if user.is_empty() {
            user = self.settings.user().to_string();
        }

        let discovered_args = discover::env_value(env, &["POSTGRES_INITDB_ARGS"]).unwrap_or_default();
        let init_db_args = format!("{} {}", self.settings.init_db_args, discovered_args)
            .trim()
            .to_string();

        let source_pvc_name = if self.settings.source_pvc_name.is_empty() {
            discover::data_claim_name(&sts, &container)?
        } else {
            self.settings.source_pvc_name.clone()
        };

        let mut settings = self.settings.clone();
        if settings.current_version.is_empty() {
            let image = container.image.as_deref().unwrap_or_default();
            settings.current_version = discover::postgres_major_from_image(image)?;
            info!(
                "auto discovered current postgres version: {}",
                settings.current_version
            );
        }
        settings.validate()?;

        info!("---------");
        info!("postgres user: {user:?}");
        info!("initdb-args: {init_db_args:?}");
        info!("source pvc: {source_pvc_name:?}");
        info!("---------");

        info!("scaling down postgres statefulset...");
        WorkloadScaler::new(self.client.clone(), &self.namespace)
            .scale_statefulset(name, 0)
            .await?;

        self.migrate(cancel, &settings, &source_pvc_name, &user, &init_db_args)
            .await
    }

    /// Upgrades the database on a bare claim. No discovery and no
    /// scaling: the workload must already be drained and both versions
    /// given explicitly.
    pub async fn run_for_pvc(&self, cancel: &Cancellation) -> Result<()> {
        let settings = &self.settings;
        if settings.source_pvc_name.is_empty() {
            return Err(Error::Validation("source pvc name must not be empty".into()));
        }
        if settings.current_version.is_empty() {
            return Err(Error::Validation(
                "must provide the current postgres version".into(),
            ));
        }

        let user = settings.user().to_string();
        let init_db_args = settings.init_db_args.trim().to_string();

        info!("---------");
        info!("postgres user: {user:?}");
        info!("initdb-args: {init_db_args:?}");
        info!("---------");

        let source_pvc_name = settings.source_pvc_name.clone();
        self.migrate(cancel, settings, &source_pvc_name, &user, &init_db_args)
            .await
    }

    /// Shared tail of both entry points: resolve storage class and size
    /// from the source claim, then hand over to the state machine.
    async fn migrate(
        &self,
        cancel: &Cancellation,
        settings: &UpgradeSettings,
        source_pvc_name: &str,
        user: &str,
        init_db_args: &str,
    ) -> Result<()> {
        let target_pvc_name = if settings.target_pvc_name.is_empty() {
            source_pvc_name.to_string()
        } else {
            settings.target_pvc_name.clone()
        };

        let volumes = VolumeOps::new(self.client.clone());
        let source_pvc = volumes
            .claim_and_wait_for_volume(cancel, &self.namespace, source_pvc_name)
            .await?;
        let storage_class = source_pvc.storage_class().unwrap_or_default().to_string();

        // a bound claim knows its real size; the flag is the fallback
        let disk_size = source_pvc
            .requested_storage()
            .map(|quantity| quantity.0.clone())
            .unwrap_or_else(|| settings.disk_size.clone());
        if disk_size.is_empty() {
            return Err(Error::Validation("invalid disk size: must not be empty".into()));
        }

        info!("running pg_upgrade with init args: {:?}", format!("-U {user} {init_db_args}"));

        let action = UpgradeAction::build(settings, user, init_db_args);
        let migration = DataMigration {
            namespace: self.namespace.clone(),
            source_pvc_name: source_pvc_name.to_string(),
            target_pvc_name,
            storage_class,
            disk_size,
        };
        run_data_migration(&self.client, cancel, &migration, &action).await?;
        info!("ran postgres upgrade successfully");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_tag_follows_the_convention() {
        let settings = UpgradeSettings {
            current_version: "14".into(),
            target_version: "16".into(),
            ..Default::default()
        };
        assert_eq!(settings.image(), "tianon/postgres-upgrade:14-to-16");
    }

    #[test]
    fn custom_image_base_is_used() {
        let settings = UpgradeSettings {
            upgrade_image: "registry.local/pg-upgrade".into(),
            current_version: "13".into(),
            target_version: "15".into(),
            ..Default::default()
        };
        assert_eq!(settings.image(), "registry.local/pg-upgrade:13-to-15");
    }

    #[test]
    fn user_and_sub_path_fall_back_to_defaults() {
        let settings = UpgradeSettings::default();
        assert_eq!(settings.user(), "postgres");
        assert_eq!(settings.sub_path(), "data");

        let custom = UpgradeSettings {
            init_db_user: "admin".into(),
            sub_path: "pgdata".into(),
            ..Default::default()
        };
        assert_eq!(custom.user(), "admin");
        assert_eq!(custom.sub_path(), "pgdata");
    }

    #[test]
    fn validation_requires_a_target_version() {
        let settings = UpgradeSettings::default();
        assert!(matches!(settings.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn validation_rejects_equal_versions() {
        let settings = UpgradeSettings {
            current_version: "15".into(),
            target_version: "15".into(),
            ..Default::default()
        };
        assert!(matches!(settings.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn validation_accepts_a_proper_upgrade() {
        let settings = UpgradeSettings {
            current_version: "14".into(),
            target_version: "16".into(),
            ..Default::default()
        };
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn validation_allows_discovery_of_the_current_version() {
        let settings = UpgradeSettings {
            target_version: "16".into(),
            ..Default::default()
        };
        assert!(settings.validate().is_ok());
    }
}
