use k8s_openapi::api::core::v1::{Container, EnvVar, SecurityContext};

use crate::config::{
    POST_HOOK_SCRIPT_FILE, PREPARE_SCRIPT_FILE, SCRIPTS_MOUNT_PATH, UPGRADE_ACTION_NAME,
};
use crate::upgrade::UpgradeSettings;
use crate::volumes::{mount, sub_path_mount};

// Carried into the worker pods by the script secret, never by command line.
const PREPARE_SCRIPT: &str = include_str!("scripts/prepare.sh");
const POST_HOOK_SCRIPT: &str = include_str!("scripts/posthook.sh");

/// The three container specs plus the script payloads of one upgrade.
/// Immutable once built.
pub struct UpgradeAction {
    pub name: String,
    pub prepare_script: &'static str,
    pub post_hook_script: &'static str,
    pub prepare: Container,
    pub upgrade: Container,
    pub post_hook: Container,
}

impl UpgradeAction {
    /// Builds the action from a resolved session: `settings` must carry
    /// both versions, `user` and `init_db_args` are the effective values
    /// after discovery.
    pub fn build(settings: &UpgradeSettings, user: &str, init_db_args: &str) -> UpgradeAction {
        let image = settings.image();
        let sub_path = settings.sub_path();

        UpgradeAction {
            name: UPGRADE_ACTION_NAME.to_string(),
            prepare_script: PREPARE_SCRIPT,
            post_hook_script: POST_HOOK_SCRIPT,
            prepare: Container {
                name: "prepare".to_string(),
                image: Some(image.clone()),
                security_context: Some(SecurityContext {
                    run_as_non_root: Some(false),
                    ..Default::default()
                }),
                command: Some(vec!["/bin/sh".to_string()]),
                args: Some(vec![format!("/scripts/{PREPARE_SCRIPT_FILE}")]),
                volume_mounts: Some(vec![
                    sub_path_mount("old", "/old", sub_path),
                    sub_path_mount("new", "/new", sub_path),
                    mount("scripts", SCRIPTS_MOUNT_PATH, true),
                ]),
                ..Default::default()
            },
            upgrade: Container {
                name: "upgrade-postgres".to_string(),
                image: Some(image.clone()),
                security_context: Some(SecurityContext {
                    run_as_non_root: Some(false),
                    ..Default::default()
                }),
                env: Some(vec![
                    env_var("PGUSER", user),
                    env_var("POSTGRES_USER", user),
                    env_var(
                        "POSTGRES_INITDB_ARGS",
                        format!("-U {user} {init_db_args}").trim_end(),
                    ),
                ]),
                volume_mounts: Some(vec![
                    sub_path_mount(
                        "old",
                        &format!("/var/lib/postgresql/{}/data", settings.current_version),
                        sub_path,
                    ),
                    sub_path_mount(
                        "new",
                        &format!("/var/lib/postgresql/{}/data", settings.target_version),
                        sub_path,
                    ),
                ]),
                ..Default::default()
            },
            post_hook: Container {
                name: "posthook".to_string(),
                image: Some(image),
                security_context: Some(SecurityContext {
                    run_as_user: Some(0),
                    run_as_group: Some(0),
                    run_as_non_root: Some(false),
                    ..Default::default()
                }),
                command: Some(vec!["/bin/sh".to_string()]),
                args: Some(vec![format!("/scripts/{POST_HOOK_SCRIPT_FILE}")]),
                volume_mounts: Some(vec![
                    sub_path_mount("new", "/new", sub_path),
                    mount("scripts", SCRIPTS_MOUNT_PATH, true),
                ]),
                ..Default::default()
            },
        }
    }
}

fn env_var(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> UpgradeSettings {
        UpgradeSettings {
            current_version: "14".into(),
            target_version: "16".into(),
            ..Default::default()
        }
    }

    fn env_of<'a>(container: &'a Container, name: &str) -> &'a str {
        container
            .env
            .as_ref()
            .unwrap()
            .iter()
            .find(|env| env.name == name)
            .and_then(|env| env.value.as_deref())
            .unwrap()
    }

    #[test]
    fn all_containers_share_the_upgrade_image() {
        let action = UpgradeAction::build(&settings(), "postgres", "");
        for container in [&action.prepare, &action.upgrade, &action.post_hook] {
            assert_eq!(
                container.image.as_deref(),
                Some("tianon/postgres-upgrade:14-to-16")
            );
        }
    }

    #[test]
    fn prepare_mounts_old_new_and_scripts() {
        let action = UpgradeAction::build(&settings(), "postgres", "");
        let mounts = action.prepare.volume_mounts.unwrap();

        assert_eq!(mounts[0].name, "old");
        assert_eq!(mounts[0].mount_path, "/old");
        assert_eq!(mounts[0].sub_path.as_deref(), Some("data"));
        assert_eq!(mounts[1].name, "new");
        assert_eq!(mounts[1].mount_path, "/new");
        assert_eq!(mounts[2].name, "scripts");
        assert_eq!(mounts[2].mount_path, "/scripts/");
        assert_eq!(mounts[2].read_only, Some(true));

        assert_eq!(action.prepare.command, Some(vec!["/bin/sh".to_string()]));
        assert_eq!(action.prepare.args, Some(vec!["/scripts/prepare.sh".to_string()]));
    }

    #[test]
    fn upgrade_container_keeps_the_image_entrypoint() {
        let action = UpgradeAction::build(&settings(), "postgres", "");
        assert_eq!(action.upgrade.command, None);
        assert_eq!(action.upgrade.args, None);
    }

    #[test]
    fn upgrade_container_mounts_versioned_data_directories() {
        let action = UpgradeAction::build(&settings(), "postgres", "");
        let mounts = action.upgrade.volume_mounts.unwrap();
        assert_eq!(mounts[0].mount_path, "/var/lib/postgresql/14/data");
        assert_eq!(mounts[1].mount_path, "/var/lib/postgresql/16/data");
        assert_eq!(mounts[0].sub_path.as_deref(), Some("data"));
        assert_eq!(mounts[1].sub_path.as_deref(), Some("data"));
    }

    #[test]
    fn init_db_env_is_formatted_from_user_and_args() {
        let action = UpgradeAction::build(&settings(), "admin", "--data-checksums");
        assert_eq!(env_of(&action.upgrade, "PGUSER"), "admin");
        assert_eq!(env_of(&action.upgrade, "POSTGRES_USER"), "admin");
        assert_eq!(
            env_of(&action.upgrade, "POSTGRES_INITDB_ARGS"),
            "-U admin --data-checksums"
        );
    }

    #[test]
    fn init_db_env_has_no_trailing_space_without_extra_args() {
        let action = UpgradeAction::build(&settings(), "postgres", "");
        assert_eq!(env_of(&action.upgrade, "POSTGRES_INITDB_ARGS"), "-U postgres");
    }

    #[test]
    fn post_hook_runs_as_root() {
        let action = UpgradeAction::build(&settings(), "postgres", "");
        let security = action.post_hook.security_context.unwrap();
        assert_eq!(security.run_as_user, Some(0));
        assert_eq!(security.run_as_group, Some(0));
        assert_eq!(security.run_as_non_root, Some(false));
    }

    #[test]
    fn post_hook_only_sees_the_new_volume_and_scripts() {
        let action = UpgradeAction::build(&settings(), "postgres", "");
        let mounts = action.post_hook.volume_mounts.unwrap();
        assert_eq!(mounts.len(), 2);
        assert_eq!(mounts[0].name, "new");
        assert_eq!(mounts[1].name, "scripts");
    }

    #[test]
    fn custom_sub_path_is_honoured() {
        let mut settings = settings();
        settings.sub_path = "pgdata".into();
        let action = UpgradeAction::build(&settings, "postgres", "");
        let mounts = action.prepare.volume_mounts.unwrap();
        assert_eq!(mounts[0].sub_path.as_deref(), Some("pgdata"));
    }

    #[test]
    fn scripts_are_embedded() {
        let action = UpgradeAction::build(&settings(), "postgres", "");
        assert!(action.prepare_script.contains("PG_VERSION"));
        assert!(action.post_hook_script.contains("chown"));
    }
}
