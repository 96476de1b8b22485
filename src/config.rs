use std::time::Duration;

pub const DEFAULT_INIT_DB_USER: &str = "postgres";
pub const DEFAULT_DATA_SUB_PATH: &str = "data";
pub const DEFAULT_UPGRADE_IMAGE: &str = "tianon/postgres-upgrade";
pub const UPGRADE_ACTION_NAME: &str = "pg-upgrade";

pub const PREPARE_SCRIPT_FILE: &str = "prepare.sh";
pub const POST_HOOK_SCRIPT_FILE: &str = "posthook.sh";
pub const SCRIPTS_MOUNT_PATH: &str = "/scripts/";

// Kubernetes object names cap out at 63 characters
pub const MAX_NAME_LENGTH: usize = 63;

pub const RECLAIM_RETAIN: &str = "Retain";
pub const ACCESS_MODE_RWO: &str = "ReadWriteOnce";
pub const CLAIM_PHASE_BOUND: &str = "Bound";

// Poll periods
pub const CLAIM_BIND_POLL: Duration = Duration::from_secs(5);
pub const CLAIM_DELETE_POLL: Duration = Duration::from_secs(5);
pub const POD_START_POLL: Duration = Duration::from_secs(1);
pub const POD_COMPLETE_POLL: Duration = Duration::from_secs(10);
pub const JOB_POLL: Duration = Duration::from_secs(10);

// Pause after a PersistentVolume write to let the API settle
pub const RECLAIM_SETTLE: Duration = Duration::from_secs(1);
