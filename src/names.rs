use crate::config::MAX_NAME_LENGTH;

/// Returns at most the first `max_chars` code points of `name`.
///
/// Truncation counts characters, not bytes, so a multi-byte character is
/// never split in half.
pub fn truncate_name(name: &str, max_chars: usize) -> String {
    match name.char_indices().nth(max_chars) {
        Some((index, _)) => name[..index].to_string(),
        None => name.to_string(),
    }
}

/// Name of the temporary claim that receives the upgraded data.
pub fn tmp_claim_name(source_pvc: &str) -> String {
    truncate_name(&format!("tmp-{source_pvc}"), MAX_NAME_LENGTH)
}

/// Name of the pod that runs the upgrade, which doubles as the name of
/// the script secret mounted into it.
pub fn upgrade_pod_name(action: &str, source_pvc: &str) -> String {
    truncate_name(&format!("{action}-{source_pvc}"), MAX_NAME_LENGTH)
}

/// Name of the pod that runs the post-upgrade hook.
pub fn post_hook_pod_name(action: &str, source_pvc: &str) -> String {
    truncate_name(&format!("post-upgrade-{action}-{source_pvc}"), MAX_NAME_LENGTH)
}
