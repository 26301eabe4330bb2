//! Guest identity: a locally persisted user id for clients without an account.

use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use chrono::Utc;
use uuid::Uuid;

pub const DEFAULT_ID_FILE: &str = "~/.comfy_user_id";

/// `user_<base36 epoch millis>_<6 hex chars>`
pub fn generate_user_id() -> String {
    let millis = Utc::now().timestamp_millis().max(0) as u64;
    let suffix: String = Uuid::new_v4().simple().to_string().chars().take(6).collect();
    format!("user_{}_{}", to_base36(millis), suffix)
}

pub fn to_base36(mut n: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

/// Read the id stored at `path` (`~` and `$VARS` expanded), creating it on first use.
pub fn load_or_create(path: &str) -> anyhow::Result<String> {
    let expanded = shellexpand::full(path)
        .with_context(|| format!("cannot expand identity path {}", path))?;
    let file = PathBuf::from(expanded.as_ref());

    if let Ok(existing) = fs::read_to_string(&file) {
        let existing = existing.trim();
        if !existing.is_empty() {
            return Ok(existing.to_string());
        }
    }

    let id = generate_user_id();
    if let Some(parent) = file.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    // An unwritable file still yields a usable id for this run.
    if let Err(e) = fs::write(&file, &id) {
        tracing::warn!(path = %file.display(), error = %e, "Could not persist guest id");
    } else {
        tracing::info!(user_id = %id, path = %file.display(), "Created guest id");
    }
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("comfy-cli-test-{}", Uuid::new_v4()))
            .join("user_id")
    }

    #[test]
    fn test_base36() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
        assert_eq!(to_base36(1_700_000_000_000), "loyw3v28");
    }

    #[test]
    fn test_generated_id_shape() {
        let id = generate_user_id();
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "user");
        assert!(parts[1].chars().all(|c| c.is_ascii_alphanumeric()));
        assert_eq!(parts[2].len(), 6);
        assert!(parts[2].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_id_is_created_once_and_reused() {
        let path = scratch_path();
        let path_str = path.to_string_lossy().to_string();

        let first = load_or_create(&path_str).unwrap();
        let second = load_or_create(&path_str).unwrap();
        assert_eq!(first, second);
        assert_eq!(fs::read_to_string(&path).unwrap(), first);

        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_blank_file_is_replaced() {
        let path = scratch_path();
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "  \n").unwrap();

        let id = load_or_create(&path.to_string_lossy()).unwrap();
        assert!(id.starts_with("user_"));

        let _ = fs::remove_dir_all(path.parent().unwrap());
    }
}
