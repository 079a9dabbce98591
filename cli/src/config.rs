use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub struct Config {
    pub db_path: PathBuf,
    pub data_dir: PathBuf,
}

/// One bearer key and the account it authenticates as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKey {
    pub key: String,
    pub owner_id: String,
}

impl Config {
    /// `db_override` (from `--db` / `LARDER_DB`) replaces the default
    /// database location; keys always live in the data directory.
    pub fn load(db_override: Option<PathBuf>) -> Result<Self> {
        let proj_dirs =
            ProjectDirs::from("", "", "larder").context("Could not determine home directory")?;

        let data_dir = proj_dirs.data_dir().to_path_buf();
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;

        let db_path = db_override.unwrap_or_else(|| data_dir.join("larder.db"));

        Ok(Config { db_path, data_dir })
    }

    /// Load `api_keys.json`, or create it with one key for owner `local`.
    ///
    /// Returns `(keys, newly_created)`.
    pub fn load_or_create_api_keys(&self) -> Result<(Vec<ApiKey>, bool)> {
        let path = self.data_dir.join("api_keys.json");

        if path.exists() {
            let raw = std::fs::read_to_string(&path).context("Failed to read API key file")?;
            let keys: Vec<ApiKey> = serde_json::from_str(&raw)
                .with_context(|| format!("Malformed API key file: {}", path.display()))?;
            if !keys.is_empty() {
                return Ok((keys, false));
            }
        }

        let keys = vec![ApiKey {
            key: generate_key(),
            owner_id: "local".to_string(),
        }];
        std::fs::write(&path, serde_json::to_string_pretty(&keys)?)
            .context("Failed to write API key file")?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
                .context("Failed to set API key file permissions")?;
        }
        Ok((keys, true))
    }
}

/// 32 random bytes, hex encoded.
fn generate_key() -> String {
    use rand::Rng;
    use std::fmt::Write;

    let bytes: [u8; 32] = rand::rng().random();
    bytes
        .iter()
        .fold(String::with_capacity(64), |mut acc: String, b| {
            let _ = write!(acc, "{b:02x}");
            acc
        })
}
