use anyhow::{Context, Result};
use directories::ProjectDirs;
use std::path::{Path, PathBuf};

pub struct Config {
    pub data_dir: PathBuf,
    /// Local store used by every command.
    pub db_path: PathBuf,
    /// Dirty marker shared by every fitstat process on this machine.
    pub marker_path: PathBuf,
    /// Server-side table store behind `fitstat serve`.
    pub remote_db_path: PathBuf,
    pub remote_url: Option<String>,
    pub user_override: Option<String>,
    api_key_env: Option<String>,
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl Config {
    pub fn load() -> Result<Self> {
        let data_dir = match non_empty_env("FITSTAT_DATA_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => ProjectDirs::from("", "", "fitstat")
                .context("Could not determine home directory")?
                .data_dir()
                .to_path_buf(),
        };
        Self::in_dir(&data_dir)
    }

    fn in_dir(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;

        Ok(Config {
            data_dir: data_dir.to_path_buf(),
            db_path: data_dir.join("fitstat.db"),
            marker_path: data_dir.join("pending_sync"),
            remote_db_path: data_dir.join("remote.db"),
            remote_url: non_empty_env("FITSTAT_REMOTE_URL"),
            user_override: non_empty_env("FITSTAT_USER"),
            api_key_env: non_empty_env("FITSTAT_API_KEY"),
        })
    }

    fn api_key_path(&self) -> PathBuf {
        self.data_dir.join("api_key")
    }

    /// Key sent to the remote: `FITSTAT_API_KEY`, else the key `serve`
    /// generated in this data directory.
    pub fn client_api_key(&self) -> Result<Option<String>> {
        if let Some(key) = &self.api_key_env {
            return Ok(Some(key.clone()));
        }
        let path = self.api_key_path();
        if !path.exists() {
            return Ok(None);
        }
        let key = std::fs::read_to_string(&path).context("Failed to read API key file")?;
        Ok(Some(key.trim().to_string()).filter(|k| !k.is_empty()))
    }

    /// Load the API key from disk, or generate a new one.
    ///
    /// Returns `(key, newly_created)` where `newly_created` is true when a
    /// fresh key was just generated (first run).
    pub fn load_or_create_api_key(&self) -> Result<(String, bool)> {
        use rand::Rng;
        use std::fmt::Write;

        if let Some(key) = self.client_api_key()? {
            return Ok((key, false));
        }

        let path = self.api_key_path();
        let bytes: [u8; 32] = rand::rng().random();
        let key = bytes
            .iter()
            .fold(String::with_capacity(64), |mut acc: String, b| {
                let _ = write!(acc, "{b:02x}");
                acc
            });
        std::fs::write(&path, &key).context("Failed to write API key file")?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
                .context("Failed to set API key file permissions")?;
        }
        eprintln!("Generated new API key: {key}");
        eprintln!("Clients use it via FITSTAT_API_KEY={key}");
        Ok((key, true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dir: &Path) -> Config {
        let mut config = Config::in_dir(dir).unwrap();
        config.api_key_env = None;
        config
    }

    #[test]
    fn test_paths_live_in_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir.path().join("nested"));
        assert!(config.data_dir.is_dir());
        assert_eq!(config.db_path.parent(), Some(config.data_dir.as_path()));
        assert_ne!(config.db_path, config.remote_db_path);
    }

    #[test]
    fn test_api_key_generated_once() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        assert_eq!(config.client_api_key().unwrap(), None);

        let (key, created) = config.load_or_create_api_key().unwrap();
        assert!(created);
        assert_eq!(key.len(), 64);

        let (again, created) = config.load_or_create_api_key().unwrap();
        assert!(!created);
        assert_eq!(again, key);
        assert_eq!(config.client_api_key().unwrap(), Some(key));
    }

    #[test]
    fn test_env_key_wins() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.api_key_env = Some("from-env".to_string());
        assert_eq!(config.client_api_key().unwrap().as_deref(), Some("from-env"));
        assert_eq!(config.load_or_create_api_key().unwrap().0, "from-env");
    }
}
