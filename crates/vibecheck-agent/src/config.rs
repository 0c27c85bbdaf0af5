use std::path::{Path, PathBuf};

use anyhow::Context;

/// Default relay endpoint.
pub const DEFAULT_SERVER_URL: &str = "wss://vibecheck.nestoz.co/ws/agent";

/// Immutable per-process configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub api_key: String,
    pub work_dir: PathBuf,
    pub server_url: String,
    pub new_session: bool,
}

impl AgentConfig {
    /// Resolve CLI arguments into a validated configuration.
    ///
    /// The working directory must exist; it is canonicalized so every later
    /// path comparison works on one absolute form.
    pub fn resolve(
        api_key: String,
        dir: &str,
        server_url: String,
        new_session: bool,
    ) -> anyhow::Result<Self> {
        let work_dir = Path::new(dir)
            .canonicalize()
            .with_context(|| format!("working directory does not exist: {dir}"))?;
        if !work_dir.is_dir() {
            anyhow::bail!("not a directory: {}", work_dir.display());
        }
        Ok(Self {
            api_key,
            work_dir,
            server_url,
            new_session,
        })
    }

    /// Relay URL with the API key attached.
    pub fn connect_url(&self) -> String {
        format!(
            "{}?key={}",
            self.server_url,
            urlencoding::encode(&self.api_key)
        )
    }

    pub fn work_dir_str(&self) -> String {
        self.work_dir.to_string_lossy().to_string()
    }
}

/// `~/.vibecheck`, created on demand.
pub fn session_dir() -> anyhow::Result<PathBuf> {
    let home = dirs_next::home_dir().context("cannot determine home directory")?;
    let dir = home.join(".vibecheck");
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("cannot create {}", dir.display()))?;
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_rejects_missing_dir() {
        let err = AgentConfig::resolve(
            "k".into(),
            "/nonexistent/vibecheck-test-dir",
            DEFAULT_SERVER_URL.into(),
            false,
        );
        assert!(err.is_err());
    }

    #[test]
    fn connect_url_encodes_key() {
        let dir = std::env::temp_dir();
        let config = AgentConfig::resolve(
            "a b&c".into(),
            dir.to_str().unwrap(),
            "wss://relay.example/ws/agent".into(),
            false,
        )
        .unwrap();
        assert_eq!(
            config.connect_url(),
            "wss://relay.example/ws/agent?key=a%20b%26c"
        );
    }
}
