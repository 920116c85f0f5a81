use olsync_core::SyncConfig;
use std::path::PathBuf;
use url::Url;

/// Daemon configuration assembled from the command line and environment.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Base URL of the remote service (`https://www.overleaf.com`)
    pub server: Url,
    /// Project to sync
    pub project_id: String,
    /// Session cookie sent with every request (`name=value; ...`)
    pub cookie: String,
    /// CSRF token for mutating HTTP calls
    pub csrf_token: Option<String>,
    /// Local directory mirrored to the project
    pub sync_root: PathBuf,
    /// Main document name whose build artefacts are ignored
    pub main_doc: String,
    pub sync: SyncConfig,
}

impl DaemonConfig {
    pub fn new(
        server: &str,
        project_id: String,
        cookie: String,
        csrf_token: Option<String>,
        sync_root: &str,
    ) -> Result<Self, ConfigError> {
        let server = Url::parse(server).map_err(|e| ConfigError::InvalidServer {
            url: server.to_string(),
            reason: e.to_string(),
        })?;
        if !matches!(server.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidServer {
                url: server.to_string(),
                reason: "scheme must be http or https".to_string(),
            });
        }
        if project_id.trim().is_empty() {
            return Err(ConfigError::MissingProject);
        }
        if cookie.trim().is_empty() {
            return Err(ConfigError::MissingCookie);
        }

        Ok(Self {
            server,
            project_id,
            cookie,
            csrf_token,
            sync_root: expand_tilde(sync_root),
            main_doc: "main.tex".to_string(),
            sync: SyncConfig::default(),
        })
    }

    pub fn with_main_doc(mut self, main_doc: impl Into<String>) -> Self {
        self.main_doc = main_doc.into();
        self
    }

    /// `server` joined with `path`, keeping any path prefix the server URL has.
    pub fn endpoint(&self, path: &str) -> Result<Url, ConfigError> {
        let mut base = self.server.clone();
        if !base.path().ends_with('/') {
            let with_slash = format!("{}/", base.path());
            base.set_path(&with_slash);
        }
        base.join(path.trim_start_matches('/'))
            .map_err(|e| ConfigError::InvalidServer {
                url: self.server.to_string(),
                reason: e.to_string(),
            })
    }
}

/// Expand ~ or ~/ prefix to the user's home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from("~"))
    } else if let Some(rest) = path.strip_prefix("~/") {
        dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(path))
    } else {
        PathBuf::from(path)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid server URL {url}: {reason}")]
    InvalidServer { url: String, reason: String },

    #[error("No project id given (--project or OLSYNC_PROJECT)")]
    MissingProject,

    #[error("No session cookie given (--cookie or OLSYNC_COOKIE)")]
    MissingCookie,
}
