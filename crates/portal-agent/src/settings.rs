use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{PortalError, Result};

pub const DEFAULT_ENDPOINT: &str =
    "https://net-secondary.web.minecraft-services.net/api/v1.0/download/links";

const DEFAULT_OUTPUT_LIMIT_BYTES: usize = 16 * 1024 * 1024; // 16 MiB

/// Everything the manager needs to know about its environment. Components
/// only ever read these values; nothing inside them probes the host OS.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Metadata endpoint listing the download links.
    pub endpoint: String,
    /// Variant tag matched against `downloadType`.
    pub download_type: String,
    pub images_dir: PathBuf,
    pub server_dir: PathBuf,
    pub executable_name: String,
    /// Environment variable pointed at the server directory so the server
    /// finds its bundled shared libraries. `None` leaves the environment alone.
    pub loader_path_var: Option<String>,
    /// Upper bound for the cumulative output buffer; 0 keeps everything.
    pub output_limit_bytes: usize,
}

impl Default for Settings {
    fn default() -> Self {
        let root = default_data_root();
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            download_type: if cfg!(windows) {
                "serverBedrockWindows".to_string()
            } else {
                "serverBedrockLinux".to_string()
            },
            images_dir: root.join("images"),
            server_dir: root.join("server"),
            executable_name: if cfg!(windows) {
                "bedrock_server.exe".to_string()
            } else {
                "bedrock_server".to_string()
            },
            loader_path_var: if cfg!(windows) {
                None
            } else {
                Some("LD_LIBRARY_PATH".to_string())
            },
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
        }
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Root for everything the portal stores locally.
pub fn default_data_root() -> PathBuf {
    if let Some(raw) = env_string("PORTAL_DATA_ROOT") {
        return PathBuf::from(raw);
    }
    if cfg!(windows) {
        let base = env_string("LOCALAPPDATA").unwrap_or_else(|| ".".to_string());
        PathBuf::from(base).join("BedrockPortal")
    } else {
        PathBuf::from("/opt/mcportal")
    }
}

impl Settings {
    /// Defaults with `PORTAL_*` environment overrides applied.
    pub fn from_env() -> Result<Self> {
        let mut s = Self::default();
        s.apply_env()?;
        Ok(s)
    }

    /// Reads a TOML file; missing keys fall back to the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| PortalError::Config(format!("read {}: {e}", path.display())))?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let s: Settings = toml::from_str(raw).map_err(|e| PortalError::Config(e.to_string()))?;
        s.validate()?;
        Ok(s)
    }

    pub fn apply_env(&mut self) -> Result<()> {
        if let Some(v) = env_string("PORTAL_ENDPOINT") {
            self.endpoint = v;
        }
        if let Some(v) = env_string("PORTAL_DOWNLOAD_TYPE") {
            self.download_type = v;
        }
        if let Some(v) = env_string("PORTAL_IMAGES_DIR") {
            self.images_dir = PathBuf::from(v);
        }
        if let Some(v) = env_string("PORTAL_SERVER_DIR") {
            self.server_dir = PathBuf::from(v);
        }
        if let Some(v) = env_string("PORTAL_EXECUTABLE") {
            self.executable_name = v;
        }
        // Set-but-empty disables the loader variable.
        if let Ok(v) = std::env::var("PORTAL_LOADER_PATH_VAR") {
            let v = v.trim();
            self.loader_path_var = (!v.is_empty()).then(|| v.to_string());
        }
        if let Some(v) = env_string("PORTAL_OUTPUT_LIMIT_BYTES") {
            self.output_limit_bytes = v.parse::<usize>().map_err(|_| {
                PortalError::Config(format!("PORTAL_OUTPUT_LIMIT_BYTES must be an integer: {v}"))
            })?;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        let url = reqwest::Url::parse(&self.endpoint)
            .map_err(|e| PortalError::Config(format!("endpoint {:?}: {e}", self.endpoint)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(PortalError::Config(format!(
                "endpoint must be http(s): {}",
                self.endpoint
            )));
        }
        if self.download_type.trim().is_empty() {
            return Err(PortalError::Config("download_type must be non-empty".to_string()));
        }
        let exe = Path::new(&self.executable_name);
        if self.executable_name.trim().is_empty() || exe.components().count() != 1 {
            return Err(PortalError::Config(format!(
                "executable_name must be a bare file name: {:?}",
                self.executable_name
            )));
        }
        Ok(())
    }

    pub fn executable_path(&self) -> PathBuf {
        self.server_dir.join(&self.executable_name)
    }

    pub fn properties_path(&self) -> PathBuf {
        self.server_dir.join("server.properties")
    }

    pub fn output_limit(&self) -> Option<usize> {
        (self.output_limit_bytes > 0).then_some(self.output_limit_bytes)
    }
}
