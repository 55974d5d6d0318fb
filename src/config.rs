use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{GinError, Result};

/// Environment variable overriding the configuration root
pub const CONFIG_DIR_ENV: &str = "GIN_CONFIG_DIR";

/// Name of the configuration file, both in the config root and in a repository root
pub const CONFIG_FILE_NAME: &str = "config.yml";

/// Main configuration structure for the GIN client
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct Config {
    /// Paths to the external binaries
    #[serde(default)]
    pub bin: BinConfig,

    /// Account service (web) host
    #[serde(default)]
    pub gin: GinServerConfig,

    /// Git (ssh) remote host
    #[serde(default)]
    pub git: GitServerConfig,

    /// Annex filters
    #[serde(default)]
    pub annex: AnnexConfig,
}

/// External binary locations
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct BinConfig {
    #[serde(default = "default_git_bin")]
    pub git: String,

    #[serde(default = "default_gitannex_bin")]
    pub gitannex: String,

    #[serde(default = "default_ssh_bin")]
    pub ssh: String,
}

/// Account service address
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct GinServerConfig {
    #[serde(default = "default_gin_address")]
    pub address: String,

    #[serde(default = "default_gin_port")]
    pub port: u16,
}

/// Git remote address and identity
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct GitServerConfig {
    #[serde(default = "default_git_address")]
    pub address: String,

    #[serde(default = "default_git_port")]
    pub port: u16,

    #[serde(default = "default_git_user")]
    pub user: String,

    /// known_hosts line for the git server
    #[serde(default = "default_git_hostkey")]
    pub hostkey: String,
}

/// Rules deciding which files go to the annex
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct AnnexConfig {
    /// Glob patterns that are never annexed
    #[serde(default)]
    pub exclude: Vec<String>,

    /// Minimum size for annexed files
    #[serde(default = "default_annex_minsize")]
    pub minsize: String, // "10M", "500kB", "1GiB"
}

/// Repository-local overlay; only the annex section may be overridden there
#[derive(Debug, Deserialize, Default)]
struct RepoOverlay {
    #[serde(default)]
    annex: Option<AnnexOverlay>,
}

#[derive(Debug, Deserialize, Default)]
struct AnnexOverlay {
    exclude: Option<Vec<String>>,
    minsize: Option<String>,
}

// Default value functions
fn default_git_bin() -> String {
    "git".to_string()
}
fn default_gitannex_bin() -> String {
    "git-annex".to_string()
}
fn default_ssh_bin() -> String {
    "ssh".to_string()
}
fn default_gin_address() -> String {
    "https://web.gin.g-node.org".to_string()
}
fn default_gin_port() -> u16 {
    443
}
fn default_git_address() -> String {
    "gin.g-node.org".to_string()
}
fn default_git_port() -> u16 {
    22
}
fn default_git_user() -> String {
    "git".to_string()
}
fn default_git_hostkey() -> String {
    "gin.g-node.org,141.84.41.216 ecdsa-sha2-nistp256 AAAAE2VjZHNhLXNoYTItbmlzdHAyNTYAAAAIbmlzdHAyNTYAAABBBE5IBgKP3nUryEFaACwY4N3jlqDx8Qw1xAxU2Xpt5V0p9RNefNnedVmnIBV6lA3n+9kT1OSbyqA/+SgsQ57nHo0=".to_string()
}
fn default_annex_minsize() -> String {
    "10M".to_string()
}

// Default implementations
impl Default for BinConfig {
    fn default() -> Self {
        Self {
            git: default_git_bin(),
            gitannex: default_gitannex_bin(),
            ssh: default_ssh_bin(),
        }
    }
}

impl Default for GinServerConfig {
    fn default() -> Self {
        Self {
            address: default_gin_address(),
            port: default_gin_port(),
        }
    }
}

impl Default for GitServerConfig {
    fn default() -> Self {
        Self {
            address: default_git_address(),
            port: default_git_port(),
            user: default_git_user(),
            hostkey: default_git_hostkey(),
        }
    }
}

impl Default for AnnexConfig {
    fn default() -> Self {
        Self {
            exclude: Vec::new(),
            minsize: default_annex_minsize(),
        }
    }
}

impl Config {
    /// Load the user configuration from the config root, then overlay the
    /// annex section from the repository containing `workdir` (if any).
    ///
    /// Missing files are not an error; defaults apply.
    pub fn load_merged(config_root: Option<&Path>, workdir: &Path) -> Result<Self> {
        let mut config = match config_root.map(|root| root.join(CONFIG_FILE_NAME)) {
            Some(path) if path.is_file() => Self::load(&path)?,
            _ => Self::default(),
        };

        if let Some(repo_root) = find_repo_root(workdir) {
            let local = repo_root.join(CONFIG_FILE_NAME);
            if local.is_file() {
                config.merge_repo_overlay(&local)?;
            }
        }

        config.expand_paths()?;
        debug!("Configuration values: {:?}", config);
        Ok(config)
    }

    /// Load configuration from a specific file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| GinError::io(format!("Failed to read config file {:?}", path), e))?;

        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| GinError::Config(format!("Failed to parse config file {:?}: {}", path, e)))?;

        debug!("Found config file {:?}", path);
        Ok(config)
    }

    fn merge_repo_overlay(&mut self, path: &Path) -> Result<()> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| GinError::io(format!("Failed to read config file {:?}", path), e))?;
        let overlay: RepoOverlay = serde_yaml::from_str(&content)
            .map_err(|e| GinError::Config(format!("Failed to parse config file {:?}: {}", path, e)))?;

        if let Some(annex) = overlay.annex {
            if let Some(exclude) = annex.exclude {
                self.annex.exclude = exclude;
            }
            if let Some(minsize) = annex.minsize {
                self.annex.minsize = minsize;
            }
        }

        debug!("Found repository config file {:?}", path);
        Ok(())
    }

    /// Expand environment variables and `~` in binary paths
    pub fn expand_paths(&mut self) -> Result<()> {
        for bin in [&mut self.bin.git, &mut self.bin.gitannex, &mut self.bin.ssh] {
            *bin = shellexpand::full(bin.as_str())
                .map_err(|e| GinError::Config(format!("Failed to expand binary path: {}", e)))?
                .into_owned();
        }
        Ok(())
    }
}

/// Resolve the configuration root directory.
///
/// `GIN_CONFIG_DIR` wins when set; an empty value means the root cannot be
/// resolved. Otherwise the platform config directory is used.
pub fn config_root() -> Option<PathBuf> {
    match std::env::var_os(CONFIG_DIR_ENV) {
        Some(dir) if dir.is_empty() => None,
        Some(dir) => Some(PathBuf::from(dir)),
        None => dirs::config_dir().map(|dir| dir.join("g-node").join("gin")),
    }
}

/// Walk upwards from `start` until a directory containing `.git` is found.
pub fn find_repo_root(start: &Path) -> Option<PathBuf> {
    let start = std::path::absolute(start).ok()?;
    let mut current = start.as_path();
    loop {
        if current.join(".git").exists() {
            return Some(current.to_path_buf());
        }
        current = current.parent()?;
    }
}

/// Parse a human size like `10M`, `500kB` or `1GiB` into bytes.
///
/// Plain SI suffixes are decimal, `*iB` suffixes are binary.
pub fn parse_size(input: &str) -> Result<u64> {
    let trimmed = input.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);

    let value: u64 = number
        .parse()
        .map_err(|_| GinError::Config(format!("invalid size '{}'", input)))?;

    let multiplier: u64 = match unit.trim() {
        "" | "b" | "B" => 1,
        "k" | "K" | "kB" | "KB" => 1_000,
        "M" | "MB" => 1_000_000,
        "G" | "GB" => 1_000_000_000,
        "T" | "TB" => 1_000_000_000_000,
        "KiB" => 1 << 10,
        "MiB" => 1 << 20,
        "GiB" => 1 << 30,
        "TiB" => 1 << 40,
        other => {
            return Err(GinError::Config(format!(
                "invalid size unit '{}' in '{}'",
                other, input
            )))
        }
    };

    value
        .checked_mul(multiplier)
        .ok_or_else(|| GinError::Config(format!("size '{}' is too large", input)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::prelude::*;
    use serial_test::serial;
    use std::env;

    #[test]
    fn test_config_default_values() {
        let config = Config::default();

        assert_eq!(config.bin.git, "git");
        assert_eq!(config.bin.gitannex, "git-annex");
        assert_eq!(config.bin.ssh, "ssh");
        assert_eq!(config.gin.address, "https://web.gin.g-node.org");
        assert_eq!(config.gin.port, 443);
        assert_eq!(config.git.address, "gin.g-node.org");
        assert_eq!(config.git.port, 22);
        assert_eq!(config.git.user, "git");
        assert!(config.git.hostkey.starts_with("gin.g-node.org"));
        assert!(config.annex.exclude.is_empty());
        assert_eq!(parse_size(&config.annex.minsize).unwrap(), 10_000_000);
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("0").unwrap(), 0);
        assert_eq!(parse_size("42").unwrap(), 42);
        assert_eq!(parse_size("42B").unwrap(), 42);
        assert_eq!(parse_size("10M").unwrap(), 10_000_000);
        assert_eq!(parse_size("500kB").unwrap(), 500_000);
        assert_eq!(parse_size("2 GB").unwrap(), 2_000_000_000);
        assert_eq!(parse_size("1MiB").unwrap(), 1_048_576);
        assert_eq!(parse_size("1GiB").unwrap(), 1024 * 1024 * 1024);

        assert!(parse_size("").is_err());
        assert!(parse_size("M").is_err());
        assert!(parse_size("10 parsecs").is_err());
        assert!(parse_size("99999999999999999999T").is_err());
    }

    #[test]
    fn test_yaml_parsing_partial() {
        let yaml_content = r#"
gin:
  address: "https://gin.example.org"
git:
  port: 2222
annex:
  exclude:
    - "*.md"
    - "docs/*"
  minsize: "50MiB"
"#;

        let config: Config = serde_yaml::from_str(yaml_content).expect("Failed to parse YAML");

        assert_eq!(config.gin.address, "https://gin.example.org");
        assert_eq!(config.gin.port, 443);
        assert_eq!(config.git.port, 2222);
        assert_eq!(config.git.address, "gin.g-node.org");
        assert_eq!(config.bin.git, "git");
        assert_eq!(config.annex.exclude, vec!["*.md", "docs/*"]);
        assert_eq!(parse_size(&config.annex.minsize).unwrap(), 50 * 1024 * 1024);
    }

    #[test]
    fn test_config_serialized_and_loaded() {
        let temp = assert_fs::TempDir::new().unwrap();
        let path = temp.child(CONFIG_FILE_NAME);

        let mut config = Config::default();
        config.git.user = "gogs".to_string();
        config.annex.exclude = vec!["*.txt".to_string()];
        path.write_str(&serde_yaml::to_string(&config).unwrap()).unwrap();

        let loaded = Config::load(path.path()).expect("Failed to load config");
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_config_load_nonexistent_file() {
        let result = Config::load(Path::new("/nonexistent/path/config.yml"));
        assert!(matches!(result, Err(GinError::Io { .. })));
    }

    #[test]
    fn test_config_load_invalid_yaml() {
        let temp = assert_fs::TempDir::new().unwrap();
        let path = temp.child(CONFIG_FILE_NAME);
        path.write_str("gin: [unclosed").unwrap();

        let result = Config::load(path.path());
        assert!(matches!(result, Err(GinError::Config(_))));
    }

    #[test]
    fn test_find_repo_root_walks_upwards() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("repo/.git").create_dir_all().unwrap();
        temp.child("repo/data/raw").create_dir_all().unwrap();

        let root = find_repo_root(temp.child("repo/data/raw").path()).unwrap();
        assert_eq!(root, temp.child("repo").path());

        let root = find_repo_root(temp.child("repo").path()).unwrap();
        assert_eq!(root, temp.child("repo").path());
    }

    #[test]
    fn test_find_repo_root_not_found() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("plain/dir").create_dir_all().unwrap();

        // Only meaningful when the temp dir itself is not inside a repository
        if find_repo_root(temp.path()).is_none() {
            assert!(find_repo_root(temp.child("plain/dir").path()).is_none());
        }
    }

    #[test]
    fn test_load_merged_applies_repo_annex_overlay_only() {
        let temp = assert_fs::TempDir::new().unwrap();
        let conf_root = temp.child("conf");
        conf_root
            .child(CONFIG_FILE_NAME)
            .write_str("git:\n  user: gogs\nannex:\n  minsize: 1M\n  exclude: ['*.md']\n")
            .unwrap();

        let repo = temp.child("repo");
        repo.child(".git").create_dir_all().unwrap();
        repo.child(CONFIG_FILE_NAME)
            .write_str("git:\n  user: ignored\nannex:\n  minsize: 5M\n")
            .unwrap();

        let config = Config::load_merged(Some(conf_root.path()), repo.path()).unwrap();
        assert_eq!(config.git.user, "gogs");
        assert_eq!(config.annex.minsize, "5M");
        assert_eq!(config.annex.exclude, vec!["*.md"]);
    }

    #[test]
    fn test_load_merged_without_files_uses_defaults() {
        let temp = assert_fs::TempDir::new().unwrap();
        let config = Config::load_merged(None, temp.path()).unwrap();
        assert_eq!(config.bin, BinConfig::default());
        assert_eq!(config.gin, GinServerConfig::default());
    }

    #[test]
    #[serial]
    fn test_expand_paths() {
        env::set_var("TEST_GIN_BIN_HOME", "/opt/gin");

        let mut config = Config::default();
        config.bin.gitannex = "${TEST_GIN_BIN_HOME}/bin/git-annex".to_string();
        config.expand_paths().expect("Failed to expand paths");
        assert_eq!(config.bin.gitannex, "/opt/gin/bin/git-annex");

        env::remove_var("TEST_GIN_BIN_HOME");
    }

    #[test]
    #[serial]
    fn test_config_root_override() {
        let original = env::var_os(CONFIG_DIR_ENV);

        env::set_var(CONFIG_DIR_ENV, "/tmp/gin-conf");
        assert_eq!(config_root(), Some(PathBuf::from("/tmp/gin-conf")));

        env::set_var(CONFIG_DIR_ENV, "");
        assert_eq!(config_root(), None);

        env::remove_var(CONFIG_DIR_ENV);
        if let Some(root) = config_root() {
            assert!(root.ends_with("g-node/gin"));
        }

        if let Some(value) = original {
            env::set_var(CONFIG_DIR_ENV, value);
        }
    }
}
