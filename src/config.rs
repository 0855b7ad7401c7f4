//! Configuration for estate-etl.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (ESTATE_ETL_HOME, ESTATE_ETL_SOURCE)
//! 2. Config file (.estate-etl/config.yaml)
//! 3. Defaults (~/.estate-etl, local storage under the home directory)
//!
//! Config file discovery:
//! - Searches current directory and parents for .estate-etl/config.yaml
//! - `paths.home` is relative to the .estate-etl/ directory; other host paths
//!   are relative to the project root (the directory containing .estate-etl/)

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::core::graph::{NodeOverride, TaskGraph};
use crate::core::limits::RunLimits;
use crate::etl::load::WarehouseTarget;
use crate::storage::{LocalFsStorage, StorageClient, WebHdfsStorage};

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

const CONFIG_DIR: &str = ".estate-etl";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub source: Option<SourceConfig>,
    #[serde(default)]
    pub storage: Option<StorageConfig>,
    #[serde(default)]
    pub warehouse: Option<WarehouseConfig>,
    #[serde(default)]
    pub transform: Option<TransformConfig>,
    #[serde(default)]
    pub limits: Option<LimitsConfig>,
    /// Per-node retry and timeout overrides, keyed by node name
    #[serde(default)]
    pub nodes: HashMap<String, NodeOverride>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to .estate-etl/)
    pub home: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub path: Option<String>,
    pub delimiter: Option<char>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Local,
    WebHdfs,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Root directory for the local backend
    pub root: Option<String>,
    pub namenode_url: Option<String>,
    pub user: Option<String>,
    pub request_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WarehouseConfig {
    pub location: Option<String>,
    pub file_name: Option<String>,
    pub staging_root: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransformConfig {
    pub sale_id_base: Option<u64>,
    pub keep_cleaned_copy: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    pub max_rejection_ratio: Option<f64>,
    pub node_timeout_seconds: Option<u64>,
    pub run_timeout_seconds: Option<u64>,
}

/// How to reach warehouse storage
#[derive(Debug, Clone, PartialEq)]
pub enum StorageSettings {
    Local {
        root: PathBuf,
    },
    WebHdfs {
        namenode_url: String,
        user: String,
        request_timeout: Duration,
    },
}

#[derive(Debug, Clone)]
pub struct TransformSettings {
    pub sale_id_base: u64,
    pub keep_cleaned_copy: bool,
}

impl Default for TransformSettings {
    fn default() -> Self {
        Self {
            sale_id_base: 1,
            keep_cleaned_copy: true,
        }
    }
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute path to estate-etl home (run registry, locks)
    pub home: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    /// Default source file for runs
    pub source: Option<PathBuf>,
    pub delimiter: u8,
    pub storage: StorageSettings,
    pub warehouse: WarehouseTarget,
    pub transform: TransformSettings,
    pub limits: RunLimits,
    pub nodes: HashMap<String, NodeOverride>,
}

impl ResolvedConfig {
    /// Settings used when no config file exists
    pub fn defaults(home: PathBuf) -> Self {
        Self {
            storage: StorageSettings::Local {
                root: home.join("warehouse"),
            },
            home,
            config_file: None,
            source: None,
            delimiter: b',',
            warehouse: WarehouseTarget::default(),
            transform: TransformSettings::default(),
            limits: RunLimits::default(),
            nodes: HashMap::new(),
        }
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.home.join("runs")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.home.join("locks")
    }

    /// Build the storage client described by the settings
    pub fn storage_client(&self) -> Result<Arc<dyn StorageClient>> {
        match &self.storage {
            StorageSettings::Local { root } => Ok(Arc::new(LocalFsStorage::new(root.clone()))),
            StorageSettings::WebHdfs {
                namenode_url,
                user,
                request_timeout,
            } => {
                let client = WebHdfsStorage::new(namenode_url.clone(), user.clone(), *request_timeout)
                    .context("Failed to create WebHDFS client")?;
                Ok(Arc::new(client))
            }
        }
    }

    /// The standard graph with configured overrides applied
    pub fn task_graph(&self) -> TaskGraph {
        let mut graph = TaskGraph::etl();
        graph.apply_overrides(&self.nodes);
        graph
    }
}

/// Find config file by searching a directory and its parents
fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(CONFIG_DIR).join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's parent
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Build resolved settings from an optional config file plus environment
fn resolve(config_file: Option<PathBuf>) -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(CONFIG_DIR);

    let env_home = std::env::var("ESTATE_ETL_HOME").ok().map(PathBuf::from);
    let env_source = std::env::var("ESTATE_ETL_SOURCE").ok().map(PathBuf::from);

    let Some(config_path) = config_file else {
        let mut resolved = ResolvedConfig::defaults(env_home.unwrap_or(default_home));
        resolved.source = env_source;
        return Ok(resolved);
    };

    let config = load_config_file(&config_path)?;
    let config_dir = config_path.parent().unwrap_or(Path::new("."));
    let base_dir = config_dir.parent().unwrap_or(Path::new("."));

    let home = match (env_home, &config.paths.home) {
        (Some(home), _) => home,
        (None, Some(home)) => resolve_path(config_dir, home),
        (None, None) => default_home,
    };

    let mut resolved = ResolvedConfig::defaults(home);
    resolved.config_file = Some(config_path.clone());

    if let Some(source) = &config.source {
        resolved.source = source.path.as_deref().map(|p| resolve_path(base_dir, p));
        if let Some(delimiter) = source.delimiter {
            if !delimiter.is_ascii() {
                anyhow::bail!("Source delimiter must be a single ASCII character");
            }
            resolved.delimiter = delimiter as u8;
        }
    }
    if env_source.is_some() {
        resolved.source = env_source;
    }

    if let Some(storage) = &config.storage {
        resolved.storage = match storage.backend {
            StorageBackend::Local => StorageSettings::Local {
                root: storage
                    .root
                    .as_deref()
                    .map(|r| resolve_path(base_dir, r))
                    .unwrap_or_else(|| resolved.home.join("warehouse")),
            },
            StorageBackend::WebHdfs => StorageSettings::WebHdfs {
                namenode_url: storage
                    .namenode_url
                    .clone()
                    .context("storage.namenode_url is required for the webhdfs backend")?,
                user: storage.user.clone().unwrap_or_else(|| "root".to_string()),
                request_timeout: Duration::from_secs(storage.request_timeout_seconds.unwrap_or(30)),
            },
        };
    }

    if let Some(warehouse) = &config.warehouse {
        let target = &mut resolved.warehouse;
        if let Some(v) = &warehouse.location {
            target.location = v.clone();
        }
        if let Some(v) = &warehouse.file_name {
            target.file_name = v.clone();
        }
        if let Some(v) = &warehouse.staging_root {
            target.staging_root = v.clone();
        }
    }

    if let Some(transform) = &config.transform {
        if let Some(v) = transform.sale_id_base {
            resolved.transform.sale_id_base = v;
        }
        if let Some(v) = transform.keep_cleaned_copy {
            resolved.transform.keep_cleaned_copy = v;
        }
    }

    if let Some(limits) = &config.limits {
        resolved.limits.max_rejection_ratio = limits.max_rejection_ratio;
        if let Some(v) = limits.node_timeout_seconds {
            resolved.limits.node_timeout_seconds = v;
        }
        if let Some(v) = limits.run_timeout_seconds {
            resolved.limits.run_timeout_seconds = v;
        }
    }

    resolved.nodes = config.nodes;

    Ok(resolved)
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let cwd = std::env::current_dir().context("Failed to determine current directory")?;
    resolve(find_config_file(&cwd))
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}
