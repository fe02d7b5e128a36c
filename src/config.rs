//! 配置模块
//!
//! 插件注册表配置从 YAML 文件加载，环境变量可以覆盖部分字段

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::plugin::error::{RegistryError, Result};
use crate::plugin::types::RepositoryRef;

/// 插件目录环境变量
pub const ENV_PLUGIN_DIR: &str = "COSTLENS_PLUGIN_DIR";
/// 旧版二进制命名开关环境变量
pub const ENV_LEGACY_PLUGIN_NAMES: &str = "COSTLENS_LEGACY_PLUGIN_NAMES";
/// API token 环境变量
pub const ENV_GITHUB_TOKEN: &str = "GITHUB_TOKEN";
/// 日志级别环境变量
pub const ENV_LOG_LEVEL: &str = "COSTLENS_LOG_LEVEL";

const DEFAULT_API_BASE_URL: &str = "https://api.github.com";

fn default_api_base_url() -> String {
    DEFAULT_API_BASE_URL.to_string()
}

fn default_user_agent() -> String {
    format!("costlens/{}", env!("CARGO_PKG_VERSION"))
}

fn default_request_timeout_secs() -> u64 {
    300
}

fn default_log_level() -> String {
    "info".to_string()
}

/// 配置目录: ~/.costlens
fn base_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".costlens")
}

/// 默认插件目录: ~/.costlens/plugins
pub fn default_plugin_root() -> PathBuf {
    base_dir().join("plugins")
}

/// 默认配置文件路径: ~/.costlens/config.yaml
pub fn default_config_path() -> PathBuf {
    base_dir().join("config.yaml")
}

/// 日志配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// 日志级别或过滤表达式
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// 注册表索引条目
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    /// 来源仓库 `owner/repo`
    pub repository: String,
    /// 资产文件名前缀，默认为仓库名
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_prefix: Option<String>,
}

impl RegistryEntry {
    /// 解析来源仓库
    pub fn repository_ref(&self) -> Result<RepositoryRef> {
        RepositoryRef::parse(&self.repository)
    }
}

/// 插件注册表配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// 插件根目录
    #[serde(default = "default_plugin_root")]
    pub plugin_root: PathBuf,
    /// 是否识别旧版二进制命名
    #[serde(default)]
    pub legacy_binary_names: bool,
    /// release API 地址
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    /// HTTP User-Agent
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// HTTP 请求超时 (秒)
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// API token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github_token: Option<String>,
    /// 插件名到来源仓库的索引
    #[serde(default)]
    pub registry: IndexMap<String, RegistryEntry>,
    /// 日志配置
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            plugin_root: default_plugin_root(),
            legacy_binary_names: false,
            api_base_url: default_api_base_url(),
            user_agent: default_user_agent(),
            request_timeout_secs: default_request_timeout_secs(),
            github_token: None,
            registry: IndexMap::new(),
            logging: LoggingConfig::default(),
        }
    }
}

impl RegistryConfig {
    /// 从 YAML 文件加载，文件不存在时返回默认配置
    pub fn load(path: &Path) -> Result<Self> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!("配置文件不存在，使用默认配置: {}", path.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&content)
            .map_err(|e| RegistryError::Config(format!("{}: {}", path.display(), e)))
    }

    /// 保存为 YAML 文件
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content =
            serde_yaml::to_string(self).map_err(|e| RegistryError::Config(e.to_string()))?;
        fs::write(path, content)?;
        Ok(())
    }

    /// 应用进程环境变量
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// 从给定的查找函数应用覆盖
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(dir) = lookup(ENV_PLUGIN_DIR) {
            self.plugin_root = PathBuf::from(dir.trim());
        }
        if let Some(value) = lookup(ENV_LEGACY_PLUGIN_NAMES) {
            self.legacy_binary_names = is_truthy(&value);
        }
        if let Some(token) = lookup(ENV_GITHUB_TOKEN) {
            self.github_token = Some(token.trim().to_string());
        }
        if let Some(level) = lookup(ENV_LOG_LEVEL) {
            self.logging.level = level.trim().to_string();
        }
    }

    /// 按插件名查找注册表索引
    pub fn registry_entry(&self, name: &str) -> Option<&RegistryEntry> {
        self.registry.get(name)
    }
}

/// `1/true/yes/on` (不区分大小写) 视为开启
pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let config = RegistryConfig::load(&dir.path().join("missing.yaml")).unwrap();
        assert_eq!(config, RegistryConfig::default());
        assert_eq!(config.api_base_url, "https://api.github.com");
        assert!(config.plugin_root.ends_with(".costlens/plugins"));
    }

    #[test]
    fn test_load_partial_yaml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(
            &path,
            r#"
plugin_root: /opt/costlens/plugins
legacy_binary_names: true
registry:
  aws:
    repository: acme/costlens-plugin-aws
  kubecost:
    repository: acme/kc
    asset_prefix: kubecost
logging:
  level: debug
"#,
        )
        .unwrap();

        let config = RegistryConfig::load(&path).unwrap();
        assert_eq!(config.plugin_root, PathBuf::from("/opt/costlens/plugins"));
        assert!(config.legacy_binary_names);
        assert_eq!(config.request_timeout_secs, 300);
        assert_eq!(config.logging.level, "debug");

        let names: Vec<&String> = config.registry.keys().collect();
        assert_eq!(names, vec!["aws", "kubecost"]);
        let entry = config.registry_entry("kubecost").unwrap();
        assert_eq!(entry.asset_prefix.as_deref(), Some("kubecost"));
        assert_eq!(entry.repository_ref().unwrap().repo, "kc");
    }

    #[test]
    fn test_invalid_yaml_is_config_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "registry: [not, a, map").unwrap();
        assert!(matches!(
            RegistryConfig::load(&path),
            Err(RegistryError::Config(_))
        ));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.yaml");
        let mut config = RegistryConfig::default();
        config.registry.insert(
            "aws".to_string(),
            RegistryEntry {
                repository: "acme/costlens-plugin-aws".to_string(),
                asset_prefix: None,
            },
        );
        config.save(&path).unwrap();
        assert_eq!(RegistryConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_PLUGIN_DIR, "/tmp/plugins"),
            (ENV_LEGACY_PLUGIN_NAMES, "Yes"),
            (ENV_GITHUB_TOKEN, "ghp_secret"),
            (ENV_LOG_LEVEL, "warn"),
        ]);
        let mut config = RegistryConfig::default();
        config.apply_overrides_from(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.plugin_root, PathBuf::from("/tmp/plugins"));
        assert!(config.legacy_binary_names);
        assert_eq!(config.github_token.as_deref(), Some("ghp_secret"));
        assert_eq!(config.logging.level, "warn");
    }

    #[test]
    fn test_empty_env_values_are_ignored() {
        let mut config = RegistryConfig {
            legacy_binary_names: true,
            ..RegistryConfig::default()
        };
        config.apply_overrides_from(|_| Some("  ".to_string()));
        assert!(config.legacy_binary_names);
        assert!(config.github_token.is_none());
    }

    #[test]
    fn test_truthy_values() {
        for value in ["1", "true", "TRUE", "yes", "On", " on "] {
            assert!(is_truthy(value), "{}", value);
        }
        for value in ["0", "false", "no", "off", "", "enabled"] {
            assert!(!is_truthy(value), "{}", value);
        }
    }
}
