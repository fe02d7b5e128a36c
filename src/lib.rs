//! costlens 插件注册表
//!
//! 成本分析 CLI 的插件通过 RPC 在子进程中运行，
//! 这里负责发现、下载、校验并管理这些插件在本地磁盘上的可执行文件。

pub mod config;
pub mod logger;
pub mod plugin;

pub use config::{LoggingConfig, RegistryConfig, RegistryEntry};
pub use plugin::{
    InstallOptions, InstalledPlugin, PluginInstaller, PluginScanner, RegistryError,
    RemoveOptions, UpdateOptions,
};
