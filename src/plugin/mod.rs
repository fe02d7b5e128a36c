//! 插件注册表模块
//!
//! 管理磁盘上的插件可执行文件，支持：
//! - 扫描已安装插件并选出每个插件的最新版本
//! - 从 release 托管服务解析、下载、解压和校验插件
//! - 跨进程的插件级锁，持有者崩溃后可回收
//! - 更新、删除和清理旧版本

pub mod archive;
pub mod error;
pub mod installer;
pub mod lock;
pub mod metadata;
pub mod platform;
pub mod release_client;
pub mod scanner;
pub mod types;
pub mod version;

pub use archive::{
    extract_archive, platform_checker, sanitize_path, validate_binary, validate_binary_with,
    ArchiveExtractor, ArchiveFormat, ExecutabilityChecker, ExtensionChecker, ModeBitsChecker,
    MAX_ENTRY_SIZE,
};
pub use error::{RegistryError, Result};
pub use installer::PluginInstaller;
pub use lock::{LockGuard, LockManager, ProcessChecker, SystemProcessChecker};
pub use metadata::{merge_metadata, read_metadata, write_metadata, REGION_KEY, REPOSITORY_KEY};
pub use platform::Platform;
pub use release_client::{
    find_compatible_asset, ByteStream, HttpResponse, HttpTransport, ReleaseClient,
    ReqwestTransport,
};
pub use scanner::{
    AnyExecutableMatcher, BinaryMatcher, BinaryResolver, ExactNameMatcher, LatestPlugin,
    LegacyNameMatcher, MatchContext, PluginScanner, PrefixedNameMatcher, ScanReport, ScanWarning,
};
pub use types::{
    CleanupResult, FnProgressCallback, InstallOptions, InstallProgress, InstallResult,
    InstallStage, InstalledPlugin, NoopProgressCallback, PluginSpecifier, ProgressCallback,
    Release, ReleaseAsset, RemoveOptions, RemoveResult, RepositoryRef, UpdateOptions,
    UpdateResult,
};
pub use version::{
    compare_versions, is_valid_version, parse_version, parse_version_constraint,
    satisfies_constraint, VersionConstraint,
};
