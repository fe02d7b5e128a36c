//! 插件注册表错误类型
//!
//! 定义安装、扫描、锁、解压和 release 查询过程中的全部错误

use std::path::PathBuf;
use thiserror::Error;

/// 注册表操作结果
pub type Result<T> = std::result::Result<T, RegistryError>;

/// 注册表错误类型
#[derive(Error, Debug)]
pub enum RegistryError {
    /// 插件标识无效
    #[error("无效的插件标识 '{input}': {reason}")]
    InvalidSpecifier { input: String, reason: String },

    /// 锁已被其他进程持有
    #[error("插件 {name} 正在被另一个操作占用 ({}), 请稍后重试", .path.display())]
    LockHeld { name: String, path: PathBuf },

    /// 安装目录中未找到可执行文件
    #[error("未找到插件可执行文件: {}", .0.display())]
    BinaryNotFound(PathBuf),

    /// release 不存在 (404)
    #[error("release 不存在: {0}")]
    ReleaseNotFound(String),

    /// 请求被限流或拒绝 (403)
    #[error("请求被限流或拒绝: {0}")]
    RateLimited(String),

    /// 其他非 2xx 响应
    #[error("请求失败: HTTP {status} - {context}")]
    HttpStatus { status: u16, context: String },

    /// 网络错误
    #[error("网络错误: {0}")]
    Network(String),

    /// 没有兼容当前平台的资产
    #[error("{repository} 没有兼容平台 {platform} 的资产")]
    NoCompatibleAsset { repository: String, platform: String },

    /// 不支持的压缩格式
    #[error("不支持的压缩格式: {}", .0.display())]
    UnsupportedArchive(PathBuf),

    /// 压缩包条目路径越界
    #[error("压缩包条目路径越界: {0}")]
    PathTraversal(String),

    /// 压缩包条目超过大小限制
    #[error("压缩包条目 {name} 超过大小限制: {size} > {limit} bytes")]
    EntryTooLarge { name: String, size: u64, limit: u64 },

    /// 压缩包损坏
    #[error("解压失败: {0}")]
    ExtractFailed(String),

    /// 文件不可执行
    #[error("文件不是有效的可执行文件: {} ({reason})", .path.display())]
    NotExecutable { path: PathBuf, reason: String },

    /// 元数据文件不存在
    #[error("元数据文件不存在: {}", .0.display())]
    MetadataNotFound(PathBuf),

    /// 元数据文件解析失败
    #[error("元数据文件解析失败 {}: {source}", .path.display())]
    MetadataParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// 版本号无效
    #[error("无效的版本号: {0}")]
    InvalidVersion(String),

    /// 版本约束无效
    #[error("无效的版本约束: {0}")]
    InvalidConstraint(String),

    /// 插件已安装
    #[error("插件 {name} {version} 已安装 (使用 force 重新安装)")]
    AlreadyInstalled { name: String, version: String },

    /// 插件不存在
    #[error("插件不存在: {0}")]
    PluginNotFound(String),

    /// 操作已取消
    #[error("操作已取消")]
    Cancelled,

    /// 配置错误
    #[error("配置错误: {0}")]
    Config(String),

    /// IO 错误
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    /// JSON 解析错误
    #[error("JSON 解析错误: {0}")]
    Json(#[from] serde_json::Error),
}

impl RegistryError {
    /// 构造无效标识错误
    pub fn invalid_specifier(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidSpecifier {
            input: input.into(),
            reason: reason.into(),
        }
    }

    /// 是否为 "不存在" 类错误
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::ReleaseNotFound(_) | Self::PluginNotFound(_) | Self::MetadataNotFound(_)
        )
    }

    /// 是否为锁冲突，调用方可以稍后重试
    pub fn is_lock_held(&self) -> bool {
        matches!(self, Self::LockHeld { .. })
    }

    /// 是否为安全校验失败
    ///
    /// 这些错误总是终止当前操作，不能降级为警告
    pub fn is_security_violation(&self) -> bool {
        matches!(
            self,
            Self::PathTraversal(_) | Self::EntryTooLarge { .. } | Self::NotExecutable { .. }
        )
    }
}
