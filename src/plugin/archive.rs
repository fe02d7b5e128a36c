//! 插件压缩包解压与可执行文件校验
//!
//! 解压时对每个条目：
//! - 校验路径不会越出目标目录 (zip-slip)，绝对路径按相对路径处理
//! - 拒绝超过大小上限的条目，防止解压炸弹
//! - 目录以安全权限创建，文件写入后恢复原始权限位
//!
//! 解压失败时目标目录处于未定义状态，调用方必须删除它

use std::fs::{self, File, Metadata};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::error::{RegistryError, Result};

/// 单个条目的默认大小上限 (500 MiB)
pub const MAX_ENTRY_SIZE: u64 = 500 * 1024 * 1024;

/// 压缩包格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    /// tar.gz 格式
    TarGz,
    /// ZIP 格式
    Zip,
}

impl ArchiveFormat {
    /// 从文件名检测格式
    pub fn from_file_name(file_name: &str) -> Option<Self> {
        let lower = file_name.to_lowercase();
        if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            Some(ArchiveFormat::TarGz)
        } else if lower.ends_with(".zip") {
            Some(ArchiveFormat::Zip)
        } else {
            None
        }
    }

    /// 从路径检测格式
    pub fn from_path(path: &Path) -> Option<Self> {
        path.file_name()
            .and_then(|n| n.to_str())
            .and_then(Self::from_file_name)
    }
}

/// 把条目名拼接到目标目录下并确认结果仍在目标目录内
///
/// 绝对路径去掉根后按相对路径处理；任何越出目标目录的 `..` 都会被拒绝
pub fn sanitize_path(dest_dir: &Path, entry_name: &str) -> Result<PathBuf> {
    let unified = entry_name.replace('\\', "/");
    let mut parts: Vec<&std::ffi::OsStr> = Vec::new();

    for component in Path::new(&unified).components() {
        match component {
            Component::Prefix(_) | Component::RootDir | Component::CurDir => {}
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(RegistryError::PathTraversal(entry_name.to_string()));
                }
            }
            Component::Normal(part) => parts.push(part),
        }
    }

    let mut resolved = dest_dir.to_path_buf();
    for part in parts {
        resolved.push(part);
    }

    if !resolved.starts_with(dest_dir) {
        return Err(RegistryError::PathTraversal(entry_name.to_string()));
    }
    Ok(resolved)
}

/// 压缩包解压器
#[derive(Debug, Clone)]
pub struct ArchiveExtractor {
    max_entry_size: u64,
}

impl Default for ArchiveExtractor {
    fn default() -> Self {
        Self {
            max_entry_size: MAX_ENTRY_SIZE,
        }
    }
}

impl ArchiveExtractor {
    /// 使用默认大小上限创建
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置单个条目的大小上限
    pub fn with_max_entry_size(mut self, max_entry_size: u64) -> Self {
        self.max_entry_size = max_entry_size;
        self
    }

    /// 解压压缩包到目标目录
    pub fn extract(&self, archive_path: &Path, dest_dir: &Path) -> Result<()> {
        self.extract_with_cancel(archive_path, dest_dir, &CancellationToken::new())
    }

    /// 解压压缩包，每个条目之前检查取消信号
    pub fn extract_with_cancel(
        &self,
        archive_path: &Path,
        dest_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let format = ArchiveFormat::from_path(archive_path)
            .ok_or_else(|| RegistryError::UnsupportedArchive(archive_path.to_path_buf()))?;

        create_dir_safe(dest_dir)?;
        debug!(
            "解压 {} -> {} ({:?})",
            archive_path.display(),
            dest_dir.display(),
            format
        );

        match format {
            ArchiveFormat::TarGz => self.extract_targz(archive_path, dest_dir, cancel),
            ArchiveFormat::Zip => self.extract_zip(archive_path, dest_dir, cancel),
        }
    }

    /// 解压 tar.gz 文件
    fn extract_targz(&self, path: &Path, dest: &Path, cancel: &CancellationToken) -> Result<()> {
        let file = File::open(path)?;
        let gz = flate2::read::GzDecoder::new(file);
        let mut archive = tar::Archive::new(gz);

        let entries = archive
            .entries()
            .map_err(|e| RegistryError::ExtractFailed(format!("无法读取 tar.gz: {}", e)))?;

        for entry in entries {
            if cancel.is_cancelled() {
                return Err(RegistryError::Cancelled);
            }
            let mut entry = entry
                .map_err(|e| RegistryError::ExtractFailed(format!("tar.gz 条目读取失败: {}", e)))?;

            let name = entry
                .path()
                .map_err(|e| RegistryError::ExtractFailed(format!("tar.gz 条目路径无效: {}", e)))?
                .to_string_lossy()
                .to_string();
            let target = sanitize_path(dest, &name)?;
            let entry_type = entry.header().entry_type();

            if entry_type.is_dir() {
                create_dir_safe(&target)?;
                continue;
            }
            if !entry_type.is_file() {
                debug!("跳过非普通文件条目: {} ({:?})", name, entry_type);
                continue;
            }

            let size = entry.size();
            self.check_size(&name, size)?;
            let mode = entry.header().mode().ok();
            self.write_entry(&mut entry, &name, &target, mode)?;
        }

        Ok(())
    }

    /// 解压 ZIP 文件
    fn extract_zip(&self, path: &Path, dest: &Path, cancel: &CancellationToken) -> Result<()> {
        let file = File::open(path)?;
        let mut archive = zip::ZipArchive::new(file)
            .map_err(|e| RegistryError::ExtractFailed(format!("无法读取 ZIP 文件: {}", e)))?;

        for i in 0..archive.len() {
            if cancel.is_cancelled() {
                return Err(RegistryError::Cancelled);
            }
            let mut file = archive.by_index(i).map_err(|e| {
                RegistryError::ExtractFailed(format!("无法读取 ZIP 条目 {}: {}", i, e))
            })?;

            let name = file.name().to_string();
            let target = sanitize_path(dest, &name)?;

            if file.is_dir() {
                create_dir_safe(&target)?;
                continue;
            }

            self.check_size(&name, file.size())?;
            let mode = file.unix_mode();
            self.write_entry(&mut file, &name, &target, mode)?;
        }

        Ok(())
    }

    fn check_size(&self, name: &str, size: u64) -> Result<()> {
        if size > self.max_entry_size {
            return Err(RegistryError::EntryTooLarge {
                name: name.to_string(),
                size,
                limit: self.max_entry_size,
            });
        }
        Ok(())
    }

    /// 写入单个文件条目
    ///
    /// 声明大小可能是伪造的，实际读取量同样受上限约束
    fn write_entry(
        &self,
        reader: &mut dyn Read,
        name: &str,
        target: &Path,
        mode: Option<u32>,
    ) -> Result<()> {
        if let Some(parent) = target.parent() {
            create_dir_safe(parent)?;
        }

        let mut out = File::create(target)?;
        let mut limited = reader.take(self.max_entry_size + 1);
        let written = io::copy(&mut limited, &mut out)
            .map_err(|e| RegistryError::ExtractFailed(format!("写入 {} 失败: {}", name, e)))?;
        if written > self.max_entry_size {
            drop(out);
            let _ = fs::remove_file(target);
            return Err(RegistryError::EntryTooLarge {
                name: name.to_string(),
                size: written,
                limit: self.max_entry_size,
            });
        }
        out.flush()?;
        drop(out);

        apply_mode(target, mode)?;
        Ok(())
    }
}

/// 使用默认上限解压压缩包
pub fn extract_archive(archive_path: &Path, dest_dir: &Path) -> Result<()> {
    ArchiveExtractor::new().extract(archive_path, dest_dir)
}

fn create_dir_safe(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
    }
    Ok(())
}

/// 恢复条目的权限位，只保留普通权限位
#[cfg(unix)]
fn apply_mode(target: &Path, mode: Option<u32>) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mode = mode.map(|m| m & 0o777).filter(|m| *m != 0).unwrap_or(0o644);
    fs::set_permissions(target, fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn apply_mode(_target: &Path, _mode: Option<u32>) -> Result<()> {
    Ok(())
}

/// 可执行性检测
pub trait ExecutabilityChecker: Send + Sync {
    /// 文件是否可执行
    fn is_executable(&self, path: &Path, metadata: &Metadata) -> bool;
}

/// 按权限位判断 (Unix)
#[derive(Debug, Default, Clone, Copy)]
pub struct ModeBitsChecker;

impl ExecutabilityChecker for ModeBitsChecker {
    #[cfg(unix)]
    fn is_executable(&self, _path: &Path, metadata: &Metadata) -> bool {
        use std::os::unix::fs::PermissionsExt;
        metadata.is_file() && metadata.permissions().mode() & 0o111 != 0
    }

    #[cfg(not(unix))]
    fn is_executable(&self, _path: &Path, metadata: &Metadata) -> bool {
        metadata.is_file()
    }
}

/// 按扩展名判断 (Windows)
#[derive(Debug, Default, Clone, Copy)]
pub struct ExtensionChecker;

impl ExecutabilityChecker for ExtensionChecker {
    fn is_executable(&self, path: &Path, metadata: &Metadata) -> bool {
        metadata.is_file()
            && path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| matches!(e.to_ascii_lowercase().as_str(), "exe" | "bat" | "cmd" | "com"))
                .unwrap_or(false)
    }
}

/// 当前平台的可执行性检测
pub fn platform_checker() -> std::sync::Arc<dyn ExecutabilityChecker> {
    if cfg!(windows) {
        std::sync::Arc::new(ExtensionChecker)
    } else {
        std::sync::Arc::new(ModeBitsChecker)
    }
}

/// 校验可执行文件
pub fn validate_binary(path: &Path) -> Result<()> {
    validate_binary_with(path, platform_checker().as_ref())
}

/// 使用指定检测器校验可执行文件
pub fn validate_binary_with(path: &Path, checker: &dyn ExecutabilityChecker) -> Result<()> {
    let metadata = match fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(RegistryError::BinaryNotFound(path.to_path_buf()));
        }
        Err(e) => return Err(e.into()),
    };

    if metadata.is_dir() {
        return Err(RegistryError::NotExecutable {
            path: path.to_path_buf(),
            reason: "是目录".to_string(),
        });
    }
    if !checker.is_executable(path, &metadata) {
        return Err(RegistryError::NotExecutable {
            path: path.to_path_buf(),
            reason: "缺少可执行属性".to_string(),
        });
    }
    Ok(())
}
