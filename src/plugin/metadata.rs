//! 插件元数据文件
//!
//! 每个版本目录下可选的 `plugin.metadata.json`，保存字符串键值对 (如 region)。
//! 文件不存在和解析失败是两种不同的错误。

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use super::error::{RegistryError, Result};
use super::types::METADATA_FILE_NAME;

/// 元数据中的区域键
pub const REGION_KEY: &str = "region";

/// 元数据中记录来源仓库的键，更新时用来找回 release 源
pub const REPOSITORY_KEY: &str = "repository";

/// 版本目录对应的元数据文件路径
pub fn metadata_path(version_dir: &Path) -> PathBuf {
    version_dir.join(METADATA_FILE_NAME)
}

/// 读取元数据
pub fn read_metadata(version_dir: &Path) -> Result<HashMap<String, String>> {
    let path = metadata_path(version_dir);
    let content = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(RegistryError::MetadataNotFound(path));
        }
        Err(e) => return Err(e.into()),
    };
    serde_json::from_str(&content).map_err(|source| RegistryError::MetadataParse { path, source })
}

/// 写入元数据，权限 0600，末尾带换行
pub fn write_metadata(version_dir: &Path, metadata: &HashMap<String, String>) -> Result<PathBuf> {
    let path = metadata_path(version_dir);
    let mut body = serde_json::to_string_pretty(metadata)?;
    body.push('\n');

    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(&path)?;
    file.write_all(body.as_bytes())?;
    file.sync_all()?;

    // 文件已存在时 mode 不生效
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(path)
}

/// 把注册表元数据合并到插件自报的元数据中
///
/// 只补充缺失的键，不覆盖插件自己报告的值
pub fn merge_metadata(reported: &mut HashMap<String, String>, registry: &HashMap<String, String>) {
    for (key, value) in registry {
        reported
            .entry(key.clone())
            .or_insert_with(|| value.clone());
    }
}
