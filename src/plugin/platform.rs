//! 运行平台识别
//!
//! 资产按文件名中的操作系统/架构子串与当前平台匹配

use std::fmt;

use super::archive::ArchiveFormat;

/// 操作系统/架构描述
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    /// 操作系统，取值同 `std::env::consts::OS`
    pub os: String,
    /// 架构，取值同 `std::env::consts::ARCH`
    pub arch: String,
}

impl Platform {
    /// 创建平台描述
    pub fn new(os: impl Into<String>, arch: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            arch: arch.into(),
        }
    }

    /// 当前运行平台
    pub fn current() -> Self {
        Self::new(std::env::consts::OS, std::env::consts::ARCH)
    }

    /// Linux x86_64
    pub fn linux_amd64() -> Self {
        Self::new("linux", "x86_64")
    }

    /// Windows x86_64
    pub fn windows_amd64() -> Self {
        Self::new("windows", "x86_64")
    }

    /// 资产文件名中可能出现的操作系统别名
    fn os_aliases(&self) -> &'static [&'static str] {
        match self.os.as_str() {
            "linux" => &["linux"],
            "macos" | "darwin" => &["darwin", "macos", "apple"],
            "windows" => &["windows"],
            "freebsd" => &["freebsd"],
            _ => &[],
        }
    }

    /// 资产文件名中可能出现的架构别名
    fn arch_aliases(&self) -> &'static [&'static str] {
        match self.arch.as_str() {
            "x86_64" | "amd64" => &["x86_64", "amd64", "x64"],
            "aarch64" | "arm64" => &["aarch64", "arm64"],
            "x86" | "i386" | "i686" => &["i386", "i686", "386"],
            _ => &[],
        }
    }

    /// Go 风格的架构名，用于提示信息
    fn arch_hint(&self) -> &str {
        match self.arch.as_str() {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            "x86" => "386",
            other => other,
        }
    }

    /// 资产文件名是否匹配当前平台
    ///
    /// 不区分大小写，要求同时包含操作系统和架构标记，且为支持的压缩格式
    pub fn matches_asset(&self, asset_name: &str) -> bool {
        if ArchiveFormat::from_file_name(asset_name).is_none() {
            return false;
        }
        let lower = asset_name.to_lowercase();
        let os_match = self.os_aliases().iter().any(|alias| lower.contains(alias));
        let arch_match = self
            .arch_aliases()
            .iter()
            .any(|alias| lower.contains(alias));
        os_match && arch_match
    }

    /// 可执行文件扩展名
    pub fn executable_suffix(&self) -> &'static str {
        if self.os == "windows" {
            ".exe"
        } else {
            ""
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let os = if self.os == "macos" { "darwin" } else { &self.os };
        write!(f, "{}/{}", os, self.arch_hint())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linux_asset_matching() {
        let platform = Platform::linux_amd64();
        assert!(platform.matches_asset("costlens-plugin-aws_v1.0.0_Linux_x86_64.tar.gz"));
        assert!(platform.matches_asset("plugin-linux-amd64.zip"));
        assert!(!platform.matches_asset("plugin-linux-arm64.tar.gz"));
        assert!(!platform.matches_asset("plugin-windows-amd64.zip"));
        assert!(!platform.matches_asset("plugin-linux-amd64.deb"));
    }

    #[test]
    fn test_darwin_does_not_match_windows() {
        let windows = Platform::windows_amd64();
        assert!(!windows.matches_asset("plugin_Darwin_x86_64.tar.gz"));
        assert!(windows.matches_asset("plugin_Windows_x86_64.zip"));

        let mac = Platform::new("macos", "aarch64");
        assert!(mac.matches_asset("plugin_Darwin_arm64.tar.gz"));
    }

    #[test]
    fn test_display_hint() {
        assert_eq!(Platform::linux_amd64().to_string(), "linux/amd64");
        assert_eq!(Platform::new("macos", "aarch64").to_string(), "darwin/arm64");
    }

    #[test]
    fn test_current_platform_is_populated() {
        let platform = Platform::current();
        assert!(!platform.os.is_empty());
        assert!(!platform.arch.is_empty());
    }
}
