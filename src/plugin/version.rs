//! 版本解析与比较
//!
//! 在 semver 基础上放宽输入格式：
//! - 去掉开头的 `v`
//! - 不完整版本 (`1`、`1.2`) 补齐为三段
//! - 预发布版本低于对应正式版本 (`1.0.0-alpha` < `1.0.0`)

use semver::{BuildMetadata, Version, VersionReq};
use std::cmp::Ordering;
use std::fmt;

use super::error::{RegistryError, Result};

/// 版本约束
///
/// 以 `||` 分隔的多组约束，每组内用逗号连接 (同时满足)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionConstraint {
    raw: String,
    alternatives: Vec<VersionReq>,
}

impl VersionConstraint {
    /// 原始表达式
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// 版本是否满足任一组约束
    pub fn matches(&self, version: &Version) -> bool {
        self.alternatives.iter().any(|req| req.matches(version))
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// 解析版本字符串
pub fn parse_version(input: &str) -> Result<Version> {
    let normalized = normalize_version(input)
        .ok_or_else(|| RegistryError::InvalidVersion(input.to_string()))?;
    Version::parse(&normalized).map_err(|_| RegistryError::InvalidVersion(input.to_string()))
}

/// 版本字符串是否有效
pub fn is_valid_version(input: &str) -> bool {
    parse_version(input).is_ok()
}

/// 比较两个版本
pub fn compare_versions(a: &str, b: &str) -> Result<Ordering> {
    let left = without_build(parse_version(a)?);
    let right = without_build(parse_version(b)?);
    Ok(left.cmp(&right))
}

/// build 元数据不参与优先级比较
fn without_build(mut version: Version) -> Version {
    version.build = BuildMetadata::EMPTY;
    version
}

/// 解析版本约束
///
/// 支持比较运算符、逗号连接的范围、`~`/`^` 简写以及 `||` 多选
pub fn parse_version_constraint(expr: &str) -> Result<VersionConstraint> {
    let trimmed = expr.trim();
    if trimmed.is_empty() {
        return Err(RegistryError::InvalidConstraint("约束不能为空".to_string()));
    }

    let mut alternatives = Vec::new();
    for group in trimmed.split("||") {
        let group = group.trim();
        if group.is_empty() {
            return Err(RegistryError::InvalidConstraint(expr.to_string()));
        }
        let cleaned = group
            .split(',')
            .map(strip_comparator_prefix)
            .collect::<Vec<_>>()
            .join(", ");
        let req = VersionReq::parse(&cleaned)
            .map_err(|e| RegistryError::InvalidConstraint(format!("{}: {}", expr, e)))?;
        alternatives.push(req);
    }

    Ok(VersionConstraint {
        raw: trimmed.to_string(),
        alternatives,
    })
}

/// 版本是否满足约束
pub fn satisfies_constraint(version: &str, constraint: &VersionConstraint) -> Result<bool> {
    let parsed = parse_version(version)?;
    Ok(constraint.matches(&parsed))
}

/// 去掉 `v` 前缀并把不完整的版本补齐为 `major.minor.patch`
fn normalize_version(input: &str) -> Option<String> {
    let trimmed = input.trim();
    let stripped = trimmed
        .strip_prefix('v')
        .or_else(|| trimmed.strip_prefix('V'))
        .unwrap_or(trimmed);
    if stripped.is_empty() {
        return None;
    }

    let split_at = stripped.find(['-', '+']).unwrap_or(stripped.len());
    let (core, suffix) = stripped.split_at(split_at);
    let parts: Vec<&str> = core.split('.').collect();
    if parts.is_empty() || parts.len() > 3 {
        return None;
    }
    if parts
        .iter()
        .any(|p| p.is_empty() || !p.chars().all(|c| c.is_ascii_digit()))
    {
        return None;
    }

    let mut padded = parts.join(".");
    for _ in parts.len()..3 {
        padded.push_str(".0");
    }
    padded.push_str(suffix);
    Some(padded)
}

/// 按 tag 查找版本时依次尝试的名称
///
/// 原样、切换 `v` 前缀、补齐为三段后的带/不带 `v` 两种形式，去重并保持顺序。
/// `1.2` -> `1.2`, `v1.2`, `v1.2.0`, `1.2.0`
pub fn tag_candidates(version: &str) -> Vec<String> {
    let trimmed = version.trim();
    let bare = trimmed
        .strip_prefix('v')
        .or_else(|| trimmed.strip_prefix('V'))
        .unwrap_or(trimmed);

    let mut candidates = vec![trimmed.to_string()];
    if bare == trimmed {
        candidates.push(format!("v{}", bare));
    } else {
        candidates.push(bare.to_string());
    }
    if let Some(normalized) = normalize_version(trimmed) {
        candidates.push(format!("v{}", normalized));
        candidates.push(normalized);
    }

    let mut seen = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if !candidate.is_empty() && !seen.contains(&candidate) {
            seen.push(candidate);
        }
    }
    seen
}

/// `>=v1.2` -> `>=1.2`，不带运算符的版本按精确匹配处理: `1.2.3` -> `=1.2.3`
fn strip_comparator_prefix(comparator: &str) -> String {
    let comparator = comparator.trim();
    let op_len = comparator
        .find(|c: char| !matches!(c, '<' | '>' | '=' | '~' | '^' | ' '))
        .unwrap_or(comparator.len());
    let (op, rest) = comparator.split_at(op_len);
    let rest = rest
        .strip_prefix('v')
        .or_else(|| rest.strip_prefix('V'))
        .unwrap_or(rest);
    let op = op.replace(' ', "");
    if op.is_empty() && !is_wildcard(rest) {
        return format!("={}", rest);
    }
    format!("{}{}", op, rest)
}

/// `*`、`1.x`、`1.2.*` 这类通配写法保持 semver 的原义
fn is_wildcard(version: &str) -> bool {
    version
        .split('.')
        .any(|part| matches!(part, "*" | "x" | "X"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tolerates_prefix_and_partial_versions() {
        assert_eq!(parse_version("v1.2.3").unwrap(), Version::new(1, 2, 3));
        assert_eq!(parse_version("1").unwrap(), Version::new(1, 0, 0));
        assert_eq!(parse_version("v1.2").unwrap(), Version::new(1, 2, 0));
        assert_eq!(
            parse_version("1.2-beta.1").unwrap(),
            Version::parse("1.2.0-beta.1").unwrap()
        );
    }

    #[test]
    fn test_invalid_versions() {
        assert!(!is_valid_version(""));
        assert!(!is_valid_version("v"));
        assert!(!is_valid_version("latest"));
        assert!(!is_valid_version("1.2.3.4"));
        assert!(!is_valid_version("1..2"));
        assert!(!is_valid_version("v1.2.0-!!invalid"));
    }

    #[test]
    fn test_prerelease_sorts_below_release() {
        assert_eq!(
            compare_versions("1.0.0-alpha", "1.0.0").unwrap(),
            Ordering::Less
        );
        assert_eq!(
            compare_versions("v1.0.0", "1.0.0").unwrap(),
            Ordering::Equal
        );
        assert_eq!(compare_versions("2", "1.9.9").unwrap(), Ordering::Greater);
    }

    #[test]
    fn test_build_metadata_ignored_in_comparison() {
        assert_eq!(
            compare_versions("1.0.0+build.1", "1.0.0+build.2").unwrap(),
            Ordering::Equal
        );
    }

    #[test]
    fn test_compare_invalid_fails() {
        assert!(compare_versions("abc", "1.0.0").is_err());
    }

    #[test]
    fn test_constraint_operators() {
        let caret = parse_version_constraint("^1.2").unwrap();
        assert!(satisfies_constraint("v1.5.0", &caret).unwrap());
        assert!(!satisfies_constraint("2.0.0", &caret).unwrap());

        let tilde = parse_version_constraint("~1.2.0").unwrap();
        assert!(satisfies_constraint("1.2.9", &tilde).unwrap());
        assert!(!satisfies_constraint("1.3.0", &tilde).unwrap());

        let range = parse_version_constraint(">= v1.0, < 2.0.0").unwrap();
        assert!(satisfies_constraint("1.9.0", &range).unwrap());
        assert!(!satisfies_constraint("2.0.0", &range).unwrap());

        let alt = parse_version_constraint("1.x || ^3").unwrap();
        assert!(satisfies_constraint("1.4.0", &alt).unwrap());
        assert!(satisfies_constraint("3.1.0", &alt).unwrap());
        assert!(!satisfies_constraint("2.0.0", &alt).unwrap());
    }

    #[test]
    fn test_bare_version_constraint_means_equality() {
        let exact = parse_version_constraint("1.2.3").unwrap();
        assert!(satisfies_constraint("v1.2.3", &exact).unwrap());
        assert!(!satisfies_constraint("1.9.0", &exact).unwrap());
        assert!(!satisfies_constraint("1.2.4", &exact).unwrap());

        let mixed = parse_version_constraint("1.0.0 || >=2.0.0").unwrap();
        assert!(satisfies_constraint("1.0.0", &mixed).unwrap());
        assert!(!satisfies_constraint("1.5.0", &mixed).unwrap());
        assert!(satisfies_constraint("2.3.0", &mixed).unwrap());

        let any = parse_version_constraint("*").unwrap();
        assert!(satisfies_constraint("0.1.0", &any).unwrap());
    }

    #[test]
    fn test_tag_candidates_cover_partial_versions() {
        assert_eq!(tag_candidates("1.2"), vec!["1.2", "v1.2", "v1.2.0", "1.2.0"]);
        assert_eq!(tag_candidates("v1.0.0"), vec!["v1.0.0", "1.0.0"]);
        assert_eq!(
            tag_candidates("2-rc.1"),
            vec!["2-rc.1", "v2-rc.1", "v2.0.0-rc.1", "2.0.0-rc.1"]
        );
        assert_eq!(tag_candidates("nightly"), vec!["nightly", "vnightly"]);
    }

    #[test]
    fn test_constraint_rejects_empty_and_garbage() {
        assert!(parse_version_constraint("").is_err());
        assert!(parse_version_constraint("   ").is_err());
        assert!(parse_version_constraint("not a version").is_err());
        assert!(parse_version_constraint("1.0 ||").is_err());
    }

    #[test]
    fn test_satisfies_with_invalid_version_fails() {
        let constraint = parse_version_constraint(">=1.0.0").unwrap();
        assert!(satisfies_constraint("garbage", &constraint).is_err());
    }
}
