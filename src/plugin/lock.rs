//! 插件级跨进程锁
//!
//! 锁文件位于 `<pluginRoot>/<name>.lock`，内容为持有者进程 id。
//! 这是带过期检测的建议锁，不是操作系统文件锁：
//! 持有者崩溃后留下的锁文件会被下一个获取者回收。
//! 获取是 try-lock，已被持有时立即失败，不排队也不重试。

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, error, info, warn};

use super::error::{RegistryError, Result};

/// 超过这个值的进程 id 视为不可信
#[cfg(not(windows))]
const MAX_PLAUSIBLE_PID: i64 = 4_194_304;
#[cfg(windows)]
const MAX_PLAUSIBLE_PID: i64 = u32::MAX as i64;

static SCRATCH_COUNTER: AtomicU64 = AtomicU64::new(0);

/// 进程存活检测
pub trait ProcessChecker: Send + Sync {
    /// 进程是否仍在运行
    fn is_running(&self, pid: u32) -> bool;
}

/// 当前平台的进程存活检测
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcessChecker;

#[cfg(unix)]
impl ProcessChecker for SystemProcessChecker {
    fn is_running(&self, pid: u32) -> bool {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        // 信号 0 只做存在性检查；EPERM 说明进程存在但属于其他用户
        match kill(Pid::from_raw(raw), None) {
            Ok(()) => true,
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }
}

#[cfg(windows)]
impl ProcessChecker for SystemProcessChecker {
    fn is_running(&self, pid: u32) -> bool {
        use windows::Win32::Foundation::CloseHandle;
        use windows::Win32::System::Threading::{
            GetExitCodeProcess, OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION,
        };

        const STILL_ACTIVE: u32 = 259;

        unsafe {
            let Ok(handle) = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, false, pid) else {
                return false;
            };
            let mut exit_code = 0u32;
            let alive = GetExitCodeProcess(handle, &mut exit_code).is_ok()
                && exit_code == STILL_ACTIVE;
            let _ = CloseHandle(handle);
            alive
        }
    }
}

#[cfg(not(any(unix, windows)))]
impl ProcessChecker for SystemProcessChecker {
    fn is_running(&self, _pid: u32) -> bool {
        // 无法检测时按存活处理，避免误删别人的锁
        true
    }
}

/// 锁管理器
#[derive(Clone)]
pub struct LockManager {
    root: PathBuf,
    checker: Arc<dyn ProcessChecker>,
}

impl LockManager {
    /// 使用当前平台的进程检测创建
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_process_checker(root, Arc::new(SystemProcessChecker))
    }

    /// 指定进程检测实现
    pub fn with_process_checker(root: impl Into<PathBuf>, checker: Arc<dyn ProcessChecker>) -> Self {
        Self {
            root: root.into(),
            checker,
        }
    }

    /// 插件对应的锁文件路径
    pub fn lock_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{}.lock", name))
    }

    /// 尝试获取插件锁
    ///
    /// 锁文件已存在且未过期时返回 `LockHeld`；过期锁被透明回收。
    /// 返回的 guard 在 drop 时删除锁文件。
    pub fn acquire(&self, name: &str) -> Result<LockGuard> {
        fs::create_dir_all(&self.root)?;
        let path = self.lock_path(name);

        if self.try_create(&path)? {
            debug!("获取插件锁: {}", path.display());
            return Ok(LockGuard::new(path));
        }

        if !self.is_lock_stale(&path) {
            return Err(RegistryError::LockHeld {
                name: name.to_string(),
                path,
            });
        }

        if !self.reclaim_stale(&path)? {
            return Err(RegistryError::LockHeld {
                name: name.to_string(),
                path,
            });
        }

        if self.try_create(&path)? {
            info!("已回收过期的插件锁: {}", path.display());
            return Ok(LockGuard::new(path));
        }

        Err(RegistryError::LockHeld {
            name: name.to_string(),
            path,
        })
    }

    /// 锁文件是否过期
    ///
    /// 内容为空、非整数、进程不存在或进程 id 大得离谱时视为过期。
    /// 锁文件不存在不算过期。
    pub fn is_lock_stale(&self, path: &Path) -> bool {
        match fs::read_to_string(path) {
            Ok(content) => self.is_stale_content(&content),
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => {
                warn!("读取锁文件失败 {}: {}", path.display(), e);
                false
            }
        }
    }

    fn is_stale_content(&self, content: &str) -> bool {
        let trimmed = content.trim();
        if trimmed.is_empty() {
            return true;
        }
        let Ok(pid) = trimmed.parse::<i64>() else {
            return true;
        };
        if pid <= 0 || pid > MAX_PLAUSIBLE_PID {
            return true;
        }
        match u32::try_from(pid) {
            Ok(pid) => !self.checker.is_running(pid),
            Err(_) => true,
        }
    }

    /// 原子地创建带进程 id 的锁文件
    ///
    /// 先写入临时文件再 hard link 到锁路径，其他进程永远看不到空的锁文件。
    /// 锁路径已存在时返回 `Ok(false)`。
    fn try_create(&self, path: &Path) -> Result<bool> {
        let pid = std::process::id();
        let scratch = self.scratch_path(path, "tmp");
        write_private(&scratch, pid.to_string().as_bytes())?;

        let linked = fs::hard_link(&scratch, path);
        let _ = fs::remove_file(&scratch);
        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) if e.kind() == ErrorKind::Unsupported => self.create_exclusive(path, pid),
            Err(e) => Err(e.into()),
        }
    }

    /// 不支持 hard link 的文件系统上退回到 create_new
    fn create_exclusive(&self, path: &Path, pid: u32) -> Result<bool> {
        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        match options.open(path) {
            Ok(mut file) => {
                file.write_all(pid.to_string().as_bytes())?;
                file.sync_all()?;
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// 把过期锁改名移走后再确认一次，避免删掉刚被别人重新创建的锁
    ///
    /// 改名前重新读取锁内容并判断是否过期；移走的内容与判断时不同，
    /// 说明期间有其他获取者回收并重建了锁，需要放回原处。
    fn reclaim_stale(&self, path: &Path) -> Result<bool> {
        let observed = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(e.into()),
        };
        if !self.is_stale_content(&observed) {
            debug!("锁已被其他获取者重建: {}", path.display());
            return Ok(false);
        }

        let tombstone = self.scratch_path(path, "stale");
        match fs::rename(path, &tombstone) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(e.into()),
        }

        let moved = fs::read_to_string(&tombstone).ok();
        if moved.as_deref() == Some(observed.as_str()) {
            let _ = fs::remove_file(&tombstone);
            return Ok(true);
        }

        // 移走的是一把活锁，放回原处
        warn!("回收锁时发现活跃持有者，恢复锁文件: {}", path.display());
        if let Err(e) = fs::hard_link(&tombstone, path) {
            error!(
                "无法恢复锁文件 {}: {}，原持有者与新持有者可能同时认为自己持有锁",
                path.display(),
                e
            );
        }
        let _ = fs::remove_file(&tombstone);
        Ok(false)
    }

    fn scratch_path(&self, path: &Path, kind: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let seq = SCRATCH_COUNTER.fetch_add(1, Ordering::Relaxed);
        path.with_file_name(format!(
            ".{}.{}.{}.{}.{}",
            file_name,
            kind,
            std::process::id(),
            nanos,
            seq
        ))
    }
}

/// 以 0600 权限写入文件
fn write_private(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(content)?;
    file.sync_all()
}

/// 已获取的锁，drop 时释放
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    released: bool,
}

impl LockGuard {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            released: false,
        }
    }

    /// 锁文件路径
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 显式释放锁
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                warn!("释放插件锁失败 {}: {}", self.path.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::{Arc, Barrier};
    use tempfile::TempDir;

    struct FixedChecker(bool);

    impl ProcessChecker for FixedChecker {
        fn is_running(&self, _pid: u32) -> bool {
            self.0
        }
    }

    fn write_lock(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(format!("{}.lock", name));
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_stale_detection_for_bad_content() {
        let dir = TempDir::new().unwrap();
        let manager = LockManager::new(dir.path());

        assert!(manager.is_lock_stale(&write_lock(&dir, "empty", "")));
        assert!(manager.is_lock_stale(&write_lock(&dir, "blank", "  \n\t")));
        assert!(manager.is_lock_stale(&write_lock(&dir, "text", "not-a-pid")));
        assert!(manager.is_lock_stale(&write_lock(&dir, "huge", "99999999999")));
        assert!(manager.is_lock_stale(&write_lock(&dir, "negative", "-5")));
    }

    #[test]
    fn test_running_process_is_not_stale() {
        let dir = TempDir::new().unwrap();
        let manager = LockManager::new(dir.path());
        let path = write_lock(&dir, "live", &std::process::id().to_string());
        assert!(!manager.is_lock_stale(&path));
    }

    #[test]
    fn test_missing_lock_is_not_stale() {
        let dir = TempDir::new().unwrap();
        let manager = LockManager::new(dir.path());
        assert!(!manager.is_lock_stale(&dir.path().join("absent.lock")));
    }

    #[test]
    fn test_dead_process_is_stale() {
        let dir = TempDir::new().unwrap();
        let manager = LockManager::with_process_checker(dir.path(), Arc::new(FixedChecker(false)));
        let path = write_lock(&dir, "dead", "12345");
        assert!(manager.is_lock_stale(&path));
    }

    #[test]
    fn test_acquire_writes_pid_and_release_removes_file() {
        let dir = TempDir::new().unwrap();
        let manager = LockManager::new(dir.path());

        let guard = manager.acquire("aws").unwrap();
        let content = fs::read_to_string(guard.path()).unwrap();
        assert_eq!(content, std::process::id().to_string());

        let path = guard.path().to_path_buf();
        guard.release().unwrap();
        assert!(!path.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_lock_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let manager = LockManager::new(dir.path());
        let guard = manager.acquire("aws").unwrap();
        let mode = fs::metadata(guard.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_second_acquire_fails_until_released() {
        let dir = TempDir::new().unwrap();
        let manager = LockManager::new(dir.path());

        let guard = manager.acquire("aws").unwrap();
        let err = manager.acquire("aws").unwrap_err();
        assert!(err.is_lock_held());

        // 不同插件互不影响
        let other = manager.acquire("gcp").unwrap();
        drop(other);

        drop(guard);
        assert!(manager.acquire("aws").is_ok());
    }

    #[test]
    fn test_stale_lock_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let manager = LockManager::new(dir.path());
        write_lock(&dir, "aws", "garbage");

        let guard = manager.acquire("aws").unwrap();
        let content = fs::read_to_string(guard.path()).unwrap();
        assert_eq!(content, std::process::id().to_string());
    }

    #[test]
    fn test_live_foreign_lock_is_not_reclaimed() {
        let dir = TempDir::new().unwrap();
        let manager = LockManager::with_process_checker(dir.path(), Arc::new(FixedChecker(true)));
        write_lock(&dir, "aws", "4242");

        let err = manager.acquire("aws").unwrap_err();
        assert!(err.is_lock_held());
        assert_eq!(
            fs::read_to_string(dir.path().join("aws.lock")).unwrap(),
            "4242"
        );
    }

    /// 第 `swap_on` 次检测时模拟另一个获取者把锁重建为 `live_pid`
    struct RebuiltDuringCheck {
        path: PathBuf,
        live_pid: u32,
        swap_on: usize,
        calls: AtomicUsize,
    }

    impl ProcessChecker for RebuiltDuringCheck {
        fn is_running(&self, pid: u32) -> bool {
            if pid == self.live_pid {
                return true;
            }
            if self.calls.fetch_add(1, AtomicOrdering::SeqCst) + 1 == self.swap_on {
                fs::write(&self.path, self.live_pid.to_string()).unwrap();
            }
            false
        }
    }

    fn scratch_leftovers(dir: &TempDir) -> Vec<String> {
        fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|n| n.starts_with('.'))
            .collect()
    }

    #[test]
    fn test_lock_rebuilt_by_another_reclaimer_survives() {
        for swap_on in [1, 2] {
            let dir = TempDir::new().unwrap();
            let path = write_lock(&dir, "aws", "4242");
            let checker = RebuiltDuringCheck {
                path: path.clone(),
                live_pid: 777,
                swap_on,
                calls: AtomicUsize::new(0),
            };
            let manager = LockManager::with_process_checker(dir.path(), Arc::new(checker));

            let err = manager.acquire("aws").unwrap_err();
            assert!(err.is_lock_held(), "swap_on={}", swap_on);
            assert_eq!(fs::read_to_string(&path).unwrap(), "777");
            assert!(scratch_leftovers(&dir).is_empty());
        }
    }

    #[test]
    fn test_exactly_one_concurrent_acquirer_wins() {
        let dir = TempDir::new().unwrap();
        let manager = LockManager::new(dir.path());
        let contenders = 8;
        let barrier = Arc::new(Barrier::new(contenders));
        let done = Arc::new(Barrier::new(contenders));

        let handles: Vec<_> = (0..contenders)
            .map(|_| {
                let manager = manager.clone();
                let barrier = Arc::clone(&barrier);
                let done = Arc::clone(&done);
                std::thread::spawn(move || {
                    barrier.wait();
                    let result = manager.acquire("shared");
                    let won = result.is_ok();
                    // 所有人都尝试过之后才释放
                    done.wait();
                    drop(result);
                    won
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);

        assert!(manager.acquire("shared").is_ok());
    }
}
