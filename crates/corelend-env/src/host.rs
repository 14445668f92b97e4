//! Read-only view of the host the probe inspects.
//!
//! Detection only ever goes through [`HostView`], so the classification
//! rules can be exercised against a fabricated host in tests.

use std::path::{Path, PathBuf};

/// Everything the environment probe is allowed to look at.
pub trait HostView {
    fn env_var(&self, key: &str) -> Option<String>;

    /// Names of all environment variables (for prefix matching).
    fn env_keys(&self) -> Vec<String>;

    fn read_file(&self, path: &Path) -> Option<String>;

    fn exists(&self, path: &Path) -> bool;

    /// Whether a file can be created inside `path`.
    fn is_writable_dir(&self, path: &Path) -> bool;

    fn current_dir(&self) -> Option<PathBuf>;

    fn user_name(&self) -> Option<String>;

    /// Processors available to this process, if the host reports them.
    fn available_cores(&self) -> Option<u32>;

    /// Available memory in MiB (0 if unknown).
    fn memory_mb(&self) -> u64;
}

/// The real machine.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemHost;

impl HostView for SystemHost {
    fn env_var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }

    fn env_keys(&self) -> Vec<String> {
        std::env::vars_os()
            .filter_map(|(k, _)| k.into_string().ok())
            .collect()
    }

    fn read_file(&self, path: &Path) -> Option<String> {
        std::fs::read_to_string(path).ok()
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_writable_dir(&self, path: &Path) -> bool {
        let probe = path.join(format!(".corelend-probe-{}", std::process::id()));
        match std::fs::File::create(&probe) {
            Ok(_) => {
                let _ = std::fs::remove_file(&probe);
                true
            }
            Err(_) => false,
        }
    }

    fn current_dir(&self) -> Option<PathBuf> {
        std::env::current_dir().ok()
    }

    fn user_name(&self) -> Option<String> {
        if let Some(name) = self.env_var("USER").or_else(|| self.env_var("LOGNAME")) {
            return Some(name);
        }
        effective_uid().map(|uid| format!("uid{uid}"))
    }

    fn available_cores(&self) -> Option<u32> {
        std::thread::available_parallelism()
            .ok()
            .map(|n| n.get() as u32)
    }

    fn memory_mb(&self) -> u64 {
        if let Some(meminfo) = self.read_file(Path::new("/proc/meminfo"))
            && let Some(mb) = parse_meminfo_available_mb(&meminfo)
        {
            return mb;
        }
        physical_memory_mb()
    }
}

#[cfg(unix)]
fn effective_uid() -> Option<u32> {
    // SAFETY: geteuid has no preconditions and cannot fail.
    Some(unsafe { libc::geteuid() })
}

#[cfg(not(unix))]
fn effective_uid() -> Option<u32> {
    None
}

#[cfg(unix)]
fn physical_memory_mb() -> u64 {
    // SAFETY: sysconf only reads system configuration values.
    let (page_size, pages) = unsafe {
        (
            libc::sysconf(libc::_SC_PAGESIZE),
            libc::sysconf(libc::_SC_PHYS_PAGES),
        )
    };
    if page_size > 0 && pages > 0 {
        (page_size as u64 * pages as u64) / (1024 * 1024)
    } else {
        0
    }
}

#[cfg(not(unix))]
fn physical_memory_mb() -> u64 {
    0
}

/// Extract available memory from `/proc/meminfo` content.
///
/// Prefers `MemAvailable`; older kernels only have free + buffers + cached.
pub fn parse_meminfo_available_mb(content: &str) -> Option<u64> {
    let mut available = None;
    let mut free = 0u64;
    let mut buffers = 0u64;
    let mut cached = 0u64;
    let mut saw_any = false;

    for line in content.lines() {
        let mut parts = line.split_whitespace();
        let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        let Ok(kb) = value.parse::<u64>() else {
            continue;
        };
        match key {
            "MemAvailable:" => available = Some(kb),
            "MemFree:" => {
                free = kb;
                saw_any = true;
            }
            "Buffers:" => buffers = kb,
            "Cached:" => cached = kb,
            _ => {}
        }
    }

    match available {
        Some(kb) => Some(kb / 1024),
        None if saw_any => Some((free + buffers + cached) / 1024),
        None => None,
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use std::collections::{HashMap, HashSet};
    use std::path::{Path, PathBuf};

    use super::HostView;

    /// A fabricated host for classification tests.
    #[derive(Debug, Clone)]
    pub struct FakeHost {
        pub env: HashMap<String, String>,
        pub files: HashMap<PathBuf, String>,
        pub markers: HashSet<PathBuf>,
        pub read_only_dirs: HashSet<PathBuf>,
        pub cwd: Option<PathBuf>,
        pub user: Option<String>,
        pub cores: Option<u32>,
        pub memory_mb: u64,
    }

    impl Default for FakeHost {
        fn default() -> Self {
            Self {
                env: HashMap::new(),
                files: HashMap::new(),
                markers: HashSet::new(),
                read_only_dirs: HashSet::new(),
                cwd: Some(PathBuf::from("/srv/app")),
                user: Some("app".to_string()),
                cores: Some(8),
                memory_mb: 16_384,
            }
        }
    }

    impl FakeHost {
        pub fn with_env(mut self, key: &str, value: &str) -> Self {
            self.env.insert(key.to_string(), value.to_string());
            self
        }

        pub fn with_file(mut self, path: &str, content: &str) -> Self {
            self.files.insert(PathBuf::from(path), content.to_string());
            self
        }

        pub fn with_marker(mut self, path: &str) -> Self {
            self.markers.insert(PathBuf::from(path));
            self
        }

        pub fn with_read_only(mut self, path: &str) -> Self {
            self.read_only_dirs.insert(PathBuf::from(path));
            self
        }
    }

    impl HostView for FakeHost {
        fn env_var(&self, key: &str) -> Option<String> {
            self.env.get(key).cloned()
        }

        fn env_keys(&self) -> Vec<String> {
            self.env.keys().cloned().collect()
        }

        fn read_file(&self, path: &Path) -> Option<String> {
            self.files.get(path).cloned()
        }

        fn exists(&self, path: &Path) -> bool {
            self.markers.contains(path) || self.files.contains_key(path)
        }

        fn is_writable_dir(&self, path: &Path) -> bool {
            !self.read_only_dirs.contains(path)
        }

        fn current_dir(&self) -> Option<PathBuf> {
            self.cwd.clone()
        }

        fn user_name(&self) -> Option<String> {
            self.user.clone()
        }

        fn available_cores(&self) -> Option<u32> {
            self.cores
        }

        fn memory_mb(&self) -> u64 {
            self.memory_mb
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meminfo_prefers_available() {
        let sample = "MemTotal:       16384000 kB\n\
                      MemFree:         1234567 kB\n\
                      MemAvailable:    8192000 kB\n\
                      Buffers:          123456 kB\n\
                      Cached:          2345678 kB\n";
        assert_eq!(parse_meminfo_available_mb(sample), Some(8000));
    }

    #[test]
    fn meminfo_without_available_sums_free_buffers_cached() {
        let sample = "MemTotal:       16384000 kB\n\
                      MemFree:         1024000 kB\n\
                      Buffers:          512000 kB\n\
                      Cached:          2048000 kB\n";
        assert_eq!(parse_meminfo_available_mb(sample), Some(3500));
    }

    #[test]
    fn meminfo_garbage_is_none() {
        assert_eq!(parse_meminfo_available_mb("nothing useful"), None);
    }

    #[test]
    fn system_host_reports_capacity() {
        let host = SystemHost;
        assert!(host.available_cores().unwrap_or(1) >= 1);
    }

    #[test]
    fn system_host_writability_probe() {
        let dir = tempfile::tempdir().unwrap();
        assert!(SystemHost.is_writable_dir(dir.path()));
        assert!(!SystemHost.is_writable_dir(&dir.path().join("missing")));
    }
}
