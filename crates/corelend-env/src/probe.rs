//! Environment classification.
//!
//! Checks run most specific first and the first match wins:
//!
//! ```text
//! panel markers      → ConstrainedPanel
//! container markers  → Container
//! hosting heuristics → SharedHosting
//! otherwise          → DedicatedOrVps
//! ```
//!
//! Every branch also harvests whatever metadata it can find. Missing
//! metadata never fails detection.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use tracing::debug;

use corelend_core::EnvironmentKind;

use crate::host::{HostView, SystemHost};

/// Panel memory declared in MiB (`SERVER_MEMORY`).
pub const META_DECLARED_MEMORY: &str = "declared_memory_mb";
/// Container memory ceiling from cgroup files, in MiB.
pub const META_MEMORY_LIMIT: &str = "memory_limit_mb";
/// Container CPU quota, rounded up to whole cores.
pub const META_CPU_QUOTA: &str = "cpu_quota_cores";

const PANEL_ENV_VARS: &[&str] = &["P_SERVER_UUID", "P_SERVER_LOCATION", "P_SERVER_ALLOCATION_LIMIT"];
const PANEL_ENV_PREFIX: &str = "PTERODACTYL";
const PANEL_MARKER_FILES: &[&str] = &[
    "/etc/pterodactyl",
    "/var/lib/pterodactyl",
    "/home/container/.pteroignore",
];

const CGROUP_FILES: &[&str] = &["/proc/1/cgroup", "/proc/self/cgroup"];
const CGROUP_KEYWORDS: &[&str] = &["docker", "kubepods", "containerd", "lxc", "podman", "libpod"];
const CONTAINER_MARKER_FILES: &[&str] = &["/.dockerenv", "/run/.containerenv"];
const CONTAINER_ENV_VARS: &[&str] = &["container", "KUBERNETES_SERVICE_HOST"];

const CGROUP_V2_MEMORY: &str = "/sys/fs/cgroup/memory.max";
const CGROUP_V1_MEMORY: &str = "/sys/fs/cgroup/memory/memory.limit_in_bytes";
const CGROUP_V2_CPU: &str = "/sys/fs/cgroup/cpu.max";

const DMI_PRODUCT: &str = "/sys/class/dmi/id/product_name";
const HYPERVISOR_NAMES: &[&str] = &[
    "kvm",
    "qemu",
    "vmware",
    "virtualbox",
    "xen",
    "hyper-v",
    "virtual machine",
    "droplet",
    "google compute engine",
];

/// cgroup v1 reports "unlimited" as a page-aligned i64::MAX.
const CGROUP_UNLIMITED_BYTES: u64 = 1 << 60;

static HOSTING_DIR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(public_html|/var/www/vhosts/|/usr/home/|/home\d*/[^/]+/(www|domains|htdocs)(/|$)|cpanel|plesk)")
        .expect("static regex")
});

static HOSTING_USER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(u\d{3,}|web\d+|srv\d+|cust\d+|[a-z]\d{5,})$").expect("static regex")
});

/// Outcome of a probe run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
    pub kind: EnvironmentKind,
    pub metadata: BTreeMap<String, String>,
}

/// Classifies the host into an [`EnvironmentKind`].
#[derive(Debug, Clone)]
pub struct EnvironmentProbe<H = SystemHost> {
    host: H,
    override_kind: Option<EnvironmentKind>,
}

impl EnvironmentProbe<SystemHost> {
    pub fn system() -> Self {
        Self::new(SystemHost)
    }
}

impl<H: HostView> EnvironmentProbe<H> {
    pub fn new(host: H) -> Self {
        Self {
            host,
            override_kind: None,
        }
    }

    /// Force a kind instead of detecting one. Metadata is still harvested.
    pub fn with_override(mut self, kind: Option<EnvironmentKind>) -> Self {
        self.override_kind = kind;
        self
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn detect(&self) -> Detection {
        let mut metadata = BTreeMap::new();

        let detected = if self.host.available_cores().is_none() {
            EnvironmentKind::Unknown
        } else if self.panel_markers(&mut metadata) {
            EnvironmentKind::ConstrainedPanel
        } else if self.container_markers(&mut metadata) {
            EnvironmentKind::Container
        } else if self.shared_hosting_markers(&mut metadata) {
            EnvironmentKind::SharedHosting
        } else {
            self.dedicated_metadata(&mut metadata);
            EnvironmentKind::DedicatedOrVps
        };

        let kind = match self.override_kind {
            Some(forced) => {
                metadata.insert("detected".to_string(), detected.label().to_string());
                metadata.insert("override".to_string(), "true".to_string());
                forced
            }
            None => detected,
        };

        debug!(kind = %kind, ?metadata, "environment probe finished");
        Detection { kind, metadata }
    }

    fn panel_markers(&self, md: &mut BTreeMap<String, String>) -> bool {
        let marker = PANEL_ENV_VARS
            .iter()
            .find(|key| self.host.env_var(key).is_some())
            .map(|key| format!("env:{key}"))
            .or_else(|| {
                self.host
                    .env_keys()
                    .into_iter()
                    .find(|k| k.starts_with(PANEL_ENV_PREFIX))
                    .map(|k| format!("env:{k}"))
            })
            .or_else(|| {
                PANEL_MARKER_FILES
                    .iter()
                    .find(|p| self.host.exists(Path::new(p)))
                    .map(|p| format!("file:{p}"))
            });

        let Some(marker) = marker else {
            return false;
        };
        md.insert("panel_marker".to_string(), marker);

        if let Some(mb) = self
            .host
            .env_var("SERVER_MEMORY")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|mb| *mb > 0)
        {
            md.insert(META_DECLARED_MEMORY.to_string(), mb.to_string());
        }
        true
    }

    fn container_markers(&self, md: &mut BTreeMap<String, String>) -> bool {
        let cgroup_hit = CGROUP_FILES.iter().find_map(|path| {
            let content = self.host.read_file(Path::new(path))?;
            let lower = content.to_lowercase();
            CGROUP_KEYWORDS
                .iter()
                .find(|kw| lower.contains(*kw))
                .map(|kw| format!("cgroup:{kw}"))
        });

        let marker = cgroup_hit
            .or_else(|| {
                CONTAINER_MARKER_FILES
                    .iter()
                    .find(|p| self.host.exists(Path::new(p)))
                    .map(|p| format!("file:{p}"))
            })
            .or_else(|| {
                CONTAINER_ENV_VARS
                    .iter()
                    .find(|key| self.host.env_var(key).is_some())
                    .map(|key| format!("env:{key}"))
            });

        let Some(marker) = marker else {
            return false;
        };
        md.insert("container_marker".to_string(), marker);
        self.cgroup_limits(md);
        true
    }

    fn cgroup_limits(&self, md: &mut BTreeMap<String, String>) {
        let memory_bytes = self
            .host
            .read_file(Path::new(CGROUP_V2_MEMORY))
            .or_else(|| self.host.read_file(Path::new(CGROUP_V1_MEMORY)))
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|b| *b > 0 && *b < CGROUP_UNLIMITED_BYTES);
        if let Some(bytes) = memory_bytes {
            md.insert(
                META_MEMORY_LIMIT.to_string(),
                (bytes / (1024 * 1024)).to_string(),
            );
        }

        if let Some(cores) = self
            .host
            .read_file(Path::new(CGROUP_V2_CPU))
            .and_then(|v| parse_cpu_max(&v))
        {
            md.insert(META_CPU_QUOTA.to_string(), cores.to_string());
        }
    }

    fn shared_hosting_markers(&self, md: &mut BTreeMap<String, String>) -> bool {
        let tmp = self
            .host
            .env_var("TMPDIR")
            .unwrap_or_else(|| "/tmp".to_string());
        if !self.host.is_writable_dir(Path::new(&tmp)) {
            md.insert("hosting_signal".to_string(), format!("tmp-not-writable:{tmp}"));
            return true;
        }

        if let Some(cwd) = self.host.current_dir() {
            let cwd = cwd.to_string_lossy();
            if HOSTING_DIR.is_match(&cwd) {
                md.insert("hosting_signal".to_string(), format!("cwd:{cwd}"));
                return true;
            }
        }

        if let Some(user) = self.host.user_name()
            && HOSTING_USER.is_match(&user)
        {
            md.insert("hosting_signal".to_string(), format!("user:{user}"));
            return true;
        }

        false
    }

    fn dedicated_metadata(&self, md: &mut BTreeMap<String, String>) {
        let Some(product) = self.host.read_file(Path::new(DMI_PRODUCT)) else {
            return;
        };
        let product = product.trim().to_string();
        let lower = product.to_lowercase();
        let virtualized = HYPERVISOR_NAMES.iter().any(|h| lower.contains(h));
        md.insert("dmi_product".to_string(), product);
        md.insert("virtualized".to_string(), virtualized.to_string());
    }
}

/// Parse cgroup v2 `cpu.max` ("quota period" or "max period") into whole
/// cores, rounding up.
fn parse_cpu_max(content: &str) -> Option<u32> {
    let mut parts = content.split_whitespace();
    let quota = parts.next()?;
    let period = parts.next()?.parse::<u64>().ok().filter(|p| *p > 0)?;
    if quota == "max" {
        return None;
    }
    let quota = quota.parse::<u64>().ok()?;
    Some(quota.div_ceil(period).max(1) as u32)
}
