//! The worker's XML config file.
//!
//! Written in full before every launch. In file mode the core count is
//! changed afterwards by rewriting only the `<cpus v='N'/>` directive.

use std::fmt::Write as _;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use corelend_core::{WorkerConfig, WorkerIdentity};

use crate::error::{WorkerError, WorkerResult};

static CPUS_DIRECTIVE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<cpus\s+v=['"](\d+)['"]\s*/>"#).expect("valid cpus directive regex")
});

/// Control port settings written into the artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlListen {
    pub port: u16,
    pub allow: Vec<String>,
    pub password: Option<String>,
}

/// Everything the worker reads from its config file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerArtifact {
    pub identity: WorkerIdentity,
    pub cores: u32,
    pub control: Option<ControlListen>,
}

impl WorkerArtifact {
    /// Build the artifact for a launch. The control port is only written
    /// when the host permits it.
    pub fn from_config(config: &WorkerConfig, cores: u32, control_permitted: bool) -> Self {
        let control = match (control_permitted, config.control_port) {
            (true, Some(port)) => Some(ControlListen {
                port,
                allow: config.allow.clone(),
                password: config.control_password.clone(),
            }),
            _ => None,
        };

        Self {
            identity: config.identity.clone(),
            cores,
            control,
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::with_capacity(512);
        out.push_str("<config>\n");
        out.push_str("  <!-- Generated by corelend. The cpus value is rewritten at runtime. -->\n");
        let _ = writeln!(out, "  <user v='{}'/>", escape_attr(&self.identity.user));
        let _ = writeln!(out, "  <team v='{}'/>", escape_attr(&self.identity.team));
        let _ = writeln!(out, "  <passkey v='{}'/>", escape_attr(&self.identity.passkey));

        if let Some(control) = &self.control {
            let _ = writeln!(out, "  <command-port v='{}'/>", control.port);
            let _ = writeln!(
                out,
                "  <command-allow v='{}'/>",
                escape_attr(&control.allow.join(" "))
            );
            if let Some(password) = &control.password {
                let _ = writeln!(out, "  <password v='{}'/>", escape_attr(password));
            }
        }

        out.push_str("  <slot id='0' type='CPU'>\n");
        let _ = writeln!(out, "    <cpus v='{}'/>", self.cores);
        out.push_str("  </slot>\n");
        out.push_str("</config>\n");
        out
    }

    /// Write the artifact, replacing any previous file atomically.
    pub fn write(&self, path: &Path) -> WorkerResult<()> {
        let write_err = |source| WorkerError::ArtifactWrite {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, self.render()).map_err(write_err)?;
        std::fs::rename(&tmp, path).map_err(write_err)?;

        debug!(path = %path.display(), cores = self.cores, "worker config written");
        Ok(())
    }
}

/// Core count currently written in the artifact, if any.
pub fn read_cores(path: &Path) -> WorkerResult<Option<u32>> {
    let content = std::fs::read_to_string(path).map_err(|source| WorkerError::ArtifactRead {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(CPUS_DIRECTIVE
        .captures(&content)
        .and_then(|caps| caps[1].parse().ok()))
}

/// Rewrite the core directive in place, leaving the rest untouched.
///
/// Returns the previous value.
pub fn rewrite_cores(path: &Path, cores: u32) -> WorkerResult<u32> {
    let content = std::fs::read_to_string(path).map_err(|source| WorkerError::ArtifactRead {
        path: path.to_path_buf(),
        source,
    })?;

    let previous = CPUS_DIRECTIVE
        .captures(&content)
        .and_then(|caps| caps[1].parse::<u32>().ok())
        .ok_or_else(|| WorkerError::MissingCoreDirective(path.to_path_buf()))?;

    let updated = CPUS_DIRECTIVE.replace(&content, format!("<cpus v='{cores}'/>"));
    std::fs::write(path, updated.as_bytes()).map_err(|source| WorkerError::ArtifactWrite {
        path: path.to_path_buf(),
        source,
    })?;

    debug!(path = %path.display(), previous, cores, "cpus directive rewritten");
    Ok(previous)
}

fn escape_attr(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> WorkerConfig {
        WorkerConfig {
            identity: WorkerIdentity {
                user: "O'Brien & co".to_string(),
                team: "4242".to_string(),
                passkey: "abc".to_string(),
            },
            ..WorkerConfig::default()
        }
    }

    #[test]
    fn render_with_control_port() {
        let xml = WorkerArtifact::from_config(&config(), 4, true).render();
        assert!(xml.contains("<user v='O&apos;Brien &amp; co'/>"));
        assert!(xml.contains("<team v='4242'/>"));
        assert!(xml.contains("<command-port v='36330'/>"));
        assert!(xml.contains("<command-allow v='127.0.0.1'/>"));
        assert!(!xml.contains("<password"));
        assert!(xml.contains("<slot id='0' type='CPU'>"));
        assert!(xml.contains("<cpus v='4'/>"));
    }

    #[test]
    fn artifacts_compare_by_value() {
        let a = WorkerArtifact::from_config(&config(), 4, true);
        assert_eq!(a, a.clone());
        assert_ne!(a, WorkerArtifact::from_config(&config(), 3, true));
        assert_eq!(a.identity, config().identity);
    }

    #[test]
    fn control_port_omitted_when_not_permitted() {
        let xml = WorkerArtifact::from_config(&config(), 1, false).render();
        assert!(!xml.contains("command-port"));
        assert!(!xml.contains("command-allow"));
    }

    #[test]
    fn password_is_written_when_configured() {
        let mut cfg = config();
        cfg.control_password = Some("hunter2".to_string());
        let xml = WorkerArtifact::from_config(&cfg, 2, true).render();
        assert!(xml.contains("<password v='hunter2'/>"));
    }

    #[test]
    fn rewrite_touches_only_cpus() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.xml");
        WorkerArtifact::from_config(&config(), 2, true)
            .write(&path)
            .unwrap();
        let before = std::fs::read_to_string(&path).unwrap();

        let previous = rewrite_cores(&path, 7).unwrap();
        assert_eq!(previous, 2);
        assert_eq!(read_cores(&path).unwrap(), Some(7));

        let after = std::fs::read_to_string(&path).unwrap();
        assert_eq!(before.replace("<cpus v='2'/>", "<cpus v='7'/>"), after);
    }

    #[test]
    fn rewrite_accepts_double_quotes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.xml");
        std::fs::write(&path, "<config><slot><cpus v=\"3\" /></slot></config>").unwrap();
        assert_eq!(rewrite_cores(&path, 5).unwrap(), 3);
        assert_eq!(read_cores(&path).unwrap(), Some(5));
    }

    #[test]
    fn rewrite_without_directive_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.xml");
        std::fs::write(&path, "<config/>").unwrap();
        assert!(matches!(
            rewrite_cores(&path, 5),
            Err(WorkerError::MissingCoreDirective(_))
        ));
    }

    #[test]
    fn rewrite_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            rewrite_cores(&dir.path().join("absent.xml"), 1),
            Err(WorkerError::ArtifactRead { .. })
        ));
    }
}
