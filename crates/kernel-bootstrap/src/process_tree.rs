//! Ancestor process enumeration.
//!
//! Two implementations of [`ProcessTable`]:
//!
//! - [`ProcFs`] reads `/proc/<pid>/stat` and `/proc/<pid>/cmdline` (Linux)
//! - [`PsutilTable`] asks a Python interpreter with `psutil` installed
//!
//! Either one gives the orchestrator the introspection it needs to tell
//! whether it runs under a notebook server.

use async_trait::async_trait;
use kernel_env::{CommandRunner, Invocation};
use serde::Deserialize;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Upper bound on ancestry depth, guards against cycles in a corrupt table.
pub const MAX_ANCESTRY_DEPTH: usize = 256;

/// Upper bound on bytes read from a single `/proc` file.
pub const MAX_PROC_READ_SIZE: u64 = 64 * 1024;

/// One ancestor process.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub cmdline: Vec<String>,
}

impl ProcessInfo {
    pub fn new<I, S>(pid: u32, cmdline: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            pid,
            cmdline: cmdline.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessTableError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },

    #[error("psutil probe failed: {0}")]
    Probe(String),
}

/// Source of the current process's ancestry.
#[async_trait]
pub trait ProcessTable: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Ancestors of the current process, nearest parent first.
    async fn ancestors(&self) -> Result<Vec<ProcessInfo>, ProcessTableError>;
}

/// Linux `/proc` reader.
pub struct ProcFs {
    root: PathBuf,
    pid: u32,
}

impl ProcFs {
    /// Reader for the current process under `/proc`.
    pub fn new() -> Self {
        Self::with_root("/proc", std::process::id())
    }

    /// Reader with a configurable root and starting pid (for testing).
    pub fn with_root(root: impl Into<PathBuf>, pid: u32) -> Self {
        Self {
            root: root.into(),
            pid,
        }
    }

    /// Whether this table can be read at all.
    pub fn available(&self) -> bool {
        self.root.join(self.pid.to_string()).join("stat").is_file()
    }

    fn read_bounded(&self, pid: u32, file: &str) -> Result<Vec<u8>, ProcessTableError> {
        let path = self.root.join(pid.to_string()).join(file);
        let mut buf = Vec::new();
        std::fs::File::open(&path)
            .and_then(|f| f.take(MAX_PROC_READ_SIZE).read_to_end(&mut buf))
            .map_err(|source| ProcessTableError::Read {
                path: path.clone(),
                source,
            })?;
        Ok(buf)
    }

    fn parent_of(&self, pid: u32) -> Result<u32, ProcessTableError> {
        let raw = self.read_bounded(pid, "stat")?;
        let path = self.root.join(pid.to_string()).join("stat");
        parse_stat_ppid(&String::from_utf8_lossy(&raw)).ok_or_else(|| {
            ProcessTableError::Malformed {
                path,
                reason: "no parent pid field".to_string(),
            }
        })
    }

    fn cmdline_of(&self, pid: u32) -> Vec<String> {
        // Kernel threads and exited processes have no readable cmdline.
        match self.read_bounded(pid, "cmdline") {
            Ok(raw) => parse_cmdline(&raw),
            Err(e) => {
                log::debug!("no cmdline for pid {pid}: {e}");
                Vec::new()
            }
        }
    }
}

impl Default for ProcFs {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessTable for ProcFs {
    fn name(&self) -> &'static str {
        "procfs"
    }

    async fn ancestors(&self) -> Result<Vec<ProcessInfo>, ProcessTableError> {
        let mut ancestors = Vec::new();
        let mut pid = self.parent_of(self.pid)?;

        while pid != 0 && ancestors.len() < MAX_ANCESTRY_DEPTH {
            ancestors.push(ProcessInfo {
                pid,
                cmdline: self.cmdline_of(pid),
            });
            if pid == 1 {
                break;
            }
            pid = match self.parent_of(pid) {
                Ok(ppid) => ppid,
                // The parent may exit while we walk; stop at what we have.
                Err(ProcessTableError::Read { .. }) => break,
                Err(e) => return Err(e),
            };
        }

        Ok(ancestors)
    }
}

/// Parent pid from the contents of `/proc/<pid>/stat`.
///
/// The command name in field 2 is parenthesised and may itself contain
/// spaces or parentheses, so fields are counted from the last `)`.
pub fn parse_stat_ppid(stat: &str) -> Option<u32> {
    let (_, rest) = stat.rsplit_once(')')?;
    let mut fields = rest.split_whitespace();
    let _state = fields.next()?;
    fields.next()?.parse().ok()
}

/// Split a NUL-separated `/proc/<pid>/cmdline`.
pub fn parse_cmdline(raw: &[u8]) -> Vec<String> {
    raw.split(|b| *b == 0)
        .filter(|part| !part.is_empty())
        .map(|part| String::from_utf8_lossy(part).to_string())
        .collect()
}

const PSUTIL_SCRIPT: &str = r#"
import json, sys
import psutil
proc = psutil.Process(int(sys.argv[1]))
out = []
for p in proc.parents():
    try:
        cmdline = p.cmdline()
    except psutil.Error:
        cmdline = []
    out.append({"pid": p.pid, "cmdline": cmdline})
print(json.dumps(out))
"#;

/// Ancestry through `psutil` in an external interpreter.
pub struct PsutilTable {
    python: PathBuf,
    pid: u32,
    runner: Arc<dyn CommandRunner>,
}

impl PsutilTable {
    pub fn new(python: impl Into<PathBuf>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            python: python.into(),
            pid: std::process::id(),
            runner,
        }
    }

    /// Whether `python` can import `psutil`.
    pub async fn available(python: &Path, runner: &dyn CommandRunner) -> bool {
        let probe = Invocation::new(python).args(["-c", "import psutil"]);
        matches!(runner.run(&probe).await, Ok(out) if out.success())
    }
}

#[async_trait]
impl ProcessTable for PsutilTable {
    fn name(&self) -> &'static str {
        "psutil"
    }

    async fn ancestors(&self) -> Result<Vec<ProcessInfo>, ProcessTableError> {
        let invocation = Invocation::new(&self.python)
            .args(["-c", PSUTIL_SCRIPT])
            .arg(self.pid.to_string());
        let output = self
            .runner
            .run(&invocation)
            .await
            .map_err(|e| ProcessTableError::Probe(e.to_string()))?;
        if !output.success() {
            return Err(ProcessTableError::Probe(output.stderr.trim().to_string()));
        }
        serde_json::from_str(output.stdout.trim())
            .map_err(|e| ProcessTableError::Probe(format!("unreadable output: {e}")))
    }
}

/// Fixed ancestry, for tests and for callers that already know it.
pub struct StaticTable(pub Vec<ProcessInfo>);

#[async_trait]
impl ProcessTable for StaticTable {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn ancestors(&self) -> Result<Vec<ProcessInfo>, ProcessTableError> {
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_env::runner::testing::ScriptedRunner;
    use kernel_env::CommandOutput;

    fn write_proc(root: &Path, pid: u32, comm: &str, ppid: u32, cmdline: &[&str]) {
        let dir = root.join(pid.to_string());
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("stat"),
            format!("{pid} ({comm}) S {ppid} {pid} {pid} 0 -1 4194560 1207 0 0 0"),
        )
        .unwrap();
        let mut raw = cmdline.join("\0");
        raw.push('\0');
        std::fs::write(dir.join("cmdline"), raw).unwrap();
    }

    #[test]
    fn test_parse_stat_ppid() {
        assert_eq!(parse_stat_ppid("42 (bash) S 7 42 42 0"), Some(7));
        // comm with spaces and parentheses
        assert_eq!(parse_stat_ppid("42 (my (odd) proc) R 9 42 42"), Some(9));
        assert_eq!(parse_stat_ppid("garbage"), None);
    }

    #[test]
    fn test_parse_cmdline() {
        assert_eq!(
            parse_cmdline(b"/usr/bin/python3\0/usr/bin/jupyter-lab\0--no-browser\0"),
            vec!["/usr/bin/python3", "/usr/bin/jupyter-lab", "--no-browser"]
        );
        assert!(parse_cmdline(b"").is_empty());
    }

    #[tokio::test]
    async fn test_procfs_walks_to_init() {
        let root = tempfile::tempdir().unwrap();
        write_proc(root.path(), 300, "kernel-bootstrap", 200, &["kernel-bootstrap"]);
        write_proc(root.path(), 200, "bash", 100, &["/bin/bash"]);
        write_proc(
            root.path(),
            100,
            "python3",
            1,
            &["/opt/py/bin/python3", "/opt/py/bin/jupyter-lab"],
        );
        write_proc(root.path(), 1, "systemd", 0, &["/sbin/init"]);

        let table = ProcFs::with_root(root.path(), 300);
        assert!(table.available());

        let ancestors = table.ancestors().await.unwrap();
        let pids: Vec<u32> = ancestors.iter().map(|p| p.pid).collect();
        assert_eq!(pids, vec![200, 100, 1]);
        assert_eq!(ancestors[1].cmdline[1], "/opt/py/bin/jupyter-lab");
    }

    #[tokio::test]
    async fn test_procfs_stops_when_parent_vanishes() {
        let root = tempfile::tempdir().unwrap();
        write_proc(root.path(), 300, "kernel-bootstrap", 200, &["kernel-bootstrap"]);
        write_proc(root.path(), 200, "bash", 150, &["/bin/bash"]);

        let ancestors = ProcFs::with_root(root.path(), 300).ancestors().await.unwrap();
        assert_eq!(ancestors.len(), 2);
        assert_eq!(ancestors[1].pid, 150);
        assert!(ancestors[1].cmdline.is_empty());
    }

    #[tokio::test]
    async fn test_procfs_unavailable_root() {
        let root = tempfile::tempdir().unwrap();
        let table = ProcFs::with_root(root.path(), 300);
        assert!(!table.available());
        assert!(table.ancestors().await.is_err());
    }

    #[tokio::test]
    async fn test_psutil_table_parses_probe_output() {
        let runner = Arc::new(ScriptedRunner::new(|_| {
            Ok(CommandOutput::exited(0).with_stdout(
                r#"[{"pid": 88, "cmdline": ["python", "/srv/bin/jupyterhub-singleuser"]}, {"pid": 1, "cmdline": []}]"#,
            ))
        }));
        let table = PsutilTable::new("python3", runner.clone());
        let ancestors = table.ancestors().await.unwrap();
        assert_eq!(ancestors.len(), 2);
        assert_eq!(ancestors[0].pid, 88);

        let call = &runner.calls()[0];
        assert_eq!(call.args.last().unwrap(), &std::process::id().to_string());
    }

    #[tokio::test]
    async fn test_psutil_availability() {
        let missing = ScriptedRunner::failing_on("import psutil");
        assert!(!PsutilTable::available(Path::new("python3"), &missing).await);
        let present = ScriptedRunner::succeeding();
        assert!(PsutilTable::available(Path::new("python3"), &present).await);
    }
}
