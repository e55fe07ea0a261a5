//! Mounter backed by an external `imount`-style helper program.
//!
//! Protocol:
//! - `<program> mount --json --mountdir <root> [--disk-mounter qemu-nbd] [--keys-stdin] <path>...`
//!   prints a [`ParsedImage`] JSON document on stdout. Keys, when present, are
//!   written to stdin as `{"<volume index>": "<encoded key>"}` so they never
//!   appear on the command line.
//! - `<program> unmount --json [--lazy]` reads a [`MountHandle`] from stdin.
//! - `<program> --check` prints one `INSTALLED <tool>` / `MISSING <tool>` line
//!   per helper tool.

use crate::error::{Result, TackError};
use crate::mounter::{DiskMounter, MountBackend, MountHandle, MountRequest};
use crate::types::ParsedImage;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

/// Helper-program mounter.
pub struct ImountMounter {
    program: PathBuf,
    extra_args: Vec<String>,
}

impl ImountMounter {
    pub fn new(program: impl Into<PathBuf>, extra_args: Vec<String>) -> Self {
        Self { program: program.into(), extra_args }
    }

    fn failed(&self, reason: impl Into<String>) -> TackError {
        TackError::MounterFailed { mounter: self.name().to_string(), reason: reason.into() }
    }

    /// Run the helper with optional stdin payload and return stdout.
    async fn run(&self, args: &[String], stdin: Option<Vec<u8>>) -> Result<Vec<u8>> {
        debug!(program = %self.program.display(), ?args, "Running mount helper");

        let mut child = Command::new(&self.program)
            .args(&self.extra_args)
            .args(args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.failed(format!("Failed to spawn {}: {}", self.program.display(), e)))?;

        if let Some(payload) = stdin {
            let mut pipe =
                child.stdin.take().ok_or_else(|| self.failed("Helper stdin unavailable"))?;
            pipe.write_all(&payload)
                .await
                .map_err(|e| self.failed(format!("Failed to write to helper: {}", e)))?;
            drop(pipe);
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| self.failed(format!("Failed to wait for helper: {}", e)))?;

        if !output.status.success() {
            return Err(self.failed(String::from_utf8_lossy(&output.stderr).trim().to_string()));
        }

        Ok(output.stdout)
    }
}

#[async_trait]
impl DiskMounter for ImountMounter {
    #[instrument(skip(self, request), fields(backend = %request.backend))]
    async fn attempt_mount(&self, request: &MountRequest) -> Result<ParsedImage> {
        let mut args = vec![
            "mount".to_string(),
            "--json".to_string(),
            "--mountdir".to_string(),
            request.mount_root.to_string_lossy().to_string(),
        ];

        if request.backend == MountBackend::QemuNbd {
            args.push("--disk-mounter".to_string());
            args.push("qemu-nbd".to_string());
        }

        let stdin = match &request.credentials {
            Some(creds) if !creds.is_empty() => {
                args.push("--keys-stdin".to_string());
                let keys: BTreeMap<String, &str> =
                    creds.iter().map(|(i, k)| (i.to_string(), k)).collect();
                Some(serde_json::to_vec(&keys).map_err(|e| self.failed(e.to_string()))?)
            }
            _ => None,
        };

        args.extend(request.paths.iter().map(|p| p.to_string_lossy().to_string()));

        let stdout = self.run(&args, stdin).await?;
        let parsed: ParsedImage = serde_json::from_slice(&stdout)
            .map_err(|e| self.failed(format!("Invalid helper output: {}", e)))?;

        info!(disks = parsed.disks.len(), "Mount helper finished");
        Ok(parsed)
    }

    #[instrument(skip(self, handle))]
    async fn release(&self, handle: &MountHandle, allow_lazy: bool) -> Result<()> {
        let mut args = vec!["unmount".to_string(), "--json".to_string()];
        if allow_lazy {
            args.push("--lazy".to_string());
        }

        let payload = handle.encode()?;
        if let Err(e) = self.run(&args, Some(payload)).await {
            warn!("Mount helper failed to release {:?}: {}", handle.paths, e);
            return Err(e);
        }

        Ok(())
    }

    #[instrument(skip(self))]
    async fn supported_tools(&self) -> Result<BTreeMap<String, bool>> {
        let stdout = self.run(&["--check".to_string()], None).await?;
        Ok(parse_check_output(&String::from_utf8_lossy(&stdout)))
    }

    fn name(&self) -> &str {
        "imount"
    }
}

/// Parse `INSTALLED <tool>` / `MISSING <tool>` lines; anything else is ignored.
fn parse_check_output(output: &str) -> BTreeMap<String, bool> {
    let mut tools = BTreeMap::new();

    for line in output.lines() {
        let mut words = line.split_whitespace();
        let installed = match words.next() {
            Some("INSTALLED") => true,
            Some("MISSING") => false,
            _ => continue,
        };
        if let Some(tool) = words.next() {
            tools.insert(tool.to_string(), installed);
        }
    }

    tools
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_check_output() {
        let output = "\
-- Mounting tools --
INSTALLED xmount          needed for several types of disk images
MISSING   qemu-nbd        needed for QCOW2 images
INSTALLED ewfmount
 random chatter
MISSING
";
        let tools = parse_check_output(output);
        assert_eq!(tools.len(), 3);
        assert_eq!(tools.get("xmount"), Some(&true));
        assert_eq!(tools.get("qemu-nbd"), Some(&false));
        assert_eq!(tools.get("ewfmount"), Some(&true));
    }

    #[tokio::test]
    async fn test_missing_program_is_mounter_failure() {
        let mounter = ImountMounter::new("/nonexistent/imount-helper", vec![]);
        let err = mounter.supported_tools().await.unwrap_err();
        assert!(matches!(err, TackError::MounterFailed { .. }));
    }

    fn unmounted_handle() -> MountHandle {
        MountHandle {
            version: crate::mounter::HANDLE_VERSION,
            paths: vec!["/images/a.dd".into()],
            backend: MountBackend::Auto,
            mount_root: "/mnt".into(),
            disk_mountpoint: None,
            volume_mountpoints: vec![],
        }
    }

    #[tokio::test]
    async fn test_release_without_mountpoints_still_runs_helper() {
        let mounter = ImountMounter::new("/nonexistent/imount-helper", vec![]);
        let err = mounter.release(&unmounted_handle(), true).await.unwrap_err();
        assert!(matches!(err, TackError::MounterFailed { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_release_passes_handle_on_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("invocation");
        let script = format!(r#"printf '%s ' "$0" "$@" > '{0}'; cat >> '{0}'"#, out.display());
        let mounter = ImountMounter::new("/bin/sh", vec!["-c".to_string(), script]);

        mounter.release(&unmounted_handle(), true).await.unwrap();

        let invocation = std::fs::read_to_string(&out).unwrap();
        assert!(invocation.starts_with("unmount --json --lazy "));
        assert!(invocation.contains(r#""paths":["/images/a.dd"]"#));
        assert!(invocation.contains(r#""version":1"#));
    }
}
