//! The BFE data-plane process.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::ControllerError;

pub const DEFAULT_BINARY: &str = "/usr/local/bin/bfe/bfe";
pub const DEFAULT_CONF_DIR: &str = "/etc/bfe/bfe/conf";

/// How the data plane went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPlaneExit {
    pub status: String,
    pub success: bool,
}

impl From<ExitStatus> for DataPlaneExit {
    fn from(s: ExitStatus) -> Self { Self { status: s.to_string(), success: s.success() } }
}

impl DataPlaneExit {
    fn lost(reason: impl std::fmt::Display) -> Self { Self { status: format!("wait failed: {reason}"), success: false } }
}

/// A running `<binary> -c <conf dir>` in its own process group, sharing our stdout/stderr.
pub struct DataPlane {
    binary: PathBuf,
    pid: Option<u32>,
    exit: watch::Receiver<Option<DataPlaneExit>>,
}

impl DataPlane {
    pub fn spawn(binary: &Path, conf_dir: &Path) -> Result<Self, ControllerError> {
        let mut child = Command::new(binary)
            .arg("-c")
            .arg(conf_dir)
            .process_group(0)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| ControllerError::DataPlaneStart { binary: binary.to_path_buf(), source })?;
        let pid = child.id();
        info!(binary = %binary.display(), conf = %conf_dir.display(), pid = ?pid, "data plane started");

        let (tx, exit) = watch::channel(None);
        tokio::spawn(async move {
            let out = match child.wait().await {
                Ok(status) => DataPlaneExit::from(status),
                Err(e) => {
                    error!(error = %e, "waiting on data plane failed");
                    DataPlaneExit::lost(e)
                }
            };
            tx.send_replace(Some(out));
        });
        Ok(Self { binary: binary.to_path_buf(), pid, exit })
    }

    pub fn pid(&self) -> Option<u32> { self.pid }

    pub fn subscribe(&self) -> watch::Receiver<Option<DataPlaneExit>> { self.exit.clone() }

    pub fn exited(&self) -> Option<DataPlaneExit> { self.exit.borrow().clone() }

    /// Send SIGTERM. A process that already exited is left alone.
    pub fn terminate(&self) -> Result<(), ControllerError> {
        if self.exited().is_some() { return Ok(()); }
        let Some(pid) = self.pid else { return Ok(()) };
        let pid = i32::try_from(pid).map_err(|_| ControllerError::Signal(nix::Error::EINVAL))?;
        info!(binary = %self.binary.display(), pid, "stopping data plane");
        kill(Pid::from_raw(pid), Signal::SIGTERM)?;
        Ok(())
    }

    /// Resolve once the process has exited.
    pub async fn wait(&self) -> DataPlaneExit { wait_exit(self.subscribe()).await }
}

pub(crate) async fn wait_exit(mut rx: watch::Receiver<Option<DataPlaneExit>>) -> DataPlaneExit {
    match rx.wait_for(Option::is_some).await {
        Ok(v) => v.clone().unwrap_or_else(|| DataPlaneExit::lost("no status")),
        Err(_) => {
            warn!("data plane watcher dropped without a status");
            DataPlaneExit::lost("watcher dropped")
        }
    }
}
