//! File staging on a host

use std::path::Path;
use tracing::info;
use trellis_core::shell::quote;

use crate::ClusterClient;
use crate::error::Result;
use crate::exec::{CommandExecutor, FileTransfer};

impl<E: CommandExecutor> ClusterClient<E> {
    /// Create a directory and its parents
    pub async fn make_dir(&self, path: &str) -> Result<()> {
        self.run_checked(&format!("mkdir -p {}", quote(path))).await?;
        Ok(())
    }

    /// Mark a file executable
    pub async fn make_executable(&self, path: &str) -> Result<()> {
        self.run_checked(&format!("chmod +x {}", quote(path))).await?;
        Ok(())
    }

    /// Read a whole file
    pub async fn read_file(&self, path: &str) -> Result<String> {
        self.run_checked(&format!("cat {}", quote(path))).await
    }

    /// Read the first `lines` lines of a file
    pub async fn head(&self, path: &str, lines: usize) -> Result<String> {
        self.run_checked(&format!("head -n {} {}", lines, quote(path)))
            .await
    }

    /// Delete files or directories
    pub async fn remove<S: AsRef<str>>(&self, paths: &[S]) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let targets: Vec<String> = paths.iter().map(|p| quote(p.as_ref())).collect();
        self.run_checked(&format!("sudo rm -rf {}", targets.join(" ")))
            .await?;
        Ok(())
    }
}

impl<E: CommandExecutor + FileTransfer> ClusterClient<E> {
    /// Copy a local file to the host
    pub async fn upload(&self, local: &Path, remote: &str) -> Result<()> {
        self.executor.upload(local, remote).await
    }

    /// Copy a file from the host
    pub async fn download(&self, remote: &str, local: &Path) -> Result<()> {
        self.executor.download(remote, local).await
    }

    /// Copy a script to the host and make it executable
    pub async fn stage_executable(&self, local: &Path, remote: &str) -> Result<()> {
        self.upload(local, remote).await?;
        self.make_executable(remote).await?;

        info!("Staged {} on {} as {}", local.display(), self.target(), remote);
        Ok(())
    }
}
