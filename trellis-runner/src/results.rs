//! Results directory for a run
//!
//! Every run gets its own `results-<timestamp>` directory holding the
//! collected job logs, raw sacct reports and `summary.json`.

use anyhow::{Context, Result};
use chrono::Local;
use std::path::{Path, PathBuf};
use tracing::info;
use trellis_core::domain::run::RunSummary;

pub struct ResultsDir {
    root: PathBuf,
}

impl ResultsDir {
    /// Creates `<base>/results-%Y-%m-%d_%H-%M-%S`
    pub fn create(base: &Path) -> Result<Self> {
        let name = Local::now().format("results-%Y-%m-%d_%H-%M-%S").to_string();
        let root = base.join(name);

        std::fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create results directory {}", root.display()))?;

        info!("Collecting results in {}", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Local path for a collected file, keyed by its base name
    pub fn path_for(&self, remote_path: &str) -> PathBuf {
        let name = Path::new(remote_path)
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| remote_path.into());
        self.root.join(name)
    }

    /// Writes a text file into the run directory
    pub fn write_text(&self, name: &str, content: &str) -> Result<PathBuf> {
        let path = self.root.join(name);
        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path)
    }

    /// Writes `summary.json`
    pub fn write_summary(&self, summary: &RunSummary) -> Result<PathBuf> {
        let json = serde_json::to_string_pretty(summary).context("Failed to serialize summary")?;
        let path = self.write_text("summary.json", &json)?;
        info!("Run summary written to {}", path.display());
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_core::domain::run::CaseResult;

    #[test]
    fn test_create_timestamped_dir() {
        let base = tempfile::tempdir().unwrap();
        let results = ResultsDir::create(base.path()).unwrap();

        assert!(results.root().is_dir());
        let name = results.root().file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("results-"));
        assert_eq!(name.len(), "results-2025-01-31_23-59-59".len());
    }

    #[test]
    fn test_path_for_uses_base_name() {
        let base = tempfile::tempdir().unwrap();
        let results = ResultsDir::create(base.path()).unwrap();

        assert_eq!(
            results.path_for("pytorch_logs/pytorch-util-7.out"),
            results.root().join("pytorch-util-7.out")
        );
        assert_eq!(
            results.path_for("/tmp/test_pytorch/gpu_max_utilization.log"),
            results.root().join("gpu_max_utilization.log")
        );
    }

    #[test]
    fn test_write_summary() {
        let base = tempfile::tempdir().unwrap();
        let results = ResultsDir::create(base.path()).unwrap();

        let mut summary = RunSummary::new();
        summary.record(CaseResult::new("single_node_pytorch", "node-a"));
        let path = results.write_summary(&summary).unwrap();

        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(written["cases"][0]["host"], "node-a");
        assert_eq!(written["cases"][0]["status"], "passed");
    }
}
