use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::debug;

use crate::error::Result;

/// Raw HTML of each task's detail view, one file per task, for later auditing.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn create(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(SnapshotStore {
            dir: dir.to_path_buf(),
        })
    }

    pub fn path_for(&self, task_id: &str) -> PathBuf {
        let name: String = task_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.html", name))
    }

    pub fn save(&self, task_id: &str, url: &str, html: &str) -> Result<PathBuf> {
        let path = self.path_for(task_id);
        let content = format!(
            "<!-- URL: {} -->\n<!-- Task ID: {} -->\n<!-- Captured: {} -->\n{}",
            url,
            task_id,
            Utc::now().to_rfc3339(),
            html
        );
        fs::write(&path, content)?;
        debug!("Saved snapshot {}", path.display());
        Ok(path)
    }
}
