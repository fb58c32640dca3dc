//! Job-scoped directory holding intermediate, output and merged files.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Removes everything left by a previous run and recreates the directory.
    pub fn reset(&self) -> Result<()> {
        match fs::remove_dir_all(&self.root) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => {
                return Err(e)
                    .with_context(|| format!("unable to clear {}", self.root.display()))
            }
            _ => {}
        }
        fs::create_dir_all(&self.root)
            .with_context(|| format!("unable to create {}", self.root.display()))
    }

    /// File written by map task `map_task` for reduce task `reduce_task`.
    pub fn intermediate_path(&self, job_name: &str, map_task: usize, reduce_task: usize) -> PathBuf {
        self.root
            .join(format!("mrtmp.{}-{}-{}", job_name, map_task, reduce_task))
    }

    /// File written by reduce task `reduce_task`.
    pub fn reduce_output_path(&self, job_name: &str, reduce_task: usize) -> PathBuf {
        self.root
            .join(format!("mrtmp.{}-res-{}", job_name, reduce_task))
    }

    /// Final result of the whole job.
    pub fn merged_output_path(&self, job_name: &str) -> PathBuf {
        self.root.join(format!("mrtmp.{}", job_name))
    }
}

/// Regular files directly inside `dir`, sorted by path.
pub fn input_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for ent in fs::read_dir(dir).with_context(|| format!("unable to list {}", dir.display()))? {
        let ent = ent.with_context(|| format!("unable to list {}", dir.display()))?;
        if ent.file_type()?.is_file() {
            files.push(ent.path());
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_paths_are_deterministic() {
        let ws = Workspace::new("/shared/mr");
        assert_eq!(
            ws.intermediate_path("wc", 2, 7),
            PathBuf::from("/shared/mr/mrtmp.wc-2-7")
        );
        assert_eq!(
            ws.reduce_output_path("wc", 1),
            PathBuf::from("/shared/mr/mrtmp.wc-res-1")
        );
        assert_eq!(ws.merged_output_path("wc"), PathBuf::from("/shared/mr/mrtmp.wc"));
        assert_ne!(ws.intermediate_path("wc", 1, 11), ws.intermediate_path("wc", 11, 1));
    }

    #[test]
    fn test_reset_clears_previous_run() {
        let dir = TempDir::new().unwrap();
        let ws = Workspace::new(dir.path().join("out"));

        ws.reset().unwrap();
        fs::write(ws.merged_output_path("old"), "stale").unwrap();
        ws.reset().unwrap();

        assert!(ws.root().is_dir());
        assert_eq!(fs::read_dir(ws.root()).unwrap().count(), 0);
    }

    #[test]
    fn test_input_files_sorted_and_skip_dirs() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("b.txt"), "b").unwrap();
        fs::write(dir.path().join("a.txt"), "a").unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();

        let files = input_files(dir.path()).unwrap();
        assert_eq!(
            files,
            vec![dir.path().join("a.txt"), dir.path().join("b.txt")]
        );
    }
}
