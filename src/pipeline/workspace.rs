use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::modules::jobs::model::JobId;

const OUTPUT_DIR: &str = "output";
const INPUT_STEM: &str = "input";

/// A job's private scratch directory: `<root>/<job_id>/{input.*, output/}`.
///
/// Removed by [`Workspace::remove`] on the normal path; if the owner unwinds
/// before that, `Drop` removes it instead. Either way it happens once.
#[derive(Debug)]
pub struct Workspace {
    root: PathBuf,
    input: PathBuf,
    output: PathBuf,
    removed: bool,
}

impl Workspace {
    /// Creates a fresh workspace, destroying any leftover from an earlier attempt.
    pub async fn prepare(work_root: &Path, job_id: &JobId, source_key: &str) -> std::io::Result<Self> {
        let root = work_root.join(sanitize_segment(job_id.as_str()));
        if tokio::fs::try_exists(&root).await? {
            warn!("Removing stale workspace {}", root.display());
            tokio::fs::remove_dir_all(&root).await?;
        }

        let output = root.join(OUTPUT_DIR);
        tokio::fs::create_dir_all(&output).await?;

        let input = match Path::new(source_key).extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.chars().all(|c| c.is_ascii_alphanumeric()) => {
                root.join(format!("{}.{}", INPUT_STEM, ext))
            }
            _ => root.join(INPUT_STEM),
        };

        debug!("Prepared workspace {}", root.display());
        Ok(Self {
            root,
            input,
            output,
            removed: false,
        })
    }

    #[cfg(test)]
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn input_path(&self) -> &Path {
        &self.input
    }

    pub fn output_root(&self) -> &Path {
        &self.output
    }

    pub fn rendition_dir(&self, name: &str) -> PathBuf {
        self.output.join(name)
    }

    pub async fn remove(mut self) {
        self.removed = true;
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => debug!("🧹 Removed workspace {}", self.root.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove workspace {}: {}", self.root.display(), e),
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if !self.removed {
            self.removed = true;
            if let Err(e) = std::fs::remove_dir_all(&self.root) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove workspace {}: {}", self.root.display(), e);
                }
            }
        }
    }
}

fn sanitize_segment(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() { "_".to_string() } else { cleaned }
}

/// Every regular file under `root`, as (absolute path, `/`-joined relative path), sorted.
pub async fn collect_files(root: &Path) -> std::io::Result<Vec<(PathBuf, String)>> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file() {
                let relative = path
                    .strip_prefix(root)
                    .unwrap_or(&path)
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                files.push((path, relative));
            }
        }
    }

    files.sort_by(|a, b| a.1.cmp(&b.1));
    Ok(files)
}
