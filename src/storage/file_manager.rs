use log::{debug, info};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs as async_fs;
use uuid::Uuid;

use crate::core::protocol::validate_name;
use crate::utils::{P2PError, Result};

pub const PARTIAL_SUFFIX: &str = ".part";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFile {
    pub name: String,
    pub size: u64,
}

/// A peer's shared folder plus the files it has published.
///
/// Published files are served from wherever they live on disk; the map
/// goes from published name to local path.
pub struct FileManager {
    shared_dir: PathBuf,
    published: HashMap<String, PathBuf>,
}

impl FileManager {
    pub async fn new(shared_dir: PathBuf) -> Result<Self> {
        async_fs::create_dir_all(&shared_dir)
            .await
            .map_err(|e| P2PError::IoError(format!("Failed to create directory: {}", e)))?;

        info!("Using shared folder {:?}", shared_dir);
        Ok(Self {
            shared_dir,
            published: HashMap::new(),
        })
    }

    pub fn shared_dir(&self) -> &Path {
        &self.shared_dir
    }

    /// Finds `local` as given, falling back to the shared folder, and checks
    /// that it is a regular file we can open.
    async fn resolve_local(&self, local: &Path) -> Result<(PathBuf, u64)> {
        let candidates = [local.to_path_buf(), self.shared_dir.join(local)];

        for candidate in candidates {
            let Ok(metadata) = async_fs::metadata(&candidate).await else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }
            async_fs::File::open(&candidate).await.map_err(|e| {
                P2PError::IoError(format!("Cannot read {}: {}", candidate.display(), e))
            })?;
            return Ok((candidate, metadata.len()));
        }

        Err(P2PError::FileNotFound(local.display().to_string()))
    }

    /// Records `local` under `name`; returns the file's current size.
    pub async fn publish(&mut self, local: &Path, name: &str) -> Result<u64> {
        validate_name(name)?;
        let (path, size) = self.resolve_local(local).await?;

        debug!("Publishing {} as '{}' ({} bytes)", path.display(), name, size);
        self.published.insert(name.to_string(), path);
        Ok(size)
    }

    pub fn unpublish(&mut self, name: &str) -> Option<PathBuf> {
        self.published.remove(name)
    }

    pub fn published_path(&self, name: &str) -> Option<&Path> {
        self.published.get(name).map(PathBuf::as_path)
    }

    pub fn published_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.published.keys().cloned().collect();
        names.sort();
        names
    }

    /// Final location of a downloaded file.
    pub fn download_path(&self, name: &str) -> Result<PathBuf> {
        validate_name(name)?;
        Ok(self.shared_dir.join(name))
    }

    /// Where a download is staged until every byte has arrived. Each call
    /// yields a fresh path, so concurrent fetches of one name never share
    /// a staging file.
    pub fn partial_path(&self, name: &str) -> Result<PathBuf> {
        validate_name(name)?;
        Ok(self.shared_dir.join(format!(
            "{}.{}{}",
            name,
            Uuid::new_v4().simple(),
            PARTIAL_SUFFIX
        )))
    }

    /// Regular files in the shared folder, sorted by name. Staged
    /// downloads are not listed.
    pub async fn list_local(&self) -> Result<Vec<LocalFile>> {
        let mut entries = async_fs::read_dir(&self.shared_dir)
            .await
            .map_err(|e| P2PError::IoError(format!("Failed to read directory: {}", e)))?;

        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| P2PError::IoError(format!("Failed to read directory entry: {}", e)))?
        {
            let metadata = entry.metadata().await?;
            let name = entry.file_name().to_string_lossy().to_string();
            if metadata.is_file() && !name.ends_with(PARTIAL_SUFFIX) {
                files.push(LocalFile {
                    name,
                    size: metadata.len(),
                });
            }
        }

        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }
}
