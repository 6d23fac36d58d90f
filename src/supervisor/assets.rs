use std::fs::File;
use std::io::{self, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{Result, TewError};

/// Binaries shipped with the node agent and installed before anything runs.
pub trait AssetSource: Send + Sync {
    /// Relative, `/`-separated file names in extraction order.
    fn files(&self) -> io::Result<Vec<String>>;

    fn open(&self, name: &str) -> io::Result<Box<dyn Read + Send>>;
}

/// An empty bundle.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAssets;

impl AssetSource for NoAssets {
    fn files(&self) -> io::Result<Vec<String>> {
        Ok(Vec::new())
    }

    fn open(&self, name: &str) -> io::Result<Box<dyn Read + Send>> {
        Err(io::Error::new(io::ErrorKind::NotFound, name.to_string()))
    }
}

/// A bundle laid out as a directory tree.
#[derive(Debug, Clone)]
pub struct DirectoryAssets {
    root: PathBuf,
}

impl DirectoryAssets {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn walk(&self, dir: &Path, prefix: &str, out: &mut Vec<String>) -> io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let relative = if prefix.is_empty() {
                name
            } else {
                format!("{}/{}", prefix, name)
            };

            if entry.file_type()?.is_dir() {
                self.walk(&entry.path(), &relative, out)?;
            } else {
                out.push(relative);
            }
        }
        Ok(())
    }
}

impl AssetSource for DirectoryAssets {
    fn files(&self) -> io::Result<Vec<String>> {
        let mut files = Vec::new();
        self.walk(&self.root, "", &mut files)?;
        files.sort();
        Ok(files)
    }

    fn open(&self, name: &str) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(File::open(self.root.join(name))?))
    }
}

fn extract_file(source: &dyn AssetSource, name: &str, target: &Path) -> io::Result<()> {
    let destination = target.join(name);
    if let Some(parent) = destination.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut reader = source.open(name)?;
    let mut file = File::create(&destination)?;
    io::copy(&mut reader, &mut file)?;
    file.set_permissions(std::fs::Permissions::from_mode(0o755))?;
    file.sync_all()
}

fn extract_all(source: &dyn AssetSource, target: &Path) -> Result<usize> {
    let files = source.files()?;
    for name in &files {
        extract_file(source, name, target).map_err(|e| TewError::Extraction {
            filename: name.clone(),
            source: e,
        })?;
        tracing::debug!(filename = %name, "Extracted embedded file");
    }
    Ok(files.len())
}

/// Write every bundled file below `target`, executable and synced to disk.
pub async fn extract_embedded_files(source: Arc<dyn AssetSource>, target: PathBuf) -> Result<usize> {
    let count = tokio::task::spawn_blocking(move || extract_all(source.as_ref(), &target))
        .await
        .map_err(|e| TewError::Internal(format!("extraction task failed: {}", e)))??;

    tracing::info!(count, "Extracted embedded files");
    Ok(count)
}
