//! Filesystem access used by indexing and sweeping.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use crate::error::{IndexError, Result};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub trait FileSystem: Send + Sync {
    /// Regular files under `root`, honoring ignore rules, in a stable order.
    fn list_files(&self, root: &Path) -> BoxFuture<'_, Result<Vec<PathBuf>>>;

    fn read(&self, path: &Path) -> BoxFuture<'_, Result<Vec<u8>>>;

    fn exists(&self, path: &Path) -> BoxFuture<'_, Result<bool>>;
}

/// The real filesystem. Hidden files and git-ignored paths are skipped.
#[derive(Debug, Clone, Default)]
pub struct LocalFileSystem;

impl FileSystem for LocalFileSystem {
    fn list_files(&self, root: &Path) -> BoxFuture<'_, Result<Vec<PathBuf>>> {
        let root = root.to_path_buf();
        Box::pin(async move {
            let files = tokio::task::spawn_blocking(move || {
                let mut files: Vec<PathBuf> = ignore::WalkBuilder::new(&root)
                    .hidden(true)
                    .git_ignore(true)
                    .build()
                    .flatten()
                    .filter(|e| e.file_type().is_some_and(|ft| ft.is_file()))
                    .map(ignore::DirEntry::into_path)
                    .collect();
                files.sort();
                files
            })
            .await
            .map_err(IndexError::Join)?;
            Ok(files)
        })
    }

    fn read(&self, path: &Path) -> BoxFuture<'_, Result<Vec<u8>>> {
        let path = path.to_path_buf();
        Box::pin(async move { Ok(tokio::fs::read(&path).await?) })
    }

    fn exists(&self, path: &Path) -> BoxFuture<'_, Result<bool>> {
        let path = path.to_path_buf();
        Box::pin(async move { Ok(tokio::fs::try_exists(&path).await?) })
    }
}
