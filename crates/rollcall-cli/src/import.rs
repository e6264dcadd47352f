//! Bulk registration from a directory laid out as `<dir>/<identity>/<photo>`.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

const PHOTO_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "webp"];

/// One identity folder and the photos found in it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportEntry {
    pub identity: String,
    pub photos: Vec<PathBuf>,
}

/// List identity folders under `dir`, sorted by name, each with its photos
/// sorted by file name. Files directly under `dir` are ignored; folders
/// without photos are returned with an empty list so they can be reported.
pub async fn scan(dir: &Path) -> Result<Vec<ImportEntry>> {
    let mut entries = Vec::new();
    let mut folders = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("reading {}", dir.display()))?;

    while let Some(folder) = folders.next_entry().await? {
        if !folder.file_type().await?.is_dir() {
            continue;
        }
        let Some(identity) = folder.file_name().to_str().map(str::to_owned) else {
            tracing::warn!(path = %folder.path().display(), "skipping folder with non-UTF-8 name");
            continue;
        };
        let photos = photos_in(&folder.path()).await?;
        entries.push(ImportEntry { identity, photos });
    }

    entries.sort_by(|a, b| a.identity.cmp(&b.identity));
    Ok(entries)
}

async fn photos_in(folder: &Path) -> Result<Vec<PathBuf>> {
    let mut photos = Vec::new();
    let mut files = tokio::fs::read_dir(folder)
        .await
        .with_context(|| format!("reading {}", folder.display()))?;

    while let Some(file) = files.next_entry().await? {
        let path = file.path();
        if file.file_type().await?.is_file() && is_photo(&path) {
            photos.push(path);
        }
    }
    photos.sort();
    Ok(photos)
}

fn is_photo(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| PHOTO_EXTENSIONS.iter().any(|p| p.eq_ignore_ascii_case(e)))
}
