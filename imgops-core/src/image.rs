//! File primitives inside images: partition-aware copy and in-place replace.
use anyhow::{Context, Result, anyhow};
use regex::bytes::{NoExpand, Regex};
use std::fs;
use std::path::{Component, PathBuf};

use crate::operation::ResolvedFile;

/// Access to files inside disk images.
///
/// Implementations are called from a blocking thread.
pub trait ImageFs: Send + Sync {
    /// Copies `from` to `to`, creating or overwriting the destination.
    fn copy_file(&self, from: &ResolvedFile, to: &ResolvedFile) -> Result<()>;

    /// Replaces every occurrence of `find` with `replace` inside `file`. The
    /// file itself may hold arbitrary bytes.
    fn replace_in_file(&self, file: &ResolvedFile, find: &str, replace: &str) -> Result<()>;
}

/// Works on images that are available as directory trees, such as an
/// extracted image or one whose partitions are mounted.
///
/// A partition maps to the sub-directory named after it (`1`, `4.1`); a file
/// without a partition lives directly under the image root.
///
/// `burn` streams the image as a single file, so a run using `HostFs` cannot
/// copy into and burn the same image path. Point the file operations at the
/// extracted tree through [`FileRef::image`](crate::operation::FileRef), or
/// plug in an [`ImageFs`] that understands raw images.
#[derive(Clone, Copy, Debug, Default)]
pub struct HostFs;

impl HostFs {
    /// Maps a resolved file onto the host filesystem.
    pub fn host_path(file: &ResolvedFile) -> Result<PathBuf> {
        if !file.image.is_dir() {
            return Err(anyhow!(
                "Image '{}' is not a directory tree; partition access needs a dedicated image backend",
                file.image.display()
            ));
        }

        let mut path = file.image.clone();
        if let Some(partition) = &file.partition {
            path.push(partition.to_string());
        }

        for component in file.path.components() {
            match component {
                Component::Normal(part) => path.push(part),
                Component::RootDir | Component::CurDir => {}
                Component::ParentDir | Component::Prefix(_) => {
                    return Err(anyhow!(
                        "Path '{}' escapes its partition",
                        file.path.display()
                    ));
                }
            }
        }

        Ok(path)
    }
}

impl ImageFs for HostFs {
    fn copy_file(&self, from: &ResolvedFile, to: &ResolvedFile) -> Result<()> {
        let source = Self::host_path(from)?;
        let destination = Self::host_path(to)?;

        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(&source, &destination).with_context(|| {
            format!(
                "Failed to copy {} to {}",
                source.display(),
                destination.display()
            )
        })?;
        Ok(())
    }

    fn replace_in_file(&self, file: &ResolvedFile, find: &str, replace: &str) -> Result<()> {
        let path = Self::host_path(file)?;
        let contents =
            fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))?;

        if let Some(updated) = replace_all(&contents, find, replace)? {
            fs::write(&path, updated)
                .with_context(|| format!("Failed to write {}", path.display()))?;
        }
        Ok(())
    }
}

/// Replaces every non-overlapping occurrence of `find`. Returns `None` when
/// nothing matched.
fn replace_all(haystack: &[u8], find: &str, replace: &str) -> Result<Option<Vec<u8>>> {
    if find.is_empty() {
        return Err(anyhow!("Replace pattern must not be empty"));
    }

    let re = Regex::new(&regex::escape(find))?;

    if !re.is_match(haystack) {
        return Ok(None);
    }
    Ok(Some(re.replace_all(haystack, NoExpand(replace.as_bytes())).into_owned()))
}
