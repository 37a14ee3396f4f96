//! Installer images: finding them on disk and attaching them as loop devices.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::core::process::ProcessSession;

const LOSETUP: &str = "losetup";

const IMAGE_EXTENSIONS: [&str; 3] = ["iso", "img", "dmg"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallerImage {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
}

/// List installer images directly inside each of `dirs`, sorted by name.
/// Unreadable directories are skipped.
pub fn discover(dirs: &[PathBuf]) -> Vec<InstallerImage> {
    let mut images = Vec::new();

    for dir in dirs {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Skipping installer directory");
                continue;
            }
        };

        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if !is_image(&path) {
                continue;
            }
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }
            let name = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            debug!(image = %path.display(), "Found installer image");
            images.push(InstallerImage {
                name,
                path,
                size: metadata.len(),
            });
        }
    }

    images.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.path.cmp(&b.path)));
    images
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.iter().any(|x| x.eq_ignore_ascii_case(ext)))
}

/// Attach `image` read-only to a free loop device and return its node.
///
/// Blocking; call from a blocking context.
pub fn attach(image: &Path) -> Result<PathBuf> {
    let image = image
        .canonicalize()
        .with_context(|| format!("Installer image not found: {}", image.display()))?;

    let image_arg = image.to_string_lossy();
    let session = ProcessSession::launched(
        LOSETUP,
        ["--find", "--show", "--read-only", "--partscan", &*image_arg],
    )
    .context("Failed to run losetup")?;
    session
        .wait_for_success()
        .map_err(|failure| anyhow!("losetup failed: {}", failure.excerpt(5)))?;

    let device = parse_device(&session.output())?;
    info!(image = %image.display(), device = %device.display(), "Attached installer image");
    Ok(device)
}

/// Detach a loop device created by [`attach`].
pub fn detach(device: &Path) -> Result<()> {
    let device_arg = device.to_string_lossy();
    let session = ProcessSession::launched(LOSETUP, ["--detach", &*device_arg])
        .context("Failed to run losetup")?;
    session
        .wait_for_success()
        .map_err(|failure| anyhow!("losetup --detach failed: {}", failure.excerpt(5)))?;
    info!(device = %device.display(), "Detached installer image");
    Ok(())
}

fn parse_device(output: &str) -> Result<PathBuf> {
    let line = output
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or_else(|| anyhow!("losetup printed no device"))?;
    if !line.starts_with("/dev/") {
        bail!("unexpected losetup output: {}", line);
    }
    Ok(PathBuf::from(line))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_discover_filters_and_sorts() {
        let temp = tempdir().unwrap();
        fs::write(temp.path().join("zeta.iso"), vec![0u8; 16]).unwrap();
        fs::write(temp.path().join("Alpha.IMG"), vec![0u8; 8]).unwrap();
        fs::write(temp.path().join("notes.txt"), b"hello").unwrap();
        fs::create_dir(temp.path().join("folder.iso")).unwrap();

        let images = discover(&[temp.path().to_path_buf()]);

        let names: Vec<&str> = images.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["Alpha", "zeta"]);
        assert_eq!(images[0].size, 8);
        assert_eq!(images[1].size, 16);
    }

    #[test]
    fn test_discover_skips_missing_directories() {
        let images = discover(&[PathBuf::from("/nonexistent/installers")]);
        assert!(images.is_empty());
    }

    #[test]
    fn test_parse_device() {
        assert_eq!(
            parse_device("/dev/loop7\n").unwrap(),
            PathBuf::from("/dev/loop7")
        );
        assert!(parse_device("").is_err());
        assert!(parse_device("losetup: cannot find an unused loop device").is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_attach_missing_image() {
        let result = tokio::task::spawn_blocking(|| attach(Path::new("/nonexistent/image.iso")))
            .await
            .unwrap();
        assert!(result.unwrap_err().to_string().contains("not found"));
    }
}
