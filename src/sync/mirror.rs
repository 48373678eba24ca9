use std::io::ErrorKind;
use std::path::Path;

use anyhow::{Context, Result};

/// Copy `source` over `target`, creating the target's parent directories.
///
/// Returns `false` without touching the target when the source disappeared
/// before it could be read.
pub async fn replicate(source: &Path, target: &Path) -> Result<bool> {
    let meta = match tokio::fs::metadata(source).await {
        Ok(m) => m,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => {
            return Err(e).with_context(|| format!("Cannot stat {}", source.display()));
        }
    };

    if meta.is_dir() {
        tokio::fs::create_dir_all(target)
            .await
            .with_context(|| format!("Failed to create directory: {}", target.display()))?;
        return Ok(true);
    }

    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create parent dir: {}", parent.display()))?;
    }

    match tokio::fs::copy(source, target).await {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound && !source.exists() => Ok(false),
        Err(e) => Err(e).with_context(|| {
            format!("Failed to copy {} to {}", source.display(), target.display())
        }),
    }
}

/// Delete `target` (file or directory tree), then remove its parent if that
/// left it empty. Only one level is pruned, and `target_root` itself is kept.
///
/// Returns whether anything was deleted. A missing target is not an error.
pub async fn remove(target_root: &Path, target: &Path) -> Result<bool> {
    let removed = match tokio::fs::symlink_metadata(target).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(target).await,
        Ok(_) => tokio::fs::remove_file(target).await,
        Err(e) => Err(e),
    };

    let deleted = match removed {
        Ok(()) => true,
        Err(e) if e.kind() == ErrorKind::NotFound => false,
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to remove {}", target.display()));
        }
    };

    if let Some(parent) = target.parent()
        && parent != target_root
        && parent.starts_with(target_root)
    {
        prune_if_empty(parent).await?;
    }

    Ok(deleted)
}

async fn prune_if_empty(dir: &Path) -> Result<()> {
    let mut read_dir = match tokio::fs::read_dir(dir).await {
        Ok(r) => r,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).with_context(|| format!("Failed to read dir: {}", dir.display())),
    };
    if read_dir.next_entry().await?.is_some() {
        return Ok(());
    }

    match tokio::fs::remove_dir(dir).await {
        Ok(()) => {
            tracing::debug!(dir = %dir.display(), "removed empty directory");
            Ok(())
        }
        // Something raced us into the directory, or it is already gone
        Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::DirectoryNotEmpty) => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {}", dir.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn replicate_creates_parents() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src/a.txt");
        std::fs::create_dir_all(src.parent().unwrap()).unwrap();
        std::fs::write(&src, "hi").unwrap();

        let dst = tmp.path().join("dst/deep/er/a.txt");
        assert!(replicate(&src, &dst).await.unwrap());
        assert_eq!(std::fs::read_to_string(&dst).unwrap(), "hi");
    }

    #[tokio::test]
    async fn replicate_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("a.bin");
        std::fs::write(&src, [0u8, 1, 2, 255]).unwrap();
        let dst = tmp.path().join("out/a.bin");

        replicate(&src, &dst).await.unwrap();
        replicate(&src, &dst).await.unwrap();
        assert_eq!(std::fs::read(&dst).unwrap(), std::fs::read(&src).unwrap());
    }

    #[tokio::test]
    async fn replicate_overwrites_existing() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("a.txt");
        let dst = tmp.path().join("b.txt");
        std::fs::write(&src, "bye").unwrap();
        std::fs::write(&dst, "a much longer stale content").unwrap();

        replicate(&src, &dst).await.unwrap();
        assert_eq!(std::fs::read_to_string(&dst).unwrap(), "bye");
    }

    #[tokio::test]
    async fn replicate_vanished_source_is_skipped() {
        let tmp = TempDir::new().unwrap();
        let dst = tmp.path().join("out/a.txt");
        assert!(!replicate(&tmp.path().join("gone"), &dst).await.unwrap());
        assert!(!dst.exists());
    }

    #[tokio::test]
    async fn remove_missing_is_tolerated() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        std::fs::create_dir_all(root.join("sub")).unwrap();
        std::fs::write(root.join("sub/keep.txt"), "x").unwrap();

        assert!(!remove(root, &root.join("sub/gone.txt")).await.unwrap());
        assert!(root.join("sub/keep.txt").exists());
    }

    #[tokio::test]
    async fn remove_prunes_empty_parent() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        std::fs::create_dir_all(root.join("sub")).unwrap();
        std::fs::write(root.join("sub/a.txt"), "x").unwrap();

        assert!(remove(root, &root.join("sub/a.txt")).await.unwrap());
        assert!(!root.join("sub").exists());
        assert!(root.exists());
    }

    #[tokio::test]
    async fn remove_keeps_nonempty_parent() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        std::fs::create_dir_all(root.join("sub")).unwrap();
        std::fs::write(root.join("sub/a.txt"), "x").unwrap();
        std::fs::write(root.join("sub/b.txt"), "y").unwrap();

        remove(root, &root.join("sub/a.txt")).await.unwrap();
        assert!(root.join("sub/b.txt").exists());
    }

    #[tokio::test]
    async fn remove_prunes_single_level_only() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        std::fs::create_dir_all(root.join("a/b")).unwrap();
        std::fs::write(root.join("a/b/f.txt"), "x").unwrap();

        remove(root, &root.join("a/b/f.txt")).await.unwrap();
        assert!(!root.join("a/b").exists());
        assert!(root.join("a").exists());
    }

    #[tokio::test]
    async fn remove_never_prunes_target_root() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("dst");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("only.txt"), "x").unwrap();

        remove(&root, &root.join("only.txt")).await.unwrap();
        assert!(root.exists());
    }

    #[tokio::test]
    async fn remove_directory_tree() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        std::fs::create_dir_all(root.join("d/e")).unwrap();
        std::fs::write(root.join("d/e/f.txt"), "x").unwrap();

        assert!(remove(root, &root.join("d")).await.unwrap());
        assert!(!root.join("d").exists());
    }
}
