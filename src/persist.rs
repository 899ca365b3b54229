//! Shared temp-file-plus-rename JSON persistence, used by [`crate::learning`]
//! and [`crate::patterns`]. Writes are atomic with respect to a crash between
//! write and rename; a partially written `.tmp` file never becomes visible
//! under the real path.

use std::path::Path;

use anyhow::Context;
use serde::{de::DeserializeOwned, Serialize};
use tokio::io::AsyncWriteExt;

/// Serializes `value` to JSON and atomically replaces the file at `path`:
/// write the sibling `.tmp` file, `fsync` it, then rename over `path`. The
/// `fsync` is what makes the rename crash-safe — without it, a power loss
/// right after the rename can leave `path` pointing at a file whose content
/// never made it past the page cache.
pub async fn save_atomic<T: Serialize + Sync>(path: &Path, value: &T) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating directory {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("tmp");
    let body = serde_json::to_vec_pretty(value).context("serializing persisted state")?;

    let mut file = tokio::fs::File::create(&tmp_path)
        .await
        .with_context(|| format!("creating {}", tmp_path.display()))?;
    file.write_all(&body)
        .await
        .with_context(|| format!("writing {}", tmp_path.display()))?;
    file.sync_all()
        .await
        .with_context(|| format!("fsyncing {}", tmp_path.display()))?;
    drop(file);

    tokio::fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("renaming {} to {}", tmp_path.display(), path.display()))?;
    Ok(())
}

/// Loads JSON from `path`, returning `T::default()` when the file is absent.
/// A present-but-corrupt file is a hard error — it is never silently deleted
/// or ignored.
pub async fn load_or_default<T: DeserializeOwned + Default>(path: &Path) -> anyhow::Result<T> {
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, Default, PartialEq)]
    struct Sample {
        n: u32,
        label: String,
    }

    #[tokio::test]
    async fn save_then_load_roundtrips() {
        let dir = tempdir();
        let path = dir.join("state.json");
        let value = Sample {
            n: 7,
            label: "seven".into(),
        };
        save_atomic(&path, &value).await.unwrap();
        let loaded: Sample = load_or_default(&path).await.unwrap();
        assert_eq!(loaded, value);
        assert!(!path.with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn missing_file_yields_default() {
        let dir = tempdir();
        let path = dir.join("missing.json");
        let loaded: Sample = load_or_default(&path).await.unwrap();
        assert_eq!(loaded, Sample::default());
    }

    #[tokio::test]
    async fn save_then_load_then_save_is_stable() {
        let dir = tempdir();
        let path = dir.join("state.json");
        let value = Sample {
            n: 1,
            label: "a".into(),
        };
        save_atomic(&path, &value).await.unwrap();
        let first = tokio::fs::read(&path).await.unwrap();
        let loaded: Sample = load_or_default(&path).await.unwrap();
        save_atomic(&path, &loaded).await.unwrap();
        let second = tokio::fs::read(&path).await.unwrap();
        assert_eq!(first, second);
    }

    fn tempdir() -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "mcp-orchestrator-test-{}",
            uuid::Uuid::new_v4()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}
