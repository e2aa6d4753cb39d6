//! Filesystem-backed blob store.
//!
//! Object bytes live at `<root>/<bucket>/<key>`; keys with separators
//! become nested directories. Metadata is the meta store's concern; this
//! layer only deals in byte streams, sizes and digests.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::fs::{self, DirBuilder, File};
use tokio::io::AsyncReadExt;

use crate::models::Resource;

const DIR_MODE: u32 = 0o750;
const HASH_CHUNK: usize = 64 * 1024;

/// Store rooted at a configured directory, one subtree per bucket.
#[derive(Clone, Debug)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    /// Open a store at `root`, creating the directory if needed.
    pub async fn open(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let root = root.into();
        mkdir_all(&root).await?;
        Ok(Self { root })
    }

    /// Open a blob for reading.
    pub async fn get(&self, resource: &Resource) -> std::io::Result<File> {
        File::open(self.path(resource)).await
    }

    /// Open a blob for writing, creating parent directories.
    ///
    /// An existing blob is unlinked first so readers holding the old
    /// inode keep a stable stream while the replacement is written.
    pub async fn create(&self, resource: &Resource) -> std::io::Result<File> {
        self.mk_parent(resource).await?;
        match self.delete(resource).await {
            Ok(()) => {}
            Err(err) if Self::is_not_found(&err) => {}
            Err(err) => return Err(err),
        }
        File::create(self.path(resource)).await
    }

    /// Hard-link `src` to `dst` (no byte copying). A self-copy is a
    /// no-op; an existing destination blob is unlinked first.
    pub async fn copy(&self, src: &Resource, dst: &Resource) -> std::io::Result<()> {
        if src == dst {
            return Ok(());
        }
        self.mk_parent(dst).await?;
        match self.delete(dst).await {
            Ok(()) => {}
            Err(err) if Self::is_not_found(&err) => {}
            Err(err) => return Err(err),
        }
        fs::hard_link(self.path(src), self.path(dst)).await
    }

    pub async fn delete(&self, resource: &Resource) -> std::io::Result<()> {
        fs::remove_file(self.path(resource)).await
    }

    /// Buckets have no on-disk representation of their own; directories
    /// appear when the first blob is written.
    pub async fn create_bucket(&self, _bucket: &str) -> std::io::Result<()> {
        Ok(())
    }

    pub async fn delete_bucket(&self, bucket: &str) -> std::io::Result<()> {
        match fs::remove_dir_all(self.root.join(bucket)).await {
            Ok(()) => Ok(()),
            Err(err) if Self::is_not_found(&err) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Byte length of a blob.
    pub async fn info(&self, resource: &Resource) -> std::io::Result<i64> {
        let meta = fs::metadata(self.path(resource)).await?;
        Ok(meta.len() as i64)
    }

    /// Stream-hash a blob, returning the lowercase hex MD5.
    pub async fn md5(&self, resource: &Resource) -> std::io::Result<String> {
        let mut file = self.get(resource).await?;
        let mut digest = md5::Context::new();
        let mut chunk = vec![0u8; HASH_CHUNK];
        loop {
            let n = file.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            digest.consume(&chunk[..n]);
        }
        Ok(format!("{:x}", digest.compute()))
    }

    pub fn is_not_found(err: &std::io::Error) -> bool {
        err.kind() == ErrorKind::NotFound
    }

    fn path(&self, resource: &Resource) -> PathBuf {
        self.root.join(resource.bucket()).join(resource.key())
    }

    async fn mk_parent(&self, resource: &Resource) -> std::io::Result<()> {
        let path = self.path(resource);
        match path.parent() {
            Some(parent) => mkdir_all(parent).await,
            None => Ok(()),
        }
    }
}

async fn mkdir_all(path: &Path) -> std::io::Result<()> {
    let mut builder = DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(DIR_MODE);
    builder.create(path).await
}
