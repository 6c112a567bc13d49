//! # Reading the image content store
//!
//! The content store is produced externally (e.g. by an image build
//! pipeline) and treated as opaque elsewhere; this module resolves
//! references against it and materializes layer stacks onto disk. Layout:
//! `manifests/<name>/<tag>.json` lists layer digests in application order,
//! each a gzip'd tarball at `blobs/sha256/<hex>`. Blobs are verified
//! against their digest before a single entry is unpacked.

use std::io::Read;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use flate2::read::GzDecoder;
use fn_error_context::context;
use openssl::hash::{Hasher, MessageDigest};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::reference::ImageReference;

/// Prefix of OCI whiteout marker entries.
const WHITEOUT_PREFIX: &str = ".wh.";
/// Whiteout marker clearing everything previously below its directory.
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// Manifest describing the ordered layer stack of one image.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ImageManifest {
    pub(crate) layers: Vec<String>,
}

/// A read-only session against the content store.
#[derive(Debug, Clone)]
pub(crate) struct RepositorySession {
    store_root: Utf8PathBuf,
}

impl RepositorySession {
    /// Open the content store rooted at `store_root`.
    #[context("Opening content store")]
    pub(crate) fn open(store_root: &Utf8Path) -> Result<Self> {
        if !store_root.try_exists()? {
            anyhow::bail!("content store {store_root} does not exist");
        }
        Ok(Self {
            store_root: store_root.to_owned(),
        })
    }

    fn manifest_path(&self, reference: &ImageReference) -> Utf8PathBuf {
        self.store_root
            .join("manifests")
            .join(&reference.name)
            .join(format!("{}.json", reference.tag))
    }

    fn blob_path<'a>(&self, digest: &'a str) -> Result<(Utf8PathBuf, &'a str)> {
        let hex = digest
            .strip_prefix("sha256:")
            .with_context(|| format!("unsupported digest {digest:?}"))?;
        Ok((self.store_root.join("blobs/sha256").join(hex), hex))
    }

    #[context("Resolving {reference}")]
    fn manifest(&self, reference: &ImageReference) -> Result<ImageManifest> {
        let path = self.manifest_path(reference);
        let buf = match std::fs::read_to_string(&path) {
            Ok(buf) => buf,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                anyhow::bail!("image {reference} not found in content store")
            }
            Err(e) => return Err(e).with_context(|| format!("Reading {path}")),
        };
        serde_json::from_str(&buf).with_context(|| format!("Parsing {path}"))
    }

    /// Materialize the layer stack of `reference` into `dest`. On failure
    /// `dest` may be left partially populated; cleanup belongs to the
    /// caller's workspace handle, not to this session.
    pub(crate) async fn extract_image(
        &self,
        token: &CancellationToken,
        reference: &ImageReference,
        dest: &Utf8Path,
    ) -> Result<()> {
        let this = self.clone();
        let token = token.clone();
        let reference = reference.clone();
        let dest = dest.to_owned();
        tokio::task::spawn_blocking(move || this.extract_blocking(&token, &reference, &dest))
            .await
            .context("Joining extraction task")?
    }

    #[context("Extracting {reference}")]
    pub(crate) fn extract_blocking(
        &self,
        token: &CancellationToken,
        reference: &ImageReference,
        dest: &Utf8Path,
    ) -> Result<()> {
        let manifest = self.manifest(reference)?;
        tracing::debug!(
            "Extracting {} layers for {reference} into {dest}",
            manifest.layers.len()
        );
        for digest in &manifest.layers {
            if token.is_cancelled() {
                anyhow::bail!("extraction cancelled");
            }
            self.apply_layer(token, digest, dest)
                .with_context(|| format!("Applying layer {digest}"))?;
        }
        Ok(())
    }

    fn apply_layer(
        &self,
        token: &CancellationToken,
        digest: &str,
        dest: &Utf8Path,
    ) -> Result<()> {
        let (path, expected) = self.blob_path(digest)?;
        verify_blob_digest(&path, expected)?;
        let f = std::fs::File::open(&path).with_context(|| format!("Opening {path}"))?;
        let mut archive = tar::Archive::new(GzDecoder::new(std::io::BufReader::new(f)));
        archive.set_preserve_permissions(true);
        for entry in archive.entries()? {
            if token.is_cancelled() {
                anyhow::bail!("extraction cancelled");
            }
            let mut entry = entry?;
            let entry_path = entry.path()?.into_owned();
            let name = entry_path.file_name().and_then(|n| n.to_str());
            let parent = entry_path.parent().unwrap_or(Path::new(""));
            match name {
                Some(OPAQUE_WHITEOUT) => {
                    let dir = safe_join(dest.as_std_path(), parent)
                        .with_context(|| format!("whiteout escapes layer root: {entry_path:?}"))?;
                    clear_directory(&dir)?;
                }
                Some(name) if name.starts_with(WHITEOUT_PREFIX) => {
                    let target = Path::new(&name[WHITEOUT_PREFIX.len()..]);
                    let victim = safe_join(dest.as_std_path(), &parent.join(target))
                        .with_context(|| format!("whiteout escapes layer root: {entry_path:?}"))?;
                    remove_path(&victim)?;
                }
                _ => {
                    // unpack_in refuses entries that would escape dest
                    entry
                        .unpack_in(dest.as_std_path())
                        .with_context(|| format!("Unpacking {entry_path:?}"))?;
                }
            }
        }
        Ok(())
    }
}

/// Join `rel` onto `base`, refusing any non-normal path component.
fn safe_join(base: &Path, rel: &Path) -> Option<PathBuf> {
    let mut out = base.to_path_buf();
    for c in rel.components() {
        match c {
            Component::Normal(p) => out.push(p),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(out)
}

fn clear_directory(dir: &Path) -> Result<()> {
    let entries = match dir.read_dir() {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).with_context(|| format!("Reading {dir:?}")),
    };
    for ent in entries {
        let ent = ent?;
        remove_path(&ent.path())?;
    }
    Ok(())
}

fn remove_path(path: &Path) -> Result<()> {
    let meta = match path.symlink_metadata() {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).with_context(|| format!("Querying {path:?}")),
    };
    if meta.is_dir() {
        std::fs::remove_dir_all(path).with_context(|| format!("Removing {path:?}"))
    } else {
        std::fs::remove_file(path).with_context(|| format!("Removing {path:?}"))
    }
}

#[context("Verifying blob sha256:{expected}")]
fn verify_blob_digest(path: &Utf8Path, expected: &str) -> Result<()> {
    let mut f = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            anyhow::bail!("blob is missing from the content store")
        }
        Err(e) => return Err(e).with_context(|| format!("Opening {path}")),
    };
    let mut hasher = Hasher::new(MessageDigest::sha256())?;
    let mut buf = [0u8; 128 * 1024];
    loop {
        let n = f.read(&mut buf).with_context(|| format!("Reading {path}"))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n])?;
    }
    let found = hex::encode(hasher.finish()?);
    if found != expected {
        anyhow::bail!("blob digest mismatch: expected {expected}, found {found}");
    }
    Ok(())
}
