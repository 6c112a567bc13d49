//! Test fixtures: throwaway content stores and staging trees.

use anyhow::{Context, Result};
use camino::Utf8Path;
use flate2::write::GzEncoder;
use flate2::Compression;
use openssl::hash::{Hasher, MessageDigest};

use crate::config::StageConfig;
use crate::reference::ImageReference;

/// A self-contained on-disk environment for one test.
#[derive(Debug)]
pub(crate) struct Fixture {
    _tempdir: tempfile::TempDir,
    pub(crate) config: StageConfig,
}

impl Fixture {
    pub(crate) fn new() -> Result<Self> {
        let tempdir = tempfile::tempdir()?;
        let root = Utf8Path::from_path(tempdir.path())
            .context("tempdir is not UTF-8")?
            .to_owned();
        let config = StageConfig {
            staging_root: root.join("staging"),
            store_root: root.join("store"),
            hooks_dir: root.join("hooks"),
            boot_menu_path: root.join("boot/menu.cfg"),
        };
        std::fs::create_dir_all(&config.staging_root)?;
        std::fs::create_dir_all(&config.store_root)?;
        std::fs::create_dir_all(&config.hooks_dir)?;
        Ok(Self {
            _tempdir: tempdir,
            config,
        })
    }

    /// Store an image whose layers each contain the given (path, content)
    /// files, in application order.
    pub(crate) fn add_image(
        &self,
        reference: &ImageReference,
        layers: &[&[(&str, &str)]],
    ) -> Result<()> {
        let mut digests = Vec::new();
        let blob_dir = self.config.store_root.join("blobs/sha256");
        std::fs::create_dir_all(&blob_dir)?;
        for files in layers {
            let blob = build_layer(files)?;
            let digest = sha256_hex(&blob)?;
            std::fs::write(blob_dir.join(&digest), &blob)?;
            digests.push(format!("sha256:{digest}"));
        }
        let manifest_dir = self.config.store_root.join("manifests").join(&reference.name);
        std::fs::create_dir_all(&manifest_dir)?;
        let manifest = serde_json::json!({ "layers": digests });
        std::fs::write(
            manifest_dir.join(format!("{}.json", reference.tag)),
            serde_json::to_vec_pretty(&manifest)?,
        )?;
        Ok(())
    }

    /// Register a hook; `images` of None applies it to every image.
    pub(crate) fn add_hook(&self, name: &str, script: &str, images: Option<&str>) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;
        let dir = self.config.hooks_dir.join(name);
        std::fs::create_dir_all(&dir)?;
        let exe = dir.join("hook");
        std::fs::write(&exe, script)?;
        std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755))?;
        if let Some(images) = images {
            std::fs::write(dir.join("images"), images)?;
        }
        Ok(())
    }
}

/// Build one gzip'd tar layer from (path, content) pairs.
pub(crate) fn build_layer(files: &[(&str, &str)]) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for (path, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, content.as_bytes())?;
    }
    Ok(builder.into_inner()?.finish()?)
}

fn sha256_hex(data: &[u8]) -> Result<String> {
    let mut hasher = Hasher::new(MessageDigest::sha256())?;
    hasher.update(data)?;
    Ok(hex::encode(hasher.finish()?))
}
