//! # The upload workflow
//!
//! Orchestrates the end-to-end publication of an image: resolve the
//! reference, short-circuit on "already staged", extract into a workspace,
//! atomically publish, run hooks, regenerate the boot menu.
//!
//! Only the publish step is atomic, because it is the sole irreversible
//! boundary between "not bootable" and "bootable". A successful publish is
//! deliberately never unwound when a later step fails; the hooks and
//! bootloader steps are idempotent and can be retried with
//! `bootstage run-hooks` / `bootstage sync-bootloader` (or another
//! `upload --force`).

use tokio_util::sync::CancellationToken;

use crate::config::StageConfig;
use crate::error::{Result, StageError};
use crate::reference::ImageReference;
use crate::staging::StagingSession;
use crate::store::RepositorySession;
use crate::workspace::Workspace;

/// Run the upload workflow for `image`. Cancellation reaches only the
/// extraction step; everything after it is a short, uncancellable
/// commitment.
pub(crate) async fn run(
    config: &StageConfig,
    token: &CancellationToken,
    image: &str,
    force: bool,
) -> Result<()> {
    let reference = ImageReference::parse(image)?;
    let repo = RepositorySession::open(&config.store_root).map_err(|source| {
        StageError::Extraction {
            reference: reference.clone(),
            source,
        }
    })?;
    let staging = StagingSession::open(config)?;

    // Cheap pre-check; publish re-checks under the per-reference lock.
    if !force && staging.is_staged(&reference)? {
        return Err(StageError::AlreadyStaged { reference });
    }

    let ws = Workspace::create(&config.tmp_dir()).map_err(|source| StageError::Extraction {
        reference: reference.clone(),
        source,
    })?;
    if let Err(source) = repo.extract_image(token, &reference, ws.path()).await {
        discard(ws);
        return Err(StageError::Extraction { reference, source });
    }

    if let Err(e) = staging.publish(ws.path(), &reference, force) {
        discard(ws);
        return Err(e);
    }
    // The publish rename consumed the directory; drop our claim to it.
    let _ = ws.release();

    let results = staging.run_hooks_for_image(&reference)?;
    tracing::debug!("{} hooks succeeded for {reference}", results.len());

    staging.sync_bootloader()?;
    println!("Staged and bootable: {reference}");
    Ok(())
}

fn discard(ws: Workspace) {
    if let Err(e) = ws.destroy() {
        tracing::warn!("Failed to clean up workspace: {e:#}");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::path::Path;

    use anyhow::Result;
    use camino::Utf8Path;

    use super::*;
    use crate::fixture::Fixture;
    use crate::staging::STAGE_ENTRY_FILE;

    fn testref(s: &str) -> ImageReference {
        ImageReference::parse(s).unwrap()
    }

    async fn upload(fixture: &Fixture, image: &str, force: bool) -> Result<(), StageError> {
        run(&fixture.config, &CancellationToken::new(), image, force).await
    }

    /// Snapshot a directory tree as relative path -> content.
    fn snapshot(dir: &Utf8Path) -> Result<BTreeMap<String, Vec<u8>>> {
        fn walk(root: &Path, dir: &Path, out: &mut BTreeMap<String, Vec<u8>>) -> Result<()> {
            for ent in dir.read_dir()? {
                let ent = ent?;
                let path = ent.path();
                if ent.file_type()?.is_dir() {
                    walk(root, &path, out)?;
                } else {
                    let rel = path.strip_prefix(root)?.to_string_lossy().into_owned();
                    out.insert(rel, std::fs::read(&path)?);
                }
            }
            Ok(())
        }
        let mut out = BTreeMap::new();
        walk(dir.as_std_path(), dir.as_std_path(), &mut out)?;
        Ok(out)
    }

    #[tokio::test]
    async fn test_upload_end_to_end() -> Result<()> {
        let fixture = Fixture::new()?;
        let r = testref("myos:v2");
        fixture.add_image(
            &r,
            &[&[
                ("etc/os-release", "NAME=myos\n"),
                ("boot/vmlinuz-6.1.0", "kernel"),
                ("boot/initramfs-6.1.0.img", "initrd"),
            ]],
        )?;
        fixture.add_hook("10-mark", "#!/bin/sh\ntouch hook-ran\n", None)?;

        upload(&fixture, "myos:v2", false).await.unwrap();

        let staged = fixture.config.staging_root.join("live/myos/v2");
        assert_eq!(
            std::fs::read_to_string(staged.join("etc/os-release"))?,
            "NAME=myos\n"
        );
        // Hook ran in the staged directory
        assert!(staged.join("hook-ran").exists());
        // Menu lists the new reference
        let menu = std::fs::read_to_string(&fixture.config.boot_menu_path)?;
        assert!(menu.contains("menuentry \"myos:v2\""), "{menu}");
        // The workspace tmp root holds no leftovers
        let leftovers: Vec<_> = fixture
            .config
            .tmp_dir()
            .read_dir_utf8()?
            .collect::<std::io::Result<Vec<_>>>()?;
        assert!(leftovers.is_empty(), "{leftovers:?}");
        Ok(())
    }

    #[tokio::test]
    async fn test_upload_already_staged_mutates_nothing() -> Result<()> {
        let fixture = Fixture::new()?;
        let r = testref("myos:v2");
        fixture.add_image(&r, &[&[("etc/os-release", "NAME=myos\n")]])?;
        upload(&fixture, "myos:v2", false).await.unwrap();

        let staged = fixture.config.staging_root.join("live/myos/v2");
        let before = snapshot(&staged)?;
        let e = upload(&fixture, "myos:v2", false).await.unwrap_err();
        assert!(matches!(e, StageError::AlreadyStaged { .. }), "{e}");
        assert_eq!(snapshot(&staged)?, before);
        Ok(())
    }

    #[tokio::test]
    async fn test_upload_force_replaces() -> Result<()> {
        let fixture = Fixture::new()?;
        let r = testref("myos:v2");
        fixture.add_image(&r, &[&[("etc/version", "1")]])?;
        upload(&fixture, "myos:v2", false).await.unwrap();

        // Rebuild the image with different content, then force-upload
        std::fs::remove_dir_all(fixture.config.store_root.join("manifests"))?;
        fixture.add_image(&r, &[&[("etc/version", "2"), ("etc/extra", "x")]])?;
        upload(&fixture, "myos:v2", true).await.unwrap();

        let staged = fixture.config.staging_root.join("live/myos/v2");
        assert_eq!(std::fs::read_to_string(staged.join("etc/version"))?, "2");
        assert_eq!(std::fs::read_to_string(staged.join("etc/extra"))?, "x");
        // The regenerated menu still lists the reference
        let menu = std::fs::read_to_string(&fixture.config.boot_menu_path)?;
        assert!(menu.contains("menuentry \"myos:v2\""), "{menu}");
        Ok(())
    }

    #[tokio::test]
    async fn test_upload_unknown_image_cleans_workspace() -> Result<()> {
        let fixture = Fixture::new()?;
        let e = upload(&fixture, "ghost:v1", false).await.unwrap_err();
        assert!(matches!(e, StageError::Extraction { .. }), "{e}");
        assert_eq!(e.exit_code(), 5);
        let leftovers: Vec<_> = fixture
            .config
            .tmp_dir()
            .read_dir_utf8()?
            .collect::<std::io::Result<Vec<_>>>()?;
        assert!(leftovers.is_empty(), "{leftovers:?}");
        Ok(())
    }

    #[tokio::test]
    async fn test_upload_hook_failure_leaves_entry_staged() -> Result<()> {
        let fixture = Fixture::new()?;
        let r = testref("myos:v2");
        fixture.add_image(&r, &[&[("etc/os-release", "NAME=myos\n")]])?;
        fixture.add_hook("10-fail", "#!/bin/sh\nexit 1\n", None)?;

        let e = upload(&fixture, "myos:v2", false).await.unwrap_err();
        assert!(matches!(e, StageError::Hook { .. }), "{e}");
        assert_eq!(e.exit_code(), 7);
        // The publish was not rolled back
        let staged = fixture.config.staging_root.join("live/myos/v2");
        assert!(staged.join(STAGE_ENTRY_FILE).exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_upload_invalid_reference() -> Result<()> {
        let fixture = Fixture::new()?;
        let e = upload(&fixture, "my os", false).await.unwrap_err();
        assert!(matches!(e, StageError::InvalidReference { .. }), "{e}");
        assert_eq!(e.exit_code(), 2);
        Ok(())
    }
}
