//! # The staging index
//!
//! Owns the authoritative on-disk set of bootable images. Mutation happens
//! behind a per-reference advisory lock, and the only step that changes
//! what a reader of `live/` observes is a whole-directory rename: either a
//! plain rename into a fresh slot, or a `RENAME_EXCHANGE` swap with the
//! entry being replaced. Hook execution and boot-menu regeneration are side
//! channels that never touch the index itself.

use std::fmt::Write as _;
use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std;
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;
use chrono::{DateTime, Utc};
use fn_error_context::context;
use rustix::fs::{renameat_with, FlockOperation, RenameFlags, CWD};
use rustix::io::Errno;
use serde::{Deserialize, Serialize};

use crate::config::StageConfig;
use crate::error::StageError;
use crate::hooks::{self, HookResult};
use crate::reference::ImageReference;

/// Name of the record written into every staged directory at publish time.
pub(crate) const STAGE_ENTRY_FILE: &str = ".stage.json";

/// Record of one staged image, stored inside its directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StagingEntry {
    pub(crate) reference: ImageReference,
    pub(crate) staged_at: DateTime<Utc>,
}

/// Advisory cross-process lock scoped to one reference. Publishes of the
/// same reference serialize on it; different references never contend.
/// Released when the guard drops.
#[derive(Debug)]
struct ReferenceLock {
    _file: File,
}

impl ReferenceLock {
    #[context("Locking {reference}")]
    fn acquire(locks_dir: &Utf8Path, reference: &ImageReference) -> Result<Self> {
        let path = locks_dir.join(format!("{reference}.lock"));
        let file = File::create(&path).with_context(|| format!("Creating {path}"))?;
        match rustix::fs::flock(&file, FlockOperation::NonBlockingLockExclusive) {
            Ok(()) => {}
            Err(e) if e == Errno::WOULDBLOCK => {
                println!("Waiting for lock on {reference}...");
                rustix::fs::flock(&file, FlockOperation::LockExclusive)
                    .context("Acquiring lock")?;
            }
            Err(e) => return Err(e).context("Acquiring lock"),
        }
        Ok(Self { _file: file })
    }
}

/// A session against the staging directory tree.
#[derive(Debug)]
pub(crate) struct StagingSession {
    config: StageConfig,
}

impl StagingSession {
    /// Open the staging tree, creating its directories if necessary.
    #[context("Opening staging session")]
    pub(crate) fn open(config: &StageConfig) -> Result<Self> {
        for dir in [config.live_dir(), config.tmp_dir(), config.locks_dir()] {
            std::fs::create_dir_all(&dir).with_context(|| format!("Creating {dir}"))?;
        }
        Ok(Self {
            config: config.clone(),
        })
    }

    fn entry_dir(&self, reference: &ImageReference) -> Utf8PathBuf {
        self.config
            .live_dir()
            .join(&reference.name)
            .join(&reference.tag)
    }

    /// Whether `reference` currently has a staged entry.
    pub(crate) fn is_staged(&self, reference: &ImageReference) -> Result<bool> {
        Ok(self.entry_dir(reference).try_exists()?)
    }

    /// Atomically make the content of `source` the staged entry for
    /// `reference`. On success ownership of `source` has transferred to the
    /// stage: the caller must release its workspace handle and never touch
    /// the original path again.
    pub(crate) fn publish(
        &self,
        source: &Utf8Path,
        reference: &ImageReference,
        force: bool,
    ) -> Result<(), StageError> {
        let publish_err = |source: anyhow::Error| StageError::Publish {
            reference: reference.clone(),
            source,
        };
        let _lock =
            ReferenceLock::acquire(&self.config.locks_dir(), reference).map_err(&publish_err)?;
        let target = self.entry_dir(reference);
        // Re-checked under the lock; the workflow's earlier probe was only
        // an optimization.
        let replace = target
            .try_exists()
            .map_err(|e| publish_err(e.into()))?;
        if replace && !force {
            return Err(StageError::AlreadyStaged {
                reference: reference.clone(),
            });
        }
        self.publish_locked(source, reference, &target, replace)
            .map_err(&publish_err)
    }

    #[context("Publishing {reference}")]
    fn publish_locked(
        &self,
        source: &Utf8Path,
        reference: &ImageReference,
        target: &Utf8Path,
        replace: bool,
    ) -> Result<()> {
        let entry = StagingEntry {
            reference: reference.clone(),
            staged_at: Utc::now(),
        };
        // The record rides inside the tree so the rename below stays the
        // only step that changes what readers observe.
        let source_dir = Dir::open_ambient_dir(source, cap_std::ambient_authority())
            .with_context(|| format!("Opening {source}"))?;
        source_dir
            .atomic_write(STAGE_ENTRY_FILE, serde_json::to_vec_pretty(&entry)?)
            .context("Writing staging entry record")?;
        drop(source_dir);

        // SAFETY: entry dirs always have live/<name> above them
        let parent = target.parent().unwrap();
        std::fs::create_dir_all(parent).with_context(|| format!("Creating {parent}"))?;
        if replace {
            self.replace_entry(source, target)
        } else {
            match std::fs::rename(source, target) {
                Ok(()) => Ok(()),
                Err(e) if is_exdev(&e) => self.publish_cross_volume(source, target, false),
                Err(e) => Err(e).with_context(|| format!("Renaming {source} into stage")),
            }
        }
    }

    /// Swap the new tree with the existing entry in one atomic step, then
    /// clear the old content, which after the exchange sits at `source`.
    fn replace_entry(&self, source: &Utf8Path, target: &Utf8Path) -> Result<()> {
        match renameat_with(
            CWD,
            source.as_std_path(),
            CWD,
            target.as_std_path(),
            RenameFlags::EXCHANGE,
        ) {
            Ok(()) => std::fs::remove_dir_all(source)
                .with_context(|| format!("Removing replaced content at {source}")),
            Err(e) if e == Errno::XDEV => self.publish_cross_volume(source, target, true),
            Err(e) if e == Errno::INVAL || e == Errno::NOSYS => {
                // Filesystem without RENAME_EXCHANGE. Rename the old entry
                // aside, move the new one in, then delete the old tree; the
                // entry is briefly absent but never a mixture.
                tracing::debug!("RENAME_EXCHANGE unsupported, renaming aside");
                let aside = tempfile::Builder::new()
                    .prefix("replaced-")
                    .tempdir_in(self.config.tmp_dir())
                    .context("Allocating aside directory")?;
                let old = aside.path().join("tree");
                std::fs::rename(target, &old).context("Renaming old entry aside")?;
                if let Err(e) = std::fs::rename(source, target) {
                    // Put the old entry back before surfacing the error.
                    if let Err(undo) = std::fs::rename(&old, target) {
                        tracing::error!("Failed to restore previous entry: {undo}");
                    }
                    return Err(e).with_context(|| format!("Renaming {source} into stage"));
                }
                aside.close().context("Removing replaced entry")
            }
            Err(e) => Err(e).with_context(|| format!("Exchanging {source} with {target}")),
        }
    }

    /// A source on a different volume cannot be renamed into the index.
    /// Under `--force` (always the case when replacing) the tree is first
    /// copied into `tmp/` on the staging volume; the final remove-then-
    /// rename still has a window where the entry is absent, which is why
    /// this path is refused without force.
    #[context("Publishing across volumes")]
    fn publish_cross_volume(
        &self,
        source: &Utf8Path,
        target: &Utf8Path,
        force: bool,
    ) -> Result<()> {
        if !force {
            anyhow::bail!(
                "{source} and the staging index are on different volumes; \
                 pass --force to copy, or move the workspace root onto the staging volume"
            );
        }
        let staged_copy = tempfile::Builder::new()
            .prefix("xdev-")
            .tempdir_in(self.config.tmp_dir())
            .context("Allocating staging-volume copy")?;
        let copy_root = staged_copy.path().join("tree");
        copy_dir_recurse(source.as_std_path(), &copy_root)
            .context("Copying onto the staging volume")?;
        std::fs::remove_dir_all(source).with_context(|| format!("Removing {source}"))?;
        if target.try_exists()? {
            std::fs::remove_dir_all(target).with_context(|| format!("Removing {target}"))?;
        }
        std::fs::rename(&copy_root, target.as_std_path())
            .with_context(|| format!("Renaming into {target}"))?;
        staged_copy.close().context("Removing copy scratch dir")
    }

    /// Run the hooks registered for `reference` against its staged
    /// directory. Purely a side channel: the staged entry is unaffected by
    /// any hook outcome.
    pub(crate) fn run_hooks_for_image(
        &self,
        reference: &ImageReference,
    ) -> Result<Vec<HookResult>, StageError> {
        hooks::run_for_image(&self.config.hooks_dir, reference, &self.entry_dir(reference))
    }

    /// Enumerate staged entries, sorted by (name, tag).
    pub(crate) fn entries(&self) -> Result<Vec<StagingEntry>> {
        let mut out = Vec::new();
        for name_ent in self.config.live_dir().read_dir_utf8()? {
            let name_ent = name_ent?;
            if !name_ent.file_type()?.is_dir() {
                continue;
            }
            for tag_ent in name_ent.path().read_dir_utf8()? {
                let tag_ent = tag_ent?;
                if !tag_ent.file_type()?.is_dir() {
                    continue;
                }
                let record = tag_ent.path().join(STAGE_ENTRY_FILE);
                let buf = match std::fs::read_to_string(&record) {
                    Ok(buf) => buf,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        tracing::warn!("Staged directory without {STAGE_ENTRY_FILE}: {record}");
                        continue;
                    }
                    Err(e) => return Err(e).with_context(|| format!("Reading {record}")),
                };
                let entry: StagingEntry =
                    serde_json::from_str(&buf).with_context(|| format!("Parsing {record}"))?;
                out.push(entry);
            }
        }
        out.sort_by(|a, b| {
            (&a.reference.name, &a.reference.tag).cmp(&(&b.reference.name, &b.reference.tag))
        });
        Ok(out)
    }

    /// Regenerate the boot menu from the current staging index.
    ///
    /// The output is a pure function of the index (timestamps come from the
    /// entry records, not the clock), so repeated calls with no intervening
    /// staging change are byte-identical. The menu file is only ever
    /// replaced whole, via write-to-temporary-then-rename.
    pub(crate) fn sync_bootloader(&self) -> Result<(), StageError> {
        self.sync_bootloader_impl()
            .map_err(|source| StageError::BootloaderSync { source })
    }

    #[context("Regenerating boot menu")]
    fn sync_bootloader_impl(&self) -> Result<()> {
        let menu = self.render_menu()?;
        let path = &self.config.boot_menu_path;
        let parent = path
            .parent()
            .with_context(|| format!("boot menu path {path} has no parent"))?;
        std::fs::create_dir_all(parent).with_context(|| format!("Creating {parent}"))?;
        let dir = Dir::open_ambient_dir(parent, cap_std::ambient_authority())
            .with_context(|| format!("Opening {parent}"))?;
        let name = path
            .file_name()
            .with_context(|| format!("boot menu path {path} has no file name"))?;
        dir.atomic_write(name, menu.as_bytes())
            .with_context(|| format!("Writing {path}"))?;
        tracing::debug!("Wrote boot menu to {path}");
        Ok(())
    }

    fn render_menu(&self) -> Result<String> {
        let mut out = String::new();
        writeln!(out, "# Generated by bootstage; do not edit.")?;
        for entry in self.entries()? {
            let dir = self.entry_dir(&entry.reference);
            writeln!(out)?;
            writeln!(out, "# staged {}", entry.staged_at.to_rfc3339())?;
            writeln!(out, "menuentry \"{}\" {{", entry.reference)?;
            match find_boot_artifacts(&dir)? {
                Some((kernel, initrd)) => {
                    writeln!(out, "    linux {kernel}")?;
                    if let Some(initrd) = initrd {
                        writeln!(out, "    initrd {initrd}")?;
                    }
                }
                None => {
                    writeln!(out, "    # no kernel found under {dir}/boot")?;
                }
            }
            writeln!(out, "}}")?;
        }
        Ok(out)
    }
}

/// Locate the kernel (and optionally an initrd) under `<dir>/boot`,
/// picking the lexicographically first candidates so the menu is stable.
fn find_boot_artifacts(dir: &Utf8Path) -> Result<Option<(Utf8PathBuf, Option<Utf8PathBuf>)>> {
    let bootdir = dir.join("boot");
    if !bootdir.try_exists()? {
        return Ok(None);
    }
    let mut names = Vec::new();
    for ent in bootdir.read_dir_utf8()? {
        let ent = ent?;
        if ent.file_type()?.is_file() {
            names.push(ent.file_name().to_owned());
        }
    }
    names.sort_unstable();
    let kernel = names.iter().find(|n| n.starts_with("vmlinuz"));
    let initrd = names.iter().find(|n| n.starts_with("init"));
    Ok(kernel.map(|k| (bootdir.join(k), initrd.map(|i| bootdir.join(i)))))
}

fn is_exdev(e: &std::io::Error) -> bool {
    e.raw_os_error() == Some(Errno::XDEV.raw_os_error())
}

fn copy_dir_recurse(src: &Path, dest: &Path) -> Result<()> {
    std::fs::create_dir(dest).with_context(|| format!("Creating {dest:?}"))?;
    let meta = src.metadata()?;
    std::fs::set_permissions(dest, meta.permissions())?;
    for ent in src.read_dir().with_context(|| format!("Reading {src:?}"))? {
        let ent = ent?;
        let ty = ent.file_type()?;
        let from = ent.path();
        let to = dest.join(ent.file_name());
        if ty.is_dir() {
            copy_dir_recurse(&from, &to)?;
        } else if ty.is_symlink() {
            let link = std::fs::read_link(&from)?;
            std::os::unix::fs::symlink(link, &to)
                .with_context(|| format!("Symlinking {to:?}"))?;
        } else {
            std::fs::copy(&from, &to).with_context(|| format!("Copying {to:?}"))?;
        }
    }
    Ok(())
}
