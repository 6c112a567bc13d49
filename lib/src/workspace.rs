//! Scoped temporary directories for extracted image content.
//!
//! A [`Workspace`] owns its backing directory until the handle is consumed:
//! [`Workspace::destroy`] removes the tree, while [`Workspace::release`]
//! transfers ownership to whoever just took over the path (in practice, the
//! staging index via a rename). Because both consume the handle, cleanup
//! cannot race an ownership transfer. Dropping an unconsumed handle removes
//! the tree as a safety net for early-return paths.

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

/// A uniquely named temporary directory holding not-yet-committed content.
#[derive(Debug)]
pub(crate) struct Workspace {
    path: Utf8PathBuf,
    released: bool,
}

impl Workspace {
    /// Allocate a uniquely named directory under `base`, creating `base`
    /// itself if necessary.
    #[context("Creating workspace under {base}")]
    pub(crate) fn create(base: &Utf8Path) -> Result<Self> {
        std::fs::create_dir_all(base).with_context(|| format!("Creating {base}"))?;
        let dir = tempfile::Builder::new()
            .prefix("upload-")
            .tempdir_in(base)
            .context("Allocating temporary directory")?;
        // Ownership is tracked by this handle from here on, not by tempfile.
        let path = Utf8PathBuf::try_from(dir.into_path())?;
        Ok(Self {
            path,
            released: false,
        })
    }

    pub(crate) fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Give up ownership of the backing directory, returning its path. No
    /// filesystem mutation happens now or later; the caller (or whoever the
    /// directory was renamed to) is responsible for the tree from here on.
    pub(crate) fn release(mut self) -> Utf8PathBuf {
        self.released = true;
        std::mem::take(&mut self.path)
    }

    /// Recursively remove the backing directory.
    pub(crate) fn destroy(mut self) -> Result<()> {
        self.released = true;
        let path = std::mem::take(&mut self.path);
        std::fs::remove_dir_all(&path).with_context(|| format!("Removing {path}"))
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Failed to clean up workspace {}: {e}", self.path);
            }
        }
    }
}
