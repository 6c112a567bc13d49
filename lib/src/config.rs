//! # Configuration for bootstage
//!
//! This module handles the TOML configuration file consulted by every
//! command. All fields are optional in the file and merge over built-in
//! defaults.

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use serde::{Deserialize, Serialize};

/// Default path of the configuration file.
pub(crate) const DEFAULT_CONFIG_PATH: &str = "/etc/bootstage/config.toml";

const DEFAULT_STAGING_ROOT: &str = "/var/lib/bootstage/staging";
const DEFAULT_STORE_ROOT: &str = "/var/lib/bootstage/store";
const DEFAULT_HOOKS_DIR: &str = "/etc/bootstage/hooks";
const DEFAULT_BOOT_MENU_PATH: &str = "/boot/bootstage/menu.cfg";

/// The toplevel config file entry.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub(crate) struct StageConfigToplevel {
    pub(crate) stage: Option<StageConfigFragment>,
}

/// The serialized `[stage]` section.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename = "stage", rename_all = "kebab-case", deny_unknown_fields)]
pub(crate) struct StageConfigFragment {
    /// Root of the staging directory tree.
    staging_root: Option<Utf8PathBuf>,
    /// Root of the image content store.
    store_root: Option<Utf8PathBuf>,
    /// Directory holding post-stage hooks.
    hooks_dir: Option<Utf8PathBuf>,
    /// Path of the generated boot menu.
    boot_menu_path: Option<Utf8PathBuf>,
}

/// Fully resolved configuration.
#[derive(Debug, Clone)]
pub(crate) struct StageConfig {
    pub(crate) staging_root: Utf8PathBuf,
    pub(crate) store_root: Utf8PathBuf,
    pub(crate) hooks_dir: Utf8PathBuf,
    pub(crate) boot_menu_path: Utf8PathBuf,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            staging_root: DEFAULT_STAGING_ROOT.into(),
            store_root: DEFAULT_STORE_ROOT.into(),
            hooks_dir: DEFAULT_HOOKS_DIR.into(),
            boot_menu_path: DEFAULT_BOOT_MENU_PATH.into(),
        }
    }
}

impl StageConfig {
    /// Apply any values in `fragment`, overriding existing values in `self`.
    fn apply(&mut self, fragment: StageConfigFragment) {
        fn mergeopt<T>(s: &mut T, o: Option<T>) {
            if let Some(o) = o {
                *s = o;
            }
        }
        mergeopt(&mut self.staging_root, fragment.staging_root);
        mergeopt(&mut self.store_root, fragment.store_root);
        mergeopt(&mut self.hooks_dir, fragment.hooks_dir);
        mergeopt(&mut self.boot_menu_path, fragment.boot_menu_path);
    }

    /// Load the configuration from `path`; a missing file yields the
    /// built-in defaults.
    #[context("Loading configuration")]
    pub(crate) fn load(path: &Utf8Path) -> Result<Self> {
        let mut config = Self::default();
        let buf = match std::fs::read_to_string(path) {
            Ok(buf) => buf,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No configuration at {path}, using defaults");
                return Ok(config);
            }
            Err(e) => return Err(e).with_context(|| format!("Reading {path}")),
        };
        let toplevel: StageConfigToplevel =
            toml::from_str(&buf).with_context(|| format!("Parsing {path}"))?;
        if let Some(fragment) = toplevel.stage {
            tracing::debug!("Merging config from {path}");
            config.apply(fragment);
        }
        Ok(config)
    }

    /// The directory of currently staged entries (`live/<name>/<tag>`).
    pub(crate) fn live_dir(&self) -> Utf8PathBuf {
        self.staging_root.join("live")
    }

    /// Workspace allocation root; kept under the staging root so publishes
    /// are a same-volume rename.
    pub(crate) fn tmp_dir(&self) -> Utf8PathBuf {
        self.staging_root.join("tmp")
    }

    /// Per-reference advisory lock files.
    pub(crate) fn locks_dir(&self) -> Utf8PathBuf {
        self.staging_root.join("locks")
    }
}
