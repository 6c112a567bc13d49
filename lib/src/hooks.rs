//! # Post-stage hooks
//!
//! Hooks are executables under the configured hooks directory, run after an
//! image has been published. They are a side channel: a failing hook aborts
//! the remaining hooks and fails the invocation, but never affects the
//! staged entry itself.
//!
//! Layout: `<hooks_dir>/<name>/hook` is the executable; an optional sibling
//! `images` file registers the hook for specific references, one `name` or
//! `name:tag` per line (`*`, or no file at all, registers it for every
//! image). A bare executable file `<hooks_dir>/<name>` is shorthand for a
//! hook registered for everything.

use std::os::unix::fs::PermissionsExt;
use std::process::{Command, ExitStatus, Stdio};

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use crate::error::StageError;
use crate::reference::ImageReference;

/// Informational outcome of one hook run.
#[derive(Debug)]
pub(crate) struct HookResult {
    pub(crate) name: String,
    pub(crate) status: ExitStatus,
    /// Combined stdout and stderr.
    pub(crate) output: String,
}

#[derive(Debug)]
struct Hook {
    name: String,
    exe: Utf8PathBuf,
}

fn is_executable(path: &Utf8Path) -> Result<bool> {
    let meta = path
        .metadata()
        .with_context(|| format!("Querying {path}"))?;
    Ok(meta.permissions().mode() & 0o111 != 0)
}

/// Whether a hook's `images` registration file matches `reference`.
fn registered_for(filter: &str, reference: &ImageReference) -> bool {
    filter
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .any(|line| {
            line == "*" || line == reference.name || line == reference.to_string()
        })
}

/// Discover the hooks registered for `reference`, sorted by hook name so
/// execution order is deterministic.
#[context("Discovering hooks")]
fn discover(hooks_dir: &Utf8Path, reference: &ImageReference) -> Result<Vec<Hook>> {
    if !hooks_dir.try_exists()? {
        return Ok(Vec::new());
    }
    let mut hooks = Vec::new();
    for ent in hooks_dir.read_dir_utf8()? {
        let ent = ent?;
        let name = ent.file_name().to_owned();
        let exe = if ent.file_type()?.is_dir() {
            let exe = ent.path().join("hook");
            if !exe.try_exists()? {
                tracing::warn!("Ignoring hook {name}: no hook executable");
                continue;
            }
            match std::fs::read_to_string(ent.path().join("images")) {
                Ok(filter) => {
                    if !registered_for(&filter, reference) {
                        tracing::debug!("Hook {name} is not registered for {reference}");
                        continue;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e).with_context(|| format!("Reading {name} registration"))
                }
            }
            exe
        } else {
            ent.path().to_owned()
        };
        if !is_executable(&exe)? {
            tracing::debug!("Ignoring non-executable {exe}");
            continue;
        }
        hooks.push(Hook { name, exe });
    }
    hooks.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(hooks)
}

/// Run all hooks registered for `reference` against its staged directory.
/// The first failing hook aborts the remainder.
pub(crate) fn run_for_image(
    hooks_dir: &Utf8Path,
    reference: &ImageReference,
    image_dir: &Utf8Path,
) -> Result<Vec<HookResult>, StageError> {
    let hooks = discover(hooks_dir, reference).map_err(StageError::Other)?;
    let mut results = Vec::new();
    for hook in hooks {
        println!("Running hook {}", hook.name);
        tracing::debug!("exec: {} for {reference}", hook.exe);
        let output = Command::new(&hook.exe)
            .stdin(Stdio::null())
            .current_dir(image_dir)
            .env("BOOTSTAGE_IMAGE_NAME", &reference.name)
            .env("BOOTSTAGE_IMAGE_TAG", &reference.tag)
            .env("BOOTSTAGE_IMAGE_DIR", image_dir.as_str())
            .output()
            .map_err(|e| {
                StageError::Other(
                    anyhow::Error::from(e).context(format!("Spawning hook {}", hook.name)),
                )
            })?;
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        if !output.status.success() {
            return Err(StageError::Hook {
                hook: hook.name,
                status: output.status,
                output: combined,
            });
        }
        results.push(HookResult {
            name: hook.name,
            status: output.status,
            output: combined,
        });
    }
    Ok(results)
}
