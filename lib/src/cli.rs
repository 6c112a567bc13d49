//! # Staging CLI
//!
//! Command line surface for managing the stage of bootable images.

use std::ffi::OsString;
use std::io::Write as _;

use anyhow::Context;
use camino::Utf8PathBuf;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use crate::config::{self, StageConfig};
use crate::error::{Result, StageError};
use crate::reference::ImageReference;
use crate::staging::StagingSession;

/// Perform an upload operation
#[derive(Debug, Parser)]
pub(crate) struct UploadOpts {
    /// The image to stage, as `name[:tag]`.
    pub(crate) image: String,

    /// Overwrite an existing staged image with the given reference.
    #[clap(long)]
    pub(crate) force: bool,
}

/// Re-run hooks for a staged image
#[derive(Debug, Parser)]
pub(crate) struct RunHooksOpts {
    /// The staged image, as `name[:tag]`.
    pub(crate) image: String,
}

/// Perform a list operation
#[derive(Debug, Parser)]
pub(crate) struct ListOpts {
    /// Output in JSON format.
    #[clap(long)]
    pub(crate) json: bool,
}

/// Stage bootable OS images for bare-metal boot.
///
/// Images are extracted from the local content store and published into the
/// staging directory consulted by the bootloader; the boot menu is
/// regenerated afterwards.
#[derive(Debug, Parser)]
#[clap(name = "bootstage", version)]
#[clap(rename_all = "kebab-case")]
pub(crate) struct Cli {
    /// Path to the configuration file.
    #[clap(long, global = true, default_value = config::DEFAULT_CONFIG_PATH)]
    pub(crate) config: Utf8PathBuf,

    #[clap(subcommand)]
    pub(crate) command: Opt,
}

/// The fixed set of subcommands.
#[derive(Debug, clap::Subcommand)]
#[clap(rename_all = "kebab-case")]
pub(crate) enum Opt {
    /// Upload a local image to the stage.
    ///
    /// The image is extracted from the content store, atomically published
    /// into the staging directory, its hooks are run, and the boot menu is
    /// regenerated. A failure after the publish step does not unpublish the
    /// image; retry the remaining steps with `run-hooks` and
    /// `sync-bootloader`.
    Upload(UploadOpts),
    /// Re-run the hooks registered for an already-staged image.
    RunHooks(RunHooksOpts),
    /// Regenerate the bootloader menu from the current staging index.
    SyncBootloader,
    /// List staged images.
    List(ListOpts),
}

/// Require root privileges, as a pre-flight guard before any workflow runs.
pub(crate) fn require_root() -> Result<()> {
    if !rustix::process::getuid().is_root() {
        return Err(StageError::Permission);
    }
    Ok(())
}

fn run_hooks(config: &StageConfig, image: &str) -> Result<()> {
    let reference = ImageReference::parse(image)?;
    let staging = StagingSession::open(config)?;
    if !staging.is_staged(&reference)? {
        return Err(StageError::Other(anyhow::anyhow!(
            "image {reference} is not staged"
        )));
    }
    let results = staging.run_hooks_for_image(&reference)?;
    if results.is_empty() {
        println!("No hooks registered for {reference}");
    }
    for r in results {
        println!("Hook {}: {}", r.name, r.status);
        if !r.output.is_empty() {
            print!("{}", r.output);
        }
    }
    Ok(())
}

fn sync_bootloader(config: &StageConfig) -> Result<()> {
    let staging = StagingSession::open(config)?;
    staging.sync_bootloader()?;
    println!("Bootloader configuration updated");
    Ok(())
}

fn list(config: &StageConfig, json: bool) -> Result<()> {
    let staging = StagingSession::open(config)?;
    let entries = staging.entries()?;
    if json {
        let mut stdout = std::io::stdout().lock();
        serde_json::to_writer_pretty(&mut stdout, &entries)
            .context("Writing JSON")
            .map_err(StageError::Other)?;
        writeln!(stdout).context("Writing JSON").map_err(StageError::Other)?;
    } else if entries.is_empty() {
        println!("No images staged");
    } else {
        for e in &entries {
            println!("{}\t{}", e.reference, e.staged_at.to_rfc3339());
        }
    }
    Ok(())
}

/// Parse the given command line arguments and run the selected command.
pub async fn run_from_iter<I, T>(args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = Cli::parse_from(args);
    require_root()?;
    let config = StageConfig::load(&cli.config)?;
    match cli.command {
        Opt::Upload(opts) => {
            let token = CancellationToken::new();
            // ctrl-c cancels extraction; later steps are short,
            // uncancellable commitments once reached.
            let cancel = token.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("Interrupt received, cancelling extraction");
                    cancel.cancel();
                }
            });
            crate::upload::run(&config, &token, &opts.image, opts.force).await
        }
        Opt::RunHooks(opts) => run_hooks(&config, &opts.image),
        Opt::SyncBootloader => sync_bootloader(&config),
        Opt::List(opts) => list(&config, opts.json),
    }
}
