//! # Staging tool for bootable OS images
//!
//! This crate implements the staged-publication workflow for bare-metal
//! boot: a locally available image is extracted from a content store and
//! atomically published into the staging directory consulted by the
//! bootloader, after which hooks run and the boot menu is regenerated.

// See https://doc.rust-lang.org/rustc/lints/listing/allowed-by-default.html
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![forbid(unused_must_use)]
#![deny(unsafe_code)]
#![deny(clippy::dbg_macro)]
#![deny(clippy::todo)]

pub mod cli;
pub(crate) mod config;
pub mod error;
pub(crate) mod hooks;
pub mod reference;
pub(crate) mod staging;
pub(crate) mod store;
pub(crate) mod upload;
pub(crate) mod workspace;

#[cfg(test)]
pub(crate) mod fixture;
