//
// lib.rs
// Dicom-Frames-rs
//
// Exposes the crate's modules and re-exports the CLI entry point for both binary and library consumers.
//
// Thales Matheus Mendonça Santos - November 2025

// Pipeline stages first, then the service and its adapters.
pub mod batch;
pub mod cache;
pub mod cli;
pub mod config;
pub mod dicom_access;
pub mod error;
pub mod metadata;
pub mod models;
pub mod pixels;
pub mod registry;
pub mod render;
pub mod service;
pub mod storage;
pub mod web;
pub mod window;

pub use cli::{run as run_cli, Cli, Commands};
pub use error::{RenderError, Result};
pub use service::RenderService;
