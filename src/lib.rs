//! previewd - component preview build service
//!
//! Compiles submitted UI component source into static bundles, reuses
//! identical builds through a content-addressed cache, and gives every
//! request its own relocatable deployment directory.

pub mod audit;
pub mod build;
pub mod cache;
pub mod cli;
pub mod config;
pub mod deploy;
pub mod error;
pub mod pipeline;
pub mod server;
pub mod tree;

pub use error::{PreviewError, PreviewResult};
