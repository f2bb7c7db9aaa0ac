//! Deployments: per-request copies of a build tree

pub mod manager;
pub mod patch;

pub use manager::{Deployment, DeploymentManager};
pub use patch::{patch_asset_paths, rewrite_asset_paths};
