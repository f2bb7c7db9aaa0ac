//! Compiling submitted components with an external bundler
//!
//! [`BuildOrchestrator`] stages an isolated [`Workspace`] per build and hands
//! it to a [`Bundler`]. The default bundler is [`CommandBundler`], a bounded
//! subprocess.

pub mod bundler;
pub mod orchestrator;
pub mod workspace;

pub use bundler::{Bundler, BundlerRun, CommandBundler};
pub use orchestrator::{BuildOrchestrator, BuildOutput};
pub use workspace::{Workspace, WorkspaceLayout};
