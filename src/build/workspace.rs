//! Per-build isolated workspaces
//!
//! Every build gets its own directory under the workspaces root, seeded from
//! the template project. The component, the application entrypoint and the
//! bundler configuration are generated inside it, so concurrent builds never
//! share a mutable file.

use crate::cache::{ContentDigest, SourceSubmission};
use crate::error::{PreviewError, PreviewResult};
use crate::tree::{self, DirGuard};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

/// Fixed name the entrypoint imports the submitted component by
pub const COMPONENT_NAME: &str = "UserComponent";

/// Component file, relative to the workspace
pub const COMPONENT_FILE: &str = "src/components/UserComponent.jsx";

/// Application entrypoint, relative to the workspace
pub const APP_FILE: &str = "src/App.jsx";

/// Bundler configuration, relative to the workspace
pub const BUNDLER_CONFIG_FILE: &str = "vite.config.js";

/// Shared UI component library bundled into its own `ui` chunk
pub const UI_COMPONENTS_DIR: &str = "src/components/ui";

const SCRIPT_EXTENSIONS: &[&str] = &["js", "jsx", "ts", "tsx"];

/// Where workspaces live and what they are seeded from
#[derive(Debug, Clone)]
pub struct WorkspaceLayout {
    /// Parent of every per-build workspace
    pub workspaces_root: PathBuf,
    /// Template project copied into each workspace
    pub project_root: PathBuf,
    /// Bundler output directory, relative to a workspace
    pub output_dir: PathBuf,
    /// Directories under the project root that must never be copied
    /// (deployments, cache, workspaces)
    pub skip: Vec<PathBuf>,
}

/// A staged build directory owned by exactly one build.
///
/// The directory is removed when the workspace is discarded or dropped.
#[derive(Debug)]
pub struct Workspace {
    id: Uuid,
    digest: ContentDigest,
    dir: DirGuard,
}

impl Workspace {
    /// Create and seed a fresh workspace for `submission`
    pub async fn create(
        layout: &WorkspaceLayout,
        submission: &SourceSubmission,
    ) -> PreviewResult<Self> {
        fs::create_dir_all(&layout.workspaces_root)
            .await
            .map_err(|e| PreviewError::io("creating workspaces directory", e))?;

        let id = Uuid::new_v4();
        let dir = layout
            .workspaces_root
            .join(format!("{}-{}", submission.digest.short(), id));

        let workspace = Self {
            id,
            digest: submission.digest.clone(),
            dir: DirGuard::new(dir, "build workspace"),
        };

        if let Err(e) = workspace.seed(layout, submission).await {
            workspace.discard().await;
            return Err(e);
        }

        debug!("Staged workspace {}", workspace.dir().display());
        Ok(workspace)
    }

    async fn seed(
        &self,
        layout: &WorkspaceLayout,
        submission: &SourceSubmission,
    ) -> PreviewResult<()> {
        let project_root = fs::canonicalize(&layout.project_root).await.map_err(|e| {
            PreviewError::io(
                format!("resolving project root {}", layout.project_root.display()),
                e,
            )
        })?;

        let mut skip = vec![project_root.join(&layout.output_dir)];
        for path in layout
            .skip
            .iter()
            .chain(std::iter::once(&layout.workspaces_root))
        {
            if let Ok(canonical) = fs::canonicalize(path).await {
                skip.push(canonical);
            }
        }

        tree::copy_tree_excluding(&project_root, self.dir(), skip).await?;
        link_dependencies(&project_root, self.dir()).await?;

        self.write(COMPONENT_FILE, &submission.source).await?;
        self.write(APP_FILE, &generate_app_code(COMPONENT_NAME)).await?;
        let ui_modules = ui_modules(&self.dir().join(UI_COMPONENTS_DIR)).await?;
        self.write(
            BUNDLER_CONFIG_FILE,
            &generate_bundler_config(&self.digest, &layout.output_dir, &ui_modules),
        )
        .await?;

        Ok(())
    }

    async fn write(&self, relative: &str, content: &str) -> PreviewResult<()> {
        let path = self.dir().join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| PreviewError::io(format!("creating {}", parent.display()), e))?;
        }
        fs::write(&path, content)
            .await
            .map_err(|e| PreviewError::io(format!("writing {}", path.display()), e))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn digest(&self) -> &ContentDigest {
        &self.digest
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Remove the workspace. Failures are logged, never returned.
    pub async fn discard(self) {
        self.dir.remove().await;
    }
}

/// Make the template's installed dependencies visible inside the workspace
async fn link_dependencies(project_root: &Path, workspace: &Path) -> PreviewResult<()> {
    let modules = project_root.join("node_modules");
    if !modules.is_dir() {
        debug!("Template has no node_modules, skipping dependency link");
        return Ok(());
    }

    let link = workspace.join("node_modules");

    #[cfg(unix)]
    let result = fs::symlink(&modules, &link).await;
    #[cfg(windows)]
    let result = fs::symlink_dir(&modules, &link).await;
    #[cfg(not(any(unix, windows)))]
    let result: std::io::Result<()> = Err(std::io::Error::other("symlinks unsupported"));

    result.map_err(|e| PreviewError::io(format!("linking {}", link.display()), e))
}

/// Import specifiers of the UI components present in `dir`, sorted
async fn ui_modules(dir: &Path) -> PreviewResult<Vec<String>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
        Err(e) => return Err(PreviewError::io(format!("reading {}", dir.display()), e)),
    };

    let mut modules = vec![];
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| PreviewError::io(format!("reading {}", dir.display()), e))?
    {
        let path = entry.path();
        let is_script = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| SCRIPT_EXTENSIONS.contains(&ext));
        if let (true, Some(stem)) = (is_script, path.file_stem().and_then(|s| s.to_str())) {
            modules.push(format!("@/components/ui/{stem}"));
        }
    }

    modules.sort();
    modules.dedup();
    Ok(modules)
}

/// Generate the application entrypoint that renders the staged component
pub fn generate_app_code(component_name: &str) -> String {
    format!(
        r#"import {component_name} from './components/{component_name}.jsx'

function App() {{
    return (
        <div className="w-screen h-screen">
            <main className="w-full h-full bg-white">
                <{component_name} />
            </main>
        </div>
    )
}}

export default App
"#
    )
}

/// Generate the bundler configuration.
///
/// The digest is the only per-build value; it busts the bundler's own
/// caching and carries no application meaning. `ui_modules` become the
/// `ui` chunk when non-empty.
pub fn generate_bundler_config(
    digest: &ContentDigest,
    output_dir: &Path,
    ui_modules: &[String],
) -> String {
    let out_dir = output_dir.display().to_string().replace('\\', "/");
    let ui_chunk = if ui_modules.is_empty() {
        String::new()
    } else {
        let list: Vec<String> = ui_modules
            .iter()
            .map(|m| format!("                        '{m}',\n"))
            .collect();
        format!("                    ui: [\n{}                    ],\n", list.concat())
    };
    format!(
        r#"// build key: {digest}
import {{ defineConfig }} from 'vite';
import react from '@vitejs/plugin-react';
import path from 'path';

export default defineConfig({{
    plugins: [react()],
    build: {{
        outDir: '{out_dir}',
        emptyOutDir: true,
        cache: true,
        minify: 'esbuild',
        sourcemap: false,
        target: 'esnext',
        reportCompressedSize: false,
        chunkSizeWarningLimit: 1000,
        rollupOptions: {{
            output: {{
                manualChunks: {{
                    vendor: ['react', 'react-dom'],
{ui_chunk}                }},
            }},
        }},
    }},
    resolve: {{
        alias: {{
            '@': path.resolve(__dirname, './src'),
        }},
    }},
    define: {{
        'process.env': {{}},
        __PREVIEW_BUILD_KEY__: JSON.stringify('{digest}'),
    }},
}});
"#
    )
}
