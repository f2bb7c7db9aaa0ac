//! Relocatable asset references
//!
//! Bundlers emit root-absolute asset URLs (`/assets/index-abc.js`), which only
//! resolve when the bundle is served from the site root. Rewriting them to
//! path-relative form lets a deployment live under any prefix.
//!
//! Only the two forms below are rewritten. Other absolute references
//! (`url(/assets/..)` in CSS, `<link rel="icon" href="/favicon.svg">`, import
//! maps) are left alone.

use crate::error::{PreviewError, PreviewResult};
use std::path::Path;
use tokio::fs;
use tracing::debug;

/// Absolute reference forms and their relative replacements
pub const ASSET_REWRITES: &[(&str, &str)] = &[
    (r#"src="/assets/"#, r#"src="assets/"#),
    (r#"href="/assets/"#, r#"href="assets/"#),
];

/// Rewrite asset references in a document. Returns the new text and the
/// number of references rewritten.
pub fn rewrite_asset_paths(html: &str) -> (String, usize) {
    let mut text = html.to_string();
    let mut count = 0;
    for (from, to) in ASSET_REWRITES {
        let hits = text.matches(from).count();
        if hits > 0 {
            text = text.replace(from, to);
            count += hits;
        }
    }
    (text, count)
}

/// Patch the HTML entry of a deployment directory in place
pub async fn patch_asset_paths(dir: &Path, html_entry: &str) -> PreviewResult<usize> {
    let path = dir.join(html_entry);
    let html = fs::read_to_string(&path)
        .await
        .map_err(|e| PreviewError::io(format!("reading {}", path.display()), e))?;

    let (patched, count) = rewrite_asset_paths(&html);
    if count > 0 {
        fs::write(&path, patched)
            .await
            .map_err(|e| PreviewError::io(format!("writing {}", path.display()), e))?;
    }

    debug!("Rewrote {} asset references in {}", count, path.display());
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const VITE_INDEX: &str = r#"<!doctype html>
<html lang="en">
  <head>
    <link rel="icon" type="image/svg+xml" href="/vite.svg" />
    <script type="module" crossorigin src="/assets/index-4f2a.js"></script>
    <link rel="modulepreload" crossorigin href="/assets/vendor-91bc.js">
    <link rel="stylesheet" crossorigin href="/assets/index-77de.css">
  </head>
  <body><div id="root"></div></body>
</html>
"#;

    #[test]
    fn rewrites_both_known_forms() {
        let (patched, count) = rewrite_asset_paths(VITE_INDEX);

        assert_eq!(count, 3);
        assert!(!patched.contains(r#"src="/assets/"#));
        assert!(!patched.contains(r#"href="/assets/"#));
        assert!(patched.contains(r#"src="assets/index-4f2a.js""#));
        assert!(patched.contains(r#"href="assets/vendor-91bc.js""#));
        assert!(patched.contains(r#"href="assets/index-77de.css""#));
    }

    #[test]
    fn other_absolute_forms_are_untouched() {
        let html = r#"<link href="/vite.svg"><img src='/assets/a.png'><style>a{background:url(/assets/b.png)}</style>"#;
        let (patched, count) = rewrite_asset_paths(html);

        assert_eq!(count, 0);
        assert_eq!(patched, html);
    }

    #[test]
    fn relative_references_are_stable() {
        let (once, _) = rewrite_asset_paths(VITE_INDEX);
        let (twice, count) = rewrite_asset_paths(&once);
        assert_eq!(count, 0);
        assert_eq!(once, twice);
    }

    #[tokio::test]
    async fn patches_file_in_place() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("index.html"), VITE_INDEX).unwrap();

        let count = patch_asset_paths(temp.path(), "index.html").await.unwrap();

        assert_eq!(count, 3);
        let patched = std::fs::read_to_string(temp.path().join("index.html")).unwrap();
        assert!(patched.contains(r#"href="/vite.svg""#));
        assert!(!patched.contains(r#"="/assets/"#));
    }

    #[tokio::test]
    async fn missing_entry_is_io_error() {
        let temp = TempDir::new().unwrap();
        let err = patch_asset_paths(temp.path(), "index.html")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
