//! Integration tests for previewd

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use std::path::Path;
    use tempfile::TempDir;

    fn previewd() -> Command {
        cargo_bin_cmd!("previewd")
    }

    /// Config file whose paths all live under `dir`
    fn write_config(dir: &Path) -> std::path::PathBuf {
        let path = dir.join("config.toml");
        std::fs::write(
            &path,
            format!(
                r#"[paths]
project_root = "{root}/project"
deployments = "{root}/deployments"
cache = "{root}/cache"
workspaces = "{root}/workspaces"
"#,
                root = dir.display()
            ),
        )
        .unwrap();
        path
    }

    #[test]
    fn help_displays() {
        previewd()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("build and deploy UI component previews"));
    }

    #[test]
    fn version_displays() {
        previewd()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("previewd"));
    }

    #[test]
    fn config_path() {
        previewd()
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("config.toml"));
    }

    #[test]
    fn config_show() {
        let temp = TempDir::new().unwrap();
        previewd()
            .args(["-c"])
            .arg(temp.path().join("missing.toml"))
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[bundler]"))
            .stdout(predicate::str::contains("retention_days = 7"));
    }

    #[test]
    fn config_init_writes_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested/config.toml");

        previewd()
            .arg("-c")
            .arg(&path)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration initialized"));

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("[cache]"));
    }

    #[test]
    fn invalid_config_reports_hint() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        std::fs::write(&path, "[cache]\nretention_days = \"soon\"\n").unwrap();

        previewd()
            .arg("-c")
            .arg(&path)
            .args(["cache", "list"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid configuration"))
            .stderr(predicate::str::contains("previewd config show"));
    }

    #[test]
    fn cache_list_empty() {
        let temp = TempDir::new().unwrap();
        let config = write_config(temp.path());

        previewd()
            .arg("-c")
            .arg(&config)
            .args(["cache", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No cached builds"));
    }

    #[test]
    fn cache_list_json() {
        let temp = TempDir::new().unwrap();
        let config = write_config(temp.path());
        let digest = "a".repeat(64);
        std::fs::create_dir_all(temp.path().join("cache").join(&digest)).unwrap();
        std::fs::write(
            temp.path().join("cache").join(&digest).join("index.html"),
            "<p></p>",
        )
        .unwrap();

        let output = previewd()
            .arg("-c")
            .arg(&config)
            .args(["cache", "list", "--format", "json"])
            .output()
            .unwrap();

        assert!(output.status.success());
        let listed: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        assert_eq!(listed[0]["digest"], digest.as_str());
        assert_eq!(listed[0]["size_bytes"], 7);
    }

    #[test]
    fn cache_gc_dry_run_keeps_entries() {
        let temp = TempDir::new().unwrap();
        let config = write_config(temp.path());
        let entry = temp.path().join("cache").join("b".repeat(64));
        std::fs::create_dir_all(&entry).unwrap();
        let old = filetime::FileTime::from_unix_time(1_000_000_000, 0);
        filetime::set_file_mtime(&entry, old).unwrap();

        previewd()
            .arg("-c")
            .arg(&config)
            .args(["cache", "gc", "--dry-run"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Found 1 cached build(s)"))
            .stdout(predicate::str::contains("Dry run"));
        assert!(entry.exists());

        previewd()
            .arg("-c")
            .arg(&config)
            .args(["cache", "gc"])
            .assert()
            .success()
            .stdout(predicate::str::contains("evicted 1 build(s)"));
        assert!(!entry.exists());
    }

    #[test]
    fn cache_clear_with_yes() {
        let temp = TempDir::new().unwrap();
        let config = write_config(temp.path());
        let entry = temp.path().join("cache").join("c".repeat(64));
        std::fs::create_dir_all(&entry).unwrap();

        previewd()
            .arg("-c")
            .arg(&config)
            .args(["cache", "clear", "--yes"])
            .assert()
            .success()
            .stdout(predicate::str::contains("cleared 1 build(s)"));
        assert!(!entry.exists());
    }

    #[test]
    fn serve_help() {
        previewd()
            .args(["serve", "--help"])
            .assert()
            .success()
            .stdout(predicate::str::contains("--bind"));
    }
}

mod pipeline_tests {
    use async_trait::async_trait;
    use hyper::{Body, Client, Method, Request, StatusCode};
    use previewd::audit::AuditLog;
    use previewd::build::{Bundler, BundlerRun};
    use previewd::config::Config;
    use previewd::error::PreviewResult;
    use previewd::pipeline::BuildPipeline;
    use previewd::server::PreviewServer;
    use std::net::SocketAddr;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    /// Emits a vite-shaped dist/ whose script is the submitted component
    struct EchoBundler {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Bundler for EchoBundler {
        async fn bundle(
            &self,
            workspace: &Path,
            _cancel: CancellationToken,
        ) -> PreviewResult<BundlerRun> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;

            let source =
                std::fs::read_to_string(workspace.join("src/components/UserComponent.jsx"))
                    .unwrap();
            let dist = workspace.join("dist");
            std::fs::create_dir_all(dist.join("assets")).unwrap();
            std::fs::write(dist.join("assets/index.js"), source).unwrap();
            std::fs::write(
                dist.join("index.html"),
                r#"<html><head><script type="module" src="/assets/index.js"></script><link rel="stylesheet" href="/assets/index.css"></head></html>"#,
            )
            .unwrap();

            Ok(BundlerRun {
                exit_code: Some(0),
                stdout: "built".to_string(),
                stderr: String::new(),
                truncated: false,
                timed_out: false,
                cancelled: false,
                elapsed: Duration::from_millis(20),
            })
        }

        fn name(&self) -> String {
            "echo".to_string()
        }
    }

    struct Harness {
        temp: TempDir,
        addr: SocketAddr,
        bundler: Arc<EchoBundler>,
        _token: CancellationToken,
    }

    impl Harness {
        async fn start() -> Self {
            let temp = TempDir::new().unwrap();
            std::fs::create_dir_all(temp.path().join("project/src")).unwrap();
            std::fs::write(temp.path().join("project/package.json"), "{}").unwrap();

            let mut config = Config::default();
            config.paths.project_root = temp.path().join("project");
            config.paths.deployments = temp.path().join("deployments");
            config.paths.cache = temp.path().join("cache");
            config.paths.workspaces = temp.path().join("workspaces");

            let bundler = Arc::new(EchoBundler {
                calls: AtomicUsize::new(0),
            });
            let pipeline = Arc::new(BuildPipeline::new(
                &config,
                bundler.clone(),
                Arc::new(AuditLog::disabled()),
            ));

            let server = PreviewServer::bind("127.0.0.1:0", pipeline, 1024 * 1024).unwrap();
            let addr = server.local_addr().unwrap();
            let token = CancellationToken::new();
            tokio::spawn(server.run(token.clone()));

            Self {
                temp,
                addr,
                bundler,
                _token: token,
            }
        }

        async fn post(&self, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
            let req = Request::builder()
                .method(Method::POST)
                .uri(format!("http://{}/build", self.addr))
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap();
            let res = Client::new().request(req).await.unwrap();
            let status = res.status();
            let bytes = hyper::body::to_bytes(res.into_body()).await.unwrap();
            (status, serde_json::from_slice(&bytes).unwrap())
        }

        fn deployment(&self, id: &str) -> std::path::PathBuf {
            self.temp.path().join("deployments").join(id)
        }

        fn count(&self, dir: &str) -> usize {
            std::fs::read_dir(self.temp.path().join(dir))
                .map(|d| d.count())
                .unwrap_or(0)
        }
    }

    #[tokio::test]
    async fn build_then_cache_hit() {
        let harness = Harness::start().await;
        let code = serde_json::json!({"componentCode": "export default () => <h1>Hi</h1>"});

        let (status, first) = harness.post(code.clone()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["success"], true);
        assert_eq!(first["fromCache"], false);
        let id = first["deploymentId"].as_str().unwrap();
        assert_eq!(first["deploymentUrl"], format!("/d/{id}"));
        assert_eq!(first["downloadUrl"], format!("/download/{id}"));

        let (status, second) = harness.post(code).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(second["fromCache"], true);
        assert_ne!(second["deploymentId"], first["deploymentId"]);
        assert_eq!(harness.bundler.calls.load(Ordering::SeqCst), 1);

        let first_dir = harness.deployment(id);
        let second_dir = harness.deployment(second["deploymentId"].as_str().unwrap());
        assert_eq!(
            std::fs::read(first_dir.join("index.html")).unwrap(),
            std::fs::read(second_dir.join("index.html")).unwrap()
        );
        assert_eq!(
            std::fs::read(first_dir.join("assets/index.js")).unwrap(),
            std::fs::read(second_dir.join("assets/index.js")).unwrap()
        );

        assert_eq!(harness.count("cache"), 1);
        assert_eq!(harness.count("workspaces"), 0);
    }

    #[tokio::test]
    async fn damaged_cache_entry_is_repaired_by_rebuild() {
        let harness = Harness::start().await;
        let code = serde_json::json!({"componentCode": "export const Damaged = 1"});

        let (_, first) = harness.post(code.clone()).await;
        assert_eq!(first["fromCache"], false);

        let entry = std::fs::read_dir(harness.temp.path().join("cache"))
            .unwrap()
            .next()
            .unwrap()
            .unwrap()
            .path();
        std::fs::remove_file(entry.join("index.html")).unwrap();

        let mut from_cache = vec![];
        for _ in 0..3 {
            let (status, body) = harness.post(code.clone()).await;
            assert_eq!(status, StatusCode::OK);
            from_cache.push(body["fromCache"].as_bool().unwrap());
        }

        assert_eq!(from_cache, [false, true, true]);
        assert_eq!(harness.bundler.calls.load(Ordering::SeqCst), 2);
        assert!(entry.join("index.html").is_file());
        assert_eq!(harness.count("cache"), 1);
    }

    #[tokio::test]
    async fn deployed_html_is_relocatable() {
        let harness = Harness::start().await;
        let (_, body) = harness
            .post(serde_json::json!({"componentCode": "const X = 1"}))
            .await;

        let html = std::fs::read_to_string(
            harness
                .deployment(body["deploymentId"].as_str().unwrap())
                .join("index.html"),
        )
        .unwrap();

        assert!(!html.contains(r#"src="/assets/"#));
        assert!(!html.contains(r#"href="/assets/"#));
        assert!(html.contains(r#"src="assets/index.js""#));
        assert!(html.contains(r#"href="assets/index.css""#));
    }

    #[tokio::test]
    async fn empty_code_is_rejected_without_side_effects() {
        let harness = Harness::start().await;

        let (status, body) = harness
            .post(serde_json::json!({"componentCode": ""}))
            .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, serde_json::json!({"error": "Component code is required"}));
        assert_eq!(harness.bundler.calls.load(Ordering::SeqCst), 0);
        assert_eq!(harness.count("cache"), 0);
        assert_eq!(harness.count("deployments"), 0);
        assert_eq!(harness.count("workspaces"), 0);
    }

    #[tokio::test]
    async fn concurrent_builds_stay_isolated() {
        let harness = Harness::start().await;
        let sources: Vec<String> = (0..6).map(|i| format!("export const n = {i};")).collect();

        let responses = post_all(&harness, &sources).await;

        for (source, (status, body)) in sources.iter().zip(responses) {
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["fromCache"], false);
            let served = std::fs::read_to_string(
                harness
                    .deployment(body["deploymentId"].as_str().unwrap())
                    .join("assets/index.js"),
            )
            .unwrap();
            assert_eq!(&served, source);
        }
        assert_eq!(harness.count("cache"), sources.len());
    }

    async fn post_all(
        harness: &Harness,
        sources: &[String],
    ) -> Vec<(StatusCode, serde_json::Value)> {
        let mut handles = Vec::new();
        for source in sources {
            let addr = harness.addr;
            let body = serde_json::json!({ "componentCode": source });
            handles.push(tokio::spawn(async move {
                let req = Request::builder()
                    .method(Method::POST)
                    .uri(format!("http://{addr}/build"))
                    .body(Body::from(body.to_string()))
                    .unwrap();
                let res = Client::new().request(req).await.unwrap();
                let status = res.status();
                let bytes = hyper::body::to_bytes(res.into_body()).await.unwrap();
                (status, serde_json::from_slice(&bytes).unwrap())
            }));
        }

        let mut out = Vec::new();
        for handle in handles {
            out.push(handle.await.unwrap());
        }
        out
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn real_subprocess_bundler_end_to_end() {
        use previewd::build::CommandBundler;

        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("project/src")).unwrap();

        let mut config = Config::default();
        config.paths.project_root = temp.path().join("project");
        config.paths.deployments = temp.path().join("deployments");
        config.paths.cache = temp.path().join("cache");
        config.paths.workspaces = temp.path().join("workspaces");
        config.bundler.program = "sh".to_string();
        config.bundler.args = vec![
            "-c".to_string(),
            concat!(
                "test \"$NODE_ENV\" = production && ",
                "grep -q 'build key' vite.config.js && ",
                "mkdir -p dist/assets && ",
                "cp src/components/UserComponent.jsx dist/assets/app.js && ",
                "printf '<script src=\"/assets/app.js\"></script>' > dist/index.html"
            )
            .to_string(),
        ];

        let pipeline = BuildPipeline::new(
            &config,
            Arc::new(CommandBundler::from_config(&config.bundler)),
            Arc::new(AuditLog::disabled()),
        );

        let outcome = pipeline
            .build("export default 42", CancellationToken::new())
            .await
            .unwrap();

        assert!(!outcome.from_cache);
        assert_eq!(
            std::fs::read_to_string(outcome.deployment.dir.join("assets/app.js")).unwrap(),
            "export default 42"
        );
        assert_eq!(
            std::fs::read_to_string(outcome.deployment.dir.join("index.html")).unwrap(),
            r#"<script src="assets/app.js"></script>"#
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_subprocess_surfaces_diagnostics() {
        use previewd::build::CommandBundler;

        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("project")).unwrap();

        let mut config = Config::default();
        config.paths.project_root = temp.path().join("project");
        config.paths.deployments = temp.path().join("deployments");
        config.paths.cache = temp.path().join("cache");
        config.paths.workspaces = temp.path().join("workspaces");
        config.bundler.program = "sh".to_string();
        config.bundler.args = vec![
            "-c".to_string(),
            "echo 'ERROR: Expected \";\" but found \"}\"' >&2; exit 1".to_string(),
        ];

        let pipeline = BuildPipeline::new(
            &config,
            Arc::new(CommandBundler::from_config(&config.bundler)),
            Arc::new(AuditLog::disabled()),
        );

        let err = pipeline
            .build("export default {", CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.status_code(), 500);
        assert!(err.to_string().contains(r#"Expected ";" but found "}""#));
        assert_eq!(
            std::fs::read_dir(temp.path().join("workspaces"))
                .unwrap()
                .count(),
            0
        );
    }
}
