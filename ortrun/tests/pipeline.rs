#![cfg(unix)]

use std::path::Path;

use ortrun::{scheduler_from_config, Completion, Config, JobOutcome, Mode};
use serde_json::{json, Value};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

/// Stand-in for the toolchain. Records each subcommand in `calls.txt` next
/// to itself and copies canned results into `out/`.
const FAKE_ORT: &str = r#"
here=$(dirname "$0")
cmd=$1
if [ "$cmd" = "--info" ]; then cmd=$2; fi
echo "$cmd" >> "$here/calls.txt"
case "$cmd" in
  analyze)
    echo "INFO analyzing sources"
    echo "resolving dependencies"
    ANALYZE_HOOK
    cp "$here/analyzer-result.json" out/analyzer-result.json
    ;;
  scan)
    echo "downloading sources" >&2
    cp "$here/scan-result.json" out/scan-result.json
    ;;
  report)
    echo '<html>report</html>' > out/scan-report-web-app.html
    ;;
esac
"#;

const ANALYZER_RESULT: &str = r#"{"analyzer": {"result": {
    "projects": [{
        "id": "NPM::demo:1.0.0",
        "definition_file_path": "package.json",
        "declared_licenses_processed": {"spdx_expression": "Apache-2.0"},
        "vcs_processed": {"type": "Git", "url": "git@github.com:acme/demo.git", "revision": "abc"},
        "scopes": [{"name": "dependencies", "dependencies": [
            {"id": "NPM::express:4.18.2", "dependencies": [{"id": "NPM::debug:2.6.9"}]}
        ]}]
    }],
    "packages": [
        {"package": {"id": "NPM::express:4.18.2", "purl": "pkg:npm/express@4.18.2"}},
        {"package": {"id": "NPM::debug:2.6.9", "purl": "pkg:npm/debug@2.6.9"}}
    ]
}}}"#;

const EMPTY_ANALYZER_RESULT: &str = r#"{"analyzer": {"result": {
    "projects": [{"id": "NPM::demo:1.0.0", "scopes": [{"name": "dependencies", "dependencies": []}]}],
    "packages": []
}}}"#;

struct Harness {
    server: MockServer,
    tools: TempDir,
    work_root: TempDir,
    source: TempDir,
}

impl Harness {
    async fn new(analyzer_result: &str, analyze_hook: &str) -> Self {
        let tools = tempfile::tempdir().unwrap();
        std::fs::write(tools.path().join("ort.sh"), FAKE_ORT.replace("ANALYZE_HOOK", analyze_hook)).unwrap();
        std::fs::write(tools.path().join("analyzer-result.json"), analyzer_result).unwrap();
        std::fs::write(tools.path().join("scan-result.json"), scan_result(analyzer_result)).unwrap();

        let source = tempfile::tempdir().unwrap();
        std::fs::write(source.path().join("package.json"), "{}").unwrap();

        Self {
            server: MockServer::start().await,
            tools,
            work_root: tempfile::tempdir().unwrap(),
            source,
        }
    }

    async fn serve_job(&self, job_type: &str) {
        Mock::given(method("GET"))
            .and(path(format!("/find_job/{job_type}/oscar-ort-1")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "job-7",
                "payload": {
                    "component": "demo",
                    "componentVersion": "1.0.0",
                    "componentPath": self.source.path().display().to_string()
                }
            })))
            .mount(&self.server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&self.server)
            .await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&self.server)
            .await;
    }

    fn config(&self, mode: Mode) -> Config {
        Config {
            job_api_url: self.server.uri(),
            mode,
            ort_command: format!("sh {}", self.tools.path().join("ort.sh").display()),
            silence_timeout_secs: 30,
            ack_retry_backoff_ms: 10,
            work_root: Some(self.work_root.path().to_path_buf()),
            ..Config::default()
        }
    }

    async fn run(&self, config: &Config) -> JobOutcome {
        let scheduler = scheduler_from_config(config).unwrap();
        scheduler.run_once().await.expect("a job should have been processed")
    }

    fn calls(&self) -> Vec<String> {
        std::fs::read_to_string(self.tools.path().join("calls.txt"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    async fn requests(&self) -> Vec<Request> {
        self.server.received_requests().await.unwrap()
    }

    fn work_root_is_empty(&self) -> bool {
        is_empty_dir(self.work_root.path())
    }
}

fn scan_result(analyzer_result: &str) -> String {
    let mut value: Value = serde_json::from_str(analyzer_result).unwrap();
    value["scanner"] = json!({"results": {"scan_results": [{
        "id": "NPM::express:4.18.2",
        "results": [{
            "provenance": {"source_artifact": {"url": "https://registry.npmjs.org/express/-/express-4.18.2.tgz"}},
            "summary": {
                "start_time": "2024-03-01T10:00:00Z",
                "end_time": "2024-03-01T10:00:02.500Z",
                "file_count": 16,
                "license_findings": [{"license": "MIT"}, {"license": "MIT"}]
            }
        }]
    }]}});
    value.to_string()
}

fn is_empty_dir(path: &Path) -> bool {
    std::fs::read_dir(path).unwrap().next().is_none()
}

fn route(request: &Request) -> String {
    format!("{} {}", request.method, request.url.path())
}

fn routes(requests: &[Request]) -> Vec<String> {
    requests.iter().map(route).collect()
}

fn body_json(request: &Request) -> Value {
    serde_json::from_slice(&request.body).unwrap()
}

fn body_text(request: &Request) -> String {
    String::from_utf8_lossy(&request.body).into_owned()
}

#[tokio::test]
async fn scan_mode_uploads_graph_html_and_logs() {
    let harness = Harness::new(ANALYZER_RESULT, ":").await;
    harness.serve_job("ort-scan").await;

    let outcome = harness.run(&harness.config(Mode::Scan)).await;

    assert_eq!(outcome, JobOutcome::Succeeded(Completion::Complete));
    assert_eq!(harness.calls(), vec!["analyze", "scan", "report"]);

    let requests = harness.requests().await;
    assert_eq!(
        routes(&requests),
        vec![
            "GET /find_job/ort-scan/oscar-ort-1",
            "POST /ort/report/demo/1.0.0",
            "POST /ort/html/demo/1.0.0",
            "POST /ort/logs/demo/1.0.0",
            "PUT /finish_job/job-7/oscar-ort-1",
        ]
    );

    let report = body_json(&requests[1]);
    assert_eq!(report["type"], "json");
    let project = &report["result"]["projects"][0];
    assert_eq!(project["name"], "NPM::demo:1.0.0");
    assert_eq!(project["licenses"], json!(["Apache-2.0"]));
    assert_eq!(project["vcs"]["url"], "github.com/acme/demo");

    let express = &project["dependencies"][0];
    assert_eq!(express["id"], "NPM::express:4.18.2");
    assert_eq!(express["scopes"], json!(["dependencies"]));
    assert_eq!(express["licenses"], json!(["MIT"]));
    assert_eq!(express["scan"]["fileCount"], 16);
    assert_eq!(express["scan"]["durationMs"], 2500);

    let debug = &project["dependencies"][1];
    assert_eq!(debug["id"], "NPM::debug:2.6.9");
    assert_eq!(debug["parents"], json!(["NPM::express:4.18.2"]));
    assert!(debug.get("licenses").is_none());

    assert_eq!(body_text(&requests[2]), "<html>report</html>\n");

    let logs = body_text(&requests[3]);
    assert!(logs.contains("INFO analyzing sources"), "logs: {logs}");
    assert!(logs.contains("resolving dependencies"), "logs: {logs}");
    assert!(logs.contains("ERROR: downloading sources"), "logs: {logs}");

    assert!(harness.work_root_is_empty());
}

#[tokio::test]
async fn no_packages_skips_scan_and_uploads_empty_graph() {
    let harness = Harness::new(EMPTY_ANALYZER_RESULT, ":").await;
    harness.serve_job("ort-scan").await;

    let outcome = harness.run(&harness.config(Mode::Scan)).await;

    assert_eq!(outcome, JobOutcome::Succeeded(Completion::NoDependenciesFound));
    assert_eq!(harness.calls(), vec!["analyze"]);

    let requests = harness.requests().await;
    assert_eq!(
        routes(&requests),
        vec![
            "GET /find_job/ort-scan/oscar-ort-1",
            "POST /ort/report/demo/1.0.0",
            "POST /ort/logs/demo/1.0.0",
            "PUT /finish_job/job-7/oscar-ort-1",
        ]
    );
    let report = body_json(&requests[1]);
    assert_eq!(report["result"]["projects"][0]["dependencies"], json!([]));
    assert!(harness.work_root_is_empty());
}

#[tokio::test]
async fn git_metadata_only_source_fails_as_empty() {
    let harness = Harness::new(ANALYZER_RESULT, ":").await;
    std::fs::remove_file(harness.source.path().join("package.json")).unwrap();
    std::fs::create_dir_all(harness.source.path().join(".git/refs")).unwrap();
    std::fs::write(harness.source.path().join(".git/HEAD"), "ref: refs/heads/main\n").unwrap();
    harness.serve_job("ort-scan").await;

    let outcome = harness.run(&harness.config(Mode::Scan)).await;

    let JobOutcome::Failed { stage, reason } = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert_eq!(stage, "VerifyNonEmpty");
    assert!(harness.calls().is_empty());

    let requests = harness.requests().await;
    assert_eq!(
        routes(&requests),
        vec![
            "GET /find_job/ort-scan/oscar-ort-1",
            "POST /ort/logs/demo/1.0.0",
            "POST /ort/report/demo/1.0.0",
            "PUT /finish_job/job-7/oscar-ort-1",
        ]
    );
    assert_eq!(body_text(&requests[1]), "Logs empty!");
    assert_eq!(body_json(&requests[2]), json!({ "error": reason }));
    assert!(reason.starts_with("VerifyNonEmpty: source tree at "), "reason: {reason}");
    assert!(harness.work_root_is_empty());
}

#[tokio::test]
async fn failing_toolchain_reports_stage_and_stderr() {
    let harness = Harness::new(ANALYZER_RESULT, "echo 'no definition files found' >&2; exit 2").await;
    harness.serve_job("ort-scan").await;

    let outcome = harness.run(&harness.config(Mode::Scan)).await;

    let JobOutcome::Failed { stage, reason } = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert_eq!(stage, "Analyze");
    assert!(reason.contains("exit code 2"), "reason: {reason}");
    assert!(reason.contains("no definition files found"), "reason: {reason}");

    let requests = harness.requests().await;
    let logs = body_text(&requests[1]);
    assert!(logs.contains("ERROR: no definition files found"), "logs: {logs}");
    assert_eq!(route(requests.last().unwrap()), "PUT /finish_job/job-7/oscar-ort-1");
    assert!(harness.work_root_is_empty());
}

#[tokio::test]
async fn silent_toolchain_is_killed() {
    let harness = Harness::new(ANALYZER_RESULT, "exec sleep 30").await;
    harness.serve_job("ort-scan").await;

    let mut config = harness.config(Mode::Scan);
    config.silence_timeout_secs = 1;
    let outcome = harness.run(&config).await;

    let JobOutcome::Failed { stage, reason } = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert_eq!(stage, "Analyze");
    assert!(reason.contains("was killed"), "reason: {reason}");
    assert!(harness.work_root_is_empty());
}

#[tokio::test]
async fn analyze_mode_uploads_listing() {
    let harness = Harness::new(ANALYZER_RESULT, ":").await;
    harness.serve_job("ort-analyze").await;

    let outcome = harness.run(&harness.config(Mode::Analyze)).await;

    assert_eq!(outcome, JobOutcome::Succeeded(Completion::Complete));
    assert_eq!(harness.calls(), vec!["analyze"]);

    let requests = harness.requests().await;
    assert_eq!(
        routes(&requests),
        vec![
            "GET /find_job/ort-analyze/oscar-ort-1",
            "POST /ort/report/demo/1.0.0",
            "POST /ort/logs/demo/1.0.0",
            "PUT /finish_job/job-7/oscar-ort-1",
        ]
    );

    let report = body_json(&requests[1]);
    let listing = &report["result"];
    assert_eq!(listing["projects"][0]["name"], "NPM::demo:1.0.0");
    assert_eq!(listing["projects"][0]["file"], "package.json");
    assert_eq!(listing["packages"].as_array().unwrap().len(), 2);
    assert_eq!(listing["packages"][0]["licenses"], json!(["MIT"]));
}
