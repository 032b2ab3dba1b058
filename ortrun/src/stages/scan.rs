use async_trait::async_trait;
use tracing::{info, instrument};

use super::{path_arg, read_ort_result, require, Stage, StageFlow, Toolchain};
use crate::context::JobContext;
use crate::error::StageError;
use crate::normalize::{build_graph, Report};

/// License scan over the analyzer output; produces `scan-result.json`.
pub struct ScanStage {
    toolchain: Toolchain,
}

impl ScanStage {
    pub fn new(toolchain: Toolchain) -> Self {
        Self { toolchain }
    }

    fn args(&self, ctx: &JobContext) -> Vec<String> {
        vec![
            "--info".to_string(),
            "scan".to_string(),
            "-c".to_string(),
            path_arg(&self.toolchain.scanner_config),
            "--ort-file".to_string(),
            path_arg(&ctx.workdir.analyzer_result()),
            "-o".to_string(),
            path_arg(&ctx.workdir.out_dir()),
            "-f".to_string(),
            "JSON".to_string(),
        ]
    }
}

#[async_trait]
impl Stage for ScanStage {
    #[instrument(skip(self, ctx), fields(job = %ctx.job))]
    async fn run(&self, ctx: &mut JobContext) -> Result<StageFlow, StageError> {
        require(&ctx.workdir.analyzer_result())?;
        self.toolchain.invoke(ctx, self.args(ctx)).await?;
        require(&ctx.workdir.scan_result())?;
        Ok(StageFlow::Continue)
    }

    fn name(&self) -> &'static str {
        "Scan"
    }
}

/// Builds the dependency graph from `scan-result.json`.
pub struct NormalizeStage;

#[async_trait]
impl Stage for NormalizeStage {
    #[instrument(skip(self, ctx), fields(job = %ctx.job))]
    async fn run(&self, ctx: &mut JobContext) -> Result<StageFlow, StageError> {
        let scan = read_ort_result(&ctx.workdir.scan_result()).await?;
        let graph = build_graph(&scan)?;
        info!(
            projects = graph.projects.len(),
            dependencies = graph.node_count(),
            "built dependency graph"
        );
        ctx.report = Some(Report::Graph(graph));
        Ok(StageFlow::Continue)
    }

    fn name(&self) -> &'static str {
        "Normalize"
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use super::*;
    use crate::job::SourceLocator;
    use crate::stages::test_support::{fake_tool, job_context};
    use crate::supervisor::ProcessSupervisor;

    const SCAN_RESULT: &str = r#"{
        "analyzer": {"result": {
            "projects": [{"id": "Maven:org:app:1", "scopes": [
                {"name": "compile", "dependencies": [{"id": "Maven:org:lib:2"}]}
            ]}],
            "packages": [{"package": {"id": "Maven:org:lib:2", "purl": "pkg:maven/org/lib@2"}}]
        }},
        "scanner": {"results": {"scan_results": [{
            "id": "Maven:org:lib:2",
            "results": [{
                "provenance": {"source_artifact": {"url": "https://repo/lib-2-sources.jar"}},
                "summary": {
                    "start_time": "2024-01-01T00:00:00Z",
                    "end_time": "2024-01-01T00:00:01Z",
                    "file_count": 12,
                    "license_findings": [{"license": "Apache-2.0"}]
                }
            }]
        }]}}
    }"#;

    fn toolchain(command: &str) -> Toolchain {
        Toolchain::new(
            ProcessSupervisor::new(Duration::from_secs(30), "INFO"),
            command,
            "/etc/ortrun/scanner.yml",
        )
    }

    #[test]
    fn scan_args_point_at_working_files() {
        let ctx = job_context(SourceLocator::Path(PathBuf::from("/unused")));
        let stage = ScanStage::new(toolchain("ort"));
        let args = stage.args(&ctx);

        assert_eq!(&args[..4], ["--info", "scan", "-c", "/etc/ortrun/scanner.yml"]);
        assert_eq!(args[5], path_arg(&ctx.workdir.analyzer_result()));
        assert_eq!(args[7], path_arg(&ctx.workdir.out_dir()));
        assert_eq!(&args[8..], ["-f", "JSON"]);
    }

    #[tokio::test]
    async fn scan_requires_analyzer_output() {
        let mut ctx = job_context(SourceLocator::Path(PathBuf::from("/unused")));
        let stage = ScanStage::new(toolchain("ort"));

        let err = stage.run(&mut ctx).await.unwrap_err();
        match err {
            StageError::MissingArtifact { path } => assert_eq!(path, ctx.workdir.analyzer_result()),
            other => panic!("expected MissingArtifact, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn scan_requires_scan_output() {
        let bin = tempfile::tempdir().unwrap();
        let stage = ScanStage::new(toolchain(&fake_tool(bin.path(), "echo scanning")));

        let mut ctx = job_context(SourceLocator::Path(PathBuf::from("/unused")));
        std::fs::write(ctx.workdir.analyzer_result(), "{}").unwrap();

        let err = stage.run(&mut ctx).await.unwrap_err();
        match err {
            StageError::MissingArtifact { path } => assert_eq!(path, ctx.workdir.scan_result()),
            other => panic!("expected MissingArtifact, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn scan_succeeds_when_result_written() {
        let bin = tempfile::tempdir().unwrap();
        let stage = ScanStage::new(toolchain(&fake_tool(bin.path(), "echo '{}' > out/scan-result.json")));

        let mut ctx = job_context(SourceLocator::Path(PathBuf::from("/unused")));
        std::fs::write(ctx.workdir.analyzer_result(), "{}").unwrap();

        assert_eq!(stage.run(&mut ctx).await.unwrap(), StageFlow::Continue);
    }

    #[tokio::test]
    async fn normalize_builds_graph_from_scan_result() {
        let mut ctx = job_context(SourceLocator::Path(PathBuf::from("/unused")));
        std::fs::write(ctx.workdir.scan_result(), SCAN_RESULT).unwrap();

        assert_eq!(NormalizeStage.run(&mut ctx).await.unwrap(), StageFlow::Continue);
        let Some(Report::Graph(graph)) = ctx.report else {
            panic!("expected graph report");
        };
        let node = &graph.projects[0].dependencies[0];
        assert_eq!(node.id, "Maven:org:lib:2");
        assert_eq!(node.licenses.as_deref(), Some(&["Apache-2.0".to_string()][..]));
        let scan = node.scan.as_ref().unwrap();
        assert_eq!(scan.file_count, Some(12));
        assert_eq!(scan.duration_ms, Some(1000));
        assert_eq!(scan.url.as_deref(), Some("https://repo/lib-2-sources.jar"));
    }

    #[tokio::test]
    async fn normalize_without_analyzer_section_fails() {
        let mut ctx = job_context(SourceLocator::Path(PathBuf::from("/unused")));
        std::fs::write(ctx.workdir.scan_result(), "{}").unwrap();

        let err = NormalizeStage.run(&mut ctx).await.unwrap_err();
        assert!(matches!(err, StageError::Normalize(_)), "got {err:?}");
    }
}
