use async_trait::async_trait;
use tracing::{info, instrument};

use super::{path_arg, read_ort_result, Completion, Stage, StageFlow, Toolchain};
use crate::context::JobContext;
use crate::error::{NormalizeError, StageError};
use crate::normalize::{build_graph, convert_analyzer, OrtResult, Report};

/// Runs dependency analysis over `repo/` and loads `analyzer-result.json`.
pub struct AnalyzeStage {
    toolchain: Toolchain,
}

impl AnalyzeStage {
    pub fn new(toolchain: Toolchain) -> Self {
        Self { toolchain }
    }
}

#[async_trait]
impl Stage for AnalyzeStage {
    #[instrument(skip(self, ctx), fields(job = %ctx.job))]
    async fn run(&self, ctx: &mut JobContext) -> Result<StageFlow, StageError> {
        let args = vec![
            "--info".to_string(),
            "analyze".to_string(),
            "--allow-dynamic-versions".to_string(),
            "-i".to_string(),
            path_arg(&ctx.workdir.repo_dir()),
            "-o".to_string(),
            path_arg(&ctx.workdir.out_dir()),
            "-f".to_string(),
            "JSON".to_string(),
        ];
        self.toolchain.invoke(ctx, args).await?;

        ctx.analyzer = Some(read_ort_result(&ctx.workdir.analyzer_result()).await?);
        Ok(StageFlow::Continue)
    }

    fn name(&self) -> &'static str {
        "Analyze"
    }
}

async fn analyzer_output(ctx: &mut JobContext) -> Result<&OrtResult, StageError> {
    if ctx.analyzer.is_none() {
        ctx.analyzer = Some(read_ort_result(&ctx.workdir.analyzer_result()).await?);
    }
    ctx.analyzer
        .as_ref()
        .ok_or_else(|| StageError::MissingArtifact {
            path: ctx.workdir.analyzer_result(),
        })
}

/// Ends the run early with an empty graph when analysis found no packages.
pub struct VerifyHasPackagesStage;

#[async_trait]
impl Stage for VerifyHasPackagesStage {
    #[instrument(skip(self, ctx), fields(job = %ctx.job))]
    async fn run(&self, ctx: &mut JobContext) -> Result<StageFlow, StageError> {
        let analyzer = analyzer_output(ctx).await?;
        let packages = analyzer
            .analyzer_result()
            .ok_or(NormalizeError::MissingAnalyzerResult)?
            .packages
            .len();

        if packages > 0 {
            info!(packages, "analyzer found packages");
            return Ok(StageFlow::Continue);
        }

        info!("analyzer does not detect packages, skipping scan");
        let graph = build_graph(analyzer)?;
        ctx.report = Some(Report::Graph(graph));
        Ok(StageFlow::Finish(Completion::NoDependenciesFound))
    }

    fn name(&self) -> &'static str {
        "VerifyHasPackages"
    }
}

/// Analyze-mode report: project/package listing straight from the analyzer.
pub struct ConvertAnalyzerStage;

#[async_trait]
impl Stage for ConvertAnalyzerStage {
    #[instrument(skip(self, ctx), fields(job = %ctx.job))]
    async fn run(&self, ctx: &mut JobContext) -> Result<StageFlow, StageError> {
        let listing = convert_analyzer(analyzer_output(ctx).await?)?;
        info!(
            projects = listing.projects.len(),
            packages = listing.packages.len(),
            "converted analyzer result"
        );
        ctx.report = Some(Report::Listing(listing));
        Ok(StageFlow::Continue)
    }

    fn name(&self) -> &'static str {
        "ConvertAnalyzer"
    }
}
