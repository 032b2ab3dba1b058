use async_trait::async_trait;
use tracing::{debug, instrument};

use super::{path_arg, require, Stage, StageFlow, Toolchain};
use crate::context::JobContext;
use crate::error::StageError;

/// Renders the scan result as the single-file HTML web app.
pub struct ReportStage {
    toolchain: Toolchain,
}

impl ReportStage {
    pub fn new(toolchain: Toolchain) -> Self {
        Self { toolchain }
    }
}

#[async_trait]
impl Stage for ReportStage {
    #[instrument(skip(self, ctx), fields(job = %ctx.job))]
    async fn run(&self, ctx: &mut JobContext) -> Result<StageFlow, StageError> {
        let scan_result = ctx.workdir.scan_result();
        require(&scan_result)?;

        let args = vec![
            "report".to_string(),
            "-i".to_string(),
            path_arg(&scan_result),
            "-o".to_string(),
            path_arg(&ctx.workdir.out_dir()),
            "-f".to_string(),
            "WEBAPP".to_string(),
        ];
        self.toolchain.invoke(ctx, args).await?;

        let html_path = ctx.workdir.html_report();
        require(&html_path)?;
        let html = tokio::fs::read_to_string(&html_path)
            .await
            .map_err(|e| StageError::io(&html_path, e))?;
        debug!(bytes = html.len(), "read web app report");

        ctx.html = Some(html);
        Ok(StageFlow::Continue)
    }

    fn name(&self) -> &'static str {
        "Report"
    }
}
