use async_trait::async_trait;

use magpie_queue::{JobContext, JobHandler};
use magpie_types::JobRecord;

use crate::services::Services;
use crate::workflow::WorkflowDriver;

/// Queue-facing adapter: every claimed research job becomes one workflow
/// run over the shared services handle.
pub struct ResearchJobHandler {
    services: Services,
}

impl ResearchJobHandler {
    pub fn new(services: Services) -> Self {
        Self { services }
    }
}

#[async_trait]
impl JobHandler for ResearchJobHandler {
    async fn handle(&self, job: JobRecord, ctx: JobContext) -> anyhow::Result<()> {
        let driver = WorkflowDriver::new(self.services.clone());
        driver.run(&job, &ctx).await
    }
}
