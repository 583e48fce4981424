//! Bounded fan-out of the orchestrator over many documents.

use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::ocr::Document;
use crate::orchestrator::{OcrError, OcrOrchestrator, ProcessOptions, ProcessOutcome};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub processing_time: u64,
}

pub struct BatchReport {
    pub summary: BatchSummary,
    /// One entry per input document, in input order.
    pub results: Vec<Result<ProcessOutcome, OcrError>>,
}

#[derive(Clone)]
pub struct BatchCoordinator {
    orchestrator: Arc<OcrOrchestrator>,
}

impl BatchCoordinator {
    pub fn new(orchestrator: Arc<OcrOrchestrator>) -> Self {
        Self { orchestrator }
    }

    /// Process documents in chunks of `concurrency`; each chunk completes
    /// before the next starts.
    pub async fn batch_process(
        &self,
        documents: Vec<Document>,
        concurrency: usize,
        options: &ProcessOptions,
        cancel: &CancellationToken,
    ) -> BatchReport {
        let started = Instant::now();
        let total = documents.len();
        let concurrency = concurrency.max(1);
        let mut results = Vec::with_capacity(total);

        for (index, chunk) in documents.chunks(concurrency).enumerate() {
            info!(
                "Batch chunk {} ({} documents, concurrency {})",
                index + 1,
                chunk.len(),
                concurrency
            );
            let runs = chunk
                .iter()
                .map(|doc| self.orchestrator.process(doc.clone(), options, cancel));
            results.extend(join_all(runs).await);
        }

        let successful = results.iter().filter(|r| r.is_ok()).count();
        let summary = BatchSummary {
            total,
            successful,
            failed: total - successful,
            processing_time: started.elapsed().as_millis() as u64,
        };
        info!(
            "Batch complete: {}/{} succeeded in {}ms",
            summary.successful, summary.total, summary.processing_time
        );
        BatchReport { summary, results }
    }
}
