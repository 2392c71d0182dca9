use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::pipeline::{ClipRequest, Degradation, PipelineError, PipelineResult, PipelineStep};

/// Oldest finished runs are forgotten past this many records.
const MAX_FINISHED_RECORDS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

/// Observability view of one pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub id: Uuid,
    pub requester: String,
    pub seconds: u32,
    pub context: String,
    pub status: RunStatus,
    pub step: Option<PipelineStep>,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub url: Option<String>,
    pub video_id: Option<String>,
    pub ai_title: Option<String>,
    pub transcript: Option<String>,
    pub error: Option<PipelineError>,
    pub degradations: Vec<Degradation>,
}

/// Receives step transitions from a running pipeline.
pub trait StepObserver: Send + Sync {
    fn on_step(&self, run: Uuid, step: PipelineStep);
}

impl StepObserver for () {
    fn on_step(&self, _run: Uuid, _step: PipelineStep) {}
}

/// Every run the dispatcher has scheduled, keyed by run id.
#[derive(Default)]
pub struct RunRegistry {
    runs: RwLock<HashMap<Uuid, RunRecord>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, request: &ClipRequest) {
        let record = RunRecord {
            id: request.id,
            requester: request.requester.display_name.clone(),
            seconds: request.seconds,
            context: request.context.clone(),
            status: RunStatus::Queued,
            step: None,
            queued_at: Utc::now(),
            started_at: None,
            finished_at: None,
            url: None,
            video_id: None,
            ai_title: None,
            transcript: None,
            error: None,
            degradations: Vec::new(),
        };
        let mut runs = self.write();
        runs.insert(request.id, record);
        prune(&mut runs);
    }

    pub fn mark_running(&self, id: Uuid) {
        if let Some(record) = self.write().get_mut(&id) {
            record.status = RunStatus::Running;
            record.started_at = Some(Utc::now());
        }
    }

    pub fn finish(&self, result: &PipelineResult) {
        if let Some(record) = self.write().get_mut(&result.request_id) {
            record.status = if result.success() {
                RunStatus::Succeeded
            } else {
                RunStatus::Failed
            };
            record.finished_at = Some(Utc::now());
            record.url = result.url().map(str::to_string);
            record.video_id = result.video_id().map(str::to_string);
            record.ai_title = result.ai_title.clone();
            record.transcript = result.transcript.clone();
            record.error = result.error().cloned();
            record.degradations = result.degradations.clone();
        }
    }

    pub fn get(&self, id: Uuid) -> Option<RunRecord> {
        self.read().get(&id).cloned()
    }

    /// All known runs, newest first.
    pub fn list(&self) -> Vec<RunRecord> {
        let mut records: Vec<RunRecord> = self.read().values().cloned().collect();
        records.sort_by(|a, b| b.queued_at.cmp(&a.queued_at));
        records
    }

    pub fn count_with_status(&self, status: RunStatus) -> usize {
        self.read().values().filter(|r| r.status == status).count()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<Uuid, RunRecord>> {
        self.runs.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<Uuid, RunRecord>> {
        self.runs.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl StepObserver for RunRegistry {
    fn on_step(&self, run: Uuid, step: PipelineStep) {
        if let Some(record) = self.write().get_mut(&run) {
            record.step = Some(step);
        }
    }
}

fn prune(runs: &mut HashMap<Uuid, RunRecord>) {
    let mut finished: Vec<(DateTime<Utc>, Uuid)> = runs
        .values()
        .filter_map(|r| r.finished_at.map(|t| (t, r.id)))
        .collect();
    if finished.len() <= MAX_FINISHED_RECORDS {
        return;
    }
    finished.sort();
    let excess = finished.len() - MAX_FINISHED_RECORDS;
    for (_, id) in finished.into_iter().take(excess) {
        runs.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PipelineResult;
    use crate::publish::PublishedVideo;
    use crate::testing::{author, request};

    #[test]
    fn tracks_a_run_through_its_lifecycle() {
        let registry = RunRegistry::new();
        let req = request(20, author("viewer", false, true));

        registry.enqueue(&req);
        assert_eq!(registry.get(req.id).unwrap().status, RunStatus::Queued);

        registry.mark_running(req.id);
        registry.on_step(req.id, PipelineStep::Trim);
        let running = registry.get(req.id).unwrap();
        assert_eq!(running.status, RunStatus::Running);
        assert_eq!(running.step, Some(PipelineStep::Trim));

        let mut result = PipelineResult::new(req.id, Ok(PublishedVideo {
            id: "vid1".to_string(),
            url: "https://youtu.be/vid1".to_string(),
        }));
        result.ai_title = Some("Title".to_string());
        result.transcript = Some("what a play".to_string());
        registry.finish(&result);

        let done = registry.get(req.id).unwrap();
        assert_eq!(done.status, RunStatus::Succeeded);
        assert_eq!(done.video_id.as_deref(), Some("vid1"));
        assert_eq!(done.transcript.as_deref(), Some("what a play"));
        assert!(done.error.is_none());
        assert_eq!(registry.count_with_status(RunStatus::Succeeded), 1);
    }

    #[test]
    fn failed_runs_keep_their_error() {
        let registry = RunRegistry::new();
        let req = request(20, author("viewer", false, true));
        registry.enqueue(&req);
        registry.finish(&PipelineResult::new(
            req.id,
            Err(PipelineError::NoRecordingFound("empty".to_string())),
        ));

        let done = registry.get(req.id).unwrap();
        assert_eq!(done.status, RunStatus::Failed);
        assert!(done.video_id.is_none());
        assert!(matches!(done.error, Some(PipelineError::NoRecordingFound(_))));
    }
}
