//! Pipeline integration tests
//!
//! Drives `PipelineController` end to end against a scripted batch service,
//! covering admission, failure mapping, pause/stop semantics and progress.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use rugbatch::gemini::{BatchJobService, BatchRequest, GeminiError, JobHandle, JobState, JobStatus, Part};
use rugbatch::logging::PipelineLogger;
use rugbatch::models::Item;
use rugbatch::pipeline::payload::{AssemblyError, Payload, PayloadAssembler};
use rugbatch::pipeline::{
    summarize, ChunkStatus, PipelineController, PipelineError, PipelineOptions, PipelineServices,
    PipelineState, PollPolicy, ResultMeta, ResultProcessor, RunState, StopPolicy,
};

/// Per-chunk behavior of the fake service.
#[derive(Debug, Clone)]
enum Script {
    /// Running for `polls - 1` queries, then succeeded.
    Succeed { polls: u32 },
    /// Failed with the given remote error after one query.
    Fail(&'static str),
    /// Running until `FakeService::release` is called, then succeeded.
    Hold,
    /// Succeeded without an output file.
    NoOutput,
    /// Succeeded, but downloading the output fails.
    DownloadError,
    /// Submission itself is rejected.
    SubmitError,
}

struct FakeService {
    scripts: HashMap<usize, Script>,
    default_script: Script,
    released: AtomicBool,
    /// Chunk index of every submission, in order.
    submissions: Mutex<Vec<usize>>,
    polls: Mutex<HashMap<String, u32>>,
    /// Request lines submitted per job.
    lines: Mutex<HashMap<String, usize>>,
    active_jobs: AtomicUsize,
    max_active_jobs: AtomicUsize,
}

impl FakeService {
    fn new(default_script: Script) -> Self {
        Self {
            scripts: HashMap::new(),
            default_script,
            released: AtomicBool::new(false),
            submissions: Mutex::new(Vec::new()),
            polls: Mutex::new(HashMap::new()),
            lines: Mutex::new(HashMap::new()),
            active_jobs: AtomicUsize::new(0),
            max_active_jobs: AtomicUsize::new(0),
        }
    }

    fn with_script(mut self, chunk: usize, script: Script) -> Self {
        self.scripts.insert(chunk, script);
        self
    }

    fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
    }

    fn script(&self, chunk: usize) -> Script {
        self.scripts
            .get(&chunk)
            .cloned()
            .unwrap_or_else(|| self.default_script.clone())
    }

    fn submissions(&self) -> Vec<usize> {
        self.submissions.lock().unwrap().clone()
    }

    /// Status queries across every job so far.
    fn total_polls(&self) -> u32 {
        self.polls.lock().unwrap().values().sum()
    }

    /// `job-<chunk>-<n>` -> chunk
    fn chunk_of(id: &str) -> usize {
        id.split('-').nth(1).unwrap().parse().unwrap()
    }

    fn finished(&self, mut status: JobStatus) -> JobStatus {
        self.active_jobs.fetch_sub(1, Ordering::SeqCst);
        status.done = true;
        status
    }
}

#[async_trait]
impl BatchJobService for FakeService {
    async fn submit(&self, display_name: &str, jsonl: &str) -> Result<JobStatus, GeminiError> {
        // "Rug Batch Chunk <n> - <date>"
        let number: usize = display_name
            .trim_start_matches("Rug Batch Chunk ")
            .split(' ')
            .next()
            .unwrap()
            .parse()
            .unwrap();
        let chunk = number - 1;

        if let Script::SubmitError = self.script(chunk) {
            return Err(GeminiError::Api {
                status: 400,
                body: "invalid payload".to_string(),
            });
        }

        let id = {
            let mut submissions = self.submissions.lock().unwrap();
            submissions.push(chunk);
            format!("job-{}-{}", chunk, submissions.len())
        };
        self.lines
            .lock()
            .unwrap()
            .insert(id.clone(), jsonl.lines().count());

        let active = self.active_jobs.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active_jobs.fetch_max(active, Ordering::SeqCst);

        let mut status = JobStatus::new(format!("batches/{}", id), JobState::Pending);
        status.display_name = display_name.to_string();
        Ok(status)
    }

    async fn get_status(&self, job: &JobHandle) -> Result<JobStatus, GeminiError> {
        let id = job.id().to_string();
        let polls = {
            let mut polls = self.polls.lock().unwrap();
            let count = polls.entry(id.clone()).or_insert(0);
            *count += 1;
            *count
        };
        let running = JobStatus::new(job.as_str(), JobState::Running);
        let mut succeeded = JobStatus::new(job.as_str(), JobState::Succeeded);
        succeeded.output_file = Some(format!("files/{}", id));

        let status = match self.script(Self::chunk_of(&id)) {
            Script::Succeed { polls: needed } if polls < needed => return Ok(running),
            Script::Hold if !self.released.load(Ordering::SeqCst) => return Ok(running),
            Script::Succeed { .. } | Script::Hold | Script::DownloadError => succeeded,
            Script::NoOutput => JobStatus::new(job.as_str(), JobState::Succeeded),
            Script::Fail(reason) => {
                let mut failed = JobStatus::new(job.as_str(), JobState::Failed);
                failed.error = Some(reason.to_string());
                failed
            }
            Script::SubmitError => unreachable!(),
        };
        Ok(self.finished(status))
    }

    async fn download(&self, file_name: &str) -> Result<String, GeminiError> {
        let id = file_name.trim_start_matches("files/");
        if let Script::DownloadError = self.script(Self::chunk_of(id)) {
            return Err(GeminiError::Api {
                status: 500,
                body: "storage unavailable".to_string(),
            });
        }
        let lines = self.lines.lock().unwrap().get(id).copied().unwrap_or(0);
        Ok("{\"key\":\"x\"}\n".repeat(lines))
    }

    async fn cancel(&self, _job: &JobHandle) -> Result<(), GeminiError> {
        Ok(())
    }

    async fn delete(&self, _job: &JobHandle) -> Result<(), GeminiError> {
        Ok(())
    }
}

/// Text-only payloads; chunks listed in `fail` produce no requests.
#[derive(Default)]
struct TextAssembler {
    fail: Vec<usize>,
}

#[async_trait]
impl PayloadAssembler for TextAssembler {
    async fn assemble(&self, chunk_index: usize, items: &[Item]) -> Result<Payload, AssemblyError> {
        if self.fail.contains(&chunk_index) {
            return Err(AssemblyError::Empty);
        }
        let requests = items
            .iter()
            .map(|item| {
                BatchRequest::new(
                    item.request_key(),
                    vec![Part::Text {
                        text: item.prompt.clone(),
                    }],
                )
            })
            .collect();
        Ok(Payload {
            requests,
            degraded: Vec::new(),
        })
    }
}

/// Counts one image per result line.
struct CountingResults;

#[async_trait]
impl ResultProcessor for CountingResults {
    async fn process(
        &self,
        _chunk_index: usize,
        _items: &[Item],
        content: &str,
    ) -> Result<ResultMeta, String> {
        Ok(ResultMeta {
            image_count: content.lines().count(),
            errors: Vec::new(),
            error: None,
            saved_path: None,
        })
    }
}

fn items(n: usize) -> Vec<Item> {
    (0..n)
        .map(|i| Item::new(format!("SKU{}", i), format!("rug {}", i)))
        .collect()
}

fn options(chunk_size: usize, concurrency: usize) -> PipelineOptions {
    PipelineOptions {
        chunk_size,
        concurrency,
        poll: PollPolicy::fixed(Duration::from_millis(2)),
        stop_policy: StopPolicy::Leave,
    }
}

fn setup(
    n: usize,
    options: PipelineOptions,
    service: Arc<FakeService>,
    assembler: TextAssembler,
) -> PipelineController {
    let services = PipelineServices {
        service,
        assembler: Arc::new(assembler),
        results: Arc::new(CountingResults),
        logger: PipelineLogger::disabled(),
    };
    PipelineController::initialize(items(n), options, services).unwrap()
}

async fn settle(controller: &PipelineController) -> Arc<PipelineState> {
    tokio::time::timeout(Duration::from_secs(10), controller.wait_until_settled())
        .await
        .expect("pipeline did not settle")
        .unwrap()
}

async fn wait_for<F>(controller: &PipelineController, predicate: F) -> Arc<PipelineState>
where
    F: FnMut(&PipelineState) -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), controller.wait_for(predicate))
        .await
        .expect("condition not reached")
        .unwrap()
}

#[tokio::test]
async fn test_203_items_in_three_chunks_all_admitted() {
    let service = Arc::new(FakeService::new(Script::Succeed { polls: 2 }));
    let controller = setup(203, options(75, 5), service.clone(), TextAssembler::default());

    let initial = controller.snapshot();
    let sizes: Vec<usize> = initial.chunks.iter().map(|c| c.len()).collect();
    assert_eq!(sizes, vec![75, 75, 53]);
    assert_eq!(initial.run_state, RunState::Idle);

    controller.start().await.unwrap();
    let started = controller.snapshot();
    assert_eq!(started.in_flight.iter().copied().collect::<Vec<_>>(), vec![0, 1, 2]);

    let state = settle(&controller).await;
    assert_eq!(state.run_state, RunState::Completed);
    assert_eq!(state.completed_count + state.failed_count, 3);
    assert_eq!(state.completed_count, 3);
    assert!(state.end_time.is_some());

    let images: usize = state
        .chunks
        .iter()
        .filter_map(|c| c.result_meta.as_ref())
        .map(|m| m.image_count)
        .sum();
    assert_eq!(images, 203);

    let progress = summarize(&state);
    assert_eq!(progress.overall_progress, 100);
    assert_eq!(progress.current_status, "Completed! 3/3 successful");
}

#[tokio::test]
async fn test_remote_failure_sets_reason() {
    let service = Arc::new(
        FakeService::new(Script::Succeed { polls: 1 }).with_script(1, Script::Fail("Quota exceeded")),
    );
    let controller = setup(9, options(3, 5), service, TextAssembler::default());

    controller.start().await.unwrap();
    let state = settle(&controller).await;

    let failed = state.chunk(1).unwrap();
    assert_eq!(failed.status, ChunkStatus::Failed);
    assert_eq!(failed.error.as_deref(), Some("Batch failed: Quota exceeded"));
    assert!(failed.result_meta.is_none());
    assert!(!state.in_flight.contains(&1));
    assert_eq!(state.failed_count, 1);
    assert_eq!(state.completed_count, 2);
    assert_eq!(state.run_state, RunState::Completed);
}

#[tokio::test]
async fn test_result_problems_complete_with_notes() {
    let service = Arc::new(
        FakeService::new(Script::Succeed { polls: 1 })
            .with_script(0, Script::DownloadError)
            .with_script(1, Script::NoOutput),
    );
    let controller = setup(3, options(1, 3), service, TextAssembler::default());

    controller.start().await.unwrap();
    let state = settle(&controller).await;
    assert_eq!(state.completed_count, 3);
    assert_eq!(state.failed_count, 0);

    let download = state.chunk(0).unwrap().result_meta.as_ref().unwrap();
    assert!(download
        .error
        .as_deref()
        .unwrap()
        .starts_with("Result download failed:"));
    assert_eq!(download.image_count, 0);

    let no_output = state.chunk(1).unwrap().result_meta.as_ref().unwrap();
    assert_eq!(
        no_output.error.as_deref(),
        Some("job succeeded without an output file")
    );

    let ok = state.chunk(2).unwrap().result_meta.as_ref().unwrap();
    assert!(ok.error.is_none());
    assert_eq!(ok.image_count, 1);
}

#[tokio::test]
async fn test_submission_and_assembly_failures_fail_the_chunk() {
    let service = Arc::new(
        FakeService::new(Script::Succeed { polls: 1 }).with_script(0, Script::SubmitError),
    );
    let assembler = TextAssembler { fail: vec![2] };
    let controller = setup(3, options(1, 3), service.clone(), assembler);

    controller.start().await.unwrap();
    let state = settle(&controller).await;

    let rejected = state.chunk(0).unwrap();
    assert_eq!(rejected.status, ChunkStatus::Failed);
    assert!(rejected
        .error
        .as_deref()
        .unwrap()
        .starts_with("Failed to submit batch"));
    assert!(rejected.job.is_none());

    let empty = state.chunk(2).unwrap();
    assert_eq!(empty.status, ChunkStatus::Failed);
    assert_eq!(empty.error.as_deref(), Some("No batch requests generated"));

    assert_eq!(state.chunk(1).unwrap().status, ChunkStatus::Completed);
    assert_eq!(service.submissions(), vec![1]);
    assert_eq!(state.run_state, RunState::Completed);
}

#[tokio::test]
async fn test_concurrency_bound_and_admission_order() {
    let service = Arc::new(FakeService::new(Script::Succeed { polls: 3 }));
    let controller = setup(10, options(1, 3), service.clone(), TextAssembler::default());

    controller.start().await.unwrap();
    let state = settle(&controller).await;

    assert_eq!(state.completed_count, 10);
    assert_eq!(service.max_active_jobs.load(Ordering::SeqCst), 3);

    // Lowest pending index is always admitted first
    let starts: Vec<_> = state
        .chunks
        .iter()
        .map(|c| c.start_time.unwrap())
        .collect();
    assert!(starts.windows(2).all(|w| w[0] <= w[1]));
}

#[tokio::test]
async fn test_every_snapshot_is_consistent_and_progress_monotonic() {
    let service = Arc::new(FakeService::new(Script::Succeed { polls: 2 }));
    let controller = setup(40, options(4, 3), service, TextAssembler::default());

    let mut rx = controller.subscribe();
    let observer = tokio::spawn(async move {
        let mut seen = Vec::new();
        loop {
            let state = rx.borrow_and_update().clone();
            state.check_invariants().unwrap();
            assert!(state.in_flight.len() <= state.concurrency_limit);
            seen.push(summarize(&state));
            if state.run_state == RunState::Completed {
                return seen;
            }
            if rx.changed().await.is_err() {
                return seen;
            }
        }
    });

    controller.start().await.unwrap();
    let seen = tokio::time::timeout(Duration::from_secs(10), observer)
        .await
        .expect("observer timed out")
        .unwrap();

    assert!(seen.len() > 2);
    assert!(seen
        .windows(2)
        .all(|w| w[0].overall_progress <= w[1].overall_progress));
    let last = seen.last().unwrap();
    assert_eq!(last.overall_progress, 100);
    assert_eq!(last.completed_chunks, 10);
}

#[tokio::test]
async fn test_pause_holds_admission_until_resume() {
    let service = Arc::new(FakeService::new(Script::Hold));
    let controller = setup(6, options(1, 2), service.clone(), TextAssembler::default());

    assert!(matches!(
        controller.pause().await,
        Err(PipelineError::InvalidRunState { .. })
    ));

    controller.start().await.unwrap();
    wait_for(&controller, |s| {
        s.in_flight.len() == 2
            && s.chunks[..2]
                .iter()
                .all(|c| c.status == ChunkStatus::Processing)
    })
    .await;

    controller.pause().await.unwrap();
    assert_eq!(controller.snapshot().run_state, RunState::Paused);

    // In-flight chunks still finish while paused
    service.release();
    let paused = wait_for(&controller, |s| s.completed_count == 2 && s.in_flight.is_empty()).await;
    assert_eq!(paused.run_state, RunState::Paused);
    assert_eq!(paused.pending_count(), 4);

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(controller.snapshot().in_flight.is_empty());
    assert_eq!(service.submissions().len(), 2);

    controller.resume().await.unwrap();
    let state = settle(&controller).await;
    assert_eq!(state.run_state, RunState::Completed);
    assert_eq!(state.completed_count, 6);
}

#[tokio::test]
async fn test_start_twice_is_rejected() {
    let service = Arc::new(FakeService::new(Script::Hold));
    let controller = setup(2, options(1, 1), service.clone(), TextAssembler::default());

    controller.start().await.unwrap();
    match controller.start().await {
        Err(PipelineError::InvalidRunState { action, state }) => {
            assert_eq!(action, "start");
            assert_eq!(state, RunState::Running);
        }
        other => panic!("expected InvalidRunState, got {:?}", other),
    }
    controller.stop().await.unwrap();
}

async fn start_and_stop_with_two_processing(policy: StopPolicy) -> (PipelineController, Arc<FakeService>) {
    let service = Arc::new(FakeService::new(Script::Hold));
    let mut opts = options(1, 2);
    opts.stop_policy = policy;
    let controller = setup(4, opts, service.clone(), TextAssembler::default());

    controller.start().await.unwrap();
    wait_for(&controller, |s| {
        s.chunks[..2]
            .iter()
            .all(|c| c.status == ChunkStatus::Processing)
    })
    .await;
    controller.stop().await.unwrap();
    (controller, service)
}

/// No status query is issued for several poll intervals after a stop.
async fn assert_polling_stopped(service: &FakeService) {
    let before = service.total_polls();
    assert!(before > 0);
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(service.total_polls(), before, "pollers kept running after stop");
}

#[tokio::test]
async fn test_stop_leaves_interrupted_chunks() {
    let (controller, service) = start_and_stop_with_two_processing(StopPolicy::Leave).await;
    assert_polling_stopped(&service).await;

    let state = controller.snapshot();
    assert_eq!(state.run_state, RunState::Idle);
    assert!(state.in_flight.is_empty());
    assert_eq!(state.interrupted(), vec![0, 1]);
    assert_eq!(state.chunk(0).unwrap().status, ChunkStatus::Processing);
    state.check_invariants().unwrap();
    assert_eq!(summarize(&state).interrupted_chunks, 2);

    // Cancelled workers never report back
    service.release();
    tokio::time::sleep(Duration::from_millis(30)).await;
    let later = controller.snapshot();
    assert_eq!(later.chunk(0).unwrap().status, ChunkStatus::Processing);
    assert_eq!(later.completed_count, 0);

    // A new run processes the remaining pending chunks only
    controller.start().await.unwrap();
    let state = wait_for(&controller, |s| {
        s.completed_count == 2 && s.in_flight.is_empty() && s.run_state == RunState::Idle
    })
    .await;
    assert_eq!(state.interrupted(), vec![0, 1]);
    assert_eq!(service.submissions(), vec![0, 1, 2, 3]);
}

#[tokio::test]
async fn test_stop_requeue_resubmits_on_next_start() {
    let (controller, service) = start_and_stop_with_two_processing(StopPolicy::Requeue).await;
    assert_polling_stopped(&service).await;

    let state = controller.snapshot();
    assert_eq!(state.pending_count(), 4);
    assert!(state.chunk(0).unwrap().job.is_none());

    service.release();
    controller.start().await.unwrap();
    let state = settle(&controller).await;
    assert_eq!(state.run_state, RunState::Completed);
    assert_eq!(state.completed_count, 4);
    assert_eq!(service.submissions().len(), 6);
}

#[tokio::test]
async fn test_stop_fail_marks_in_flight_failed() {
    let (controller, service) = start_and_stop_with_two_processing(StopPolicy::Fail).await;
    assert_polling_stopped(&service).await;

    let state = controller.snapshot();
    assert_eq!(state.failed_count, 2);
    assert_eq!(state.chunk(1).unwrap().status, ChunkStatus::Failed);
    assert!(state.chunk(1).unwrap().error.is_some());

    service.release();
    controller.start().await.unwrap();
    let state = settle(&controller).await;
    assert_eq!(state.run_state, RunState::Completed);
    assert_eq!(state.completed_count, 2);
    assert_eq!(state.failed_count, 2);
}

#[tokio::test]
async fn test_initialize_validates_input() {
    let services = PipelineServices {
        service: Arc::new(FakeService::new(Script::Hold)),
        assembler: Arc::new(TextAssembler::default()),
        results: Arc::new(CountingResults),
        logger: PipelineLogger::disabled(),
    };

    assert!(matches!(
        PipelineController::initialize(Vec::new(), options(10, 2), services.clone()),
        Err(PipelineError::EmptyItems)
    ));
    assert!(matches!(
        PipelineController::initialize(items(3), options(0, 2), services.clone()),
        Err(PipelineError::InvalidChunkSize)
    ));
    assert!(matches!(
        PipelineController::initialize(items(3), options(1, 0), services),
        Err(PipelineError::InvalidConcurrency)
    ));
}
