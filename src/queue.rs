use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::{QueueError, QueueResult};
use crate::{JobId, JobRequest, RenderJob, Status, ValidationError, VideoType, CANCELLED_MESSAGE};

const RELEASED_MESSAGE: &str = "Released before it finished";

/// Wake-up reasons sent to the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    JobAdded(JobId),
    JobUpdated(JobId),
    JobRemoved(JobId),
    Cleared,
    MarkerReleased(JobId),
    CancelRequested(JobId),
}

#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Capacity of the scheduler's wake-up channel.
    pub event_capacity: usize,
    /// How long progress is dropped and claiming paused after a cancel.
    pub cancel_cooldown: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        QueueOptions {
            event_capacity: 64,
            cancel_cooldown: Duration::from_millis(1000),
        }
    }
}

/// Fields to merge into a job with [`QueueHandle::update`].
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub status: Option<Status>,
    pub progress: Option<f64>,
    pub current_video_type: Option<VideoType>,
    pub result: Option<(VideoType, String)>,
    pub error: Option<String>,
}

/// Result of asking the store for the next job to run.
#[derive(Debug)]
pub enum Claim {
    Claimed {
        job: RenderJob,
        token: CancellationToken,
    },
    /// Another job holds the processing marker.
    Busy,
    /// A cancel happened recently, try again at the given instant.
    CoolingDown(Instant),
    Idle,
}

/// How a processing run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed,
    Failed(String),
}

struct ActiveJob {
    id: JobId,
    token: CancellationToken,
}

#[derive(Default)]
struct QueueState {
    jobs: Vec<RenderJob>,
    active: Option<ActiveJob>,
    cooldown_until: Option<Instant>,
}

impl QueueState {
    fn job_mut(&mut self, id: JobId) -> Option<&mut RenderJob> {
        self.jobs.iter_mut().find(|job| job.id == id)
    }

    fn is_active(&self, id: JobId) -> bool {
        self.active.as_ref().map(|active| active.id) == Some(id)
    }

    fn cooling_down(&mut self) -> Option<Instant> {
        match self.cooldown_until {
            Some(until) if Instant::now() < until => Some(until),
            Some(_) => {
                self.cooldown_until = None;
                None
            }
            None => None,
        }
    }

    /// The job that may receive processor writes right now.
    fn writable(&mut self, id: JobId) -> Option<&mut RenderJob> {
        if !self.is_active(id) || self.cooling_down().is_some() {
            return None;
        }
        self.job_mut(id)
            .filter(|job| job.status == Status::Processing)
    }
}

/// In-memory render queue shared by the HTTP layer and the scheduler.
#[derive(Clone)]
pub struct QueueHandle {
    state: Arc<Mutex<QueueState>>,
    events: async_channel::Sender<QueueEvent>,
    revision: Arc<watch::Sender<u64>>,
    cancel_cooldown: Duration,
}

impl QueueHandle {
    pub fn new(options: QueueOptions) -> (Self, async_channel::Receiver<QueueEvent>) {
        let (events, recv_events) = async_channel::bounded(options.event_capacity.max(1));
        let (revision, _) = watch::channel(0);
        let handle = QueueHandle {
            state: Arc::new(Mutex::new(QueueState::default())),
            events,
            revision: Arc::new(revision),
            cancel_cooldown: options.cancel_cooldown,
        };
        (handle, recv_events)
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, event: QueueEvent) {
        self.revision.send_modify(|revision| *revision += 1);
        // A full channel already holds a pending wake-up.
        if let Err(err) = self.events.try_send(event) {
            trace!(error = %err, "Scheduler wake-up not delivered");
        }
    }

    pub fn add(&self, request: JobRequest) -> Result<JobId, ValidationError> {
        request.validate()?;
        let job = RenderJob::new(request);
        let id = job.id;
        debug!(job_id = %id, single_version = job.request.single_version, "Queued render job");
        self.state().jobs.push(job);
        self.notify(QueueEvent::JobAdded(id));
        Ok(id)
    }

    /// Queues one single-version job per requested video type.
    pub fn submit_variants(
        &self,
        request: JobRequest,
        video_types: &[VideoType],
    ) -> Result<Vec<JobId>, ValidationError> {
        request.validate()?;
        video_types
            .iter()
            .map(|video_type| {
                let mut variant = request.clone();
                variant.single_version = true;
                variant.metadata.video_type = *video_type;
                self.add(variant)
            })
            .collect()
    }

    pub fn remove(&self, id: JobId) -> QueueResult<()> {
        {
            let mut state = self.state();
            if state.is_active(id) {
                return Err(QueueError::JobProcessing(id));
            }
            let before = state.jobs.len();
            state.jobs.retain(|job| job.id != id);
            if state.jobs.len() == before {
                return Ok(());
            }
        }
        debug!(job_id = %id, "Removed render job");
        self.notify(QueueEvent::JobRemoved(id));
        Ok(())
    }

    /// Drops every job except the one being processed. Returns how many went.
    pub fn clear(&self) -> usize {
        let removed = {
            let mut state = self.state();
            let active = state.active.as_ref().map(|active| active.id);
            let before = state.jobs.len();
            state
                .jobs
                .retain(|job| job.status == Status::Processing || Some(job.id) == active);
            before - state.jobs.len()
        };
        debug!(removed, "Cleared render queue");
        self.notify(QueueEvent::Cleared);
        removed
    }

    /// Merges `update` into a job. Entering or leaving `processing` is tied to
    /// the marker, so only the marked job may be in that status.
    pub fn update(&self, id: JobId, update: JobUpdate) -> QueueResult<()> {
        {
            let mut state = self.state();
            let marked = state.is_active(id);
            let Some(job) = state.job_mut(id) else {
                return Ok(());
            };
            if let Some(status) = update.status.filter(|status| *status != job.status) {
                if status == Status::Processing && !marked {
                    return Err(QueueError::MarkerNotHeld(id));
                }
                if marked {
                    return Err(QueueError::JobProcessing(id));
                }
            }
            if let Some(status) = update.status {
                if status != job.status && !job.status.can_transition_to(status) {
                    return Err(QueueError::InvalidTransition {
                        id,
                        from: job.status,
                        to: status,
                    });
                }
                job.status = status;
            }
            if let Some(progress) = update.progress {
                job.progress = progress.clamp(0.0, 1.0);
            }
            if let Some(video_type) = update.current_video_type {
                job.current_video_type = Some(video_type);
            }
            if let Some((video_type, output)) = update.result {
                job.result.insert(video_type, output);
            }
            if let Some(error) = update.error {
                job.error = Some(error);
            }
        }
        self.notify(QueueEvent::JobUpdated(id));
        Ok(())
    }

    /// Points the marker at `id`, moving that job to `processing`, or releases
    /// it with `None`. A held marker is never handed to another job. Releasing
    /// cancels the marked job's token and fails it if it never finished.
    pub fn set_processing_marker(&self, id: Option<JobId>) -> QueueResult<()> {
        let event = {
            let mut state = self.state();
            match (id, state.active.take()) {
                (Some(id), Some(active)) => {
                    let held = active.id;
                    state.active = Some(active);
                    if held == id {
                        return Ok(());
                    }
                    return Err(QueueError::MarkerHeld(held));
                }
                (Some(id), None) => {
                    let job = state.job_mut(id).ok_or(QueueError::JobNotFound(id))?;
                    if !job.status.can_transition_to(Status::Processing) {
                        return Err(QueueError::InvalidTransition {
                            id,
                            from: job.status,
                            to: Status::Processing,
                        });
                    }
                    job.status = Status::Processing;
                    job.progress = 0.0;
                    job.current_video_type = None;
                    job.error = None;
                    state.active = Some(ActiveJob {
                        id,
                        token: CancellationToken::new(),
                    });
                    QueueEvent::JobUpdated(id)
                }
                (None, Some(active)) => {
                    active.token.cancel();
                    if let Some(job) = state
                        .job_mut(active.id)
                        .filter(|job| job.status == Status::Processing)
                    {
                        job.status = Status::Error;
                        job.error = Some(RELEASED_MESSAGE.to_string());
                    }
                    QueueEvent::MarkerReleased(active.id)
                }
                (None, None) => return Ok(()),
            }
        };
        self.notify(event);
        Ok(())
    }

    pub fn is_processing(&self) -> bool {
        self.state().active.is_some()
    }

    pub fn processing_id(&self) -> Option<JobId> {
        self.state().active.as_ref().map(|active| active.id)
    }

    pub fn get(&self, id: JobId) -> Option<RenderJob> {
        self.state().jobs.iter().find(|job| job.id == id).cloned()
    }

    pub fn snapshot(&self) -> Vec<RenderJob> {
        self.state().jobs.clone()
    }

    /// Revision counter bumped on every change, for observers.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    /// Resolves with the job once it is complete or errored, or `None` if it
    /// disappears from the queue first.
    pub async fn wait_until_settled(&self, id: JobId) -> Option<RenderJob> {
        let mut changes = self.subscribe();
        loop {
            let job = self.get(id)?;
            if job.status.is_terminal() {
                return Some(job);
            }
            changes.changed().await.ok()?;
        }
    }

    /// Atomically hands the first pending job to the caller.
    pub fn claim_next(&self) -> Claim {
        let claimed = {
            let mut state = self.state();
            if state.active.is_some() {
                return Claim::Busy;
            }
            if let Some(until) = state.cooling_down() {
                return Claim::CoolingDown(until);
            }
            let Some(job) = state
                .jobs
                .iter_mut()
                .find(|job| job.status == Status::Pending)
            else {
                return Claim::Idle;
            };
            job.status = Status::Processing;
            job.progress = 0.0;
            job.current_video_type = None;
            job.error = None;
            let job = job.clone();
            let token = CancellationToken::new();
            state.active = Some(ActiveJob {
                id: job.id,
                token: token.clone(),
            });
            (job, token)
        };
        info!(job_id = %claimed.0.id, "Claimed render job");
        self.notify(QueueEvent::JobUpdated(claimed.0.id));
        Claim::Claimed {
            job: claimed.0,
            token: claimed.1,
        }
    }

    /// Starts a video type sub-step: progress back to 0.
    pub fn begin_sub_step(&self, id: JobId, video_type: VideoType) -> bool {
        let applied = match self.state().writable(id) {
            Some(job) => {
                job.progress = 0.0;
                job.current_video_type = Some(video_type);
                true
            }
            None => false,
        };
        if applied {
            self.notify(QueueEvent::JobUpdated(id));
        }
        applied
    }

    /// Applies a progress tick from the engine. Ticks for a job that no longer
    /// holds the marker, or that would move progress backwards, are dropped.
    pub fn report_progress(&self, id: JobId, fraction: f64) -> bool {
        if !fraction.is_finite() {
            return false;
        }
        let applied = match self.state().writable(id) {
            Some(job) if fraction >= job.progress => {
                job.progress = fraction.min(1.0);
                true
            }
            _ => false,
        };
        if applied {
            self.notify(QueueEvent::JobUpdated(id));
        } else {
            trace!(job_id = %id, fraction, "Dropped progress tick");
        }
        applied
    }

    pub fn record_output(&self, id: JobId, video_type: VideoType, output: String) -> bool {
        let applied = match self.state().writable(id) {
            Some(job) => {
                job.result.insert(video_type, output);
                true
            }
            None => false,
        };
        if applied {
            self.notify(QueueEvent::JobUpdated(id));
        }
        applied
    }

    pub fn record_error(&self, id: JobId, message: String) -> bool {
        let applied = match self.state().writable(id) {
            Some(job) => {
                job.error = Some(message);
                true
            }
            None => false,
        };
        if applied {
            self.notify(QueueEvent::JobUpdated(id));
        }
        applied
    }

    /// Writes the terminal status and releases the marker, unless the job was
    /// cancelled meanwhile.
    pub fn finish(&self, id: JobId, outcome: Outcome) -> bool {
        {
            let mut state = self.state();
            if !state.is_active(id) {
                debug!(job_id = %id, "Ignoring finish of inactive job");
                return false;
            }
            state.active = None;
            if let Some(job) = state.job_mut(id) {
                match outcome {
                    Outcome::Completed => {
                        job.status = Status::Complete;
                        job.progress = 1.0;
                        job.error = None;
                    }
                    Outcome::Failed(message) => {
                        job.status = Status::Error;
                        job.error = Some(message);
                    }
                }
            }
        }
        self.notify(QueueEvent::MarkerReleased(id));
        true
    }

    /// Fails the processing job with "Cancelled by user" and frees the
    /// scheduler. Returns the cancelled job, if any.
    pub fn cancel(&self) -> Option<JobId> {
        let id = {
            let mut state = self.state();
            let active = state.active.take()?;
            if let Some(job) = state.job_mut(active.id) {
                job.status = Status::Error;
                job.error = Some(CANCELLED_MESSAGE.to_string());
            }
            state.cooldown_until = Some(Instant::now() + self.cancel_cooldown);
            active.token.cancel();
            active.id
        };
        warn!(job_id = %id, "Render job cancelled");
        self.notify(QueueEvent::CancelRequested(id));
        Some(id)
    }
}
