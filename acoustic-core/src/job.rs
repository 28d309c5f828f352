//! # Analysis Job Module
//!
//! Hands a sealed [`CaptureSession`] to the analysis backend and follows the
//! remote job until it reaches a terminal state.
//!
//! Polling is bounded: after `max_attempts` polls the job fails locally with
//! [`FailureReason::TimedOut`] and no further request is made. A transient
//! transport error uses up an attempt and is kept on the job as `last_error`.
//!
//! Polling never blocks the audio tick. Callers either drive
//! [`AnalysisJobClient::poll`] from their own render tick or move the loop to
//! a [`PollWorker`] thread.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use log::{debug, info, warn};
use thiserror::Error;
use uuid::Uuid;

use crate::audio::SampleSource;
use crate::config::PollConfig;
use crate::error::{BackendError, SessionError};
use crate::payload::{PollResponse, RemoteStatus, SubmissionPayload};
use crate::session::CaptureSession;

/// Status of a remote analysis job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Running,
    Complete,
    Failed,
}

impl From<RemoteStatus> for JobStatus {
    fn from(status: RemoteStatus) -> Self {
        match status {
            RemoteStatus::Queued => JobStatus::Queued,
            RemoteStatus::Running => JobStatus::Running,
            RemoteStatus::Complete => JobStatus::Complete,
            RemoteStatus::Failed => JobStatus::Failed,
        }
    }
}

/// Why a session ended up `Failed`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FailureReason {
    #[error("submission failed: {0}")]
    SubmissionFailed(String),

    #[error("analysis timed out")]
    TimedOut,

    /// The backend reported completion without any artifact.
    #[error("no result")]
    NoResult,

    #[error("analysis failed: {0}")]
    Backend(String),
}

/// Local view of a remote analysis job.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisJob {
    pub session_id: Uuid,
    pub remote_id: String,
    pub status: JobStatus,
    pub artifacts: Vec<String>,
    pub failure: Option<FailureReason>,
    /// Polls made so far.
    pub attempts: u32,
    /// Last transient error seen while polling.
    pub last_error: Option<String>,
}

impl AnalysisJob {
    pub fn queued(session_id: Uuid, remote_id: impl Into<String>) -> Self {
        Self {
            session_id,
            remote_id: remote_id.into(),
            status: JobStatus::Queued,
            artifacts: Vec::new(),
            failure: None,
            attempts: 0,
            last_error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, JobStatus::Complete | JobStatus::Failed)
    }

    fn fail(mut self, reason: FailureReason) -> Self {
        self.status = JobStatus::Failed;
        self.failure = Some(reason);
        self
    }
}

/// Transport used to reach the analysis service.
pub trait AnalysisBackend: Send + Sync {
    /// Enqueues a job and returns its remote id.
    fn submit(&self, payload: &SubmissionPayload) -> Result<String, BackendError>;

    fn fetch_status(&self, remote_id: &str) -> Result<PollResponse, BackendError>;
}

impl<B: AnalysisBackend + ?Sized> AnalysisBackend for Arc<B> {
    fn submit(&self, payload: &SubmissionPayload) -> Result<String, BackendError> {
        (**self).submit(payload)
    }

    fn fetch_status(&self, remote_id: &str) -> Result<PollResponse, BackendError> {
        (**self).fetch_status(remote_id)
    }
}

/// Cadence and bound of the poll loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::from(&PollConfig::default())
    }
}

impl From<&PollConfig> for PollPolicy {
    fn from(config: &PollConfig) -> Self {
        Self {
            interval: config.interval(),
            max_attempts: config.max_attempts,
        }
    }
}

/// Submits sessions and polls their jobs.
pub struct AnalysisJobClient<B: AnalysisBackend> {
    backend: Arc<B>,
    policy: PollPolicy,
}

impl<B: AnalysisBackend> Clone for AnalysisJobClient<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            policy: self.policy,
        }
    }
}

impl<B: AnalysisBackend> AnalysisJobClient<B> {
    pub fn new(backend: B, policy: PollPolicy) -> Self {
        Self::with_shared(Arc::new(backend), policy)
    }

    pub fn with_shared(backend: Arc<B>, policy: PollPolicy) -> Self {
        Self { backend, policy }
    }

    pub fn policy(&self) -> PollPolicy {
        self.policy
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Sends a stopped (or previously failed) session to the backend.
    ///
    /// On success the session is `Queued`. A rejected submission leaves it
    /// `Failed` with its frames intact so it can be submitted again.
    pub fn submit<S: SampleSource>(
        &self,
        session: &mut CaptureSession<S>,
    ) -> Result<AnalysisJob, SessionError> {
        let payload = session.begin_submission()?;
        match self.backend.submit(&payload) {
            Ok(remote_id) => {
                info!("Session {} submitted as job {}", session.id(), remote_id);
                session.mark_submitted(remote_id.clone())?;
                Ok(AnalysisJob::queued(session.id(), remote_id))
            }
            Err(e) => {
                session.mark_failed(FailureReason::SubmissionFailed(e.to_string()))?;
                Err(SessionError::Submission(e))
            }
        }
    }

    /// One status refresh. Terminal jobs are returned unchanged and the
    /// attempt bound is enforced without contacting the backend.
    pub fn poll(&self, job: &AnalysisJob) -> AnalysisJob {
        if job.is_terminal() {
            return job.clone();
        }
        if job.attempts >= self.policy.max_attempts {
            warn!(
                "Job {} still unfinished after {} polls",
                job.remote_id, job.attempts
            );
            return job.clone().fail(FailureReason::TimedOut);
        }

        let mut next = job.clone();
        next.attempts += 1;
        match self.backend.fetch_status(&job.remote_id) {
            Ok(response) => {
                next.last_error = None;
                apply_response(next, response)
            }
            Err(e) => {
                debug!("Poll {} of job {} failed: {}", next.attempts, job.remote_id, e);
                next.last_error = Some(e.to_string());
                next
            }
        }
    }

    /// Polls once and applies the result to `session`.
    pub fn refresh<S: SampleSource>(
        &self,
        job: &AnalysisJob,
        session: &mut CaptureSession<S>,
    ) -> Result<AnalysisJob, SessionError> {
        let next = self.poll(job);
        session.reconcile(&next)?;
        Ok(next)
    }

    /// Polls at the policy interval until the job is terminal or `cancel`
    /// fires. Cancelling leaves the remote job untouched.
    pub fn wait_for_completion(
        &self,
        job: AnalysisJob,
        cancel: &Receiver<()>,
        mut on_update: impl FnMut(&AnalysisJob),
    ) -> AnalysisJob {
        let mut job = job;
        let mut cancelled = false;
        while !cancelled && !job.is_terminal() {
            crossbeam_channel::select! {
                recv(cancel) -> _ => {
                    debug!("Polling of job {} cancelled", job.remote_id);
                    cancelled = true;
                },
                default(self.policy.interval) => {
                    job = self.poll(&job);
                    on_update(&job);
                },
            }
        }
        job
    }
}

impl<B: AnalysisBackend + 'static> AnalysisJobClient<B> {
    /// Moves the poll loop to its own thread.
    pub fn spawn_poller(&self, job: AnalysisJob) -> PollWorker {
        let (update_tx, update_rx) = crossbeam_channel::unbounded();
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(1);
        let client = self.clone();
        let thread_handle = thread::spawn(move || {
            debug!("Poll thread started for job {}", job.remote_id);
            let last = client.wait_for_completion(job, &shutdown_rx, |update| {
                let _ = update_tx.send(update.clone());
            });
            debug!("Poll thread for job {} exiting ({:?})", last.remote_id, last.status);
        });
        PollWorker {
            updates: update_rx,
            shutdown_tx,
            thread_handle: Some(thread_handle),
        }
    }
}

fn apply_response(mut job: AnalysisJob, response: PollResponse) -> AnalysisJob {
    match JobStatus::from(response.status) {
        JobStatus::Complete if response.artifacts.is_empty() => job.fail(FailureReason::NoResult),
        JobStatus::Complete => {
            job.status = JobStatus::Complete;
            job.artifacts = response.artifacts;
            job
        }
        JobStatus::Failed => {
            let reason = response.error.unwrap_or_else(|| "analysis failed".into());
            job.fail(FailureReason::Backend(reason))
        }
        status => {
            job.status = status;
            job
        }
    }
}

/// Background poll loop for one job.
///
/// Dropping the worker stops polling; the backend job keeps running.
#[derive(Debug)]
pub struct PollWorker {
    updates: Receiver<AnalysisJob>,
    shutdown_tx: Sender<()>,
    thread_handle: Option<JoinHandle<()>>,
}

impl PollWorker {
    /// Every job snapshot published by the poll thread, in order.
    pub fn updates(&self) -> &Receiver<AnalysisJob> {
        &self.updates
    }

    /// Most recent snapshot not yet consumed, if any.
    pub fn try_latest(&self) -> Option<AnalysisJob> {
        self.updates.try_iter().last()
    }

    pub fn is_finished(&self) -> bool {
        self.thread_handle
            .as_ref()
            .is_none_or(|handle| handle.is_finished())
    }

    /// Stops the loop and waits for the thread to exit.
    pub fn cancel(&mut self) {
        let _ = self.shutdown_tx.try_send(());
        if let Some(handle) = self.thread_handle.take() {
            if handle.join().is_err() {
                warn!("Poll thread panicked");
            }
        }
    }
}

impl Drop for PollWorker {
    fn drop(&mut self) {
        self.cancel();
    }
}
