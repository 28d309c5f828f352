//! HTTP transport for the analysis backend.
//!
//! `POST {base}/api/analysis/jobs` enqueues a submission and returns
//! `{ "jobId": ... }`; `GET {base}/api/analysis/jobs/{id}` returns the job
//! status. Requests are blocking and must stay off the audio thread.

use std::time::Duration;

use log::debug;
use reqwest::blocking::{Client, RequestBuilder, Response};

use crate::config::BackendConfig;
use crate::error::BackendError;
use crate::job::AnalysisBackend;
use crate::payload::{PollResponse, SubmissionPayload, SubmitResponse};

const USER_AGENT: &str = concat!("acoustic-core/", env!("CARGO_PKG_VERSION"));
const JOBS_PATH: &str = "/api/analysis/jobs";

pub struct HttpBackend {
    http_client: Client,
    base_url: String,
    api_token: Option<String>,
}

impl HttpBackend {
    pub fn new(config: &BackendConfig) -> Result<Self, BackendError> {
        let http_client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| BackendError::Network(e.to_string()))?;

        Ok(Self {
            http_client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_token: config.api_token.clone(),
        })
    }

    pub fn jobs_url(&self) -> String {
        format!("{}{}", self.base_url, JOBS_PATH)
    }

    pub fn job_url(&self, remote_id: &str) -> String {
        format!("{}/{}", self.jobs_url(), remote_id)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

fn check_status(response: Response) -> Result<Response, BackendError> {
    let status = response.status();
    if !status.is_success() {
        let error_text = response.text().unwrap_or_default();
        return Err(BackendError::Status(status.as_u16(), error_text));
    }
    Ok(response)
}

fn map_send_error(e: reqwest::Error) -> BackendError {
    if e.is_decode() {
        BackendError::Decode(e.to_string())
    } else {
        BackendError::Network(e.to_string())
    }
}

impl AnalysisBackend for HttpBackend {
    fn submit(&self, payload: &SubmissionPayload) -> Result<String, BackendError> {
        let url = self.jobs_url();
        debug!("POST {}", url);
        let response = self
            .authorize(self.http_client.post(&url).json(payload))
            .send()
            .map_err(map_send_error)?;
        let body: SubmitResponse = check_status(response)?
            .json()
            .map_err(|e| BackendError::Decode(e.to_string()))?;
        Ok(body.job_id)
    }

    fn fetch_status(&self, remote_id: &str) -> Result<PollResponse, BackendError> {
        let url = self.job_url(remote_id);
        debug!("GET {}", url);
        let response = self
            .authorize(self.http_client.get(&url))
            .send()
            .map_err(map_send_error)?;
        check_status(response)?
            .json()
            .map_err(|e| BackendError::Decode(e.to_string()))
    }
}
