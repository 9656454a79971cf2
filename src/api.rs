use crate::model::{AdjustRequest, Block, Preview, Step};
use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::thread;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid backend url: {0}")]
    InvalidUrl(String),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("backend returned http {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid payload from backend: {0}")]
    Payload(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct PlannerApi {
    base: Url,
    client: reqwest::blocking::Client,
}

#[derive(Debug, Serialize)]
struct PreviewRequest<'a> {
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    priority: Option<u32>,
}

#[derive(Debug, Serialize)]
struct ConfirmRequest<'a> {
    steps: &'a [Step],
    blocks: &'a [Block],
    #[serde(skip_serializing_if = "Option::is_none")]
    category: Option<String>,
    note_text: &'a str,
}

#[derive(Debug, Serialize)]
struct PlanRequest<'a> {
    text: &'a str,
}

impl PlannerApi {
    pub fn new(base_url: &str) -> Result<Self, ApiError> {
        let base = Url::parse(base_url).map_err(|err| ApiError::InvalidUrl(err.to_string()))?;
        if base.cannot_be_a_base() {
            return Err(ApiError::InvalidUrl(format!(
                "{base_url} cannot be used as a base url"
            )));
        }
        Ok(Self {
            base,
            client: reqwest::blocking::Client::new(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    pub fn list_blocks(&self, date: NaiveDate) -> Result<Vec<Block>, ApiError> {
        let url = self.endpoint(&["api", "blocks"])?;
        let response = self
            .client
            .get(url)
            .query(&[("date", date.format("%Y-%m-%d").to_string())])
            .send()?;
        Self::parse(response)
    }

    pub fn preview_note(&self, text: &str, priority: Option<u32>) -> Result<Preview, ApiError> {
        let url = self.endpoint(&["api", "notes", "preview"])?;
        let response = self
            .client
            .post(url)
            .json(&PreviewRequest { text, priority })
            .send()?;
        Self::parse(response)
    }

    pub fn confirm_plan(&self, preview: &Preview, note_text: &str) -> Result<(), ApiError> {
        let url = self.endpoint(&["api", "notes", "confirm"])?;
        let response = self
            .client
            .post(url)
            .json(&ConfirmRequest {
                steps: &preview.steps,
                blocks: &preview.suggested_blocks,
                category: preview.confirm_category(),
                note_text,
            })
            .send()?;
        Self::check(response)
    }

    pub fn plan_from_text(&self, text: &str) -> Result<Preview, ApiError> {
        let url = self.endpoint(&["api", "nlp", "plan"])?;
        let response = self.client.post(url).json(&PlanRequest { text }).send()?;
        Self::parse(response)
    }

    pub fn adjust_block(&self, request: &AdjustRequest) -> Result<(), ApiError> {
        let url = self.endpoint(&["api", "blocks", "adjust"])?;
        let response = self.client.post(url).json(request).send()?;
        Self::check(response)
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.base.clone();
        {
            let mut parts = url
                .path_segments_mut()
                .map_err(|_| ApiError::InvalidUrl("backend url cannot be a base".to_string()))?;
            parts.pop_if_empty();
            for segment in segments {
                parts.push(segment);
            }
        }
        Ok(url)
    }

    fn parse<T: DeserializeOwned>(response: reqwest::blocking::Response) -> Result<T, ApiError> {
        let status = response.status();
        let body = response.text()?;
        if !status.is_success() {
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(serde_json::from_str(&body)?)
    }

    fn check(response: reqwest::blocking::Response) -> Result<(), ApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

/// One backend round trip, submitted by the view and executed off the UI
/// thread. The generation is echoed back so the view can drop answers to
/// requests it no longer cares about.
#[derive(Debug, Clone)]
pub enum Job {
    FetchBlocks {
        generation: u64,
        date: NaiveDate,
    },
    PreviewNote {
        generation: u64,
        text: String,
        priority: Option<u32>,
    },
    ConfirmPlan {
        generation: u64,
        preview: Preview,
        note_text: String,
    },
    PlanCommand {
        generation: u64,
        text: String,
    },
    AdjustBlock {
        generation: u64,
        request: AdjustRequest,
    },
}

#[derive(Debug)]
pub enum Outcome {
    Blocks {
        generation: u64,
        date: NaiveDate,
        result: Result<Vec<Block>, ApiError>,
    },
    NotePreview {
        generation: u64,
        result: Result<Preview, ApiError>,
    },
    Confirmed {
        generation: u64,
        result: Result<(), ApiError>,
    },
    CommandPlan {
        generation: u64,
        result: Result<Preview, ApiError>,
    },
    Adjusted {
        generation: u64,
        result: Result<(), ApiError>,
    },
}

/// Runs jobs sequentially on a background thread; the sender half hangs up
/// when the view goes away and the worker exits with it. Jobs are never
/// cancelled, so a slow answer can arrive after the view moved on - the
/// generation check on the receiving side handles that.
pub fn spawn_worker(api: PlannerApi) -> (Sender<Job>, Receiver<Outcome>) {
    let (job_tx, job_rx) = channel::<Job>();
    let (outcome_tx, outcome_rx) = channel::<Outcome>();
    thread::spawn(move || {
        for job in job_rx {
            let outcome = run_job(&api, job);
            if outcome_tx.send(outcome).is_err() {
                break;
            }
        }
    });
    (job_tx, outcome_rx)
}

fn run_job(api: &PlannerApi, job: Job) -> Outcome {
    match job {
        Job::FetchBlocks { generation, date } => {
            tracing::debug!(%date, "fetching blocks");
            let result = api.list_blocks(date);
            if let Err(err) = &result {
                tracing::warn!(%date, error = %err, "block list request failed");
            }
            Outcome::Blocks {
                generation,
                date,
                result,
            }
        }
        Job::PreviewNote {
            generation,
            text,
            priority,
        } => {
            tracing::debug!("requesting note preview");
            let result = api.preview_note(&text, priority);
            if let Err(err) = &result {
                tracing::warn!(error = %err, "note preview request failed");
            }
            Outcome::NotePreview { generation, result }
        }
        Job::ConfirmPlan {
            generation,
            preview,
            note_text,
        } => {
            tracing::debug!("confirming plan");
            let result = api.confirm_plan(&preview, &note_text);
            if let Err(err) = &result {
                tracing::warn!(error = %err, "plan confirm request failed");
            }
            Outcome::Confirmed { generation, result }
        }
        Job::PlanCommand { generation, text } => {
            tracing::debug!("requesting plan from command");
            let result = api.plan_from_text(&text);
            if let Err(err) = &result {
                tracing::warn!(error = %err, "nlp plan request failed");
            }
            Outcome::CommandPlan { generation, result }
        }
        Job::AdjustBlock {
            generation,
            request,
        } => {
            tracing::debug!(block_id = %request.block_id, "adjusting block");
            let result = api.adjust_block(&request);
            if let Err(err) = &result {
                tracing::warn!(block_id = %request.block_id, error = %err, "adjust request failed");
            }
            Outcome::Adjusted { generation, result }
        }
    }
}
