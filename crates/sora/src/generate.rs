//! The generation state machine.
//!
//! One invocation drives `INIT → AUTH → [UPLOAD] → SUBMIT →
//! POLL{queued|rendering} → FINISHED | FAILED` for a single credential
//! and request, emitting [`GenerationEvent`]s over an `mpsc` channel.
//! Every failure is normalized into a terminal `Error` event; the
//! producer never panics the consumer.
//!
//! [`resume`] re-enters the polling loop for a previously submitted
//! task without issuing a new creation call, making restart recovery
//! idempotent with respect to upstream submissions.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use vidpool_core::types::DbId;

use crate::client::SoraClient;
use crate::error::{
    classify_create_failure, classify_upload_failure, UpstreamError, CODE_AUTH_EXPIRED,
    CODE_AUTH_FAILED, CODE_CREATE_FAILED, CODE_MISSING_TASK_ID, CODE_POLL_FAILED,
    CODE_RESUME_FAILED, CODE_TIMEOUT, CODE_UPLOAD_EXCEPTION, CODE_UPLOAD_MISSING_ID,
};
use crate::events::{
    FinishedInfo, GenerationEvent, GenerationFailure, ProgressStage, ProgressTracker,
    ProgressUpdate,
};
use crate::messages::{
    CreateResponse, DraftDetail, DraftItem, DraftListing, PendingTask, UploadInfo,
};
use crate::sentinel::{DEFAULT_FLOW, SENTINEL_HEADER};

/// Requested framing for text-only generations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    Portrait,
    Landscape,
}

impl Orientation {
    pub fn as_str(self) -> &'static str {
        match self {
            Orientation::Portrait => "portrait",
            Orientation::Landscape => "landscape",
        }
    }
}

/// Requested output resolution tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoSize {
    Small,
    Large,
}

impl VideoSize {
    pub fn as_str(self) -> &'static str {
        match self {
            VideoSize::Small => "small",
            VideoSize::Large => "large",
        }
    }
}

/// One generation request, passed to the client as plain data.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: String,
    /// Ignored when `start_image` is set (the image implies framing);
    /// defaults to portrait otherwise.
    pub orientation: Option<Orientation>,
    pub frames: i32,
    pub size: VideoSize,
    pub start_image: Option<Vec<u8>>,
    pub poll_interval: Duration,
    /// Zero disables the wall-clock timeout.
    pub timeout: Duration,
}

/// Send an event; `false` means the consumer is gone and the run
/// should stop silently.
async fn emit(tx: &mpsc::Sender<GenerationEvent>, event: GenerationEvent) -> bool {
    tx.send(event).await.is_ok()
}

async fn fail(tx: &mpsc::Sender<GenerationEvent>, failure: GenerationFailure) {
    let _ = emit(tx, GenerationEvent::Error(failure)).await;
}

/// Run a fresh generation end to end.
pub async fn generate(
    client: SoraClient,
    request: GenerationRequest,
    tx: mpsc::Sender<GenerationEvent>,
) {
    // AUTH
    if let Err(e) = client.fetch_session_token().await {
        fail(&tx, GenerationFailure::new(CODE_AUTH_FAILED, e.to_string())).await;
        return;
    }
    if !emit(&tx, GenerationEvent::Auth).await {
        return;
    }

    // Warm up the backend session; failures here are not significant.
    if let Err(e) = client.get("/backend/authenticate").await {
        tracing::debug!(error = %e, "backend authenticate warm-up failed");
    }

    // UPLOAD
    let mut upload_id = None;
    if let Some(image) = request.start_image.clone() {
        match upload_start_image(&client, image).await {
            Ok(media_id) => {
                if !emit(
                    &tx,
                    GenerationEvent::Uploaded {
                        media_id: media_id.clone(),
                    },
                )
                .await
                {
                    return;
                }
                upload_id = Some(media_id);
            }
            Err(failure) => {
                fail(&tx, failure).await;
                return;
            }
        }
    }

    // SUBMIT
    let payload = create_payload(&request, upload_id.as_deref());
    let sentinel = client.sentinel_header(DEFAULT_FLOW).await;
    let extra_headers: Vec<(&str, String)> = sentinel
        .map(|token| vec![(SENTINEL_HEADER, token)])
        .unwrap_or_default();

    let response = match client
        .post_json("/backend/nf/create", &payload, &extra_headers)
        .await
    {
        Ok(response) => response,
        Err(e) => {
            fail(&tx, GenerationFailure::new(CODE_CREATE_FAILED, e.to_string())).await;
            return;
        }
    };

    if !response.status().is_success() {
        let err = UpstreamError::from_response(response).await;
        let code = classify_create_failure(&err);
        let message = err
            .message
            .clone()
            .unwrap_or_else(|| format!("creation call failed with status {}", err.http_status));
        fail(
            &tx,
            GenerationFailure::new(code, message).with_details(err.details()),
        )
        .await;
        return;
    }

    let task_id = match response.json::<CreateResponse>().await {
        Ok(created) => created
            .task()
            .and_then(|t| t.resolved_task_id().map(str::to_string))
            .map(|id| (id, created.task().and_then(|t| t.priority))),
        Err(e) => {
            fail(
                &tx,
                GenerationFailure::new(
                    CODE_CREATE_FAILED,
                    format!("creation response was not valid JSON: {e}"),
                ),
            )
            .await;
            return;
        }
    };
    let Some((task_id, priority)) = task_id else {
        fail(
            &tx,
            GenerationFailure::new(
                CODE_MISSING_TASK_ID,
                "creation succeeded but no task id was returned",
            ),
        )
        .await;
        return;
    };

    tracing::info!(task_id = %task_id, ?priority, "generation task accepted");
    if !emit(
        &tx,
        GenerationEvent::Queued {
            task_id: task_id.clone(),
            priority,
        },
    )
    .await
    {
        return;
    }

    // POLL
    poll(&client, &task_id, request.poll_interval, request.timeout, &tx).await;
}

/// Resume polling for an already submitted task.
///
/// No new creation call is issued; queue position and percentage are
/// rederived purely from upstream queries.
pub async fn resume(
    client: SoraClient,
    account_id: DbId,
    task_id: String,
    poll_interval: Duration,
    timeout: Duration,
    tx: mpsc::Sender<GenerationEvent>,
) {
    if !emit(&tx, GenerationEvent::Account { account_id }).await {
        return;
    }
    if let Err(e) = client.fetch_session_token().await {
        fail(&tx, GenerationFailure::new(CODE_RESUME_FAILED, e.to_string())).await;
        return;
    }
    if !emit(&tx, GenerationEvent::Auth).await {
        return;
    }

    tracing::info!(task_id = %task_id, account_id, "resuming generation polling");
    poll(&client, &task_id, poll_interval, timeout, &tx).await;
}

async fn upload_start_image(
    client: &SoraClient,
    image: Vec<u8>,
) -> Result<String, GenerationFailure> {
    let response = client
        .post_multipart("/backend/uploads", "file", "photo.jpg", image, "image/jpeg")
        .await
        .map_err(|e| GenerationFailure::new(CODE_UPLOAD_EXCEPTION, e.to_string()))?;

    if !response.status().is_success() {
        let err = UpstreamError::from_response(response).await;
        let code = classify_upload_failure(&err);
        let message = err
            .message
            .clone()
            .unwrap_or_else(|| format!("upload failed with status {}", err.http_status));
        return Err(GenerationFailure::new(code, message).with_details(err.details()));
    }

    let media: UploadInfo = response
        .json()
        .await
        .map_err(|e| GenerationFailure::new(CODE_UPLOAD_EXCEPTION, e.to_string()))?;
    media.id.filter(|id| !id.is_empty()).ok_or_else(|| {
        GenerationFailure::new(
            CODE_UPLOAD_MISSING_ID,
            "upload succeeded but no media id was returned",
        )
    })
}

/// Creation payload for the `/backend/nf/create` endpoint.
fn create_payload(request: &GenerationRequest, upload_id: Option<&str>) -> serde_json::Value {
    let mut payload = serde_json::json!({
        "kind": "video",
        "prompt": request.prompt,
        "title": null,
        "size": request.size.as_str(),
        "n_frames": request.frames,
        "inpaint_items": [],
        "remix_target_id": null,
        "cameo_ids": null,
        "cameo_replacements": null,
        "model": "sy_8",
        "style_id": null,
        "audio_caption": null,
        "audio_transcript": null,
        "video_caption": null,
        "storyboard_id": null,
    });
    if let Some(upload_id) = upload_id {
        payload["inpaint_items"] = serde_json::json!([
            { "kind": "upload", "upload_id": upload_id }
        ]);
    } else {
        let orientation = request.orientation.unwrap_or(Orientation::Portrait);
        payload["orientation"] = serde_json::Value::String(orientation.as_str().into());
    }
    payload
}

/// One progress payload from a pending-feed observation.
fn progress_from_pending(task_id: &str, item: &PendingTask) -> ProgressUpdate {
    let stage = if item.is_rendering() {
        ProgressStage::Rendering {
            percent: item.progress_pct,
        }
    } else {
        ProgressStage::Queued {
            queue_position: item.progress_pos_in_queue,
            eta_secs: item.estimated_queue_wait_time,
        }
    };
    ProgressUpdate {
        task_id: task_id.to_string(),
        stage,
        message: item.queue_status_message.clone(),
    }
}

/// Initial payload emitted before the task shows up on either feed.
fn initial_progress(task_id: &str) -> ProgressUpdate {
    ProgressUpdate {
        task_id: task_id.to_string(),
        stage: ProgressStage::Queued {
            queue_position: None,
            eta_secs: None,
        },
        message: None,
    }
}

/// Poll the pending feed and the drafts listing until a terminal state
/// or timeout.
async fn poll(
    client: &SoraClient,
    task_id: &str,
    poll_interval: Duration,
    timeout: Duration,
    tx: &mpsc::Sender<GenerationEvent>,
) {
    let started = Instant::now();
    let mut generation_id: Option<String> = None;
    let mut tracker = ProgressTracker::default();

    loop {
        if !timeout.is_zero() && started.elapsed() > timeout {
            fail(
                tx,
                GenerationFailure::new(CODE_TIMEOUT, "generation timed out"),
            )
            .await;
            return;
        }

        // Lightweight pending feed; unavailability is tolerated.
        if let Some(item) = fetch_pending(client, task_id).await {
            if item.is_terminal_failure() {
                let code = item.failure_code();
                fail(
                    tx,
                    GenerationFailure::new(
                        code.clone(),
                        format!("generation failed: {code}"),
                    )
                    .with_details(serde_json::to_value(&item).unwrap_or_default()),
                )
                .await;
                return;
            }
            let update = progress_from_pending(task_id, &item);
            if tracker.should_emit(&update)
                && !emit(tx, GenerationEvent::Progress(update)).await
            {
                return;
            }
        } else if !tracker.has_emitted() {
            let update = initial_progress(task_id);
            if tracker.should_emit(&update)
                && !emit(tx, GenerationEvent::Progress(update)).await
            {
                return;
            }
        }

        // Richer drafts listing; failures here are terminal.
        let response = match client
            .get("/backend/project_y/profile/drafts?limit=15")
            .await
        {
            Ok(response) => response,
            Err(e) => {
                fail(tx, GenerationFailure::new(CODE_POLL_FAILED, e.to_string())).await;
                return;
            }
        };
        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            fail(
                tx,
                GenerationFailure::new(CODE_AUTH_EXPIRED, "authentication expired while polling"),
            )
            .await;
            return;
        }
        if response.status().is_client_error() || response.status().is_server_error() {
            let err = UpstreamError::from_response(response).await;
            let code = err
                .code
                .clone()
                .filter(|c| !c.is_empty())
                .unwrap_or_else(|| CODE_POLL_FAILED.to_string());
            let message = err
                .message
                .clone()
                .unwrap_or_else(|| format!("drafts listing failed with status {}", err.http_status));
            fail(
                tx,
                GenerationFailure::new(code, message).with_details(err.details()),
            )
            .await;
            return;
        }

        let listing: DraftListing = match response.json().await {
            Ok(listing) => listing,
            Err(e) => {
                tracing::debug!(error = %e, "drafts listing was not valid JSON");
                DraftListing::default()
            }
        };

        if let Some(item) = listing
            .items
            .iter()
            .find(|item| item.task_id.as_deref() == Some(task_id))
        {
            if generation_id.is_none() {
                if let Some(id) = item.id.clone() {
                    generation_id = Some(id.clone());
                    if !emit(tx, GenerationEvent::DraftFound { generation_id: id }).await {
                        return;
                    }
                }
            }

            if let Some((code, message)) = item.failure() {
                let text = match message {
                    Some(message) => format!("generation failed: {message}"),
                    None => format!("generation failed: {code}"),
                };
                fail(
                    tx,
                    GenerationFailure::new(code, text)
                        .with_details(serde_json::to_value(item).unwrap_or_default()),
                )
                .await;
                return;
            }

            if item.is_success() {
                let finished = match &generation_id {
                    Some(gen_id) => match fetch_detail(client, gen_id).await {
                        Some(detail) => finished_from_detail(task_id, gen_id, detail),
                        None => finished_from_summary(task_id, generation_id.clone(), item),
                    },
                    None => finished_from_summary(task_id, None, item),
                };
                tracing::info!(task_id = %task_id, url = ?finished.best_url(), "generation finished");
                let _ = emit(tx, GenerationEvent::Finished(finished)).await;
                return;
            }
        }

        tokio::time::sleep(poll_interval).await;
    }
}

async fn fetch_pending(client: &SoraClient, task_id: &str) -> Option<PendingTask> {
    let response = match client.get("/backend/nf/pending").await {
        Ok(response) if response.status().is_success() => response,
        Ok(response) => {
            tracing::debug!(status = %response.status(), "pending feed unavailable");
            return None;
        }
        Err(e) => {
            tracing::debug!(error = %e, "pending feed request failed");
            return None;
        }
    };
    response
        .json::<Vec<PendingTask>>()
        .await
        .ok()?
        .into_iter()
        .find(|item| item.id.as_deref() == Some(task_id))
}

/// Optional per-item detail fetch that enriches the terminal payload.
async fn fetch_detail(client: &SoraClient, generation_id: &str) -> Option<DraftDetail> {
    let response = client
        .get(&format!(
            "/backend/project_y/profile/drafts/v2/{generation_id}"
        ))
        .await
        .ok()?;
    if !response.status().is_success() {
        return None;
    }
    response
        .json::<crate::messages::DraftDetailEnvelope>()
        .await
        .ok()?
        .draft
}

fn finished_from_detail(task_id: &str, generation_id: &str, detail: DraftDetail) -> FinishedInfo {
    FinishedInfo {
        task_id: task_id.to_string(),
        generation_id: Some(generation_id.to_string()),
        url: detail.url,
        downloadable_url: detail.downloadable_url,
        width: detail.width,
        height: detail.height,
        prompt: detail.prompt,
    }
}

fn finished_from_summary(
    task_id: &str,
    generation_id: Option<String>,
    item: &DraftItem,
) -> FinishedInfo {
    FinishedInfo {
        task_id: task_id.to_string(),
        generation_id,
        url: item.url.clone(),
        downloadable_url: item.downloadable_url.clone(),
        width: item.width,
        height: item.height,
        prompt: item.prompt.clone(),
    }
}
