//! Route handlers for the execution API.

use std::convert::Infallible;
use std::path::PathBuf;
use std::time::Duration;

use axum::Json;
use axum::extract::Path;
use axum::extract::State;
use axum::http::StatusCode;
use axum::http::header;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::response::sse::Event;
use axum::response::sse::KeepAlive;
use axum::response::sse::Sse;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::Stream;
use tracing::warn;

use crucible_core::CoreErr;
use crucible_protocol::CreateSessionRequest;
use crucible_protocol::CreateSessionResponse;
use crucible_protocol::EVENT_DONE;
use crucible_protocol::EVENT_OUTPUT;
use crucible_protocol::EVENT_RESULT;
use crucible_protocol::ExecuteCodeRequest;
use crucible_protocol::ExecuteStreamResponse;
use crucible_protocol::HealthResponse;
use crucible_protocol::LoadPluginRequest;
use crucible_protocol::LoadPluginResponse;
use crucible_protocol::SessionListResponse;
use crucible_protocol::StopSessionResponse;
use crucible_protocol::UpdateVariablesRequest;
use crucible_protocol::UpdateVariablesResponse;
use crucible_protocol::UploadEncoding;
use crucible_protocol::UploadFileRequest;
use crucible_protocol::UploadFileResponse;

use crate::AppState;
use crate::error::ApiError;
use crate::streams::StreamEvent;

/// Idle interval after which a comment keepalive is emitted on SSE streams.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(300);

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_sessions: state.registry.active_count(),
    })
}

pub async fn list_sessions(State(state): State<AppState>) -> Json<SessionListResponse> {
    Json(SessionListResponse {
        sessions: state.registry.list_info(),
    })
}

pub async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<CreateSessionResponse>), ApiError> {
    let session = state
        .registry
        .create(request.session_id, request.cwd.map(PathBuf::from))?;
    Ok((
        StatusCode::CREATED,
        Json(CreateSessionResponse {
            session_id: session.session_id().to_string(),
            status: "created".to_string(),
            cwd: session.cwd().to_string_lossy().to_string(),
        }),
    ))
}

pub async fn session_info(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Response, ApiError> {
    let session = state.registry.get(&session_id)?;
    Ok(Json(session.info()).into_response())
}

pub async fn stop_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<StopSessionResponse>, ApiError> {
    state.registry.stop(&session_id).await?;
    Ok(Json(StopSessionResponse {
        session_id,
        status: "stopped".to_string(),
    }))
}

pub async fn load_plugin(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(request): Json<LoadPluginRequest>,
) -> Result<Json<LoadPluginResponse>, ApiError> {
    state
        .registry
        .load_plugin(&session_id, &request.name, &request.code, request.config)
        .await?;
    Ok(Json(LoadPluginResponse {
        name: request.name,
        status: "loaded".to_string(),
    }))
}

pub async fn update_variables(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(request): Json<UpdateVariablesRequest>,
) -> Result<Json<UpdateVariablesResponse>, ApiError> {
    state
        .registry
        .update_variables(&session_id, request.variables)
        .await?;
    Ok(Json(UpdateVariablesResponse {
        status: "updated".to_string(),
    }))
}

pub async fn upload_file(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(request): Json<UploadFileRequest>,
) -> Result<Json<UploadFileResponse>, ApiError> {
    let content = match request.encoding {
        UploadEncoding::Base64 => BASE64
            .decode(request.content.as_bytes())
            .map_err(|err| ApiError::BadRequest(format!("invalid base64 content: {err}")))?,
        UploadEncoding::Text => request.content.into_bytes(),
    };

    let path = state
        .registry
        .upload_file(&session_id, &request.filename, &content)?;
    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    Ok(Json(UploadFileResponse {
        path: path.to_string_lossy().to_string(),
        filename,
    }))
}

pub async fn execute(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(request): Json<ExecuteCodeRequest>,
) -> Result<Response, ApiError> {
    if request.stream {
        // The session must exist before a stream is registered for it.
        if !state.registry.exists(&session_id) {
            return Err(CoreErr::SessionNotFound(session_id).into());
        }
        let stream_url = state.streams.begin(
            state.registry.clone(),
            session_id,
            request.exec_id.clone(),
            request.code,
        );
        return Ok(Json(ExecuteStreamResponse {
            execution_id: request.exec_id,
            stream_url,
        })
        .into_response());
    }

    let result = state
        .registry
        .execute(&session_id, &request.exec_id, &request.code, None)
        .await?;
    Ok(Json(result).into_response())
}

pub async fn execute_stream(
    State(state): State<AppState>,
    Path((session_id, exec_id)): Path<(String, String)>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let mut receiver = state
        .streams
        .take_receiver(&session_id, &exec_id)
        .ok_or(ApiError::StreamNotFound)?;

    let events = async_stream::stream! {
        while let Some(event) = receiver.recv().await {
            match event {
                StreamEvent::Output(output) => {
                    match Event::default().event(EVENT_OUTPUT).json_data(&output) {
                        Ok(event) => yield Ok(event),
                        Err(err) => warn!("failed to serialize output event: {err}"),
                    }
                }
                StreamEvent::Result(result) => {
                    match Event::default().event(EVENT_RESULT).json_data(&result) {
                        Ok(event) => yield Ok(event),
                        Err(err) => warn!("failed to serialize result event: {err}"),
                    }
                }
                StreamEvent::Done => {
                    yield Ok(Event::default().event(EVENT_DONE).data("{}"));
                    return;
                }
            }
        }
    };

    Ok(Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(KEEPALIVE_INTERVAL)
            .text("keepalive"),
    ))
}

pub async fn download_artifact(
    State(state): State<AppState>,
    Path((session_id, file_name)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let path = state.registry.artifact_file(&session_id, &file_name)?;
    let bytes = tokio::fs::read(&path).await.map_err(CoreErr::Io)?;
    let mime = mime_guess::from_path(&path).first_or_octet_stream();
    Ok((
        [(header::CONTENT_TYPE, mime.to_string())],
        bytes,
    )
        .into_response())
}
