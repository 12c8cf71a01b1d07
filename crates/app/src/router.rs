use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use tracing::error;
use uuid::Uuid;

use clubhub_core::member::{Event, Member, MemberCreateCommand};
use clubhub_mail::MailerClient;
use clubhub_storage::{Database, EmailStoreError, NewEmailReceiver, NewEmailTask, NewEvent};

use crate::email::{DispatchReport, EmailClient, EmailError};
use crate::members::{Clock, MemberError, MemberService};
use crate::problem::ProblemResponse;
use crate::telemetry;

#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    storage: Database,
    members: MemberService,
    email: EmailClient,
    clock: Clock,
}

impl AppState {
    pub fn new(
        metrics: PrometheusHandle,
        storage: Database,
        mailer: MailerClient,
        from_address: String,
    ) -> Self {
        let clock: Clock = Arc::new(Utc::now);
        let members = MemberService::new(&storage, clock.clone());
        let email = EmailClient::new(&storage, mailer, from_address, clock.clone());
        Self {
            metrics,
            storage,
            members,
            email,
            clock,
        }
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn storage(&self) -> &Database {
        &self.storage
    }

    pub fn members(&self) -> &MemberService {
        &self.members
    }

    pub fn email(&self) -> &EmailClient {
        &self.email
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/members", post(register_member))
        .route("/members/bulk", post(bulk_register_members))
        .route("/members/:id", delete(withdraw_member))
        .route("/events", get(list_events).post(create_event))
        .route("/email-tasks", post(create_email_task))
        .route("/email-tasks/:id/send", post(send_email_task))
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = telemetry::render_metrics(state.metrics());
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain; version=0.0.4")
        .body(Body::from(body))
        .unwrap()
}

async fn register_member(
    State(state): State<AppState>,
    Json(command): Json<MemberCreateCommand>,
) -> Result<(StatusCode, Json<Member>), ProblemResponse> {
    let member = state
        .members()
        .register(&command)
        .await
        .map_err(member_problem)?;
    Ok((StatusCode::CREATED, Json(member)))
}

#[derive(Debug, Deserialize)]
struct BulkRegisterRequest {
    members: Vec<MemberCreateCommand>,
}

async fn bulk_register_members(
    State(state): State<AppState>,
    Json(request): Json<BulkRegisterRequest>,
) -> Result<(StatusCode, Json<Vec<Member>>), ProblemResponse> {
    let members = state
        .members()
        .bulk_register(&request.members)
        .await
        .map_err(member_problem)?;
    Ok((StatusCode::CREATED, Json(members)))
}

async fn withdraw_member(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ProblemResponse> {
    state
        .members()
        .withdraw(&id)
        .await
        .map_err(member_problem)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct CreateEventRequest {
    title: String,
    #[serde(default)]
    location: Option<String>,
    start_at: DateTime<Utc>,
    end_at: DateTime<Utc>,
}

async fn create_event(
    State(state): State<AppState>,
    Json(request): Json<CreateEventRequest>,
) -> Result<(StatusCode, Json<Event>), ProblemResponse> {
    let event = Event {
        id: Uuid::new_v4().to_string(),
        title: request.title,
        location: request.location,
        start_at: request.start_at,
        end_at: request.end_at,
        created_at: state.now(),
    };

    state
        .storage()
        .events()
        .insert(&NewEvent {
            id: &event.id,
            title: &event.title,
            location: event.location.as_deref(),
            start_at: event.start_at,
            end_at: event.end_at,
            created_at: event.created_at,
        })
        .await
        .map_err(|err| {
            error!(stage = "events", error = %err, "failed to persist event");
            ProblemResponse::internal("storage_error", "failed to persist event")
        })?;

    Ok((StatusCode::CREATED, Json(event)))
}

#[derive(Debug, Deserialize)]
struct EventRangeQuery {
    from: DateTime<Utc>,
    to: DateTime<Utc>,
}

async fn list_events(
    State(state): State<AppState>,
    Query(range): Query<EventRangeQuery>,
) -> Result<Json<Vec<Event>>, ProblemResponse> {
    let events = state
        .storage()
        .events()
        .list_between(range.from, range.to)
        .await
        .map_err(|err| {
            error!(stage = "events", error = %err, "failed to list events");
            ProblemResponse::internal("storage_error", "failed to list events")
        })?;
    Ok(Json(events))
}

#[derive(Debug, Deserialize)]
struct CreateEmailTaskRequest {
    subject: String,
    content: String,
    send_at: DateTime<Utc>,
    receivers: Vec<ReceiverPayload>,
}

#[derive(Debug, Deserialize)]
struct ReceiverPayload {
    email: String,
    name: String,
}

#[derive(Debug, Serialize)]
struct EmailTaskCreated {
    id: String,
    receiver_count: usize,
}

async fn create_email_task(
    State(state): State<AppState>,
    Json(request): Json<CreateEmailTaskRequest>,
) -> Result<(StatusCode, Json<EmailTaskCreated>), ProblemResponse> {
    let now = state.now();
    let task_id = Uuid::new_v4().to_string();
    let repo = state.storage().email_tasks();

    repo.insert_task(&NewEmailTask {
        id: &task_id,
        subject: &request.subject,
        content: &request.content,
        send_at: request.send_at,
        created_at: now,
    })
    .await
    .map_err(email_store_problem)?;

    let receiver_ids: Vec<String> = request
        .receivers
        .iter()
        .map(|_| Uuid::new_v4().to_string())
        .collect();
    let records: Vec<NewEmailReceiver<'_>> = request
        .receivers
        .iter()
        .zip(&receiver_ids)
        .map(|(receiver, id)| NewEmailReceiver {
            id,
            task_id: &task_id,
            email: &receiver.email,
            name: &receiver.name,
            created_at: now,
        })
        .collect();
    repo.insert_receivers(&records)
        .await
        .map_err(email_store_problem)?;

    Ok((
        StatusCode::CREATED,
        Json(EmailTaskCreated {
            id: task_id,
            receiver_count: request.receivers.len(),
        }),
    ))
}

async fn send_email_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DispatchReport>, ProblemResponse> {
    let report = state
        .email()
        .dispatch_task(&id)
        .await
        .map_err(email_problem)?;
    Ok(Json(report))
}

fn member_problem(err: MemberError) -> ProblemResponse {
    match err {
        MemberError::NotFound => ProblemResponse::not_found("member_not_found", err.to_string()),
        MemberError::AlreadyExists { .. } => {
            ProblemResponse::conflict("member_already_exists", err.to_string())
        }
        MemberError::AlreadyDeleted => {
            ProblemResponse::conflict("member_already_deleted", err.to_string())
        }
        MemberError::Storage(source) => {
            error!(stage = "members", error = %source, "member store failure");
            ProblemResponse::internal("storage_error", "failed to access member store")
        }
    }
}

fn email_problem(err: EmailError) -> ProblemResponse {
    match err {
        EmailError::NotFound => ProblemResponse::not_found("email_task_not_found", err.to_string()),
        EmailError::Sending { .. } => {
            ProblemResponse::new(StatusCode::BAD_GATEWAY, "email_sending_failed", err.to_string())
        }
        EmailError::Storage(source) => {
            error!(stage = "email", error = %source, "email store failure");
            ProblemResponse::internal("storage_error", "failed to access email store")
        }
    }
}

fn email_store_problem(err: EmailStoreError) -> ProblemResponse {
    match err {
        EmailStoreError::MissingTask => {
            ProblemResponse::not_found("email_task_not_found", err.to_string())
        }
        other => {
            error!(stage = "email", error = %other, "email store failure");
            ProblemResponse::internal("storage_error", "failed to access email store")
        }
    }
}
