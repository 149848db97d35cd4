//! JSON API over the job cache: listing with filters, manual refresh and status.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use goapply_core::{Job, Metadata, SourceStatus};
use goapply_storage::JobStore;
use goapply_sync::{ScrapeOrchestrator, ScrapeScheduler, SchedulerStatus};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "goapply-web";

const NO_JOBS_MESSAGE: &str = "No jobs available yet. Please try again later.";

#[derive(Clone)]
pub struct AppState {
    pub store: JobStore,
    pub orchestrator: ScrapeOrchestrator,
    pub scheduler: Arc<ScrapeScheduler>,
    /// Sources reported by the status endpoint, in configuration order.
    pub sources: Vec<String>,
}

impl AppState {
    pub fn new(orchestrator: ScrapeOrchestrator, scheduler: Arc<ScrapeScheduler>) -> Self {
        Self {
            store: orchestrator.store().clone(),
            sources: orchestrator.sources(),
            orchestrator,
            scheduler,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct JobsQuery {
    pub company: Option<String>,
    pub location: Option<String>,
    pub tech_stack: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Serialize)]
struct JobsPayload {
    jobs: Vec<Job>,
    metadata: Metadata,
}

#[derive(Debug, Serialize)]
struct JobsResponse {
    status: &'static str,
    data: JobsPayload,
    #[serde(skip_serializing_if = "Option::is_none")]
    refresh_in_progress: Option<bool>,
}

#[derive(Debug, Serialize)]
struct StatusPayload {
    scheduler: SchedulerStatus,
    last_cache_update: Option<DateTime<Utc>>,
    total_cached_jobs: usize,
    companies: BTreeMap<String, SourceStatus>,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    status: &'static str,
    data: StatusPayload,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    status: &'static str,
    message: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/job_opportunities", get(list_jobs_handler))
        .route("/api/job_opportunities/refresh", post(refresh_handler))
        .route("/api/job_opportunities/status", get(status_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

/// Exact case-insensitive source, substring location, substring tag. Filters combine.
pub fn apply_filters(jobs: Vec<Job>, query: &JobsQuery) -> Vec<Job> {
    let company = query.company.as_deref().map(str::to_lowercase);
    let location = query.location.as_deref().map(str::to_lowercase);
    let tech = query.tech_stack.as_deref().map(str::to_lowercase);
    jobs.into_iter()
        .filter(|job| {
            company
                .as_deref()
                .is_none_or(|c| job.source.to_lowercase() == c)
        })
        .filter(|job| {
            location
                .as_deref()
                .is_none_or(|l| job.location.to_lowercase().contains(l))
        })
        .filter(|job| {
            tech.as_deref().is_none_or(|t| {
                job.tech_stack
                    .iter()
                    .any(|tag| tag.to_lowercase().contains(t))
            })
        })
        .collect()
}

fn paginate(jobs: Vec<Job>, query: &JobsQuery) -> Vec<Job> {
    let offset = query.offset.unwrap_or(0);
    let limit = query.limit.unwrap_or(usize::MAX);
    jobs.into_iter().skip(offset).take(limit).collect()
}

async fn filtered_payload(store: &JobStore, query: &JobsQuery) -> (usize, JobsPayload) {
    let all = store.get_all_jobs().await;
    let total = all.len();
    let filtered = apply_filters(all, query);
    let mut metadata = store.get_metadata().await;
    metadata.filtered_count = filtered.len();
    let jobs = paginate(filtered, query);
    (total, JobsPayload { jobs, metadata })
}

async fn list_jobs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<JobsQuery>,
) -> Response {
    let (total, data) = filtered_payload(&state.store, &query).await;
    if total == 0 {
        return not_found(NO_JOBS_MESSAGE);
    }
    Json(JobsResponse {
        status: "success",
        data,
        refresh_in_progress: None,
    })
    .into_response()
}

async fn refresh_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<JobsQuery>,
) -> Response {
    info!("manual refresh requested");
    // Detached: the response reflects the cache as it is now.
    drop(state.orchestrator.spawn_scrape_cycle());
    let (_total, data) = filtered_payload(&state.store, &query).await;
    Json(JobsResponse {
        status: "success",
        data,
        refresh_in_progress: Some(true),
    })
    .into_response()
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Response {
    let metadata = state.store.get_metadata().await;
    let mut companies = BTreeMap::new();
    for source in &state.sources {
        let status = state
            .store
            .get_source_status(source)
            .await
            .unwrap_or_else(SourceStatus::unknown);
        companies.insert(source.clone(), status);
    }
    Json(StatusResponse {
        status: "success",
        data: StatusPayload {
            scheduler: state.scheduler.status().await,
            last_cache_update: metadata.cached_at,
            total_cached_jobs: metadata.total_count,
            companies,
        },
    })
    .into_response()
}

fn not_found(message: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            status: "error",
            message: message.to_string(),
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use goapply_core::{JobFields, ScrapeState};
    use goapply_storage::{FileBackend, StoreConfig};
    use goapply_sync::ScheduleConfig;
    use http_body_util::BodyExt;
    use std::collections::BTreeSet;
    use tempfile::{tempdir, TempDir};
    use tower::ServiceExt;

    fn job(source: &str, title: &str, location: &str, tags: &[&str]) -> Job {
        Job::new(
            source,
            JobFields {
                title: title.to_string(),
                location: location.to_string(),
                url: format!("https://example.com/{title}"),
                ..Default::default()
            },
            Utc::now(),
        )
        .with_tech_stack(tags.iter().map(|t| t.to_string()).collect::<BTreeSet<_>>())
    }

    async fn state() -> (TempDir, AppState) {
        let dir = tempdir().expect("tempdir");
        let backend = FileBackend::open(dir.path()).await.expect("open");
        let store = JobStore::new(Arc::new(backend), StoreConfig::default());
        let orchestrator = ScrapeOrchestrator::new(store, Vec::new());
        let scheduler = Arc::new(ScrapeScheduler::new(
            orchestrator.clone(),
            ScheduleConfig::default(),
        ));
        (dir, AppState::new(orchestrator, scheduler))
    }

    async fn seed(state: &AppState) {
        let jobs = vec![
            job("posthog", "Product Engineer", "Remote (EU)", &["TypeScript", "React"]),
            job("kraken", "Rust Engineer", "Remote", &["Rust", "PostgreSQL"]),
            job("kraken", "SRE", "London, UK", &["Kubernetes"]),
        ];
        state.store.put_all_jobs(&jobs).await.expect("seed jobs");
        state
            .store
            .put_metadata(&Metadata::from_run(jobs.len(), Utc::now(), BTreeMap::new()))
            .await
            .expect("seed metadata");
    }

    async fn get_json(app: Router, uri: &str, method: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn empty_cache_returns_not_found() {
        let (_dir, state) = state().await;
        let (status, body) = get_json(app(state), "/api/job_opportunities", "GET").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["status"], "error");
    }

    #[tokio::test]
    async fn lists_all_jobs_with_metadata() {
        let (_dir, state) = state().await;
        seed(&state).await;
        let (status, body) = get_json(app(state), "/api/job_opportunities", "GET").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["jobs"].as_array().unwrap().len(), 3);
        assert_eq!(body["data"]["metadata"]["total_count"], 3);
        assert_eq!(body["data"]["metadata"]["filtered_count"], 3);
        assert!(body.get("refresh_in_progress").is_none());
    }

    #[tokio::test]
    async fn filters_combine_and_report_filtered_count() {
        let (_dir, state) = state().await;
        seed(&state).await;
        let (status, body) = get_json(
            app(state),
            "/api/job_opportunities?company=KRAKEN&location=remote&tech_stack=rust",
            "GET",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let jobs = body["data"]["jobs"].as_array().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0]["title"], "Rust Engineer");
        assert_eq!(body["data"]["metadata"]["filtered_count"], 1);
        assert_eq!(body["data"]["metadata"]["total_count"], 3);
    }

    #[tokio::test]
    async fn pagination_applies_after_filtering() {
        let (_dir, state) = state().await;
        seed(&state).await;
        let (_status, body) = get_json(
            app(state),
            "/api/job_opportunities?company=kraken&limit=1&offset=1",
            "GET",
        )
        .await;
        let jobs = body["data"]["jobs"].as_array().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0]["title"], "SRE");
        assert_eq!(body["data"]["metadata"]["filtered_count"], 2);
    }

    #[test]
    fn company_filter_is_exact_not_substring() {
        let jobs = vec![job("kraken", "A", "Remote", &[])];
        let query = JobsQuery {
            company: Some("krak".into()),
            ..Default::default()
        };
        assert!(apply_filters(jobs, &query).is_empty());
    }

    #[tokio::test]
    async fn refresh_returns_immediately_with_flag() {
        let (_dir, state) = state().await;
        seed(&state).await;
        let (status, body) =
            get_json(app(state), "/api/job_opportunities/refresh", "POST").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["refresh_in_progress"], true);
        assert_eq!(body["status"], "success");
    }

    #[tokio::test]
    async fn status_reports_unknown_for_sources_never_scraped() {
        let dir = tempdir().expect("tempdir");
        let backend = FileBackend::open(dir.path()).await.expect("open");
        let store = JobStore::new(Arc::new(backend), StoreConfig::default());
        store
            .put_source_status("posthog", ScrapeState::Success, 4, None)
            .await
            .expect("seed status");
        let orchestrator = ScrapeOrchestrator::new(store, Vec::new());
        let scheduler = Arc::new(ScrapeScheduler::new(
            orchestrator.clone(),
            ScheduleConfig::default(),
        ));
        let mut state = AppState::new(orchestrator, scheduler);
        state.sources = vec!["posthog".into(), "kraken".into()];

        let (status, body) = get_json(app(state), "/api/job_opportunities/status", "GET").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["scheduler"]["running"], false);
        assert_eq!(body["data"]["total_cached_jobs"], 0);
        assert!(body["data"]["last_cache_update"].is_null());
        let companies = &body["data"]["companies"];
        assert_eq!(companies.as_object().unwrap().len(), 2);
        assert_eq!(companies["posthog"]["status"], "success");
        assert_eq!(companies["posthog"]["job_count"], 4);
        assert_eq!(companies["kraken"]["status"], "unknown");
        assert_eq!(companies["kraken"]["job_count"], 0);
        assert!(companies["kraken"]["last_scraped"].is_null());
    }
}
