//! Reports API Lambda - read-only aggregates and the export acknowledgement.
//!
//! Endpoints:
//! - GET ?type=summary|documents|events|training|incidents|sout - Report data
//! - POST - Acknowledge an export request (`form7` carries incident statistics)
//!
//! An unknown report type is not an error; it yields an empty object. The POST
//! operation never renders a file, it only reports `download_ready`.

use std::sync::Arc;

use asubt_shared::{Config, Cors, Database, Error, GatewayEvent, GatewayResponse, Result, Session};
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, Utc};
use lambda_runtime::{run, service_fn, Error as LambdaError, LambdaEvent};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const CORS: Cors = Cors::READ_ONLY;

/// Report selectable through `?type=`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReportKind {
    Summary,
    Documents,
    Events,
    Training,
    Incidents,
    Sout,
}

impl ReportKind {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "summary" => Some(Self::Summary),
            "documents" => Some(Self::Documents),
            "events" => Some(Self::Events),
            "training" => Some(Self::Training),
            "incidents" => Some(Self::Incidents),
            "sout" => Some(Self::Sout),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Summary => "summary",
            Self::Documents => "documents",
            Self::Events => "events",
            Self::Training => "training",
            Self::Incidents => "incidents",
            Self::Sout => "sout",
        }
    }
}

/// Generate report request
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GenerateReportRequest {
    #[serde(rename = "type")]
    report_type: Option<String>,
    format: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
struct SummaryStatistics {
    total_users: i64,
    total_documents: i64,
    pending_events: i64,
    active_incidents: i64,
}

/// Incident counts by severity for the current year (form 7).
#[derive(Debug, Clone, Copy, Default, Serialize, sqlx::FromRow)]
struct Form7Statistics {
    minor_incidents: i64,
    moderate_incidents: i64,
    severe_incidents: i64,
    fatal_incidents: i64,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
struct DocumentReportRow {
    id: i32,
    title: String,
    doc_type: String,
    created_at: NaiveDateTime,
    status: String,
    creator_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
struct EventReportRow {
    id: i32,
    title: String,
    event_type: String,
    status: String,
    planned_date: Option<NaiveDate>,
    completed_date: Option<NaiveDate>,
    responsible_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
struct TrainingReportRow {
    id: i32,
    training_type: String,
    title: String,
    training_date: Option<NaiveDate>,
    expiry_date: Option<NaiveDate>,
    status: String,
    user_name: Option<String>,
    instructor_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
struct IncidentReportRow {
    id: i32,
    incident_date: NaiveDate,
    location: Option<String>,
    description: Option<String>,
    severity: String,
    investigation_status: String,
    injured_name: Option<String>,
}

/// Special assessment of working conditions (SOUT) entry.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
struct AssessmentReportRow {
    id: i32,
    workplace: String,
    assessment_date: Option<NaiveDate>,
    class_conditions: Option<String>,
    subclass_conditions: Option<String>,
    next_assessment_date: Option<NaiveDate>,
    responsible_name: Option<String>,
}

/// Read-only queries used by the reports handler.
#[async_trait]
trait ReportStore: Send {
    async fn summary(&mut self) -> Result<SummaryStatistics>;
    async fn documents(&mut self) -> Result<Vec<DocumentReportRow>>;
    async fn events(&mut self) -> Result<Vec<EventReportRow>>;
    async fn training(&mut self) -> Result<Vec<TrainingReportRow>>;
    async fn incidents(&mut self) -> Result<Vec<IncidentReportRow>>;
    async fn assessments(&mut self) -> Result<Vec<AssessmentReportRow>>;
    async fn form7(&mut self) -> Result<Form7Statistics>;
}

struct PgReportStore<'a> {
    session: Session<'a>,
}

impl<'a> PgReportStore<'a> {
    fn new(db: &'a Database) -> Self {
        Self {
            session: Session::new(db),
        }
    }

    async fn count(&mut self, sql: &str) -> Result<i64> {
        let total: i64 = sqlx::query_scalar(sql)
            .fetch_one(self.session.conn().await?)
            .await?;
        Ok(total)
    }
}

#[async_trait]
impl ReportStore for PgReportStore<'_> {
    async fn summary(&mut self) -> Result<SummaryStatistics> {
        Ok(SummaryStatistics {
            total_users: self
                .count("SELECT COUNT(*) FROM users WHERE is_active = true")
                .await?,
            total_documents: self
                .count("SELECT COUNT(*) FROM documents WHERE status = 'active'")
                .await?,
            pending_events: self
                .count("SELECT COUNT(*) FROM events WHERE status IN ('planned', 'in_progress')")
                .await?,
            active_incidents: self
                .count("SELECT COUNT(*) FROM incidents WHERE investigation_status != 'closed'")
                .await?,
        })
    }

    async fn documents(&mut self) -> Result<Vec<DocumentReportRow>> {
        let rows = sqlx::query_as(
            r#"
            SELECT d.id, d.title, d.doc_type, d.created_at, d.status,
                   u.full_name AS creator_name
            FROM documents d
            LEFT JOIN users u ON d.created_by = u.id
            WHERE d.status = 'active'
            ORDER BY d.created_at DESC
            "#,
        )
        .fetch_all(self.session.conn().await?)
        .await?;
        Ok(rows)
    }

    async fn events(&mut self) -> Result<Vec<EventReportRow>> {
        let rows = sqlx::query_as(
            r#"
            SELECT e.id, e.title, e.event_type, e.status, e.planned_date,
                   e.completed_date, u.full_name AS responsible_name
            FROM events e
            LEFT JOIN users u ON e.responsible_user_id = u.id
            ORDER BY e.planned_date DESC
            "#,
        )
        .fetch_all(self.session.conn().await?)
        .await?;
        Ok(rows)
    }

    async fn training(&mut self) -> Result<Vec<TrainingReportRow>> {
        let rows = sqlx::query_as(
            r#"
            SELECT t.id, t.training_type, t.title, t.training_date, t.expiry_date,
                   t.status, u.full_name AS user_name, i.full_name AS instructor_name
            FROM training t
            LEFT JOIN users u ON t.user_id = u.id
            LEFT JOIN users i ON t.instructor_id = i.id
            ORDER BY t.training_date DESC
            LIMIT 100
            "#,
        )
        .fetch_all(self.session.conn().await?)
        .await?;
        Ok(rows)
    }

    async fn incidents(&mut self) -> Result<Vec<IncidentReportRow>> {
        let rows = sqlx::query_as(
            r#"
            SELECT i.id, i.incident_date, i.location, i.description, i.severity,
                   i.investigation_status, u.full_name AS injured_name
            FROM incidents i
            LEFT JOIN users u ON i.injured_user_id = u.id
            ORDER BY i.incident_date DESC
            LIMIT 100
            "#,
        )
        .fetch_all(self.session.conn().await?)
        .await?;
        Ok(rows)
    }

    async fn assessments(&mut self) -> Result<Vec<AssessmentReportRow>> {
        let rows = sqlx::query_as(
            r#"
            SELECT w.id, w.workplace, w.assessment_date, w.class_conditions,
                   w.subclass_conditions, w.next_assessment_date,
                   u.full_name AS responsible_name
            FROM work_conditions_assessment w
            LEFT JOIN users u ON w.responsible_user_id = u.id
            ORDER BY w.assessment_date DESC
            LIMIT 100
            "#,
        )
        .fetch_all(self.session.conn().await?)
        .await?;
        Ok(rows)
    }

    async fn form7(&mut self) -> Result<Form7Statistics> {
        let stats = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE severity = 'minor') AS minor_incidents,
                COUNT(*) FILTER (WHERE severity = 'moderate') AS moderate_incidents,
                COUNT(*) FILTER (WHERE severity = 'severe') AS severe_incidents,
                COUNT(*) FILTER (WHERE severity = 'fatal') AS fatal_incidents
            FROM incidents
            WHERE incident_date >= DATE_TRUNC('year', CURRENT_DATE)
            "#,
        )
        .fetch_one(self.session.conn().await?)
        .await?;
        Ok(stats)
    }
}

/// Application state
struct AppState {
    db: Database,
}

impl AppState {
    async fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            db: Database::from_config(config).await?,
        })
    }
}

fn generated_at() -> String {
    Utc::now().to_rfc3339()
}

async fn route<S: ReportStore>(store: &mut S, event: &GatewayEvent) -> Result<GatewayResponse> {
    if event.is_preflight() {
        return Ok(CORS.preflight());
    }

    match event.method() {
        "GET" => report_data(store, event.query("type").unwrap_or("summary")).await,
        "POST" => generate_report(store, event.json_body()?).await,
        _ => Err(Error::MethodNotAllowed),
    }
}

async fn report_data<S: ReportStore>(store: &mut S, report_type: &str) -> Result<GatewayResponse> {
    let Some(kind) = ReportKind::parse(report_type) else {
        info!(report_type, "Unknown report type, returning empty result");
        return CORS.json(200, &json!({}));
    };

    let (key, rows): (&str, Value) = match kind {
        ReportKind::Summary => ("statistics", serde_json::to_value(store.summary().await?)?),
        ReportKind::Documents => ("documents", serde_json::to_value(store.documents().await?)?),
        ReportKind::Events => ("events", serde_json::to_value(store.events().await?)?),
        ReportKind::Training => ("training", serde_json::to_value(store.training().await?)?),
        ReportKind::Incidents => ("incidents", serde_json::to_value(store.incidents().await?)?),
        ReportKind::Sout => ("assessments", serde_json::to_value(store.assessments().await?)?),
    };

    let mut body = json!({
        "type": kind.as_str(),
        "generated_at": generated_at(),
    });
    body[key] = rows;

    CORS.json(200, &body)
}

async fn generate_report<S: ReportStore>(
    store: &mut S,
    request: GenerateReportRequest,
) -> Result<GatewayResponse> {
    let report_type = request.report_type.unwrap_or_else(|| "summary".to_string());
    let format = request.format.unwrap_or_else(|| "json".to_string());

    let mut report = json!({
        "title": format!("Отчёт АСУБТ - {}", report_type),
        "generated_at": generated_at(),
        "format": format,
    });

    if report_type == "form7" {
        let statistics = store.form7().await?;
        report["data"] = json!({
            "report_name": "Форма 7-травматизм",
            "period": "Текущий год",
            "statistics": statistics,
        });
    }

    info!(report_type = %report_type, format = %format, "Export requested");

    CORS.json(
        200,
        &json!({
            "success": true,
            "report": report,
            "download_ready": true,
            "message": format!("Отчёт в формате {} готов к скачиванию", format),
        }),
    )
}

async fn handler(
    state: Arc<AppState>,
    event: LambdaEvent<GatewayEvent>,
) -> Result<GatewayResponse, LambdaError> {
    let request = event.payload;

    info!(
        "Reports request: {} type={}",
        request.method(),
        request.query("type").unwrap_or("")
    );

    let mut store = PgReportStore::new(&state.db);
    let result = route(&mut store, &request).await;
    if let Err(e) = store.session.close().await {
        warn!(error = %e, "Failed to release database connection");
    }

    Ok(CORS.finish(result))
}

#[tokio::main]
async fn main() -> Result<(), LambdaError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    let config = Config::from_env()?;
    let state = Arc::new(AppState::new(&config).await?);

    run(service_fn(move |event| {
        let state = Arc::clone(&state);
        async move { handler(state, event).await }
    }))
    .await
}
