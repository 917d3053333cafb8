//! Events API Lambda - CRUD operations for scheduled safety events and activities.
//!
//! Endpoints:
//! - GET ?id= - Get a single event
//! - GET [?status=][&type=] - List events by planned date, newest first
//! - POST - Create an event (always `planned`)
//! - PUT - Update an event (body carries `id`)
//! - DELETE ?id= - Delete an event
//!
//! Unlike documents, deleting an event removes the row.

use std::sync::Arc;

use asubt_shared::validation::{id_from_value, is_blank, parse_date, parse_id, require_present};
use asubt_shared::{
    Config, Cors, Database, Error, GatewayEvent, GatewayResponse, Patch, Result, Session,
};
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use lambda_runtime::{run, service_fn, Error as LambdaError, LambdaEvent};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::{Postgres, QueryBuilder};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const CORS: Cors = Cors::CRUD;

const LIST_LIMIT: i64 = 100;

const INITIAL_STATUS: &str = "planned";

const SELECT_EVENT: &str = r#"
    SELECT
        e.id, e.title, e.description, e.event_type, e.status,
        e.responsible_user_id, e.planned_date, e.completed_date,
        e.created_at, e.updated_at, u.full_name AS responsible_name
    FROM events e
    LEFT JOIN users u ON e.responsible_user_id = u.id
"#;

/// Create event request
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CreateEventRequest {
    title: Option<String>,
    description: Option<String>,
    event_type: Option<String>,
    responsible_user_id: Option<Value>,
    planned_date: Option<String>,
}

/// Update event request
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct UpdateEventRequest {
    id: Option<Value>,
    title: Patch<String>,
    description: Patch<String>,
    status: Patch<String>,
    completed_date: Patch<String>,
}

/// Columns a PUT may change.
#[derive(Debug, Default)]
struct EventPatch {
    title: Patch<String>,
    description: Patch<String>,
    status: Patch<String>,
    completed_date: Patch<NaiveDate>,
}

/// List-mode filters
#[derive(Debug, Default)]
struct EventFilter {
    status: Option<String>,
    event_type: Option<String>,
}

#[derive(Debug)]
struct NewEvent {
    title: String,
    description: String,
    event_type: String,
    responsible_user_id: Option<i32>,
    planned_date: Option<NaiveDate>,
}

/// Event joined with the responsible user's name
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
struct EventRow {
    id: i32,
    title: String,
    description: Option<String>,
    event_type: String,
    status: String,
    responsible_user_id: Option<i32>,
    planned_date: Option<NaiveDate>,
    completed_date: Option<NaiveDate>,
    created_at: NaiveDateTime,
    updated_at: NaiveDateTime,
    responsible_name: Option<String>,
}

#[derive(Debug, Serialize, sqlx::FromRow)]
struct CreatedEvent {
    id: i32,
    title: String,
    event_type: String,
    status: String,
    created_at: NaiveDateTime,
}

#[derive(Debug, Serialize, sqlx::FromRow)]
struct UpdatedEvent {
    id: i32,
    title: String,
    status: String,
    updated_at: NaiveDateTime,
}

/// Persistence used by the events handler.
#[async_trait]
trait EventStore: Send {
    async fn get(&mut self, id: i32) -> Result<Option<EventRow>>;
    async fn list(&mut self, filter: &EventFilter) -> Result<Vec<EventRow>>;
    async fn create(&mut self, event: &NewEvent) -> Result<CreatedEvent>;
    async fn update(&mut self, id: i32, patch: &EventPatch) -> Result<Option<UpdatedEvent>>;
    /// Removes the row; returns false when no event has this id.
    async fn delete(&mut self, id: i32) -> Result<bool>;
}

fn list_query(filter: &EventFilter) -> QueryBuilder<'static, Postgres> {
    let mut query = QueryBuilder::new(SELECT_EVENT);
    query.push(" WHERE 1=1");
    if let Some(status) = &filter.status {
        query.push(" AND e.status = ").push_bind(status.clone());
    }
    if let Some(event_type) = &filter.event_type {
        query.push(" AND e.event_type = ").push_bind(event_type.clone());
    }
    query
        .push(" ORDER BY e.planned_date DESC LIMIT ")
        .push_bind(LIST_LIMIT);
    query
}

fn update_query(id: i32, patch: &EventPatch) -> QueryBuilder<'static, Postgres> {
    let mut query = QueryBuilder::new("UPDATE events SET ");
    let mut set = query.separated(", ");
    if let Some(title) = patch.title.as_set() {
        set.push("title = ").push_bind_unseparated(title.clone());
    }
    if let Some(description) = patch.description.as_set() {
        set.push("description = ").push_bind_unseparated(description.clone());
    }
    if let Some(status) = patch.status.as_set() {
        set.push("status = ").push_bind_unseparated(status.clone());
    }
    if let Some(completed_date) = patch.completed_date.as_set() {
        set.push("completed_date = ").push_bind_unseparated(*completed_date);
    }
    set.push("updated_at = CURRENT_TIMESTAMP");

    query
        .push(" WHERE id = ")
        .push_bind(id)
        .push(" RETURNING id, title, status, updated_at");
    query
}

struct PgEventStore<'a> {
    session: Session<'a>,
}

impl<'a> PgEventStore<'a> {
    fn new(db: &'a Database) -> Self {
        Self {
            session: Session::new(db),
        }
    }
}

#[async_trait]
impl EventStore for PgEventStore<'_> {
    async fn get(&mut self, id: i32) -> Result<Option<EventRow>> {
        let mut query = QueryBuilder::<Postgres>::new(SELECT_EVENT);
        query.push(" WHERE e.id = ").push_bind(id);

        let row = query
            .build_query_as::<EventRow>()
            .fetch_optional(self.session.conn().await?)
            .await?;
        Ok(row)
    }

    async fn list(&mut self, filter: &EventFilter) -> Result<Vec<EventRow>> {
        let mut query = list_query(filter);
        let rows = query
            .build_query_as::<EventRow>()
            .fetch_all(self.session.conn().await?)
            .await?;
        Ok(rows)
    }

    async fn create(&mut self, event: &NewEvent) -> Result<CreatedEvent> {
        let row: CreatedEvent = sqlx::query_as(
            r#"
            INSERT INTO events (title, description, event_type, responsible_user_id, planned_date, status)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id, title, event_type, status, created_at
            "#,
        )
        .bind(&event.title)
        .bind(&event.description)
        .bind(&event.event_type)
        .bind(event.responsible_user_id)
        .bind(event.planned_date)
        .bind(INITIAL_STATUS)
        .fetch_one(self.session.conn().await?)
        .await?;
        Ok(row)
    }

    async fn update(&mut self, id: i32, patch: &EventPatch) -> Result<Option<UpdatedEvent>> {
        let mut query = update_query(id, patch);
        let row = query
            .build_query_as::<UpdatedEvent>()
            .fetch_optional(self.session.conn().await?)
            .await?;
        Ok(row)
    }

    async fn delete(&mut self, id: i32) -> Result<bool> {
        let result = sqlx::query("DELETE FROM events WHERE id = $1")
            .bind(id)
            .execute(self.session.conn().await?)
            .await?;
        Ok(result.rows_affected() > 0)
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

async fn route<S: EventStore>(store: &mut S, event: &GatewayEvent) -> Result<GatewayResponse> {
    if event.is_preflight() {
        return Ok(CORS.preflight());
    }

    match event.method() {
        "GET" => get_events(store, event).await,
        "POST" => create_event(store, event.json_body()?).await,
        "PUT" => update_event(store, event.json_body()?).await,
        "DELETE" => delete_event(store, event).await,
        _ => Err(Error::MethodNotAllowed),
    }
}

async fn get_events<S: EventStore>(store: &mut S, event: &GatewayEvent) -> Result<GatewayResponse> {
    if let Some(raw_id) = event.query_non_empty("id") {
        let id = parse_id(raw_id, "Invalid event ID")?;
        return match store.get(id).await? {
            Some(found) => CORS.json(200, &json!({ "event": found })),
            None => Err(Error::NotFound("Event not found".to_string())),
        };
    }

    let filter = EventFilter {
        status: event.query_non_empty("status").map(str::to_string),
        event_type: event.query_non_empty("type").map(str::to_string),
    };
    let events = store.list(&filter).await?;
    CORS.json(200, &json!({ "events": events }))
}

async fn create_event<S: EventStore>(store: &mut S, request: CreateEventRequest) -> Result<GatewayResponse> {
    let title = request.title.as_deref().unwrap_or("").trim().to_string();
    let event_type = request.event_type.as_deref().unwrap_or("").trim().to_string();
    require_present(&[title.as_str(), event_type.as_str()], "Title and event_type are required")?;

    let responsible_user_id = match request.responsible_user_id.as_ref() {
        Some(value) if !is_blank(value) => Some(
            id_from_value(value)
                .ok_or_else(|| Error::Validation("Invalid responsible_user_id".to_string()))?,
        ),
        _ => None,
    };
    let planned_date = parse_date(request.planned_date.as_deref(), "planned_date")?;

    let created = store
        .create(&NewEvent {
            title,
            description: request.description.unwrap_or_default(),
            event_type,
            responsible_user_id,
            planned_date,
        })
        .await?;

    info!(event_id = created.id, "Created event");

    CORS.json(201, &json!({ "success": true, "event": created }))
}

async fn update_event<S: EventStore>(store: &mut S, request: UpdateEventRequest) -> Result<GatewayResponse> {
    let id = match request.id.as_ref() {
        Some(value) if !is_blank(value) => {
            id_from_value(value).ok_or_else(|| Error::Validation("Invalid event ID".to_string()))?
        }
        _ => return Err(Error::Validation("Event ID is required".to_string())),
    };

    let completed_date = match parse_date(
        request.completed_date.as_set().map(String::as_str),
        "completed_date",
    )? {
        Some(date) => Patch::Set(date),
        None => Patch::Absent,
    };

    let patch = EventPatch {
        title: request.title.non_empty(),
        description: request.description,
        status: request.status.non_empty(),
        completed_date,
    };

    match store.update(id, &patch).await? {
        Some(updated) => {
            info!(event_id = id, status = %updated.status, "Updated event");
            CORS.json(200, &json!({ "success": true, "event": updated }))
        }
        None => Err(Error::NotFound("Event not found".to_string())),
    }
}

async fn delete_event<S: EventStore>(store: &mut S, event: &GatewayEvent) -> Result<GatewayResponse> {
    let raw_id = event
        .query_non_empty("id")
        .ok_or_else(|| Error::Validation("Event ID is required".to_string()))?;
    let id = parse_id(raw_id, "Invalid event ID")?;

    if !store.delete(id).await? {
        return Err(Error::NotFound("Event not found".to_string()));
    }

    info!(event_id = id, "Deleted event");
    CORS.json(200, &json!({ "success": true }))
}

async fn handler(
    state: Arc<AppState>,
    event: LambdaEvent<GatewayEvent>,
) -> Result<GatewayResponse, LambdaError> {
    let request = event.payload;

    info!("Events request: {}", request.method());

    let mut store = PgEventStore::new(&state.db);
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
