//! Documents API Lambda - CRUD operations for the document registry.
//!
//! Endpoints:
//! - GET ?id= - Get a single document (any status)
//! - GET [?type=] - List active documents, newest first
//! - POST - Create a document
//! - PUT - Update a document (body carries `id`)
//! - DELETE ?id= - Soft-delete a document

use std::sync::Arc;

use asubt_shared::http::USER_ID_HEADER;
use asubt_shared::validation::{id_from_value, is_blank, parse_id, require_present};
use asubt_shared::{
    Config, Cors, Database, Error, GatewayEvent, GatewayResponse, Patch, Result, Session,
};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use lambda_runtime::{run, service_fn, Error as LambdaError, LambdaEvent};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::{Postgres, QueryBuilder};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const CORS: Cors = Cors::CRUD;

/// Maximum rows returned by list mode.
const LIST_LIMIT: i64 = 100;

/// Owner recorded when the request names none.
const FALLBACK_CREATOR_ID: i32 = 1;

const SELECT_DOCUMENT: &str = r#"
    SELECT
        d.id, d.title, d.doc_type, d.content, d.file_url, d.created_by,
        d.status, d.created_at, d.updated_at, u.full_name AS creator_name
    FROM documents d
    LEFT JOIN users u ON d.created_by = u.id
"#;

/// Create document request
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CreateDocumentRequest {
    title: Option<String>,
    doc_type: Option<String>,
    content: Option<String>,
    file_url: Option<String>,
    created_by: Option<Value>,
}

/// Update document request
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct UpdateDocumentRequest {
    id: Option<Value>,
    title: Patch<String>,
    content: Patch<String>,
    file_url: Patch<String>,
}

/// Columns a PUT may change.
#[derive(Debug, Default)]
struct DocumentPatch {
    title: Patch<String>,
    content: Patch<String>,
    file_url: Patch<String>,
}

/// Values written for a new document
#[derive(Debug)]
struct NewDocument {
    title: String,
    doc_type: String,
    content: String,
    file_url: String,
    created_by: i32,
}

/// Document joined with its creator's name
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
struct DocumentRow {
    id: i32,
    title: String,
    doc_type: String,
    content: Option<String>,
    file_url: Option<String>,
    created_by: Option<i32>,
    status: String,
    created_at: NaiveDateTime,
    updated_at: NaiveDateTime,
    creator_name: Option<String>,
}

#[derive(Debug, Serialize, sqlx::FromRow)]
struct CreatedDocument {
    id: i32,
    title: String,
    doc_type: String,
    created_at: NaiveDateTime,
}

#[derive(Debug, Serialize, sqlx::FromRow)]
struct UpdatedDocument {
    id: i32,
    title: String,
    updated_at: NaiveDateTime,
}

/// Persistence used by the documents handler.
#[async_trait]
trait DocumentStore: Send {
    async fn get(&mut self, id: i32) -> Result<Option<DocumentRow>>;
    async fn list_active(&mut self, doc_type: Option<&str>) -> Result<Vec<DocumentRow>>;
    async fn create(&mut self, document: &NewDocument) -> Result<CreatedDocument>;
    async fn update(&mut self, id: i32, patch: &DocumentPatch) -> Result<Option<UpdatedDocument>>;
    /// Returns false when no document has this id.
    async fn mark_deleted(&mut self, id: i32) -> Result<bool>;
}

/// Active documents, optionally of one type, newest first.
fn list_query(doc_type: Option<&str>) -> QueryBuilder<'static, Postgres> {
    let mut query = QueryBuilder::new(SELECT_DOCUMENT);
    query.push(" WHERE d.status = 'active'");
    if let Some(doc_type) = doc_type {
        query.push(" AND d.doc_type = ").push_bind(doc_type.to_string());
    }
    query
        .push(" ORDER BY d.created_at DESC LIMIT ")
        .push_bind(LIST_LIMIT);
    query
}

/// `UPDATE` touching only the set fields; `updated_at` always moves.
fn update_query(id: i32, patch: &DocumentPatch) -> QueryBuilder<'static, Postgres> {
    let mut query = QueryBuilder::new("UPDATE documents SET ");
    let mut set = query.separated(", ");
    if let Some(title) = patch.title.as_set() {
        set.push("title = ").push_bind_unseparated(title.clone());
    }
    if let Some(content) = patch.content.as_set() {
        set.push("content = ").push_bind_unseparated(content.clone());
    }
    if let Some(file_url) = patch.file_url.as_set() {
        set.push("file_url = ").push_bind_unseparated(file_url.clone());
    }
    set.push("updated_at = CURRENT_TIMESTAMP");

    query
        .push(" WHERE id = ")
        .push_bind(id)
        .push(" RETURNING id, title, updated_at");
    query
}

struct PgDocumentStore<'a> {
    session: Session<'a>,
}

impl<'a> PgDocumentStore<'a> {
    fn new(db: &'a Database) -> Self {
        Self {
            session: Session::new(db),
        }
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore<'_> {
    async fn get(&mut self, id: i32) -> Result<Option<DocumentRow>> {
        let mut query = QueryBuilder::<Postgres>::new(SELECT_DOCUMENT);
        query.push(" WHERE d.id = ").push_bind(id);

        let row = query
            .build_query_as::<DocumentRow>()
            .fetch_optional(self.session.conn().await?)
            .await?;
        Ok(row)
    }

    async fn list_active(&mut self, doc_type: Option<&str>) -> Result<Vec<DocumentRow>> {
        let mut query = list_query(doc_type);
        let rows = query
            .build_query_as::<DocumentRow>()
            .fetch_all(self.session.conn().await?)
            .await?;
        Ok(rows)
    }

    async fn create(&mut self, document: &NewDocument) -> Result<CreatedDocument> {
        let row: CreatedDocument = sqlx::query_as(
            r#"
            INSERT INTO documents (title, doc_type, content, file_url, created_by)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, title, doc_type, created_at
            "#,
        )
        .bind(&document.title)
        .bind(&document.doc_type)
        .bind(&document.content)
        .bind(&document.file_url)
        .bind(document.created_by)
        .fetch_one(self.session.conn().await?)
        .await?;
        Ok(row)
    }

    async fn update(&mut self, id: i32, patch: &DocumentPatch) -> Result<Option<UpdatedDocument>> {
        let mut query = update_query(id, patch);
        let row = query
            .build_query_as::<UpdatedDocument>()
            .fetch_optional(self.session.conn().await?)
            .await?;
        Ok(row)
    }

    async fn mark_deleted(&mut self, id: i32) -> Result<bool> {
        let result = sqlx::query("UPDATE documents SET status = 'deleted' WHERE id = $1")
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

async fn route<S: DocumentStore>(store: &mut S, event: &GatewayEvent) -> Result<GatewayResponse> {
    if event.is_preflight() {
        return Ok(CORS.preflight());
    }

    match event.method() {
        "GET" => get_documents(store, event).await,
        "POST" => create_document(store, event).await,
        "PUT" => update_document(store, event.json_body()?).await,
        "DELETE" => delete_document(store, event).await,
        _ => Err(Error::MethodNotAllowed),
    }
}

async fn get_documents<S: DocumentStore>(store: &mut S, event: &GatewayEvent) -> Result<GatewayResponse> {
    if let Some(raw_id) = event.query_non_empty("id") {
        let id = parse_id(raw_id, "Invalid document ID")?;
        return match store.get(id).await? {
            Some(document) => CORS.json(200, &json!({ "document": document })),
            None => Err(Error::NotFound("Document not found".to_string())),
        };
    }

    let documents = store.list_active(event.query_non_empty("type")).await?;
    CORS.json(200, &json!({ "documents": documents }))
}

/// Owner of a new document: body `created_by`, then the `X-User-Id` header,
/// then the fallback id.
fn resolve_creator(created_by: Option<&Value>, event: &GatewayEvent) -> i32 {
    created_by
        .and_then(id_from_value)
        .or_else(|| event.header(USER_ID_HEADER).and_then(|h| h.trim().parse().ok()))
        .unwrap_or(FALLBACK_CREATOR_ID)
}

async fn create_document<S: DocumentStore>(store: &mut S, event: &GatewayEvent) -> Result<GatewayResponse> {
    let request: CreateDocumentRequest = event.json_body()?;

    let title = request.title.as_deref().unwrap_or("").trim().to_string();
    let doc_type = request.doc_type.as_deref().unwrap_or("").trim().to_string();
    require_present(&[title.as_str(), doc_type.as_str()], "Title and doc_type are required")?;

    let document = store
        .create(&NewDocument {
            title,
            doc_type,
            content: request.content.unwrap_or_default(),
            file_url: request.file_url.unwrap_or_default(),
            created_by: resolve_creator(request.created_by.as_ref(), event),
        })
        .await?;

    info!(document_id = document.id, "Created document");

    CORS.json(201, &json!({ "success": true, "document": document }))
}

async fn update_document<S: DocumentStore>(
    store: &mut S,
    request: UpdateDocumentRequest,
) -> Result<GatewayResponse> {
    let id = match request.id.as_ref() {
        Some(value) if !is_blank(value) => {
            id_from_value(value).ok_or_else(|| Error::Validation("Invalid document ID".to_string()))?
        }
        _ => return Err(Error::Validation("Document ID is required".to_string())),
    };

    let patch = DocumentPatch {
        title: request.title.non_empty(),
        content: request.content,
        file_url: request.file_url,
    };

    match store.update(id, &patch).await? {
        Some(document) => {
            info!(document_id = id, "Updated document");
            CORS.json(200, &json!({ "success": true, "document": document }))
        }
        None => Err(Error::NotFound("Document not found".to_string())),
    }
}

async fn delete_document<S: DocumentStore>(store: &mut S, event: &GatewayEvent) -> Result<GatewayResponse> {
    let raw_id = event
        .query_non_empty("id")
        .ok_or_else(|| Error::Validation("Document ID is required".to_string()))?;
    let id = parse_id(raw_id, "Invalid document ID")?;

    if !store.mark_deleted(id).await? {
        return Err(Error::NotFound("Document not found".to_string()));
    }

    info!(document_id = id, "Soft-deleted document");
    CORS.json(200, &json!({ "success": true }))
}

async fn handler(
    state: Arc<AppState>,
    event: LambdaEvent<GatewayEvent>,
) -> Result<GatewayResponse, LambdaError> {
    let request = event.payload;

    info!("Documents request: {}", request.method());

    let mut store = PgDocumentStore::new(&state.db);
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
