//! Auth Lambda - registration, login and token validation.
//!
//! All operations are `POST` requests selected by the `action` query parameter:
//! - POST ?action=register - Create a user and issue a token
//! - POST ?action=login - Check credentials and issue a token
//! - POST ?action=validate - Placeholder check of the `X-Auth-Token` header
//!
//! Issued tokens are never stored. `validate` only checks the token length.

use std::sync::Arc;

use asubt_shared::auth::{needs_rehash, token_passes_placeholder_check};
use asubt_shared::http::AUTH_TOKEN_HEADER;
use asubt_shared::validation::{normalize_email, require_present};
use asubt_shared::{
    generate_token, hash_password, verify_password, Config, Cors, Database, Error, GatewayEvent,
    GatewayResponse, PasswordScheme, Result, Session,
};
use async_trait::async_trait;
use lambda_runtime::{run, service_fn, Error as LambdaError, LambdaEvent};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const CORS: Cors = Cors::AUTH;

const DEFAULT_ROLE: &str = "user";
const WELCOME_TITLE: &str = "Добро пожаловать!";
const WELCOME_MESSAGE: &str = "Вы успешно зарегистрированы в системе АСУБТ";

/// Register request
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RegisterRequest {
    email: Option<String>,
    password: Option<String>,
    full_name: Option<String>,
    department: Option<String>,
    position: Option<String>,
}

/// Login request
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LoginRequest {
    email: Option<String>,
    password: Option<String>,
}

/// Values written for a new user
#[derive(Debug)]
struct NewUser<'a> {
    email: &'a str,
    password_hash: &'a str,
    full_name: &'a str,
    role: &'a str,
    department: &'a str,
    position: &'a str,
}

/// User as returned from registration
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
struct RegisteredUser {
    id: i32,
    email: String,
    full_name: String,
    role: String,
}

/// User row read for a login attempt
#[derive(Debug, Clone, sqlx::FromRow)]
struct UserCredentials {
    id: i32,
    email: String,
    full_name: String,
    role: String,
    department: Option<String>,
    position: Option<String>,
    is_active: bool,
    password_hash: String,
}

/// User as returned from login
#[derive(Debug, Serialize)]
struct UserProfile {
    id: i32,
    email: String,
    full_name: String,
    role: String,
    department: Option<String>,
    position: Option<String>,
    is_active: bool,
}

impl From<UserCredentials> for UserProfile {
    fn from(row: UserCredentials) -> Self {
        Self {
            id: row.id,
            email: row.email,
            full_name: row.full_name,
            role: row.role,
            department: row.department,
            position: row.position,
            is_active: row.is_active,
        }
    }
}

/// Persistence used by the auth handler.
#[async_trait]
trait AuthStore: Send {
    async fn email_exists(&mut self, email: &str) -> Result<bool>;
    async fn insert_user(&mut self, user: &NewUser<'_>) -> Result<RegisteredUser>;
    async fn insert_notification(
        &mut self,
        user_id: i32,
        title: &str,
        message: &str,
        kind: &str,
    ) -> Result<()>;
    async fn find_by_email(&mut self, email: &str) -> Result<Option<UserCredentials>>;
    async fn update_password_hash(&mut self, user_id: i32, password_hash: &str) -> Result<()>;
}

struct PgAuthStore<'a> {
    session: Session<'a>,
}

impl<'a> PgAuthStore<'a> {
    fn new(db: &'a Database) -> Self {
        Self {
            session: Session::new(db),
        }
    }
}

#[async_trait]
impl AuthStore for PgAuthStore<'_> {
    async fn email_exists(&mut self, email: &str) -> Result<bool> {
        let id: Option<i32> = sqlx::query_scalar("SELECT id FROM users WHERE email = $1")
            .bind(email)
            .fetch_optional(self.session.conn().await?)
            .await?;
        Ok(id.is_some())
    }

    async fn insert_user(&mut self, user: &NewUser<'_>) -> Result<RegisteredUser> {
        let row: RegisteredUser = sqlx::query_as(
            r#"
            INSERT INTO users (email, password_hash, full_name, role, department, position)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id, email, full_name, role
            "#,
        )
        .bind(user.email)
        .bind(user.password_hash)
        .bind(user.full_name)
        .bind(user.role)
        .bind(user.department)
        .bind(user.position)
        .fetch_one(self.session.conn().await?)
        .await?;
        Ok(row)
    }

    async fn insert_notification(
        &mut self,
        user_id: i32,
        title: &str,
        message: &str,
        kind: &str,
    ) -> Result<()> {
        sqlx::query("INSERT INTO notifications (user_id, title, message, type) VALUES ($1, $2, $3, $4)")
            .bind(user_id)
            .bind(title)
            .bind(message)
            .bind(kind)
            .execute(self.session.conn().await?)
            .await?;
        Ok(())
    }

    async fn find_by_email(&mut self, email: &str) -> Result<Option<UserCredentials>> {
        let row: Option<UserCredentials> = sqlx::query_as(
            r#"
            SELECT id, email, full_name, role, department, position, is_active, password_hash
            FROM users
            WHERE email = $1
            "#,
        )
        .bind(email)
        .fetch_optional(self.session.conn().await?)
        .await?;
        Ok(row)
    }

    async fn update_password_hash(&mut self, user_id: i32, password_hash: &str) -> Result<()> {
        sqlx::query("UPDATE users SET password_hash = $1 WHERE id = $2")
            .bind(password_hash)
            .bind(user_id)
            .execute(self.session.conn().await?)
            .await?;
        Ok(())
    }
}

/// Application state
struct AppState {
    db: Database,
    password_scheme: PasswordScheme,
}

impl AppState {
    async fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            db: Database::from_config(config).await?,
            password_scheme: config.password_scheme,
        })
    }
}

async fn route<S: AuthStore>(
    store: &mut S,
    scheme: PasswordScheme,
    event: &GatewayEvent,
) -> Result<GatewayResponse> {
    if event.is_preflight() {
        return Ok(CORS.preflight());
    }

    match (event.method(), event.query("action").unwrap_or("")) {
        ("POST", "register") => register(store, scheme, event.json_body()?).await,
        ("POST", "login") => login(store, scheme, event.json_body()?).await,
        ("POST", "validate") => validate(event.header(AUTH_TOKEN_HEADER).unwrap_or("")),
        _ => Ok(CORS.error(400, "Invalid request")),
    }
}

async fn register<S: AuthStore>(
    store: &mut S,
    scheme: PasswordScheme,
    request: RegisterRequest,
) -> Result<GatewayResponse> {
    let email = normalize_email(request.email.as_deref().unwrap_or(""));
    let password = request.password.unwrap_or_default();
    let full_name = request.full_name.unwrap_or_default();

    require_present(
        &[email.as_str(), password.as_str(), full_name.as_str()],
        "Email, password and full_name are required",
    )?;

    if store.email_exists(&email).await? {
        return Err(Error::Conflict("User already exists".to_string()));
    }

    let password_hash = hash_password(&password, scheme)?;
    let department = request.department.unwrap_or_default();
    let position = request.position.unwrap_or_default();

    let user = store
        .insert_user(&NewUser {
            email: &email,
            password_hash: &password_hash,
            full_name: &full_name,
            role: DEFAULT_ROLE,
            department: &department,
            position: &position,
        })
        .await
        .map_err(|e| {
            // Lost a race with a concurrent registration of the same email.
            if e.is_unique_violation() {
                Error::Conflict("User already exists".to_string())
            } else {
                e
            }
        })?;

    store
        .insert_notification(user.id, WELCOME_TITLE, WELCOME_MESSAGE, "info")
        .await?;

    info!(user_id = user.id, "Registered user");

    CORS.json(
        201,
        &json!({
            "success": true,
            "token": generate_token(),
            "user": user,
        }),
    )
}

async fn login<S: AuthStore>(
    store: &mut S,
    scheme: PasswordScheme,
    request: LoginRequest,
) -> Result<GatewayResponse> {
    let email = normalize_email(request.email.as_deref().unwrap_or(""));
    let password = request.password.unwrap_or_default();

    require_present(&[email.as_str(), password.as_str()], "Email and password are required")?;

    let user = match store.find_by_email(&email).await? {
        Some(user) => user,
        None => return Err(Error::Auth("Invalid credentials".to_string())),
    };

    let verification = verify_password(&password, &user.password_hash)?;
    if !verification.is_match() {
        return Err(Error::Auth("Invalid credentials".to_string()));
    }

    if !user.is_active {
        return Err(Error::Forbidden("Account is disabled".to_string()));
    }

    if needs_rehash(verification, scheme) {
        let upgraded = hash_password(&password, scheme)?;
        match store.update_password_hash(user.id, &upgraded).await {
            Ok(()) => info!(user_id = user.id, "Upgraded legacy password hash"),
            Err(e) => warn!(user_id = user.id, error = %e, "Failed to upgrade legacy password hash"),
        }
    }

    info!(user_id = user.id, "User logged in");

    CORS.json(
        200,
        &json!({
            "success": true,
            "token": generate_token(),
            "user": UserProfile::from(user),
        }),
    )
}

fn validate(token: &str) -> Result<GatewayResponse> {
    if !token_passes_placeholder_check(token) {
        return Err(Error::Auth("Invalid token".to_string()));
    }
    CORS.json(200, &json!({ "valid": true }))
}

async fn handler(
    state: Arc<AppState>,
    event: LambdaEvent<GatewayEvent>,
) -> Result<GatewayResponse, LambdaError> {
    let request = event.payload;

    info!(
        "Auth request: {} action={}",
        request.method(),
        request.query("action").unwrap_or("")
    );

    let mut store = PgAuthStore::new(&state.db);
    let result = route(&mut store, state.password_scheme, &request).await;
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

#[cfg(test)]
mod tests {
    use super::*;
    use asubt_shared::auth::legacy_digest;
    use serde_json::Value;
    use sqlx::error::{DatabaseError, ErrorKind};
    use std::borrow::Cow;
    use std::fmt;

    /// Error a database reports when a concurrent insert claimed the same email.
    #[derive(Debug)]
    struct DuplicateEmail;

    impl fmt::Display for DuplicateEmail {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("duplicate key value violates unique constraint \"users_email_key\"")
        }
    }

    impl std::error::Error for DuplicateEmail {}

    impl DatabaseError for DuplicateEmail {
        fn message(&self) -> &str {
            "duplicate key value violates unique constraint \"users_email_key\""
        }

        fn code(&self) -> Option<Cow<'_, str>> {
            Some(Cow::Borrowed("23505"))
        }

        fn as_error(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn as_error_mut(&mut self) -> &mut (dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn into_error(self: Box<Self>) -> Box<dyn std::error::Error + Send + Sync + 'static> {
            self
        }

        fn kind(&self) -> ErrorKind {
            ErrorKind::UniqueViolation
        }
    }

    #[derive(Debug, Clone)]
    struct StoredUser {
        id: i32,
        email: String,
        password_hash: String,
        full_name: String,
        role: String,
        is_active: bool,
    }

    #[derive(Default)]
    struct MemoryAuthStore {
        users: Vec<StoredUser>,
        notifications: Vec<(i32, String)>,
        /// `email_exists` misses and `insert_user` hits the unique constraint.
        lose_insert_race: bool,
        fail_hash_update: bool,
    }

    impl MemoryAuthStore {
        fn with_user(email: &str, password_hash: String, is_active: bool) -> Self {
            let mut store = Self::default();
            store.users.push(StoredUser {
                id: 1,
                email: email.to_string(),
                password_hash,
                full_name: "Иван Петров".to_string(),
                role: "user".to_string(),
                is_active,
            });
            store
        }
    }

    #[async_trait]
    impl AuthStore for MemoryAuthStore {
        async fn email_exists(&mut self, email: &str) -> Result<bool> {
            if self.lose_insert_race {
                return Ok(false);
            }
            Ok(self.users.iter().any(|u| u.email == email))
        }

        async fn insert_user(&mut self, user: &NewUser<'_>) -> Result<RegisteredUser> {
            if self.lose_insert_race {
                return Err(Error::Database(sqlx::Error::Database(Box::new(DuplicateEmail))));
            }
            let id = self.users.len() as i32 + 1;
            self.users.push(StoredUser {
                id,
                email: user.email.to_string(),
                password_hash: user.password_hash.to_string(),
                full_name: user.full_name.to_string(),
                role: user.role.to_string(),
                is_active: true,
            });
            Ok(RegisteredUser {
                id,
                email: user.email.to_string(),
                full_name: user.full_name.to_string(),
                role: user.role.to_string(),
            })
        }

        async fn insert_notification(
            &mut self,
            user_id: i32,
            title: &str,
            _message: &str,
            _kind: &str,
        ) -> Result<()> {
            self.notifications.push((user_id, title.to_string()));
            Ok(())
        }

        async fn find_by_email(&mut self, email: &str) -> Result<Option<UserCredentials>> {
            Ok(self
                .users
                .iter()
                .find(|u| u.email == email)
                .map(|u| UserCredentials {
                    id: u.id,
                    email: u.email.clone(),
                    full_name: u.full_name.clone(),
                    role: u.role.clone(),
                    department: None,
                    position: None,
                    is_active: u.is_active,
                    password_hash: u.password_hash.clone(),
                }))
        }

        async fn update_password_hash(&mut self, user_id: i32, password_hash: &str) -> Result<()> {
            if self.fail_hash_update {
                return Err(Error::Database(sqlx::Error::PoolTimedOut));
            }
            if let Some(user) = self.users.iter_mut().find(|u| u.id == user_id) {
                user.password_hash = password_hash.to_string();
            }
            Ok(())
        }
    }

    fn post(action: &str, body: Value) -> GatewayEvent {
        serde_json::from_value(json!({
            "httpMethod": "POST",
            "queryStringParameters": { "action": action },
            "body": body.to_string(),
        }))
        .unwrap()
    }

    fn validate_with(token: &str) -> GatewayEvent {
        serde_json::from_value(json!({
            "httpMethod": "POST",
            "queryStringParameters": { "action": "validate" },
            "headers": { "x-auth-token": token },
        }))
        .unwrap()
    }

    async fn call(store: &mut MemoryAuthStore, event: GatewayEvent) -> GatewayResponse {
        CORS.finish(route(store, PasswordScheme::Argon2id, &event).await)
    }

    #[tokio::test]
    async fn test_options_short_circuits() {
        let mut store = MemoryAuthStore::default();
        let event: GatewayEvent = serde_json::from_value(json!({
            "httpMethod": "OPTIONS",
            "queryStringParameters": { "action": "register" },
            "body": "{broken",
        }))
        .unwrap();

        let response = call(&mut store, event).await;
        assert_eq!(response.status_code, 200);
        assert!(response.body.is_empty());
        assert_eq!(response.headers["Access-Control-Allow-Methods"], "GET, POST, OPTIONS");
        assert_eq!(response.headers["Access-Control-Allow-Headers"], "Content-Type, X-Auth-Token");
        assert_eq!(response.headers["Access-Control-Max-Age"], "86400");
        assert!(store.users.is_empty());
    }

    #[tokio::test]
    async fn test_register_creates_user_and_welcome_notification() {
        let mut store = MemoryAuthStore::default();
        let response = call(
            &mut store,
            post(
                "register",
                json!({
                    "email": "  Ivan@Factory.RU ",
                    "password": "s3cret",
                    "full_name": "Иван Петров",
                    "department": "ОТиПБ",
                }),
            ),
        )
        .await;

        assert_eq!(response.status_code, 201);
        let body = response.json();
        assert_eq!(body["success"], true);
        assert_eq!(body["user"]["email"], "ivan@factory.ru");
        assert_eq!(body["user"]["role"], "user");
        let token = body["token"].as_str().unwrap();
        assert!(token.len() >= 32);

        assert_eq!(store.users.len(), 1);
        assert!(store.users[0].password_hash.starts_with("$argon2id$"));
        assert_eq!(store.notifications, vec![(1, WELCOME_TITLE.to_string())]);
    }

    #[tokio::test]
    async fn test_register_duplicate_email_conflicts() {
        let mut store = MemoryAuthStore::with_user("ivan@factory.ru", legacy_digest("x"), true);
        let response = call(
            &mut store,
            post(
                "register",
                json!({ "email": "IVAN@factory.ru ", "password": "p", "full_name": "Иван" }),
            ),
        )
        .await;

        assert_eq!(response.status_code, 409);
        assert_eq!(response.json(), json!({ "error": "User already exists" }));
        assert_eq!(store.users.len(), 1);
        assert!(store.notifications.is_empty());
    }

    #[tokio::test]
    async fn test_register_lost_race_conflicts() {
        let mut store = MemoryAuthStore {
            lose_insert_race: true,
            ..Default::default()
        };
        let response = call(
            &mut store,
            post(
                "register",
                json!({ "email": "ivan@factory.ru", "password": "p", "full_name": "Иван" }),
            ),
        )
        .await;

        assert_eq!(response.status_code, 409);
        assert_eq!(response.json(), json!({ "error": "User already exists" }));
        assert!(store.users.is_empty());
        assert!(store.notifications.is_empty());
    }

    #[tokio::test]
    async fn test_register_only_trims_email() {
        let mut store = MemoryAuthStore::default();

        let response = call(
            &mut store,
            post("register", json!({ "email": "   ", "password": "p", "full_name": "Иван" })),
        )
        .await;
        assert_eq!(response.status_code, 400);

        let response = call(
            &mut store,
            post("register", json!({ "email": "ivan@factory.ru", "password": "   ", "full_name": " " })),
        )
        .await;
        assert_eq!(response.status_code, 201);
        assert_eq!(store.users[0].full_name, " ");
    }

    #[tokio::test]
    async fn test_register_requires_fields() {
        let mut store = MemoryAuthStore::default();
        let response = call(&mut store, post("register", json!({ "email": "a@b.c" }))).await;
        assert_eq!(response.status_code, 400);
        assert_eq!(
            response.json()["error"],
            "Email, password and full_name are required"
        );
        assert!(store.users.is_empty());
    }

    #[tokio::test]
    async fn test_login_issues_fresh_tokens() {
        let hash = hash_password("s3cret", PasswordScheme::Argon2id).unwrap();
        let mut store = MemoryAuthStore::with_user("ivan@factory.ru", hash, true);

        let first = call(&mut store, post("login", json!({ "email": "Ivan@factory.ru", "password": "s3cret" }))).await;
        let second = call(&mut store, post("login", json!({ "email": "ivan@factory.ru", "password": "s3cret" }))).await;

        assert_eq!(first.status_code, 200);
        assert_eq!(second.status_code, 200);
        assert_eq!(first.json()["user"]["is_active"], true);
        assert_ne!(first.json()["token"], second.json()["token"]);
    }

    #[tokio::test]
    async fn test_login_wrong_password_is_401() {
        let hash = hash_password("s3cret", PasswordScheme::Argon2id).unwrap();
        let mut store = MemoryAuthStore::with_user("ivan@factory.ru", hash, true);

        let response = call(&mut store, post("login", json!({ "email": "ivan@factory.ru", "password": "nope" }))).await;
        assert_eq!(response.status_code, 401);
        assert_eq!(response.json(), json!({ "error": "Invalid credentials" }));

        let response = call(&mut store, post("login", json!({ "email": "nobody@factory.ru", "password": "s3cret" }))).await;
        assert_eq!(response.status_code, 401);
    }

    #[tokio::test]
    async fn test_login_disabled_account_is_403() {
        let hash = hash_password("s3cret", PasswordScheme::Argon2id).unwrap();
        let mut store = MemoryAuthStore::with_user("ivan@factory.ru", hash, false);

        let response = call(&mut store, post("login", json!({ "email": "ivan@factory.ru", "password": "s3cret" }))).await;
        assert_eq!(response.status_code, 403);
        assert_eq!(response.json(), json!({ "error": "Account is disabled" }));
    }

    #[tokio::test]
    async fn test_login_upgrades_legacy_digest() {
        let mut store = MemoryAuthStore::with_user("ivan@factory.ru", legacy_digest("s3cret"), true);

        let response = call(&mut store, post("login", json!({ "email": "ivan@factory.ru", "password": "s3cret" }))).await;
        assert_eq!(response.status_code, 200);
        assert!(store.users[0].password_hash.starts_with("$argon2id$"));

        let again = call(&mut store, post("login", json!({ "email": "ivan@factory.ru", "password": "s3cret" }))).await;
        assert_eq!(again.status_code, 200);
    }

    #[tokio::test]
    async fn test_login_survives_failed_digest_upgrade() {
        let mut store = MemoryAuthStore::with_user("ivan@factory.ru", legacy_digest("s3cret"), true);
        store.fail_hash_update = true;

        let response = call(&mut store, post("login", json!({ "email": "ivan@factory.ru", "password": "s3cret" }))).await;
        assert_eq!(response.status_code, 200);
        assert_eq!(response.json()["success"], true);
        assert_eq!(store.users[0].password_hash, legacy_digest("s3cret"));
    }

    #[tokio::test]
    async fn test_validate_checks_length_only() {
        let mut store = MemoryAuthStore::default();

        let response = call(&mut store, validate_with("123456789")).await;
        assert_eq!(response.status_code, 401);
        assert_eq!(response.json(), json!({ "error": "Invalid token" }));

        let response = call(&mut store, validate_with("never-seen")).await;
        assert_eq!(response.status_code, 200);
        assert_eq!(response.json(), json!({ "valid": true }));
    }

    #[tokio::test]
    async fn test_unknown_action_is_400() {
        let mut store = MemoryAuthStore::default();

        let response = call(&mut store, post("logout", json!({}))).await;
        assert_eq!(response.status_code, 400);
        assert_eq!(response.json(), json!({ "error": "Invalid request" }));

        let get: GatewayEvent = serde_json::from_value(json!({ "httpMethod": "GET" })).unwrap();
        let response = call(&mut store, get).await;
        assert_eq!(response.status_code, 400);
        assert_eq!(response.headers["Access-Control-Allow-Origin"], "*");
    }
}
