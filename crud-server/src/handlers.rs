//! HTTP layer: router construction, shared state, and one handler per endpoint.

use std::{sync::Arc, time::Duration};

use axum::{
    debug_handler,
    extract::{multipart::MultipartRejection, DefaultBodyLimit, Multipart, OriginalUri, Path, State},
    http::{HeaderMap, StatusCode},
    middleware,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use tower_http::trace::TraceLayer;

use crate::{
    auth::{token_from_headers, AuthService, JwtAuthService},
    config::AppConfig,
    models::{
        ApiJson, AppError, ArticlePatch, ChangePasswordRequest, CreateArticleRequest, CreateCommentRequest,
        CreatePostRequest, CreateTodoRequest, Id, LoginRequest, LoginResponse, MessageResponse, NewArticle,
        RefreshRequest, RegisterRequest, TodoPatch, UpdateArticleRequest, UpdateTodoRequest, User, UserResponse,
    },
    password::enforce_password_policy,
    repository::{Repositories, RepositoryFactory},
    security::{csrf_guard, rate_limit, with_security_headers, CsrfProtection, RateLimiter, UploadPolicy},
    validation::{sanitize_input, validate_email, validate_length, validate_required},
};

const MAX_COMMENT_CHARS: usize = 500;
const MAX_TITLE_CHARS: usize = 200;
/// Room for multipart boundaries and part headers on top of the file itself.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub repos: Repositories,
    pub auth: Arc<dyn AuthService>,
    pub csrf: CsrfProtection,
    pub api_limiter: RateLimiter,
    pub login_limiter: RateLimiter,
    pub uploads: UploadPolicy,
}

impl AppState {
    /// Wires in-memory repositories and the JWT service from configuration.
    pub fn from_config(cfg: &AppConfig) -> Self {
        let auth = JwtAuthService::new(&cfg.jwt.secret, cfg.jwt.expiry_hours)
            .with_refresh_secret(&cfg.jwt.refresh_secret, cfg.jwt.refresh_expiry_hours)
            .with_bcrypt_cost(cfg.security.bcrypt_cost);
        let window = Duration::from_secs(cfg.security.rate_limit_window_secs);
        Self {
            repos: RepositoryFactory::in_memory(),
            auth: Arc::new(auth),
            csrf: CsrfProtection::new(Duration::from_secs(cfg.security.csrf_ttl_secs), cfg.security.csrf_enforce),
            api_limiter: RateLimiter::new("api", cfg.security.rate_limit_max, window),
            login_limiter: RateLimiter::new("login", cfg.security.login_rate_limit_max, window),
            uploads: UploadPolicy::new(cfg.upload.max_bytes),
        }
    }

    /// Like [`AppState::from_config`], plus the demo seed when enabled.
    pub async fn initialize(cfg: &AppConfig) -> Result<Self, AppError> {
        let state = Self::from_config(cfg);
        if cfg.seed_demo_data {
            state.repos.seed_demo_data().await?;
        }
        Ok(state)
    }
}

pub fn app(state: AppState) -> Router {
    let csrf = middleware::from_fn_with_state(state.csrf.clone(), csrf_guard);

    let todo_routes = Router::new()
        .route("/", get(list_todos).post(create_todo))
        .route("/:id", get(get_todo).put(update_todo).delete(delete_todo));

    let comment_routes = Router::new()
        .route("/", get(list_comments).post(create_comment))
        .route("/:id", get(get_comment).delete(delete_comment));

    let article_routes = Router::new()
        .route("/", get(list_articles).post(create_article))
        .route("/user/:user_id", get(list_user_articles))
        .route("/:id", get(get_article).put(update_article).delete(delete_article))
        .route_layer(csrf.clone());

    let post_routes = Router::new()
        .route("/", get(list_posts).post(create_post))
        .route("/:id", get(get_post).delete(delete_post))
        .route_layer(csrf.clone());

    // route_layer only wraps routes added before it: the login limiter covers /login alone.
    let auth_routes = Router::new()
        .route("/login", post(login))
        .route_layer(middleware::from_fn_with_state(state.login_limiter.clone(), rate_limit))
        .route("/register", post(register))
        .route("/me", get(me))
        .route("/logout", post(logout))
        .route("/password", put(change_password))
        .route("/refresh", post(refresh));

    let upload_limit = state.uploads.max_bytes().saturating_add(MULTIPART_OVERHEAD);
    let api_routes = Router::new()
        .nest("/auth", auth_routes)
        .nest("/articles", article_routes)
        .nest("/posts", post_routes)
        .nest("/todos", todo_routes.clone())
        .nest("/comments", comment_routes.clone())
        .route("/csrf-token", get(csrf_token))
        .route("/upload", post(upload_file).route_layer(csrf).layer(DefaultBodyLimit::max(upload_limit)))
        .layer(middleware::from_fn_with_state(state.api_limiter.clone(), rate_limit));

    let router = Router::new()
        .nest("/api", api_routes)
        .nest("/todos", todo_routes)
        .nest("/comments", comment_routes)
        .route("/healthz", get(health))
        .fallback(not_found)
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    with_security_headers(router)
}

fn parse_id(raw: &str, resource: &str) -> Result<Id, AppError> {
    raw.parse::<Id>().map_err(|_| AppError::Validation(format!("Invalid {} ID", resource)))
}

fn deleted(resource: &str) -> Json<MessageResponse> {
    Json(MessageResponse::new(format!("{} deleted successfully", resource)))
}

// Todos

pub async fn list_todos(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    Ok(Json(state.repos.todos.list().await?))
}

pub async fn get_todo(State(state): State<AppState>, Path(id): Path<String>) -> Result<impl IntoResponse, AppError> {
    let id = parse_id(&id, "todo")?;
    Ok(Json(state.repos.todos.find(id).await?))
}

#[debug_handler]
pub async fn create_todo(
    State(state): State<AppState>,
    ApiJson(payload): ApiJson<CreateTodoRequest>,
) -> Result<impl IntoResponse, AppError> {
    // Todo titles are stored as sent; only comments, articles and posts are sanitized.
    let title = validate_required(payload.title.as_deref(), "Title")?;
    let todo = state.repos.todos.create(title.to_string(), payload.completed.unwrap_or(false)).await?;
    Ok((StatusCode::CREATED, Json(todo)))
}

pub async fn update_todo(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ApiJson(payload): ApiJson<UpdateTodoRequest>,
) -> Result<impl IntoResponse, AppError> {
    let id = parse_id(&id, "todo")?;
    let patch = TodoPatch { title: payload.title, completed: payload.completed };
    Ok(Json(state.repos.todos.update(id, patch).await?))
}

pub async fn delete_todo(State(state): State<AppState>, Path(id): Path<String>) -> Result<impl IntoResponse, AppError> {
    let id = parse_id(&id, "todo")?;
    state.repos.todos.delete(id).await?;
    Ok(deleted("Todo"))
}

// Comments

pub async fn list_comments(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    Ok(Json(state.repos.comments.list().await?))
}

pub async fn get_comment(State(state): State<AppState>, Path(id): Path<String>) -> Result<impl IntoResponse, AppError> {
    let id = parse_id(&id, "comment")?;
    Ok(Json(state.repos.comments.find(id).await?))
}

#[debug_handler]
pub async fn create_comment(
    State(state): State<AppState>,
    ApiJson(payload): ApiJson<CreateCommentRequest>,
) -> Result<impl IntoResponse, AppError> {
    let content = validate_required(payload.content.as_deref(), "Content")?;
    let author = validate_required(payload.author.as_deref(), "Author")?;
    if content.chars().count() > MAX_COMMENT_CHARS {
        return Err(AppError::Validation(format!("Content must be less than {} characters", MAX_COMMENT_CHARS)));
    }
    let comment = state.repos.comments.create(sanitize_input(content), sanitize_input(author)).await?;
    Ok((StatusCode::CREATED, Json(comment)))
}

pub async fn delete_comment(State(state): State<AppState>, Path(id): Path<String>) -> Result<impl IntoResponse, AppError> {
    let id = parse_id(&id, "comment")?;
    state.repos.comments.delete(id).await?;
    Ok(deleted("Comment"))
}

// Articles

pub async fn list_articles(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    Ok(Json(state.repos.articles.list().await?))
}

pub async fn list_user_articles(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let user_id = parse_id(&user_id, "user")?;
    Ok(Json(state.repos.articles.list_by_user(user_id).await?))
}

pub async fn get_article(State(state): State<AppState>, Path(id): Path<String>) -> Result<impl IntoResponse, AppError> {
    let id = parse_id(&id, "article")?;
    Ok(Json(state.repos.articles.find(id).await?))
}

fn article_title(raw: &str) -> Result<String, AppError> {
    let title = validate_required(Some(raw), "Title")?;
    validate_length("Title", title, None, Some(MAX_TITLE_CHARS))?;
    Ok(sanitize_input(title))
}

fn article_content(raw: &str) -> Result<String, AppError> {
    Ok(sanitize_input(validate_required(Some(raw), "Content")?))
}

#[debug_handler]
pub async fn create_article(
    State(state): State<AppState>,
    ApiJson(payload): ApiJson<CreateArticleRequest>,
) -> Result<impl IntoResponse, AppError> {
    let user_id = payload.user_id.ok_or_else(|| AppError::Validation("user_id is required".into()))?;
    let title = article_title(payload.title.as_deref().unwrap_or_default())?;
    let content = article_content(payload.content.as_deref().unwrap_or_default())?;
    let article = state
        .repos
        .articles
        .create(NewArticle { user_id, title, content, published: payload.published.unwrap_or(false) })
        .await?;
    tracing::info!(article_id = article.id, user_id, "article created");
    Ok((StatusCode::CREATED, Json(article)))
}

pub async fn update_article(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ApiJson(payload): ApiJson<UpdateArticleRequest>,
) -> Result<impl IntoResponse, AppError> {
    let id = parse_id(&id, "article")?;
    let patch = ArticlePatch {
        title: payload.title.as_deref().map(article_title).transpose()?,
        content: payload.content.as_deref().map(article_content).transpose()?,
        published: payload.published,
    };
    Ok(Json(state.repos.articles.update(id, patch).await?))
}

pub async fn delete_article(State(state): State<AppState>, Path(id): Path<String>) -> Result<impl IntoResponse, AppError> {
    let id = parse_id(&id, "article")?;
    state.repos.articles.delete(id).await?;
    Ok(deleted("Article"))
}

// Posts

pub async fn list_posts(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    Ok(Json(state.repos.posts.list().await?))
}

pub async fn get_post(State(state): State<AppState>, Path(id): Path<String>) -> Result<impl IntoResponse, AppError> {
    let id = parse_id(&id, "post")?;
    Ok(Json(state.repos.posts.find(id).await?))
}

pub async fn create_post(
    State(state): State<AppState>,
    ApiJson(payload): ApiJson<CreatePostRequest>,
) -> Result<impl IntoResponse, AppError> {
    let title = validate_required(payload.title.as_deref(), "Title")?;
    validate_length("Title", title, None, Some(MAX_TITLE_CHARS))?;
    let author = validate_required(payload.author.as_deref(), "Author")?;
    let content = validate_required(payload.content.as_deref(), "Content")?;
    let post = state
        .repos
        .posts
        .create(sanitize_input(title), sanitize_input(author), sanitize_input(content))
        .await?;
    Ok((StatusCode::CREATED, Json(post)))
}

pub async fn delete_post(State(state): State<AppState>, Path(id): Path<String>) -> Result<impl IntoResponse, AppError> {
    let id = parse_id(&id, "post")?;
    state.repos.posts.delete(id).await?;
    Ok(deleted("Post"))
}

// Auth

#[debug_handler]
pub async fn register(
    State(state): State<AppState>,
    ApiJson(payload): ApiJson<RegisterRequest>,
) -> Result<impl IntoResponse, AppError> {
    let username = validate_required(payload.username.as_deref(), "Username")?.trim();
    validate_email(payload.email.as_deref())?;
    let email = payload.email.as_deref().unwrap_or_default().to_lowercase();
    let password = validate_required(payload.password.as_deref(), "Password")?;
    enforce_password_policy(password)?;

    let password_hash = state.auth.hash_password(password.to_string()).await?;
    let user = state.repos.users.create(username.to_string(), email, password_hash).await?;
    tracing::info!(user_id = user.id, "user registered");
    Ok((StatusCode::CREATED, Json(UserResponse::from(user))))
}

#[debug_handler]
pub async fn login(
    State(state): State<AppState>,
    ApiJson(payload): ApiJson<LoginRequest>,
) -> Result<impl IntoResponse, AppError> {
    let email = validate_required(payload.email.as_deref(), "Email")?;
    let password = validate_required(payload.password.as_deref(), "Password")?;
    let invalid = || AppError::Unauthorized("Invalid credentials".into());

    let user = state.repos.users.find_by_email(email).await.map_err(|_| invalid())?;
    let ok = state.auth.verify_password(password.to_string(), user.password_hash.clone()).await?;
    if !ok {
        tracing::warn!(user_id = user.id, "login failed: wrong password");
        return Err(invalid());
    }
    let token = state.auth.generate_token(user.id).await?;
    let refresh_token = state.auth.generate_refresh_token(user.id).await?;
    Ok(Json(LoginResponse { token, refresh_token, user: UserResponse::from(user) }))
}

async fn current_user_from_headers(state: &AppState, headers: &HeaderMap) -> Result<User, AppError> {
    let token = token_from_headers(headers)?;
    let user_id = state.auth.user_id_from_token(&token).await?;
    // A valid token for an account that no longer exists is still a bad token.
    state.repos.users.find_by_id(user_id).await.map_err(|_| AppError::Unauthorized("Invalid token".into()))
}

pub async fn me(State(state): State<AppState>, headers: HeaderMap) -> Result<impl IntoResponse, AppError> {
    let user = current_user_from_headers(&state, &headers).await?;
    Ok(Json(UserResponse::from(user)))
}

pub async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Result<impl IntoResponse, AppError> {
    let user = current_user_from_headers(&state, &headers).await?;
    let token = token_from_headers(&headers)?;
    state.auth.logout(&token).await?;
    tracing::info!(user_id = user.id, "user logged out");
    Ok(Json(MessageResponse::new("Logged out successfully")))
}

pub async fn change_password(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiJson(payload): ApiJson<ChangePasswordRequest>,
) -> Result<impl IntoResponse, AppError> {
    let user = current_user_from_headers(&state, &headers).await?;
    let old_password = validate_required(payload.old_password.as_deref(), "Old password")?;
    let new_password = validate_required(payload.new_password.as_deref(), "New password")?;

    let ok = state.auth.verify_password(old_password.to_string(), user.password_hash.clone()).await?;
    if !ok {
        return Err(AppError::Unauthorized("Current password is incorrect".into()));
    }
    enforce_password_policy(new_password)?;

    let password_hash = state.auth.hash_password(new_password.to_string()).await?;
    state.repos.users.update_password(user.id, password_hash).await?;
    tracing::info!(user_id = user.id, "password changed");
    Ok(Json(MessageResponse::new("Password updated successfully")))
}

pub async fn refresh(
    State(state): State<AppState>,
    ApiJson(payload): ApiJson<RefreshRequest>,
) -> Result<impl IntoResponse, AppError> {
    let refresh_token = validate_required(payload.refresh_token.as_deref(), "Refresh token")?;
    let token = state.auth.refresh(refresh_token).await?;
    Ok(Json(serde_json::json!({ "token": token })))
}

// Misc

pub async fn csrf_token(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({ "csrfToken": state.csrf.issue().await }))
}

pub async fn upload_file(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<impl IntoResponse, AppError> {
    let mut multipart = multipart?;
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field.file_name().unwrap_or_default().to_string();
        let mimetype = field.content_type().unwrap_or_default().to_string();
        state.uploads.check_type(&filename, &mimetype)?;
        let data = field.bytes().await?;
        state.uploads.check_size(data.len())?;
        tracing::info!(%filename, %mimetype, size = data.len(), "upload accepted");
        return Ok(Json(serde_json::json!({
            "message": "File uploaded successfully",
            "filename": filename,
            "mimetype": mimetype,
            "size": data.len(),
        })));
    }
    Err(AppError::Validation("No file uploaded".into()))
}

pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

pub async fn not_found(OriginalUri(uri): OriginalUri) -> AppError {
    AppError::NotFound(format!("Route {} not found", uri.path()))
}
