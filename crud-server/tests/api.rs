use axum::{
    body::{self, Body},
    http::{Request, StatusCode},
    response::Response,
    Router,
};
use serde_json::{json, Value};
use tower::util::ServiceExt; // for `oneshot`

use crud_server::config::AppConfig;
use crud_server::handlers::{app, AppState};

const STRONG_PASSWORD: &str = "Sup3r$ecret!";

fn test_config() -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.security.bcrypt_cost = 4;
    cfg
}

async fn test_app(cfg: AppConfig) -> Router {
    let state = AppState::initialize(&cfg).await.unwrap();
    app(state)
}

async fn send(app: &Router, req: Request<Body>) -> Response {
    app.clone().oneshot(req).await.unwrap()
}

async fn send_json(app: &Router, method: &str, uri: &str, payload: Value) -> Response {
    let req = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(payload.to_string()))
        .unwrap();
    send(app, req).await
}

async fn get(app: &Router, uri: &str) -> Response {
    send(app, Request::get(uri).body(Body::empty()).unwrap()).await
}

async fn json_body(resp: Response) -> Value {
    let bytes = body::to_bytes(resp.into_body(), 1024 * 1024).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn message(resp: Response) -> String {
    json_body(resp).await["message"].as_str().unwrap_or_default().to_string()
}

#[tokio::test]
async fn todo_crud_flow() {
    let app = test_app(test_config()).await;

    let resp = send_json(&app, "POST", "/api/todos", json!({ "title": "Buy milk" })).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let todo = json_body(resp).await;
    assert_eq!(todo["id"], 1);
    assert_eq!(todo["completed"], false);

    let resp = send_json(&app, "PUT", "/api/todos/1", json!({ "completed": true })).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let todo = json_body(resp).await;
    assert_eq!(todo["title"], "Buy milk");
    assert_eq!(todo["completed"], true);

    // The unprefixed mount shares the same store.
    let list = json_body(get(&app, "/todos").await).await;
    assert_eq!(list.as_array().unwrap().len(), 1);

    let resp = send(&app, Request::delete("/api/todos/1").body(Body::empty()).unwrap()).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(message(resp).await, "Todo deleted successfully");

    let resp = get(&app, "/api/todos/1").await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert_eq!(message(resp).await, "Todo not found");
}

#[tokio::test]
async fn invalid_ids_and_bodies_are_bad_requests() {
    let app = test_app(test_config()).await;

    let resp = get(&app, "/api/todos/abc").await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(message(resp).await, "Invalid todo ID");

    let resp = get(&app, "/api/articles/-1").await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(message(resp).await, "Invalid article ID");

    let req = Request::post("/api/todos")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let resp = send(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert!(message(resp).await.starts_with("Invalid request body"));

    let resp = send_json(&app, "POST", "/api/todos", json!({ "title": "  " })).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(message(resp).await, "Title is required");
}

#[tokio::test]
async fn comments_validate_and_list_newest_first() {
    let app = test_app(test_config()).await;

    let resp = send_json(&app, "POST", "/api/comments", json!({ "author": "ann" })).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(message(resp).await, "Content is required");

    let resp = send_json(&app, "POST", "/api/comments", json!({ "content": "hi" })).await;
    assert_eq!(message(resp).await, "Author is required");

    let long = "x".repeat(501);
    let resp = send_json(&app, "POST", "/api/comments", json!({ "content": long, "author": "ann" })).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(message(resp).await, "Content must be less than 500 characters");

    for content in ["first", "second"] {
        let resp = send_json(&app, "POST", "/api/comments", json!({ "content": content, "author": "ann" })).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
    }
    let list = json_body(get(&app, "/api/comments").await).await;
    let contents: Vec<&str> = list.as_array().unwrap().iter().map(|c| c["content"].as_str().unwrap()).collect();
    assert_eq!(contents, ["second", "first"]);
    assert!(list[0]["createdAt"].is_string());
}

#[tokio::test]
async fn user_text_is_sanitized_before_storage() {
    let app = test_app(test_config()).await;

    let payload = json!({
        "content": "<script>alert('XSS')</script>This is a comment",
        "author": "<b>Mallory</b>",
    });
    let resp = send_json(&app, "POST", "/api/comments", payload).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let comment = json_body(resp).await;
    assert_eq!(comment["content"], "This is a comment");
    assert_eq!(comment["author"], "Mallory");
}

#[tokio::test]
async fn seeded_articles_and_updates() {
    let app = test_app(test_config()).await;

    let resp = get(&app, "/api/articles/1").await;
    assert_eq!(resp.status(), StatusCode::OK);
    let article = json_body(resp).await;
    assert_eq!(article["user_id"], 1);
    assert_eq!(article["published"], true);

    let by_user = json_body(get(&app, "/api/articles/user/2").await).await;
    assert_eq!(by_user.as_array().unwrap().len(), 1);
    assert_eq!(by_user[0]["published"], false);

    let resp = send_json(&app, "PUT", "/api/articles/1", json!({ "title": "Renamed" })).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let updated = json_body(resp).await;
    assert_eq!(updated["title"], "Renamed");
    assert_ne!(updated["updated_at"], article["updated_at"]);
    assert_eq!(updated["created_at"], article["created_at"]);

    let resp = send_json(&app, "PUT", "/api/articles/1", json!({ "published": "yes" })).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = send_json(&app, "POST", "/api/articles", json!({ "title": "t", "content": "c" })).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(message(resp).await, "user_id is required");

    let long_title = "t".repeat(201);
    let resp =
        send_json(&app, "POST", "/api/articles", json!({ "user_id": 3, "title": long_title, "content": "c" })).await;
    assert_eq!(message(resp).await, "Title must not exceed 200 characters");

    let resp = send_json(&app, "POST", "/api/articles", json!({ "user_id": 3, "title": "t", "content": "c" })).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    assert_eq!(json_body(resp).await["id"], 3);
}

#[tokio::test]
async fn empty_store_without_seed() {
    let mut cfg = test_config();
    cfg.seed_demo_data = false;
    let app = test_app(cfg).await;

    let resp = get(&app, "/api/articles/1").await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert_eq!(message(resp).await, "Article not found");
}

#[tokio::test]
async fn posts_crud() {
    let app = test_app(test_config()).await;

    let payload = json!({ "title": "Hello", "author": "ann", "content": "First post" });
    let resp = send_json(&app, "POST", "/api/posts", payload).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let post = json_body(resp).await;
    assert!(post["createdAt"].is_string());

    let resp = send(&app, Request::delete("/api/posts/1").body(Body::empty()).unwrap()).await;
    assert_eq!(message(resp).await, "Post deleted successfully");
    let resp = get(&app, "/api/posts/1").await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

async fn register(app: &Router, email: &str, password: &str) -> Response {
    send_json(app, "POST", "/api/auth/register", json!({ "username": "alice", "email": email, "password": password }))
        .await
}

async fn login(app: &Router, email: &str, password: &str) -> Response {
    send_json(app, "POST", "/api/auth/login", json!({ "email": email, "password": password })).await
}

fn authed(method: &str, uri: &str, token: &str) -> axum::http::request::Builder {
    Request::builder().method(method).uri(uri).header("authorization", format!("Bearer {}", token))
}

#[tokio::test]
async fn register_login_me_logout_flow() {
    let app = test_app(test_config()).await;

    let resp = register(&app, "Alice@Example.com", STRONG_PASSWORD).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let user = json_body(resp).await;
    assert_eq!(user["email"], "alice@example.com");
    assert!(user.get("passwordHash").is_none() && user.get("password_hash").is_none());

    let resp = register(&app, "alice@example.com", STRONG_PASSWORD).await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    assert_eq!(message(resp).await, "User already exists");

    let resp = login(&app, "alice@example.com", "Wrong-pass1").await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(message(resp).await, "Invalid credentials");

    let resp = login(&app, "nobody@example.com", STRONG_PASSWORD).await;
    assert_eq!(message(resp).await, "Invalid credentials");

    let resp = login(&app, "alice@example.com", STRONG_PASSWORD).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body = json_body(resp).await;
    let token = body["token"].as_str().unwrap().to_string();
    assert!(body["refreshToken"].is_string());

    let resp = send(&app, authed("GET", "/api/auth/me", &token).body(Body::empty()).unwrap()).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json_body(resp).await["username"], "alice");

    let resp = send(&app, authed("POST", "/api/auth/logout", &token).body(Body::empty()).unwrap()).await;
    assert_eq!(message(resp).await, "Logged out successfully");

    let resp = send(&app, authed("GET", "/api/auth/me", &token).body(Body::empty()).unwrap()).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(message(resp).await, "Invalid token");
}

#[tokio::test]
async fn me_requires_a_well_formed_token() {
    let app = test_app(test_config()).await;

    let resp = get(&app, "/api/auth/me").await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(message(resp).await, "No token provided");

    let resp = send(&app, authed("GET", "/api/auth/me", "garbage").body(Body::empty()).unwrap()).await;
    assert_eq!(message(resp).await, "Invalid token format");

    let resp = send(&app, authed("GET", "/api/auth/me", "a.b.c").body(Body::empty()).unwrap()).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(message(resp).await, "Invalid token");
}

#[tokio::test]
async fn registration_enforces_password_policy() {
    let app = test_app(test_config()).await;

    let resp = register(&app, "a@example.com", "short").await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(message(resp).await, "Password must be at least 8 characters");

    let resp = register(&app, "a@example.com", "password").await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body = json_body(resp).await;
    assert_eq!(body["message"], "Password is too common");
    assert!(body["validationErrors"].is_array());

    let resp = register(&app, "not-an-email", STRONG_PASSWORD).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp =
        send_json(&app, "POST", "/api/auth/register", json!({ "email": "a@example.com", "password": STRONG_PASSWORD }))
            .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(message(resp).await, "Username is required");

    // Short usernames are accepted; only presence is checked.
    let resp = send_json(
        &app,
        "POST",
        "/api/auth/register",
        json!({ "username": "al", "email": "al@example.com", "password": STRONG_PASSWORD }),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::CREATED);
}

#[tokio::test]
async fn change_password_and_refresh() {
    let app = test_app(test_config()).await;
    register(&app, "bob@example.com", STRONG_PASSWORD).await;
    let body = json_body(login(&app, "bob@example.com", STRONG_PASSWORD).await).await;
    let token = body["token"].as_str().unwrap().to_string();
    let refresh_token = body["refreshToken"].as_str().unwrap().to_string();

    let wrong = json!({ "oldPassword": "Not-it-123", "newPassword": "An0ther$ecret" });
    let req = authed("PUT", "/api/auth/password", &token)
        .header("content-type", "application/json")
        .body(Body::from(wrong.to_string()))
        .unwrap();
    let resp = send(&app, req).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(message(resp).await, "Current password is incorrect");

    let change = json!({ "oldPassword": STRONG_PASSWORD, "newPassword": "An0ther$ecret" });
    let req = authed("PUT", "/api/auth/password", &token)
        .header("content-type", "application/json")
        .body(Body::from(change.to_string()))
        .unwrap();
    let resp = send(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(message(resp).await, "Password updated successfully");

    assert_eq!(login(&app, "bob@example.com", STRONG_PASSWORD).await.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(login(&app, "bob@example.com", "An0ther$ecret").await.status(), StatusCode::OK);

    let resp = send_json(&app, "POST", "/api/auth/refresh", json!({ "refreshToken": refresh_token })).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let fresh = json_body(resp).await["token"].as_str().unwrap().to_string();
    let resp = send(&app, authed("GET", "/api/auth/me", &fresh).body(Body::empty()).unwrap()).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = send_json(&app, "POST", "/api/auth/refresh", json!({ "refreshToken": token })).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(message(resp).await, "Invalid refresh token");
}

#[tokio::test]
async fn api_rate_limit_returns_429() {
    let mut cfg = test_config();
    cfg.security.rate_limit_max = 3;
    let app = test_app(cfg).await;

    let from = |ip: &str| Request::get("/api/todos").header("x-forwarded-for", ip).body(Body::empty()).unwrap();
    for _ in 0..3 {
        let resp = send(&app, from("10.0.0.1")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["ratelimit-limit"], "3");
        assert!(resp.headers().contains_key("ratelimit-remaining"));
    }
    let resp = send(&app, from("10.0.0.1")).await;
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(resp.headers().contains_key("retry-after"));
    assert_eq!(message(resp).await, "Too many requests, please try again later.");

    assert_eq!(send(&app, from("10.0.0.2")).await.status(), StatusCode::OK);
    // The unprefixed routes sit outside the API limiter.
    let resp = send(&app, Request::get("/todos").header("x-forwarded-for", "10.0.0.1").body(Body::empty()).unwrap()).await;
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn login_has_its_own_stricter_limit() {
    let mut cfg = test_config();
    cfg.security.login_rate_limit_max = 2;
    let app = test_app(cfg).await;

    for _ in 0..2 {
        assert_eq!(login(&app, "x@example.com", "whatever1!").await.status(), StatusCode::UNAUTHORIZED);
    }
    assert_eq!(login(&app, "x@example.com", "whatever1!").await.status(), StatusCode::TOO_MANY_REQUESTS);
    // Other auth routes are unaffected.
    assert_eq!(register(&app, "y@example.com", STRONG_PASSWORD).await.status(), StatusCode::CREATED);
}

#[tokio::test]
async fn csrf_tokens_guard_articles() {
    let app = test_app(test_config()).await;
    let payload = json!({ "user_id": 1, "title": "t", "content": "c" });

    // Not enforced by default: a missing token is allowed.
    assert_eq!(send_json(&app, "POST", "/api/articles", payload.clone()).await.status(), StatusCode::CREATED);

    let with_token = |token: &str| {
        Request::post("/api/articles")
            .header("content-type", "application/json")
            .header("x-csrf-token", token)
            .body(Body::from(payload.to_string()))
            .unwrap()
    };
    let resp = send(&app, with_token("invalid-token")).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    assert_eq!(message(resp).await, "Invalid CSRF token");

    let token = json_body(get(&app, "/api/csrf-token").await).await["csrfToken"].as_str().unwrap().to_string();
    assert_eq!(send(&app, with_token(&token)).await.status(), StatusCode::CREATED);
}

#[tokio::test]
async fn csrf_enforcement_rejects_missing_token() {
    let mut cfg = test_config();
    cfg.security.csrf_enforce = true;
    let app = test_app(cfg).await;

    let resp = send_json(&app, "POST", "/api/posts", json!({ "title": "t", "author": "a", "content": "c" })).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    assert_eq!(message(resp).await, "CSRF token missing");
    // Reads are never guarded.
    assert_eq!(get(&app, "/api/posts").await.status(), StatusCode::OK);
}

fn multipart_upload(filename: &str, content_type: &str, data: &[u8]) -> Request<Body> {
    multipart_field("file", filename, content_type, data)
}

fn multipart_field(field: &str, filename: &str, content_type: &str, data: &[u8]) -> Request<Body> {
    let boundary = "XBOUNDARYX";
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
    body.extend_from_slice(
        format!("Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n", field, filename).as_bytes(),
    );
    body.extend_from_slice(format!("Content-Type: {}\r\n\r\n", content_type).as_bytes());
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());
    Request::post("/api/upload")
        .header("content-type", format!("multipart/form-data; boundary={}", boundary))
        .body(Body::from(body))
        .unwrap()
}

#[tokio::test]
async fn upload_filters_file_types_and_sizes() {
    let mut cfg = test_config();
    cfg.upload.max_bytes = 16;
    let app = test_app(cfg).await;

    let resp = send(&app, multipart_upload("image.png", "image/png", b"\x89PNG fake")).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body = json_body(resp).await;
    assert_eq!(body["message"], "File uploaded successfully");
    assert_eq!(body["filename"], "image.png");
    assert_eq!(body["size"], 9);

    for (name, mime) in [("malicious.exe", "application/x-msdownload"), ("shell.php.png", "image/png")] {
        let resp = send(&app, multipart_upload(name, mime, b"MZ")).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(message(resp).await, "File type not allowed");
    }

    let resp = send(&app, multipart_upload("big.png", "image/png", &[0u8; 17])).await;
    assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn security_headers_and_unknown_routes() {
    let app = test_app(test_config()).await;

    let resp = get(&app, "/healthz").await;
    assert_eq!(resp.status(), StatusCode::OK);
    let headers = resp.headers();
    assert_eq!(headers["x-content-type-options"], "nosniff");
    assert_eq!(headers["x-frame-options"], "DENY");
    assert!(headers.contains_key("strict-transport-security"));
    assert_eq!(headers["x-xss-protection"], "1; mode=block");

    let resp = get(&app, "/nope").await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert!(resp.headers().contains_key("x-frame-options"));
    assert_eq!(message(resp).await, "Route /nope not found");
}

#[tokio::test]
async fn todo_titles_are_stored_as_sent() {
    let app = test_app(test_config()).await;
    let title = "Tom & Jerry \"quoted\"  <b>bold</b>";

    let resp = send_json(&app, "POST", "/todos", json!({ "title": title })).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    assert_eq!(json_body(resp).await["title"], title);

    let resp = send_json(&app, "PUT", "/todos/1", json!({ "title": "a < b & c" })).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json_body(resp).await["title"], "a < b & c");
}

#[tokio::test]
async fn upload_without_file_field_is_rejected() {
    let app = test_app(test_config()).await;

    let resp = send(&app, multipart_field("avatar", "image.png", "image/png", b"\x89PNG")).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(message(resp).await, "No file uploaded");
}

#[tokio::test]
async fn upload_past_the_body_limit_is_413() {
    let mut cfg = test_config();
    cfg.upload.max_bytes = 16;
    let app = test_app(cfg).await;

    // Larger than the file limit plus the multipart allowance, so the body limit trips first.
    let data = vec![0u8; 128 * 1024];
    let resp = send(&app, multipart_upload("huge.png", "image/png", &data)).await;
    assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn posts_require_every_field() {
    let app = test_app(test_config()).await;

    let cases = [
        (json!({ "author": "ann", "content": "c" }), "Title is required"),
        (json!({ "title": "t", "content": "c" }), "Author is required"),
        (json!({ "title": "t", "author": "ann" }), "Content is required"),
    ];
    for (payload, expected) in cases {
        let resp = send_json(&app, "POST", "/api/posts", payload).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(message(resp).await, expected);
    }
    let list = json_body(get(&app, "/api/posts").await).await;
    assert!(list.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn invalid_comment_id_is_bad_request() {
    let app = test_app(test_config()).await;

    let resp = get(&app, "/api/comments/abc").await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(message(resp).await, "Invalid comment ID");

    let resp = send(&app, Request::delete("/comments/abc").body(Body::empty()).unwrap()).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn article_create_rejects_non_boolean_published() {
    let app = test_app(test_config()).await;

    let payload = json!({ "user_id": 1, "title": "t", "content": "c", "published": "yes" });
    let resp = send_json(&app, "POST", "/api/articles", payload).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert!(message(resp).await.starts_with("Invalid request body"));

    // Only the two seeded articles exist.
    let list = json_body(get(&app, "/api/articles").await).await;
    assert_eq!(list.as_array().unwrap().len(), 2);
}
