use super::*;
use crate::refresh::HttpTokenRefresher;
use crate::test_helpers::{CountingStore, jwt_expiring_at};
use serde_json::json;
use wiremock::matchers::{body_json, header, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const REFRESH_PATH: &str = "/api/auth/refresh";

fn gateway(server: &MockServer, store: &Arc<CountingStore>) -> Gateway {
    let http = reqwest::Client::new();
    let refresher = Arc::new(HttpTokenRefresher::new(http.clone(), format!("{}{REFRESH_PATH}", server.uri())));
    let coordinator = RefreshCoordinator::new(store.clone(), refresher);
    Gateway::new(http, server.uri(), store.clone(), coordinator, 30)
}

fn store_with(access: &str) -> Arc<CountingStore> {
    Arc::new(CountingStore::with_credential(Credential::from_tokens(access, "refresh-1")))
}

async fn mount_refresh(server: &MockServer, new_token: &str, delay: Duration, expected: u64) {
    Mock::given(method("POST"))
        .and(path(REFRESH_PATH))
        .and(body_json(json!({"refresh_token": "refresh-1"})))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"access_token": new_token, "refresh_token": "refresh-2"}))
                .set_delay(delay),
        )
        .expect(expected)
        .mount(server)
        .await;
}

async fn mount_items(server: &MockServer, token: &str, status: u16) {
    Mock::given(method("GET"))
        .and(path("/api/items"))
        .and(header("authorization", format!("Bearer {token}").as_str()))
        .respond_with(ResponseTemplate::new(status).set_body_json(json!({"items": []})))
        .mount(server)
        .await;
}

// =============================================================================
// BASICS
// =============================================================================

#[tokio::test]
async fn request_attaches_bearer_and_request_id() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/items"))
        .and(header("authorization", "Bearer tok"))
        .and(header_exists("x-request-id"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let store = store_with("tok");
    let response = gateway(&server, &store).request("/api/items", &RequestOptions::get()).await.expect("request");
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn request_without_credential_sends_no_auth() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/public"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let store = Arc::new(CountingStore::default());
    let response = gateway(&server, &store).request("public", &RequestOptions::get()).await.expect("request");
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    let received = server.received_requests().await.expect("recording");
    assert!(received[0].headers.get("authorization").is_none());
}

#[tokio::test]
async fn unauthorized_without_credential_is_refresh_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let store = Arc::new(CountingStore::default());
    let err = gateway(&server, &store)
        .request("/api/items", &RequestOptions::get())
        .await
        .expect_err("should fail");
    assert!(matches!(err, GatewayError::Refresh(RefreshError::MissingCredential)));
}

#[test]
fn resolve_url_joins_relative_paths() {
    let store = Arc::new(CountingStore::default());
    let http = reqwest::Client::new();
    let refresher = Arc::new(HttpTokenRefresher::new(http.clone(), "http://h/refresh"));
    let coordinator = RefreshCoordinator::new(store.clone(), refresher);
    let gateway = Gateway::new(http, "http://h:1/", store, coordinator, 30);

    assert_eq!(gateway.resolve_url("/a"), "http://h:1/a");
    assert_eq!(gateway.resolve_url("a"), "http://h:1/a");
    assert_eq!(gateway.resolve_url("https://other/x"), "https://other/x");
}

// =============================================================================
// RENEWAL
// =============================================================================

#[tokio::test]
async fn concurrent_unauthorized_requests_share_one_refresh() {
    let server = MockServer::start().await;
    mount_refresh(&server, "new", Duration::from_millis(150), 1).await;
    mount_items(&server, "old", 401).await;
    mount_items(&server, "new", 200).await;

    let store = store_with("old");
    let gateway = gateway(&server, &store);

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let gateway = gateway.clone();
        tasks.push(tokio::spawn(async move {
            gateway.request("/api/items", &RequestOptions::get()).await
        }));
    }
    for task in tasks {
        let response = task.await.expect("join").expect("request");
        assert_eq!(response.status(), StatusCode::OK);
    }
    assert_eq!(store.get().map(|c| c.access_token), Some("new".to_owned()));
}

#[tokio::test]
async fn expired_credential_is_renewed_once_before_sending() {
    let server = MockServer::start().await;
    mount_refresh(&server, "fresh", Duration::from_millis(100), 1).await;
    Mock::given(method("GET"))
        .and(path("/api/items"))
        .and(header("authorization", "Bearer fresh"))
        .respond_with(ResponseTemplate::new(200))
        .expect(2)
        .mount(&server)
        .await;

    let store = Arc::new(CountingStore::with_credential(Credential::from_tokens(
        jwt_expiring_at(1_000),
        "refresh-1",
    )));
    let gateway = gateway(&server, &store);
    let options = RequestOptions::get();

    let (first, second) = tokio::join!(
        gateway.request("/api/items", &options),
        gateway.request("/api/items", &options),
    );
    assert_eq!(first.expect("first").status(), StatusCode::OK);
    assert_eq!(second.expect("second").status(), StatusCode::OK);
}

#[tokio::test]
async fn second_unauthorized_is_returned_as_is() {
    let server = MockServer::start().await;
    mount_refresh(&server, "new", Duration::ZERO, 1).await;
    Mock::given(method("GET"))
        .and(path("/api/items"))
        .respond_with(ResponseTemplate::new(401))
        .expect(2)
        .mount(&server)
        .await;

    let store = store_with("old");
    let response = gateway(&server, &store)
        .request("/api/items", &RequestOptions::get())
        .await
        .expect("request");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn refresh_failure_rejects_all_waiters_and_clears_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(REFRESH_PATH))
        .respond_with(ResponseTemplate::new(401).set_delay(Duration::from_millis(200)))
        .expect(1)
        .mount(&server)
        .await;
    mount_items(&server, "old", 401).await;

    let store = store_with("old");
    let gateway = gateway(&server, &store);

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let gateway = gateway.clone();
        tasks.push(tokio::spawn(async move {
            gateway.request("/api/items", &RequestOptions::get()).await
        }));
    }
    for task in tasks {
        let err = task.await.expect("join").expect_err("should fail");
        assert!(matches!(err, GatewayError::Refresh(RefreshError::Rejected { status: 401 })));
    }
    assert_eq!(store.clear_count(), 1);
    assert!(store.get().is_none());
}

// =============================================================================
// JSON AND LOGIN
// =============================================================================

#[tokio::test]
async fn request_json_decodes_success_and_reports_status() {
    let server = MockServer::start().await;
    mount_items(&server, "tok", 200).await;
    Mock::given(method("POST"))
        .and(path("/api/items"))
        .respond_with(ResponseTemplate::new(422).set_body_string("bad item"))
        .mount(&server)
        .await;

    let store = store_with("tok");
    let gateway = gateway(&server, &store);

    let body: Value = gateway.get_json("/api/items").await.expect("json");
    assert_eq!(body, json!({"items": []}));

    let err = gateway
        .post_json::<Value>("/api/items", json!({"name": "x"}))
        .await
        .expect_err("should fail");
    assert!(matches!(err, GatewayError::Status { status: 422, ref body } if body == "bad item"));
}

#[tokio::test]
async fn custom_headers_are_forwarded() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(header("x-trace", "abc"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let store = store_with("tok");
    let options = RequestOptions::get().with_header("x-trace", "abc");
    gateway(&server, &store).request("/x", &options).await.expect("request");

    let bad = RequestOptions::get().with_header("bad header", "v");
    let err = gateway(&server, &store).request("/x", &bad).await.expect_err("invalid");
    assert!(matches!(err, GatewayError::InvalidHeader(_)));
}

#[tokio::test]
async fn login_stores_credential() {
    let server = MockServer::start().await;
    let token = jwt_expiring_at(2_000_000_000);
    Mock::given(method("POST"))
        .and(path("/api/auth/login"))
        .and(body_json(json!({"email": "a@b.c", "password": "pw"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "token": token,
            "refresh_token": "r",
            "user": {"id": "u-1"}
        })))
        .mount(&server)
        .await;

    let store = Arc::new(CountingStore::default());
    let credential = gateway(&server, &store)
        .login("/api/auth/login", json!({"email": "a@b.c", "password": "pw"}))
        .await
        .expect("login");

    assert_eq!(credential.expires_at, Some(2_000_000_000));
    assert_eq!(store.get(), Some(credential));
}

#[tokio::test]
async fn login_rejection_is_status_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401).set_body_string("nope"))
        .mount(&server)
        .await;

    let store = Arc::new(CountingStore::default());
    let err = gateway(&server, &store)
        .login("/api/auth/login", json!({}))
        .await
        .expect_err("should fail");
    assert!(matches!(err, GatewayError::Status { status: 401, .. }));
    assert!(store.get().is_none());
}
