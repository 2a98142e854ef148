//! API 模块
//!
//! HTTP handlers 和路由组装

pub mod deploy;
pub mod health;

use axum::Router;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::state::AppState;

/// 构建完整的 API 路由
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health & Status
        .merge(health::router())
        // Deploy
        .merge(deploy::router())
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::time::Duration;
    use tower::ServiceExt;

    use crate::config::{DeployConfig, PollConfig};
    use crate::domain::{DeployOutcome, DeployTrigger, Revision};
    use crate::infra::AttemptReporter;
    use crate::services::coordinator::{CoordinatorParts, DeployCoordinator};
    use crate::services::release::ReleaseStore;
    use crate::services::testing::{FakeFetcher, FakeService, FakeSource};
    use crate::services::Poller;
    use crate::state::{AttemptStore, LogHub};

    const KEY: &str = "test-key";

    struct TestApp {
        state: Arc<AppState>,
        _dir: tempfile::TempDir,
    }

    fn test_app(fetcher: FakeFetcher, upstream: &str) -> TestApp {
        let dir = tempfile::tempdir().unwrap();
        let attempts = Arc::new(AttemptStore::new());
        let log_hub = Arc::new(LogHub::new());
        let coordinator = Arc::new(DeployCoordinator::new(CoordinatorParts {
            deploy: DeployConfig {
                health_initial_delay: Duration::ZERO,
                health_interval: Duration::from_millis(10),
                ..Default::default()
            },
            stop_timeout: Duration::from_secs(1),
            start_on_boot: false,
            releases: Arc::new(ReleaseStore::new(dir.path())),
            fetcher: Arc::new(fetcher),
            service: Arc::new(FakeService::new(&["aaa", "bbb"])),
            attempts: attempts.clone(),
            log_hub: log_hub.clone(),
            reporter: Arc::new(AttemptReporter::new(None)),
        }));
        let poller = Arc::new(Poller::new(
            Arc::new(FakeSource::fixed(upstream)),
            PollConfig::default(),
        ));
        TestApp {
            state: Arc::new(AppState::new(KEY, coordinator, poller, attempts, log_hub)),
            _dir: dir,
        }
    }

    fn post(uri: &str, key: Option<&str>, body: &str) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(key) = key {
            builder = builder.header("x-api-key", key);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn wait_idle(state: &AppState) {
        for _ in 0..200 {
            if !state.coordinator.is_deploying() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("deploy did not finish");
    }

    #[tokio::test]
    async fn test_health() {
        let app = test_app(FakeFetcher::new(&["aaa"]), "aaa");
        let response = router(app.state.clone()).oneshot(get("/health")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["deploying"], false);
    }

    #[tokio::test]
    async fn test_deploy_requires_api_key() {
        let app = test_app(FakeFetcher::new(&["aaa"]), "aaa");

        let response = router(app.state.clone())
            .oneshot(post("/deploy", None, r#"{"revision":"aaa"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = router(app.state.clone())
            .oneshot(post("/deploy", Some("wrong"), r#"{"revision":"aaa"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(!app.state.coordinator.is_deploying());
    }

    #[tokio::test]
    async fn test_deploy_accepted_then_recorded() {
        let app = test_app(FakeFetcher::new(&["aaa"]), "aaa");

        let response = router(app.state.clone())
            .oneshot(post("/deploy", Some(KEY), r#"{"revision":"aaa"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = json_body(response).await;
        let attempt_id = body["attempt_id"].as_str().unwrap().to_string();
        assert_eq!(body["revision"], "aaa");
        assert_eq!(
            body["stream_url"],
            format!("/logs/{}/stream", attempt_id)
        );

        wait_idle(&app.state).await;

        let response = router(app.state.clone())
            .oneshot(get(&format!("/attempts/{}", attempt_id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["outcome"], "success");

        let response = router(app.state.clone())
            .oneshot(get("/attempts?outcome=success&limit=5"))
            .await
            .unwrap();
        let body = json_body(response).await;
        assert_eq!(body["total"], 1);
        assert_eq!(body["attempts"][0]["id"], attempt_id.as_str());

        let response = router(app.state.clone())
            .oneshot(get("/status"))
            .await
            .unwrap();
        let body = json_body(response).await;
        assert_eq!(body["service"]["current_revision"]["id"], "aaa");
        assert_eq!(body["deploying"], false);
    }

    #[tokio::test]
    async fn test_deploy_conflict_while_deploying() {
        let (fetcher, entered, release) = FakeFetcher::new(&["aaa", "bbb"]).gated();
        let app = test_app(fetcher, "aaa");

        let response = router(app.state.clone())
            .oneshot(post("/deploy", Some(KEY), r#"{"revision":"aaa"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        entered.notified().await;

        let response = router(app.state.clone())
            .oneshot(post("/deploy", Some(KEY), r#"{"revision":"bbb"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(json_body(response).await["error"], "conflict");

        release.notify_one();
        wait_idle(&app.state).await;
    }

    #[tokio::test]
    async fn test_deploy_rejects_unsafe_revision() {
        let app = test_app(FakeFetcher::new(&["aaa"]), "aaa");
        let response = router(app.state.clone())
            .oneshot(post("/deploy", Some(KEY), r#"{"revision":"../../etc"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_deploy_without_revision_uses_upstream() {
        let app = test_app(FakeFetcher::new(&["bbb"]), "bbb");
        let response = router(app.state.clone())
            .oneshot(post("/deploy", Some(KEY), ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(json_body(response).await["revision"], "bbb");
        wait_idle(&app.state).await;
    }

    #[tokio::test]
    async fn test_check_leaves_update_for_poller() {
        let app = test_app(FakeFetcher::new(&["aaa"]), "aaa");

        for _ in 0..2 {
            let response = router(app.state.clone())
                .oneshot(post("/check", Some(KEY), "{}"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            let body = json_body(response).await;
            assert_eq!(body["update_available"], true);
            assert_eq!(body["revision"], "aaa");
            assert!(body.get("deploy").is_none());
        }
        assert_eq!(app.state.poller.last_known().await, None);
        assert_eq!(
            app.state.poller.check_for_update().await.unwrap(),
            Some(Revision::new("aaa"))
        );
        assert!(!app.state.coordinator.is_deploying());
    }

    #[tokio::test]
    async fn test_check_and_deploy() {
        let app = test_app(FakeFetcher::new(&["aaa"]), "aaa");
        let response = router(app.state.clone())
            .oneshot(post("/check", Some(KEY), r#"{"deploy":true}"#))
            .await
            .unwrap();
        let body = json_body(response).await;
        assert_eq!(body["deploy"]["revision"], "aaa");

        wait_idle(&app.state).await;
        let attempts = app.state.attempts.list(10, Some(DeployOutcome::Success)).await;
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].trigger, DeployTrigger::Api);
    }

    #[tokio::test]
    async fn test_unknown_attempt_is_404() {
        let app = test_app(FakeFetcher::new(&["aaa"]), "aaa");
        for uri in ["/attempts/nope", "/logs/nope/stream"] {
            let response = router(app.state.clone()).oneshot(get(uri)).await.unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{}", uri);
        }
    }

    #[tokio::test]
    async fn test_log_stream_of_finished_attempt_sends_complete() {
        let app = test_app(FakeFetcher::new(&["aaa"]), "aaa");
        let attempt = app
            .state
            .coordinator
            .deploy(Revision::new("aaa"), DeployTrigger::Cli)
            .await
            .unwrap();

        let response = router(app.state.clone())
            .oneshot(get(&format!("/logs/{}/stream", attempt.id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("event: complete"));
        assert!(text.contains("\"outcome\":\"success\""));
    }
}
