//! HTTP + WebSocket front for a [`LocalStore`]: the backend the sync core
//! talks to through `RemoteStore`.

pub mod auth;
pub mod config;
pub mod error;
pub mod realtime;
pub mod rest;

use std::sync::Arc;

use axum::{
    Router, middleware,
    routing::{get, post},
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use slope_store::LocalStore;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub store: LocalStore,
    pub jwt_secret: String,
}

pub fn router(state: AppState) -> Router {
    let protected_routes = Router::new()
        .route("/rest/{resource}", get(rest::list_rows).post(rest::insert_row))
        .route("/rest/{resource}/{id}", get(rest::get_row))
        .route("/rpc/toggle_like", post(rest::toggle_like))
        .route("/realtime", get(realtime::ws_upgrade))
        .layer(middleware::from_fn_with_state(state.clone(), auth::require_auth))
        .with_state(state);

    Router::new()
        .route("/health", get(|| async { "ok" }))
        .merge(protected_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode, header};
    use serde_json::{Value, json};
    use tower::ServiceExt;
    use uuid::Uuid;

    use slope_types::models::Principal;

    use super::*;

    const SECRET: &str = "test-secret";

    fn app() -> (Router, LocalStore) {
        let store = LocalStore::in_memory().unwrap();
        let state = Arc::new(AppStateInner {
            store: store.clone(),
            jwt_secret: SECRET.into(),
        });
        (router(state), store)
    }

    fn token_for(id: Uuid) -> String {
        let principal = Principal { id, email: None };
        auth::issue_token(SECRET, &principal, Duration::from_secs(300)).unwrap()
    }

    async fn call(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn post_json(uri: &str, token: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header(header::AUTHORIZATION, format!("Bearer {}", token))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_with(uri: &str, token: &str) -> Request<Body> {
        Request::get(uri)
            .header(header::AUTHORIZATION, format!("Bearer {}", token))
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn health_is_public() {
        let (app, _) = app();
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn rest_requires_a_valid_token() {
        let (app, _) = app();
        let (status, body) = call(
            &app,
            Request::get("/rest/chat_messages").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body["error"].is_string());

        let (status, _) = call(&app, get_with("/rest/chat_messages", "not-a-jwt")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let token = token_for(Uuid::new_v4());
        let uri = format!("/rest/chat_messages?access_token={}", token);
        let (status, body) = call(&app, Request::get(uri.as_str()).body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([]));
    }

    #[tokio::test]
    async fn insert_then_query_with_joined_author() {
        let (app, _) = app();
        let rider = Uuid::new_v4();
        let token = token_for(rider);

        let (status, _) = call(
            &app,
            post_json("/rest/profiles", &token, json!({ "id": rider, "username": "alice" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, created) = call(
            &app,
            post_json(
                "/rest/chat_messages",
                &token,
                json!({ "user_id": rider, "channel": "group_chat", "message": "Hello" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["profiles"]["username"], "alice");

        let (status, rows) = call(
            &app,
            get_with("/rest/chat_messages?channel=eq.group_chat&order=created_at.asc&limit=10", &token),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(rows.as_array().unwrap().len(), 1);
        assert_eq!(rows[0]["message"], "Hello");

        let id = created["id"].as_str().unwrap();
        let (status, row) = call(&app, get_with(&format!("/rest/chat_messages/{}", id), &token)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(row["id"], created["id"]);

        let (status, _) = call(
            &app,
            get_with("/rest/chat_messages?channel=eq.safety_channel", &token),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn writing_for_someone_else_is_forbidden() {
        let (app, _) = app();
        let token = token_for(Uuid::new_v4());
        let (status, body) = call(
            &app,
            post_json(
                "/rest/chat_messages",
                &token,
                json!({ "user_id": Uuid::new_v4(), "message": "spoofed" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(body["error"].as_str().unwrap().contains("may not write"));
    }

    #[tokio::test]
    async fn store_errors_map_to_statuses() {
        let (app, _) = app();
        let rider = Uuid::new_v4();
        let token = token_for(rider);

        let (status, _) = call(&app, get_with(&format!("/rest/ride_photos/{}", Uuid::new_v4()), &token)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(&app, get_with("/rest/friendships", &token)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(&app, get_with("/rest/chat_messages?password=eq.x", &token)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (status, _) = call(
            &app,
            post_json("/rest/chat_messages", &token, json!({ "user_id": rider, "message": "   " })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn toggle_like_uses_token_subject() {
        let (app, _) = app();
        let poster = Uuid::new_v4();
        let fan = Uuid::new_v4();
        for (id, username) in [(poster, "gus"), (fan, "hana")] {
            let profile = json!({ "id": id, "username": username });
            let (status, _) = call(&app, post_json("/rest/profiles", &token_for(id), profile)).await;
            assert_eq!(status, StatusCode::CREATED);
        }

        let (status, photo) = call(
            &app,
            post_json(
                "/rest/ride_photos",
                &token_for(poster),
                json!({ "user_id": poster, "photo_url": "file:///p.jpg" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let photo_id = photo["id"].clone();

        let fan_token = token_for(fan);
        let body = json!({ "photo_id": photo_id, "user_id": poster });
        let (status, liked) = call(&app, post_json("/rpc/toggle_like", &fan_token, body.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(liked, json!({ "liked": true, "likes_count": 1 }));

        let (_, likes) = call(&app, get_with("/rest/photo_likes", &fan_token)).await;
        assert_eq!(likes[0]["user_id"], json!(fan));

        let (_, unliked) = call(&app, post_json("/rpc/toggle_like", &fan_token, body)).await;
        assert_eq!(unliked, json!({ "liked": false, "likes_count": 0 }));

        let missing = json!({ "photo_id": Uuid::new_v4() });
        let (status, _) = call(&app, post_json("/rpc/toggle_like", &fan_token, missing)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
