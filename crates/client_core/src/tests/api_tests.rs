use super::*;
use std::{collections::HashMap, sync::Arc};

use axum::{
    body::Bytes,
    extract::{Path as UrlPath, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, patch, post},
    Json, Router,
};
use serde_json::json;
use tokio::{net::TcpListener, sync::Mutex};

#[derive(Clone, Default)]
struct ApiServerState {
    auth_headers: Arc<Mutex<Vec<String>>>,
    uploads: Arc<Mutex<Vec<(HashMap<String, String>, Vec<u8>)>>>,
    posted: Arc<Mutex<Vec<Value>>>,
}

async fn record_auth(state: &ApiServerState, headers: &HeaderMap) {
    let value = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    state.auth_headers.lock().await.push(value);
}

async fn handle_history(
    State(state): State<ApiServerState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Json<Value> {
    record_auth(&state, &headers).await;
    let limit: usize = query.get("limit").and_then(|l| l.parse().ok()).unwrap_or(0);
    let messages: Vec<Value> = (0..limit.min(3))
        .map(|i| json!({ "id": format!("m{i}") }))
        .collect();
    Json(json!({ "messages": messages }))
}

async fn handle_users(State(state): State<ApiServerState>, headers: HeaderMap) -> Json<Value> {
    record_auth(&state, &headers).await;
    Json(json!([
        { "_id": "u1", "name": "Ana", "username": "ana", "avatarUrl": "a.png" },
        { "id": "u2", "name": "Luis", "username": "luis" }
    ]))
}

async fn handle_post_message(
    State(state): State<ApiServerState>,
    Json(body): Json<Value>,
) -> Json<Value> {
    state.posted.lock().await.push(body.clone());
    Json(json!({ "id": "srv-1", "content": body["content"].clone(), "kind": body["kind"].clone() }))
}

async fn handle_reaction(UrlPath(id): UrlPath<String>) -> (StatusCode, Json<Value>) {
    if id == "missing" {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "code": "not_found", "message": "message missing" })),
        );
    }
    (StatusCode::OK, Json(json!({ "id": id })))
}

async fn handle_upload(
    State(state): State<ApiServerState>,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> Json<Value> {
    state.uploads.lock().await.push((query, body.to_vec()));
    Json(json!({ "mediaUrl": "https://cdn.example/u/1.png" }))
}

async fn spawn_api_server() -> (String, ApiServerState) {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let state = ApiServerState::default();
    let app = Router::new()
        .route("/chat/messages", get(handle_history).post(handle_post_message))
        .route("/chat/messages/:id/reaction", patch(handle_reaction))
        .route("/chat/upload", post(handle_upload))
        .route("/users", get(handle_users))
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}/"), state)
}

#[tokio::test]
async fn history_accepts_wrapped_array_and_sends_bearer_token() {
    let (server_url, state) = spawn_api_server().await;
    let api = HttpChatApi::new(server_url, "tok-123");

    let messages = api.history(50).await.expect("history");
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[0]["id"], "m0");
    assert_eq!(
        state.auth_headers.lock().await.as_slice(),
        &["Bearer tok-123".to_string()]
    );
}

#[tokio::test]
async fn directory_parses_both_id_shapes() {
    let (server_url, _state) = spawn_api_server().await;
    let api = HttpChatApi::new(server_url, "tok");

    let users = api.directory().await.expect("directory");
    let ids: Vec<&str> = users.iter().map(|u| u.id.as_str()).collect();
    assert_eq!(ids, vec!["u1", "u2"]);
    assert_eq!(users[0].avatar_url, "a.png");
}

#[tokio::test]
async fn post_message_returns_server_record() {
    let (server_url, state) = spawn_api_server().await;
    let api = HttpChatApi::new(server_url, "tok");
    let request = SendMessageRequest {
        content: json!({ "type": "doc" }),
        kind: MessageKind::Text,
        media_url: None,
        filename: None,
        reply_to: Some(MessageId::from("m0")),
    };

    let created = api.post_message(&request).await.expect("post");
    assert_eq!(created["id"], "srv-1");
    let posted = state.posted.lock().await;
    assert_eq!(posted[0]["replyTo"], "m0");
    assert_eq!(posted[0]["kind"], "TEXT");
    assert!(posted[0].get("mediaUrl").is_none());
}

#[tokio::test]
async fn reaction_failure_surfaces_api_exception() {
    let (server_url, _state) = spawn_api_server().await;
    let api = HttpChatApi::new(server_url, "tok");

    let updated = api
        .patch_reaction(&MessageId::from("m1"), "👍")
        .await
        .expect("reaction");
    assert_eq!(updated["id"], "m1");

    let err = api
        .patch_reaction(&MessageId::from("missing"), "👍")
        .await
        .expect_err("missing message");
    let exception = err.downcast_ref::<ApiException>().expect("api exception");
    assert_eq!(exception.status, 404);
    assert_eq!(exception.message, "message missing");
}

#[tokio::test]
async fn upload_posts_raw_bytes_with_kind() {
    let (server_url, state) = spawn_api_server().await;
    let api = HttpChatApi::new(server_url, "tok");
    let attachment = LocalAttachment {
        kind: MessageKind::Image,
        filename: "photo.png".into(),
        mime_type: Some("image/png".into()),
        bytes: vec![1, 2, 3],
    };

    let url = api.upload(&attachment).await.expect("upload");
    assert_eq!(url, "https://cdn.example/u/1.png");
    let uploads = state.uploads.lock().await;
    let (query, bytes) = &uploads[0];
    assert_eq!(query.get("kind").map(String::as_str), Some("IMAGE"));
    assert_eq!(query.get("filename").map(String::as_str), Some("photo.png"));
    assert_eq!(bytes, &vec![1, 2, 3]);
}

#[tokio::test]
async fn attachment_from_path_reads_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("note.m4a");
    tokio::fs::write(&path, b"audio").await.expect("write");

    let attachment = LocalAttachment::from_path(MessageKind::Audio, &path)
        .await
        .expect("attachment");
    assert_eq!(attachment.filename, "note.m4a");
    assert_eq!(attachment.bytes, b"audio".to_vec());
}
