// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Control-plane client behavior against a local fake API.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::{post, put},
};
use sdq_broker::{ApiClient, BuildStatus, ControlPlane, EventRequest};
use serde_json::Value;

#[derive(Clone, Default)]
struct FakeApi {
    requests:     Arc<Mutex<Vec<(Value, Option<String>)>>>,
    failures_left: Arc<AtomicU32>,
    status_on_success: u16,
}

impl FakeApi {
    fn new(status_on_success: u16, failures: u32) -> Self {
        FakeApi {
            requests: Arc::default(),
            failures_left: Arc::new(AtomicU32::new(failures)),
            status_on_success,
        }
    }

    fn requests(&self) -> Vec<(Value, Option<String>)> {
        self.requests.lock().unwrap().clone()
    }
}

async fn record(
    State(state): State<FakeApi>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> StatusCode {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string);
    state.requests.lock().unwrap().push((body, auth));

    let remaining = state.failures_left.load(Ordering::SeqCst);
    if remaining > 0 {
        state.failures_left.store(remaining - 1, Ordering::SeqCst);
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    StatusCode::from_u16(state.status_on_success).unwrap_or(StatusCode::OK)
}

async fn serve(state: FakeApi) -> String {
    let router = Router::new()
        .route("/v4/events", post(record))
        .route("/v4/builds/{id}", put(record))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

fn client() -> ApiClient { ApiClient::new(3, Duration::from_millis(10)) }

fn event() -> EventRequest {
    EventRequest {
        pipeline_id:     42,
        start_from:      "main".to_string(),
        cause_message:   Some("Started by periodic build scheduler".to_string()),
        parent_event_id: None,
        build_id:        None,
    }
}

#[tokio::test]
async fn post_event_sends_creator_and_bearer_token() {
    let state = FakeApi::new(201, 0);
    let uri = serve(state.clone()).await;

    client().post_event(&uri, "jwt-token", &event()).await.unwrap();

    let requests = state.requests();
    assert_eq!(requests.len(), 1);
    let (body, auth) = &requests[0];
    assert_eq!(auth.as_deref(), Some("Bearer jwt-token"));
    assert_eq!(body["pipelineId"], Value::from(42));
    assert_eq!(body["startFrom"], Value::from("main"));
    assert_eq!(body["creator"]["name"], Value::from("Screwdriver scheduler"));
    assert_eq!(body["creator"]["username"], Value::from("sd:scheduler"));
}

#[tokio::test]
async fn post_event_treats_404_as_success() {
    let state = FakeApi::new(404, 0);
    let uri = serve(state.clone()).await;

    client().post_event(&uri, "jwt", &event()).await.unwrap();
    assert_eq!(state.requests().len(), 1, "404 is terminal, no retries");
}

#[tokio::test]
async fn post_event_retries_server_errors() {
    let state = FakeApi::new(201, 2);
    let uri = serve(state.clone()).await;

    client().post_event(&uri, "jwt", &event()).await.unwrap();
    assert_eq!(state.requests().len(), 3, "two failures, then success");
}

#[tokio::test]
async fn post_event_gives_up_after_retry_limit() {
    let state = FakeApi::new(201, 10);
    let uri = serve(state.clone()).await;

    let err = client().post_event(&uri, "jwt", &event()).await.unwrap_err();
    assert_eq!(state.requests().len(), 4, "initial attempt plus 3 retries");
    assert!(err.to_string().contains("/v4/events"));
}

#[tokio::test]
async fn update_build_status_puts_status_body() {
    let state = FakeApi::new(200, 0);
    let uri = serve(state.clone()).await;

    client()
        .update_build_status(&uri, 8609, "build-token", BuildStatus::Frozen, "Blocked")
        .await
        .unwrap();

    let requests = state.requests();
    assert_eq!(requests.len(), 1);
    let (body, auth) = &requests[0];
    assert_eq!(auth.as_deref(), Some("Bearer build-token"));
    assert_eq!(body["status"], Value::from("FROZEN"));
    assert_eq!(body["statusMessage"], Value::from("Blocked"));
}

#[tokio::test]
async fn update_build_status_retries_non_200() {
    let state = FakeApi::new(200, 1);
    let uri = serve(state.clone()).await;

    client()
        .update_build_status(&uri, 8609, "t", BuildStatus::Failure, "timeout")
        .await
        .unwrap();
    assert_eq!(state.requests().len(), 2);
}
