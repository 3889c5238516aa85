//! Stub accrual service for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use url::Url;

/// One canned reply from the stub.
#[derive(Clone, Debug)]
pub enum Reply {
    Status(&'static str),
    Processed(f64),
    TooManyRequests(Option<&'static str>),
    Http(u16),
}

impl Reply {
    fn render(&self, order: &str) -> Response {
        match self {
            Reply::Status(status) => Json(json!({ "order": order, "status": status })).into_response(),
            Reply::Processed(accrual) => Json(json!({
                "order": order,
                "status": "PROCESSED",
                "accrual": accrual,
            }))
            .into_response(),
            Reply::TooManyRequests(Some(retry_after)) => (
                StatusCode::TOO_MANY_REQUESTS,
                [(header::RETRY_AFTER, *retry_after)],
                "No more than N requests per minute allowed",
            )
                .into_response(),
            Reply::TooManyRequests(None) => StatusCode::TOO_MANY_REQUESTS.into_response(),
            Reply::Http(code) => StatusCode::from_u16(*code)
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
                .into_response(),
        }
    }
}

/// Per-order reply scripts. The last reply repeats once a script runs out;
/// unscripted orders get 204.
#[derive(Clone, Default)]
pub struct StubAccrual {
    scripts: Arc<Mutex<HashMap<String, Vec<Reply>>>>,
    hits: Arc<Mutex<HashMap<String, usize>>>,
}

impl StubAccrual {
    pub fn script(&self, order: &str, replies: Vec<Reply>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(order.to_string(), replies);
    }

    pub fn hits(&self, order: &str) -> usize {
        self.hits.lock().unwrap().get(order).copied().unwrap_or(0)
    }

    /// Bind on an ephemeral port and serve until the test runtime ends.
    pub async fn spawn(&self) -> Url {
        let app = Router::new()
            .route("/api/orders/:number", get(order_handler))
            .with_state(self.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Url::parse(&format!("http://{}/", addr)).unwrap()
    }
}

async fn order_handler(State(stub): State<StubAccrual>, Path(number): Path<String>) -> Response {
    let hit = {
        let mut hits = stub.hits.lock().unwrap();
        let count = hits.entry(number.clone()).or_insert(0);
        *count += 1;
        *count - 1
    };
    let reply = stub.scripts.lock().unwrap().get(&number).and_then(|replies| {
        replies
            .get(hit)
            .or_else(|| replies.last())
            .cloned()
    });
    match reply {
        Some(reply) => reply.render(&number),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}
