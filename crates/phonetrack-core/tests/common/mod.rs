#![allow(dead_code)]

//! Local stand-in for a PhoneTrack server.
//!
//! Serves a scripted status/body pair at
//! `/apps/phonetrack/api/getlastpositions/<token>` and counts requests.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;

pub const TOKEN: &str = "0123456789abcdef0123456789abcdef";

#[derive(Debug, Clone)]
pub struct Reply {
    pub status: u16,
    pub body: String,
    pub delay: Duration,
}

impl Reply {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            body: body.into(),
            delay: Duration::ZERO,
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            body: String::new(),
            delay: Duration::ZERO,
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[derive(Clone)]
struct MockState {
    reply: Arc<Mutex<Reply>>,
    hits: Arc<AtomicUsize>,
}

pub struct MockPhoneTrack {
    addr: SocketAddr,
    state: MockState,
    handle: tokio::task::JoinHandle<()>,
}

impl MockPhoneTrack {
    pub async fn start(reply: Reply) -> Self {
        let state = MockState {
            reply: Arc::new(Mutex::new(reply)),
            hits: Arc::new(AtomicUsize::new(0)),
        };

        let app = Router::new()
            .route(
                "/apps/phonetrack/api/getlastpositions/:token",
                get(last_positions),
            )
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock server");
        let addr = listener.local_addr().expect("mock server address");
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("mock server");
        });

        Self { addr, state, handle }
    }

    pub fn url(&self) -> String {
        format!(
            "http://{}/apps/phonetrack/api/getlastpositions/{}",
            self.addr, TOKEN
        )
    }

    pub fn set_reply(&self, reply: Reply) {
        *self.state.reply.lock().unwrap() = reply;
    }

    pub fn hits(&self) -> usize {
        self.state.hits.load(Ordering::SeqCst)
    }
}

impl Drop for MockPhoneTrack {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn last_positions(State(state): State<MockState>) -> (StatusCode, String) {
    state.hits.fetch_add(1, Ordering::SeqCst);
    let reply = state.reply.lock().unwrap().clone();
    if !reply.delay.is_zero() {
        tokio::time::sleep(reply.delay).await;
    }
    let status = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, reply.body)
}

pub fn device_body(device: &str, accuracy: f64, timestamp: i64) -> String {
    serde_json::json!({
        "tok": {
            device: {
                "lat": 48.8566,
                "lon": 2.3522,
                "accuracy": accuracy,
                "batterylevel": 64,
                "timestamp": timestamp,
            }
        }
    })
    .to_string()
}
