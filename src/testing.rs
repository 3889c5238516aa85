//! Test doubles shared by unit tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::time::Instant;

use crate::accrual::{AccrualClient, AccrualError, AccrualResult};
use crate::ratelimit::RateLimiter;

enum Tail {
    Repeat(AccrualResult),
    Hang,
}

/// Replays scripted query results and records when each query was made.
pub struct ScriptedClient {
    script: Mutex<VecDeque<AccrualResult>>,
    tail: Tail,
    calls: Mutex<Vec<(String, Instant)>>,
}

impl ScriptedClient {
    /// Replay `script`, then report a transport error forever.
    pub fn new(script: Vec<AccrualResult>) -> Self {
        Self::with_tail(
            script,
            Tail::Repeat(Err(AccrualError::Transport("script exhausted".to_string()))),
        )
    }

    pub fn repeating(result: AccrualResult) -> Self {
        Self::with_tail(Vec::new(), Tail::Repeat(result))
    }

    /// Every query waits forever.
    pub fn hanging() -> Self {
        Self::with_tail(Vec::new(), Tail::Hang)
    }

    fn with_tail(script: Vec<AccrualResult>, tail: Tail) -> Self {
        Self {
            script: Mutex::new(script.into()),
            tail,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn call_times(&self, order_id: &str) -> Vec<Instant> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == order_id)
            .map(|(_, at)| *at)
            .collect()
    }
}

#[async_trait]
impl AccrualClient for ScriptedClient {
    async fn query(&self, order_id: &str) -> AccrualResult {
        self.calls
            .lock()
            .unwrap()
            .push((order_id.to_string(), Instant::now()));

        let next = self.script.lock().unwrap().pop_front();
        match (next, &self.tail) {
            (Some(result), _) => result,
            (None, Tail::Repeat(result)) => result.clone(),
            (None, Tail::Hang) => std::future::pending().await,
        }
    }
}

/// Takes a permit from `limiter` before each query, like the HTTP client.
pub struct Throttled {
    pub limiter: Arc<dyn RateLimiter>,
    pub inner: Arc<ScriptedClient>,
}

#[async_trait]
impl AccrualClient for Throttled {
    async fn query(&self, order_id: &str) -> AccrualResult {
        self.limiter.acquire().await;
        self.inner.query(order_id).await
    }
}
