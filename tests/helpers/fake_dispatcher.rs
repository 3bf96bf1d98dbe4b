//! Recording dispatcher with scriptable delays and failures.

use async_trait::async_trait;
use sparkrelay::core::{AlertDispatcher, AlertRequest, DeliveryReceipt, DeliveryResult};
use sparkrelay::errors::DeliveryError;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct State {
    invoked: Vec<AlertRequest>,
    completed: Vec<String>,
    delays: HashMap<String, Duration>,
    rate_limited: HashSet<String>,
    next_sid: usize,
}

/// Records every `send` at entry and again at completion, so tests can
/// distinguish dispatch order from completion order.
#[derive(Default)]
pub struct FakeDispatcher {
    state: Mutex<State>,
}

impl FakeDispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Holds the dispatch for `delay` before completing it.
    pub fn delay_body(&self, body: &str, delay: Duration) {
        self.state
            .lock()
            .unwrap()
            .delays
            .insert(body.to_string(), delay);
    }

    /// Makes dispatches with this body fail as rate limited.
    pub fn rate_limit_body(&self, body: &str) {
        self.state
            .lock()
            .unwrap()
            .rate_limited
            .insert(body.to_string());
    }

    pub fn invocations(&self) -> Vec<AlertRequest> {
        self.state.lock().unwrap().invoked.clone()
    }

    /// Provider ids for successes, `error:<kind>` for failures, in
    /// completion order.
    pub fn completions(&self) -> Vec<String> {
        self.state.lock().unwrap().completed.clone()
    }

    pub async fn wait_for_invocations(&self, count: usize, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.invocations().len() < count {
            if tokio::time::Instant::now() > deadline {
                panic!("timed out waiting for {count} dispatch invocations");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn wait_for_completions(&self, count: usize, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.completions().len() < count {
            if tokio::time::Instant::now() > deadline {
                panic!("timed out waiting for {count} dispatch completions");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl AlertDispatcher for FakeDispatcher {
    fn name(&self) -> &str {
        "fake"
    }

    async fn send(&self, request: &AlertRequest) -> DeliveryResult {
        let (delay, limited, sid) = {
            let mut state = self.state.lock().unwrap();
            state.invoked.push(request.clone());
            state.next_sid += 1;
            (
                state.delays.get(&request.body).copied(),
                state.rate_limited.contains(&request.body),
                format!("SM{:04}", state.next_sid),
            )
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let result = if limited {
            Err(DeliveryError::RateLimited(
                "simulated provider backpressure".to_string(),
            ))
        } else {
            Ok(DeliveryReceipt { provider_id: sid })
        };

        {
            let mut state = self.state.lock().unwrap();
            state.completed.push(match &result {
                Ok(receipt) => receipt.provider_id.clone(),
                Err(err) => format!("error:{}", err.kind()),
            });
        }
        result
    }
}
