use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use serde_json::{Value, json};
use tacit_core::{RequestDescriptor, RequestError, Transport};
use tracing::info;

/// Transport that fails the first `n` sends with a network error, then
/// echoes each request back as its response.
pub struct SimulatedTransport {
    remaining_failures: AtomicU32,
}

impl SimulatedTransport {
    pub fn new(n: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(n),
        }
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    async fn send(&self, request: &RequestDescriptor) -> Result<Value, RequestError> {
        let left = self.remaining_failures.load(Ordering::Relaxed);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
            return Err(RequestError::network(format!(
                "simulated outage (left={left})"
            )));
        }

        info!(method = %request.method, target = %request.target, "request delivered");
        Ok(json!({
            "method": request.method,
            "target": request.target,
            "body": request.body,
        }))
    }
}
