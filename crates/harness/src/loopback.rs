use std::sync::Arc;

use tandem_client::{JsonChannel, TransportError};
use tandem_engine::{RequestContext, wire};

use crate::network::HarnessCoordinator;

/// In-process [`JsonChannel`]: hands each request body straight to the
/// coordinator's wire handler, with switches to simulate a flaky network.
pub struct LoopbackChannel {
    coordinator: Arc<HarnessCoordinator>,
    ctx: RequestContext,
    offline: bool,
    drop_requests: usize,
    lose_replies: usize,
    round_trips: usize,
    last_request: Option<String>,
    latency_ms: u64,
    last_timeout_ms: Option<u64>,
}

impl LoopbackChannel {
    pub fn new(coordinator: Arc<HarnessCoordinator>, ctx: RequestContext) -> Self {
        Self {
            coordinator,
            ctx,
            offline: false,
            drop_requests: 0,
            lose_replies: 0,
            round_trips: 0,
            last_request: None,
            latency_ms: 0,
            last_timeout_ms: None,
        }
    }

    pub fn context(&self) -> &RequestContext {
        &self.ctx
    }

    pub fn set_offline(&mut self, offline: bool) {
        self.offline = offline;
    }

    /// The next `n` requests time out before reaching the coordinator.
    pub fn drop_requests(&mut self, n: usize) {
        self.drop_requests = n;
    }

    /// The next `n` requests are handled but their replies time out.
    pub fn lose_replies(&mut self, n: usize) {
        self.lose_replies = n;
    }

    /// Every reply takes `ms` to arrive. Replies slower than the caller's
    /// deadline are handled but reported as timed out.
    pub fn set_latency(&mut self, ms: u64) {
        self.latency_ms = ms;
    }

    /// Deadline passed with the most recent request.
    pub fn last_timeout_ms(&self) -> Option<u64> {
        self.last_timeout_ms
    }

    pub fn round_trips(&self) -> usize {
        self.round_trips
    }

    pub fn last_request(&self) -> Option<&str> {
        self.last_request.as_deref()
    }
}

impl JsonChannel for LoopbackChannel {
    fn round_trip(&mut self, body: &str, timeout_ms: u64) -> Result<String, TransportError> {
        self.round_trips += 1;
        self.last_request = Some(body.to_string());
        self.last_timeout_ms = Some(timeout_ms);

        if self.offline {
            return Err(TransportError::Disconnected("loopback offline".into()));
        }
        if self.drop_requests > 0 {
            self.drop_requests -= 1;
            return Err(TransportError::Timeout);
        }

        let reply = wire::handle(self.coordinator.as_ref(), &self.ctx, body)?;
        if self.latency_ms > timeout_ms {
            tracing::debug!(latency_ms = self.latency_ms, timeout_ms, "loopback reply too slow");
            return Err(TransportError::Timeout);
        }
        if self.lose_replies > 0 {
            self.lose_replies -= 1;
            return Err(TransportError::Timeout);
        }
        Ok(reply)
    }
}
