use std::collections::{BTreeMap, BTreeSet};

use tandem_core::{Cursor, SettingId, SettingValue, SyncConfig};
use tandem_engine::wire::{self, WireCursor, WireRequest, WireResponse};
use tandem_engine::{PreviewOutcome, PreviewRequest, PublishReport, PullResponse, SessionBootstrap};

use crate::error::TransportError;

/// Request/response channel from a client session to the coordinator.
pub trait SyncTransport {
    /// Adopt the coordinator's configuration, called before the first
    /// request and again after every connect.
    fn configure(&mut self, _config: &SyncConfig) {}

    fn connect(&mut self) -> Result<SessionBootstrap, TransportError>;

    fn submit_previews(
        &mut self,
        cursor: &Cursor,
        requests: &[PreviewRequest],
    ) -> Result<BTreeMap<SettingId, PreviewOutcome>, TransportError>;

    fn publish_all(
        &mut self,
        cursor: &Cursor,
        values: &BTreeMap<SettingId, SettingValue>,
        overrides: &BTreeSet<SettingId>,
    ) -> Result<PublishReport, TransportError>;

    fn pull(&mut self, cursor: &Cursor) -> Result<PullResponse, TransportError>;
}

/// Carries one encoded request body and returns the encoded reply. A reply
/// that takes longer than `timeout_ms` is reported as
/// [`TransportError::Timeout`].
pub trait JsonChannel {
    fn round_trip(&mut self, body: &str, timeout_ms: u64) -> Result<String, TransportError>;
}

/// [`SyncTransport`] speaking the JSON wire format over a [`JsonChannel`].
pub struct JsonTransport<C> {
    channel: C,
    timeout_ms: u64,
}

impl<C: JsonChannel> JsonTransport<C> {
    pub fn new(channel: C) -> Self {
        Self {
            channel,
            timeout_ms: SyncConfig::default().submit_timeout_ms,
        }
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }

    fn call(&mut self, request: &WireRequest) -> Result<WireResponse, TransportError> {
        let body = wire::encode_request(request)?;
        let reply = self.channel.round_trip(&body, self.timeout_ms)?;
        wire::decode_reply(&reply)?.map_err(TransportError::Remote)
    }
}

impl<C: JsonChannel> SyncTransport for JsonTransport<C> {
    fn configure(&mut self, config: &SyncConfig) {
        self.timeout_ms = config.submit_timeout_ms;
    }

    fn connect(&mut self) -> Result<SessionBootstrap, TransportError> {
        Ok(self.call(&WireRequest::Connect)?.into_bootstrap()?)
    }

    fn submit_previews(
        &mut self,
        cursor: &Cursor,
        requests: &[PreviewRequest],
    ) -> Result<BTreeMap<SettingId, PreviewOutcome>, TransportError> {
        let request = WireRequest::Preview {
            cursor: Some(WireCursor::from(cursor)),
            customized: requests
                .iter()
                .map(|r| (r.setting_id.clone(), r.value.clone()))
                .collect(),
            overrides: requests
                .iter()
                .filter(|r| r.override_lock)
                .map(|r| r.setting_id.clone())
                .collect(),
        };
        Ok(self.call(&request)?.into_preview_outcomes()?)
    }

    fn publish_all(
        &mut self,
        cursor: &Cursor,
        values: &BTreeMap<SettingId, SettingValue>,
        overrides: &BTreeSet<SettingId>,
    ) -> Result<PublishReport, TransportError> {
        let request = WireRequest::Publish {
            cursor: Some(WireCursor::from(cursor)),
            customized: values.clone(),
            overrides: overrides.clone(),
        };
        Ok(self.call(&request)?.into_publish_report()?)
    }

    fn pull(&mut self, cursor: &Cursor) -> Result<PullResponse, TransportError> {
        let request = WireRequest::Heartbeat {
            cursor: Some(WireCursor::from(cursor)),
        };
        Ok(self.call(&request)?.into_pull_response()?)
    }
}
