//! JSON request/response bodies exchanged between client sessions and the
//! coordinator.
//!
//! Every reply is an envelope `{"success": bool, "data": ...}`; on failure
//! `data` is a [`WireError`]. Timestamps travel twice: `modified_at` in epoch
//! seconds for display, and `position` with the exact clock reading the
//! client feeds back as its cursor.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tandem_core::{
    CoreError, Cursor, Hlc, SettingId, SettingValue, StoreGeneration, SyncConfig, User, UserId,
};
use tandem_storage::{RecordStore, SettingStatus};

use crate::error::{ErrorCode, SyncError};
use crate::{
    Coordinator, PreviewOutcome, PreviewRequest, PreviewStatus, PreviousWrite, PublishReport,
    PublishResult, PublishStatus, PullResponse, RequestContext, SessionBootstrap, SettingUpdate,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WirePosition {
    pub ms: u64,
    pub seq: u32,
}

impl From<Hlc> for WirePosition {
    fn from(hlc: Hlc) -> Self {
        Self {
            ms: hlc.wall_ms(),
            seq: hlc.counter(),
        }
    }
}

impl From<WirePosition> for Hlc {
    fn from(p: WirePosition) -> Self {
        Hlc::new(p.ms, p.seq)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireCursor {
    pub generation: String,
    pub ms: u64,
    pub seq: u32,
}

impl From<&Cursor> for WireCursor {
    fn from(cursor: &Cursor) -> Self {
        Self {
            generation: cursor.generation.to_string(),
            ms: cursor.position.wall_ms(),
            seq: cursor.position.counter(),
        }
    }
}

impl TryFrom<&WireCursor> for Cursor {
    type Error = CoreError;

    fn try_from(wire: &WireCursor) -> Result<Self, Self::Error> {
        Ok(Cursor::new(
            StoreGeneration::parse_str(&wire.generation)?,
            Hlc::new(wire.ms, wire.seq),
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireUser {
    pub user_id: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

impl From<&User> for WireUser {
    fn from(user: &User) -> Self {
        Self {
            user_id: user.id.to_string(),
            display_name: user.display_name.clone(),
            avatar: user.avatar_ref.clone(),
        }
    }
}

impl TryFrom<WireUser> for User {
    type Error = CoreError;

    fn try_from(wire: WireUser) -> Result<Self, Self::Error> {
        Ok(User {
            id: UserId::parse_str(&wire.user_id)?,
            display_name: wire.display_name,
            avatar_ref: wire.avatar,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireRecord {
    pub setting_id: SettingId,
    pub value: SettingValue,
    pub status: SettingStatus,
    pub author: WireUser,
    pub modified_at: i64,
    pub revision_number: u64,
    pub position: WirePosition,
}

impl From<&SettingUpdate> for WireRecord {
    fn from(update: &SettingUpdate) -> Self {
        Self {
            setting_id: update.setting_id.clone(),
            value: update.value.clone(),
            status: update.status,
            author: WireUser::from(&update.author),
            modified_at: update.modified_at.epoch_seconds(),
            revision_number: update.revision_number,
            position: update.modified_at.into(),
        }
    }
}

impl TryFrom<WireRecord> for SettingUpdate {
    type Error = CoreError;

    fn try_from(wire: WireRecord) -> Result<Self, Self::Error> {
        Ok(SettingUpdate {
            setting_id: wire.setting_id,
            value: wire.value,
            status: wire.status,
            author: wire.author.try_into()?,
            modified_at: wire.position.into(),
            revision_number: wire.revision_number,
        })
    }
}

fn records_from_wire(records: Vec<WireRecord>) -> Result<Vec<SettingUpdate>, CoreError> {
    records.into_iter().map(SettingUpdate::try_from).collect()
}

// ============================================================================
// Requests
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum WireRequest {
    Connect,
    Preview {
        cursor: Option<WireCursor>,
        customized: BTreeMap<SettingId, SettingValue>,
        #[serde(default)]
        overrides: BTreeSet<SettingId>,
    },
    Publish {
        cursor: Option<WireCursor>,
        customized: BTreeMap<SettingId, SettingValue>,
        #[serde(default)]
        overrides: BTreeSet<SettingId>,
    },
    Heartbeat {
        cursor: Option<WireCursor>,
    },
}

// ============================================================================
// Responses
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WirePreviousPreview {
    pub previewer: WireUser,
    pub status: SettingStatus,
    pub timestamp: i64,
    pub position: WirePosition,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WirePreviewResult {
    pub status: PreviewStatus,
    #[serde(default)]
    pub overridden: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<WireRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_preview: Option<WirePreviousPreview>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&PreviewOutcome> for WirePreviewResult {
    fn from(outcome: &PreviewOutcome) -> Self {
        Self {
            status: outcome.status,
            overridden: outcome.overridden,
            record: outcome.record.as_ref().map(WireRecord::from),
            previous_preview: outcome.previous.as_ref().map(|p| WirePreviousPreview {
                previewer: WireUser::from(&p.author),
                status: p.status,
                timestamp: p.modified_at.epoch_seconds(),
                position: p.modified_at.into(),
            }),
            error: outcome.error.clone(),
        }
    }
}

impl WirePreviewResult {
    pub fn into_outcome(self, setting_id: SettingId) -> Result<PreviewOutcome, CoreError> {
        let previous = match self.previous_preview {
            Some(p) => Some(PreviousWrite {
                author: p.previewer.try_into()?,
                status: p.status,
                modified_at: p.position.into(),
            }),
            None => None,
        };
        Ok(PreviewOutcome {
            setting_id,
            status: self.status,
            overridden: self.overridden,
            record: self.record.map(SettingUpdate::try_from).transpose()?,
            previous,
            error: self.error,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WirePublishResult {
    pub status: PublishStatus,
    #[serde(default)]
    pub overridden: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<WireRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub theirs: Option<WireRecord>,
}

impl From<&PublishResult> for WirePublishResult {
    fn from(result: &PublishResult) -> Self {
        Self {
            status: result.status,
            overridden: result.overridden,
            record: result.record.as_ref().map(WireRecord::from),
            theirs: result.theirs.as_ref().map(WireRecord::from),
        }
    }
}

impl WirePublishResult {
    pub fn into_result(self, setting_id: SettingId) -> Result<PublishResult, CoreError> {
        Ok(PublishResult {
            setting_id,
            status: self.status,
            overridden: self.overridden,
            record: self.record.map(SettingUpdate::try_from).transpose()?,
            theirs: self.theirs.map(SettingUpdate::try_from).transpose()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WireResponse {
    Connected {
        user: WireUser,
        cursor: WireCursor,
        active_previews: Vec<WireRecord>,
        config: SyncConfig,
    },
    Previewed {
        previewed_settings: BTreeMap<SettingId, WirePreviewResult>,
    },
    Published {
        committed: bool,
        results: BTreeMap<SettingId, WirePublishResult>,
    },
    Heartbeat {
        setting_updates: Vec<WireRecord>,
        next_cursor: WireCursor,
        has_more: bool,
    },
}

impl From<&SessionBootstrap> for WireResponse {
    fn from(boot: &SessionBootstrap) -> Self {
        Self::Connected {
            user: WireUser::from(&boot.user),
            cursor: WireCursor::from(&boot.cursor),
            active_previews: boot.active_previews.iter().map(WireRecord::from).collect(),
            config: boot.config.clone(),
        }
    }
}

impl From<&PullResponse> for WireResponse {
    fn from(pull: &PullResponse) -> Self {
        Self::Heartbeat {
            setting_updates: pull.updates.iter().map(WireRecord::from).collect(),
            next_cursor: WireCursor::from(&pull.next_cursor),
            has_more: pull.has_more,
        }
    }
}

impl From<&PublishReport> for WireResponse {
    fn from(report: &PublishReport) -> Self {
        Self::Published {
            committed: report.committed,
            results: report
                .results
                .iter()
                .map(|(id, r)| (id.clone(), WirePublishResult::from(r)))
                .collect(),
        }
    }
}

impl WireResponse {
    fn unexpected(&self, wanted: &str) -> CoreError {
        CoreError::InvalidData(format!("expected {wanted} response, got {self:?}"))
    }

    pub fn into_bootstrap(self) -> Result<SessionBootstrap, CoreError> {
        match self {
            Self::Connected {
                user,
                cursor,
                active_previews,
                config,
            } => Ok(SessionBootstrap {
                user: user.try_into()?,
                cursor: Cursor::try_from(&cursor)?,
                active_previews: records_from_wire(active_previews)?,
                config,
            }),
            other => Err(other.unexpected("connected")),
        }
    }

    pub fn into_preview_outcomes(self) -> Result<BTreeMap<SettingId, PreviewOutcome>, CoreError> {
        match self {
            Self::Previewed { previewed_settings } => previewed_settings
                .into_iter()
                .map(|(id, r)| -> Result<_, CoreError> { Ok((id.clone(), r.into_outcome(id)?)) })
                .collect(),
            other => Err(other.unexpected("previewed")),
        }
    }

    pub fn into_publish_report(self) -> Result<PublishReport, CoreError> {
        match self {
            Self::Published { committed, results } => Ok(PublishReport {
                committed,
                results: results
                    .into_iter()
                    .map(|(id, r)| -> Result<_, CoreError> { Ok((id.clone(), r.into_result(id)?)) })
                    .collect::<Result<_, _>>()?,
            }),
            other => Err(other.unexpected("published")),
        }
    }

    pub fn into_pull_response(self) -> Result<PullResponse, CoreError> {
        match self {
            Self::Heartbeat {
                setting_updates,
                next_cursor,
                has_more,
            } => Ok(PullResponse {
                updates: records_from_wire(setting_updates)?,
                next_cursor: Cursor::try_from(&next_cursor)?,
                has_more,
            }),
            other => Err(other.unexpected("heartbeat")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{code:?}: {message}")]
pub struct WireError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub their_value: Option<SettingValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub their_author: Option<WireUser>,
}

impl WireError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            their_value: None,
            their_author: None,
        }
    }
}

impl From<&SyncError> for WireError {
    fn from(err: &SyncError) -> Self {
        let mut wire = WireError::new(err.code(), err.to_string());
        match err {
            SyncError::ValidationConflict {
                their_value,
                their_author,
                ..
            } => {
                wire.their_value = Some(their_value.clone());
                wire.their_author = Some(WireUser::from(their_author));
            }
            SyncError::PreviewRejected {
                their_value,
                locked_by,
                ..
            } => {
                wire.their_value = Some(their_value.clone());
                wire.their_author = Some(WireUser::from(locked_by));
            }
            _ => {}
        }
        wire
    }
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    success: bool,
    data: serde_json::Value,
}

fn to_json<T: Serialize>(value: &T) -> Result<String, CoreError> {
    serde_json::to_string(value).map_err(|e| CoreError::Serialization(e.to_string()))
}

fn to_value<T: Serialize>(value: &T) -> Result<serde_json::Value, CoreError> {
    serde_json::to_value(value).map_err(|e| CoreError::Serialization(e.to_string()))
}

pub fn encode_request(request: &WireRequest) -> Result<String, CoreError> {
    to_json(request)
}

pub fn decode_request(body: &str) -> Result<WireRequest, WireError> {
    serde_json::from_str(body).map_err(|e| WireError::new(ErrorCode::BadRequest, e.to_string()))
}

pub fn encode_reply(reply: &Result<WireResponse, WireError>) -> Result<String, CoreError> {
    let envelope = match reply {
        Ok(response) => Envelope {
            success: true,
            data: to_value(response)?,
        },
        Err(error) => Envelope {
            success: false,
            data: to_value(error)?,
        },
    };
    to_json(&envelope)
}

/// Outer error: the body is not a valid reply. Inner error: the coordinator
/// refused the request.
pub fn decode_reply(body: &str) -> Result<Result<WireResponse, WireError>, CoreError> {
    let decode_err = |e: serde_json::Error| CoreError::Serialization(e.to_string());
    let envelope: Envelope = serde_json::from_str(body).map_err(decode_err)?;
    if envelope.success {
        Ok(Ok(serde_json::from_value(envelope.data).map_err(decode_err)?))
    } else {
        Ok(Err(serde_json::from_value(envelope.data).map_err(decode_err)?))
    }
}

// ============================================================================
// Server dispatch
// ============================================================================

fn require_cursor(cursor: Option<WireCursor>) -> Result<Cursor, WireError> {
    let cursor = cursor.ok_or_else(|| {
        WireError::new(ErrorCode::MissingCursor, "request needs a last-update cursor")
    })?;
    Cursor::try_from(&cursor).map_err(|e| WireError::new(ErrorCode::BadRequest, e.to_string()))
}

/// Run one decoded request against the coordinator.
pub fn dispatch<S: RecordStore>(
    coordinator: &Coordinator<S>,
    ctx: &RequestContext,
    request: WireRequest,
) -> Result<WireResponse, WireError> {
    let fail = |e: SyncError| WireError::from(&e);
    match request {
        WireRequest::Connect => {
            let boot = coordinator.connect(ctx).map_err(fail)?;
            Ok(WireResponse::from(&boot))
        }
        WireRequest::Preview {
            cursor,
            customized,
            overrides,
        } => {
            let cursor = require_cursor(cursor)?;
            let requests = customized
                .into_iter()
                .map(|(setting_id, value)| PreviewRequest {
                    override_lock: overrides.contains(&setting_id),
                    setting_id,
                    value,
                })
                .collect();
            let outcomes = coordinator
                .submit_previews(ctx, &cursor, requests)
                .map_err(fail)?;
            Ok(WireResponse::Previewed {
                previewed_settings: outcomes
                    .iter()
                    .map(|(id, o)| (id.clone(), WirePreviewResult::from(o)))
                    .collect(),
            })
        }
        WireRequest::Publish {
            cursor,
            customized,
            overrides,
        } => {
            let cursor = require_cursor(cursor)?;
            let report = coordinator
                .publish_all(ctx, &cursor, customized, &overrides)
                .map_err(fail)?;
            Ok(WireResponse::from(&report))
        }
        WireRequest::Heartbeat { cursor } => {
            let cursor = require_cursor(cursor)?;
            let pull = coordinator.pull(ctx, &cursor).map_err(fail)?;
            Ok(WireResponse::from(&pull))
        }
    }
}

/// Decode a JSON request body, run it, and encode the reply envelope.
pub fn handle<S: RecordStore>(
    coordinator: &Coordinator<S>,
    ctx: &RequestContext,
    body: &str,
) -> Result<String, CoreError> {
    let reply = decode_request(body).and_then(|request| dispatch(coordinator, ctx, request));
    if let Err(error) = &reply {
        tracing::debug!(code = ?error.code, message = %error.message, "request failed");
    }
    encode_reply(&reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn id(s: &str) -> SettingId {
        SettingId::new(s).unwrap()
    }

    #[test]
    fn request_shape() {
        let body = json!({
            "action": "preview",
            "cursor": { "generation": StoreGeneration::new().to_string(), "ms": 5, "seq": 1 },
            "customized": { "color": "red", "sidebar": ["widget_text[2]"] },
            "overrides": ["color"]
        });
        let request = decode_request(&body.to_string()).unwrap();
        match request {
            WireRequest::Preview {
                customized,
                overrides,
                ..
            } => {
                assert_eq!(customized[&id("color")], SettingValue::text("red"));
                assert_eq!(
                    customized[&id("sidebar")],
                    SettingValue::List(vec!["widget_text[2]".into()])
                );
                assert!(overrides.contains(&id("color")));
            }
            other => panic!("unexpected request {other:?}"),
        }

        let heartbeat = decode_request(r#"{"action":"heartbeat"}"#).unwrap();
        assert_eq!(heartbeat, WireRequest::Heartbeat { cursor: None });
        assert_eq!(require_cursor(None).unwrap_err().code, ErrorCode::MissingCursor);
    }

    #[test]
    fn malformed_body_is_bad_request() {
        let err = decode_request(r#"{"action":"explode"}"#).unwrap_err();
        assert_eq!(err.code, ErrorCode::BadRequest);
        let err = decode_request(r#"{"action":"preview","customized":{"":1}}"#).unwrap_err();
        assert_eq!(err.code, ErrorCode::BadRequest);
    }

    #[test]
    fn record_keeps_exact_position() {
        let update = SettingUpdate {
            setting_id: id("color"),
            value: SettingValue::text("red"),
            status: SettingStatus::Draft,
            author: User::new("Ada").with_avatar("a.png"),
            modified_at: Hlc::new(1_700_000_123_456, 3),
            revision_number: 4,
        };
        let wire = WireRecord::from(&update);
        assert_eq!(wire.modified_at, 1_700_000_123);

        let json = serde_json::to_value(&wire).unwrap();
        assert_eq!(json["status"], "draft");
        assert_eq!(json["author"]["avatar"], "a.png");

        let back: WireRecord = serde_json::from_value(json).unwrap();
        assert_eq!(SettingUpdate::try_from(back).unwrap(), update);
    }

    #[test]
    fn error_envelope_carries_conflict_details() {
        let err = SyncError::ValidationConflict {
            setting_id: id("color"),
            their_value: SettingValue::text("red"),
            their_author: User::new("Ada"),
        };
        let body = encode_reply(&Err(WireError::from(&err))).unwrap();
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["success"], false);
        assert_eq!(value["data"]["code"], "validation_conflict");
        assert_eq!(value["data"]["their_value"], "red");

        let decoded = decode_reply(&body).unwrap().unwrap_err();
        assert_eq!(decoded.their_author.unwrap().display_name, "Ada");
    }

    #[test]
    fn result_status_is_a_closed_set() {
        let result: WirePreviewResult =
            serde_json::from_value(json!({ "status": "rejected" })).unwrap();
        assert_eq!(result.status, PreviewStatus::Rejected);
        assert!(serde_json::from_value::<WirePreviewResult>(json!({ "status": "maybe" })).is_err());

        let publish = WirePublishResult {
            status: PublishStatus::Conflict,
            overridden: false,
            record: None,
            theirs: None,
        };
        assert_eq!(serde_json::to_value(&publish).unwrap()["status"], "conflict");
    }

    #[test]
    fn wire_error_displays_code_and_message() {
        let err = WireError::new(ErrorCode::StaleCursor, "store was reset");
        assert_eq!(err.to_string(), "StaleCursor: store was reset");
        let boxed: Box<dyn std::error::Error> = Box::new(err);
        assert!(boxed.source().is_none());
    }

    #[test]
    fn unexpected_response_kind_is_an_error() {
        let response = WireResponse::Published {
            committed: true,
            results: BTreeMap::new(),
        };
        assert!(response.into_pull_response().is_err());
    }
}
