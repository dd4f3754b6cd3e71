use std::collections::{BTreeMap, BTreeSet};

use pretty_assertions::assert_eq;
use tandem_core::{Cursor, Hlc, SettingValue};
use tandem_engine::{ErrorCode, PreviewRequest, PreviewStatus, PublishStatus, SyncError};
use tandem_harness::{TestNetwork, init_tracing, setting};
use tandem_storage::{RecordStore, SettingStatus};

// ============================================================================
// Preview and publish decisions
// ============================================================================

#[test]
fn first_preview_is_accepted_at_revision_one() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let net = TestNetwork::new()?;
    let ada = net.add_user("Ada");
    let ctx = net.context(&ada);
    let c = net.coordinator();
    let color = setting("color")?;

    let cursor = c.connect(&ctx)?.cursor;
    let outcome = c.submit_preview(&ctx, &cursor, PreviewRequest::new(color.clone(), "red".into()))?;

    assert_eq!(outcome.status, PreviewStatus::Accepted);
    assert!(outcome.previous.is_none());
    let record = outcome.record.ok_or("accepted preview without record")?;
    assert_eq!(record.revision_number, 1);
    assert_eq!(record.status, SettingStatus::Draft);
    assert_eq!(record.author.display_name, "Ada");
    Ok(())
}

#[test]
fn foreign_preview_over_unseen_draft_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
    let net = TestNetwork::new()?;
    let (ada, bob) = (net.add_user("Ada"), net.add_user("Bob"));
    let (c1, c2) = (net.context(&ada), net.context(&bob));
    let c = net.coordinator();
    let color = setting("color")?;

    let t0 = c.connect(&c2)?.cursor;
    c.submit_preview(&c1, &t0, PreviewRequest::new(color.clone(), "red".into()))?;
    net.advance(1_000);

    let outcome = c.submit_preview(&c2, &t0, PreviewRequest::new(color.clone(), "blue".into()))?;
    assert_eq!(outcome.status, PreviewStatus::Rejected);
    let theirs = outcome.record.clone().ok_or("rejection without record")?;
    assert_eq!(theirs.value, SettingValue::text("red"));
    assert_eq!(theirs.author.id, ada.id);

    match outcome.into_result() {
        Err(SyncError::PreviewRejected { their_value, locked_by, .. }) => {
            assert_eq!(their_value, SettingValue::text("red"));
            assert_eq!(locked_by.display_name, "Ada");
        }
        other => panic!("expected rejection, got {other:?}"),
    }

    let stored = net.store().get(&color)?.ok_or("record missing")?;
    assert_eq!(stored.revision_number, 1);
    Ok(())
}

#[test]
fn publish_over_unseen_change_conflicts_and_writes_nothing() -> Result<(), Box<dyn std::error::Error>> {
    let net = TestNetwork::new()?;
    let (ada, bob) = (net.add_user("Ada"), net.add_user("Bob"));
    let (c1, c2) = (net.context(&ada), net.context(&bob));
    let c = net.coordinator();
    let color = setting("color")?;

    let t0 = c.connect(&c2)?.cursor;
    c.submit_preview(&c1, &t0, PreviewRequest::new(color.clone(), "red".into()))?;

    let err = c
        .publish(&c2, &t0, color.clone(), "blue".into(), false)
        .expect_err("publish must conflict");
    assert_eq!(err.code(), ErrorCode::ValidationConflict);
    match err {
        SyncError::ValidationConflict { their_value, their_author, .. } => {
            assert_eq!(their_value, SettingValue::text("red"));
            assert_eq!(their_author.id, ada.id);
        }
        other => panic!("expected conflict, got {other:?}"),
    }

    let stored = net.store().get(&color)?.ok_or("record missing")?;
    assert_eq!(stored.revision_number, 1);
    assert_eq!(stored.value, SettingValue::text("red"));
    assert_eq!(stored.status, SettingStatus::Draft);
    Ok(())
}

#[test]
fn override_forces_acceptance() -> Result<(), Box<dyn std::error::Error>> {
    let net = TestNetwork::new()?;
    let (ada, bob) = (net.add_user("Ada"), net.add_user("Bob"));
    let (c1, c2) = (net.context(&ada), net.context(&bob));
    let c = net.coordinator();
    let color = setting("color")?;

    let t0 = c.connect(&c2)?.cursor;
    c.submit_preview(&c1, &t0, PreviewRequest::new(color.clone(), "red".into()))?;
    let rejected = c.submit_preview(&c2, &t0, PreviewRequest::new(color.clone(), "blue".into()))?;
    assert_eq!(rejected.status, PreviewStatus::Rejected);

    let forced = c.submit_preview(
        &c2,
        &t0,
        PreviewRequest::new(color.clone(), "blue".into()).overriding(),
    )?;
    assert_eq!(forced.status, PreviewStatus::Accepted);
    assert!(forced.overridden);
    let record = forced.record.ok_or("accepted preview without record")?;
    assert_eq!(record.revision_number, 2);
    assert_eq!(record.value, SettingValue::text("blue"));
    let previous = forced.previous.ok_or("previous writer missing")?;
    assert_eq!(previous.author.id, ada.id);
    Ok(())
}

#[test]
fn draft_older_than_lock_window_no_longer_blocks() -> Result<(), Box<dyn std::error::Error>> {
    let net = TestNetwork::new()?;
    let (ada, bob) = (net.add_user("Ada"), net.add_user("Bob"));
    let (c1, c2) = (net.context(&ada), net.context(&bob));
    let c = net.coordinator();
    let color = setting("color")?;

    let t0 = c.connect(&c2)?.cursor;
    c.submit_preview(&c1, &t0, PreviewRequest::new(color.clone(), "red".into()))?;
    net.advance(c.config().lock_window_ms() + 1);

    let outcome = c.submit_preview(&c2, &t0, PreviewRequest::new(color.clone(), "blue".into()))?;
    assert_eq!(outcome.status, PreviewStatus::Accepted);
    assert!(!outcome.overridden);
    Ok(())
}

#[test]
fn publish_batch_with_one_conflict_commits_nothing() -> Result<(), Box<dyn std::error::Error>> {
    let net = TestNetwork::new()?;
    let (ada, bob) = (net.add_user("Ada"), net.add_user("Bob"));
    let (c1, c2) = (net.context(&ada), net.context(&bob));
    let c = net.coordinator();
    let (color, title, logo) = (setting("color")?, setting("title")?, setting("logo")?);

    let t0 = c.connect(&c2)?.cursor;
    c.publish(&c1, &t0, color.clone(), "red".into(), false)?;

    let batch = BTreeMap::from([
        (color.clone(), SettingValue::text("blue")),
        (title.clone(), SettingValue::text("Hello")),
        (logo.clone(), SettingValue::text("logo.png")),
    ]);
    let report = c.publish_all(&c2, &t0, batch, &BTreeSet::new())?;

    assert!(!report.committed);
    assert_eq!(report.results.len(), 3);
    assert_eq!(report.results[&color].status, PublishStatus::Conflict);
    assert_eq!(report.results[&title].status, PublishStatus::Accepted);
    assert_eq!(report.results[&logo].status, PublishStatus::Accepted);
    assert_eq!(report.published().count(), 0);

    assert!(net.store().get(&title)?.is_none());
    assert!(net.store().get(&logo)?.is_none());
    let stored = net.store().get(&color)?.ok_or("record missing")?;
    assert_eq!(stored.value, SettingValue::text("red"));
    assert_eq!(stored.author_id, ada.id);
    Ok(())
}

#[test]
fn publishing_own_draft_marks_it_published() -> Result<(), Box<dyn std::error::Error>> {
    let net = TestNetwork::new()?;
    let ada = net.add_user("Ada");
    let ctx = net.context(&ada);
    let c = net.coordinator();
    let color = setting("color")?;

    let cursor = c.connect(&ctx)?.cursor;
    c.submit_preview(&ctx, &cursor, PreviewRequest::new(color.clone(), "red".into()))?;
    let published = c.publish(&ctx, &cursor, color.clone(), "red".into(), false)?;
    assert_eq!(published.status, SettingStatus::Published);
    assert_eq!(published.revision_number, 2);
    Ok(())
}

// ============================================================================
// Store and pull properties
// ============================================================================

#[test]
fn revision_counts_every_write() -> Result<(), Box<dyn std::error::Error>> {
    let net = TestNetwork::new()?;
    let ada = net.add_user("Ada");
    let ctx = net.context(&ada);
    let c = net.coordinator();
    let title = setting("title")?;

    let cursor = c.connect(&ctx)?.cursor;
    for n in 0..7 {
        let outcome = c.submit_preview(
            &ctx,
            &cursor,
            PreviewRequest::new(title.clone(), format!("draft {n}").into()),
        )?;
        assert_eq!(outcome.record.ok_or("no record")?.revision_number, n + 1);
    }
    Ok(())
}

#[test]
fn accepted_preview_is_visible_to_older_cursor() -> Result<(), Box<dyn std::error::Error>> {
    let net = TestNetwork::new()?;
    let (ada, bob) = (net.add_user("Ada"), net.add_user("Bob"));
    let (c1, c2) = (net.context(&ada), net.context(&bob));
    let c = net.coordinator();
    let color = setting("color")?;

    let old = c.connect(&c2)?.cursor;
    let written = c
        .submit_preview(&c1, &old, PreviewRequest::new(color.clone(), "red".into()))?
        .into_result()?;

    let pulled = c.pull(&c2, &old)?;
    let seen = pulled
        .updates
        .iter()
        .find(|u| u.setting_id == color)
        .ok_or("preview not pulled")?;
    assert_eq!(seen.value, written.value);
    assert!(seen.revision_number >= written.revision_number);
    assert!(pulled.next_cursor.position >= written.modified_at);
    Ok(())
}

#[test]
fn repeated_pull_with_same_cursor_is_stable() -> Result<(), Box<dyn std::error::Error>> {
    let net = TestNetwork::new()?;
    let (ada, bob) = (net.add_user("Ada"), net.add_user("Bob"));
    let (c1, c2) = (net.context(&ada), net.context(&bob));
    let c = net.coordinator();

    let cursor = c.connect(&c2)?.cursor;
    c.submit_preview(&c1, &cursor, PreviewRequest::new(setting("color")?, "red".into()))?;

    let first = c.pull(&c2, &cursor)?;
    let again = c.pull(&c2, &cursor)?;
    assert_eq!(first, again);
    assert_eq!(first.updates.len(), 1);

    let next = c.pull(&c2, &first.next_cursor)?;
    assert!(next.updates.is_empty());
    assert_eq!(next.next_cursor, first.next_cursor);
    Ok(())
}

#[test]
fn pull_pages_through_backlog_in_order() -> Result<(), Box<dyn std::error::Error>> {
    let config = tandem_core::SyncConfig {
        pull_limit: 2,
        ..Default::default()
    };
    let net = TestNetwork::with_config(config)?;
    let (ada, bob) = (net.add_user("Ada"), net.add_user("Bob"));
    let (c1, c2) = (net.context(&ada), net.context(&bob));
    let c = net.coordinator();

    let mut cursor = c.connect(&c2)?.cursor;
    for name in ["color", "logo", "title", "blogname", "widget_text[2]"] {
        c.submit_preview(&c1, &cursor, PreviewRequest::new(setting(name)?, "x".into()))?;
    }

    let mut seen = Vec::new();
    let mut pages = 0;
    loop {
        let page = c.pull(&c2, &cursor)?;
        pages += 1;
        assert!(page.updates.len() <= 2);
        seen.extend(page.updates.iter().map(|u| u.modified_at));
        cursor = page.next_cursor;
        if !page.has_more {
            break;
        }
    }
    assert_eq!(pages, 3);
    assert_eq!(seen.len(), 5);
    assert!(seen.windows(2).all(|w| w[0] < w[1]));
    Ok(())
}

#[test]
fn modified_at_never_repeats_within_a_millisecond() -> Result<(), Box<dyn std::error::Error>> {
    let net = TestNetwork::new()?;
    let ada = net.add_user("Ada");
    let ctx = net.context(&ada);
    let c = net.coordinator();
    let cursor = c.connect(&ctx)?.cursor;

    let mut stamps = Vec::new();
    for name in ["color", "logo", "title"] {
        let record = c
            .submit_preview(&ctx, &cursor, PreviewRequest::new(setting(name)?, "x".into()))?
            .into_result()?;
        stamps.push(record.modified_at);
    }
    assert!(stamps.windows(2).all(|w| w[0] < w[1]));
    assert!(stamps.iter().all(|s| s.wall_ms() == net.now_ms()));
    Ok(())
}

// ============================================================================
// Request validation
// ============================================================================

#[test]
fn requests_are_authorized_before_resolution() -> Result<(), Box<dyn std::error::Error>> {
    let net = TestNetwork::new()?;
    let viewer = net.add_user_without_capability("Viewer");
    let c = net.coordinator();
    let cursor = Cursor::new(net.store().generation()?, Hlc::ZERO);

    let err = c
        .submit_preview(
            &net.context(&viewer),
            &cursor,
            PreviewRequest::new(setting("color")?, "red".into()),
        )
        .expect_err("viewer cannot preview");
    assert_eq!(err.code(), ErrorCode::Unauthorized);

    let anonymous = tandem_engine::RequestContext::anonymous();
    let err = c.pull(&anonymous, &cursor).expect_err("anonymous cannot pull");
    assert_eq!(err.code(), ErrorCode::NotLoggedIn);
    assert_eq!(net.store().record_count()?, 0);
    Ok(())
}

#[test]
fn batch_preview_reports_failed_settings_individually() -> Result<(), Box<dyn std::error::Error>> {
    let net = TestNetwork::new()?;
    let ada = net.add_user("Ada");
    let ctx = net.context(&ada);
    let c = net.coordinator();
    let (color, logo) = (setting("color")?, setting("logo")?);
    let cursor = c.connect(&ctx)?.cursor;

    net.store().fail_setting(logo.clone());
    let outcomes = c.submit_previews(
        &ctx,
        &cursor,
        vec![
            PreviewRequest::new(color.clone(), "red".into()),
            PreviewRequest::new(logo.clone(), "logo.png".into()),
        ],
    )?;

    assert_eq!(outcomes[&color].status, PreviewStatus::Accepted);
    assert_eq!(outcomes[&logo].status, PreviewStatus::Failed);
    assert!(outcomes[&logo].error.is_some());
    assert!(net.store().get(&logo)?.is_none());
    assert_eq!(net.store().injected(), 1);
    Ok(())
}

#[test]
fn storage_failure_during_publish_applies_nothing() -> Result<(), Box<dyn std::error::Error>> {
    let net = TestNetwork::new()?;
    let ada = net.add_user("Ada");
    let ctx = net.context(&ada);
    let c = net.coordinator();
    let cursor = c.connect(&ctx)?.cursor;

    net.store().fail_writes(true);
    let batch = BTreeMap::from([
        (setting("color")?, SettingValue::text("red")),
        (setting("title")?, SettingValue::text("Hi")),
    ]);
    let err = c
        .publish_all(&ctx, &cursor, batch, &BTreeSet::new())
        .expect_err("write must fail");
    assert_eq!(err.code(), ErrorCode::StorageError);
    assert!(err.code().is_retryable());

    net.store().clear_faults();
    assert_eq!(net.store().record_count()?, 0);
    Ok(())
}

#[test]
fn reset_invalidates_outstanding_cursors() -> Result<(), Box<dyn std::error::Error>> {
    let net = TestNetwork::new()?;
    let ada = net.add_user("Ada");
    let ctx = net.context(&ada);
    let c = net.coordinator();
    let cursor = c.connect(&ctx)?.cursor;
    c.submit_preview(&ctx, &cursor, PreviewRequest::new(setting("color")?, "red".into()))?;

    let generation = c.reset()?;
    assert_ne!(generation, cursor.generation);
    assert_eq!(net.store().record_count()?, 0);

    let err = c
        .submit_preview(&ctx, &cursor, PreviewRequest::new(setting("color")?, "blue".into()))
        .expect_err("stale cursor");
    assert_eq!(err.code(), ErrorCode::StaleCursor);
    Ok(())
}

#[test]
fn unknown_settings_and_empty_batches_are_refused() -> Result<(), Box<dyn std::error::Error>> {
    let net = TestNetwork::new()?;
    let ada = net.add_user("Ada");
    let ctx = net.context(&ada);
    let c = net.coordinator();
    let cursor = c.connect(&ctx)?.cursor;

    let err = c
        .submit_preview(&ctx, &cursor, PreviewRequest::new(setting("nav_menu[7]")?, "x".into()))
        .expect_err("unregistered setting");
    assert_eq!(err.code(), ErrorCode::UnknownSetting);

    let err = c
        .submit_previews(&ctx, &cursor, Vec::new())
        .expect_err("empty preview batch");
    assert_eq!(err.code(), ErrorCode::CustomizedEmpty);

    let err = c
        .publish_all(&ctx, &cursor, BTreeMap::new(), &BTreeSet::new())
        .expect_err("empty publish batch");
    assert_eq!(err.code(), ErrorCode::CustomizedEmpty);
    assert_eq!(net.store().record_count()?, 0);
    Ok(())
}
