#![cfg(feature = "pg-tests")]
//! Postgres-backed platform tests.
//!
//! # Purpose
//! Exercise tenant provisioning, credential handling, and the consistency
//! helpers against a real database:
//! - namespace creation, structure migration, and guarded destruction
//! - duplicate registration and idempotent giveaway entry
//! - contiguous ticket numbers and single-winner optimistic updates under
//!   real concurrency
//! - integrity auditing and the legacy-envelope sweep
//!
//! # How to use
//! Run with `cargo test -p fleetcore --features pg-tests --test pg_platform`.
//! Set `FLEETCORE_TEST_DATABASE_URL` (or `DATABASE_URL`) to use an existing
//! database; otherwise a `testcontainers` Postgres is started when docker is
//! available.
//!
//! # Isolation
//! Platform tables live in a schema private to the test process and every
//! test registers its own tenant ids. Tests are serialized with
//! `serial_test` because migration sweeps see every registered tenant; the
//! concurrency inside each test is real.
mod common;

use chrono::{Duration as ChronoDuration, Utc};
use fleetcore::audit::{AuditAction, AuditEvent, AuditQuery};
use fleetcore::consistency::batch::chunked_update;
use fleetcore::consistency::sequence::{SequenceScope, next_in_sequence};
use fleetcore::consistency::unique::InsertOutcome;
use fleetcore::consistency::optimistic::VersionedRow;
use fleetcore::consistency::{ConsistencyError, RetryPolicy, SqlValue, run_in_transaction};
use fleetcore::crypto::envelope::Envelope;
use fleetcore::crypto::{CryptoError, is_legacy_encryption};
use fleetcore::ident::{TableRef, tenant_schema_name};
use fleetcore::platform::settings::SettingsUpdate;
use fleetcore::platform::tenants::{BotStatus, NewTenant};
use fleetcore::platform::{Actor, Platform, PlatformError};
use fleetcore::schema::postgres::PostgresSchemaBackend;
use fleetcore::schema::structure::StructureStep;
use fleetcore::schema::{NamespaceState, SchemaError, SchemaManager};
use serde_json::json;
use serial_test::serial;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;

async fn platform() -> Option<(Platform, PgPool)> {
    let pool = common::pg_pool().await?;
    Some((Platform::new(pool.clone(), common::crypto()), pool))
}

async fn provision(platform: &Platform, actor: &Actor, prefix: &str) -> String {
    let tenant_id = common::unique_id(prefix);
    platform
        .provision_tenant(
            actor,
            NewTenant {
                tenant_id: tenant_id.clone(),
                display_name: format!("{prefix} bots"),
                bot_token: format!("token-for-{tenant_id}"),
            },
        )
        .await
        .expect("provision tenant");
    tenant_id
}

async fn actions_for(platform: &Platform, tenant_id: &str) -> Vec<String> {
    platform
        .audit()
        .query_by_tenant(tenant_id, &AuditQuery::default())
        .await
        .expect("audit query")
        .into_iter()
        .map(|record| record.action)
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn provisioning_creates_a_ready_namespace() {
    let Some((platform, pool)) = platform().await else {
        return;
    };
    let actor = Actor::new("owner-1").with_ip("203.0.113.7");
    let tenant_id = common::unique_id("acme");
    let (tenant, namespace) = platform
        .provision_tenant(
            &actor,
            NewTenant {
                tenant_id: tenant_id.clone(),
                display_name: "  Acme Bots ".into(),
                bot_token: "super-secret-token".into(),
            },
        )
        .await
        .expect("provision");

    assert_eq!(tenant.tenant_id, tenant_id);
    assert_eq!(tenant.schema_name, tenant_schema_name(&tenant_id).unwrap());
    assert_eq!(tenant.display_name, "Acme Bots");
    assert_eq!(tenant.owner_id, "owner-1");
    assert_eq!(tenant.bot_status, BotStatus::Stopped);
    assert_eq!(tenant.version, 1);
    assert_eq!(namespace.state, NamespaceState::Ready);
    assert_eq!(namespace.structure_version, platform.schemas().latest_structure_version());
    assert_eq!(
        platform.schemas().namespace_state(&tenant_id).await.unwrap(),
        NamespaceState::Ready
    );
    assert!(
        platform
            .schemas()
            .list_namespaces()
            .await
            .unwrap()
            .contains(&namespace.schema)
    );

    let stored: String = sqlx::query_scalar("SELECT encrypted_token FROM tenants WHERE tenant_id = $1")
        .bind(&tenant_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert!(stored.starts_with("2:"));
    assert!(!stored.contains("super-secret-token"));
    assert_eq!(
        platform.reveal_bot_token(&actor, &tenant_id).await.unwrap(),
        "super-secret-token"
    );

    let settings = platform.get_settings(&tenant_id).await.unwrap();
    assert_eq!(settings.command_prefix, "!");
    assert_eq!(settings.version, 1);

    let records = platform
        .audit()
        .query_by_tenant(&tenant_id, &AuditQuery::default().with_action(AuditAction::TenantCreated))
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].user_id, "owner-1");
    assert_eq!(records[0].ip_address.as_deref(), Some("203.0.113.7"));
    assert_eq!(records[0].metadata["schema"], json!(namespace.schema));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn colliding_registrations_are_rejected() {
    let Some((platform, _pool)) = platform().await else {
        return;
    };
    let actor = Actor::new("owner-dup");
    let tenant_id = provision(&platform, &actor, "dup").await;

    // Sanitizes to the same namespace.
    let collider = tenant_id.replace('-', "");
    let err = platform
        .provision_tenant(
            &actor,
            NewTenant {
                tenant_id: collider,
                display_name: "Collider".into(),
                bot_token: "other-token".into(),
            },
        )
        .await
        .unwrap_err();
    assert!(
        matches!(err, PlatformError::Consistency(ConsistencyError::AlreadyExists { .. })),
        "unexpected error: {err:?}"
    );
    assert!(!err.is_retryable());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn concurrent_registrations_have_one_winner() {
    let Some((platform, _pool)) = platform().await else {
        return;
    };
    let tenant_id = common::unique_id("race");
    let mut tasks = Vec::new();
    for i in 0..4 {
        let platform = platform.clone();
        let tenant_id = tenant_id.clone();
        tasks.push(tokio::spawn(async move {
            platform
                .provision_tenant(
                    &Actor::new(format!("racer-{i}")),
                    NewTenant {
                        tenant_id,
                        display_name: "Racer".into(),
                        bot_token: format!("token-{i}"),
                    },
                )
                .await
        }));
    }
    let mut created = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => created += 1,
            Err(PlatformError::Consistency(ConsistencyError::AlreadyExists { .. })) => {}
            Err(err) => panic!("unexpected error: {err:?}"),
        }
    }
    assert_eq!(created, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn concurrent_tickets_are_distinct_and_contiguous() {
    let Some((platform, _pool)) = platform().await else {
        return;
    };
    let actor = Actor::new("owner-tickets");
    let tenant_id = provision(&platform, &actor, "tix").await;

    let mut tasks = Vec::new();
    for i in 0..20 {
        let platform = platform.clone();
        let tenant_id = tenant_id.clone();
        tasks.push(tokio::spawn(async move {
            platform
                .issue_ticket(&Actor::new(format!("user-{i}")), &tenant_id, &format!("help {i}"))
                .await
        }));
    }
    let mut numbers = Vec::new();
    for task in tasks {
        numbers.push(task.await.unwrap().expect("ticket").ticket_number);
    }
    numbers.sort_unstable();
    assert_eq!(numbers, (1..=20).collect::<Vec<i64>>());

    let listed = platform.list_tickets(&tenant_id).await.unwrap();
    assert_eq!(listed.len(), 20);
    assert!(listed.windows(2).all(|pair| pair[0].ticket_number < pair[1].ticket_number));

    let err = platform.issue_ticket(&actor, &tenant_id, "   ").await.unwrap_err();
    assert!(matches!(err, PlatformError::InvalidInput(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn partitioned_sequences_count_independently() {
    let Some((platform, pool)) = platform().await else {
        return;
    };
    let actor = Actor::new("owner-seq");
    let tenant_id = provision(&platform, &actor, "seq").await;
    let giveaway = platform
        .create_giveaway(&actor, &tenant_id, "Sticker pack", None)
        .await
        .unwrap();
    let entries = TableRef::in_tenant(&tenant_id, "giveaway_entries").unwrap();

    let scope = SequenceScope::new(entries.clone(), "id").partitioned_by("giveaway_id", giveaway.id);
    let other = SequenceScope::new(entries, "id").partitioned_by("giveaway_id", giveaway.id + 1000);
    let mut conn = pool.acquire().await.unwrap();
    assert_eq!(next_in_sequence(&mut conn, &scope).await.unwrap(), 1);
    assert_eq!(next_in_sequence(&mut conn, &other).await.unwrap(), 1);
    drop(conn);

    platform
        .enter_giveaway(&actor, &tenant_id, giveaway.id, "fan-1")
        .await
        .unwrap();
    let mut conn = pool.acquire().await.unwrap();
    assert!(next_in_sequence(&mut conn, &scope).await.unwrap() > 1);
    assert_eq!(next_in_sequence(&mut conn, &other).await.unwrap(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn concurrent_rotations_have_exactly_one_winner() {
    let Some((platform, _pool)) = platform().await else {
        return;
    };
    let actor = Actor::new("owner-rotate");
    let tenant_id = provision(&platform, &actor, "rot").await;
    let version = platform.get_tenant(&tenant_id).await.unwrap().version;

    let mut tasks = Vec::new();
    for i in 0..2 {
        let platform = platform.clone();
        let tenant_id = tenant_id.clone();
        tasks.push(tokio::spawn(async move {
            let token = format!("rotated-{i}");
            let result = platform
                .rotate_bot_token(&Actor::new("owner-rotate"), &tenant_id, &token, version)
                .await;
            (token, result)
        }));
    }
    let mut winners = Vec::new();
    for task in tasks {
        match task.await.unwrap() {
            (token, Ok(new_version)) => {
                assert_eq!(new_version, version + 1);
                winners.push(token);
            }
            (_, Err(PlatformError::Consistency(ConsistencyError::OptimisticLock { expected, actual, .. }))) => {
                assert_eq!(expected, version);
                assert_eq!(actual, version + 1);
            }
            (_, Err(err)) => panic!("unexpected error: {err:?}"),
        }
    }
    assert_eq!(winners.len(), 1);
    assert_eq!(platform.reveal_bot_token(&actor, &tenant_id).await.unwrap(), winners[0]);
    assert!(actions_for(&platform, &tenant_id).await.contains(&"token_rotated".to_string()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn settings_conflicts_surface_or_retry() {
    let Some((platform, _pool)) = platform().await else {
        return;
    };
    let platform = platform.with_retry(RetryPolicy::new(10, Duration::from_millis(5)));
    let actor = Actor::new("owner-settings");
    let tenant_id = provision(&platform, &actor, "cfg").await;

    let updated = platform
        .update_settings(
            &actor,
            &tenant_id,
            SettingsUpdate {
                command_prefix: Some("?".into()),
                data: Some(json!({"n": 0})),
                ..Default::default()
            },
            1,
        )
        .await
        .unwrap();
    assert_eq!(updated.command_prefix, "?");
    assert_eq!(updated.version, 2);

    let stale = platform
        .update_settings(
            &actor,
            &tenant_id,
            SettingsUpdate {
                locale: Some("de".into()),
                ..Default::default()
            },
            1,
        )
        .await
        .unwrap_err();
    assert!(matches!(
        stale,
        PlatformError::Consistency(ConsistencyError::OptimisticLock {
            expected: 1,
            actual: 2,
            ..
        })
    ));
    assert!(stale.public_message().contains("changed"));

    let mut tasks = Vec::new();
    for i in 0..5 {
        let platform = platform.clone();
        let tenant_id = tenant_id.clone();
        tasks.push(tokio::spawn(async move {
            platform
                .update_settings_with_retry(&Actor::new(format!("bumper-{i}")), &tenant_id, |current| {
                    let n = current.data.0["n"].as_i64().unwrap_or(0);
                    SettingsUpdate {
                        data: Some(json!({ "n": n + 1 })),
                        ..Default::default()
                    }
                })
                .await
        }));
    }
    for task in tasks {
        task.await.unwrap().expect("retried update");
    }
    let settings = platform.get_settings(&tenant_id).await.unwrap();
    assert_eq!(settings.data.0["n"], json!(5));
    assert_eq!(settings.version, 7);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn giveaway_entries_are_idempotent() {
    let Some((platform, _pool)) = platform().await else {
        return;
    };
    let actor = Actor::new("owner-give");
    let tenant_id = provision(&platform, &actor, "give").await;
    let giveaway = platform
        .create_giveaway(&actor, &tenant_id, "Nitro", Some(Utc::now() + ChronoDuration::hours(1)))
        .await
        .unwrap();

    let first = platform
        .enter_giveaway(&actor, &tenant_id, giveaway.id, "fan-1")
        .await
        .unwrap();
    assert_eq!(first.outcome, InsertOutcome::Created);
    assert_eq!(first.entry_count, 1);
    let again = platform
        .enter_giveaway(&actor, &tenant_id, giveaway.id, "fan-1")
        .await
        .unwrap();
    assert_eq!(again.outcome, InsertOutcome::Existing);
    assert_eq!(again.entry_count, 1);

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let platform = platform.clone();
        let tenant_id = tenant_id.clone();
        tasks.push(tokio::spawn(async move {
            platform
                .enter_giveaway(&Actor::new("fan-2"), &tenant_id, giveaway.id, "fan-2")
                .await
        }));
    }
    let mut created = 0;
    for task in tasks {
        if task.await.unwrap().expect("entry").outcome == InsertOutcome::Created {
            created += 1;
        }
    }
    assert_eq!(created, 1);
    assert_eq!(
        platform.get_giveaway(&tenant_id, giveaway.id).await.unwrap().entry_count,
        2
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn closed_or_missing_giveaways_refuse_entries() {
    let Some((platform, _pool)) = platform().await else {
        return;
    };
    let actor = Actor::new("owner-closed");
    let tenant_id = provision(&platform, &actor, "closed").await;
    let ended = platform
        .create_giveaway(&actor, &tenant_id, "Old prize", Some(Utc::now() - ChronoDuration::minutes(5)))
        .await
        .unwrap();

    let err = platform
        .enter_giveaway(&actor, &tenant_id, ended.id, "fan-1")
        .await
        .unwrap_err();
    assert!(matches!(err, PlatformError::GiveawayClosed(id) if id == ended.id));

    let err = platform
        .enter_giveaway(&actor, &tenant_id, ended.id + 10_000, "fan-1")
        .await
        .unwrap_err();
    assert!(matches!(err, PlatformError::NotFound { .. }));
    assert_eq!(platform.get_giveaway(&tenant_id, ended.id).await.unwrap().entry_count, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn destroying_requires_the_exact_phrase() {
    let Some((platform, _pool)) = platform().await else {
        return;
    };
    let actor = Actor::new("owner-destroy");
    let tenant_id = provision(&platform, &actor, "gone").await;

    for wrong in ["", "yes", "delete_tenant_", &format!("DELETE_TENANT_{tenant_id} ")] {
        let err = platform.destroy_tenant(&actor, &tenant_id, wrong).await.unwrap_err();
        assert!(matches!(err, PlatformError::Schema(SchemaError::ConfirmationRequired { .. })));
        assert!(err.public_message().contains(&format!("DELETE_TENANT_{tenant_id}")));
    }
    assert!(platform.schemas().namespace_exists(&tenant_id).await.unwrap());

    let phrase = SchemaManager::confirmation_phrase(&tenant_id);
    platform.destroy_tenant(&actor, &tenant_id, &phrase).await.unwrap();
    assert_eq!(
        platform.schemas().namespace_state(&tenant_id).await.unwrap(),
        NamespaceState::Absent
    );
    assert!(matches!(
        platform.get_tenant(&tenant_id).await,
        Err(PlatformError::NotFound { .. })
    ));
    assert_eq!(actions_for(&platform, &tenant_id).await[0], "tenant_deleted");

    // Already gone: still succeeds.
    platform.destroy_tenant(&actor, &tenant_id, &phrase).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn tampered_tokens_are_audited_as_integrity_violations() {
    let Some((platform, pool)) = platform().await else {
        return;
    };
    let actor = Actor::new("owner-tamper");
    let tenant_id = provision(&platform, &actor, "tamper").await;

    let stored: String = sqlx::query_scalar("SELECT encrypted_token FROM tenants WHERE tenant_id = $1")
        .bind(&tenant_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    let mut envelope = Envelope::parse(&stored).unwrap();
    envelope.ciphertext[0] ^= 0x01;
    sqlx::query("UPDATE tenants SET encrypted_token = $1 WHERE tenant_id = $2")
        .bind(envelope.encode())
        .bind(&tenant_id)
        .execute(&pool)
        .await
        .unwrap();

    let err = platform.reveal_bot_token(&actor, &tenant_id).await.unwrap_err();
    assert!(matches!(err, PlatformError::Crypto(CryptoError::AuthenticationFailed)));
    assert!(!err.public_message().contains("token-for"));
    assert_eq!(actions_for(&platform, &tenant_id).await[0], "integrity_violation");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn legacy_tokens_are_swept_to_the_current_version() {
    let Some((platform, pool)) = platform().await else {
        return;
    };
    let actor = Actor::new("owner-sweep");
    let crypto = common::crypto();
    let mut legacy_ids = Vec::new();
    for _ in 0..3 {
        let tenant_id = provision(&platform, &actor, "sweep").await;
        let legacy = Envelope::parse(&crypto.encrypt(&format!("legacy-{tenant_id}")).unwrap())
            .unwrap()
            .encode_legacy();
        sqlx::query("UPDATE tenants SET encrypted_token = $1 WHERE tenant_id = $2")
            .bind(&legacy)
            .bind(&tenant_id)
            .execute(&pool)
            .await
            .unwrap();
        legacy_ids.push(tenant_id);
    }

    let report = platform.reencrypt_legacy_tokens(&actor, 2).await.unwrap();
    assert_eq!(report.rotated, legacy_ids.len());
    assert_eq!(report.skipped, 0);
    assert_eq!(report.failed, 0);
    assert_eq!(report.chunks, 2);

    for tenant_id in &legacy_ids {
        let stored: String = sqlx::query_scalar("SELECT encrypted_token FROM tenants WHERE tenant_id = $1")
            .bind(tenant_id)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert!(!is_legacy_encryption(&stored));
        assert!(stored.starts_with("2:"));
        assert_eq!(
            platform.reveal_bot_token(&actor, tenant_id).await.unwrap(),
            format!("legacy-{tenant_id}")
        );
        assert!(
            actions_for(&platform, tenant_id)
                .await
                .contains(&"credentials_reencrypted".to_string())
        );
    }
}

async fn make_legacy(platform: &Platform, pool: &PgPool, actor: &Actor, prefix: &str) -> String {
    let tenant_id = provision(platform, actor, prefix).await;
    let legacy = Envelope::parse(&common::crypto().encrypt(&format!("legacy-{tenant_id}")).unwrap())
        .unwrap()
        .encode_legacy();
    sqlx::query("UPDATE tenants SET encrypted_token = $1 WHERE tenant_id = $2")
        .bind(&legacy)
        .bind(&tenant_id)
        .execute(pool)
        .await
        .unwrap();
    tenant_id
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn tokens_rotated_after_the_scan_are_left_alone() {
    let Some((platform, pool)) = platform().await else {
        return;
    };
    let actor = Actor::new("owner-sweep-race");
    let kept = make_legacy(&platform, &pool, &actor, "swept").await;
    let rotated = make_legacy(&platform, &pool, &actor, "rotated").await;

    let sweep = platform.scan_legacy_tokens(&actor).await.unwrap();
    let planned: Vec<&str> = sweep.tenant_ids().collect();
    assert!(planned.contains(&kept.as_str()));
    assert!(planned.contains(&rotated.as_str()));
    let planned = planned.len();

    // A rotation lands between the scan and the write.
    let version = platform.get_tenant(&rotated).await.unwrap().version;
    platform
        .rotate_bot_token(&actor, &rotated, "rotated-by-owner", version)
        .await
        .unwrap();

    let report = platform.apply_legacy_sweep(&actor, sweep, 1).await.unwrap();
    assert_eq!(report.rotated, planned - 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(platform.reveal_bot_token(&actor, &rotated).await.unwrap(), "rotated-by-owner");
    assert_eq!(platform.reveal_bot_token(&actor, &kept).await.unwrap(), format!("legacy-{kept}"));

    let reencrypted = "credentials_reencrypted".to_string();
    assert!(!actions_for(&platform, &rotated).await.contains(&reencrypted));
    assert!(actions_for(&platform, &kept).await.contains(&reencrypted));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn bot_status_transitions_are_audited() {
    let Some((platform, _pool)) = platform().await else {
        return;
    };
    let actor = Actor::new("owner-bot");
    let tenant_id = provision(&platform, &actor, "bot").await;

    let previous = platform
        .set_bot_status(&actor, &tenant_id, BotStatus::Running)
        .await
        .unwrap();
    assert_eq!(previous, BotStatus::Stopped);
    let previous = platform
        .set_bot_status(&actor, &tenant_id, BotStatus::Running)
        .await
        .unwrap();
    assert_eq!(previous, BotStatus::Running);
    assert_eq!(
        platform.get_tenant(&tenant_id).await.unwrap().bot_status,
        BotStatus::Running
    );

    let actions = actions_for(&platform, &tenant_id).await;
    assert_eq!(actions[0], "bot_restarted");
    assert_eq!(actions[1], "bot_started");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn tenant_creation_is_rate_limited_per_actor() {
    let Some((platform, _pool)) = platform().await else {
        return;
    };
    let actor = Actor::new(common::unique_id("busy-owner"));
    for _ in 0..5 {
        provision(&platform, &actor, "limit").await;
    }
    let blocked_id = common::unique_id("limit");
    let err = platform
        .provision_tenant(
            &actor,
            NewTenant {
                tenant_id: blocked_id.clone(),
                display_name: "One too many".into(),
                bot_token: "token".into(),
            },
        )
        .await
        .unwrap_err();
    match err {
        PlatformError::RateLimited { action, retry_after_secs } => {
            assert_eq!(action, "create-tenant");
            assert!(retry_after_secs > 0);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!platform.schemas().namespace_exists(&blocked_id).await.unwrap());
    assert_eq!(actions_for(&platform, &blocked_id).await, vec!["rate_limit_exceeded"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn audit_queries_are_newest_first_and_paginated() {
    let Some((platform, _pool)) = platform().await else {
        return;
    };
    let tenant_id = common::unique_id("audit");
    let user_id = common::unique_id("auditor");
    for action in [AuditAction::AdminAccess, AuditAction::SettingsUpdated, AuditAction::AdminOverride] {
        platform
            .audit()
            .try_append(AuditEvent::new(action, &tenant_id, &user_id))
            .await
            .unwrap();
    }
    platform
        .audit()
        .try_append(AuditEvent::custom("custom_check", &tenant_id, &user_id).with_metadata(json!({"k": 1})))
        .await
        .unwrap();

    let all = platform
        .audit()
        .query_by_tenant(&tenant_id, &AuditQuery::default())
        .await
        .unwrap();
    let actions: Vec<&str> = all.iter().map(|record| record.action.as_str()).collect();
    assert_eq!(actions, vec!["custom_check", "admin_override", "settings_updated", "admin_access"]);
    assert_eq!(all[0].known_action(), None);
    assert_eq!(all[0].metadata, json!({"k": 1}));

    let page = platform
        .audit()
        .query_by_user(
            &user_id,
            &AuditQuery {
                limit: 2,
                offset: 1,
                action: None,
            },
        )
        .await
        .unwrap();
    let ids: Vec<i64> = page.iter().map(|record| record.id).collect();
    assert_eq!(ids, vec![all[1].id, all[2].id]);

    let filtered = platform
        .audit()
        .query_by_tenant(&tenant_id, &AuditQuery::default().with_action(AuditAction::AdminAccess))
        .await
        .unwrap();
    assert_eq!(filtered.len(), 1);
}

static BROKEN_STRUCTURE: &[StructureStep] = &[
    StructureStep {
        version: 1,
        name: "core",
        sql: "CREATE TABLE IF NOT EXISTS __SCHEMA__.widgets (id BIGSERIAL PRIMARY KEY)",
    },
    StructureStep {
        version: 2,
        name: "broken",
        sql: "CREATE TABLE __SCHEMA__.gadgets (id BIGSERIAL PRIMARY KEY, widget_id BIGINT REFERENCES __SCHEMA__.missing (id))",
    },
];

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn failed_structure_steps_leave_the_namespace_creating() {
    let Some(pool) = common::pg_pool().await else {
        return;
    };
    let backend = Arc::new(PostgresSchemaBackend::new(pool.clone()));
    let manager = SchemaManager::with_structure(backend.clone(), BROKEN_STRUCTURE);
    let tenant_id = common::unique_id("broken");

    let err = manager.create_namespace(&tenant_id).await.unwrap_err();
    assert!(matches!(err, SchemaError::StructureFailed { version: 2, .. }));
    assert_eq!(manager.namespace_state(&tenant_id).await.unwrap(), NamespaceState::Creating);

    // The first step stuck and is not re-applied.
    let healthy = SchemaManager::with_structure(backend, &BROKEN_STRUCTURE[..1]);
    let namespace = healthy.migrate(&tenant_id).await.unwrap();
    assert_eq!(namespace.structure_version, 1);
    assert_eq!(namespace.state, NamespaceState::Ready);

    manager
        .destroy_namespace(&tenant_id, &SchemaManager::confirmation_phrase(&tenant_id))
        .await
        .unwrap();
    assert!(!manager.namespace_exists(&tenant_id).await.unwrap());
    assert!(matches!(
        manager.migrate(&tenant_id).await,
        Err(SchemaError::NotFound(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn migrate_is_idempotent_for_registered_tenants() {
    let Some((platform, _pool)) = platform().await else {
        return;
    };
    let actor = Actor::new("owner-migrate");
    let tenant_id = provision(&platform, &actor, "mig").await;
    let latest = platform.schemas().latest_structure_version();

    let migrated = platform.migrate_tenant_namespaces().await.unwrap();
    let ours = migrated
        .iter()
        .find(|namespace| namespace.tenant_id == tenant_id)
        .expect("tenant migrated");
    assert_eq!(ours.structure_version, latest);
    assert_eq!(platform.schemas().migrate(&tenant_id).await.unwrap().structure_version, latest);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn chunked_updates_stop_at_the_failing_chunk() {
    let Some((platform, pool)) = platform().await else {
        return;
    };
    let actor = Actor::new("owner-batch");
    let tenant_id = provision(&platform, &actor, "batch").await;
    let table = TableRef::in_tenant(&tenant_id, "tickets").unwrap().qualified().unwrap();

    // Item 3 collides with item 1 on the unique ticket number.
    let items: Vec<i64> = vec![1, 2, 3, 4, 5];
    let insert_sql = format!("INSERT INTO {table} (ticket_number, opened_by, subject) VALUES ($1, 'batch', 'batch')");
    let failure = chunked_update(&pool, &RetryPolicy::default(), items, 2, move |conn, n| {
        let sql = insert_sql.clone();
        Box::pin(async move {
            let number = if n == 3 { 1 } else { n };
            sqlx::query(&sql).bind(number).execute(&mut *conn).await?;
            Ok::<_, ConsistencyError>(Some(number))
        })
    })
    .await
    .unwrap_err();
    assert_eq!(failure.completed.chunks, 1);
    assert_eq!(failure.completed.rows, 2);
    assert_eq!(failure.completed.applied, vec![1, 2]);

    let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 2);

    // A plain transaction sees the committed chunk.
    let max: Option<i64> = run_in_transaction(&pool, &RetryPolicy::default(), |_| {}, |conn| {
        let sql = format!("SELECT MAX(ticket_number) FROM {table}");
        Box::pin(async move {
            let max: Option<i64> = sqlx::query_scalar(&sql).fetch_one(&mut *conn).await?;
            Ok::<_, ConsistencyError>(max)
        })
    })
    .await
    .unwrap();
    assert_eq!(max, Some(2));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn versioned_updates_can_null_typed_columns() {
    let Some((platform, pool)) = platform().await else {
        return;
    };
    let actor = Actor::new("owner-null");
    let tenant_id = provision(&platform, &actor, "nulls").await;
    let table = TableRef::in_tenant(&tenant_id, "reminders").unwrap();
    let qualified = table.qualified().unwrap();
    sqlx::raw_sql(&format!(
        "CREATE TABLE {qualified} (id TEXT PRIMARY KEY, due_at TIMESTAMPTZ, attempts BIGINT, version BIGINT NOT NULL DEFAULT 1);
         INSERT INTO {qualified} (id, due_at, attempts) VALUES ('r1', now(), 3)"
    ))
    .execute(&pool)
    .await
    .unwrap();

    let row = VersionedRow::new("reminder", table, "id", "r1");
    let version = run_in_transaction(&pool, &RetryPolicy::default(), |_| {}, |conn| {
        let row = row.clone();
        Box::pin(async move {
            let set = vec![
                ("due_at".to_string(), SqlValue::Null),
                ("attempts".to_string(), SqlValue::Null),
            ];
            row.update(conn, 1, &set).await
        })
    })
    .await
    .unwrap();
    assert_eq!(version, 2);

    let (due_at, attempts): (Option<chrono::DateTime<Utc>>, Option<i64>) =
        sqlx::query_as(&format!("SELECT due_at, attempts FROM {qualified} WHERE id = 'r1'"))
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(due_at, None);
    assert_eq!(attempts, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn first_time_migrations_of_one_namespace_do_not_collide() {
    let Some(pool) = common::pg_pool().await else {
        return;
    };
    let manager = SchemaManager::new(Arc::new(PostgresSchemaBackend::new(pool)));
    let tenant_id = common::unique_id("stampede");

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let manager = manager.clone();
        let tenant_id = tenant_id.clone();
        tasks.push(tokio::spawn(async move { manager.create_namespace(&tenant_id).await }));
    }
    let latest = manager.latest_structure_version();
    for task in tasks {
        let namespace = task.await.unwrap().expect("concurrent create");
        assert_eq!(namespace.structure_version, latest);
    }
    assert_eq!(manager.namespace_state(&tenant_id).await.unwrap(), NamespaceState::Ready);

    manager
        .destroy_namespace(&tenant_id, &SchemaManager::confirmation_phrase(&tenant_id))
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn audit_timestamps_come_from_the_database_clock() {
    let Some((platform, pool)) = platform().await else {
        return;
    };
    let tenant_id = common::unique_id("clock");
    let before: chrono::DateTime<Utc> = sqlx::query_scalar("SELECT clock_timestamp()")
        .fetch_one(&pool)
        .await
        .unwrap();
    let record = platform
        .audit()
        .try_append(AuditEvent::new(AuditAction::TenantCreated, &tenant_id, "owner-clock"))
        .await
        .unwrap();
    let after: chrono::DateTime<Utc> = sqlx::query_scalar("SELECT clock_timestamp()")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert!(before <= record.timestamp && record.timestamp <= after);
}
