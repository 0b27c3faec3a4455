//! Revocation cascade and refresh-reuse remediation tests.

mod common;

use common::*;
use rust_oidc_provider::entity::{authorization, token};
use rust_oidc_provider::error::ProtocolError;
use rust_oidc_provider::oauth2::reuse::hash_refresh_token;
use rust_oidc_provider::oauth2::token_policy::{PolicySnapshot, ReuseAction};
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, IntoActiveModel, QueryFilter};
use time::{Duration, OffsetDateTime};

fn token_model(id: &str, user_id: &str, client_id: &str, refresh: Option<&str>) -> token::Model {
    let now = OffsetDateTime::now_utc();
    token::Model {
        id: id.to_string(),
        kid: "key-1".into(),
        access_token: format!("at-{id}"),
        refresh_token: refresh.map(hash_refresh_token),
        token_type: "Bearer".into(),
        client_id: client_id.to_string(),
        user_id: user_id.to_string(),
        authorization_id: None,
        scope: "openid".into(),
        audience: None,
        status: token::STATUS_VALID.into(),
        access_token_expires_at: now + Duration::minutes(15),
        refresh_token_expires_at: refresh.map(|_| now + Duration::days(7)),
        refresh_absolute_expires_at: refresh.map(|_| now + Duration::days(7)),
        created_at: now,
        redeemed_at: None,
        revoked_at: None,
    }
}

async fn insert_token(db: &DatabaseConnection, model: token::Model) {
    token::Entity::insert(model.into_active_model())
        .exec(db)
        .await
        .expect("insert token");
}

async fn insert_grant(db: &DatabaseConnection, id: &str, user_id: &str, client_id: &str) {
    let now = OffsetDateTime::now_utc();
    let grant = authorization::Model {
        id: id.to_string(),
        user_id: user_id.to_string(),
        client_id: client_id.to_string(),
        kind: authorization::KIND_PERMANENT.into(),
        scope: "openid".into(),
        status: authorization::STATUS_VALID.into(),
        created_at: now,
        updated_at: now,
    };
    authorization::Entity::insert(grant.into_active_model())
        .exec(db)
        .await
        .expect("insert grant");
}

async fn token_status(db: &DatabaseConnection, id: &str) -> String {
    token::Entity::find_by_id(id)
        .one(db)
        .await
        .unwrap()
        .unwrap()
        .status
}

fn rotation_policy(leeway_secs: i64, action: ReuseAction) -> PolicySnapshot {
    PolicySnapshot {
        access_ttl: Duration::minutes(15),
        refresh_ttl: Duration::days(7),
        id_token_ttl: Duration::minutes(15),
        refresh_rotation_enabled: true,
        reuse_detection_enabled: true,
        reuse_action: action,
        reuse_leeway: Duration::seconds(leeway_secs),
        row_version: 1,
    }
}

#[tokio::test]
async fn revoking_a_user_touches_only_that_user() {
    let state = bootstrapped_state(test_config()).await;
    let db = state.db.as_ref();

    insert_token(db, token_model("a1", "alice", "spa-1", Some("rt-a1"))).await;
    insert_token(db, token_model("a2", "alice", "backend-1", None)).await;
    insert_grant(db, "ga", "alice", "spa-1").await;
    insert_token(db, token_model("b1", "bob", "spa-1", Some("rt-b1"))).await;
    insert_grant(db, "gb", "bob", "spa-1").await;

    let outcome = state.revocation.revoke_user("alice").await.unwrap();
    assert_eq!(outcome.tokens, 2);
    assert_eq!(outcome.authorizations, 1);

    assert_eq!(token_status(db, "a1").await, token::STATUS_REVOKED);
    assert_eq!(token_status(db, "a2").await, token::STATUS_REVOKED);
    assert_eq!(token_status(db, "b1").await, token::STATUS_VALID);

    let bob_grant = authorization::Entity::find_by_id("gb")
        .one(db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(bob_grant.status, authorization::STATUS_VALID);
}

#[tokio::test]
async fn revoking_a_pair_leaves_the_users_other_clients_alone() {
    let state = bootstrapped_state(test_config()).await;
    let db = state.db.as_ref();

    insert_token(db, token_model("a1", "alice", "spa-1", None)).await;
    insert_token(db, token_model("a2", "alice", "backend-1", None)).await;

    let outcome = state
        .revocation
        .revoke_user_client("alice", "spa-1")
        .await
        .unwrap();
    assert_eq!(outcome.tokens, 1);

    assert_eq!(token_status(db, "a1").await, token::STATUS_REVOKED);
    assert_eq!(token_status(db, "a2").await, token::STATUS_VALID);
}

#[tokio::test]
async fn revoking_a_client_touches_every_subject_of_that_client() {
    let state = bootstrapped_state(test_config()).await;
    let db = state.db.as_ref();

    insert_token(db, token_model("a1", "alice", "spa-1", None)).await;
    insert_token(db, token_model("b1", "bob", "spa-1", None)).await;
    insert_token(db, token_model("b2", "bob", "backend-1", None)).await;

    let outcome = state.revocation.revoke_client("spa-1").await.unwrap();
    assert_eq!(outcome.tokens, 2);

    assert_eq!(token_status(db, "a1").await, token::STATUS_REVOKED);
    assert_eq!(token_status(db, "b1").await, token::STATUS_REVOKED);
    assert_eq!(token_status(db, "b2").await, token::STATUS_VALID);
}

#[tokio::test]
async fn replay_inside_leeway_is_a_retry_without_cascade() {
    let state = bootstrapped_state(test_config()).await;
    let db = state.db.as_ref();
    let client = client_model("spa-1");
    insert_client(db, client.clone()).await;

    // A token redeemed moments ago, plus a live sibling from the rotation.
    let mut consumed = token_model("t1", "alice", "spa-1", Some("rt-1"));
    consumed.status = token::STATUS_REDEEMED.into();
    consumed.redeemed_at = Some(OffsetDateTime::now_utc() - Duration::seconds(5));
    insert_token(db, consumed).await;
    insert_token(db, token_model("t2", "alice", "spa-1", Some("rt-2"))).await;

    let err = state
        .refresh
        .redeem(
            &rotation_policy(30, ReuseAction::ClientSubject),
            &client,
            "rt-1",
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ProtocolError::InvalidGrant(_)));

    // No cascade: the sibling pair survives.
    assert_eq!(token_status(db, "t2").await, token::STATUS_VALID);
}

#[tokio::test]
async fn replay_outside_leeway_cascades_over_the_pair() {
    let state = bootstrapped_state(test_config()).await;
    let db = state.db.as_ref();
    let client = client_model("spa-1");
    insert_client(db, client.clone()).await;

    let mut consumed = token_model("t1", "alice", "spa-1", Some("rt-1"));
    consumed.status = token::STATUS_REDEEMED.into();
    consumed.redeemed_at = Some(OffsetDateTime::now_utc() - Duration::minutes(5));
    insert_token(db, consumed).await;
    insert_token(db, token_model("t2", "alice", "spa-1", Some("rt-2"))).await;
    // The same subject's tokens at another client are out of blast radius.
    insert_token(db, token_model("t3", "alice", "backend-1", None)).await;

    let err = state
        .refresh
        .redeem(
            &rotation_policy(30, ReuseAction::ClientSubject),
            &client,
            "rt-1",
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ProtocolError::InvalidGrant(_)));

    assert_eq!(token_status(db, "t2").await, token::STATUS_REVOKED);
    assert_eq!(token_status(db, "t3").await, token::STATUS_VALID);
}

#[tokio::test]
async fn subject_blast_radius_covers_all_clients() {
    let state = bootstrapped_state(test_config()).await;
    let db = state.db.as_ref();
    let client = client_model("spa-1");
    insert_client(db, client.clone()).await;

    let mut consumed = token_model("t1", "alice", "spa-1", Some("rt-1"));
    consumed.status = token::STATUS_REDEEMED.into();
    consumed.redeemed_at = Some(OffsetDateTime::now_utc() - Duration::minutes(5));
    insert_token(db, consumed).await;
    insert_token(db, token_model("t2", "alice", "backend-1", None)).await;

    let _ = state
        .refresh
        .redeem(&rotation_policy(30, ReuseAction::Subject), &client, "rt-1")
        .await
        .unwrap_err();

    assert_eq!(token_status(db, "t2").await, token::STATUS_REVOKED);
}

#[tokio::test]
async fn wrong_client_presentation_is_rejected_without_consuming() {
    let state = bootstrapped_state(test_config()).await;
    let db = state.db.as_ref();
    let other = client_model("other-1");
    insert_client(db, other.clone()).await;

    insert_token(db, token_model("t1", "alice", "spa-1", Some("rt-1"))).await;

    let err = state
        .refresh
        .redeem(
            &rotation_policy(30, ReuseAction::ClientSubject),
            &other,
            "rt-1",
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ProtocolError::InvalidGrant(_)));

    // The token still belongs to its real owner, unconsumed.
    assert_eq!(token_status(db, "t1").await, token::STATUS_VALID);
}
