mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use r2e_oidc_client::{
    AuthStorage, ClientConfiguration, ErrorKind, InMemorySessionStore, ManualClock, OidcClient,
    OidcError,
};
use serde_json::json;

fn refreshing(idp: &MockIdp) -> ClientConfiguration {
    idp.config()
        .with_token_auto_refresh(true)
        .with_token_min_validity(Duration::from_secs(10))
}

fn refreshed_body(access_token: &str) -> serde_json::Value {
    json!({
        "access_token": access_token,
        "token_type": "Bearer",
        "expires_in": 300,
    })
}

#[tokio::test]
async fn auto_refresh_off_never_calls_provider() {
    let idp = MockIdp::start().await;
    let clock = Arc::new(ManualClock::starting_now());
    let client = OidcClient::builder(idp.config().with_token_auto_refresh(false))
        .with_clock(clock.clone())
        .build()
        .unwrap();
    let store = InMemorySessionStore::new();
    login(&client, &idp, &store, "s1", 5).await.unwrap();

    clock.advance(60_000);
    let tokens = client.ensure_valid("s1").await.unwrap();

    assert_eq!(tokens.access_token.raw(), "access-1");
    assert_eq!(idp.refresh_hits(), 0);
}

#[tokio::test]
async fn refreshes_inside_min_validity() {
    let idp = MockIdp::start().await;
    idp.set_refresh_response(200, refreshed_body("access-2"));
    let client = idp.client(refreshing(&idp));
    let store = InMemorySessionStore::new();
    login(&client, &idp, &store, "s1", 5).await.unwrap();

    let tokens = client.ensure_valid("s1").await.unwrap();

    assert_eq!(idp.refresh_hits(), 1);
    assert_eq!(tokens.access_token.raw(), "access-2");
    // The response carried no refresh token; the old one is kept.
    assert_eq!(tokens.refresh_token.as_deref(), Some("refresh-1"));
    assert_eq!(tokens.scope, vec!["openid", "email", "profile"]);

    let (form, authorization) = idp.token_requests().pop().unwrap();
    assert_eq!(form["grant_type"], "refresh_token");
    assert_eq!(form["refresh_token"], "refresh-1");
    assert!(authorization.unwrap().starts_with("Basic "));
}

#[tokio::test]
async fn no_refresh_with_enough_validity() {
    let idp = MockIdp::start().await;
    idp.set_refresh_response(200, refreshed_body("access-2"));
    let client = idp.client(refreshing(&idp));
    let store = InMemorySessionStore::new();
    login(&client, &idp, &store, "s1", 20).await.unwrap();

    let tokens = client.ensure_valid("s1").await.unwrap();

    assert_eq!(idp.refresh_hits(), 0);
    assert_eq!(tokens.access_token.raw(), "access-1");
}

#[tokio::test]
async fn refresh_after_clock_passes_threshold() {
    let idp = MockIdp::start().await;
    idp.set_refresh_response(200, refreshed_body("access-2"));
    let clock = Arc::new(ManualClock::starting_now());
    let client = OidcClient::builder(refreshing(&idp))
        .with_clock(clock.clone())
        .build()
        .unwrap();
    let store = InMemorySessionStore::new();
    login(&client, &idp, &store, "s1", 60).await.unwrap();

    client.ensure_valid("s1").await.unwrap();
    assert_eq!(idp.refresh_hits(), 0);

    clock.advance(55_000);
    let tokens = client.ensure_valid("s1").await.unwrap();
    assert_eq!(idp.refresh_hits(), 1);
    assert_eq!(tokens.access_token.raw(), "access-2");
}

#[tokio::test]
async fn refresh_without_expiry_does_not_repeat() {
    let idp = MockIdp::start().await;
    idp.set_refresh_response(200, json!({ "access_token": "access-2" }));
    let clock = Arc::new(ManualClock::starting_now());
    let client = OidcClient::builder(refreshing(&idp))
        .with_clock(clock.clone())
        .build()
        .unwrap();
    let store = InMemorySessionStore::new();
    login(&client, &idp, &store, "s1", 300).await.unwrap();

    clock.advance(295_000);
    for _ in 0..5 {
        let tokens = client.ensure_valid("s1").await.unwrap();
        assert_eq!(tokens.access_token.raw(), "access-2");
        assert_eq!(tokens.expires_at, None);
    }
    assert_eq!(idp.refresh_hits(), 1);
}

#[tokio::test]
async fn concurrent_calls_refresh_once() {
    let idp = MockIdp::start().await;
    idp.set_refresh_response(200, refreshed_body("access-2"));
    idp.set_refresh_delay(Duration::from_millis(200));
    let client = idp.client(refreshing(&idp));
    let store = InMemorySessionStore::new();
    login(&client, &idp, &store, "s1", 5).await.unwrap();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move { client.ensure_valid("s1").await }));
    }
    for task in tasks {
        let tokens = task.await.unwrap().unwrap();
        assert_eq!(tokens.access_token.raw(), "access-2");
    }
    assert_eq!(idp.refresh_hits(), 1);
}

#[tokio::test]
async fn failed_refresh_leaves_tokens_untouched() {
    let idp = MockIdp::start().await;
    let client = idp.client(refreshing(&idp));
    let store = InMemorySessionStore::new();
    login(&client, &idp, &store, "s1", 5).await.unwrap();

    let err = client.ensure_valid("s1").await.unwrap_err();
    assert!(matches!(err, OidcError::RefreshFailed(_)));

    let session = client.token_store().get("s1").await.unwrap();
    assert_eq!(session.tokens.access_token.raw(), "access-1");
    assert_eq!(session.tokens.refresh_token.as_deref(), Some("refresh-1"));
    assert!(client.identity("s1").await.is_some());
}

#[tokio::test]
async fn refresh_timeout_is_retryable() {
    let idp = MockIdp::start().await;
    idp.set_refresh_response(200, refreshed_body("access-2"));
    idp.set_refresh_delay(Duration::from_millis(800));
    let config = refreshing(&idp)
        .with_http_timeouts(Duration::from_millis(200), Duration::from_millis(200));
    let client = idp.client(config);
    let store = InMemorySessionStore::new();
    login(&client, &idp, &store, "s1", 5).await.unwrap();

    let err = client.ensure_valid("s1").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RefreshFailed);
    assert!(err.is_timeout());
    assert!(err.is_retryable());

    let session = client.token_store().get("s1").await.unwrap();
    assert_eq!(session.tokens.access_token.raw(), "access-1");
}

#[tokio::test]
async fn rejected_refresh_is_not_retryable() {
    let idp = MockIdp::start().await;
    let client = idp.client(refreshing(&idp));
    let store = InMemorySessionStore::new();
    login(&client, &idp, &store, "s1", 5).await.unwrap();

    let err = client.ensure_valid("s1").await.unwrap_err();
    assert!(matches!(err, OidcError::RefreshFailed(ref msg) if msg.contains("invalid_grant")));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn missing_refresh_token_fails_without_call() {
    let idp = MockIdp::start().await;
    let client = idp.client(refreshing(&idp));
    let store = InMemorySessionStore::new();

    let (state, nonce) = begin(&client, &store).await;
    let id_token = primary_key().sign(&idp.id_claims(nonce.as_deref()));
    idp.set_token_response(
        200,
        json!({ "access_token": "access-1", "expires_in": 5, "id_token": id_token }),
    );
    client
        .handle_callback(AuthStorage::single(&store), "s1", &callback(&state, "code-1"))
        .await
        .unwrap();

    let err = client.ensure_valid("s1").await.unwrap_err();
    assert!(matches!(err, OidcError::RefreshFailed(_)));
    assert_eq!(idp.refresh_hits(), 0);
}

#[tokio::test]
async fn refreshed_id_token_replaces_old_one() {
    let idp = MockIdp::start().await;
    let client = idp.client(refreshing(&idp));
    let store = InMemorySessionStore::new();
    login(&client, &idp, &store, "s1", 5).await.unwrap();

    let mut claims = idp.id_claims(None);
    claims["marker"] = "refreshed".into();
    let id_token = primary_key().sign(&claims);
    idp.set_refresh_response(
        200,
        json!({
            "access_token": "access-2",
            "expires_in": 300,
            "refresh_token": "refresh-2",
            "id_token": id_token,
        }),
    );

    let tokens = client.ensure_valid("s1").await.unwrap();
    assert_eq!(tokens.id_token.raw(), id_token);
    assert_eq!(tokens.id_token.claims().get("marker"), Some(&json!("refreshed")));
    assert_eq!(tokens.refresh_token.as_deref(), Some("refresh-2"));
}

#[tokio::test]
async fn refreshed_id_token_for_other_subject_fails() {
    let idp = MockIdp::start().await;
    let client = idp.client(refreshing(&idp));
    let store = InMemorySessionStore::new();
    login(&client, &idp, &store, "s1", 5).await.unwrap();

    let mut claims = idp.id_claims(None);
    claims["sub"] = "user-2".into();
    idp.set_refresh_response(
        200,
        json!({
            "access_token": "access-2",
            "expires_in": 300,
            "id_token": primary_key().sign(&claims),
        }),
    );

    let err = client.ensure_valid("s1").await.unwrap_err();
    assert!(matches!(err, OidcError::RefreshFailed(_)));
    let session = client.token_store().get("s1").await.unwrap();
    assert_eq!(session.tokens.access_token.raw(), "access-1");
}

#[tokio::test]
async fn unknown_session_is_not_authenticated() {
    let idp = MockIdp::start().await;
    let client = idp.client(refreshing(&idp));

    let err = client.ensure_valid("nobody").await.unwrap_err();
    assert_eq!(err, OidcError::NotAuthenticated);
}
