//! End-to-end signaling flow tests
//!
//! Drives the public client surface over the in-process memory bus:
//! session lifecycle, call/hangup fan-out, token renewal and decoding
//! of the envelopes that arrive on each participant's channel.

use call_signaling::transport::memory::ERR_DELIVERY_FAILED;
use call_signaling::{
    new_call_id, ChannelType, LoggingListener, MemoryBus, MemoryTransport,
    MemoryTransportFactory, RenewOutcome, RenewingListener, SessionConfig, SignalAction,
    SignalEnvelope, SignalError, SignalTransport, SignalingClient, TokenRenewal, UserId,
};
use serde_json::{json, Map, Value};
use std::sync::Arc;

const APP_ID: &str = "app_id_test";
const ROOM_ID: &str = "room_id_test";

fn match_extension() -> Map<String, Value> {
    let mut extension = Map::new();
    extension.insert("videoType".into(), json!("match"));
    extension
}

async fn started(bus: &Arc<MemoryBus>) -> (SignalingClient, Arc<MemoryTransportFactory>) {
    let factory = Arc::new(MemoryTransportFactory::new(Arc::clone(bus)));
    let client = SignalingClient::new(factory.clone());
    client
        .initialize(
            SessionConfig::new(APP_ID, "test_user_id", "token")
                .with_extension(match_extension()),
        )
        .unwrap()
        .await
        .unwrap();
    (client, factory)
}

fn decode_inbox(bus: &MemoryBus, user: UserId) -> Vec<SignalEnvelope> {
    bus.inbox(&user.channel())
        .iter()
        .map(|delivery| SignalEnvelope::from_slice(&delivery.payload).unwrap())
        .collect()
}

// =============================================================================
// Call fan-out
// =============================================================================

#[tokio::test]
async fn test_call_reaches_both_participants() {
    let bus = MemoryBus::new();
    let (client, _) = started(&bus).await;
    let call_id = new_call_id();

    let (a, b) = client
        .call(UserId(4111), UserId(4222), ROOM_ID, &call_id)
        .unwrap()
        .into_parts();
    assert!(a.await.is_ok());
    assert!(b.await.is_ok());

    let deliveries = bus.deliveries();
    assert_eq!(deliveries.len(), 2);
    assert_eq!(deliveries[0].to, "4222", "leg a is issued first");
    assert_eq!(deliveries[1].to, "4111");
    assert!(deliveries
        .iter()
        .all(|d| d.options.channel_type == ChannelType::User));

    let to_b = &decode_inbox(&bus, UserId(4222))[0];
    assert_eq!(to_b.action, SignalAction::Invite);
    assert_eq!(to_b.from_user_id, UserId(4111));
    assert_eq!(to_b.remote_user_id, Some(UserId(4222)));
    assert_eq!(to_b.call_id, call_id);
    assert_eq!(to_b.from_room_id, ROOM_ID);
    assert_eq!(to_b.extension.as_ref(), Some(&match_extension()));

    let to_a = &decode_inbox(&bus, UserId(4111))[0];
    assert_eq!(to_a.from_user_id, UserId(4222));
    assert_eq!(to_a.remote_user_id, Some(UserId(4111)));
    assert_eq!(to_a.call_id, call_id);
}

#[tokio::test]
async fn test_hangup_delivers_the_other_sides_reason() {
    let bus = MemoryBus::new();
    let (client, _) = started(&bus).await;

    let (a, b) = client
        .hangup(UserId(4111), "busy", UserId(4222), "declined", ROOM_ID, "call-1")
        .unwrap()
        .into_parts();
    a.await.unwrap();
    b.await.unwrap();

    let to_b = &decode_inbox(&bus, UserId(4222))[0];
    assert_eq!(to_b.action, SignalAction::Hangup);
    assert_eq!(to_b.from_user_id, UserId(4111));
    assert_eq!(to_b.hangup_reason.as_deref(), Some("declined"));
    assert!(to_b.remote_user_id.is_none());

    let to_a = &decode_inbox(&bus, UserId(4111))[0];
    assert_eq!(to_a.from_user_id, UserId(4222));
    assert_eq!(to_a.hangup_reason.as_deref(), Some("busy"));
}

#[tokio::test]
async fn test_one_failed_leg_leaves_the_other_delivered() {
    let bus = MemoryBus::new();
    bus.fail_deliveries_to("4222");
    let (client, _) = started(&bus).await;

    let (a, b) = client
        .call(UserId(4111), UserId(4222), ROOM_ID, "call-1")
        .unwrap()
        .into_parts();

    assert_eq!(a.await.unwrap_err().code, ERR_DELIVERY_FAILED);
    assert!(b.await.is_ok());
    assert!(bus.inbox("4222").is_empty());
    assert_eq!(decode_inbox(&bus, UserId(4111)).len(), 1);
}

#[tokio::test]
async fn test_call_then_hangup_share_the_call_id() {
    let bus = MemoryBus::new();
    let (client, _) = started(&bus).await;
    let call_id = new_call_id();

    let (a, b) = client
        .call(UserId(1), UserId(2), ROOM_ID, &call_id)
        .unwrap()
        .into_parts();
    a.await.unwrap();
    b.await.unwrap();
    let (a, b) = client
        .hangup(UserId(1), "ended", UserId(2), "ended", ROOM_ID, &call_id)
        .unwrap()
        .into_parts();
    a.await.unwrap();
    b.await.unwrap();

    let inbox = decode_inbox(&bus, UserId(2));
    let actions: Vec<_> = inbox.iter().map(|e| e.action).collect();
    assert_eq!(actions, vec![SignalAction::Invite, SignalAction::Hangup]);
    assert!(inbox.iter().all(|e| e.call_id == call_id));
    assert!(inbox[1].timestamp >= inbox[0].timestamp);
}

// =============================================================================
// Session lifecycle
// =============================================================================

#[tokio::test]
async fn test_publish_before_initialize_fails() {
    let factory = Arc::new(MemoryTransportFactory::new(MemoryBus::new()));
    let client = SignalingClient::new(factory);

    assert!(matches!(
        client.call(UserId(1), UserId(2), ROOM_ID, "c"),
        Err(SignalError::NotInitialized)
    ));
    assert!(matches!(
        client.renew_token("t"),
        Err(SignalError::NotInitialized)
    ));
}

#[tokio::test]
async fn test_owned_transport_lifecycle() {
    let bus = MemoryBus::new();
    let (client, factory) = started(&bus).await;
    let transport = factory.last_created().unwrap();

    client
        .initialize(SessionConfig::new(APP_ID, "test_user_id", "token"))
        .unwrap()
        .await
        .unwrap();
    assert_eq!(factory.created_count(), 1);
    assert_eq!(transport.login_calls(), 1);

    client.deinitialize().await.unwrap();
    client.deinitialize().await.unwrap();
    assert_eq!(transport.logout_calls(), 1);
    assert!(!client.is_initialized());
    assert!(!client.session_state().is_logged_in());
}

#[tokio::test]
async fn test_external_transport_is_left_to_the_caller() {
    let bus = MemoryBus::new();
    let external = Arc::new(MemoryTransport::new(Arc::clone(&bus), APP_ID, "external"));
    external.login("caller-token").await.unwrap();

    let factory = Arc::new(MemoryTransportFactory::new(Arc::clone(&bus)));
    let client = SignalingClient::new(factory.clone());
    client
        .initialize(SessionConfig::new(APP_ID, "external", "ignored").with_transport(external.clone()))
        .unwrap()
        .await
        .unwrap();

    let (a, b) = client
        .call(UserId(1), UserId(2), ROOM_ID, "c")
        .unwrap()
        .into_parts();
    a.await.unwrap();
    b.await.unwrap();

    client.deinitialize().await.unwrap();

    assert_eq!(factory.created_count(), 0);
    assert_eq!(external.login_calls(), 1);
    assert_eq!(external.logout_calls(), 0);
    assert_eq!(external.current_token().as_deref(), Some("caller-token"));
    assert_eq!(bus.deliveries().len(), 2);
}

// =============================================================================
// Token renewal
// =============================================================================

#[tokio::test]
async fn test_expiry_notification_renews_until_accepted() {
    let factory = Arc::new(MemoryTransportFactory::new(MemoryBus::new()));
    let client = Arc::new(SignalingClient::new(factory.clone()));
    let renewal = Arc::new(TokenRenewal::new(&client, || "fresh-token".to_string()));
    let listener = Arc::new(RenewingListener::new(
        Arc::clone(&renewal),
        Arc::new(LoggingListener),
    ));

    client
        .initialize(SessionConfig::new(APP_ID, "test_user_id", "token").with_listener(listener))
        .unwrap()
        .await
        .unwrap();

    let transport = factory.last_created().unwrap();
    transport.fail_next_renewals(5);
    transport.simulate_token_expiry();

    assert_eq!(transport.renew_calls(), 6);
    assert_eq!(transport.current_token().as_deref(), Some("fresh-token"));
    assert!(!renewal.is_running());

    // Publishing still works with the renewed credential
    let (a, b) = client
        .call(UserId(1), UserId(2), ROOM_ID, "c")
        .unwrap()
        .into_parts();
    assert!(a.await.is_ok());
    assert!(b.await.is_ok());
}

#[tokio::test]
async fn test_renewal_after_deinitialize_stops() {
    let bus = MemoryBus::new();
    let (client, _) = started(&bus).await;
    let client = Arc::new(client);
    let renewal = TokenRenewal::new(&client, || "fresh-token".to_string());

    client.deinitialize().await.unwrap();

    assert_eq!(renewal.renew_until_success().await, RenewOutcome::SessionClosed);
    assert_eq!(renewal.total_attempts(), 1);
}
