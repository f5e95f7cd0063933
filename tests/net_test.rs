//! Wire frame and session registry tests
//!
//! Run with: cargo test --test net_test

use apogee::net::frames::{parse_client, ClientMessage, PhaseName, PublicState, ServerMessage};
use apogee::net::session::{SessionFrame, SessionRegistry};
use apogee::types::{ClientId, Money, Multiplier, Role};
use tokio::sync::mpsc;

fn money(h: i64) -> Money {
    Money::from_hundredths(h)
}

// =============================================================================
// INBOUND FRAMES
// =============================================================================

#[test]
fn test_parse_bet_frame() {
    let msg = parse_client(r#"{"type":"bet","amount":1000,"autoCashout":250}"#).unwrap();
    match msg {
        ClientMessage::Bet {
            amount,
            auto_cashout,
        } => {
            assert_eq!(amount, money(1_000));
            assert_eq!(auto_cashout, Some(Multiplier::from_hundredths(250)));
        }
        other => panic!("wrong variant: {}", other.command()),
    }

    // Auto-cashout is optional.
    let msg = parse_client(r#"{"type":"bet","amount":500}"#).unwrap();
    assert!(matches!(
        msg,
        ClientMessage::Bet {
            auto_cashout: None,
            ..
        }
    ));
}

#[test]
fn test_parse_cashout_and_ping() {
    assert_eq!(
        parse_client(r#"{"type":"cashOut"}"#).unwrap().command(),
        "cashOut"
    );
    assert_eq!(parse_client(r#"{"type":"ping"}"#).unwrap().command(), "ping");
}

#[test]
fn test_reject_malformed_frames() {
    // Unknown type tag.
    assert!(parse_client(r#"{"type":"transfer","amount":1}"#).is_err());
    // Mistyped field: coercion is not schema validation.
    assert!(parse_client(r#"{"type":"bet","amount":"1000"}"#).is_err());
    // Missing required field.
    assert!(parse_client(r#"{"type":"bet"}"#).is_err());
    // Not JSON at all.
    assert!(parse_client("cashOut please").is_err());
    // Oversized frame.
    let huge = format!(r#"{{"type":"bet","amount":1,"x":"{}"}}"#, "a".repeat(5_000));
    assert!(parse_client(&huge).is_err());
}

// =============================================================================
// OUTBOUND FRAMES
// =============================================================================

fn sample_state() -> PublicState {
    PublicState {
        phase: PhaseName::Running,
        round: 12,
        multiplier: Multiplier::from_hundredths(245),
        countdown: None,
        players: 3,
        recent_crashes: vec![Multiplier::from_hundredths(130)],
        server_seed_hash: "ab".repeat(32),
        maintenance: false,
    }
}

#[test]
fn test_game_state_frame_shape() {
    let json = ServerMessage::GameState {
        state: sample_state(),
    }
    .to_json();
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();

    assert_eq!(value["type"], "gameState");
    assert_eq!(value["phase"], "running");
    assert_eq!(value["round"], 12);
    assert_eq!(value["multiplier"], 245);
    assert_eq!(value["players"], 3);
    assert!(value.get("countdown").is_none());
}

#[test]
fn test_error_frame_carries_code_and_retry_hint() {
    let json = ServerMessage::from_error(&apogee::Error::ResourceExhausted {
        retry_after_secs: 7,
    })
    .to_json();
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();

    assert_eq!(value["type"], "error");
    assert_eq!(value["code"], "RESOURCE_EXHAUSTED");
    assert_eq!(value["retryAfterSecs"], 7);
}

#[test]
fn test_internal_error_detail_not_leaked() {
    let json =
        ServerMessage::from_error(&apogee::Error::Internal("sled page fault at 0x3".into()))
            .to_json();
    assert!(!json.contains("sled"));
    assert!(json.contains("INTERNAL"));
}

// =============================================================================
// SESSION REGISTRY
// =============================================================================

fn attach(
    registry: &SessionRegistry,
    client: ClientId,
    balance: Money,
) -> (u64, mpsc::Receiver<SessionFrame>) {
    let (tx, rx) = mpsc::channel(8);
    let outcome = registry.attach(client, Role::Player, !client.is_guest(), balance, tx);
    (outcome.conn_seq, rx)
}

#[test]
fn test_attach_and_detach() {
    let registry = SessionRegistry::new();
    let client = ClientId::User(1);
    let (seq, _rx) = attach(&registry, client, money(100));

    assert_eq!(registry.count(), 1);
    assert_eq!(registry.balance(client), Some(money(100)));

    assert!(registry.detach(client, seq));
    assert_eq!(registry.count(), 0);
}

#[test]
fn test_second_connection_replaces_first() {
    let registry = SessionRegistry::new();
    let client = ClientId::User(1);
    let (old_seq, _rx1) = attach(&registry, client, money(100));

    let (tx2, _rx2) = mpsc::channel(8);
    let outcome = registry.attach(client, Role::Player, true, money(100), tx2);

    // The older socket's handle comes back so it can be closed gracefully.
    assert!(outcome.replaced.is_some());
    assert_eq!(registry.count(), 1);

    // The replaced connection's late detach must not evict the newcomer.
    assert!(!registry.detach(client, old_seq));
    assert_eq!(registry.count(), 1);
    assert!(registry.detach(client, outcome.conn_seq));
}

#[test]
fn test_guest_ids_are_unique() {
    let registry = SessionRegistry::new();
    let a = registry.next_guest();
    let b = registry.next_guest();
    assert_ne!(a, b);
    assert!(a.is_guest());
    assert!(a.user_id().is_none());
}

#[test]
fn test_guest_virtual_balance() {
    let registry = SessionRegistry::new();
    let guest = registry.next_guest();
    attach(&registry, guest, money(1_000));

    assert_eq!(registry.debit_guest(guest, money(300)).unwrap(), money(700));
    assert!(matches!(
        registry.debit_guest(guest, money(701)),
        Err(apogee::Error::InsufficientFunds)
    ));
    assert_eq!(registry.credit_guest(guest, money(450)).unwrap(), money(1_150));
}

#[test]
fn test_snapshot_reflects_sessions() {
    let registry = SessionRegistry::new();
    attach(&registry, ClientId::User(1), money(100));
    attach(&registry, registry.next_guest(), money(200));

    let views = registry.snapshot();
    assert_eq!(views.len(), 2);
    let authenticated = views.iter().filter(|v| v.authenticated).count();
    assert_eq!(authenticated, 1);
}
