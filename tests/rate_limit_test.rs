//! Rate limiting tests
//!
//! Run with: cargo test --test rate_limit_test

use apogee::config::RateConfig;
use apogee::net::rate_limit::{
    InboundDecision, RateKey, RequestBudget, RouteClass, RouteLimiter, SessionInboundLimiter,
};
use apogee::Error;
use std::net::IpAddr;
use std::thread::sleep;
use std::time::Duration;

// =============================================================================
// REQUEST BUDGET
// =============================================================================

#[test]
fn test_budget_burst_then_deny() {
    let mut budget = RequestBudget::per_second(10);

    // The full burst is available up front.
    for _ in 0..10 {
        assert!(budget.admit());
    }
    assert!(!budget.admit());
    assert_eq!(budget.remaining(), 0);
}

#[test]
fn test_budget_replenishes_with_time() {
    let mut budget = RequestBudget::per_second(10);
    for _ in 0..10 {
        budget.admit();
    }
    assert!(!budget.admit());

    // 150ms at 10/sec buys about a permit and a half.
    sleep(Duration::from_millis(150));
    assert!(budget.admit());
    assert!(!budget.admit());
}

#[test]
fn test_budget_retry_hint() {
    let mut budget = RequestBudget::per_second(1);
    assert_eq!(budget.retry_after_secs(), 0);

    assert!(budget.admit());
    // One permit at 1/sec is about a second away.
    assert_eq!(budget.retry_after_secs(), 1);
}

#[test]
fn test_budget_caps_at_burst() {
    let mut budget = RequestBudget::per_minute(10);
    // A long quiet spell never grows the budget past its burst size.
    sleep(Duration::from_millis(50));
    assert_eq!(budget.remaining(), 10);
}

// =============================================================================
// SESSION INBOUND LIMITER
// =============================================================================

#[test]
fn test_inbound_limiter_admits_burst_then_drops() {
    let mut limiter = SessionInboundLimiter::new(10);

    for _ in 0..10 {
        assert!(matches!(limiter.check(), InboundDecision::Admit));
    }

    // First drop carries the notice, later drops stay quiet.
    assert!(matches!(
        limiter.check(),
        InboundDecision::Drop { notify: true }
    ));
    assert!(matches!(
        limiter.check(),
        InboundDecision::Drop { notify: false }
    ));
}

#[test]
fn test_inbound_limiter_notifies_again_after_recovery() {
    let mut limiter = SessionInboundLimiter::new(10);
    for _ in 0..10 {
        limiter.check();
    }
    assert!(matches!(
        limiter.check(),
        InboundDecision::Drop { notify: true }
    ));

    // Let a token come back, admit once, then the next dry spell notifies
    // again.
    sleep(Duration::from_millis(150));
    assert!(matches!(limiter.check(), InboundDecision::Admit));
    assert!(matches!(
        limiter.check(),
        InboundDecision::Drop { notify: true }
    ));
}

// =============================================================================
// PER-ROUTE LIMITER
// =============================================================================

#[test]
fn test_route_budget_exhaustion() {
    let limiter = RouteLimiter::new(&RateConfig::default());
    let key = RateKey::User(7);

    // Auth budget is 10/min.
    for _ in 0..10 {
        limiter.check(RouteClass::Auth, key).unwrap();
    }
    match limiter.check(RouteClass::Auth, key) {
        Err(Error::ResourceExhausted { retry_after_secs }) => {
            assert!(retry_after_secs >= 1);
        }
        other => panic!("expected rate limit, got {other:?}"),
    }
}

#[test]
fn test_route_budgets_are_independent_per_key() {
    let limiter = RouteLimiter::new(&RateConfig::default());
    let alice = RateKey::User(1);
    let bob = RateKey::User(2);
    let ip: IpAddr = "203.0.113.9".parse().unwrap();

    for _ in 0..10 {
        limiter.check(RouteClass::Auth, alice).unwrap();
    }
    assert!(limiter.check(RouteClass::Auth, alice).is_err());

    // Other keys are untouched.
    limiter.check(RouteClass::Auth, bob).unwrap();
    limiter.check(RouteClass::Auth, RateKey::Ip(ip)).unwrap();
}

#[test]
fn test_route_budgets_are_independent_per_route() {
    let limiter = RouteLimiter::new(&RateConfig::default());
    let key = RateKey::User(7);

    for _ in 0..12 {
        limiter.check(RouteClass::SettingsWrite, key).unwrap();
    }
    assert!(limiter.check(RouteClass::SettingsWrite, key).is_err());

    // Settings reads run on a much larger, separate budget.
    for _ in 0..60 {
        limiter.check(RouteClass::SettingsRead, key).unwrap();
    }
}
