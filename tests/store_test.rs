//! Persistence gateway tests
//!
//! Run with: cargo test --test store_test

use apogee::auth;
use apogee::fair::FairnessOracle;
use apogee::store::{NewUser, SettingsPatch, Store, UserPatch};
use apogee::types::{
    LedgerKind, Money, Multiplier, PlayerSettings, Role, Round, RoundStatus, UserId, WagerStatus,
};
use apogee::Error;
use tempfile::TempDir;

fn money(h: i64) -> Money {
    Money::from_hundredths(h)
}

fn mult(h: u64) -> Multiplier {
    Multiplier::from_hundredths(h)
}

fn open_store() -> (Store, TempDir) {
    let dir = TempDir::new().unwrap();
    (Store::open(dir.path()).unwrap(), dir)
}

fn new_player(store: &Store, handle: &str, balance: i64) -> UserId {
    store
        .create_user(
            NewUser {
                external_id: None,
                handle: handle.to_string(),
                role: Role::Player,
                password_hash: None,
                balance: money(balance),
            },
            PlayerSettings::default(),
            1_000,
        )
        .unwrap()
        .id
}

fn open_round(store: &Store, now: u64) -> Round {
    let mut oracle = FairnessOracle::new(100, "client");
    store.create_round(&oracle.next_round().unwrap(), now).unwrap()
}

/// The universal ledger invariant: balance equals the sum of signed deltas.
fn assert_ledger_invariant(store: &Store, user: UserId) {
    let row = store.get_user(user).unwrap();
    let entries = store.ledger_for_user(user, 1_000).unwrap();
    let sum: i64 = entries.iter().map(|e| e.signed_delta()).sum();
    assert_eq!(row.balance.hundredths(), sum, "ledger does not add up");
    assert!(row.balance >= Money::ZERO);
}

// =============================================================================
// USERS AND LEDGER
// =============================================================================

#[test]
fn test_create_user_writes_opening_deposit() {
    let (store, _dir) = open_store();
    let id = new_player(&store, "alice", 100_000);

    let entries = store.ledger_for_user(id, 10).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].kind, LedgerKind::Deposit);
    assert_eq!(entries[0].amount, money(100_000));
    assert_ledger_invariant(&store, id);
}

#[test]
fn test_duplicate_handle_rejected() {
    let (store, _dir) = open_store();
    new_player(&store, "alice", 0);
    let err = store
        .create_user(
            NewUser {
                external_id: None,
                handle: "alice".to_string(),
                role: Role::Player,
                password_hash: None,
                balance: Money::ZERO,
            },
            PlayerSettings::default(),
            2_000,
        )
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyExists(_)));
}

#[test]
fn test_adjust_balance_refuses_overdraft() {
    let (store, _dir) = open_store();
    let id = new_player(&store, "alice", 5_000);

    let err = store
        .adjust_balance(id, -10_000, LedgerKind::Adjustment, "test", 2_000)
        .unwrap_err();
    assert!(matches!(err, Error::InsufficientFunds));

    // Balance and ledger untouched by the failed call.
    assert_eq!(store.get_user(id).unwrap().balance, money(5_000));
    assert_ledger_invariant(&store, id);
}

#[test]
fn test_authenticate_user_envelope() {
    let (store, _dir) = open_store();
    store
        .create_user(
            NewUser {
                external_id: None,
                handle: "admin".to_string(),
                role: Role::Admin,
                password_hash: Some(auth::hash_password("hunter22").unwrap()),
                balance: Money::ZERO,
            },
            PlayerSettings::default(),
            1_000,
        )
        .unwrap();

    let user = store.authenticate_user("admin", "hunter22", 5_000).unwrap();
    assert_eq!(user.handle, "admin");
    assert_eq!(user.last_login, 5_000);

    assert!(matches!(
        store.authenticate_user("admin", "wrong", 5_000),
        Err(Error::Unauthenticated)
    ));
    assert!(matches!(
        store.authenticate_user("nobody", "hunter22", 5_000),
        Err(Error::Unauthenticated)
    ));
}

#[test]
fn test_external_id_lookup() {
    let (store, _dir) = open_store();
    let created = store
        .create_user(
            NewUser {
                external_id: Some("tg-777".to_string()),
                handle: "bob".to_string(),
                role: Role::Player,
                password_hash: None,
                balance: money(1_000),
            },
            PlayerSettings::default(),
            1_000,
        )
        .unwrap();

    let found = store.find_user_by_external_id("tg-777").unwrap().unwrap();
    assert_eq!(found.id, created.id);
    assert!(store.find_user_by_external_id("tg-778").unwrap().is_none());
}

// =============================================================================
// ROUNDS
// =============================================================================

#[test]
fn test_round_numbers_strictly_increase() {
    let (store, _dir) = open_store();
    let a = open_round(&store, 1_000);
    store
        .update_round_status(a.number, RoundStatus::Crashed, Some(2_000))
        .unwrap();
    let b = open_round(&store, 3_000);

    assert_eq!(a.number, 1);
    assert_eq!(b.number, 2);
    assert_eq!(store.last_round_number().unwrap(), 2);
}

// =============================================================================
// WAGER LIFECYCLE (end-to-end scenarios)
// =============================================================================

#[test]
fn test_happy_path_cashout() {
    let (store, _dir) = open_store();
    let user = new_player(&store, "alice", 100_000);
    let round = open_round(&store, 10_000);

    // Bet 100.00 during betting.
    let (wager, after_bet) = store
        .place_wager(user, round.number, money(10_000), None, 11_000)
        .unwrap();
    assert_eq!(wager.status, WagerStatus::Active);
    assert_eq!(after_bet.balance, money(90_000));

    // Cash out at 1.50x while running.
    store
        .update_round_status(round.number, RoundStatus::Running, None)
        .unwrap();
    let (settled, after_cash) = store.cashout_wager(wager.id, mult(150), 12_500).unwrap();

    assert_eq!(settled.status, WagerStatus::CashedOut);
    assert_eq!(settled.cashout, Some(mult(150)));
    assert_eq!(settled.payout, Some(money(15_000)));
    assert_eq!(after_cash.balance, money(105_000));

    let entries = store.ledger_for_user(user, 10).unwrap();
    let kinds: Vec<_> = entries.iter().map(|e| e.kind).collect();
    assert!(kinds.contains(&LedgerKind::BetPlaced));
    assert!(kinds.contains(&LedgerKind::BetWon));
    assert_ledger_invariant(&store, user);
}

#[test]
fn test_cashout_is_idempotent() {
    let (store, _dir) = open_store();
    let user = new_player(&store, "alice", 100_000);
    let round = open_round(&store, 10_000);
    let (wager, _) = store
        .place_wager(user, round.number, money(10_000), None, 11_000)
        .unwrap();
    store
        .update_round_status(round.number, RoundStatus::Running, None)
        .unwrap();

    store.cashout_wager(wager.id, mult(150), 12_000).unwrap();
    let before = store.get_user(user).unwrap().balance;

    let err = store.cashout_wager(wager.id, mult(180), 12_100).unwrap_err();
    assert!(matches!(err, Error::AlreadyExists(_)));

    // Balance and wager unchanged by the duplicate.
    assert_eq!(store.get_user(user).unwrap().balance, before);
    let row = store.get_wager(wager.id).unwrap();
    assert_eq!(row.cashout, Some(mult(150)));
    assert_ledger_invariant(&store, user);
}

#[test]
fn test_cashout_requires_running_round() {
    let (store, _dir) = open_store();
    let user = new_player(&store, "alice", 100_000);
    let round = open_round(&store, 10_000);
    let (wager, _) = store
        .place_wager(user, round.number, money(10_000), None, 11_000)
        .unwrap();

    let err = store.cashout_wager(wager.id, mult(150), 11_500).unwrap_err();
    assert!(matches!(err, Error::FailedPrecondition(_)));
}

#[test]
fn test_loss_at_crash() {
    let (store, _dir) = open_store();
    let user = new_player(&store, "alice", 100_000);
    let round = open_round(&store, 10_000);
    store
        .place_wager(user, round.number, money(20_000), None, 11_000)
        .unwrap();
    store
        .update_round_status(round.number, RoundStatus::Running, None)
        .unwrap();

    let settled = store.settle_crashed_round(round.number, 15_000).unwrap();
    assert_eq!(settled, 1);

    let row = store.get_user(user).unwrap();
    assert_eq!(row.balance, money(80_000));
    assert_eq!(row.stats.total_lost, money(20_000));
    assert_eq!(row.stats.biggest_loss, money(20_000));

    let wager = store.find_wager_for(round.number, user).unwrap().unwrap();
    assert_eq!(wager.status, WagerStatus::Lost);

    let entries = store.ledger_for_user(user, 10).unwrap();
    assert!(entries.iter().any(|e| e.kind == LedgerKind::BetLost));
    assert_ledger_invariant(&store, user);
}

#[test]
fn test_settlement_skips_cashed_out_wagers() {
    let (store, _dir) = open_store();
    let winner = new_player(&store, "alice", 100_000);
    let loser = new_player(&store, "bob", 100_000);
    let round = open_round(&store, 10_000);

    let (w, _) = store
        .place_wager(winner, round.number, money(10_000), None, 11_000)
        .unwrap();
    store
        .place_wager(loser, round.number, money(10_000), None, 11_100)
        .unwrap();
    store
        .update_round_status(round.number, RoundStatus::Running, None)
        .unwrap();
    store.cashout_wager(w.id, mult(200), 12_000).unwrap();

    // Only the loser settles; the winner is terminal already.
    assert_eq!(store.settle_crashed_round(round.number, 13_000).unwrap(), 1);
    assert_eq!(
        store.find_wager_for(round.number, winner).unwrap().unwrap().status,
        WagerStatus::CashedOut
    );
    assert_ledger_invariant(&store, winner);
    assert_ledger_invariant(&store, loser);
}

#[test]
fn test_duplicate_wager_rejected() {
    let (store, _dir) = open_store();
    let user = new_player(&store, "alice", 100_000);
    let round = open_round(&store, 10_000);

    store
        .place_wager(user, round.number, money(1_000), None, 11_000)
        .unwrap();
    let before = store.get_user(user).unwrap().balance;

    let err = store
        .place_wager(user, round.number, money(1_000), None, 11_100)
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyExists(_)));
    assert_eq!(store.get_user(user).unwrap().balance, before);
}

#[test]
fn test_insufficient_funds_leaves_no_trace() {
    let (store, _dir) = open_store();
    let user = new_player(&store, "alice", 5_000);
    let round = open_round(&store, 10_000);

    let err = store
        .place_wager(user, round.number, money(10_000), None, 11_000)
        .unwrap_err();
    assert!(matches!(err, Error::InsufficientFunds));

    assert_eq!(store.get_user(user).unwrap().balance, money(5_000));
    assert!(store.find_wager_for(round.number, user).unwrap().is_none());
    assert_ledger_invariant(&store, user);
}

#[test]
fn test_cancel_refunds_active_wagers() {
    let (store, _dir) = open_store();
    let user = new_player(&store, "alice", 100_000);
    let round = open_round(&store, 10_000);
    store
        .place_wager(user, round.number, money(10_000), None, 11_000)
        .unwrap();

    assert_eq!(store.cancel_active_wagers(round.number, 12_000).unwrap(), 1);

    let row = store.get_user(user).unwrap();
    assert_eq!(row.balance, money(100_000));
    assert_eq!(row.stats.total_wagered, Money::ZERO);
    assert_eq!(
        store.find_wager_for(round.number, user).unwrap().unwrap().status,
        WagerStatus::Cancelled
    );
    assert_ledger_invariant(&store, user);
}

#[test]
fn test_recover_stale_rounds_after_hard_stop() {
    let (store, _dir) = open_store();
    let user = new_player(&store, "alice", 100_000);
    let round = open_round(&store, 10_000);
    store
        .place_wager(user, round.number, money(10_000), None, 11_000)
        .unwrap();

    // Simulated restart: the round never finished.
    assert_eq!(store.recover_stale_rounds(50_000).unwrap(), 1);

    assert_eq!(
        store.get_round(round.number).unwrap().status,
        RoundStatus::Crashed
    );
    let row = store.get_user(user).unwrap();
    assert_eq!(row.balance, money(100_000));
    assert_eq!(
        store.find_wager_for(round.number, user).unwrap().unwrap().status,
        WagerStatus::Cancelled
    );
    assert_ledger_invariant(&store, user);

    // Idempotent on a clean store.
    assert_eq!(store.recover_stale_rounds(60_000).unwrap(), 0);
}

// =============================================================================
// DAILY LIMITS
// =============================================================================

fn enable_daily_limits(store: &Store, user: UserId, max_wager: i64, max_games: u32) {
    store
        .upsert_player_settings(
            user,
            SettingsPatch {
                daily_limits_enabled: Some(true),
                max_daily_wager: Some(money(max_wager)),
                max_games_per_day: Some(max_games),
                ..SettingsPatch::default()
            },
            &PlayerSettings::default(),
        )
        .unwrap();
}

#[test]
fn test_daily_wager_limit() {
    let (store, _dir) = open_store();
    let user = new_player(&store, "alice", 100_000);
    enable_daily_limits(&store, user, 50_000, 100);

    let r1 = open_round(&store, 10_000);
    store
        .place_wager(user, r1.number, money(30_000), None, 11_000)
        .unwrap();
    store
        .update_round_status(r1.number, RoundStatus::Crashed, Some(12_000))
        .unwrap();

    // Second wager the same day would cross 500.00 total.
    let r2 = open_round(&store, 13_000);
    let err = store
        .place_wager(user, r2.number, money(30_000), None, 14_000)
        .unwrap_err();
    assert!(matches!(err, Error::DailyLimitExceeded));

    // A smaller stake still fits.
    store
        .place_wager(user, r2.number, money(20_000), None, 15_000)
        .unwrap();
}

#[test]
fn test_daily_games_limit() {
    let (store, _dir) = open_store();
    let user = new_player(&store, "alice", 100_000);
    enable_daily_limits(&store, user, 1_000_000, 1);

    let r1 = open_round(&store, 10_000);
    store
        .place_wager(user, r1.number, money(1_000), None, 11_000)
        .unwrap();
    store
        .update_round_status(r1.number, RoundStatus::Crashed, Some(12_000))
        .unwrap();

    let r2 = open_round(&store, 13_000);
    let err = store
        .place_wager(user, r2.number, money(1_000), None, 14_000)
        .unwrap_err();
    assert!(matches!(err, Error::DailyLimitExceeded));

    // A new calendar day resets the counter.
    const DAY_MS: u64 = 24 * 60 * 60 * 1_000;
    store
        .place_wager(user, r2.number, money(1_000), None, 14_000 + DAY_MS)
        .unwrap();
}

// =============================================================================
// SETTINGS
// =============================================================================

#[test]
fn test_settings_round_trip() {
    let (store, _dir) = open_store();
    let user = new_player(&store, "alice", 0);
    let defaults = PlayerSettings::default();

    let updated = store
        .upsert_player_settings(
            user,
            SettingsPatch {
                auto_cashout_enabled: Some(true),
                auto_cashout: Some(mult(250)),
                sound_enabled: Some(false),
                ..SettingsPatch::default()
            },
            &defaults,
        )
        .unwrap();

    let read = store.get_player_settings(user, &defaults).unwrap();
    assert!(read.auto_cashout_enabled);
    assert_eq!(read.auto_cashout, mult(250));
    assert!(!read.sound_enabled);
    // Untouched fields keep their defaults.
    assert_eq!(read.max_games_per_day, updated.max_games_per_day);
    assert_eq!(read.max_games_per_day, defaults.max_games_per_day);
}

// =============================================================================
// FARMING
// =============================================================================

#[test]
fn test_farming_claim_and_cooldown() {
    let (store, _dir) = open_store();
    let user = new_player(&store, "alice", 0);
    let cycle = 6 * 60 * 60;
    let reward = money(600_000);

    let claimed = store
        .claim_farming_points(user, cycle, reward, 1_000_000)
        .unwrap();
    assert_eq!(claimed.balance, reward);
    assert_eq!(claimed.farming_last_claim, 1_000_000);

    // Inside the cooldown.
    let err = store
        .claim_farming_points(user, cycle, reward, 1_000_000 + 1_000)
        .unwrap_err();
    assert!(matches!(err, Error::FailedPrecondition(_)));

    // After the cooldown.
    let again = store
        .claim_farming_points(user, cycle, reward, 1_000_000 + cycle * 1_000)
        .unwrap();
    assert_eq!(again.balance, money(1_200_000));
    assert_ledger_invariant(&store, user);
}

// =============================================================================
// FAIRNESS AUDIT AND QUERIES
// =============================================================================

#[test]
fn test_seed_reveal_respects_grace_period() {
    let (store, _dir) = open_store();
    let round = open_round(&store, 10_000);
    store
        .update_round_status(round.number, RoundStatus::Crashed, Some(100_000))
        .unwrap();
    let grace = 300;

    // Inside the grace window the seed is withheld.
    let rows = store
        .recent_fair_rounds(10, grace, 100_000 + grace * 1_000 - 1)
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert!(rows[0].server_seed.is_none());

    // Past it the seed is revealed and matches the commitment.
    let rows = store
        .recent_fair_rounds(10, grace, 100_000 + grace * 1_000)
        .unwrap();
    let revealed = rows[0].server_seed.unwrap();
    assert_eq!(apogee::fair::sha256(&revealed), rows[0].server_seed_hash);
}

#[test]
fn test_fair_rounds_exclude_live_round() {
    let (store, _dir) = open_store();
    let done = open_round(&store, 10_000);
    store
        .update_round_status(done.number, RoundStatus::Crashed, Some(20_000))
        .unwrap();
    let _live = open_round(&store, 30_000);

    let rows = store.recent_fair_rounds(10, 0, 1_000_000).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].number, done.number);
}

#[test]
fn test_leaderboard_win_rate_threshold() {
    let (store, _dir) = open_store();
    let veteran = new_player(&store, "veteran", 100_000);
    let novice = new_player(&store, "novice", 100_000);

    // Veteran plays 10 rounds, novice 1; only the veteran qualifies.
    for i in 0..10 {
        let round = open_round(&store, 10_000 + i);
        let (w, _) = store
            .place_wager(veteran, round.number, money(100), None, 10_500 + i)
            .unwrap();
        if i == 0 {
            store
                .place_wager(novice, round.number, money(100), None, 10_600 + i)
                .unwrap();
        }
        store
            .update_round_status(round.number, RoundStatus::Running, None)
            .unwrap();
        store.cashout_wager(w.id, mult(110), 11_000 + i).unwrap();
        store.settle_crashed_round(round.number, 12_000 + i).unwrap();
        store
            .update_round_status(round.number, RoundStatus::Crashed, Some(12_000 + i))
            .unwrap();
    }

    let rows = store
        .leaderboard(apogee::store::LeaderboardSort::WinRate, 10, 10)
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].handle, "veteran");
    assert_eq!(rows[0].win_rate_pct(), 100);
}

#[test]
fn test_admin_stats_aggregate() {
    let (store, _dir) = open_store();
    let user = new_player(&store, "alice", 100_000);
    let round = open_round(&store, 10_000);
    store
        .place_wager(user, round.number, money(10_000), None, 11_000)
        .unwrap();
    store
        .update_round_status(round.number, RoundStatus::Running, None)
        .unwrap();
    store.settle_crashed_round(round.number, 12_000).unwrap();

    let stats = store.stats().unwrap();
    assert_eq!(stats.users, 1);
    assert_eq!(stats.active_users, 1);
    assert_eq!(stats.rounds, 1);
    assert_eq!(stats.total_wagered, money(10_000));
    assert_eq!(stats.total_lost, money(10_000));
}

#[test]
fn test_deactivated_user_cannot_wager() {
    let (store, _dir) = open_store();
    let user = new_player(&store, "alice", 100_000);
    store
        .update_user(
            user,
            UserPatch {
                active: Some(false),
                ..UserPatch::default()
            },
        )
        .unwrap();

    let round = open_round(&store, 10_000);
    let err = store
        .place_wager(user, round.number, money(1_000), None, 11_000)
        .unwrap_err();
    assert!(matches!(err, Error::PermissionDenied));
}
