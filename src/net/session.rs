//! Live session registry.
//!
//! Maps client identity (user or process-local guest) to its connection
//! state: outbound buffer handle, cached balance, role, activity. Sessions
//! are transient — detach never touches durable wagers. A second connection
//! by the same authenticated user replaces the first; the replaced socket is
//! closed gracefully via its outbound channel.

use crate::error::{Error, Result};
use crate::types::{now_ms, ClientId, Money, Role};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;

/// What the per-session writer task consumes.
#[derive(Debug)]
pub enum SessionFrame {
    Text(String),
    Ping,
    Close,
}

/// Outbound buffer depth per session. Running-phase ticks overflow this only
/// on a stalled consumer, and those ticks are droppable.
pub const SESSION_BUFFER: usize = 64;

struct SessionEntry {
    conn_seq: u64,
    role: Role,
    authenticated: bool,
    outbound: mpsc::Sender<SessionFrame>,
    balance: Money,
    connected_at: u64,
    last_activity: u64,
}

/// Snapshot handed to the broadcast fabric; holds a channel clone, never a
/// lock.
#[derive(Clone)]
pub struct SessionView {
    pub client: ClientId,
    pub authenticated: bool,
    pub balance: Money,
    pub outbound: mpsc::Sender<SessionFrame>,
}

pub struct AttachOutcome {
    pub conn_seq: u64,
    /// Outbound handle of the session this attach replaced, if any.
    pub replaced: Option<mpsc::Sender<SessionFrame>>,
}

#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<HashMap<ClientId, SessionEntry>>,
    guest_seq: AtomicU64,
    conn_seq: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_guest(&self) -> ClientId {
        ClientId::Guest(self.guest_seq.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub fn attach(
        &self,
        client: ClientId,
        role: Role,
        authenticated: bool,
        balance: Money,
        outbound: mpsc::Sender<SessionFrame>,
    ) -> AttachOutcome {
        let conn_seq = self.conn_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let now = now_ms();
        let entry = SessionEntry {
            conn_seq,
            role,
            authenticated,
            outbound,
            balance,
            connected_at: now,
            last_activity: now,
        };
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let replaced = inner.insert(client, entry).map(|old| old.outbound);
        AttachOutcome { conn_seq, replaced }
    }

    /// Remove the session, but only if it is still the same connection; a
    /// replaced socket detaching later must not evict its successor.
    pub fn detach(&self, client: ClientId, conn_seq: u64) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.get(&client) {
            Some(entry) if entry.conn_seq == conn_seq => {
                inner.remove(&client);
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, client: ClientId) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&client)
    }

    pub fn count(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn touch(&self, client: ClientId) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = inner.get_mut(&client) {
            entry.last_activity = now_ms();
        }
    }

    pub fn balance(&self, client: ClientId) -> Option<Money> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&client)
            .map(|e| e.balance)
    }

    pub fn role(&self, client: ClientId) -> Option<Role> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&client)
            .map(|e| e.role)
    }

    /// Refresh the cached balance after a durable mutation.
    pub fn set_balance(&self, client: ClientId, balance: Money) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = inner.get_mut(&client) {
            entry.balance = balance;
        }
    }

    /// Debit a guest's virtual balance. Guests never touch the store.
    pub fn debit_guest(&self, client: ClientId, amount: Money) -> Result<Money> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let entry = inner.get_mut(&client).ok_or(Error::Unauthenticated)?;
        if entry.balance < amount {
            return Err(Error::InsufficientFunds);
        }
        entry.balance = entry.balance.saturating_sub(amount);
        Ok(entry.balance)
    }

    pub fn credit_guest(&self, client: ClientId, amount: Money) -> Result<Money> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let entry = inner.get_mut(&client).ok_or(Error::Unauthenticated)?;
        entry.balance = entry.balance.saturating_add(amount);
        Ok(entry.balance)
    }

    pub fn view(&self, client: ClientId) -> Option<SessionView> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&client)
            .map(|e| SessionView {
                client,
                authenticated: e.authenticated,
                balance: e.balance,
                outbound: e.outbound.clone(),
            })
    }

    /// Point-in-time view of every session for a broadcast pass.
    pub fn snapshot(&self) -> Vec<SessionView> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(client, e)| SessionView {
                client: *client,
                authenticated: e.authenticated,
                balance: e.balance,
                outbound: e.outbound.clone(),
            })
            .collect()
    }

    /// Uptime of a session in milliseconds, for the status line.
    pub fn connected_for_ms(&self, client: ClientId) -> Option<u64> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&client)
            .map(|e| now_ms().saturating_sub(e.connected_at))
    }
}
