//! Process-wide status gate.
//!
//! Network work may only proceed while the session is authenticated, the
//! client is running, the link is online and the account is within quota.
//! The gate is a shared observable: workers call [`StatusGate::wait_ready`]
//! before every network-using suspension point and are parked - not
//! cancelled - until an external notifier flips the bits back.

use tokio::sync::watch;

/// Snapshot of the four required status bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Status {
    /// Credentials are provided and accepted.
    pub auth: bool,
    /// The client is in the running state (not paused/stopping).
    pub run: bool,
    /// The network link is up.
    pub online: bool,
    /// The account has storage quota left.
    pub quota_ok: bool,
}

impl Status {
    /// All bits required for network work.
    #[must_use]
    pub fn ready() -> Self {
        Self {
            auth: true,
            run: true,
            online: true,
            quota_ok: true,
        }
    }

    /// True when every required bit holds.
    #[must_use]
    pub fn all_ok(self) -> bool {
        self.auth && self.run && self.online && self.quota_ok
    }
}

/// Shared observable over [`Status`].
#[derive(Debug)]
pub struct StatusGate {
    tx: watch::Sender<Status>,
}

impl StatusGate {
    /// Creates a gate with the given initial status.
    #[must_use]
    pub fn new(initial: Status) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// Creates a gate with every bit already satisfied.
    #[must_use]
    pub fn ready() -> Self {
        Self::new(Status::ready())
    }

    /// Returns the current status snapshot.
    #[must_use]
    pub fn current(&self) -> Status {
        *self.tx.borrow()
    }

    /// Sets the authentication bit.
    pub fn set_auth(&self, ok: bool) {
        self.tx.send_modify(|status| status.auth = ok);
    }

    /// Sets the running bit.
    pub fn set_run(&self, ok: bool) {
        self.tx.send_modify(|status| status.run = ok);
    }

    /// Sets the online bit.
    pub fn set_online(&self, ok: bool) {
        self.tx.send_modify(|status| status.online = ok);
    }

    /// Sets the quota bit.
    pub fn set_quota_ok(&self, ok: bool) {
        self.tx.send_modify(|status| status.quota_ok = ok);
    }

    /// Suspends until every required bit holds.
    ///
    /// Returns immediately when the gate is already open. This is a
    /// yielding wait; no polling.
    pub async fn wait_ready(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            if rx.borrow_and_update().all_ok() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}
