//! Per-player session tracking and enforcement policy.
//!
//! Each identity moves through `Unseen -> Tracked -> Flagged`. Lookups run
//! as spawned tasks; when one completes it only acts if the session it was
//! started for still exists (same generation) and still presents the
//! address that was looked up.

use crate::address::Key;
use crate::config::{EnforcementMode, Settings};
use crate::overrides::OverrideTable;
use crate::resolver::{AuditTag, Resolution, Resolver};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Failure reported by an [`Enforcer`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnforceError {
    /// Player already left or the identity is no longer valid.
    #[error("identity {0} is no longer connected")]
    Gone(String),
    #[error("enforcement failed: {0}")]
    Failed(String),
}

/// Host action taken against a flagged player (kick, ban, ...).
pub trait Enforcer: Send + Sync {
    fn enforce(&self, identity: &str) -> Result<(), EnforceError>;
}

/// Best-effort report of a flagged player, e.g. to online admins.
pub trait Notifier: Send + Sync {
    fn notify(&self, identity: &str, key: &Key, message: &str);
}

/// What caused a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Connect,
    KeyChange,
    ModeChange,
}

impl Trigger {
    fn message(&self, identity: &str, label: &str, key: &Key) -> String {
        match self {
            Trigger::Connect => format!(
                "Player {} ({}) connected using a VPN/proxy: {}",
                label, identity, key
            ),
            Trigger::KeyChange => format!(
                "Player {} ({}) switched to a VPN/proxy mid-session: {}",
                label, identity, key
            ),
            Trigger::ModeChange => format!(
                "Player {} ({}) is using a VPN/proxy: {}",
                label, identity, key
            ),
        }
    }
}

#[derive(Debug, Clone)]
struct SessionRecord {
    key: Key,
    label: String,
    /// Set once, never cleared within a session.
    flagged: bool,
    generation: u64,
}

/// Capability carried by a lookup task; validated before acting.
#[derive(Debug, Clone)]
struct SessionHandle {
    identity: String,
    generation: u64,
}

/// Session policy layer in front of the [`Resolver`].
pub struct SessionGuard {
    resolver: Arc<Resolver>,
    overrides: Arc<OverrideTable>,
    enforcer: Arc<dyn Enforcer>,
    notifier: Arc<dyn Notifier>,
    sessions: Mutex<HashMap<String, SessionRecord>>,
    mode: Mutex<EnforcementMode>,
    enabled: AtomicBool,
    log_flagged: bool,
    log_clean: bool,
    next_generation: AtomicU64,
}

impl SessionGuard {
    pub fn new(
        resolver: Arc<Resolver>,
        overrides: Arc<OverrideTable>,
        enforcer: Arc<dyn Enforcer>,
        notifier: Arc<dyn Notifier>,
        settings: &Settings,
    ) -> Arc<Self> {
        Arc::new(Self {
            resolver,
            overrides,
            enforcer,
            notifier,
            sessions: Mutex::new(HashMap::new()),
            mode: Mutex::new(settings.mode),
            enabled: AtomicBool::new(settings.enabled),
            log_flagged: settings.log_flagged,
            log_clean: settings.log_clean,
            next_generation: AtomicU64::new(1),
        })
    }

    pub fn resolver(&self) -> &Arc<Resolver> {
        &self.resolver
    }

    pub fn overrides(&self) -> &Arc<OverrideTable> {
        &self.overrides
    }

    pub fn mode(&self) -> EnforcementMode {
        *self.mode.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Master switch; sessions are still tracked while disabled.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Number of tracked sessions.
    pub fn tracked(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_flagged(&self, identity: &str) -> bool {
        self.sessions().get(identity).is_some_and(|r| r.flagged)
    }

    pub fn current_key(&self, identity: &str) -> Option<Key> {
        self.sessions().get(identity).map(|r| r.key)
    }

    /// A player finished connecting.
    ///
    /// Starts a new session for `identity` (replacing any previous one) and
    /// dispatches a lookup unless the player is exempt. Returns the lookup
    /// task, if one was started.
    pub fn on_connect(
        self: &Arc<Self>,
        identity: &str,
        label: &str,
        raw_key: &str,
    ) -> Option<JoinHandle<()>> {
        let key = match Key::parse(raw_key) {
            Ok(key) => key,
            Err(e) => {
                error!(identity = %identity, raw = %raw_key, error = %e, "Invalid address, skipping VPN check");
                return None;
            }
        };

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        self.sessions().insert(
            identity.to_string(),
            SessionRecord {
                key,
                label: label.to_string(),
                flagged: false,
                generation,
            },
        );

        if self.is_exempt(identity, &key) {
            return None;
        }

        debug!(identity = %identity, ip = %key, "Starting VPN check");
        let handle = SessionHandle {
            identity: identity.to_string(),
            generation,
        };
        Some(self.dispatch(handle, label.to_string(), key, Trigger::Connect))
    }

    /// Periodic address check (e.g. at round start).
    ///
    /// An unseen identity is only recorded. A changed address is recorded
    /// and looked up.
    pub fn on_recheck(
        self: &Arc<Self>,
        identity: &str,
        label: &str,
        raw_key: &str,
    ) -> Option<JoinHandle<()>> {
        let key = match Key::parse(raw_key) {
            Ok(key) => key,
            Err(e) => {
                warn!(identity = %identity, raw = %raw_key, error = %e, "Invalid address on recheck");
                return None;
            }
        };

        let (handle, label) = {
            let mut sessions = self.sessions();
            let Some(record) = sessions.get_mut(identity) else {
                let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                sessions.insert(
                    identity.to_string(),
                    SessionRecord {
                        key,
                        label: label.to_string(),
                        flagged: false,
                        generation,
                    },
                );
                return None;
            };

            if record.key == key {
                return None;
            }

            warn!(
                identity = %identity,
                from = %record.key,
                to = %key,
                "Address changed mid-session"
            );
            record.key = key;
            (
                SessionHandle {
                    identity: identity.to_string(),
                    generation: record.generation,
                },
                record.label.clone(),
            )
        };

        if self.is_exempt(identity, &key) {
            return None;
        }

        Some(self.dispatch(handle, label, key, Trigger::KeyChange))
    }

    /// Session ended. Pending lookups for it become no-ops.
    pub fn on_disconnect(&self, identity: &str) -> bool {
        self.sessions().remove(identity).is_some()
    }

    /// Change the enforcement mode.
    ///
    /// Going from monitor to enforce re-evaluates every tracked session:
    /// flagged ones are enforced right away, the rest are looked up again.
    pub fn set_mode(self: &Arc<Self>, mode: EnforcementMode) -> Vec<JoinHandle<()>> {
        // Mode swap and snapshot share the sessions lock with `apply`.
        let (previous, snapshot) = {
            let sessions = self.sessions();
            let previous = {
                let mut current = self.mode.lock().unwrap_or_else(|e| e.into_inner());
                std::mem::replace(&mut *current, mode)
            };
            let snapshot: Vec<(String, SessionRecord)> =
                if previous == EnforcementMode::Monitor && mode == EnforcementMode::Enforce {
                    sessions
                        .iter()
                        .map(|(id, rec)| (id.clone(), rec.clone()))
                        .collect()
                } else {
                    Vec::new()
                };
            (previous, snapshot)
        };

        info!(from = %previous, to = %mode, "Enforcement mode changed");

        let mut handles = Vec::new();
        for (identity, record) in snapshot {
            if self.is_exempt(&identity, &record.key) {
                continue;
            }

            if record.flagged {
                warn!(identity = %identity, ip = %record.key, "Enforcing previously flagged player");
                self.enforce(&identity);
                continue;
            }

            let handle = SessionHandle {
                identity,
                generation: record.generation,
            };
            handles.push(self.dispatch(handle, record.label, record.key, Trigger::ModeChange));
        }

        handles
    }

    fn is_exempt(&self, identity: &str, key: &Key) -> bool {
        if !self.is_enabled() {
            debug!(identity = %identity, "VPN checks disabled");
            return true;
        }
        if key.is_locally_scoped() {
            info!(identity = %identity, ip = %key, "Local/private address, skipping VPN check");
            return true;
        }
        if self.overrides.exempts(identity, &key.ip()) {
            info!(identity = %identity, ip = %key, "Whitelisted, skipping VPN check");
            return true;
        }
        false
    }

    fn dispatch(
        self: &Arc<Self>,
        handle: SessionHandle,
        label: String,
        key: Key,
        trigger: Trigger,
    ) -> JoinHandle<()> {
        let guard = Arc::clone(self);
        tokio::spawn(async move {
            let audit = AuditTag::new(handle.identity.clone(), label);
            let resolution = guard.resolver.resolve(&key, &audit).await;
            guard.apply(&handle, key, resolution, trigger);
        })
    }

    fn apply(&self, handle: &SessionHandle, key: Key, resolution: Resolution, trigger: Trigger) {
        let identity = handle.identity.as_str();

        if !resolution.is_flagged() {
            if self.log_clean {
                info!(identity = %identity, ip = %key, tier = ?resolution.tier, "Passed VPN check");
            } else {
                debug!(identity = %identity, ip = %key, tier = ?resolution.tier, "Passed VPN check");
            }
            return;
        }

        let (label, mode) = {
            let mut sessions = self.sessions();
            let Some(record) = sessions.get_mut(identity) else {
                debug!(identity = %identity, ip = %key, "Session ended before lookup completed");
                return;
            };
            if record.generation != handle.generation || record.key != key {
                debug!(identity = %identity, ip = %key, "Stale lookup result ignored");
                return;
            }
            if record.flagged {
                debug!(identity = %identity, ip = %key, "Already flagged this session");
                return;
            }
            if self.overrides.exempts(identity, &key.ip()) {
                return;
            }
            record.flagged = true;
            (record.label.clone(), self.mode())
        };

        if self.log_flagged {
            warn!(
                identity = %identity,
                ip = %key,
                severity = ?resolution.classification.severity,
                tier = ?resolution.tier,
                mode = %mode,
                "VPN/proxy detected"
            );
        }

        self.notifier
            .notify(identity, &key, &trigger.message(identity, &label, &key));

        if mode == EnforcementMode::Enforce {
            self.enforce(identity);
        }
    }

    fn enforce(&self, identity: &str) {
        if let Err(e) = self.enforcer.enforce(identity) {
            warn!(identity = %identity, error = %e, "Enforcement failed");
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, SessionRecord>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }
}
