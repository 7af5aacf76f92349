//! Conversation store and per-session state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::RelayError;
use crate::llm::Turn;

use super::DEFAULT_SYSTEM_PROMPT;

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// A single conversation session.
///
/// Cloning is cheap; all clones share the same transcript.
#[derive(Debug, Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

#[derive(Debug)]
struct SessionInner {
    /// Unique session identifier.
    id: String,
    /// Ordered transcript; index 0 is the system turn.
    transcript: RwLock<Vec<Turn>>,
    /// Last activity time.
    last_activity: RwLock<DateTime<Utc>>,
    /// Set while a turn is streaming.
    busy: AtomicBool,
    /// Live connections bound to this session.
    attached: AtomicUsize,
}

impl Session {
    fn new(id: String, system_prompt: &str) -> Self {
        let now = Utc::now();
        Self {
            inner: Arc::new(SessionInner {
                id,
                transcript: RwLock::new(vec![Turn::system(system_prompt)]),
                last_activity: RwLock::new(now),
                busy: AtomicBool::new(false),
                attached: AtomicUsize::new(0),
            }),
        }
    }

    /// Get the session ID.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// The full transcript, system turn included.
    #[must_use]
    pub fn transcript(&self) -> Vec<Turn> {
        read(&self.inner.transcript).clone()
    }

    /// The transcript without the leading system turn.
    #[must_use]
    pub fn history(&self) -> Vec<Turn> {
        read(&self.inner.transcript)
            .iter()
            .skip(1)
            .cloned()
            .collect()
    }

    /// Number of turns, system turn included.
    #[must_use]
    pub fn turn_count(&self) -> usize {
        read(&self.inner.transcript).len()
    }

    /// Append a turn to the transcript.
    pub fn push(&self, turn: Turn) {
        write(&self.inner.transcript).push(turn);
        self.touch();
    }

    /// Claim the session for one streaming turn.
    ///
    /// Returns `None` while another turn holds the claim. The claim is
    /// released when the returned guard is dropped.
    #[must_use]
    pub fn try_begin_turn(&self) -> Option<TurnGuard> {
        self.inner
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| TurnGuard {
                session: self.clone(),
            })
    }

    /// Whether a turn is currently streaming.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.inner.busy.load(Ordering::Acquire)
    }

    /// Bind a connection to the session until the returned guard is
    /// dropped. Attached sessions are never evicted.
    #[must_use]
    pub fn attach(&self) -> Attachment {
        self.inner.attached.fetch_add(1, Ordering::AcqRel);
        Attachment {
            session: self.clone(),
        }
    }

    /// Whether a turn is streaming or a connection is bound.
    #[must_use]
    pub fn is_in_use(&self) -> bool {
        self.is_busy() || self.inner.attached.load(Ordering::Acquire) > 0
    }

    /// Time since the last activity.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        let last = *read(&self.inner.last_activity);
        (Utc::now() - last).to_std().unwrap_or(Duration::ZERO)
    }

    fn last_activity(&self) -> DateTime<Utc> {
        *read(&self.inner.last_activity)
    }

    fn touch(&self) {
        *write(&self.inner.last_activity) = Utc::now();
    }
}

/// Exclusive claim on a session's in-flight turn.
#[derive(Debug)]
pub struct TurnGuard {
    session: Session,
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        self.session.inner.busy.store(false, Ordering::Release);
    }
}

/// A connection's binding to a session.
#[derive(Debug)]
pub struct Attachment {
    session: Session,
}

impl Drop for Attachment {
    fn drop(&mut self) {
        self.session.inner.attached.fetch_sub(1, Ordering::AcqRel);
    }
}

/// When sessions are removed from the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// Sessions are never removed.
    #[default]
    None,
    /// Sessions idle for at least this long are removed by
    /// [`ConversationStore::sweep`]. Sessions in use are kept.
    Ttl(Duration),
    /// At most this many sessions are kept; creating one more evicts the
    /// least recently active session not in use.
    Capacity(usize),
}

/// Callback receiving the ids of evicted sessions.
pub type EvictionHook = Arc<dyn Fn(&[String]) + Send + Sync>;

/// Result of [`ConversationStore::resolve`].
#[derive(Debug)]
pub struct Resolved {
    /// The session id the client should use from now on.
    pub id: String,
    /// The session.
    pub session: Session,
    /// Whether the session was created by this call.
    pub is_new: bool,
    /// Keeps the session from being evicted until dropped.
    pub attachment: Attachment,
}

/// Thread-safe store for sessions.
#[derive(Clone)]
pub struct ConversationStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    sessions: RwLock<HashMap<String, Session>>,
    system_prompt: String,
    policy: EvictionPolicy,
    on_evict: Option<EvictionHook>,
}

impl std::fmt::Debug for ConversationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationStore")
            .field("sessions", &self.len())
            .field("policy", &self.inner.policy)
            .finish()
    }
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationStore {
    /// Create a store with the default system prompt and no eviction.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(DEFAULT_SYSTEM_PROMPT, EvictionPolicy::None, None)
    }

    /// Create a store with a custom system prompt, eviction policy and
    /// optional eviction callback.
    #[must_use]
    pub fn with_config(
        system_prompt: impl Into<String>,
        policy: EvictionPolicy,
        on_evict: Option<EvictionHook>,
    ) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                sessions: RwLock::new(HashMap::new()),
                system_prompt: system_prompt.into(),
                policy,
                on_evict,
            }),
        }
    }

    /// The configured eviction policy.
    #[must_use]
    pub fn policy(&self) -> EvictionPolicy {
        self.inner.policy
    }

    /// Return the session for `requested`, or create a fresh one.
    ///
    /// A missing, empty or unknown id yields a new session with a newly
    /// minted id, seeded with the system turn. The session comes back
    /// attached, so no eviction can remove it before the caller lets go.
    pub fn resolve(&self, requested: Option<&str>) -> Resolved {
        if let Some((session, attachment)) = requested
            .filter(|id| !id.is_empty())
            .and_then(|id| self.attach_existing(id))
        {
            session.touch();
            info!(name: "session.resumed", session_id = %session.id(), "Resumed session");
            return Resolved {
                id: session.id().to_string(),
                session,
                is_new: false,
                attachment,
            };
        }

        let id = Uuid::new_v4().to_string();
        let session = Session::new(id.clone(), &self.inner.system_prompt);
        let attachment = session.attach();

        let evicted = {
            let mut guard = write(&self.inner.sessions);
            guard.insert(id.clone(), session.clone());
            match self.inner.policy {
                EvictionPolicy::Capacity(max) => evict_least_recent(&mut guard, max, &id),
                _ => Vec::new(),
            }
        };
        self.notify_evicted(&evicted);

        info!(
            name: "session.created",
            session_id = %id,
            requested = ?requested,
            "Created new session"
        );

        Resolved {
            id,
            session,
            is_new: true,
            attachment,
        }
    }

    /// Look up and attach a session under the map lock, so a concurrent
    /// sweep or capacity eviction sees it in use.
    fn attach_existing(&self, id: &str) -> Option<(Session, Attachment)> {
        let sessions = read(&self.inner.sessions);
        let session = sessions.get(id)?.clone();
        let attachment = session.attach();
        Some((session, attachment))
    }

    /// Get a session by ID.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Session> {
        read(&self.inner.sessions).get(id).cloned()
    }

    /// Append a turn to the session's transcript.
    pub fn append(&self, id: &str, turn: Turn) -> Result<(), RelayError> {
        self.require(id)?.push(turn);
        Ok(())
    }

    /// The session's turns, excluding the system turn.
    pub fn history(&self, id: &str) -> Result<Vec<Turn>, RelayError> {
        Ok(self.require(id)?.history())
    }

    /// The session's full transcript.
    pub fn transcript(&self, id: &str) -> Result<Vec<Turn>, RelayError> {
        Ok(self.require(id)?.transcript())
    }

    /// Get the number of sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        read(&self.inner.sessions).len()
    }

    /// Check if there are no sessions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove idle sessions past the TTL.
    ///
    /// Returns the evicted ids. Does nothing unless the policy is
    /// [`EvictionPolicy::Ttl`].
    pub fn sweep(&self) -> Vec<String> {
        let EvictionPolicy::Ttl(ttl) = self.inner.policy else {
            return Vec::new();
        };

        let evicted = {
            let mut guard = write(&self.inner.sessions);
            let expired: Vec<String> = guard
                .values()
                .filter(|s| !s.is_in_use() && s.idle_for() >= ttl)
                .map(|s| s.id().to_string())
                .collect();
            for id in &expired {
                guard.remove(id);
            }
            expired
        };
        self.notify_evicted(&evicted);
        evicted
    }

    fn require(&self, id: &str) -> Result<Session, RelayError> {
        self.get(id)
            .ok_or_else(|| RelayError::UnknownSession(id.to_string()))
    }

    fn notify_evicted(&self, evicted: &[String]) {
        if evicted.is_empty() {
            return;
        }
        debug!(name: "session.evicted", count = evicted.len(), ids = ?evicted, "Evicted sessions");
        if let Some(hook) = &self.inner.on_evict {
            hook(evicted);
        }
    }
}

/// Drop least recently active sessions not in use until at most `max`
/// remain. `keep` (the session just created) is never chosen.
fn evict_least_recent(
    sessions: &mut HashMap<String, Session>,
    max: usize,
    keep: &str,
) -> Vec<String> {
    let mut evicted = Vec::new();
    while sessions.len() > max {
        let victim = sessions
            .values()
            .filter(|s| s.id() != keep && !s.is_in_use())
            .min_by_key(|s| s.last_activity())
            .map(|s| s.id().to_string());

        let Some(victim) = victim else { break };
        sessions.remove(&victim);
        evicted.push(victim);
    }
    evicted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Role;
    use std::collections::HashSet;
    use std::sync::Mutex;

    #[test]
    fn test_session_lifecycle() {
        let session = Session::new("test-123".to_string(), "sys");

        assert_eq!(session.id(), "test-123");
        assert_eq!(session.turn_count(), 1);
        assert!(session.history().is_empty());

        session.push(Turn::user("Hello"));
        session.push(Turn::assistant("Hi there!"));
        assert_eq!(session.turn_count(), 3);

        let transcript = session.transcript();
        assert_eq!(transcript[0], Turn::system("sys"));
        assert_eq!(transcript[1].role, Role::User);
        assert_eq!(transcript[2].role, Role::Assistant);
    }

    #[test]
    fn test_resolve_creates_and_resumes() {
        let store = ConversationStore::new();
        assert!(store.is_empty());

        let fresh = store.resolve(None);
        assert!(fresh.is_new);
        assert_eq!(store.len(), 1);
        assert_eq!(
            store.transcript(&fresh.id).unwrap(),
            vec![Turn::system(DEFAULT_SYSTEM_PROMPT)]
        );

        store.append(&fresh.id, Turn::user("hi")).unwrap();
        store.append(&fresh.id, Turn::assistant("hello")).unwrap();

        let resumed = store.resolve(Some(&fresh.id));
        assert!(!resumed.is_new);
        assert_eq!(resumed.id, fresh.id);
        assert_eq!(
            store.history(&resumed.id).unwrap(),
            vec![Turn::user("hi"), Turn::assistant("hello")]
        );
    }

    #[test]
    fn test_unknown_or_empty_id_mints_fresh_id() {
        let store = ConversationStore::new();
        let mut seen = HashSet::new();

        for requested in [None, Some(""), Some("does-not-exist"), None] {
            let resolved = store.resolve(requested);
            assert!(resolved.is_new);
            assert_ne!(Some(resolved.id.as_str()), requested);
            assert!(seen.insert(resolved.id));
        }
        assert_eq!(store.len(), 4);
    }

    #[test]
    fn test_unknown_session_errors() {
        let store = ConversationStore::new();
        assert!(matches!(
            store.append("nope", Turn::user("hi")),
            Err(RelayError::UnknownSession(id)) if id == "nope"
        ));
        assert!(store.history("nope").is_err());
    }

    #[test]
    fn test_turn_guard_is_exclusive() {
        let store = ConversationStore::new();
        let resolved = store.resolve(None);

        let guard = resolved.session.try_begin_turn().unwrap();
        assert!(resolved.session.is_busy());
        assert!(store.get(&resolved.id).unwrap().try_begin_turn().is_none());

        drop(guard);
        assert!(!resolved.session.is_busy());
        assert!(resolved.session.try_begin_turn().is_some());
    }

    #[test]
    fn test_ttl_sweep_keeps_busy_sessions() {
        let evicted_log = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&evicted_log);
        let hook: EvictionHook = Arc::new(move |ids: &[String]| {
            log.lock().unwrap().extend_from_slice(ids);
        });
        let store =
            ConversationStore::with_config("sys", EvictionPolicy::Ttl(Duration::ZERO), Some(hook));

        let idle = store.resolve(None).id;
        let busy = store.resolve(None);
        drop(busy.attachment);
        let _guard = busy.session.try_begin_turn().unwrap();

        let evicted = store.sweep();
        assert_eq!(evicted, vec![idle.clone()]);
        assert_eq!(*evicted_log.lock().unwrap(), vec![idle.clone()]);
        assert!(store.get(&idle).is_none());
        assert!(store.get(&busy.id).is_some());
    }

    #[test]
    fn test_attached_sessions_survive_sweep() {
        let store =
            ConversationStore::with_config("sys", EvictionPolicy::Ttl(Duration::ZERO), None);
        let resolved = store.resolve(None);
        assert!(store.sweep().is_empty());

        drop(resolved.attachment);
        assert_eq!(store.sweep(), vec![resolved.id.clone()]);
    }

    #[test]
    fn test_resumed_session_is_attached_before_sweep() {
        let store =
            ConversationStore::with_config("sys", EvictionPolicy::Ttl(Duration::ZERO), None);
        let id = store.resolve(None).id;

        let resumed = store.resolve(Some(&id));
        assert!(!resumed.is_new);
        assert!(store.sweep().is_empty());
        store.append(&id, Turn::user("hi")).unwrap();

        drop(resumed);
        assert_eq!(store.sweep(), vec![id]);
    }

    #[test]
    fn test_resolved_session_survives_capacity_eviction() {
        let store = ConversationStore::with_config("sys", EvictionPolicy::Capacity(1), None);
        let first = store.resolve(None);
        let second = store.resolve(None);

        assert_eq!(store.len(), 2);
        store.append(&first.id, Turn::user("hi")).unwrap();
        store.append(&second.id, Turn::user("hi")).unwrap();

        drop(first);
        let third = store.resolve(None);
        assert_eq!(store.len(), 2);
        assert!(store.get(&second.id).is_some());
        assert!(store.get(&third.id).is_some());
    }

    #[test]
    fn test_sweep_without_ttl_is_noop() {
        let store = ConversationStore::new();
        let _ = store.resolve(None);
        assert!(store.sweep().is_empty());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_capacity_evicts_least_recent_idle() {
        let store = ConversationStore::with_config("sys", EvictionPolicy::Capacity(2), None);

        let oldest = store.resolve(None).id;
        std::thread::sleep(Duration::from_millis(5));
        let middle = store.resolve(None).id;
        std::thread::sleep(Duration::from_millis(5));

        // Touch the oldest so the middle one becomes least recent.
        store.append(&oldest, Turn::user("still here")).unwrap();
        std::thread::sleep(Duration::from_millis(5));

        let newest = store.resolve(None).id;
        assert_eq!(store.len(), 2);
        assert!(store.get(&middle).is_none());
        assert!(store.get(&oldest).is_some());
        assert!(store.get(&newest).is_some());
    }

    #[test]
    fn test_capacity_never_evicts_busy() {
        let store = ConversationStore::with_config("sys", EvictionPolicy::Capacity(1), None);
        let first = store.resolve(None);
        drop(first.attachment);
        let _guard = first.session.try_begin_turn().unwrap();

        let second = store.resolve(None);
        assert_eq!(store.len(), 2);
        assert!(store.get(&first.id).is_some());
        assert!(store.get(&second.id).is_some());
    }

    #[test]
    fn test_concurrent_appends() {
        let store = ConversationStore::new();
        let id = store.resolve(None).id;

        let handles: Vec<_> = (0..8)
            .map(|n| {
                let store = store.clone();
                let id = id.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        store.append(&id, Turn::user(format!("{n}-{i}"))).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.transcript(&id).unwrap().len(), 1 + 8 * 50);
        assert_eq!(store.transcript(&id).unwrap()[0].role, Role::System);
    }
}
