//! Branch lock service backed by a coordination store.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{HolderKind, HolderMeta, LockError, LockRecord, LockResult, LockStatus, LockToken};
use crate::config::LockConfig;
use crate::events::{EngineEvent, SharedEventBus};
use crate::graph::LockState;
use crate::store::{SharedCoordinationStore, StoreScript};

/// Shared reference to BranchLockService
pub type SharedLockService = Arc<BranchLockService>;

/// Grants and revokes per-branch exclusive write access.
///
/// Acquisition never blocks or queues. A crashed holder is recovered only
/// by TTL expiry, so long-running holders must extend their lease.
pub struct BranchLockService {
    store: SharedCoordinationStore,
    events: Option<SharedEventBus>,
    config: LockConfig,
}

impl BranchLockService {
    pub fn new(store: SharedCoordinationStore, config: LockConfig) -> Self {
        Self {
            store,
            events: None,
            config,
        }
    }

    /// Also emit `LockChanged` events for registered branches.
    pub fn with_events(mut self, events: SharedEventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Create a shared reference to this service
    pub fn shared(self) -> SharedLockService {
        Arc::new(self)
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.config.default_ttl_secs)
    }

    fn lock_key(&self, branch_id: &str) -> String {
        format!("{}{}", self.config.key_prefix, branch_id)
    }

    fn changes_channel(&self, branch_id: &str) -> String {
        format!("{}:changes", self.lock_key(branch_id))
    }

    fn session_branches_key(session_id: &str) -> String {
        format!("session:{session_id}:branches")
    }

    fn branch_session_key(branch_id: &str) -> String {
        format!("branch:{branch_id}:session")
    }

    fn interrupt_channel(session_id: &str) -> String {
        format!("session:{session_id}:interrupt")
    }

    fn encode(record: &LockRecord) -> LockResult<String> {
        serde_json::to_string(record).map_err(|e| LockError::Serialization(e.to_string()))
    }

    // =========================================================================
    // Acquire / release / extend
    // =========================================================================

    /// Take an agent lock. Fails with `Contention` if any lock exists.
    pub async fn acquire_agent_lock(
        &self,
        branch_id: &str,
        holder_id: &str,
        meta: &HolderMeta,
        ttl: Option<Duration>,
    ) -> LockResult<LockToken> {
        let token = self
            .acquire(branch_id, holder_id, HolderKind::Agent, meta, ttl)
            .await?;
        info!(branch_id, holder_id, agent = %meta.name, "Agent lock acquired");
        Ok(token)
    }

    /// Take a user lock. Fails with `Contention` if an agent (or anyone) holds it.
    pub async fn request_user_lock(
        &self,
        branch_id: &str,
        user_id: &str,
        ttl: Option<Duration>,
    ) -> LockResult<LockToken> {
        let token = self
            .acquire(branch_id, user_id, HolderKind::User, &HolderMeta::named(user_id), ttl)
            .await?;
        info!(branch_id, user_id, "User lock acquired");
        Ok(token)
    }

    async fn acquire(
        &self,
        branch_id: &str,
        holder_id: &str,
        kind: HolderKind,
        meta: &HolderMeta,
        ttl: Option<Duration>,
    ) -> LockResult<LockToken> {
        let ttl = ttl.unwrap_or_else(|| self.default_ttl());
        let token = LockToken::issue(branch_id, holder_id, kind);
        let record = LockRecord {
            branch_id: branch_id.to_string(),
            holder_id: holder_id.to_string(),
            holder_kind: kind,
            holder_name: meta.name.clone(),
            holder_type: meta.agent_type.clone(),
            acquired_at: token.acquired_at(),
            ttl_secs: ttl.as_secs(),
            nonce: token.nonce().to_string(),
        };

        let acquired = self
            .store
            .set(&self.lock_key(branch_id), &Self::encode(&record)?, Some(ttl), true)
            .await?;

        if !acquired {
            let current = self
                .get_lock_record(branch_id)
                .await?
                .map(|r| r.holder_id)
                .unwrap_or_default();
            debug!(branch_id, holder_id, current_holder = %current, "Lock contention");
            return Err(LockError::Contention {
                branch_id: branch_id.to_string(),
                holder_id: current,
            });
        }

        if kind == HolderKind::Agent {
            self.notify(branch_id, LockState::Observation, Some(&record)).await;
        }
        Ok(token)
    }

    /// Release if `holder_id` owns the lock. A mismatch is a no-op.
    pub async fn release_lock(&self, branch_id: &str, holder_id: &str) -> LockResult<bool> {
        let key = self.lock_key(branch_id);
        let released = self
            .store
            .eval(StoreScript::CompareAndDelete, &[&key], &[holder_id])
            .await?
            == 1;

        if released {
            info!(branch_id, holder_id, "Lock released");
            self.notify(branch_id, LockState::Editable, None).await;
        } else {
            debug!(branch_id, holder_id, "Release ignored: not the holder");
        }
        Ok(released)
    }

    /// Release the lock this token was issued for.
    pub async fn release(&self, token: LockToken) -> LockResult<bool> {
        self.release_lock(&token.branch_id, &token.holder_id).await
    }

    /// Extend a live lease held by `holder_id`.
    pub async fn extend_ttl(&self, branch_id: &str, holder_id: &str, extra: Duration) -> LockResult<bool> {
        let key = self.lock_key(branch_id);
        let extra_secs = extra.as_secs().to_string();
        let extended = self
            .store
            .eval(StoreScript::CompareAndExtend, &[&key], &[holder_id, &extra_secs])
            .await?
            == 1;

        debug!(branch_id, holder_id, extra_secs = %extra_secs, extended, "Lock TTL extension");
        Ok(extended)
    }

    pub async fn extend(&self, token: &LockToken, extra: Duration) -> LockResult<bool> {
        self.extend_ttl(&token.branch_id, &token.holder_id, extra).await
    }

    /// Whether the token still matches the live lock record, down to the
    /// acquisition it came from.
    pub async fn verify(&self, token: &LockToken) -> LockResult<bool> {
        Ok(self
            .get_lock_record(&token.branch_id)
            .await?
            .is_some_and(|r| token.matches(&r)))
    }

    /// The live user lease on a branch, if `user_id` holds one.
    pub async fn user_token(&self, branch_id: &str, user_id: &str) -> LockResult<Option<LockToken>> {
        Ok(self
            .get_lock_record(branch_id)
            .await?
            .filter(|r| r.holder_kind == HolderKind::User && r.holder_id == user_id)
            .map(|r| LockToken::for_record(&r)))
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn get_lock_record(&self, branch_id: &str) -> LockResult<Option<LockRecord>> {
        match self.store.get(&self.lock_key(branch_id)).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| LockError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }

    pub async fn get_lock_state(&self, branch_id: &str) -> LockResult<LockStatus> {
        let Some(record) = self.get_lock_record(branch_id).await? else {
            return Ok(LockStatus::unlocked(branch_id));
        };
        let ttl_remaining = self.store.ttl_remaining(&self.lock_key(branch_id)).await?;

        Ok(LockStatus {
            branch_id: branch_id.to_string(),
            state: record.holder_kind.lock_state(),
            holder_id: Some(record.holder_id),
            holder_kind: Some(record.holder_kind),
            holder_name: Some(record.holder_name),
            acquired_at: Some(record.acquired_at),
            ttl_remaining,
        })
    }

    /// True when the branch is unlocked or locked by this user.
    pub async fn check_user_can_edit(&self, branch_id: &str, user_id: &str) -> LockResult<bool> {
        Ok(match self.get_lock_record(branch_id).await? {
            None => true,
            Some(r) => r.holder_kind == HolderKind::User && r.holder_id == user_id,
        })
    }

    // =========================================================================
    // Session registry and global interrupt
    // =========================================================================

    pub async fn register_branch_for_session(&self, session_id: &str, branch_id: &str) -> LockResult<()> {
        self.store
            .set_add(&Self::session_branches_key(session_id), branch_id)
            .await?;
        self.store
            .set(&Self::branch_session_key(branch_id), session_id, None, false)
            .await?;
        debug!(session_id, branch_id, "Branch registered");
        Ok(())
    }

    pub async fn unregister_branch_for_session(&self, session_id: &str, branch_id: &str) -> LockResult<()> {
        self.store
            .set_remove(&Self::session_branches_key(session_id), branch_id)
            .await?;
        self.store.delete(&Self::branch_session_key(branch_id)).await?;
        Ok(())
    }

    pub async fn session_branches(&self, session_id: &str) -> LockResult<Vec<String>> {
        Ok(self
            .store
            .set_members(&Self::session_branches_key(session_id))
            .await?)
    }

    /// Broadcast an interrupt, then overwrite every registered branch's
    /// lock with a `GlobalPause` record. Returns the number of branches paused.
    ///
    /// This is the only operation that replaces a lock without checking
    /// its holder.
    pub async fn trigger_global_interrupt(&self, session_id: &str, user_id: &str) -> LockResult<usize> {
        let message = serde_json::json!({
            "type": "global_interrupt",
            "session_id": session_id,
            "user_id": user_id,
            "timestamp": Utc::now().to_rfc3339(),
        });
        let receivers = self
            .store
            .publish(&Self::interrupt_channel(session_id), &message.to_string())
            .await?;

        let ttl = self.default_ttl();
        let branches = self.session_branches(session_id).await?;
        for branch_id in &branches {
            let record = LockRecord {
                branch_id: branch_id.clone(),
                holder_id: user_id.to_string(),
                holder_kind: HolderKind::GlobalPause,
                holder_name: user_id.to_string(),
                holder_type: None,
                acquired_at: Utc::now(),
                ttl_secs: ttl.as_secs(),
                nonce: Uuid::new_v4().to_string(),
            };
            self.store
                .set(&self.lock_key(branch_id), &Self::encode(&record)?, Some(ttl), false)
                .await?;
            self.notify(branch_id, LockState::Paused, Some(&record)).await;
        }

        if let Some(events) = &self.events {
            let _ = events.publish(
                session_id,
                EngineEvent::GlobalInterrupt {
                    user_id: user_id.to_string(),
                    branches_paused: branches.len(),
                    timestamp: Utc::now(),
                },
            );
        }

        warn!(
            session_id,
            user_id,
            branches = branches.len(),
            receivers,
            "Global interrupt triggered"
        );
        Ok(branches.len())
    }

    /// Remove the session's `GlobalPause` records. Returns how many were cleared.
    pub async fn clear_global_pause(&self, session_id: &str, user_id: &str) -> LockResult<usize> {
        let mut cleared = 0;
        for branch_id in self.session_branches(session_id).await? {
            let Some(record) = self.get_lock_record(&branch_id).await? else {
                continue;
            };
            if record.holder_kind != HolderKind::GlobalPause {
                continue;
            }
            let key = self.lock_key(&branch_id);
            if self
                .store
                .eval(StoreScript::CompareAndDelete, &[&key], &[&record.holder_id])
                .await?
                == 1
            {
                cleared += 1;
                self.notify(&branch_id, LockState::Editable, None).await;
            }
        }
        info!(session_id, user_id, cleared, "Global pause cleared");
        Ok(cleared)
    }

    /// Receiver for the session's interrupt channel.
    pub async fn subscribe_interrupts(&self, session_id: &str) -> LockResult<broadcast::Receiver<String>> {
        Ok(self
            .store
            .subscribe(&Self::interrupt_channel(session_id))
            .await?)
    }

    /// Receiver for a branch's lock change notifications.
    pub async fn subscribe_changes(&self, branch_id: &str) -> LockResult<broadcast::Receiver<String>> {
        Ok(self.store.subscribe(&self.changes_channel(branch_id)).await?)
    }

    /// Publish a lock change on the store channel and the event bus.
    /// Notification failures are logged, never returned.
    async fn notify(&self, branch_id: &str, state: LockState, record: Option<&LockRecord>) {
        let payload = serde_json::json!({
            "type": "lock_changed",
            "branch_id": branch_id,
            "state": state,
            "holder_id": record.map(|r| r.holder_id.as_str()),
            "holder_kind": record.map(|r| r.holder_kind),
        });
        if let Err(e) = self
            .store
            .publish(&self.changes_channel(branch_id), &payload.to_string())
            .await
        {
            warn!(branch_id, error = %e, "Failed to publish lock change");
        }

        let Some(events) = &self.events else {
            return;
        };
        match self.store.get(&Self::branch_session_key(branch_id)).await {
            Ok(Some(session_id)) => {
                let _ = events.publish(
                    &session_id,
                    EngineEvent::LockChanged {
                        branch_id: branch_id.to_string(),
                        state,
                        holder_id: record.map(|r| r.holder_id.clone()),
                        holder_kind: record.map(|r| r.holder_kind),
                        timestamp: Utc::now(),
                    },
                );
            }
            Ok(None) => debug!(branch_id, "Lock change on unregistered branch"),
            Err(e) => warn!(branch_id, error = %e, "Failed to resolve branch session"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::store::MemoryStore;

    fn service() -> BranchLockService {
        BranchLockService::new(Arc::new(MemoryStore::new()), LockConfig::default())
    }

    fn meta() -> HolderMeta {
        HolderMeta::agent("debater", "debater")
    }

    #[tokio::test]
    async fn test_second_acquire_fails() {
        let locks = service();
        let token = locks.acquire_agent_lock("b1", "agent-1", &meta(), None).await.unwrap();
        assert_eq!(token.branch_id(), "b1");

        let err = locks
            .acquire_agent_lock("b1", "agent-2", &meta(), None)
            .await
            .unwrap_err();
        assert!(err.is_contention());
        match err {
            LockError::Contention { holder_id, .. } => assert_eq!(holder_id, "agent-1"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_acquire_is_not_reentrant() {
        let locks = service();
        locks.acquire_agent_lock("b1", "agent-1", &meta(), None).await.unwrap();
        assert!(locks
            .acquire_agent_lock("b1", "agent-1", &meta(), None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_release_with_wrong_holder_is_noop() {
        let locks = service();
        locks.acquire_agent_lock("b1", "agent-1", &meta(), None).await.unwrap();

        assert!(!locks.release_lock("b1", "agent-2").await.unwrap());
        let status = locks.get_lock_state("b1").await.unwrap();
        assert_eq!(status.state, LockState::Observation);
        assert_eq!(status.holder_id.as_deref(), Some("agent-1"));

        assert!(locks.release_lock("b1", "agent-1").await.unwrap());
        assert_eq!(locks.get_lock_state("b1").await.unwrap().state, LockState::Editable);
    }

    #[tokio::test]
    async fn test_user_lock_blocked_by_agent() {
        let locks = service();
        let token = locks.acquire_agent_lock("b1", "agent-1", &meta(), None).await.unwrap();
        assert!(locks.request_user_lock("b1", "user-1", None).await.is_err());
        assert!(!locks.check_user_can_edit("b1", "user-1").await.unwrap());

        locks.release(token).await.unwrap();
        let user = locks.request_user_lock("b1", "user-1", None).await.unwrap();
        assert_eq!(user.holder_kind(), HolderKind::User);

        let status = locks.get_lock_state("b1").await.unwrap();
        assert_eq!(status.state, LockState::Editable);
        assert!(status.is_locked());
        assert!(locks.check_user_can_edit("b1", "user-1").await.unwrap());
        assert!(!locks.check_user_can_edit("b1", "user-2").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry_self_heals() {
        let locks = service();
        let token = locks
            .acquire_agent_lock("b1", "agent-1", &meta(), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;

        assert!(!locks.verify(&token).await.unwrap());
        assert!(locks
            .acquire_agent_lock("b1", "agent-2", &meta(), None)
            .await
            .is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_extend_keeps_lease_alive() {
        let locks = service();
        let token = locks
            .acquire_agent_lock("b1", "agent-1", &meta(), Some(Duration::from_secs(5)))
            .await
            .unwrap();

        assert!(!locks.extend_ttl("b1", "agent-2", Duration::from_secs(10)).await.unwrap());
        assert!(locks.extend(&token, Duration::from_secs(10)).await.unwrap());

        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(locks.verify(&token).await.unwrap());
        let ttl = locks.get_lock_state("b1").await.unwrap().ttl_remaining.unwrap();
        assert_eq!(ttl, Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_token_fails_after_same_holder_reacquires() {
        let locks = service();
        let stale = locks
            .acquire_agent_lock("b1", "agent-1", &meta(), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;

        let fresh = locks.acquire_agent_lock("b1", "agent-1", &meta(), None).await.unwrap();
        assert!(!locks.verify(&stale).await.unwrap());
        assert!(locks.verify(&fresh).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_token_reads_live_lease() {
        let locks = service();
        assert!(locks.user_token("b1", "alice").await.unwrap().is_none());

        let held = locks
            .request_user_lock("b1", "alice", Some(Duration::from_secs(5)))
            .await
            .unwrap();
        let token = locks.user_token("b1", "alice").await.unwrap().unwrap();
        assert_eq!(token.nonce(), held.nonce());
        assert!(locks.verify(&token).await.unwrap());
        assert!(locks.user_token("b1", "bob").await.unwrap().is_none());

        // After expiry someone else's lease is never handed to alice.
        tokio::time::advance(Duration::from_secs(6)).await;
        locks.request_user_lock("b1", "bob", None).await.unwrap();
        assert!(locks.user_token("b1", "alice").await.unwrap().is_none());
        assert!(!locks.verify(&token).await.unwrap());
    }

    #[tokio::test]
    async fn test_global_interrupt_overrides_locks() {
        let bus = EventBus::new().shared();
        let locks = service().with_events(bus.clone());
        locks.register_branch_for_session("s1", "b1").await.unwrap();
        locks.register_branch_for_session("s1", "b2").await.unwrap();

        let mut interrupts = locks.subscribe_interrupts("s1").await.unwrap();
        let agent = locks.acquire_agent_lock("b1", "agent-1", &meta(), None).await.unwrap();

        let paused = locks.trigger_global_interrupt("s1", "user-1").await.unwrap();
        assert_eq!(paused, 2);
        assert!(interrupts.recv().await.unwrap().contains("global_interrupt"));

        for branch in ["b1", "b2"] {
            assert_eq!(locks.get_lock_state(branch).await.unwrap().state, LockState::Paused);
        }
        assert!(!locks.verify(&agent).await.unwrap());
        // The displaced agent cannot release the pause record.
        assert!(!locks.release(agent).await.unwrap());

        let events = bus.replay_since("s1", 0).unwrap();
        let paused_events = events
            .iter()
            .filter(|e| matches!(e.event, EngineEvent::LockChanged { state: LockState::Paused, .. }))
            .count();
        assert_eq!(paused_events, 2);
        assert!(events.iter().any(|e| e.event_type() == "global_interrupt"));

        assert_eq!(locks.clear_global_pause("s1", "user-1").await.unwrap(), 2);
        assert_eq!(locks.get_lock_state("b1").await.unwrap().state, LockState::Editable);
    }

    #[tokio::test]
    async fn test_acquire_publishes_change() {
        let locks = service();
        let mut changes = locks.subscribe_changes("b1").await.unwrap();
        locks.acquire_agent_lock("b1", "agent-1", &meta(), None).await.unwrap();

        let msg: serde_json::Value = serde_json::from_str(&changes.recv().await.unwrap()).unwrap();
        assert_eq!(msg["state"], "observation");
        assert_eq!(msg["holder_id"], "agent-1");
    }

    #[tokio::test]
    async fn test_unregistered_branch_is_not_paused() {
        let locks = service();
        locks.register_branch_for_session("s1", "b1").await.unwrap();
        locks.unregister_branch_for_session("s1", "b1").await.unwrap();
        assert_eq!(locks.trigger_global_interrupt("s1", "u").await.unwrap(), 0);
        assert_eq!(locks.get_lock_state("b1").await.unwrap().state, LockState::Editable);
    }
}
