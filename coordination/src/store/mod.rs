//! Coordination store: TTL keys, atomic scripts and pub/sub.
//!
//! The lock protocol is written against the [`CoordinationStore`] trait.
//! [`MemoryStore`] implements it in-process; a networked backend maps
//! each [`StoreScript`] to its Lua source.
//!
//! ```text
//! ┌──────────────┐  set NX EX   ┌──────────────────┐
//! │ Lock service │─────────────▶│ lock:branch:{id} │
//! │              │  eval CAD/CAE└──────────────────┘
//! │              │  publish     ┌──────────────────┐
//! │              │─────────────▶│ channels         │──▶ subscribers
//! └──────────────┘              └──────────────────┘
//! ```

pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

pub use memory::MemoryStore;

/// Error type for coordination store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Lock poisoned")]
    LockPoisoned,

    #[error("Script {script} expects {expected} keys and {expected_args} args")]
    ScriptArity {
        script: &'static str,
        expected: usize,
        expected_args: usize,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

/// Result type for coordination store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Shared reference to a coordination store
pub type SharedCoordinationStore = Arc<dyn CoordinationStore>;

/// Atomic server-side scripts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreScript {
    /// KEYS[1] = lock key, ARGV[1] = holder id.
    /// Deletes the key iff its JSON `holder_id` equals ARGV[1]. Returns 1 or 0.
    CompareAndDelete,
    /// KEYS[1] = lock key, ARGV[1] = holder id, ARGV[2] = extra seconds.
    /// Adds ARGV[2] to a positive TTL iff the holder matches. Returns 1 or 0.
    CompareAndExtend,
}

impl StoreScript {
    pub fn name(self) -> &'static str {
        match self {
            Self::CompareAndDelete => "compare_and_delete",
            Self::CompareAndExtend => "compare_and_extend",
        }
    }

    /// (keys, args) the script expects.
    pub fn arity(self) -> (usize, usize) {
        match self {
            Self::CompareAndDelete => (1, 1),
            Self::CompareAndExtend => (1, 2),
        }
    }

    /// Lua body for stores that execute scripts server-side.
    pub fn lua_source(self) -> &'static str {
        match self {
            Self::CompareAndDelete => {
                r#"local v = redis.call("GET", KEYS[1])
if v then
  local d = cjson.decode(v)
  if d["holder_id"] == ARGV[1] then
    return redis.call("DEL", KEYS[1])
  end
end
return 0"#
            }
            Self::CompareAndExtend => {
                r#"local v = redis.call("GET", KEYS[1])
if v then
  local d = cjson.decode(v)
  if d["holder_id"] == ARGV[1] then
    local t = redis.call("TTL", KEYS[1])
    if t > 0 then
      return redis.call("EXPIRE", KEYS[1], t + tonumber(ARGV[2]))
    end
  end
end
return 0"#
            }
        }
    }

    pub(crate) fn check_arity(self, keys: &[&str], args: &[&str]) -> StoreResult<()> {
        let (expected, expected_args) = self.arity();
        if keys.len() != expected || args.len() != expected_args {
            return Err(StoreError::ScriptArity {
                script: self.name(),
                expected,
                expected_args,
            });
        }
        Ok(())
    }
}

impl std::fmt::Display for StoreScript {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Minimal key/value + pub/sub contract used by the lock protocol.
///
/// Every method returns promptly; none waits for a key to change.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Set `key`. With `only_if_absent`, returns false when the key exists.
    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
        only_if_absent: bool,
    ) -> StoreResult<bool>;

    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Remaining TTL. `None` when the key is missing or has no expiry.
    async fn ttl_remaining(&self, key: &str) -> StoreResult<Option<Duration>>;

    /// Replace the expiry of a live key. False when the key is missing.
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    async fn eval(&self, script: StoreScript, keys: &[&str], args: &[&str]) -> StoreResult<i64>;

    /// Publish to a channel. Returns the number of receivers.
    async fn publish(&self, channel: &str, message: &str) -> StoreResult<usize>;

    async fn subscribe(&self, channel: &str) -> StoreResult<broadcast::Receiver<String>>;

    async fn set_add(&self, key: &str, member: &str) -> StoreResult<bool>;

    async fn set_remove(&self, key: &str, member: &str) -> StoreResult<bool>;

    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_arity() {
        assert!(StoreScript::CompareAndDelete.check_arity(&["k"], &["h"]).is_ok());
        assert!(StoreScript::CompareAndExtend.check_arity(&["k"], &["h"]).is_err());
        assert!(StoreScript::CompareAndExtend.lua_source().contains("EXPIRE"));
    }
}
