//! Shared state store backends
//!
//! The store is the single source of truth for conversation and battle
//! state, shared by every worker. Writes are conditional on the version
//! read: a worker can never persist a mutation computed from a stale
//! read without the store detecting it.
//!
//! # Backends
//!
//! - `MemoryStore` is for development/testing only - data is lost on restart
//! - `RedisStore` should be used in production with proper authentication

use crate::arena::ArenaBattle;
use crate::conversation::Conversation;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

/// Store trait for abstracting conversation/battle persistence.
///
/// `save` is a compare-and-set: `expected_version` of `None` means
/// "create only if absent"; `Some(v)` means "write only if the stored
/// version is still `v`". Either way the new version is returned and the
/// stored record carries it.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Load a conversation by id
    async fn load(&self, conversation_id: &str) -> Result<Option<Conversation>>;

    /// Conditionally save a conversation, returning the new version
    async fn save(&self, conversation: &Conversation, expected_version: Option<u64>)
        -> Result<u64>;

    /// Delete a conversation
    async fn delete(&self, conversation_id: &str) -> Result<bool>;

    /// Load a pending battle by id
    async fn load_battle(&self, battle_id: Uuid) -> Result<Option<ArenaBattle>>;

    /// Save a battle record (last write wins; battles are single-writer
    /// per phase change and expiry is checked on read)
    async fn save_battle(&self, battle: &ArenaBattle) -> Result<()>;

    /// Delete a battle record
    async fn delete_battle(&self, battle_id: Uuid) -> Result<bool>;

    /// List all pending battles (used by the expiry sweep)
    async fn list_battles(&self) -> Result<Vec<ArenaBattle>>;
}

/// In-memory store (for development/testing)
///
/// Data is lost on restart and not shared across processes; production
/// deployments use [`RedisStore`].
pub struct MemoryStore {
    conversations: RwLock<HashMap<String, Conversation>>,
    battles: RwLock<HashMap<Uuid, ArenaBattle>>,
}

impl MemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self {
            conversations: RwLock::new(HashMap::new()),
            battles: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn load(&self, conversation_id: &str) -> Result<Option<Conversation>> {
        let conversations = self.conversations.read().await;
        Ok(conversations.get(conversation_id).cloned())
    }

    async fn save(
        &self,
        conversation: &Conversation,
        expected_version: Option<u64>,
    ) -> Result<u64> {
        let mut conversations = self.conversations.write().await;
        let current = conversations.get(&conversation.id).map(|c| c.version);

        let new_version = match (expected_version, current) {
            (None, None) => 1,
            (None, Some(_)) => return Err(Error::StateConflict { attempts: 1 }),
            (Some(_), None) => {
                return Err(Error::NotFound(format!(
                    "conversation {}",
                    conversation.id
                )))
            }
            (Some(expected), Some(stored)) if expected == stored => stored + 1,
            (Some(_), Some(_)) => return Err(Error::StateConflict { attempts: 1 }),
        };

        let mut record = conversation.clone();
        record.version = new_version;
        conversations.insert(record.id.clone(), record);
        Ok(new_version)
    }

    async fn delete(&self, conversation_id: &str) -> Result<bool> {
        let mut conversations = self.conversations.write().await;
        Ok(conversations.remove(conversation_id).is_some())
    }

    async fn load_battle(&self, battle_id: Uuid) -> Result<Option<ArenaBattle>> {
        let battles = self.battles.read().await;
        Ok(battles.get(&battle_id).cloned())
    }

    async fn save_battle(&self, battle: &ArenaBattle) -> Result<()> {
        let mut battles = self.battles.write().await;
        battles.insert(battle.id, battle.clone());
        Ok(())
    }

    async fn delete_battle(&self, battle_id: Uuid) -> Result<bool> {
        let mut battles = self.battles.write().await;
        Ok(battles.remove(&battle_id).is_some())
    }

    async fn list_battles(&self) -> Result<Vec<ArenaBattle>> {
        let battles = self.battles.read().await;
        Ok(battles.values().cloned().collect())
    }
}

/// Redis-backed store (for production)
///
/// # Security Features
///
/// - Automatic TTL-based expiration
/// - Keys are prefixed to isolate from other Redis data
/// - Consider enabling Redis AUTH and TLS in production
pub struct RedisStore {
    client: redis::Client,
    /// Key prefix
    prefix: String,
    /// TTL in seconds
    ttl_seconds: u64,
    /// Compare-and-set script for versioned conversation writes
    cas_script: redis::Script,
}

/// Conditional write: creates when ARGV[1] is empty and the key is absent,
/// otherwise replaces only while the stored version still matches.
const CAS_SCRIPT: &str = r#"
local cur = redis.call('GET', KEYS[1])
if ARGV[1] == '' then
  if cur then return -1 end
else
  if not cur then return -2 end
  local obj = cjson.decode(cur)
  if tostring(obj['version']) ~= ARGV[1] then return -1 end
end
redis.call('SET', KEYS[1], ARGV[2], 'EX', ARGV[3])
return 1
"#;

impl RedisStore {
    /// Create a new Redis store
    ///
    /// # Errors
    ///
    /// Returns error if the Redis URL is invalid
    pub fn new(redis_url: &str) -> Result<Self> {
        Self::with_options(redis_url, "parley:", 24 * 3600)
    }

    /// Create with custom prefix and TTL
    ///
    /// # Errors
    ///
    /// Returns error if the Redis URL is invalid
    pub fn with_options(redis_url: &str, prefix: &str, ttl_seconds: u64) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| Error::StoreUnavailable(e.to_string()))?;

        Ok(Self {
            client,
            prefix: prefix.to_string(),
            ttl_seconds,
            cas_script: redis::Script::new(CAS_SCRIPT),
        })
    }

    fn conversation_key(&self, conversation_id: &str) -> String {
        format!("{}conversation:{}", self.prefix, conversation_id)
    }

    fn battle_key(&self, battle_id: Uuid) -> String {
        format!("{}battle:{}", self.prefix, battle_id)
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| Error::StoreUnavailable(format!("connection failed: {}", e)))
    }
}

#[async_trait]
impl ConversationStore for RedisStore {
    async fn load(&self, conversation_id: &str) -> Result<Option<Conversation>> {
        let mut conn = self.connection().await?;
        let key = self.conversation_key(conversation_id);

        let data: Option<String> = redis::cmd("GET")
            .arg(&key)
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::StoreUnavailable(format!("GET failed: {}", e)))?;

        match data {
            Some(json) => {
                let conversation: Conversation = serde_json::from_str(&json)
                    .map_err(|e| Error::Internal(format!("corrupt conversation record: {}", e)))?;
                debug!(conversation_id = %conversation_id, version = conversation.version, "conversation loaded");
                Ok(Some(conversation))
            }
            None => Ok(None),
        }
    }

    async fn save(
        &self,
        conversation: &Conversation,
        expected_version: Option<u64>,
    ) -> Result<u64> {
        let mut conn = self.connection().await?;
        let key = self.conversation_key(&conversation.id);

        let new_version = expected_version.map_or(1, |v| v + 1);
        let mut record = conversation.clone();
        record.version = new_version;
        let json = serde_json::to_string(&record)
            .map_err(|e| Error::Internal(format!("serialize conversation: {}", e)))?;

        let expected = expected_version.map(|v| v.to_string()).unwrap_or_default();
        let outcome: i64 = self
            .cas_script
            .key(&key)
            .arg(&expected)
            .arg(&json)
            .arg(self.ttl_seconds)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| Error::StoreUnavailable(format!("conditional write failed: {}", e)))?;

        match outcome {
            1 => {
                debug!(conversation_id = %conversation.id, version = new_version, "conversation saved");
                Ok(new_version)
            }
            -2 => Err(Error::NotFound(format!(
                "conversation {}",
                conversation.id
            ))),
            _ => Err(Error::StateConflict { attempts: 1 }),
        }
    }

    async fn delete(&self, conversation_id: &str) -> Result<bool> {
        let mut conn = self.connection().await?;
        let deleted: i64 = redis::cmd("DEL")
            .arg(self.conversation_key(conversation_id))
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::StoreUnavailable(format!("DEL failed: {}", e)))?;
        Ok(deleted > 0)
    }

    async fn load_battle(&self, battle_id: Uuid) -> Result<Option<ArenaBattle>> {
        let mut conn = self.connection().await?;
        let data: Option<String> = redis::cmd("GET")
            .arg(self.battle_key(battle_id))
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::StoreUnavailable(format!("GET failed: {}", e)))?;

        data.map(|json| {
            serde_json::from_str(&json)
                .map_err(|e| Error::Internal(format!("corrupt battle record: {}", e)))
        })
        .transpose()
    }

    async fn save_battle(&self, battle: &ArenaBattle) -> Result<()> {
        let mut conn = self.connection().await?;
        let json = serde_json::to_string(battle)
            .map_err(|e| Error::Internal(format!("serialize battle: {}", e)))?;

        redis::cmd("SETEX")
            .arg(self.battle_key(battle.id))
            .arg(self.ttl_seconds)
            .arg(&json)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| Error::StoreUnavailable(format!("SETEX failed: {}", e)))?;

        debug!(battle_id = %battle.id, phase = ?battle.phase, "battle saved");
        Ok(())
    }

    async fn delete_battle(&self, battle_id: Uuid) -> Result<bool> {
        let mut conn = self.connection().await?;
        let deleted: i64 = redis::cmd("DEL")
            .arg(self.battle_key(battle_id))
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::StoreUnavailable(format!("DEL failed: {}", e)))?;
        Ok(deleted > 0)
    }

    async fn list_battles(&self) -> Result<Vec<ArenaBattle>> {
        let mut conn = self.connection().await?;
        let pattern = format!("{}battle:*", self.prefix);

        let keys: Vec<String> = redis::cmd("KEYS")
            .arg(&pattern)
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::StoreUnavailable(format!("KEYS failed: {}", e)))?;

        if keys.len() > 1000 {
            warn!(count = keys.len(), "large battle backlog; expiry sweep is overdue");
        }

        let mut battles = Vec::with_capacity(keys.len());
        for key in keys {
            let data: Option<String> = redis::cmd("GET")
                .arg(&key)
                .query_async(&mut conn)
                .await
                .map_err(|e| Error::StoreUnavailable(format!("GET failed: {}", e)))?;
            if let Some(json) = data {
                match serde_json::from_str(&json) {
                    Ok(battle) => battles.push(battle),
                    Err(e) => warn!(key = %key, error = %e, "skipping corrupt battle record"),
                }
            }
        }
        Ok(battles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_create_and_load() {
        let store = MemoryStore::new();
        let conv = Conversation::new("c1");

        let version = store.save(&conv, None).await.unwrap();
        assert_eq!(version, 1);

        let loaded = store.load("c1").await.unwrap().unwrap();
        assert_eq!(loaded.version, 1);
    }

    #[tokio::test]
    async fn test_memory_store_create_conflict() {
        let store = MemoryStore::new();
        store.save(&Conversation::new("c1"), None).await.unwrap();

        let result = store.save(&Conversation::new("c1"), None).await;
        assert!(matches!(result, Err(Error::StateConflict { .. })));
    }

    #[tokio::test]
    async fn test_memory_store_versioned_save() {
        let store = MemoryStore::new();
        store.save(&Conversation::new("c1"), None).await.unwrap();

        let mut conv = store.load("c1").await.unwrap().unwrap();
        conv.add_user_message("hello");
        let version = store.save(&conv, Some(1)).await.unwrap();
        assert_eq!(version, 2);

        // A write computed from the stale version must be detected
        let stale = store.save(&conv, Some(1)).await;
        assert!(matches!(stale, Err(Error::StateConflict { .. })));
    }

    #[tokio::test]
    async fn test_memory_store_save_missing() {
        let store = MemoryStore::new();
        let conv = Conversation::new("ghost");
        let result = store.save(&conv, Some(3)).await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_memory_store_delete() {
        let store = MemoryStore::new();
        store.save(&Conversation::new("c1"), None).await.unwrap();

        assert!(store.delete("c1").await.unwrap());
        assert!(!store.delete("c1").await.unwrap());
        assert!(store.load("c1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_store_battles() {
        use crate::arena::ArenaBattle;
        use std::time::Duration;

        let store = MemoryStore::new();
        let battle = ArenaBattle::new("c1", Duration::from_secs(60));
        store.save_battle(&battle).await.unwrap();

        let loaded = store.load_battle(battle.id).await.unwrap().unwrap();
        assert_eq!(loaded.conversation_id, "c1");

        assert_eq!(store.list_battles().await.unwrap().len(), 1);
        assert!(store.delete_battle(battle.id).await.unwrap());
        assert!(store.list_battles().await.unwrap().is_empty());
    }

    // Redis tests require a running Redis instance
    // Run with: cargo test --features redis-tests
    #[cfg(feature = "redis-tests")]
    mod redis_tests {
        use super::*;

        #[tokio::test]
        async fn test_redis_versioned_save() {
            let store =
                RedisStore::with_options("redis://127.0.0.1:6379", "parley-test:", 60).unwrap();
            let _ = store.delete("rtest").await;

            let conv = Conversation::new("rtest");
            assert_eq!(store.save(&conv, None).await.unwrap(), 1);

            let mut loaded = store.load("rtest").await.unwrap().unwrap();
            loaded.add_user_message("hi");
            assert_eq!(store.save(&loaded, Some(1)).await.unwrap(), 2);

            let stale = store.save(&loaded, Some(1)).await;
            assert!(matches!(stale, Err(Error::StateConflict { .. })));

            store.delete("rtest").await.unwrap();
        }
    }
}
