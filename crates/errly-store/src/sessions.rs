//! Dashboard session persistence.
//!
//! Sessions are keyed by the SHA-256 hex of the opaque cookie token; the
//! raw token exists only in the client's cookie and is never persisted.

use sha2::{Digest, Sha256};
use sqlx::Row;

use crate::error::StoreResult;
use crate::Store;

/// An authenticated dashboard session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// SHA-256 hex of the cookie token.
    pub id: String,
    /// Epoch ms at which the session expires.
    pub expires_at: i64,
}

impl Session {
    /// Whether the session is expired at `now_ms`.
    #[must_use]
    pub const fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at <= now_ms
    }
}

/// Hash a raw session token into the stored identifier.
#[must_use]
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

impl Store {
    /// Persist a session under its token hash.
    pub async fn insert_session(&self, id: &str, expires_at: i64) -> StoreResult<()> {
        sqlx::query("INSERT OR REPLACE INTO sessions (id, expires_at) VALUES (?, ?)")
            .bind(id)
            .bind(expires_at)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Look up a session by token hash.
    pub async fn get_session(&self, id: &str) -> StoreResult<Option<Session>> {
        let row = sqlx::query("SELECT id, expires_at FROM sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        Ok(row.map(|r| Session {
            id: r.get("id"),
            expires_at: r.get("expires_at"),
        }))
    }

    /// Delete one session.
    pub async fn delete_session(&self, id: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Delete all expired sessions; returns how many were removed.
    pub async fn delete_expired_sessions(&self, now_ms: i64) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM sessions WHERE expires_at <= ?")
            .bind(now_ms)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected())
    }

    /// Mass-invalidate every session.
    pub async fn delete_all_sessions(&self) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM sessions")
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_hash_is_sha256_hex() {
        let hash = hash_token("opaque-token");
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        // Deterministic, and distinct tokens hash differently.
        assert_eq!(hash, hash_token("opaque-token"));
        assert_ne!(hash, hash_token("other-token"));
    }

    #[tokio::test]
    async fn session_roundtrip() {
        let store = Store::open_in_memory().await.unwrap();
        let id = hash_token("tok");
        store.insert_session(&id, 10_000).await.unwrap();

        let session = store.get_session(&id).await.unwrap().unwrap();
        assert_eq!(session.expires_at, 10_000);
        assert!(!session.is_expired(9_999));
        assert!(session.is_expired(10_000));

        store.delete_session(&id).await.unwrap();
        assert!(store.get_session(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expiry_sweep_removes_only_expired() {
        let store = Store::open_in_memory().await.unwrap();
        store.insert_session("a", 1_000).await.unwrap();
        store.insert_session("b", 100_000).await.unwrap();

        let removed = store.delete_expired_sessions(50_000).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.get_session("a").await.unwrap().is_none());
        assert!(store.get_session("b").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn mass_invalidation() {
        let store = Store::open_in_memory().await.unwrap();
        store.insert_session("a", 100_000).await.unwrap();
        store.insert_session("b", 100_000).await.unwrap();
        assert_eq!(store.delete_all_sessions().await.unwrap(), 2);
    }
}
