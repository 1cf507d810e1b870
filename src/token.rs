use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::HashSet;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{RelayError, Result};

/// Random draws attempted at one token length before widening
const DRAWS_PER_LENGTH: usize = 32;

/// Maximum number of characters the pool will widen a token by under
/// saturation
const MAX_WIDENING: usize = 3;

/// Pool of short correlation tokens with process-wide uniqueness
///
/// A token handed out by [`allocate`](TokenPool::allocate) is checked out: no
/// concurrent allocation can return the same value until it is handed back
/// with [`release`](TokenPool::release). Released tokens may be reused later.
pub struct TokenPool {
    in_use: Mutex<HashSet<String>>,
    base_length: usize,
}

impl TokenPool {
    /// Create a pool producing tokens of the given base length
    pub fn new(base_length: usize) -> Self {
        Self {
            in_use: Mutex::new(HashSet::new()),
            base_length: base_length.max(1),
        }
    }

    /// Check out a token not currently in use
    ///
    /// Draws at the base length first; if the space is saturated the length is
    /// widened one character at a time. Saturation past the widening cap
    /// fails with [`RelayError::ResourceExhausted`] rather than ever handing
    /// out a duplicate.
    pub async fn allocate(&self) -> Result<String> {
        let mut in_use = self.in_use.lock().await;

        for widen in 0..=MAX_WIDENING {
            let length = self.base_length + widen;
            if widen > 0 {
                warn!(
                    "token space saturated at length {}, widening to {} ({} checked out)",
                    length - 1,
                    length,
                    in_use.len()
                );
            }

            for _ in 0..DRAWS_PER_LENGTH {
                let token = random_token(length);
                if !in_use.contains(&token) {
                    in_use.insert(token.clone());
                    debug!("allocated token {} ({} checked out)", token, in_use.len());
                    return Ok(token);
                }
            }
        }

        Err(RelayError::ResourceExhausted)
    }

    /// Hand a token back to the pool
    ///
    /// Returns false if the token was not checked out, which indicates a
    /// double release somewhere upstream.
    pub async fn release(&self, token: &str) -> bool {
        let released = self.in_use.lock().await.remove(token);
        if !released {
            warn!("release of token {} that was not checked out", token);
        }
        released
    }

    /// Whether the given token is currently checked out
    pub async fn is_checked_out(&self, token: &str) -> bool {
        self.in_use.lock().await.contains(token)
    }

    /// Number of tokens currently checked out
    pub async fn checked_out(&self) -> usize {
        self.in_use.lock().await.len()
    }
}

/// Draw one random alphanumeric token of the given length
fn random_token(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[tokio::test]
    async fn test_allocated_tokens_are_unique() {
        let pool = TokenPool::new(5);
        let mut seen = HashSet::new();

        for _ in 0..200 {
            let token = pool.allocate().await.unwrap();
            assert_eq!(token.len(), 5);
            assert!(seen.insert(token), "duplicate token while checked out");
        }
        assert_eq!(pool.checked_out().await, 200);
    }

    #[tokio::test]
    async fn test_release_returns_token_to_pool() {
        let pool = TokenPool::new(5);
        let token = pool.allocate().await.unwrap();

        assert!(pool.is_checked_out(&token).await);
        assert!(pool.release(&token).await);
        assert!(!pool.is_checked_out(&token).await);
        assert_eq!(pool.checked_out().await, 0);

        // A second release of the same token is flagged as a no-op.
        assert!(!pool.release(&token).await);
    }

    #[tokio::test]
    async fn test_saturation_widens_instead_of_duplicating() {
        // Only 62 distinct single-character tokens exist, so allocating 70
        // forces the pool past the base length.
        let pool = TokenPool::new(1);
        let mut seen = HashSet::new();
        let mut widened = 0;

        for _ in 0..70 {
            let token = pool.allocate().await.unwrap();
            if token.len() > 1 {
                widened += 1;
            }
            assert!(seen.insert(token), "duplicate token under saturation");
        }

        assert!(widened >= 8);
        assert_eq!(pool.checked_out().await, 70);
    }

    #[tokio::test]
    async fn test_concurrent_allocations_do_not_collide() {
        let pool = std::sync::Arc::new(TokenPool::new(5));
        let mut handles = Vec::new();

        for _ in 0..8 {
            let pool = std::sync::Arc::clone(&pool);
            handles.push(tokio::spawn(async move {
                let mut tokens = Vec::new();
                for _ in 0..25 {
                    tokens.push(pool.allocate().await.unwrap());
                }
                tokens
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for token in handle.await.unwrap() {
                assert!(seen.insert(token), "duplicate token across tasks");
            }
        }
        assert_eq!(seen.len(), 200);
    }
}
