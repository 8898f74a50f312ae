//! Single-use, time-boxed one-time passes for WebSocket upgrades
//!
//! The authenticated HTTP layer issues an OTP, the client presents it once
//! in the upgrade query string. A key is valid until it is consumed or its
//! retention period elapses, whichever comes first. Every operation takes
//! the same exclusive lock; validation always mutates so a read/write split
//! would buy nothing.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::{TryRngCore, rngs::OsRng};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{
    sync::Mutex,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Number of random bytes behind each key
const KEY_BYTES: usize = 32;

/// Attempts at reading the OS random source before giving up
const RNG_ATTEMPTS: u32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum OtpError {
    #[error("failed to generate a one-time pass: {0}")]
    RandomGenerationFailed(String),
}

/// An issued one-time pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Otp {
    pub key: String,
    pub created_at: Instant,
}

/// Retention map of outstanding OTPs
#[derive(Debug)]
pub struct OtpStore {
    entries: Mutex<HashMap<String, Instant>>,
    retention: Duration,
}

impl OtpStore {
    pub fn new(retention: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            retention,
        }
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Issue a fresh OTP
    pub async fn issue(&self) -> Result<Otp, OtpError> {
        let otp = Otp {
            key: generate_key().await?,
            created_at: Instant::now(),
        };
        self.entries
            .lock()
            .await
            .insert(otp.key.clone(), otp.created_at);
        Ok(otp)
    }

    /// Consume `key`, returning whether it was valid
    ///
    /// Unknown, already consumed and expired keys are all `false`. An expired
    /// key that the sweeper has not reached yet is removed here as well.
    pub async fn validate_and_consume(&self, key: &str) -> bool {
        let mut entries = self.entries.lock().await;
        match entries.remove(key) {
            Some(created_at) => created_at.elapsed() <= self.retention,
            None => false,
        }
    }

    /// Drop every entry older than the retention period
    pub async fn sweep(&self) -> usize {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, created_at| created_at.elapsed() <= self.retention);
        before - entries.len()
    }

    /// Number of outstanding keys
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Spawn the background sweep, running until `cancel` fires
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        every: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        debug!("OTP sweeper stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        let removed = store.sweep().await;
                        if removed > 0 {
                            debug!(removed, "swept expired OTPs");
                        }
                    }
                }
            }
        })
    }
}

/// Random URL-safe key from the OS random source, retried with a short
/// backoff on transient failures
async fn generate_key() -> Result<String, OtpError> {
    let mut bytes = [0u8; KEY_BYTES];
    let mut attempt = 1;
    loop {
        match OsRng.try_fill_bytes(&mut bytes) {
            Ok(()) => return Ok(URL_SAFE_NO_PAD.encode(bytes)),
            Err(e) if attempt < RNG_ATTEMPTS => {
                warn!(attempt, error = %e, "OS random source failed, retrying");
                tokio::time::sleep(Duration::from_millis(10 * u64::from(attempt))).await;
                attempt += 1;
            }
            Err(e) => {
                error!(attempts = attempt, error = %e, "OS random source unavailable");
                return Err(OtpError::RandomGenerationFailed(e.to_string()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[tokio::test]
    async fn test_otp_is_single_use() {
        let store = OtpStore::new(Duration::from_secs(5));
        let otp = store.issue().await.unwrap();

        assert!(store.validate_and_consume(&otp.key).await);
        assert!(!store.validate_and_consume(&otp.key).await);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_unknown_key_is_rejected() {
        let store = OtpStore::new(Duration::from_secs(5));
        store.issue().await.unwrap();
        assert!(!store.validate_and_consume("never-issued").await);
        assert!(!store.validate_and_consume("").await);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_keys_are_url_safe_and_distinct() {
        let store = OtpStore::new(Duration::from_secs(5));
        let a = store.issue().await.unwrap();
        let b = store.issue().await.unwrap();
        assert_ne!(a.key, b.key);
        assert_eq!(a.key.len(), 43);
        assert!(
            a.key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_key_is_rejected_without_sweep() {
        let store = OtpStore::new(Duration::from_secs(5));
        let otp = store.issue().await.unwrap();

        tokio::time::advance(Duration::from_secs(5) + Duration::from_millis(1)).await;

        assert!(!store.validate_and_consume(&otp.key).await);
        assert!(store.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_removes_only_expired_keys() {
        let store = OtpStore::new(Duration::from_secs(5));
        let old = store.issue().await.unwrap();
        tokio::time::advance(Duration::from_secs(3)).await;
        let fresh = store.issue().await.unwrap();
        tokio::time::advance(Duration::from_secs(3)).await;

        assert_eq!(store.sweep().await, 1);
        assert!(!store.validate_and_consume(&old.key).await);
        assert!(store.validate_and_consume(&fresh.key).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_runs_until_cancelled() {
        let store = Arc::new(OtpStore::new(Duration::from_secs(1)));
        let cancel = CancellationToken::new();
        let handle = store.spawn_sweeper(Duration::from_millis(400), cancel.clone());

        store.issue().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(store.is_empty().await);

        cancel.cancel();
        handle.await.unwrap();

        store.issue().await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(store.len().await, 1);
    }

    proptest! {
        #[test]
        fn prop_every_issued_key_validates_exactly_once(count in 1usize..40) {
            tokio_test::block_on(async {
                let store = OtpStore::new(Duration::from_secs(60));
                let mut keys = Vec::with_capacity(count);
                for _ in 0..count {
                    keys.push(store.issue().await.unwrap().key);
                }

                for key in &keys {
                    assert!(store.validate_and_consume(key).await);
                }
                for key in &keys {
                    assert!(!store.validate_and_consume(key).await);
                }
                assert!(store.is_empty().await);
            });
        }
    }
}
