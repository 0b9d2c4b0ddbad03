//! Transaction correlation table
//!
//! Requests that expect an Ack/Nack park on [`TransactionMap::wait_for`] under
//! their transaction UID; the dispatch task deposits the matching reply with
//! [`TransactionMap::insert`]. Waiting polls with a doubling interval rather
//! than a condition variable, which keeps first-response latency at one poll
//! tick while amortizing wake-ups on slow replies.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::error::{Error, Result};
use crate::message::Message;

/// First poll interval of [`TransactionMap::wait_for`]; doubles each tick.
pub const FIRST_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Concurrent map from transaction UID to the reply message
#[derive(Debug, Default)]
pub struct TransactionMap {
    entries: RwLock<HashMap<String, Message>>,
}

impl TransactionMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deposit a reply. Overwrites any existing entry, never blocks.
    pub fn insert(&self, uid: &str, message: Message) {
        let mut entries = self.entries.write().expect("transaction map poisoned");
        entries.insert(uid.to_string(), message);
    }

    /// Remove an entry, silently ignoring absent keys.
    pub fn remove(&self, uid: &str) {
        let mut entries = self.entries.write().expect("transaction map poisoned");
        entries.remove(uid);
    }

    fn take(&self, uid: &str) -> Option<Message> {
        let mut entries = self.entries.write().expect("transaction map poisoned");
        entries.remove(uid)
    }

    /// Block until the reply keyed by `uid` arrives or `timeout` expires.
    ///
    /// Consumes the entry on success. On expiry the entry is deleted even if
    /// the reply lands later, so late replies are dropped by the depositor's
    /// next consumer finding nothing to wake.
    pub async fn wait_for(&self, uid: &str, timeout: Duration) -> Result<Message> {
        let deadline = Instant::now() + timeout;
        let mut interval = FIRST_POLL_INTERVAL;

        if let Some(message) = self.take(uid) {
            return Ok(message);
        }

        loop {
            let now = Instant::now();
            if now >= deadline {
                debug!(%uid, ?timeout, "transaction wait expired");
                self.remove(uid);
                return Err(Error::Timeout(uid.to_string()));
            }

            tokio::time::sleep(interval.min(deadline - now)).await;

            if let Some(message) = self.take(uid) {
                return Ok(message);
            }
            interval *= 2;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Instant as StdInstant;

    use super::*;
    use crate::message::MessageType;

    fn ack(uid: &str) -> Message {
        let mut message = Message::new(MessageType::Ack);
        message.transaction_uid = uid.parse().unwrap_or_default();
        message
    }

    #[tokio::test]
    async fn test_wait_for_returns_preexisting_entry() {
        let map = TransactionMap::new();
        map.insert("uid-1", Message::new(MessageType::Ack));

        let start = StdInstant::now();
        let reply = map.wait_for("uid-1", Duration::from_secs(5)).await.unwrap();
        assert_eq!(reply.msg_type, MessageType::Ack);
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_wait_for_consumes_entry() {
        let map = TransactionMap::new();
        map.insert("uid-1", Message::new(MessageType::Nack));

        map.wait_for("uid-1", Duration::from_secs(1)).await.unwrap();

        // A second wait on the same uid must time out
        let err = map.wait_for("uid-1", Duration::from_millis(100)).await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_wait_for_times_out_within_one_interval() {
        let map = TransactionMap::new();
        let timeout = Duration::from_millis(300);

        let start = StdInstant::now();
        let err = map.wait_for("missing", timeout).await.unwrap_err();
        let elapsed = start.elapsed();

        assert!(err.is_timeout());
        assert!(elapsed >= timeout, "returned early: {elapsed:?}");
        assert!(
            elapsed < timeout + FIRST_POLL_INTERVAL,
            "returned too late: {elapsed:?}"
        );
    }

    #[tokio::test]
    async fn test_wait_for_picks_up_concurrent_insert() {
        let map = Arc::new(TransactionMap::new());

        let depositor = map.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            depositor.insert("uid-1", ack("uid-1"));
        });

        let start = StdInstant::now();
        let reply = map.wait_for("uid-1", Duration::from_secs(5)).await.unwrap();
        assert_eq!(reply.msg_type, MessageType::Ack);
        // Picked up on the first 500 ms tick
        assert!(start.elapsed() < Duration::from_millis(900));
    }

    #[tokio::test]
    async fn test_remove_is_silent_on_missing_key() {
        let map = TransactionMap::new();
        map.remove("never-inserted");
    }

    #[tokio::test]
    async fn test_insert_overwrites() {
        let map = TransactionMap::new();
        map.insert("uid-1", Message::new(MessageType::Nack));
        map.insert("uid-1", Message::new(MessageType::Ack));

        let reply = map.wait_for("uid-1", Duration::from_secs(1)).await.unwrap();
        assert_eq!(reply.msg_type, MessageType::Ack);
    }
}
