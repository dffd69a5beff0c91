//! Channel Pool
//!
//! Per-peer multiplexing of a bounded number of physical connections.
//! A subject hashes deterministically onto one of N shared slots, so all
//! traffic for one subject funnels through the same connection and stays
//! FIFO, while unrelated subjects spread across the pool. Subjects that
//! must not share head-of-line with other traffic get a dedicated
//! connection instead.
//!
//! Slot mutation is synchronized per slot: concurrent requesters for the
//! same slot wait on the same in-flight dial instead of opening duplicate
//! sockets, and contention never spans peers.

use crate::address::Address;
use crate::connection::remote::RemoteClientConnection;
use crate::error::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

type Slot = Arc<tokio::sync::Mutex<Option<Arc<RemoteClientConnection>>>>;

/// Connection slots for one peer: the hashed shared pool plus dedicated
/// per-subject channels. Created lazily on first use and kept for the
/// lifetime of the process; failed connections are cleared and lazily
/// re-dialed, never proactively swept.
struct ChannelsForAddress {
    shared: Vec<Slot>,
    dedicated: Mutex<HashMap<String, Slot>>,
}

impl ChannelsForAddress {
    fn new(pool_size: usize) -> Arc<Self> {
        Arc::new(Self {
            shared: (0..pool_size).map(|_| Slot::default()).collect(),
            dedicated: Mutex::new(HashMap::new()),
        })
    }
}

/// Pool of client connections, keyed by peer address
pub(crate) struct ChannelPool {
    pool_size: usize,
    channels: Mutex<HashMap<Address, Arc<ChannelsForAddress>>>,
}

impl ChannelPool {
    pub fn new(pool_size: usize) -> Self {
        Self {
            pool_size,
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve a usable connection for `(address, subject)`, dialing at
    /// most once per slot. `open` runs only when the slot is empty or its
    /// occupant has failed; concurrent callers for the same slot queue on
    /// the slot lock and observe the winner's connection.
    pub async fn get_channel<F, Fut>(
        &self,
        address: &Address,
        subject: &str,
        dedicated: bool,
        open: F,
    ) -> Result<Arc<RemoteClientConnection>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<RemoteClientConnection>>>,
    {
        let per_address = {
            let mut channels = self.channels.lock();
            Arc::clone(
                channels
                    .entry(address.clone())
                    .or_insert_with(|| ChannelsForAddress::new(self.pool_size)),
            )
        };

        let slot = if dedicated {
            let mut dedicated_slots = per_address.dedicated.lock();
            Arc::clone(
                dedicated_slots
                    .entry(subject.to_owned())
                    .or_default(),
            )
        } else {
            Arc::clone(&per_address.shared[self.slot_index(subject)])
        };

        let mut guard = slot.lock().await;
        if let Some(existing) = guard.as_ref() {
            if !existing.is_closed() {
                return Ok(Arc::clone(existing));
            }
            debug!(%address, subject, "pooled connection failed, re-dialing");
            *guard = None;
        }

        let connection = open().await?;
        *guard = Some(Arc::clone(&connection));
        spawn_eviction(Arc::clone(&slot), Arc::clone(&connection));
        Ok(connection)
    }

    fn slot_index(&self, subject: &str) -> usize {
        crc32fast::hash(subject.as_bytes()) as usize % self.pool_size
    }

    /// Number of live pooled connections, for diagnostics and tests
    pub fn active_channels(&self) -> usize {
        let per_address: Vec<Arc<ChannelsForAddress>> =
            self.channels.lock().values().cloned().collect();
        let mut count = 0;
        for channels in per_address {
            for slot in &channels.shared {
                if let Ok(guard) = slot.try_lock() {
                    if guard.as_ref().is_some_and(|c| !c.is_closed()) {
                        count += 1;
                    }
                }
            }
            let dedicated: Vec<Slot> = channels.dedicated.lock().values().cloned().collect();
            for slot in dedicated {
                if let Ok(guard) = slot.try_lock() {
                    if guard.as_ref().is_some_and(|c| !c.is_closed()) {
                        count += 1;
                    }
                }
            }
        }
        count
    }

    /// Drop all per-peer state; used on service shutdown
    pub fn clear(&self) {
        self.channels.lock().clear();
    }
}

/// Compare-and-clear the slot when its occupant closes, so a newer
/// replacement that raced in is never evicted by a stale close event.
fn spawn_eviction(slot: Slot, connection: Arc<RemoteClientConnection>) {
    let mut closed = connection.closed();
    tokio::spawn(async move {
        while !*closed.borrow() {
            if closed.changed().await.is_err() {
                break;
            }
        }
        let mut guard = slot.lock().await;
        if let Some(current) = guard.as_ref() {
            if Arc::ptr_eq(current, &connection) {
                *guard = None;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompressionAlgorithm;
    use crate::connection::remote::CloseReason;
    use crate::protocol::ProtocolVersion;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn test_connection() -> Arc<RemoteClientConnection> {
        let (local, remote) = tokio::io::duplex(1024);
        // keep the peer end open so the connection does not see EOF
        std::mem::forget(remote);
        let version = ProtocolVersion::V2;
        RemoteClientConnection::spawn(
            Box::new(local),
            Address::local(26502),
            version.new_encoder(
                Address::local(1),
                "127.0.0.1".parse().unwrap(),
                CompressionAlgorithm::None,
            ),
            version.new_decoder(CompressionAlgorithm::None, 16 << 20),
        )
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_dial() {
        let pool = Arc::new(ChannelPool::new(8));
        let address = Address::local(26502);
        let dials = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let pool = Arc::clone(&pool);
            let address = address.clone();
            let dials = Arc::clone(&dials);
            tasks.push(tokio::spawn(async move {
                pool.get_channel(&address, "same-subject", false, || async move {
                    dials.fetch_add(1, Ordering::SeqCst);
                    // slow dial widens the race window
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok(test_connection())
                })
                .await
                .unwrap()
            }));
        }

        let mut connections = Vec::new();
        for task in tasks {
            connections.push(task.await.unwrap());
        }

        assert_eq!(dials.load(Ordering::SeqCst), 1, "duplicate dials");
        for connection in &connections[1..] {
            assert!(Arc::ptr_eq(&connections[0], connection));
        }
    }

    #[tokio::test]
    async fn same_subject_pins_to_the_same_slot() {
        let pool = ChannelPool::new(8);
        let address = Address::local(26502);

        let first = pool
            .get_channel(&address, "subject-a", false, || async {
                Ok(test_connection())
            })
            .await
            .unwrap();
        let second = pool
            .get_channel(&address, "subject-a", false, || async {
                panic!("slot already occupied, open must not run")
            })
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn dedicated_channels_bypass_the_shared_pool() {
        let pool = ChannelPool::new(8);
        let address = Address::local(26502);

        let shared = pool
            .get_channel(&address, "bulk-transfer", false, || async {
                Ok(test_connection())
            })
            .await
            .unwrap();
        let dedicated = pool
            .get_channel(&address, "bulk-transfer", true, || async {
                Ok(test_connection())
            })
            .await
            .unwrap();
        assert!(!Arc::ptr_eq(&shared, &dedicated));

        // the dedicated slot is reused on the next request
        let again = pool
            .get_channel(&address, "bulk-transfer", true, || async {
                panic!("dedicated slot already occupied")
            })
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&dedicated, &again));
    }

    #[tokio::test]
    async fn failed_connections_are_replaced() {
        let pool = ChannelPool::new(8);
        let address = Address::local(26502);
        let dials = Arc::new(AtomicUsize::new(0));

        let dials_first = Arc::clone(&dials);
        let first = pool
            .get_channel(&address, "subject", false, || async move {
                dials_first.fetch_add(1, Ordering::SeqCst);
                Ok(test_connection())
            })
            .await
            .unwrap();

        first.close(CloseReason::Error);

        let dials_second = Arc::clone(&dials);
        let second = pool
            .get_channel(&address, "subject", false, || async move {
                dials_second.fetch_add(1, Ordering::SeqCst);
                Ok(test_connection())
            })
            .await
            .unwrap();

        assert_eq!(dials.load(Ordering::SeqCst), 2);
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn closed_channels_are_evicted_from_their_slot() {
        let pool = ChannelPool::new(8);
        let address = Address::local(26502);

        let connection = pool
            .get_channel(&address, "subject", false, || async {
                Ok(test_connection())
            })
            .await
            .unwrap();
        assert_eq!(pool.active_channels(), 1);

        connection.close(CloseReason::Error);
        // eviction runs asynchronously off the close signal
        tokio::time::timeout(Duration::from_secs(1), async {
            while pool.active_channels() != 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("closed channel was not evicted");
    }

    #[tokio::test]
    async fn dial_failures_propagate_and_leave_the_slot_empty() {
        let pool = ChannelPool::new(8);
        let address = Address::local(26502);

        let result = pool
            .get_channel(&address, "subject", false, || async {
                Err(crate::error::MessagingError::connect_msg(
                    "127.0.0.1:26502",
                    "connection refused",
                ))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(pool.active_channels(), 0);

        // the next caller re-dials
        let connection = pool
            .get_channel(&address, "subject", false, || async {
                Ok(test_connection())
            })
            .await;
        assert!(connection.is_ok());
    }
}
