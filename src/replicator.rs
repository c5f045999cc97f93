//! Replicator
//!
//! Pulls records from every known peer into the local log. Each peer gets
//! exactly one streaming task; membership drives it through [`Handler`].
//!
//! A task asks its peer only for records the peer originated, starting
//! after the highest one already held locally. Records therefore never
//! bounce back to where they came from, and a restarted node resumes where
//! it stopped. The resume point names the peer's log instance; a peer that
//! returns with a fresh log under the same name is streamed from the start.

use crate::commitlog::{CommitLog, LogError, Watermark};
use crate::discovery::Handler;
use crate::server::{ClientError, RecordStream};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot};
use tracing::Instrument;

/// Opens record streams to peers.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Stream records originated by `origin` from the peer at `addr`,
    /// starting after `from`, or from the first record when `from` is
    /// `None` or belongs to a log the peer no longer runs.
    async fn stream_records(
        &self,
        addr: &str,
        origin: &str,
        from: Option<&Watermark>,
    ) -> Result<RecordStream, ClientError>;
}

/// Replicator errors.
#[derive(Debug, thiserror::Error)]
pub enum ReplicatorError {}

/// Replicator settings.
#[derive(Debug, Clone)]
pub struct ReplicatorConfig {
    /// Consecutive local append failures after which a peer task gives up
    pub max_append_failures: u32,
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            max_append_failures: 16,
        }
    }
}

struct Tracked {
    generation: u64,
    leave_tx: oneshot::Sender<()>,
}

#[derive(Default)]
struct State {
    peers: HashMap<String, Tracked>,
    closed: bool,
    next_generation: u64,
}

struct Shared {
    log: Arc<dyn CommitLog>,
    connector: Arc<dyn PeerConnector>,
    config: ReplicatorConfig,
    state: Mutex<State>,
    close_tx: broadcast::Sender<()>,
}

/// Why a replication task stopped.
#[derive(Debug)]
enum Exit {
    Cancelled,
    PeerClosed,
    Stream(ClientError),
    Log(LogError),
    AppendFailures(LogError),
}

/// Keeps one replication task running per joined peer.
#[derive(Clone)]
pub struct Replicator {
    shared: Arc<Shared>,
}

impl Replicator {
    pub fn new(log: Arc<dyn CommitLog>, connector: Arc<dyn PeerConnector>) -> Self {
        Self::with_config(log, connector, ReplicatorConfig::default())
    }

    pub fn with_config(
        log: Arc<dyn CommitLog>,
        connector: Arc<dyn PeerConnector>,
        config: ReplicatorConfig,
    ) -> Self {
        let (close_tx, _) = broadcast::channel(1);
        Self {
            shared: Arc::new(Shared {
                log,
                connector,
                config,
                state: Mutex::new(State::default()),
                close_tx,
            }),
        }
    }

    /// Stop every task and refuse further joins. Idempotent.
    pub fn close(&self) -> Result<(), ReplicatorError> {
        let peers = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            std::mem::take(&mut state.peers)
        };

        let _ = self.shared.close_tx.send(());
        for (_, tracked) in peers {
            let _ = tracked.leave_tx.send(());
        }
        tracing::info!("replicator closed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Names of peers with a running task, sorted.
    pub fn peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self.shared.state.lock().peers.keys().cloned().collect();
        peers.sort();
        peers
    }
}

impl Handler for Replicator {
    fn join(&self, name: &str, addr: &str) -> anyhow::Result<()> {
        let (generation, leave_rx, close_rx) = {
            let mut state = self.shared.state.lock();
            if state.closed || state.peers.contains_key(name) {
                return Ok(());
            }
            state.next_generation += 1;
            let generation = state.next_generation;
            let (leave_tx, leave_rx) = oneshot::channel();
            state.peers.insert(
                name.to_string(),
                Tracked {
                    generation,
                    leave_tx,
                },
            );
            (generation, leave_rx, self.shared.close_tx.subscribe())
        };

        tracing::info!(peer = %name, %addr, "starting replication");
        let shared = self.shared.clone();
        let name = name.to_string();
        let addr = addr.to_string();
        tokio::spawn(
            async move {
                shared
                    .replicate(name, addr, generation, leave_rx, close_rx)
                    .await
            }
            .in_current_span(),
        );
        Ok(())
    }

    fn leave(&self, name: &str) -> anyhow::Result<()> {
        let tracked = self.shared.state.lock().peers.remove(name);
        if let Some(tracked) = tracked {
            let _ = tracked.leave_tx.send(());
            tracing::info!(peer = %name, "stopping replication");
        }
        Ok(())
    }
}

impl Shared {
    async fn replicate(
        &self,
        name: String,
        addr: String,
        generation: u64,
        mut leave_rx: oneshot::Receiver<()>,
        mut close_rx: broadcast::Receiver<()>,
    ) {
        let exit = self
            .stream_from_peer(&name, &addr, &mut leave_rx, &mut close_rx)
            .await;

        match &exit {
            Exit::Cancelled => {
                tracing::debug!(peer = %name, "replication cancelled");
                return;
            }
            Exit::PeerClosed => tracing::info!(peer = %name, "peer closed replication stream"),
            Exit::Stream(e) => tracing::warn!(peer = %name, %addr, error = %e, "replication stream failed"),
            Exit::Log(e) => tracing::error!(peer = %name, error = %e, "cannot read local log"),
            Exit::AppendFailures(e) => tracing::error!(
                peer = %name,
                failures = self.config.max_append_failures,
                error = %e,
                "giving up after repeated append failures"
            ),
        }
        self.forget(&name, generation);
    }

    async fn stream_from_peer(
        &self,
        name: &str,
        addr: &str,
        leave_rx: &mut oneshot::Receiver<()>,
        close_rx: &mut broadcast::Receiver<()>,
    ) -> Exit {
        let from = match self.log.origin_watermark(name) {
            Ok(mark) => mark,
            Err(e) => return Exit::Log(e),
        };

        let mut stream = tokio::select! {
            biased;
            _ = &mut *leave_rx => return Exit::Cancelled,
            _ = close_rx.recv() => return Exit::Cancelled,
            connected = self.connector.stream_records(addr, name, from.as_ref()) => match connected {
                Ok(stream) => stream,
                Err(e) => return Exit::Stream(e),
            },
        };
        tracing::debug!(peer = %name, after = ?from, "replication stream open");

        let mut failures = 0u32;
        loop {
            let record = tokio::select! {
                biased;
                _ = &mut *leave_rx => return Exit::Cancelled,
                _ = close_rx.recv() => return Exit::Cancelled,
                next = stream.next() => match next {
                    Some(Ok(record)) => record,
                    Some(Err(e)) => return Exit::Stream(e),
                    None => return Exit::PeerClosed,
                },
            };

            if record.origin != name {
                tracing::warn!(peer = %name, origin = %record.origin, "ignoring record from foreign origin");
                continue;
            }

            let origin_offset = record.origin_offset;
            match self.log.append(record) {
                Ok(offset) => {
                    failures = 0;
                    tracing::trace!(peer = %name, origin_offset, offset, "replicated record");
                }
                Err(LogError::Duplicate { .. }) => {
                    failures = 0;
                    tracing::trace!(peer = %name, origin_offset, "record already present");
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!(peer = %name, origin_offset, failures, error = %e, "failed to append replicated record");
                    if failures >= self.config.max_append_failures {
                        return Exit::AppendFailures(e);
                    }
                }
            }
        }
    }

    /// Drop the tracking entry, unless a newer task already owns it.
    fn forget(&self, name: &str, generation: u64) {
        let mut state = self.state.lock();
        if state
            .peers
            .get(name)
            .is_some_and(|tracked| tracked.generation == generation)
        {
            state.peers.remove(name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commitlog::{LogConfig, Record, SqliteLog};
    use futures::stream;
    use std::collections::VecDeque;
    use std::time::Duration;
    use tokio::sync::mpsc;

    type Feed = mpsc::UnboundedSender<Result<Record, ClientError>>;

    type Call = (String, String, Option<Watermark>);

    #[derive(Default)]
    struct MockConnector {
        calls: Mutex<Vec<Call>>,
        streams: Mutex<VecDeque<mpsc::UnboundedReceiver<Result<Record, ClientError>>>>,
    }

    impl MockConnector {
        /// Queue a stream for the next connect and return its feed.
        fn queue(&self) -> Feed {
            let (tx, rx) = mpsc::unbounded_channel();
            self.streams.lock().push_back(rx);
            tx
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl PeerConnector for MockConnector {
        async fn stream_records(
            &self,
            addr: &str,
            origin: &str,
            from: Option<&Watermark>,
        ) -> Result<RecordStream, ClientError> {
            self.calls
                .lock()
                .push((addr.to_string(), origin.to_string(), from.cloned()));
            let rx = self
                .streams
                .lock()
                .pop_front()
                .ok_or(ClientError::Disconnected)?;
            Ok(stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed())
        }
    }

    fn local_log() -> Arc<SqliteLog> {
        Arc::new(
            SqliteLog::in_memory(LogConfig {
                origin: "a".to_string(),
            })
            .unwrap(),
        )
    }

    fn from_b(value: &str, origin_offset: u64) -> Record {
        from_b_instance("b-1", value, origin_offset)
    }

    fn from_b_instance(instance: &str, value: &str, origin_offset: u64) -> Record {
        Record {
            value: value.as_bytes().to_vec(),
            offset: 0,
            origin: "b".to_string(),
            origin_instance: instance.to_string(),
            origin_offset,
        }
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not met in time");
    }

    fn setup() -> (Arc<SqliteLog>, Arc<MockConnector>, Replicator) {
        let log = local_log();
        let connector = Arc::new(MockConnector::default());
        let replicator = Replicator::new(log.clone(), connector.clone());
        (log, connector, replicator)
    }

    #[tokio::test]
    async fn test_join_is_idempotent() {
        let (_log, connector, replicator) = setup();
        let _feed = connector.queue();

        replicator.join("b", "127.0.0.1:7001").unwrap();
        replicator.join("b", "127.0.0.1:7001").unwrap();

        eventually(|| connector.calls().len() == 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(connector.calls().len(), 1);
        assert_eq!(replicator.peers(), vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn test_records_appended_in_stream_order() {
        let (log, connector, replicator) = setup();
        let feed = connector.queue();
        replicator.join("b", "127.0.0.1:7001").unwrap();

        for (i, value) in ["first", "second", "third"].iter().enumerate() {
            feed.send(Ok(from_b(value, i as u64))).unwrap();
        }

        eventually(|| log.next_offset().unwrap() == 3).await;
        for (offset, value) in ["first", "second", "third"].iter().enumerate() {
            let record = log.read(offset as u64).unwrap();
            assert_eq!(record.value, value.as_bytes());
            assert_eq!(record.origin, "b");
        }
        assert_eq!(connector.calls()[0], ("127.0.0.1:7001".to_string(), "b".to_string(), None));
    }

    #[tokio::test]
    async fn test_resumes_after_local_watermark() {
        let (log, connector, replicator) = setup();
        log.append(from_b("seen", 4)).unwrap();
        let _feed = connector.queue();

        replicator.join("b", "127.0.0.1:7001").unwrap();
        eventually(|| !connector.calls().is_empty()).await;
        assert_eq!(
            connector.calls()[0].2,
            Some(Watermark {
                instance: "b-1".to_string(),
                offset: 4
            })
        );
    }

    #[tokio::test]
    async fn test_peer_with_fresh_log_replicates_from_start() {
        let (log, connector, replicator) = setup();
        for i in 0..3 {
            log.append(from_b("old", i)).unwrap();
        }

        // The peer restarted with an empty log; its offsets begin again at 0
        let feed = connector.queue();
        replicator.join("b", "127.0.0.1:7001").unwrap();
        feed.send(Ok(from_b_instance("b-2", "new0", 0))).unwrap();
        feed.send(Ok(from_b_instance("b-2", "new1", 1))).unwrap();

        eventually(|| log.next_offset().unwrap() == 5).await;
        assert_eq!(log.read(3).unwrap().value, b"new0");
        assert_eq!(log.read(4).unwrap().value, b"new1");
        assert_eq!(
            log.origin_watermark("b").unwrap(),
            Some(Watermark {
                instance: "b-2".to_string(),
                offset: 1
            })
        );
    }

    #[tokio::test]
    async fn test_duplicates_are_tolerated() {
        let (log, connector, replicator) = setup();
        let feed = connector.queue();
        replicator.join("b", "127.0.0.1:7001").unwrap();

        feed.send(Ok(from_b("once", 0))).unwrap();
        feed.send(Ok(from_b("once", 0))).unwrap();
        feed.send(Ok(from_b("twice", 1))).unwrap();

        eventually(|| log.next_offset().unwrap() == 2).await;
        assert_eq!(replicator.peers(), vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn test_leave_stops_task() {
        let (_log, connector, replicator) = setup();
        let feed = connector.queue();
        replicator.join("b", "127.0.0.1:7001").unwrap();
        eventually(|| connector.calls().len() == 1).await;

        replicator.leave("b").unwrap();
        assert!(replicator.peers().is_empty());
        eventually(|| feed.is_closed()).await;

        // Leaving an untracked peer is a no-op
        replicator.leave("b").unwrap();
        replicator.leave("nobody").unwrap();
    }

    #[tokio::test]
    async fn test_leave_immediately_after_join() {
        let (_log, connector, replicator) = setup();
        let feed = connector.queue();

        replicator.join("b", "127.0.0.1:7001").unwrap();
        replicator.leave("b").unwrap();
        assert!(replicator.peers().is_empty());

        // Whether or not the task got to connect, nothing stays open
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(connector.calls().len() <= 1);
        assert!(connector.calls().is_empty() || feed.is_closed());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_final() {
        let (_log, connector, replicator) = setup();
        let feed_b = connector.queue();
        let feed_c = connector.queue();
        replicator.join("b", "127.0.0.1:7001").unwrap();
        replicator.join("c", "127.0.0.1:7002").unwrap();
        eventually(|| connector.calls().len() == 2).await;

        replicator.close().unwrap();
        replicator.close().unwrap();
        assert!(replicator.is_closed());
        assert!(replicator.peers().is_empty());
        eventually(|| feed_b.is_closed() && feed_c.is_closed()).await;

        replicator.join("d", "127.0.0.1:7003").unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(connector.calls().len(), 2);
        assert!(replicator.peers().is_empty());
    }

    #[tokio::test]
    async fn test_stream_error_allows_rejoin() {
        let (_log, connector, replicator) = setup();
        let feed = connector.queue();
        replicator.join("b", "127.0.0.1:7001").unwrap();
        eventually(|| connector.calls().len() == 1).await;

        feed.send(Err(ClientError::Disconnected)).unwrap();
        eventually(|| replicator.peers().is_empty()).await;

        let _again = connector.queue();
        replicator.join("b", "127.0.0.1:7001").unwrap();
        eventually(|| connector.calls().len() == 2).await;
        assert_eq!(replicator.peers(), vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn test_connect_failure_untracks_peer() {
        let (_log, connector, replicator) = setup();
        replicator.join("b", "127.0.0.1:7001").unwrap();
        eventually(|| replicator.peers().is_empty()).await;
        assert_eq!(connector.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_repeated_append_failures_end_task() {
        let log = local_log();
        let connector = Arc::new(MockConnector::default());
        let replicator = Replicator::with_config(
            log.clone(),
            connector.clone(),
            ReplicatorConfig {
                max_append_failures: 2,
            },
        );
        let feed = connector.queue();
        replicator.join("b", "127.0.0.1:7001").unwrap();
        eventually(|| connector.calls().len() == 1).await;

        log.close().unwrap();
        feed.send(Ok(from_b("lost", 0))).unwrap();
        feed.send(Ok(from_b("lost", 1))).unwrap();

        eventually(|| replicator.peers().is_empty()).await;
        eventually(|| feed.is_closed()).await;
    }
}
