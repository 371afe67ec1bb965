#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **toka-kv-log-memory** - in-memory [`LogClient`] fake for Toka KV.
//!
//! Mirrors a JetStream-style log just well enough for tests: durable
//! per-stream ordering, per-subject purge, and a pull consumer that replays
//! from an arbitrary sequence and then tails live publishes. Nothing here
//! survives process exit; this exists so a [`toka_kv::Projector`] (and the
//! properties it's meant to uphold) can be exercised without a real NATS
//! server.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, RwLock};

use toka_kv_types::{
    error::KvError,
    log::{LogClient, LogConsumer, LogMessage},
};

const DEFAULT_BUFFER: usize = 1024;

#[derive(Clone)]
struct Entry {
    seq: u64,
    subject: String,
    payload: Vec<u8>,
}

struct StreamState {
    entries: Vec<Entry>,
    tx: broadcast::Sender<LogMessage>,
}

impl StreamState {
    fn new() -> Self {
        let (tx, _rx) = broadcast::channel(DEFAULT_BUFFER);
        Self {
            entries: Vec::new(),
            tx,
        }
    }
}

/// An in-memory, per-process fake of a JetStream-style durable log.
///
/// Streams are created on first [`LogClient::ensure_stream`] and live for as
/// long as the client does. Multiple [`MemoryLogClient`] handles cloned from
/// the same origin share state, so tests can simulate two `Base` instances
/// (or a restart) tailing the same simulated log.
#[derive(Clone, Default)]
pub struct MemoryLogClient {
    streams: Arc<RwLock<HashMap<String, Arc<RwLock<StreamState>>>>>,
}

impl MemoryLogClient {
    /// Creates a new, empty log with no streams.
    pub fn new() -> Self {
        Self::default()
    }

    async fn stream(&self, stream: &str) -> Result<Arc<RwLock<StreamState>>, KvError> {
        self.streams
            .read()
            .await
            .get(stream)
            .cloned()
            .ok_or_else(|| KvError::LogUnavailable(format!("stream {stream} does not exist")))
    }
}

#[async_trait]
impl LogClient for MemoryLogClient {
    async fn ensure_stream(&self, stream: &str) -> Result<(), KvError> {
        self.streams
            .write()
            .await
            .entry(stream.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(StreamState::new())));
        Ok(())
    }

    async fn publish(&self, stream: &str, subject: &str, payload: Vec<u8>) -> Result<u64, KvError> {
        let state = self.stream(stream).await?;
        let mut state = state.write().await;
        let seq = state.entries.len() as u64 + 1;
        let msg = LogMessage {
            seq,
            payload: payload.clone(),
            time: Utc::now(),
        };
        state.entries.push(Entry {
            seq,
            subject: subject.to_string(),
            payload,
        });
        let _ = state.tx.send(msg);
        Ok(seq)
    }

    async fn last_seq(&self, stream: &str) -> Result<u64, KvError> {
        let state = self.stream(stream).await?;
        Ok(state.read().await.entries.len() as u64)
    }

    async fn open_consumer(
        &self,
        stream: &str,
        start_seq: u64,
    ) -> Result<Box<dyn LogConsumer>, KvError> {
        let state = self.stream(stream).await?;
        let guard = state.read().await;
        let rx = guard.tx.subscribe();
        let historical: VecDeque<LogMessage> = guard
            .entries
            .iter()
            .filter(|e| e.seq >= start_seq)
            .map(|e| LogMessage {
                seq: e.seq,
                payload: e.payload.clone(),
                time: Utc::now(),
            })
            .collect();
        let cursor = guard.entries.len() as u64 + 1;
        drop(guard);
        Ok(Box::new(MemoryConsumer {
            historical,
            rx,
            cursor,
            closed: false,
        }))
    }

    async fn purge(
        &self,
        stream: &str,
        subject: &str,
        keep: Option<u64>,
    ) -> Result<u64, KvError> {
        let state = self.stream(stream).await?;
        let mut state = state.write().await;
        let matching: Vec<usize> = state
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.subject == subject)
            .map(|(i, _)| i)
            .collect();
        let keep = keep.unwrap_or(0) as usize;
        let to_remove = if matching.len() > keep {
            matching.len() - keep
        } else {
            0
        };
        let remove_set: std::collections::HashSet<usize> =
            matching.into_iter().take(to_remove).collect();
        let removed = remove_set.len() as u64;
        let mut i = 0usize;
        state.entries.retain(|_| {
            let keep = !remove_set.contains(&i);
            i += 1;
            keep
        });
        Ok(removed)
    }

    async fn delete_stream(&self, stream: &str) -> Result<(), KvError> {
        self.streams.write().await.remove(stream);
        Ok(())
    }

    async fn close(&self) -> Result<(), KvError> {
        Ok(())
    }
}

struct MemoryConsumer {
    historical: VecDeque<LogMessage>,
    rx: broadcast::Receiver<LogMessage>,
    cursor: u64,
    closed: bool,
}

#[async_trait]
impl LogConsumer for MemoryConsumer {
    async fn next(&mut self) -> Result<Option<LogMessage>, KvError> {
        loop {
            if let Some(msg) = self.historical.pop_front() {
                self.cursor = msg.seq + 1;
                return Ok(Some(msg));
            }
            if self.closed {
                return Ok(None);
            }
            match self.rx.recv().await {
                Ok(msg) if msg.seq >= self.cursor => {
                    self.cursor = msg.seq + 1;
                    return Ok(Some(msg));
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return Ok(None),
            }
        }
    }

    async fn ack(&mut self, _seq: u64) -> Result<(), KvError> {
        Ok(())
    }

    async fn close(&mut self) -> Result<(), KvError> {
        self.closed = true;
        self.historical.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_assigns_increasing_sequence_numbers() {
        let log = MemoryLogClient::new();
        log.ensure_stream("s").await.unwrap();
        let seq1 = log.publish("s", "s.a-put", vec![1]).await.unwrap();
        let seq2 = log.publish("s", "s.b-put", vec![2]).await.unwrap();
        assert_eq!(seq1, 1);
        assert_eq!(seq2, 2);
        assert_eq!(log.last_seq("s").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn consumer_replays_then_tails_live() {
        let log = MemoryLogClient::new();
        log.ensure_stream("s").await.unwrap();
        log.publish("s", "s.a-put", vec![1]).await.unwrap();
        log.publish("s", "s.b-put", vec![2]).await.unwrap();

        let mut consumer = log.open_consumer("s", 1).await.unwrap();
        let first = consumer.next().await.unwrap().unwrap();
        assert_eq!(first.seq, 1);
        let second = consumer.next().await.unwrap().unwrap();
        assert_eq!(second.seq, 2);

        log.publish("s", "s.c-put", vec![3]).await.unwrap();
        let third = consumer.next().await.unwrap().unwrap();
        assert_eq!(third.seq, 3);
    }

    #[tokio::test]
    async fn consumer_can_resume_from_an_arbitrary_sequence() {
        let log = MemoryLogClient::new();
        log.ensure_stream("s").await.unwrap();
        log.publish("s", "s.a-put", vec![1]).await.unwrap();
        log.publish("s", "s.b-put", vec![2]).await.unwrap();
        log.publish("s", "s.c-put", vec![3]).await.unwrap();

        let mut consumer = log.open_consumer("s", 3).await.unwrap();
        let only = consumer.next().await.unwrap().unwrap();
        assert_eq!(only.seq, 3);
    }

    #[tokio::test]
    async fn purge_keeps_only_the_most_recent_per_subject() {
        let log = MemoryLogClient::new();
        log.ensure_stream("s").await.unwrap();
        log.publish("s", "s.a-put", vec![1]).await.unwrap();
        log.publish("s", "s.a-put", vec![2]).await.unwrap();
        log.publish("s", "s.a-put", vec![3]).await.unwrap();
        log.publish("s", "s.b-put", vec![9]).await.unwrap();

        let removed = log.purge("s", "s.a-put", Some(1)).await.unwrap();
        assert_eq!(removed, 2);

        let mut consumer = log.open_consumer("s", 1).await.unwrap();
        let msg = consumer.next().await.unwrap().unwrap();
        assert_eq!(msg.payload, vec![3]);
        let msg = consumer.next().await.unwrap().unwrap();
        assert_eq!(msg.payload, vec![9]);
    }

    #[tokio::test]
    async fn closed_consumer_yields_none() {
        let log = MemoryLogClient::new();
        log.ensure_stream("s").await.unwrap();
        let mut consumer = log.open_consumer("s", 1).await.unwrap();
        consumer.close().await.unwrap();
        assert!(consumer.next().await.unwrap().is_none());
    }
}
