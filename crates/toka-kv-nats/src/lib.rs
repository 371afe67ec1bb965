#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **toka-kv-nats** - NATS JetStream-backed [`LogClient`] driver for Toka KV.
//!
//! Streams are created on demand with a subject filter of `<stream>.*`,
//! matching the codec in `toka_kv_types::subject`. Consumers are ephemeral
//! pull consumers started at an arbitrary sequence via
//! [`DeliverPolicy::ByStartSequence`]; they are deleted on
//! [`LogConsumer::close`] so JetStream does not retain per-consumer state
//! once a base closes.

use async_nats::jetstream::{
    self,
    consumer::{pull, AckPolicy, DeliverPolicy},
    stream::{Config as StreamConfig, RetentionPolicy, StorageType, Stream as JetStreamHandle},
    Context, Message,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;

use toka_kv_types::error::KvError;
use toka_kv_types::log::{LogClient, LogConsumer, LogMessage};

fn log_err(e: impl std::fmt::Display) -> KvError {
    KvError::LogUnavailable(e.to_string())
}

/// A [`LogClient`] backed by a real NATS JetStream connection.
pub struct NatsLogClient {
    client: async_nats::Client,
    jetstream: Context,
}

impl NatsLogClient {
    /// Wraps an already-connected client's JetStream context.
    pub fn new(client: async_nats::Client) -> Self {
        Self {
            jetstream: jetstream::new(client.clone()),
            client,
        }
    }

    /// Connects to `url` and wraps the resulting JetStream context.
    pub async fn connect(url: &str) -> Result<Self, KvError> {
        let client = async_nats::connect(url).await.map_err(log_err)?;
        Ok(Self::new(client))
    }

    async fn ensure(&self, stream: &str) -> Result<JetStreamHandle, KvError> {
        match self.jetstream.get_stream(stream).await {
            Ok(handle) => Ok(handle),
            Err(_) => self
                .jetstream
                .create_stream(StreamConfig {
                    name: stream.to_string(),
                    subjects: vec![format!("{stream}.*")],
                    retention: RetentionPolicy::Limits,
                    storage: StorageType::File,
                    ..Default::default()
                })
                .await
                .map_err(log_err),
        }
    }
}

#[async_trait]
impl LogClient for NatsLogClient {
    async fn ensure_stream(&self, stream: &str) -> Result<(), KvError> {
        self.ensure(stream).await?;
        Ok(())
    }

    async fn publish(&self, stream: &str, subject: &str, payload: Vec<u8>) -> Result<u64, KvError> {
        self.ensure(stream).await?;
        let ack = self
            .jetstream
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(log_err)?
            .await
            .map_err(log_err)?;
        Ok(ack.sequence)
    }

    async fn last_seq(&self, stream: &str) -> Result<u64, KvError> {
        let mut handle = self.ensure(stream).await?;
        let info = handle.info().await.map_err(log_err)?;
        Ok(info.state.last_sequence)
    }

    async fn open_consumer(
        &self,
        stream: &str,
        start_seq: u64,
    ) -> Result<Box<dyn LogConsumer>, KvError> {
        let handle = self.ensure(stream).await?;
        let consumer = handle
            .create_consumer(pull::Config {
                deliver_policy: DeliverPolicy::ByStartSequence {
                    start_sequence: start_seq,
                },
                ack_policy: AckPolicy::Explicit,
                ..Default::default()
            })
            .await
            .map_err(log_err)?;

        let messages = consumer
            .messages()
            .await
            .map_err(log_err)?
            .boxed();

        Ok(Box::new(NatsConsumer {
            consumer,
            messages,
            pending: None,
        }))
    }

    async fn purge(&self, stream: &str, subject: &str, keep: Option<u64>) -> Result<u64, KvError> {
        let handle = self.ensure(stream).await?;
        let mut request = handle.purge().filter(subject);
        if let Some(keep) = keep {
            request = request.keep(keep);
        }
        let response = request.await.map_err(log_err)?;
        Ok(response.purged)
    }

    async fn delete_stream(&self, stream: &str) -> Result<(), KvError> {
        self.jetstream.delete_stream(stream).await.map_err(log_err)?;
        Ok(())
    }

    async fn close(&self) -> Result<(), KvError> {
        self.client.drain().await.map_err(log_err)
    }
}

type PullConsumer = jetstream::consumer::Consumer<pull::Config>;

struct NatsConsumer {
    consumer: PullConsumer,
    messages: BoxStream<'static, Result<Message, async_nats::Error>>,
    pending: Option<(u64, Message)>,
}

#[async_trait]
impl LogConsumer for NatsConsumer {
    async fn next(&mut self) -> Result<Option<LogMessage>, KvError> {
        match self.messages.next().await {
            Some(Ok(message)) => {
                let info = message.info().map_err(log_err)?;
                let seq = info.stream_sequence;
                let time: DateTime<Utc> = info.published.into();
                let payload = message.payload.to_vec();
                self.pending = Some((seq, message));
                Ok(Some(LogMessage { seq, payload, time }))
            }
            Some(Err(e)) => Err(log_err(e)),
            None => Ok(None),
        }
    }

    async fn ack(&mut self, seq: u64) -> Result<(), KvError> {
        match self.pending.take() {
            Some((pending_seq, message)) if pending_seq == seq => {
                message.ack().await.map_err(|e| log_err(e))
            }
            Some(other) => {
                // Out-of-order ack: put it back, this is a caller bug rather
                // than something we should silently drop.
                self.pending = Some(other);
                Err(KvError::LogUnavailable(format!(
                    "ack for sequence {seq} does not match the last delivered message"
                )))
            }
            None => Ok(()),
        }
    }

    async fn close(&mut self) -> Result<(), KvError> {
        self.consumer.delete().await.map_err(log_err)
    }
}
