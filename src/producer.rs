//! Broker-facing half of the sender: drains the record queue, submits
//! asynchronously per topic, and moves the offset store only on
//! acknowledged deliveries.

use std::{sync::Arc, time::Duration};

use rdkafka::{
    config::ClientConfig,
    error::{KafkaError, RDKafkaErrorCode},
    producer::{FutureProducer, FutureRecord, Producer as _},
};
use snafu::{ResultExt, Snafu};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::{
    checkpoints::OffsetTable,
    config::Config,
    reader::DeliveryCounters,
    record::RecordBatch,
    shared::{Shared, Stats},
};

/// Linear backoff base for a saturated client queue.
const BACKOFF_STEP: Duration = Duration::from_millis(10);
const BACKOFF_CAP: Duration = Duration::from_millis(100);
/// After this many rejected submissions the record is dead-lettered.
const MAX_SUBMIT_ATTEMPTS: u32 = 50;
const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);
const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Snafu)]
pub enum ProducerError {
    #[snafu(display("kafka client configuration failed: {source}"))]
    ClientBuild { source: KafkaError },

    #[snafu(display("metadata for topic {topic} unavailable: {source}"))]
    Metadata { topic: String, source: KafkaError },

    #[snafu(display("topic {topic} reports no partitions"))]
    NoPartitions { topic: String },
}

/// Static routing for one spec's records.
#[derive(Debug, Clone)]
struct TopicRoute {
    topic: String,
    /// `None` leaves the choice to the client/broker.
    partition: Option<i32>,
}

pub struct KafkaSink {
    client: FutureProducer,
    routes: Vec<TopicRoute>,
    offsets: Arc<OffsetTable>,
    counters: Vec<Arc<DeliveryCounters>>,
    shared: Arc<Shared>,
    rx: mpsc::Receiver<RecordBatch>,
}

impl KafkaSink {
    /// Build the client and resolve every spec's partition up front.
    /// An unreachable broker or an unknown topic is an initialisation
    /// failure, not a runtime retry.
    pub fn build(
        config: &Config,
        offsets: Arc<OffsetTable>,
        counters: Vec<Arc<DeliveryCounters>>,
        shared: Arc<Shared>,
        rx: mpsc::Receiver<RecordBatch>,
    ) -> Result<KafkaSink, ProducerError> {
        let mut client_config = ClientConfig::new();
        client_config.set("bootstrap.servers", &config.main.brokers);
        for (key, value) in config
            .main
            .kafka_global
            .iter()
            .chain(config.main.kafka_topic.iter())
        {
            client_config.set(key, value);
        }
        let client: FutureProducer = client_config.create().context(ClientBuildSnafu)?;

        let host_byte = config.host_addr_byte();
        let mut routes = Vec::with_capacity(config.specs.len());
        for spec in &config.specs {
            let partition = if let Some(partition) = spec.partition {
                Some(partition)
            } else if spec.autoparti {
                let partitions = partition_count(&client, &spec.topic)?;
                match host_byte {
                    Some(byte) => Some(auto_partition(byte, partitions)),
                    None => {
                        warn!(message = "host address unresolvable, auto partition disabled",
                              topic = %spec.topic);
                        config.main.partition
                    }
                }
            } else {
                config.main.partition
            };
            info!(message = "topic route", topic = %spec.topic, ?partition);
            routes.push(TopicRoute {
                topic: spec.topic.clone(),
                partition,
            });
        }

        Ok(KafkaSink {
            client,
            routes,
            offsets,
            counters,
            shared,
            rx,
        })
    }

    /// Drain the queue until the watch loop closes it, then flush.
    pub async fn run(mut self) {
        while let Some(batch) = self.rx.recv().await {
            self.submit_batch(batch).await;
        }
        info!(message = "sender queue closed, flushing producer");
        if let Err(error) = self.client.flush(FLUSH_TIMEOUT) {
            error!(message = "producer flush failed", %error);
        }
    }

    /// Submit one batch in order, then wait for its delivery reports and
    /// advance the offset store to the last acknowledged record.
    async fn submit_batch(&mut self, batch: RecordBatch) {
        let route = self.routes[batch.spec].clone();
        let mut deliveries = Vec::with_capacity(batch.records.len());

        for record in batch.records {
            Stats::decr(&self.shared.stats.queue_depth, 1);
            let payload_len = record.payload.len() as u64;

            let mut attempt = 0u32;
            loop {
                let mut outgoing: FutureRecord<'_, (), [u8]> =
                    FutureRecord::to(&route.topic).payload(record.payload.as_ref());
                if let Some(partition) = route.partition {
                    outgoing = outgoing.partition(partition);
                }

                match self.client.send_result(outgoing) {
                    Ok(delivery) => {
                        deliveries.push((delivery, record.inode, record.advance, payload_len));
                        break;
                    }
                    Err((
                        KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull),
                        _,
                    )) => {
                        attempt += 1;
                        if attempt >= MAX_SUBMIT_ATTEMPTS {
                            error!(message = "client queue saturated, record dead-lettered",
                                   topic = %route.topic, attempts = attempt);
                            Stats::incr(&self.shared.stats.lines_dropped, 1);
                            break;
                        }
                        // Back-pressure, not an error: pause the readers
                        // and give the client time to drain.
                        self.shared.set_flow_control(true);
                        let backoff = (BACKOFF_STEP * attempt).min(BACKOFF_CAP);
                        tokio::time::sleep(backoff).await;
                    }
                    Err((error, _)) => {
                        error!(message = "produce failed, record dropped",
                               topic = %route.topic, %error);
                        Stats::incr(&self.shared.stats.lines_dropped, 1);
                        break;
                    }
                }
            }
        }
        // The whole batch is enqueued (or dropped); readers may resume.
        self.shared.set_flow_control(false);

        for (delivery, inode, advance, payload_len) in deliveries {
            match delivery.await {
                Ok(Ok(_)) => {
                    Stats::incr(&self.shared.stats.records_sent, 1);
                    let counters = &self.counters[batch.spec];
                    Stats::incr(&counters.sent_lines, 1);
                    Stats::incr(&counters.sent_bytes, payload_len);
                    if let Some(advance) = advance {
                        self.offsets.advance(batch.spec, inode, advance);
                    }
                }
                Ok(Err((error, _message))) => {
                    // Delivered-with-error records do not move the offset
                    // store; replay covers them.
                    error!(message = "delivery failed", topic = %route.topic, %error);
                }
                Err(_canceled) => {
                    warn!(message = "delivery report dropped", topic = %route.topic);
                }
            }
        }
    }
}

fn partition_count(client: &FutureProducer, topic: &str) -> Result<u32, ProducerError> {
    let metadata = client
        .client()
        .fetch_metadata(Some(topic), METADATA_TIMEOUT)
        .context(MetadataSnafu { topic })?;
    let partitions = metadata
        .topics()
        .iter()
        .find(|t| t.name() == topic)
        .map(|t| t.partitions().len())
        .unwrap_or(0);
    if partitions == 0 {
        return NoPartitionsSnafu { topic }.fail();
    }
    Ok(partitions as u32)
}

/// Deterministic auto-partition: low byte of the host address in network
/// order, modulo the partition count.
pub fn auto_partition(host_byte: u8, partitions: u32) -> i32 {
    i32::from(host_byte) % partitions as i32
}
