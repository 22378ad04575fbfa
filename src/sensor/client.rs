//! Sensor network loop
//!
//! Each cycle sends every outstanding reading to the current replica, then
//! reads replies until one reply timeout passes in silence. A cycle with no
//! replies at all counts toward failover to the other replica.

use crate::common::wire::Reading;
use crate::common::{Error, Result, SensorConfig};
use crate::sensor::delivery::{CycleVerdict, DeliveryEngine, ReplyOutcome};
use crate::sensor::generator::ReadingGenerator;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

/// One TCP session with a replica.
pub struct Connection {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: BufWriter<OwnedWriteHalf>,
}

impl Connection {
    pub async fn open(addr: &str, connect_timeout: Duration) -> Result<Self> {
        let stream = timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Timeout(format!("connect to {}", addr)))?
            .map_err(|e| Error::ConnectionFailed(format!("{}: {}", addr, e)))?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            lines: BufReader::new(read_half).lines(),
            writer: BufWriter::new(write_half),
        })
    }

    pub async fn send_line(&mut self, line: &str) -> Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.writer.flush().await?;
        Ok(())
    }

    /// Next reply line; `Ok(None)` when the replica closed the connection.
    pub async fn next_line(&mut self, wait: Duration) -> Result<Option<String>> {
        match timeout(wait, self.lines.next_line()).await {
            Ok(line) => Ok(line?),
            Err(_) => Err(Error::Timeout("reply".into())),
        }
    }
}

/// What one send/receive exchange produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Exchange {
    pub replies: usize,
    /// The replica closed the connection during the receive phase
    pub closed: bool,
}

pub struct SensorClient {
    config: SensorConfig,
    engine: DeliveryEngine,
}

impl SensorClient {
    pub fn new(config: SensorConfig) -> Result<Self> {
        config.validate()?;
        let engine = DeliveryEngine::new(
            config.sensor_id,
            config.endpoints.clone(),
            config.silent_cycles_before_failover,
        )?;
        Ok(Self { config, engine })
    }

    pub fn engine(&self) -> &DeliveryEngine {
        &self.engine
    }

    /// Generate readings and deliver them forever.
    pub async fn run(mut self) -> Result<()> {
        let (tx, mut readings) = mpsc::channel(self.config.channel_capacity);
        let _generator =
            ReadingGenerator::new(self.config.sensor_id, self.config.reading_interval()).spawn(tx);

        tracing::info!(
            "Sensor {} starting against {}",
            self.config.sensor_id,
            self.engine.endpoint()
        );

        let mut conn: Option<Connection> = None;
        loop {
            self.absorb(&mut readings);
            tracing::info!("Unacknowledged readings: {}", self.engine.outbox().len());
            self.cycle(&mut conn).await;
            tokio::time::sleep(self.config.idle_delay()).await;
        }
    }

    /// Move freshly generated readings into the outbox.
    pub fn absorb(&mut self, readings: &mut mpsc::Receiver<Reading>) {
        while let Ok(reading) = readings.try_recv() {
            self.engine.enqueue(reading);
        }
    }

    /// One network cycle against the current endpoint, including the
    /// failover decision.
    pub async fn cycle(&mut self, conn: &mut Option<Connection>) -> CycleVerdict {
        if conn.is_none() {
            let addr = self.engine.endpoint().to_string();
            match Connection::open(&addr, self.config.reply_timeout()).await {
                Ok(c) => {
                    tracing::info!("Connected to {}", addr);
                    *conn = Some(c);
                }
                Err(e) => tracing::warn!("Cannot reach {}: {}", addr, e),
            }
        }

        let exchange = match conn.as_mut() {
            Some(c) => match self.exchange(c).await {
                Ok(exchange) => exchange,
                Err(e) => {
                    if e.is_retryable() {
                        tracing::warn!("Exchange with {} failed: {}", self.engine.endpoint(), e);
                    } else {
                        tracing::error!("Exchange with {} aborted: {}", self.engine.endpoint(), e);
                    }
                    Exchange {
                        replies: 0,
                        closed: true,
                    }
                }
            },
            None => Exchange::default(),
        };
        if exchange.closed {
            *conn = None;
        }

        let verdict = self.engine.finish_cycle(exchange.replies);
        match &verdict {
            CycleVerdict::Failover { to } => {
                tracing::warn!("No response from replica, failing over to {}", to);
                *conn = None;
            }
            CycleVerdict::Silent { consecutive } => {
                tracing::warn!("No response from replica ({} silent cycles)", consecutive);
            }
            CycleVerdict::Healthy => {}
        }
        verdict
    }

    /// Send all outstanding readings, then drain replies until silence.
    pub async fn exchange(&mut self, conn: &mut Connection) -> Result<Exchange> {
        for frame in self.engine.outgoing_frames() {
            conn.send_line(&frame).await?;
        }
        conn.flush().await?;

        let wait = self.config.reply_timeout();
        let mut exchange = Exchange::default();
        loop {
            let line = match conn.next_line(wait).await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    exchange.closed = true;
                    break;
                }
                Err(Error::Timeout(_)) => break,
                Err(e) => return Err(e),
            };
            exchange.replies += 1;

            match self.engine.handle_reply(&line) {
                Ok(ReplyOutcome::Average { record, ack }) => {
                    tracing::debug!("Average {} = {}", record.sequence, record.value);
                    conn.send_line(&ack.to_string()).await?;
                    conn.flush().await?;
                }
                Ok(ReplyOutcome::ReadingAcked { sequence, removed }) => {
                    tracing::debug!("Reading {} acknowledged (new: {})", sequence, removed);
                }
                Ok(ReplyOutcome::Foreign { sensor_id }) => {
                    tracing::warn!("Echo for sensor {} ignored", sensor_id);
                }
                Err(e) => tracing::warn!("Dropping reply: {}", e),
            }
        }
        Ok(exchange)
    }
}
