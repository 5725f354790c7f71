//! Minimal client-to-broker stream reassembly.
//!
//! The probe favors delivering bytes over reconstructing them perfectly:
//! one out-of-order segment may be parked per flow (bounded globally), and
//! when parking is exhausted the gap is skipped and delivery continues. The
//! stream drivers already resync on torn framing, so imperfect reassembly
//! costs an observation at worst, never correctness. Idle flows are flushed
//! on a timer instead of waiting for FIN.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::debug;

use kafkatap_common::FlowKey;

use crate::assembly::{FlowHandle, StreamFactory};
use crate::capture::Segment;

/// Global cap on parked out-of-order segments.
const MAX_PARKED_SEGMENTS_TOTAL: usize = 1000;

/// Flows quiet for longer than this are flushed by the next sweep.
pub const IDLE_FLOW_TIMEOUT: Duration = Duration::from_secs(120);

/// Cadence of the idle-flow sweep.
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(60);

struct FlowState {
    handle: FlowHandle,
    /// Next expected sequence number; `None` until the first payload (or
    /// SYN) anchors the stream.
    next_seq: Option<u32>,
    /// At most one out-of-order segment waiting for its gap to fill.
    parked: Option<(u32, Bytes)>,
    last_seen: Instant,
}

/// Orders captured segments into per-flow byte streams and feeds them to
/// the drivers spawned by the factory.
pub struct Assembler {
    factory: StreamFactory,
    flows: HashMap<FlowKey, FlowState>,
    parked_total: usize,
}

impl Assembler {
    pub fn new(factory: StreamFactory) -> Self {
        Self {
            factory,
            flows: HashMap::new(),
            parked_total: 0,
        }
    }

    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    /// Feeds one captured segment. Opens the flow on first sight, delivers
    /// payload bytes in order, closes the flow on FIN or RST.
    pub async fn feed(&mut self, segment: Segment) {
        let key = segment.flow;
        if !self.flows.contains_key(&key) {
            debug!(flow = %key, "new client stream");
            self.flows.insert(
                key,
                FlowState {
                    handle: self.factory.open(key),
                    next_seq: segment.syn.then(|| segment.seq.wrapping_add(1)),
                    parked: None,
                    last_seen: Instant::now(),
                },
            );
        }
        let Some(state) = self.flows.get_mut(&key) else {
            return;
        };
        state.last_seen = Instant::now();

        let mut broken = false;
        if !segment.payload.is_empty() {
            broken = state
                .deliver(segment.seq, segment.payload, &mut self.parked_total)
                .await
                .is_err();
        }

        if broken || segment.fin || segment.rst {
            self.close_flow(key).await;
        }
    }

    /// Flushes flows with no traffic for `idle_timeout`, ending their
    /// streams so the drivers see EOF.
    pub async fn flush_idle(&mut self, idle_timeout: Duration) {
        let now = Instant::now();
        let idle: Vec<FlowKey> = self
            .flows
            .iter()
            .filter(|(_, state)| now.duration_since(state.last_seen) > idle_timeout)
            .map(|(key, _)| *key)
            .collect();
        for key in idle {
            debug!(flow = %key, "flushing idle stream");
            self.close_flow(key).await;
        }
    }

    async fn close_flow(&mut self, key: FlowKey) {
        if let Some(state) = self.flows.remove(&key) {
            if state.parked.is_some() {
                self.parked_total -= 1;
            }
            state.handle.close().await;
        }
    }
}

impl FlowState {
    /// Pushes `payload` at `seq` to the driver, in order. Errors only when
    /// the driver is gone, which closes the flow.
    async fn deliver(
        &mut self,
        seq: u32,
        payload: Bytes,
        parked_total: &mut usize,
    ) -> std::io::Result<()> {
        let Some(expected) = self.next_seq else {
            // First payload anchors the stream.
            self.next_seq = Some(seq.wrapping_add(payload.len() as u32));
            self.handle.push(&payload).await?;
            return self.unpark(parked_total).await;
        };

        let lag = expected.wrapping_sub(seq) as i32;
        if lag == 0 {
            self.next_seq = Some(seq.wrapping_add(payload.len() as u32));
            self.handle.push(&payload).await?;
        } else if lag > 0 {
            // Retransmission or overlap; deliver only the unseen tail.
            let skip = lag as usize;
            if skip < payload.len() {
                self.next_seq = Some(seq.wrapping_add(payload.len() as u32));
                self.handle.push(&payload[skip..]).await?;
            }
        } else if self.parked.is_none() && *parked_total < MAX_PARKED_SEGMENTS_TOTAL {
            self.parked = Some((seq, payload));
            *parked_total += 1;
            return Ok(());
        } else {
            // No room to wait for the gap to fill: skip ahead and let the
            // driver resync.
            debug!(gap = -lag, "skipping sequence gap");
            self.next_seq = Some(seq.wrapping_add(payload.len() as u32));
            self.handle.push(&payload).await?;
        }

        self.unpark(parked_total).await
    }

    /// Delivers the parked segment if the bytes before it have arrived.
    async fn unpark(&mut self, parked_total: &mut usize) -> std::io::Result<()> {
        let Some(expected) = self.next_seq else {
            return Ok(());
        };
        let Some((seq, payload)) = self.parked.take() else {
            return Ok(());
        };

        let lag = expected.wrapping_sub(seq) as i32;
        if lag < 0 {
            // Still ahead of the stream.
            self.parked = Some((seq, payload));
            return Ok(());
        }
        *parked_total -= 1;
        let skip = lag as usize;
        if skip < payload.len() {
            self.next_seq = Some(seq.wrapping_add(payload.len() as u32));
            self.handle.push(&payload[skip..]).await?;
        }
        Ok(())
    }
}
