//! Glue between the reassembler and the stream drivers.
//!
//! The reassembler announces each new client-to-broker half-flow by calling
//! [`StreamFactory::open`] and then pushes reassembled bytes through the
//! returned [`FlowHandle`]. Each handle is backed by an in-memory pipe with
//! a driver task reading the far end; dropping the handle is the flow's
//! end-of-stream.

use std::sync::Arc;

use tokio::io::{duplex, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;

use kafkatap_common::FlowKey;
use kafkatap_monitoring::RelationRegistry;

use crate::driver;

/// Byte budget of one flow's pipe. Pushes stall once the driver falls this
/// far behind, which backpressures the capture pipeline instead of growing
/// without bound.
const FLOW_PIPE_CAPACITY: usize = 256 * 1024;

/// Spawns a driver task per half-flow the reassembler hands over.
pub struct StreamFactory {
    registry: Arc<RelationRegistry>,
}

impl StreamFactory {
    pub fn new(registry: Arc<RelationRegistry>) -> Self {
        Self { registry }
    }

    /// Opens a new half-flow: starts its driver and returns the handle the
    /// reassembler pushes bytes through.
    pub fn open(&self, flow: FlowKey) -> FlowHandle {
        let (writer, reader) = duplex(FLOW_PIPE_CAPACITY);
        let task = tokio::spawn(driver::run(flow, reader, Arc::clone(&self.registry)));
        FlowHandle { writer, task }
    }
}

/// Write end of one half-flow. Dropping it ends the stream; the driver task
/// keeps running until it has drained what was pushed.
pub struct FlowHandle {
    writer: DuplexStream,
    task: JoinHandle<()>,
}

impl FlowHandle {
    /// Pushes reassembled bytes to the flow's driver. Errors once the
    /// driver is gone.
    pub async fn push(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.writer.write_all(data).await
    }

    /// Ends the stream and waits for the driver to finish draining it.
    pub async fn close(mut self) {
        let _ = self.writer.shutdown().await;
        drop(self.writer);
        let _ = self.task.await;
    }
}
