//! Per-flow stream driver.
//!
//! One driver task owns the client-to-broker byte stream of one TCP
//! half-flow and loops decoding requests off it. Decode failures are
//! expected operating conditions here, not bugs: a capture that attaches to
//! a long-lived connection joins mid-frame, and lossy reassembly tears
//! frames. A failed frame has already been pulled out of the stream when
//! the error surfaces, so the driver logs and resumes scanning at the next
//! unread byte until framing lines up again.

use std::sync::Arc;

use tokio::io::{AsyncRead, BufReader};
use tracing::{debug, info, warn};

use kafkatap_common::FlowKey;
use kafkatap_monitoring::RelationRegistry;
use kafkatap_protocol::{read_request, FrameError, RequestBody};

const STREAM_BUFFER_SIZE: usize = 64 * 1024;

/// Drives one half-flow until the stream ends. Never holds registry state
/// across a read; always drains the stream it is handed.
pub async fn run<S>(flow: FlowKey, stream: S, registry: Arc<RelationRegistry>)
where
    S: AsyncRead + Unpin,
{
    let client_ip = flow.client_ip();
    registry.register_connection(&client_ip);
    info!(%flow, "tracking client stream");

    let mut reader = BufReader::with_capacity(STREAM_BUFFER_SIZE, stream);
    loop {
        match read_request(&mut reader).await {
            Ok(request) => {
                debug!(
                    %flow,
                    key = request.key,
                    version = request.version,
                    correlation_id = request.correlation_id,
                    client_id = %request.client_id,
                    kind = request.request_type(),
                    "decoded request"
                );
                registry.count_request(&client_ip, request.request_type());

                match &request.body {
                    RequestBody::Produce(produce) => {
                        for topic in produce.topic_names() {
                            debug!(%flow, topic, "client wrote to topic");
                            registry.register_producer(&client_ip, topic);
                        }
                        registry.observe_producer_batch(
                            &client_ip,
                            produce.records_len(),
                            produce.records_size(),
                        );
                    }
                    RequestBody::Fetch(fetch) => {
                        for topic in fetch.topic_names() {
                            debug!(%flow, topic, "client read from topic");
                            registry.register_consumer(&client_ip, topic);
                        }
                    }
                    RequestBody::Opaque { .. } => {}
                }
            }
            Err(FrameError::Eof) => {
                info!(%flow, "stream ended");
                return;
            }
            Err(FrameError::UnexpectedEof) => {
                warn!(%flow, "stream ended mid-frame");
            }
            Err(err @ FrameError::Decode { .. }) => {
                warn!(%flow, error = %err, "undecodable request, resyncing stream");
            }
            Err(FrameError::Io(err)) => {
                warn!(%flow, error = %err, "stream read failed");
                return;
            }
        }
    }
}
