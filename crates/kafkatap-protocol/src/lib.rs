//! Kafka client-to-broker wire protocol decoding for kafkatap.
//!
//! Only the request direction is modelled, and only as far as traffic
//! classification needs: Produce and Fetch bodies decode to topic names and
//! record counts, every other request kind decodes to its header with the
//! body skipped. Responses are never touched.

pub mod codec;
pub mod error;
pub mod fetch;
pub mod produce;
pub mod records;
pub mod request;

pub use codec::{decode_exact, Decoder, Encoder};
pub use error::{ProtocolError, Result};
pub use fetch::FetchRequest;
pub use produce::ProduceRequest;
pub use records::RecordsSummary;
pub use request::{read_request, ApiKey, FrameError, Request, RequestBody, MAX_REQUEST_SIZE};
