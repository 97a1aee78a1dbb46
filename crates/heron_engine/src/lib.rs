//! The request → response pipeline: peer selection, spin-up, store
//! locking, per-peer scans, merging, post-processing and the wire
//! response writer.

mod passthrough;
mod response;
mod scan;
mod writer;

pub use response::{NodeAccessor, Response};
pub use scan::{PeerResponse, RawResultSet};
pub use writer::WriteCounter;
