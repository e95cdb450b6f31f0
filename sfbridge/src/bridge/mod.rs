//! Client-worker bridge.
//!
//! - **protocol**: envelope types (Request, Response, Ready) and the transfer list
//! - **codec**: length-delimited framing with out-of-band binary sections
//! - **transport**: backend probing, worker startup, the `WorkerChannel` union

pub mod codec;
pub mod protocol;
pub mod transport;
