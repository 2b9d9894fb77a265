//! SCTP association over a datagram conduit.
//!
//! [SCTP](https://en.wikipedia.org/wiki/Stream_Control_Transmission_Protocol)
//! (RFC 4960) is the protocol WebRTC data channels run over a DTLS
//! connection. This crate implements a single-homed association endpoint on
//! top of any packet conduit implementing `util::Conn`: handshake,
//! multiplexed reliable/partially-reliable ordered/unordered streams,
//! selective acknowledgement, RFC 4960 congestion control, RFC 3758
//! Forward-TSN, RFC 6525 stream reconfiguration, and RFC 9653 zero
//! checksum.
//!
//! Open an [`Association`] as `client` or `server` over your conduit, then
//! use [`Association::open_stream`] / [`Association::accept_stream`] to
//! exchange messages.

#![warn(rust_2018_idioms)]
#![allow(dead_code)]

mod association;
mod chunk;
mod error;
mod error_cause;
mod packet;
mod param;
mod queue;
mod stream;
mod timer;
mod util;

pub use crate::association::{Association, Config};
pub use crate::chunk::chunk_payload_data::PayloadProtocolIdentifier;
pub use crate::error::{Error, Result};
pub use crate::stream::{OnBufferedAmountLowFn, ReliabilityType, Stream};
