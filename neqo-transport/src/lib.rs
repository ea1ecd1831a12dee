// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The loss-recovery and ordered-delivery core of a QUIC client.
//!
//! This crate covers two things a QUIC transport implementation needs
//! regardless of what drives its I/O: reassembling the CRYPTO stream back
//! into the messages the handshake sent ([`crypto_stream`], atop
//! [`ordered_buffer`]), and tracking which packets are in flight, lost, or
//! acknowledged, including the probe-timeout timer that keeps a stalled
//! handshake moving ([`recovery`], atop [`rtt`]).
//!
//! Packet encoding and decoding, AEAD and header protection, the TLS
//! handshake itself, flow control, and congestion-control internals are
//! out of scope: [`collaborators`] defines the seams this crate expects
//! a full client to fill in.

pub mod collaborators;
pub mod crypto_stream;
pub mod error;
pub mod ordered_buffer;
pub mod recovery;
pub mod rtt;
pub mod tracking;

pub use collaborators::{CongestionAdvisor, Frame, HandshakeStateObserver, ProbeSender};
pub use crypto_stream::{CryptoStream, CryptoStreams, MessageParser, RawMessageParser};
pub use error::{Error, Res};
pub use ordered_buffer::OrderedByteBuffer;
pub use recovery::{AckOutcome, InFlightPacket, LossDetector, RecoveryConfig, RecoveryManager, TimerEvent};
pub use rtt::RttEstimator;
pub use tracking::{EncryptionLevel, HandshakeState, PerSpace, PnSpace};
