// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Reassembly of length-prefixed messages out of a CRYPTO-frame byte
//! stream, and the per-packet-number-space fan-out ([`CryptoStreams`]) that
//! narrows as spaces are discarded during the handshake.
//!
//! This module does not know what a CRYPTO frame looks like on the wire,
//! nor anything about TLS: callers feed it `(offset, bytes)` pairs already
//! extracted from decrypted frames, and it hands back whatever
//! `P::Message` the caller's [`MessageParser`] produces. Key derivation,
//! AEAD, and the handshake state machine itself live elsewhere.

use neqo_common::{hex_snip_middle, qtrace};

use crate::{
    error::{Error, Res},
    ordered_buffer::OrderedByteBuffer,
    tracking::PnSpace,
};

/// Turns a reassembled message body into the caller's message type.
pub trait MessageParser {
    type Message;

    fn parse(&mut self, body: &[u8]) -> Res<Self::Message>;
}

/// A [`MessageParser`] that does no parsing, for callers (and tests) that
/// just want the reassembled bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawMessageParser;

impl MessageParser for RawMessageParser {
    type Message = Vec<u8>;

    fn parse(&mut self, body: &[u8]) -> Res<Self::Message> {
        Ok(body.to_vec())
    }
}

fn decode_prefix(bytes: &[u8]) -> usize {
    bytes.iter().fold(0_usize, |acc, &b| (acc << 8) | usize::from(b))
}

/// Reassembles a single CRYPTO-like stream into a sequence of
/// length-prefixed messages.
///
/// Each message on the wire is `prefix_size` bytes of big-endian length,
/// followed by that many bytes of body. `next_message` only ever returns a
/// message once its entire length-prefix-plus-body run has become
/// contiguous; partial messages sit in the underlying
/// [`OrderedByteBuffer`] until the rest arrives.
#[derive(Debug)]
pub struct CryptoStream<P> {
    buffer: OrderedByteBuffer,
    parser: P,
    prefix_size: usize,
    buffered_limit: usize,
}

impl<P: MessageParser> CryptoStream<P> {
    #[must_use]
    pub fn new(parser: P, prefix_size: usize, buffered_limit: usize) -> Self {
        assert!((1..=8).contains(&prefix_size), "prefix_size must fit in a usize fold");
        Self {
            buffer: OrderedByteBuffer::new(),
            parser,
            prefix_size,
            buffered_limit,
        }
    }

    /// Buffer bytes received at `offset`. Returns
    /// [`Error::CryptoBufferExceeded`] if doing so would push the total
    /// (contiguous or not) buffered byte count past the configured limit;
    /// the caller should treat that as fatal to the connection.
    pub fn insert(&mut self, offset: u64, data: &[u8]) -> Res<()> {
        qtrace!("crypto frame offset={offset} len={} data={}", data.len(), hex_snip_middle(data));
        self.buffer.insert(offset, data);
        if self.buffer.buffered_len() > self.buffered_limit {
            return Err(Error::CryptoBufferExceeded);
        }
        Ok(())
    }

    /// Pull the next complete message out of the contiguous prefix, if one
    /// has fully arrived. Callers should call this in a loop: more than one
    /// message can become available from a single `insert`.
    pub fn next_message(&mut self) -> Res<Option<P::Message>> {
        let Some(prefix) = self.buffer.peek_contiguous(self.prefix_size as u64) else {
            return Ok(None);
        };
        if prefix.len() < self.prefix_size {
            return Ok(None);
        }
        let body_len = decode_prefix(prefix);
        let total = self.prefix_size + body_len;
        if self.buffer.contiguous_available() < total as u64 {
            return Ok(None);
        }
        let framed = self.buffer.read_contiguous(total as u64);
        let message = self.parser.parse(&framed[self.prefix_size..])?;
        Ok(Some(message))
    }
}

/// The per-packet-number-space crypto streams, narrowing as spaces are
/// discarded.
///
/// A QUIC client starts out tracking all three spaces. Once the Initial
/// keys are no longer needed it discards that space's stream outright
/// (`Initial -> Handshake`); once the handshake is confirmed it does the
/// same for Handshake (`Handshake -> ApplicationData`). The narrowing is
/// one-way: there is no path back to a wider variant.
#[derive(Debug)]
pub enum CryptoStreams<P> {
    Initial {
        initial: CryptoStream<P>,
        handshake: CryptoStream<P>,
        app: CryptoStream<P>,
    },
    Handshake {
        handshake: CryptoStream<P>,
        app: CryptoStream<P>,
    },
    ApplicationData {
        app: CryptoStream<P>,
    },
}

impl<P: MessageParser + Default> CryptoStreams<P> {
    #[must_use]
    pub fn new(prefix_size: usize, buffered_limit: usize) -> Self {
        let make = || CryptoStream::new(P::default(), prefix_size, buffered_limit);
        Self::Initial {
            initial: make(),
            handshake: make(),
            app: make(),
        }
    }

    /// Discard `space`, narrowing the enum by one step. `space` must be the
    /// least-confidential space this value still tracks (`Initial` while
    /// `self` is `Self::Initial`, `Handshake` while `self` is
    /// `Self::Handshake`); anything else, including discarding
    /// `PnSpace::App`, is a programming error reported as
    /// [`Error::SpaceDiscarded`].
    pub fn discard(&mut self, space: PnSpace) -> Res<()> {
        let current = std::mem::replace(self, Self::placeholder());
        let (next, result) = match (current, space) {
            (Self::Initial { handshake, app, .. }, PnSpace::Initial) => {
                (Self::Handshake { handshake, app }, Ok(()))
            }
            (Self::Handshake { app, .. }, PnSpace::Handshake) => (Self::ApplicationData { app }, Ok(())),
            (other, _) => (other, Err(Error::SpaceDiscarded)),
        };
        *self = next;
        result
    }

    /// A cheap, never-observed value used only to satisfy `mem::replace`
    /// while [`Self::discard`] computes the real next state.
    fn placeholder() -> Self {
        Self::ApplicationData {
            app: CryptoStream::new(P::default(), 1, 0),
        }
    }
}

impl<P> CryptoStreams<P> {
    /// Borrow the stream for `space`, or `Err(SpaceDiscarded)` if that
    /// space's state has already been thrown away.
    pub fn get_mut(&mut self, space: PnSpace) -> Res<&mut CryptoStream<P>> {
        match (self, space) {
            (Self::Initial { initial, .. }, PnSpace::Initial) => Ok(initial),
            (Self::Initial { handshake, .. } | Self::Handshake { handshake, .. }, PnSpace::Handshake) => {
                Ok(handshake)
            }
            (
                Self::Initial { app, .. } | Self::Handshake { app, .. } | Self::ApplicationData { app },
                PnSpace::App,
            ) => Ok(app),
            _ => Err(Error::SpaceDiscarded),
        }
    }
}
