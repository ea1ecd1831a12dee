// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Packet-number spaces and encryption levels.
//!
//! QUIC keeps a separate packet-number axis per encryption epoch so that
//! loss detection in one space never depends on packet numbers from
//! another. [`PnSpace`] is that axis; [`EncryptionLevel`] is the
//! (slightly finer) set of keys a packet can be protected with.

use std::fmt;

use enum_map::{Enum, EnumMap};
use static_assertions::const_assert_eq;

/// One of the three packet-number spaces recovery tracks independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Enum)]
pub enum PnSpace {
    Initial,
    Handshake,
    App,
}

const_assert_eq!(PnSpace::ALL.len(), 3);

impl PnSpace {
    pub const ALL: [Self; 3] = [Self::Initial, Self::Handshake, Self::App];

    /// The encryption level recovery bookkeeping associates with this space.
    ///
    /// `PnSpace::App` covers both 0-RTT and 1-RTT on the send side, but for
    /// recovery purposes (RTT sampling, PTO) it is always treated as 1-RTT:
    /// 0-RTT packets that are never acknowledged are dropped wholesale when
    /// 0-RTT is rejected, not tracked individually.
    #[must_use]
    pub const fn related_encryption_level(self) -> EncryptionLevel {
        match self {
            Self::Initial => EncryptionLevel::Initial,
            Self::Handshake => EncryptionLevel::Handshake,
            Self::App => EncryptionLevel::App,
        }
    }
}

impl fmt::Display for PnSpace {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Initial => "Initial",
            Self::Handshake => "Handshake",
            Self::App => "ApplicationData",
        };
        write!(f, "{s}")
    }
}

/// A helper for the "one slot per `PnSpace`" storage pattern used by
/// [`crate::recovery::RecoveryManager`] and [`crate::crypto_stream::CryptoStreams`].
#[derive(Debug, Default, Clone)]
pub struct PerSpace<T> {
    slots: EnumMap<PnSpace, T>,
}

impl<T> PerSpace<T> {
    pub fn get(&self, space: PnSpace) -> &T {
        &self.slots[space]
    }

    pub fn get_mut(&mut self, space: PnSpace) -> &mut T {
        &mut self.slots[space]
    }

    pub fn iter(&self) -> impl Iterator<Item = (PnSpace, &T)> {
        self.slots.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (PnSpace, &mut T)> {
        self.slots.iter_mut()
    }
}

impl<T: Clone> PerSpace<T> {
    /// Build a `PerSpace` with the same starting value in every slot.
    /// Useful when `T`'s `Default` isn't the value every space should
    /// start with (e.g. a `PerSpace<bool>` that starts all-`true`).
    pub fn new_with(value: T) -> Self {
        Self {
            slots: EnumMap::from_fn(|_| value.clone()),
        }
    }
}

/// The keys a packet can be protected with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncryptionLevel {
    Initial,
    ZeroRtt,
    Handshake,
    App,
}

impl fmt::Display for EncryptionLevel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Initial => "Initial",
            Self::ZeroRtt => "ZeroRtt",
            Self::Handshake => "Handshake",
            Self::App => "App",
        };
        write!(f, "{s}")
    }
}

/// Which keys the handshake has installed so far. Transitions are monotone:
/// `Initial -> HasHandshakeKeys -> HasAppKeys -> Confirmed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HandshakeState {
    Initial,
    HasHandshakeKeys,
    HasAppKeys,
    Confirmed,
}

impl HandshakeState {
    #[must_use]
    pub const fn has_handshake_keys(self) -> bool {
        matches!(
            self,
            Self::HasHandshakeKeys | Self::HasAppKeys | Self::Confirmed
        )
    }

    #[must_use]
    pub const fn has_app_keys(self) -> bool {
        matches!(self, Self::HasAppKeys | Self::Confirmed)
    }
}
