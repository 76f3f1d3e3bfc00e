//! Status words reported by the driver
//!
//! Readers and cards both report their condition as a bitmask. [`StatusFlags`]
//! wraps such a word together with the closed vocabulary it is drawn from, so
//! reader bits and card bits cannot be mixed up.

use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;
use std::str::FromStr;

use crate::error::ParseStatusError;

/// A closed vocabulary of status bits
pub trait StatusBit: Copy + Eq + Hash + fmt::Debug + 'static {
    /// Rendered bits, in rendering order
    const NAMED: &'static [(Self, &'static str)];

    /// Raw bit value
    fn bits(self) -> u32;
}

macro_rules! status_vocabulary {
    (
        $(#[$outer:meta])*
        $vis:vis struct $name:ident {
            $( $(#[$inner:meta])* $bit:ident = $value:literal; )*
        }
    ) => {
        $(#[$outer])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash)]
        $vis struct $name(u32);

        impl $name {
            $( $(#[$inner])* pub const $bit: Self = Self($value); )*

            /// Raw bit value
            pub const fn bits(self) -> u32 {
                self.0
            }
        }

        impl StatusBit for $name {
            const NAMED: &'static [(Self, &'static str)] = &[$( (Self::$bit, stringify!($bit)), )*];

            fn bits(self) -> u32 {
                self.0
            }
        }

        impl std::ops::BitOr for $name {
            type Output = Self;

            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match Self::NAMED.iter().find(|(bit, _)| bit.0 == self.0) {
                    Some((_, name)) => write!(f, "{}::{}", stringify!($name), name),
                    None => write!(f, "{}({:#06x})", stringify!($name), self.0),
                }
            }
        }
    };
}

status_vocabulary! {
    /// Reader-level status bits (`SCARD_STATE_*`)
    pub struct ReaderStatus {
        /// The reader is not known to the service; treated as unplugged
        UNKNOWN = 0x0004;
        /// The reader cannot be reached
        UNAVAILABLE = 0x0008;
        /// No card in the slot
        EMPTY = 0x0010;
        /// A card is in the slot
        PRESENT = 0x0020;
        /// The card ATR matched one of the requested ATRs
        ATR_MATCH = 0x0040;
        /// The card is held exclusively by some connection
        EXCLUSIVE = 0x0080;
        /// The card is in use by some connection
        IN_USE = 0x0100;
        /// A card touches the contacts but does not answer
        MUTE = 0x0200;
        /// The card is present but not powered
        UNPOWERED = 0x0400;
    }
}

impl ReaderStatus {
    /// Set when the status differs from the previous report. Never rendered.
    pub const CHANGED: Self = Self(0x0002);
}

status_vocabulary! {
    /// Card-level status bits (`SCARD_*` card states)
    pub struct CardStatus {
        /// The driver does not know the card state
        UNKNOWN = 0x0001;
        /// No card in the reader
        ABSENT = 0x0002;
        /// A card is present but not in position for use
        PRESENT = 0x0004;
        /// The card is in position but not powered
        SWALLOWED = 0x0008;
        /// The card is powered but the reader does not know its mode
        POWERED = 0x0010;
        /// The card has been reset and awaits PTS negotiation
        NEGOTIABLE = 0x0020;
        /// A protocol has been negotiated
        SPECIFIC = 0x0040;
    }
}

/// Immutable status word drawn from the vocabulary `B`
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusFlags<B> {
    raw: u32,
    _vocabulary: PhantomData<B>,
}

/// Status of a reader slot
pub type ReaderStatusFlags = StatusFlags<ReaderStatus>;

/// Status of a connected card
pub type CardStatusFlags = StatusFlags<CardStatus>;

impl<B: StatusBit> StatusFlags<B> {
    /// Wrap a raw status word
    pub const fn from_raw(raw: u32) -> Self {
        Self {
            raw,
            _vocabulary: PhantomData,
        }
    }

    /// The raw status word, unnamed bits included
    pub const fn raw(&self) -> u32 {
        self.raw
    }

    /// Whether no bit at all is set
    pub const fn is_empty(&self) -> bool {
        self.raw == 0
    }

    /// Whether every bit of `bit` is set
    pub fn contains(&self, bit: B) -> bool {
        self.raw & bit.bits() == bit.bits()
    }

    /// True iff every given bit is set. Vacuously true for no bits.
    pub fn has(&self, bits: &[B]) -> bool {
        bits.iter().all(|&bit| self.contains(bit))
    }

    /// True iff at least one given bit is set. Vacuously false for no bits.
    pub fn has_any(&self, bits: &[B]) -> bool {
        bits.iter().any(|&bit| self.raw & bit.bits() != 0)
    }

    /// Set named bits, in declaration order
    pub fn iter_named(&self) -> impl Iterator<Item = (B, &'static str)> + '_ {
        B::NAMED
            .iter()
            .copied()
            .filter(move |&(bit, _)| self.contains(bit))
    }
}

impl<B: StatusBit> From<B> for StatusFlags<B> {
    fn from(bit: B) -> Self {
        Self::from_raw(bit.bits())
    }
}

impl<B: StatusBit> Default for StatusFlags<B> {
    fn default() -> Self {
        Self::from_raw(0)
    }
}

impl<B: StatusBit> fmt::Display for StatusFlags<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{ ")?;
        for (i, (_, name)) in self.iter_named().enumerate() {
            if i > 0 {
                f.write_str(" | ")?;
            }
            f.write_str(name)?;
        }
        if self.iter_named().next().is_some() {
            f.write_str(" ")?;
        }
        f.write_str("}")
    }
}

impl<B: StatusBit> fmt::Debug for StatusFlags<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StatusFlags({:#06x} {self})", self.raw)
    }
}

impl<B: StatusBit> FromStr for StatusFlags<B> {
    type Err = ParseStatusError;

    /// Parse the canonical `{ A | B }` form back into a status word
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let inner = s
            .trim()
            .strip_prefix('{')
            .and_then(|rest| rest.strip_suffix('}'))
            .ok_or_else(|| ParseStatusError::Malformed(s.to_string()))?;

        let mut raw = 0;
        for name in inner.split('|').map(str::trim).filter(|n| !n.is_empty()) {
            let (bit, _) = B::NAMED
                .iter()
                .find(|(_, known)| *known == name)
                .ok_or_else(|| ParseStatusError::UnknownName(name.to_string()))?;
            raw |= bit.bits();
        }

        Ok(Self::from_raw(raw))
    }
}
