//! Descriptor-leak fault selection.

use serde::{Deserialize, Serialize};

/// Bitset selecting which descriptors survive a fork that would normally
/// close them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub struct LeakMask(u8);

impl LeakMask {
    /// No descriptors are leaked.
    pub const NONE: Self = Self(0);
    /// The accept loop keeps its copy of every client socket.
    pub const CLIENT: Self = Self(0x1);
    /// Workers keep the listening socket and rejoin the accept loop.
    pub const LISTENER: Self = Self(0x2);
    /// Both leaks; what a bare `--leak` selects.
    pub const ALL: Self = Self(0x3);

    /// Build a mask from raw bits, dropping anything outside `ALL`.
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits & Self::ALL.0)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn leaks_client(self) -> bool {
        self.contains(Self::CLIENT)
    }

    pub const fn leaks_listener(self) -> bool {
        self.contains(Self::LISTENER)
    }

    /// Parse a command-line leak value.
    ///
    /// Accepts decimal or `0x`-prefixed hex. Unparseable input counts as 0.
    /// A value selecting neither leak falls back to [`LeakMask::ALL`]; the
    /// second element reports whether that fallback happened so the caller
    /// can warn about it.
    pub fn parse_lenient(value: &str) -> (Self, bool) {
        let value = value.trim();
        let parsed = match value
            .strip_prefix("0x")
            .or_else(|| value.strip_prefix("0X"))
        {
            Some(hex) => i64::from_str_radix(hex, 16).unwrap_or(0),
            None => value.parse::<i64>().unwrap_or(0),
        };

        let mask = Self::from_bits((parsed & i64::from(Self::ALL.0)) as u8);
        if mask.is_empty() {
            (Self::ALL, true)
        } else {
            (mask, false)
        }
    }
}

impl From<u8> for LeakMask {
    fn from(bits: u8) -> Self {
        Self::from_bits(bits)
    }
}

impl From<LeakMask> for u8 {
    fn from(mask: LeakMask) -> Self {
        mask.0
    }
}

impl std::fmt::Display for LeakMask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
