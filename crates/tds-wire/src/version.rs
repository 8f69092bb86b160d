//! TDS protocol versions.

use core::fmt;

/// A TDS protocol version as carried on the wire.
///
/// The client requests a version in LOGIN7 and adopts whatever the server
/// acknowledges in the LOGINACK token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TdsVersion(u32);

impl TdsVersion {
    /// TDS 7.1 (SQL Server 2000).
    pub const V7_1: Self = Self(0x7100_0000);
    /// TDS 7.1 revision 1 (SQL Server 2000 SP1).
    pub const V7_1_REV1: Self = Self(0x7100_0001);
    /// TDS 7.2 (SQL Server 2005).
    pub const V7_2: Self = Self(0x7209_0002);
    /// TDS 7.3A (SQL Server 2008).
    pub const V7_3A: Self = Self(0x730A_0003);
    /// TDS 7.3B (SQL Server 2008 R2).
    pub const V7_3B: Self = Self(0x730B_0003);
    /// TDS 7.4 (SQL Server 2012 and later).
    pub const V7_4: Self = Self(0x7400_0004);

    /// Wrap a raw wire value, e.g. one taken from a LOGINACK token.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// The raw wire value.
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Whether this version carries transaction-manager support and the
    /// ALL_HEADERS request prefix (introduced with TDS 7.2).
    #[must_use]
    pub const fn supports_transactions(self) -> bool {
        self.0 >= Self::V7_2.0
    }

    /// Whether the server acknowledged a version this driver can speak.
    #[must_use]
    pub const fn is_supported(self) -> bool {
        self.0 >= Self::V7_1.0 && self.0 <= Self::V7_4.0
    }

    /// Parse a configuration key such as `"7_4"` or `"7_3_B"`.
    #[must_use]
    pub fn parse(key: &str) -> Option<Self> {
        match key {
            "7_1" => Some(Self::V7_1),
            "7_1_1" => Some(Self::V7_1_REV1),
            "7_2" => Some(Self::V7_2),
            "7_3_A" => Some(Self::V7_3A),
            "7_3_B" => Some(Self::V7_3B),
            "7_4" => Some(Self::V7_4),
            _ => None,
        }
    }

    /// The configuration key for this version.
    #[must_use]
    pub const fn key(self) -> &'static str {
        match self.0 {
            0x7100_0000 => "7_1",
            0x7100_0001 => "7_1_1",
            0x7209_0002 => "7_2",
            0x730A_0003 => "7_3_A",
            0x730B_0003 => "7_3_B",
            0x7400_0004 => "7_4",
            _ => "unknown",
        }
    }
}

impl Default for TdsVersion {
    fn default() -> Self {
        Self::V7_4
    }
}

impl fmt::Display for TdsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TDS {}", self.key())
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn ordering_follows_wire_values() {
        assert!(TdsVersion::V7_4 > TdsVersion::V7_3B);
        assert!(TdsVersion::V7_3B > TdsVersion::V7_3A);
        assert!(TdsVersion::V7_2 > TdsVersion::V7_1_REV1);
    }

    #[test]
    fn transaction_support_starts_at_7_2() {
        assert!(!TdsVersion::V7_1.supports_transactions());
        assert!(!TdsVersion::V7_1_REV1.supports_transactions());
        assert!(TdsVersion::V7_2.supports_transactions());
        assert!(TdsVersion::V7_4.supports_transactions());
    }

    #[test]
    fn parse_and_key_are_inverse() {
        for key in ["7_1", "7_1_1", "7_2", "7_3_A", "7_3_B", "7_4"] {
            let version = TdsVersion::parse(key).expect("known key");
            assert_eq!(version.key(), key);
        }
        assert_eq!(TdsVersion::parse("8_0"), None);
    }
}
