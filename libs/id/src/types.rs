//! Typed ID definitions for provider resources.

use crate::define_id;

// =============================================================================
// Compute
// =============================================================================

define_id!(InstanceId, "i");

// =============================================================================
// Storage
// =============================================================================

define_id!(VolumeId, "vol");
define_id!(SnapshotId, "snap");

// =============================================================================
// Remote commands
// =============================================================================

define_id!(CommandId, "cmd");

#[doc(hidden)]
pub mod __private {
    use crate::IdError;

    const SHORT_LEN: usize = 8;
    const LONG_LEN: usize = 17;

    /// 17 lowercase hex digits (68 random bits).
    pub fn random_hex() -> String {
        let bits: u128 = rand::random::<u128>() & ((1u128 << 68) - 1);
        format!("{:017x}", bits)
    }

    pub fn validate_hex(hex: &str) -> Result<(), IdError> {
        if hex.len() != SHORT_LEN && hex.len() != LONG_LEN {
            return Err(IdError::InvalidLength(hex.len()));
        }
        if !hex
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
        {
            return Err(IdError::InvalidHex(hex.to_string()));
        }
        Ok(())
    }
}
