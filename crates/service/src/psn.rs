//! Packet sequence number issuance.
//!
//! A PSN predictable to an off-path attacker lets captured packets be
//! replayed into a later connection, so every value here comes from the
//! operating system's CSPRNG. If the entropy source fails the call
//! fails; there is no clock or PID fallback.

use codec::Psn;
use rand::{TryRngCore, rngs::OsRng};

#[derive(Debug)]
pub enum PsnError {
    /// Neither the platform CSPRNG nor the OS entropy device produced
    /// bytes.
    EntropyUnavailable,
}

impl std::error::Error for PsnError {}

impl std::fmt::Display for PsnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EntropyUnavailable => write!(f, "no usable entropy source for PSN generation"),
        }
    }
}

/// Draw a fresh 24-bit PSN.
///
/// The low bit is forced to 1 so the value is never zero; the high 8
/// bits are always zero. Concurrent callers draw independent values.
pub fn fresh_psn() -> Result<Psn, PsnError> {
    let mut raw = [0u8; 4];
    OsRng
        .try_fill_bytes(&mut raw)
        .map_err(|_| PsnError::EntropyUnavailable)?;

    Ok(Psn::shaped(u32::from_be_bytes(raw)))
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::fresh_psn;
    use codec::PSN_MASK;

    #[test]
    fn psn_shape() {
        for _ in 0..256 {
            let psn = fresh_psn().unwrap().value();
            assert_ne!(psn, 0);
            assert_eq!(psn & !PSN_MASK, 0);
            assert_eq!(psn & 1, 1);
        }
    }

    #[test]
    fn psn_uniqueness() {
        // Ten connections contribute twenty PSNs; in a 24-bit space the
        // odds of any collision among twenty draws are about 2^-15 per
        // trial, so repeated trials must keep producing distinct sets.
        for _ in 0..8 {
            let drawn: HashSet<u32> = (0..20).map(|_| fresh_psn().unwrap().value()).collect();
            assert_eq!(drawn.len(), 20);
        }
    }
}
