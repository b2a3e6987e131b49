//! Ownership token generation.

use rand::rngs::OsRng;
use rand::RngCore;
use tracing::warn;

/// Tokens are non-negative integers below 2^62.
const TOKEN_MASK: u64 = (1 << 62) - 1;

/// Generate an ownership token for a lock instance.
///
/// Draws from the OS random source. If that is unavailable the token falls
/// back to the current time in nanoseconds: the lock keeps working, but two
/// instances created in the same nanosecond would share a token, so the
/// fallback trades uniqueness strength for availability.
pub fn generate_token() -> String {
    let mut bytes = [0u8; 8];
    match OsRng.try_fill_bytes(&mut bytes) {
        Ok(()) => (u64::from_le_bytes(bytes) & TOKEN_MASK).to_string(),
        Err(e) => {
            warn!(error = %e, "OS randomness unavailable, using timestamp token");
            timestamp_token()
        }
    }
}

fn timestamp_token() -> String {
    chrono::Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_default()
        .to_string()
}
