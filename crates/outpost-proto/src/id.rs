//! Request-id minting
//!
//! Ids must be unique within a registration. A millisecond timestamp plus a
//! random suffix is sufficient: collisions would require two mints in the
//! same millisecond drawing the same 24-bit suffix.

use chrono::Utc;

/// Mint a request id for a newly arrived public request
pub fn mint_request_id() -> String {
    let suffix: u32 = rand::random::<u32>() & 0xff_ffff;
    format!("{}-{:06x}", Utc::now().timestamp_millis(), suffix)
}
