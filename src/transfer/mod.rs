//! # Transfer Session
//!
//! Sender- and receiver-side state machines for a single file transfer.
//! See SPEC_FULL.md §3 (data model) and §4.4/§4.5 (protocol).

pub mod receiver;
pub mod sender;

use rand::Rng;

pub use receiver::{ReceiverSession, ReceiverState};
pub use sender::{SenderSession, SenderState};

/// Maximum length, in bytes, a sanitized filename is truncated to before
/// it is placed in a BEGIN frame.
pub const FILENAME_MAX_LEN: usize = 48;

const TRANSFER_ID_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
const TRANSFER_ID_LEN: usize = 8;

/// Generate a fresh transfer id: an opaque, uniformly random, ≥6-character
/// printable token, chosen by the sender to scope a transfer across its
/// control and data frames.
pub fn generate_transfer_id() -> String {
    let mut rng = rand::thread_rng();
    (0..TRANSFER_ID_LEN)
        .map(|_| {
            let idx = rng.gen_range(0..TRANSFER_ID_ALPHABET.len());
            TRANSFER_ID_ALPHABET[idx] as char
        })
        .collect()
}

// ============================================================================
// TESTS
// ============================================================================
