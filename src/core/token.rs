//! Short, filesystem-safe group tokens.

use uuid::Uuid;

const ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Draw a `len`-character base-36 token from a v4 UUID.
/// `len` beyond 20 characters adds no entropy.
pub fn generate_group_token(len: usize) -> String {
    let mut bits = Uuid::new_v4().as_u128();
    let mut token = String::with_capacity(len);
    for _ in 0..len {
        token.push(ALPHABET[(bits % 36) as usize] as char);
        bits /= 36;
    }
    token
}
