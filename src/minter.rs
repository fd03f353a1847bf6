use rand::Rng;

pub const CODE_LENGTH: usize = 5;

/// Consecutive collisions tolerated before minting gives up
pub const MAX_ATTEMPTS: usize = 5;

const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Sample a fresh short code uniformly from `[a-zA-Z0-9]`.
///
/// The thread-local generator is a CSPRNG seeded from the OS.
pub fn generate_code() -> String {
    let mut rng = rand::rng();
    (0..CODE_LENGTH)
        .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
        .collect()
}

pub fn is_valid_code(code: &str) -> bool {
    !code.is_empty() && code.bytes().all(|b| b.is_ascii_alphanumeric())
}
