/// Alphabet for generated short codes
const CODE_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Length of generated short codes
pub const CODE_LENGTH: usize = 8;

pub fn generate_random_code(length: usize) -> String {
    use std::iter;

    iter::repeat_with(|| CODE_CHARS[rand::random_range(0..CODE_CHARS.len())] as char)
        .take(length)
        .collect()
}

/// Custom aliases allow the generated alphabet plus underscore and hyphen
pub fn is_valid_code(code: &str) -> bool {
    !code.is_empty()
        && code.len() <= 64
        && code
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}
