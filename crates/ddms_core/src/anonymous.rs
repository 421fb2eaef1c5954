//! Masking of identifiers before they reach the logs.

const HEAD_SIZE: usize = 3;
const END_SIZE: usize = 3;
const MIN_SIZE: usize = 9;
const REPLACE_CHAIN: &str = "***";
const DEFAULT_ANONYMOUS: &str = "******";

/// Masks a device id, network id or store name for logging.
///
/// Short ids are replaced entirely; longer ones keep a few leading and
/// trailing characters so log lines can still be correlated.
pub fn change(id: &str) -> String {
    let chars: Vec<char> = id.chars().collect();
    if chars.len() < HEAD_SIZE {
        return DEFAULT_ANONYMOUS.to_string();
    }
    let head: String = chars[..HEAD_SIZE].iter().collect();
    if chars.len() < MIN_SIZE {
        return format!("{head}{REPLACE_CHAIN}");
    }
    let tail: String = chars[chars.len() - END_SIZE..].iter().collect();
    format!("{head}{REPLACE_CHAIN}{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_by_length() {
        assert_eq!(change(""), "******");
        assert_eq!(change("ab"), "******");
        assert_eq!(change("abcdef"), "abc***");
        assert_eq!(change("0123456789abcdef"), "012***def");
    }
}
