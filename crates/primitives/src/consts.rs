/// The total addressable memory of a VM instance, in bytes.
pub const VM_MAX_RAM: u64 = 64 * 1024 * 1024;

/// The maximum size of a single loaded contract, in bytes.
pub const CONTRACT_MAX_SIZE: u64 = 16 * 1024 * 1024;

/// The size of a word in bytes.
pub const WORD_SIZE: usize = 8;

/// The width of a contract identifier in bytes.
pub const CONTRACT_ID_SIZE: usize = 32;

/// Encodes a word as little endian bytes.
pub const fn word_to_bytes_le(word: u64) -> [u8; WORD_SIZE] {
    word.to_le_bytes()
}

/// Decodes a word from little endian bytes.
pub const fn bytes_to_word_le(bytes: [u8; WORD_SIZE]) -> u64 {
    u64::from_le_bytes(bytes)
}

// Converts a num to a string with commas every 3 digits.
pub fn num_to_comma_separated<T: ToString>(value: T) -> String {
    value
        .to_string()
        .chars()
        .rev()
        .collect::<Vec<_>>()
        .chunks(3)
        .map(|chunk| chunk.iter().collect::<String>())
        .collect::<Vec<_>>()
        .join(",")
        .chars()
        .rev()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry_defaults() {
        assert_eq!(VM_MAX_RAM, 67_108_864);
        assert_eq!(CONTRACT_MAX_SIZE, 16_777_216);
    }

    #[test]
    fn test_word_round_trip() {
        let bytes = word_to_bytes_le(0x0102030405060708);
        assert_eq!(bytes, [0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]);
        assert_eq!(bytes_to_word_le(bytes), 0x0102030405060708);
    }

    #[test]
    fn test_num_to_comma_separated() {
        assert_eq!(num_to_comma_separated(1000), "1,000");
        assert_eq!(num_to_comma_separated(1000000), "1,000,000");
        assert_eq!(num_to_comma_separated(VM_MAX_RAM), "67,108,864");
    }
}
