// Page checksum helpers.
//
// The checksum is a CRC32 over the page bytes, excluding the 4-byte checksum
// slot itself so the stored value does not feed its own computation.

/// Byte offset of the checksum slot inside the page header.
pub const CHECKSUM_OFFSET: usize = 20;

/// Compute the checksum of a page image.
pub fn page_checksum(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&data[..CHECKSUM_OFFSET]);
    hasher.update(&data[CHECKSUM_OFFSET + 4..]);
    hasher.finalize()
}

/// Read the stored checksum slot.
pub fn stored_checksum(data: &[u8]) -> u32 {
    u32::from_le_bytes([
        data[CHECKSUM_OFFSET],
        data[CHECKSUM_OFFSET + 1],
        data[CHECKSUM_OFFSET + 2],
        data[CHECKSUM_OFFSET + 3],
    ])
}

/// Recompute and store the checksum into its slot.
pub fn update_page_checksum(data: &mut [u8]) {
    let checksum = page_checksum(data);
    data[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].copy_from_slice(&checksum.to_le_bytes());
}

/// True when the stored checksum matches the page contents.
pub fn verify_page_checksum(data: &[u8]) -> bool {
    stored_checksum(data) == page_checksum(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::PAGE_SIZE;

    #[test]
    fn test_checksum_round_trip() {
        let mut data = vec![0u8; PAGE_SIZE];
        data[100] = 0xAB;
        update_page_checksum(&mut data);
        assert!(verify_page_checksum(&data));
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let mut data = vec![0u8; PAGE_SIZE];
        data[200] = 0x42;
        update_page_checksum(&mut data);
        data[201] ^= 0xFF;
        assert!(!verify_page_checksum(&data));
    }

    #[test]
    fn test_checksum_slot_is_excluded() {
        let mut data = vec![7u8; PAGE_SIZE];
        let before = page_checksum(&data);
        update_page_checksum(&mut data);
        assert_eq!(before, page_checksum(&data));
    }
}
