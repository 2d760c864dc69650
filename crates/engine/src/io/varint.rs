//! LEB128 and zig-zag varint helpers.

/// Longest encoding of a 64-bit varint.
pub const MAX_VARINT_LEN: usize = 10;

/// Encodes `value` as LEB128 into `buf`, returning the number of bytes used.
pub fn encode_u64(mut value: u64, buf: &mut [u8; MAX_VARINT_LEN]) -> usize {
    let mut len = 0;
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf[len] = byte;
            return len + 1;
        }
        buf[len] = byte | 0x80;
        len += 1;
    }
}

/// Number of bytes `value` takes once LEB128 encoded.
pub fn compute_u64_size(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.max(1).div_ceil(7)
}

/// Number of bytes `value` takes once zig-zag encoded.
pub fn compute_i64_size(value: i64) -> usize {
    compute_u64_size(zigzag_encode(value))
}

/// Maps signed integers onto unsigned ones so small magnitudes stay short.
pub fn zigzag_encode(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

/// Inverse of [`zigzag_encode`].
pub fn zigzag_decode(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zigzag() {
        assert_eq!(zigzag_encode(0), 0);
        assert_eq!(zigzag_encode(-1), 1);
        assert_eq!(zigzag_encode(1), 2);
        assert_eq!(zigzag_encode(-2), 3);
        for value in [i64::MIN, -7, 0, 9, i64::MAX] {
            assert_eq!(zigzag_decode(zigzag_encode(value)), value);
        }
    }

    #[test]
    fn test_sizes_match_encoding() {
        let mut buf = [0u8; MAX_VARINT_LEN];
        for value in [0u64, 1, 127, 128, 16_383, 16_384, u32::MAX as u64, u64::MAX] {
            assert_eq!(encode_u64(value, &mut buf), compute_u64_size(value));
        }
        assert_eq!(compute_u64_size(u64::MAX), MAX_VARINT_LEN);
        assert_eq!(compute_i64_size(-1), 1);
        assert_eq!(compute_i64_size(i64::MIN), MAX_VARINT_LEN);
    }

    #[test]
    fn test_encode_300() {
        let mut buf = [0u8; MAX_VARINT_LEN];
        let len = encode_u64(300, &mut buf);
        assert_eq!(&buf[..len], &[0xac, 0x02]);
    }
}
