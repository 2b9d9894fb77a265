use bytes::Bytes;
use crc::{Crc, CRC_32_ISCSI};

/// Chunks and parameters are padded out to multiples of 4 bytes on the wire.
pub(crate) const PADDING_MULTIPLE: usize = 4;

pub(crate) fn get_padding_size(len: usize) -> usize {
    (PADDING_MULTIPLE - (len % PADDING_MULTIPLE)) % PADDING_MULTIPLE
}

pub(crate) const ISCSI_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

static ZERO_CHECKSUM_FIELD: [u8; 4] = [0, 0, 0, 0];

/// Computes the CRC32C over a whole packet with the checksum field taken as
/// zero, without touching the input buffer.
pub(crate) fn generate_packet_checksum(raw: &Bytes) -> u32 {
    let mut digest = ISCSI_CRC.digest();
    digest.update(&raw[..8]);
    digest.update(&ZERO_CHECKSUM_FIELD);
    digest.update(&raw[12..]);
    digest.finalize()
}

// Serial number arithmetic, RFC 1982. TSN, SSN and RSN comparisons must all
// go through these; plain integer comparison breaks at the wrap point.

#[inline]
pub(crate) fn sna32lt(i1: u32, i2: u32) -> bool {
    (i1 < i2 && i2 - i1 < 1 << 31) || (i1 > i2 && i1 - i2 > 1 << 31)
}

#[inline]
pub(crate) fn sna32lte(i1: u32, i2: u32) -> bool {
    i1 == i2 || sna32lt(i1, i2)
}

#[inline]
pub(crate) fn sna32gt(i1: u32, i2: u32) -> bool {
    (i1 < i2 && i2 - i1 >= 1 << 31) || (i1 > i2 && i1 - i2 <= 1 << 31)
}

#[inline]
pub(crate) fn sna32gte(i1: u32, i2: u32) -> bool {
    i1 == i2 || sna32gt(i1, i2)
}

#[inline]
pub(crate) fn sna16lt(i1: u16, i2: u16) -> bool {
    (i1 < i2 && i2 - i1 < 1 << 15) || (i1 > i2 && i1 - i2 > 1 << 15)
}

#[inline]
pub(crate) fn sna16lte(i1: u16, i2: u16) -> bool {
    i1 == i2 || sna16lt(i1, i2)
}

#[inline]
pub(crate) fn sna16gt(i1: u16, i2: u16) -> bool {
    (i1 < i2 && i2 - i1 >= 1 << 15) || (i1 > i2 && i1 - i2 <= 1 << 15)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_padding_size() {
        assert_eq!(get_padding_size(0), 0);
        assert_eq!(get_padding_size(1), 3);
        assert_eq!(get_padding_size(2), 2);
        assert_eq!(get_padding_size(3), 1);
        assert_eq!(get_padding_size(4), 0);
        assert_eq!(get_padding_size(13), 3);
    }

    #[test]
    fn test_sna32_basic() {
        assert!(sna32lt(0, 1));
        assert!(sna32lt(u32::MAX, 0), "wrap: MAX < 0");
        assert!(sna32gt(0, u32::MAX), "wrap: 0 > MAX");
        assert!(!sna32lt(5, 5));
        assert!(sna32lte(5, 5));
        assert!(sna32gte(5, 5));
    }

    #[test]
    fn test_sna32_half_range_boundary() {
        // Distances below 2^31 compare forward, at or above compare backward.
        for base in [0u32, 1 << 30, 1 << 31, u32::MAX - 7] {
            let fwd = base.wrapping_add((1 << 30) - 1);
            let bwd = base.wrapping_add(1 << 31);
            assert!(sna32lt(base, fwd), "base={base}");
            assert!(!sna32lt(base, bwd), "base={base}");
            assert!(sna32gt(base, bwd), "base={base}");
            assert!(!sna32gt(base, fwd), "base={base}");
            assert!(sna32lte(base, fwd), "base={base}");
            assert!(sna32gte(base, bwd), "base={base}");
        }
    }

    #[test]
    fn test_sna16_half_range_boundary() {
        for base in [0u16, 1 << 14, 1 << 15, u16::MAX - 3] {
            let fwd = base.wrapping_add((1 << 14) - 1);
            let bwd = base.wrapping_add(1 << 15);
            assert!(sna16lt(base, fwd), "base={base}");
            assert!(!sna16lt(base, bwd), "base={base}");
            assert!(sna16gt(base, bwd), "base={base}");
            assert!(!sna16gt(base, fwd), "base={base}");
            assert!(sna16lte(base, fwd), "base={base}");
        }
    }
}
