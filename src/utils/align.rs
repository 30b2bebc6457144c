//! Checksum-block and stripe alignment helpers.
//!
//! All functions here are pure and deterministic; they decide how big the
//! streamed reads of a replication or recovery should be so that every
//! write lands on a checksum block boundary (except a single final tail).

use crate::chunk::{CHECKSUM_BLOCK_SIZE, DEFAULT_IO_BUFFER_SIZE};

/// Greatest common divisor.
pub fn gcd(nl: i64, nr: i64) -> i64 {
    let (mut a, mut b) = (nl, nr);
    while b != 0 {
        let t = b;
        b = a % b;
        a = t;
    }
    a
}

/// Least common multiple; zero if either input is zero.
pub fn lcm(nl: i64, nr: i64) -> i64 {
    if nl == 0 || nr == 0 {
        0
    } else {
        nl / gcd(nl, nr) * nr
    }
}

/// Rounds `n` up to the next multiple of `unit`.
pub fn align_up(n: i64, unit: i64) -> i64 {
    (n + unit - 1) / unit * unit
}

/// Rounds `n` down to a multiple of `unit`.
pub fn align_down(n: i64, unit: i64) -> i64 {
    n / unit * unit
}

/// Default replication read size: the smallest multiple of the checksum
/// block size that is >= 1 MiB.
pub fn replication_read_size() -> usize {
    align_up(1 << 20, CHECKSUM_BLOCK_SIZE as i64) as usize
}

/// Derives the per-read size for RS recovery. The read must be a checksum
/// block multiple, fit the per-client buffer quota split across
/// `num_stripes + 1` concurrent stripe buffers, and, when it spans more
/// than one stripe, also be stripe aligned.
pub fn rs_read_size(
    max_read_size: usize,
    stripe_size: usize,
    client_quota: i64,
    num_stripes: i32,
) -> usize {
    let block = CHECKSUM_BLOCK_SIZE as i64;
    let io_buf = DEFAULT_IO_BUFFER_SIZE as i64;
    let max_read = align_up(max_read_size as i64, block);
    let stripe = stripe_size as i64;
    debug_assert!(stripe > 0 && block % io_buf == 0);

    let per_client =
        align_down(client_quota / (num_stripes as i64 + 1).max(1), block);
    let size = block.max(max_read.min(per_client));
    if size <= stripe {
        pf_debug!("align";
            "large stripe: {} read size: {}", stripe, size);
        return size as usize;
    }
    let mut step = lcm(block, stripe);
    if step > size {
        step = lcm(io_buf, stripe);
        if step > size {
            pf_warn!("align";
                "invalid read parameters: max read size: {} \
                io buffer size: {} stripe size: {} set read size: {}",
                max_read, io_buf, stripe, step);
            return step as usize;
        }
    }
    align_down(size, step) as usize
}

#[cfg(test)]
mod align_tests {
    use super::*;

    #[test]
    fn gcd_lcm_basics() {
        assert_eq!(gcd(12, 18), 6);
        assert_eq!(gcd(18, 12), 6);
        assert_eq!(gcd(7, 0), 7);
        assert_eq!(lcm(4, 6), 12);
        assert_eq!(lcm(0, 6), 0);
        assert_eq!(lcm(65536, 65536), 65536);
    }

    #[test]
    fn rounding() {
        assert_eq!(align_up(1, 65536), 65536);
        assert_eq!(align_up(65536, 65536), 65536);
        assert_eq!(align_up(65537, 65536), 2 * 65536);
        assert_eq!(align_down(65537, 65536), 65536);
        assert_eq!(align_down(65535, 65536), 0);
    }

    #[test]
    fn default_read_size() {
        let size = replication_read_size();
        assert_eq!(size, 1 << 20);
        assert_eq!(size % CHECKSUM_BLOCK_SIZE, 0);
    }

    #[test]
    fn read_size_block_stripe() {
        // stripe equal to the checksum block: read size stays at the max
        let size = rs_read_size(1 << 20, 65536, i64::MAX / 2, 6);
        assert_eq!(size, 1 << 20);
        assert_eq!(size % CHECKSUM_BLOCK_SIZE, 0);
        assert_eq!(size % 65536, 0);
    }

    #[test]
    fn read_size_large_stripe() {
        // stripe bigger than the whole read: no stripe alignment needed
        let size = rs_read_size(1 << 20, 4 << 20, i64::MAX / 2, 6);
        assert_eq!(size, 1 << 20);
    }

    #[test]
    fn read_size_odd_stripe() {
        // 96 KiB stripes: lcm(64Ki, 96Ki) = 192 KiB, 1 MiB floors to 960 KiB
        let size = rs_read_size(1 << 20, 96 << 10, i64::MAX / 2, 6);
        assert_eq!(size, 983040);
        assert_eq!(size % CHECKSUM_BLOCK_SIZE, 0);
        assert_eq!(size % (96 << 10), 0);
    }

    #[test]
    fn read_size_quota_bound() {
        // quota split across num_stripes + 1 buffers floors the read size
        let quota = 7 * (256 << 10);
        let size = rs_read_size(1 << 20, 65536, quota, 6);
        assert_eq!(size, 256 << 10);
    }

    #[test]
    fn read_size_never_below_block() {
        let size = rs_read_size(1 << 20, 65536, 1, 6);
        assert_eq!(size, CHECKSUM_BLOCK_SIZE);
    }

    #[test]
    fn read_size_bounded_by_max_read() {
        for stripe in [4 << 10, 64 << 10, 96 << 10, 1 << 20] {
            let size = rs_read_size(1 << 20, stripe, i64::MAX / 2, 9);
            assert!(size <= 1 << 20);
            assert_eq!(size % CHECKSUM_BLOCK_SIZE, 0);
        }
    }
}
