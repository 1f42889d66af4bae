//! CRC-64 integrity checks.
//!
//! The checksum is CRC-64 with the Jones polynomial (`0xad93d23594c935a9`),
//! reflected input and output, initial value and final XOR of all ones.
//!
//! # Invert-to-sentinel trailers
//! Every payload on disk is followed by an 8-byte trailer holding the
//! bitwise complement of the payload CRC in little-endian order.  Running
//! the CRC over `payload ‖ trailer` then always yields [`CRC_SENTINEL`], so
//! verification is a single equality check and needs no knowledge of where
//! the payload ends.  The trailer is little-endian regardless of the file's
//! declared endianness: it is a property of the CRC register, not a field.

/// Byte length of every CRC trailer.
pub const CRC_SIZE: usize = 8;

/// Value of `crc64(payload ‖ trailer)` for any intact payload.
pub const CRC_SENTINEL: u64 = u64::MAX;

/// Reflected form of the Jones polynomial.
const POLY_REFLECTED: u64 = 0x95ac_9329_ac4b_c9b5;

const TABLE: [u64; 256] = build_table();

const fn build_table() -> [u64; 256] {
    let mut table = [0u64; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u64;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ POLY_REFLECTED } else { crc >> 1 };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

#[inline]
fn update_register(mut reg: u64, data: &[u8]) -> u64 {
    for &byte in data {
        reg = TABLE[((reg ^ byte as u64) & 0xff) as usize] ^ (reg >> 8);
    }
    reg
}

// ── Streaming hasher ─────────────────────────────────────────────────────────

/// Incremental CRC-64, for checks over data that is not contiguous in memory
/// (a payload in the caller's buffer plus a trailer read separately).
#[derive(Debug, Clone, Copy)]
pub struct Crc64 {
    reg: u64,
}

impl Default for Crc64 {
    fn default() -> Self {
        Self::new()
    }
}

impl Crc64 {
    pub fn new() -> Self {
        Self { reg: !0 }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.reg = update_register(self.reg, data);
    }

    pub fn finish(&self) -> u64 {
        !self.reg
    }
}

/// CRC-64 of `data`.
pub fn crc64(data: &[u8]) -> u64 {
    !update_register(!0, data)
}

/// The trailer that makes `crc64(payload ‖ trailer) == CRC_SENTINEL`,
/// given `crc = crc64(payload)`.
pub fn crc64_trailer(crc: u64) -> [u8; CRC_SIZE] {
    (!crc).to_le_bytes()
}

/// True when `framed` (payload followed by its trailer) is intact.
pub fn verify_framed(framed: &[u8]) -> bool {
    crc64(framed) == CRC_SENTINEL
}

// ── Combination ──────────────────────────────────────────────────────────────

fn gf2_matrix_times(mat: &[u64; 64], mut vec: u64) -> u64 {
    let mut sum = 0u64;
    let mut i = 0;
    while vec != 0 {
        if vec & 1 != 0 {
            sum ^= mat[i];
        }
        vec >>= 1;
        i += 1;
    }
    sum
}

fn gf2_matrix_square(square: &mut [u64; 64], mat: &[u64; 64]) {
    for n in 0..64 {
        square[n] = gf2_matrix_times(mat, mat[n]);
    }
}

/// CRC of `A ‖ B` from `crc64(A)`, `crc64(B)` and the length of `B`.
pub fn crc64_combine(mut crc1: u64, crc2: u64, mut len2: u64) -> u64 {
    if len2 == 0 {
        return crc1;
    }

    let mut even = [0u64; 64];
    let mut odd = [0u64; 64];

    // Operator for one zero bit.
    odd[0] = POLY_REFLECTED;
    let mut row = 1u64;
    for slot in odd.iter_mut().skip(1) {
        *slot = row;
        row <<= 1;
    }

    gf2_matrix_square(&mut even, &odd); // two zero bits
    gf2_matrix_square(&mut odd, &even); // four zero bits

    loop {
        gf2_matrix_square(&mut even, &odd);
        if len2 & 1 != 0 {
            crc1 = gf2_matrix_times(&even, crc1);
        }
        len2 >>= 1;
        if len2 == 0 {
            break;
        }

        gf2_matrix_square(&mut odd, &even);
        if len2 & 1 != 0 {
            crc1 = gf2_matrix_times(&odd, crc1);
        }
        len2 >>= 1;
        if len2 == 0 {
            break;
        }
    }

    crc1 ^ crc2
}

// ── Parallel evaluation ─────────────────────────────────────────────────────

/// Slice size handed to each worker by [`crc64_parallel`].
pub const PARALLEL_CHUNK: usize = 4 * 1024 * 1024;

/// CRC-64 of `data`, split across the rayon pool for large inputs.
#[cfg(feature = "parallel")]
pub fn crc64_parallel(data: &[u8]) -> u64 {
    use rayon::prelude::*;

    if data.len() <= PARALLEL_CHUNK {
        return crc64(data);
    }
    let parts: Vec<(u64, u64)> = data
        .par_chunks(PARALLEL_CHUNK)
        .map(|chunk| (crc64(chunk), chunk.len() as u64))
        .collect();
    let mut iter = parts.into_iter();
    let (first, _) = iter.next().unwrap_or((crc64(&[]), 0));
    iter.fold(first, |acc, (crc, len)| crc64_combine(acc, crc, len))
}

/// CRC-64 of `data`; sequential without the `parallel` feature.
#[cfg(not(feature = "parallel"))]
pub fn crc64_parallel(data: &[u8]) -> u64 {
    crc64(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn jones_register_check_value() {
        // crc-64-jones with zero init and no final XOR.
        assert_eq!(update_register(0, b"123456789"), 0xe9c6_d914_c4b8_d9ca);
    }

    #[test]
    fn streaming_matches_one_shot() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i * 31 % 251) as u8).collect();
        let mut h = Crc64::new();
        for chunk in data.chunks(333) {
            h.update(chunk);
        }
        assert_eq!(h.finish(), crc64(&data));
    }

    #[test]
    fn empty_payload_frames_to_sentinel() {
        let trailer = crc64_trailer(crc64(&[]));
        assert!(verify_framed(&trailer));
    }

    #[test]
    fn single_byte_flip_is_detected() {
        let mut framed: Vec<u8> = b"particle positions".to_vec();
        let trailer = crc64_trailer(crc64(&framed));
        framed.extend_from_slice(&trailer);
        for i in 0..framed.len() {
            let mut bad = framed.clone();
            bad[i] ^= 0x40;
            assert!(!verify_framed(&bad), "flip at {i} went unnoticed");
        }
    }

    #[test]
    fn parallel_matches_sequential() {
        let data: Vec<u8> = (0..(PARALLEL_CHUNK * 2 + 17)).map(|i| (i % 253) as u8).collect();
        assert_eq!(crc64_parallel(&data), crc64(&data));
    }

    proptest! {
        #[test]
        fn trailer_always_yields_sentinel(payload in proptest::collection::vec(any::<u8>(), 0..2048)) {
            let mut framed = payload.clone();
            framed.extend_from_slice(&crc64_trailer(crc64(&payload)));
            prop_assert_eq!(crc64(&framed), CRC_SENTINEL);
        }

        #[test]
        fn combine_matches_concatenation(
            a in proptest::collection::vec(any::<u8>(), 0..512),
            b in proptest::collection::vec(any::<u8>(), 0..512),
        ) {
            let mut ab = a.clone();
            ab.extend_from_slice(&b);
            prop_assert_eq!(crc64_combine(crc64(&a), crc64(&b), b.len() as u64), crc64(&ab));
        }
    }
}
