//! Key hashing
//!
//! Keys are hashed to 31 bits. The top bits select a directory slot, the
//! value modulo the bucket size selects the home slot inside the bucket.

/// Number of significant bits in a key hash
pub const HASH_BITS: u32 = 31;

/// Number of leading key bytes cached in every bucket entry
pub const KEY_START: usize = 4;

/// Hash a key to a 31-bit value
pub fn hash_key(key: &[u8]) -> u32 {
    let mut value: u32 = 0x238F_13AFu32.wrapping_mul(key.len() as u32);
    for (index, &byte) in key.iter().enumerate() {
        let shift = (index * 5 % 24) as u32;
        value = value.wrapping_add((byte as u32) << shift) & 0x7FFF_FFFF;
    }
    1_103_515_243u32.wrapping_mul(value).wrapping_add(12345) & 0x7FFF_FFFF
}

/// Directory slot for `hash` in a directory of `dir_bits` bits
pub fn dir_index(hash: u32, dir_bits: u32) -> usize {
    if dir_bits == 0 {
        0
    } else {
        (hash >> (HASH_BITS - dir_bits)) as usize
    }
}

/// The hash bit that decides which half of a split a key goes to, for a
/// bucket whose local depth becomes `new_bits`
pub fn split_bit(hash: u32, new_bits: u32) -> u32 {
    (hash >> (HASH_BITS - new_bits)) & 1
}

/// Leading key bytes stored in a bucket entry, zero padded
pub fn key_start(key: &[u8]) -> [u8; KEY_START] {
    let mut start = [0u8; KEY_START];
    let n = key.len().min(KEY_START);
    start[..n].copy_from_slice(&key[..n]);
    start
}
