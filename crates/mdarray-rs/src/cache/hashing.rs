use serde::Serialize;

const FNV1A_OFFSET: u64 = 0xcbf29ce484222325;
const FNV1A_PRIME: u64 = 0x100000001b3;

pub fn fnv1a_init() -> u64 {
    FNV1A_OFFSET
}

pub fn fnv1a_bytes(mut hash: u64, bytes: &[u8]) -> u64 {
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV1A_PRIME);
    }
    hash
}

pub fn fnv1a_hash(bytes: &[u8]) -> u64 {
    fnv1a_bytes(fnv1a_init(), bytes)
}

/// Hashes the bincode encoding of `value`; encoding failures hash to `0`.
pub fn hash_serialized<T: Serialize>(value: &T) -> u64 {
    match bincode::serialize(value) {
        Ok(bytes) => fnv1a_hash(&bytes),
        Err(_) => 0,
    }
}
