/// Builders for records and raw events used across the unit tests.
#[cfg(test)]
pub(crate) mod test_utils;

/// 64-bit XXH3 of the bytes. The algorithm is fixed by its specification, so values that end up in
/// checkpoints or decide key ownership stay valid across builds and toolchains.
pub(crate) fn stable_hash(bytes: &[u8]) -> u64 {
    xxhash_rust::xxh3::xxh3_64(bytes)
}
