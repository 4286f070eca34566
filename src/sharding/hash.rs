//! Default ring hash function.

/// Signature of a ring hash function.
pub type HashFn = fn(&str) -> u32;

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a followed by a murmur3 finalizer.
///
/// Plain FNV-1a leaves keys that differ only in their last byte close
/// together; the finalizer spreads them across the whole ring.
pub fn fnv1a_32(key: &str) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in key.bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    fmix32(hash)
}

fn fmix32(mut h: u32) -> u32 {
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_deterministic() {
        assert_eq!(fnv1a_32("node-1:0"), fnv1a_32("node-1:0"));
        assert_ne!(fnv1a_32("node-1:0"), fnv1a_32("node-1:1"));
    }

    #[test]
    fn test_hash_spreads_sequential_keys() {
        // Sequential keys should land in every quarter of the ring
        let mut quarters = [0u32; 4];
        for i in 0..1000 {
            let h = fnv1a_32(&format!("key-{}", i));
            quarters[(h >> 30) as usize] += 1;
        }
        for count in quarters {
            assert!(count > 150, "uneven spread: {:?}", quarters);
        }
    }
}
