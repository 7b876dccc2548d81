//! Bloom Filters for Metadata Pushdown
//!
//! Two filters live in every leaf's column statistics:
//!
//! - [`ColumnBloomFilter`]: a per-column value bloom. An equality predicate
//!   whose value the bloom rules out skips the page without touching the
//!   data file. `false` from `might_contain` is definitive; `true` carries
//!   the configured false-positive rate (default 1%).
//! - [`IidBloom`]: a fixed-shape bitmap over the entity ids in a page. It
//!   exists for one reason the general-purpose filter cannot serve: the
//!   merge planner unions iid blooms across segments and asks whether an
//!   otherwise-pruned page might share an entity with a taken page (a later
//!   put's `system_to` is only correct if every earlier event for the same
//!   entity participates in the merge). Bitmap intersection requires
//!   bit-identical parameters across segments written at different times, so
//!   the shape is fixed and the probe bits are drawn from the iid itself -
//!   the iid is already a uniform hash.

use bloomfilter::Bloom;
use timehouse_core::Iid;

use crate::error::{Error, Result};

/// Default false positive rate for column blooms (1%).
const DEFAULT_FALSE_POSITIVE_RATE: f64 = 0.01;

const COLUMN_BLOOM_VERSION: u8 = 1;

/// Per-column value bloom filter with a stable byte serialization.
pub struct ColumnBloomFilter {
    bloom: Bloom<[u8]>,
    item_count: u64,
}

impl ColumnBloomFilter {
    /// Create a filter sized for the expected number of values.
    pub fn new(expected_items: usize) -> Self {
        Self {
            bloom: Bloom::new_for_fp_rate(expected_items.max(1), DEFAULT_FALSE_POSITIVE_RATE),
            item_count: 0,
        }
    }

    pub fn add(&mut self, key: &[u8]) {
        self.bloom.set(key);
        self.item_count += 1;
    }

    /// `false` means the value is definitely not in the page.
    pub fn might_contain(&self, key: &[u8]) -> bool {
        self.bloom.check(key)
    }

    pub fn item_count(&self) -> u64 {
        self.item_count
    }

    /// Serialize for the meta file.
    ///
    /// Format: `[version(1)][item_count(8)][num_bits(8)][num_hashes(4)]`
    /// `[sip_keys(32)][bitmap]`, little-endian.
    pub fn to_bytes(&self) -> Vec<u8> {
        let bitmap = self.bloom.bitmap();
        let sip_keys = self.bloom.sip_keys();
        let mut out = Vec::with_capacity(1 + 8 + 8 + 4 + 32 + bitmap.len());
        out.push(COLUMN_BLOOM_VERSION);
        out.extend_from_slice(&self.item_count.to_le_bytes());
        out.extend_from_slice(&self.bloom.number_of_bits().to_le_bytes());
        out.extend_from_slice(&self.bloom.number_of_hash_functions().to_le_bytes());
        for (k0, k1) in sip_keys {
            out.extend_from_slice(&k0.to_le_bytes());
            out.extend_from_slice(&k1.to_le_bytes());
        }
        out.extend_from_slice(&bitmap);
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        const HEADER: usize = 1 + 8 + 8 + 4 + 32;
        if data.len() < HEADER {
            return Err(Error::CorruptMeta("truncated column bloom".to_string()));
        }
        if data[0] != COLUMN_BLOOM_VERSION {
            return Err(Error::CorruptMeta(format!(
                "unsupported column bloom version {}",
                data[0]
            )));
        }
        let le_u64 = |at: usize| u64::from_le_bytes(data[at..at + 8].try_into().expect("sliced"));
        let item_count = le_u64(1);
        let num_bits = le_u64(9);
        let num_hashes = u32::from_le_bytes(data[17..21].try_into().expect("sliced"));
        let sip_keys = [(le_u64(21), le_u64(29)), (le_u64(37), le_u64(45))];
        let bitmap = &data[HEADER..];
        Ok(Self {
            bloom: Bloom::from_existing(bitmap, num_bits, num_hashes, sip_keys),
            item_count,
        })
    }
}

/// Bitmap size of the fixed-shape iid bloom, in bits.
const IID_BLOOM_BITS: usize = 4096;

/// Probe bits set per entity id.
const IID_BLOOM_PROBES: usize = 4;

/// Fixed-shape entity-id bloom. Bit positions come from consecutive 12-bit
/// chunks of the iid's leading bytes; no per-instance keying, so bitmaps
/// written by different segments AND together meaningfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IidBloom {
    bits: [u8; IID_BLOOM_BITS / 8],
}

impl Default for IidBloom {
    fn default() -> Self {
        Self::new()
    }
}

impl IidBloom {
    pub fn new() -> Self {
        IidBloom {
            bits: [0u8; IID_BLOOM_BITS / 8],
        }
    }

    fn probes(iid: &Iid) -> [usize; IID_BLOOM_PROBES] {
        let prefix = u64::from_be_bytes(iid.as_bytes()[..8].try_into().expect("iid is 16 bytes"));
        let mut out = [0usize; IID_BLOOM_PROBES];
        for (j, slot) in out.iter_mut().enumerate() {
            let chunk = (prefix >> (64 - 12 * (j + 1))) & 0xFFF;
            *slot = chunk as usize;
        }
        out
    }

    pub fn add(&mut self, iid: &Iid) {
        for bit in Self::probes(iid) {
            self.bits[bit / 8] |= 1 << (bit % 8);
        }
    }

    /// `false` means the entity is definitely not in the page.
    pub fn might_contain(&self, iid: &Iid) -> bool {
        Self::probes(iid)
            .iter()
            .all(|&bit| self.bits[bit / 8] & (1 << (bit % 8)) != 0)
    }

    /// Fold another bitmap into this one.
    pub fn union_with(&mut self, other: &IidBloom) {
        for (a, b) in self.bits.iter_mut().zip(other.bits.iter()) {
            *a |= b;
        }
    }

    /// May the two pages share an entity? Never a false negative: a shared
    /// iid sets the same probe bits in both bitmaps.
    pub fn intersects(&self, other: &IidBloom) -> bool {
        self.bits
            .iter()
            .zip(other.bits.iter())
            .any(|(a, b)| a & b != 0)
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&b| b == 0)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.bits.to_vec()
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let bits: [u8; IID_BLOOM_BITS / 8] = data
            .try_into()
            .map_err(|_| Error::CorruptMeta(format!("iid bloom of {} bytes", data.len())))?;
        Ok(IidBloom { bits })
    }
}
