//! Scalable Bloom filter used to suppress re-enqueue of already-seen URLs.
//!
//! A single fixed-size Bloom filter's false-positive rate climbs as it
//! fills; the "scalable" growth mode here follows the standard
//! Almeida-et-al. approach of chaining filters, each sized for the capacity
//! tier it was opened at, so the filter as a whole keeps accepting new items
//! at a bounded false-positive rate instead of degrading without limit.
//!
//! Hashing uses `blake3` (already a dependency via `cache.rs`-style content
//! hashing elsewhere in the retrieval pack) keyed per hash round, standing
//! in for a dedicated bloom-filter crate — see DESIGN.md for why a crate was
//! not pulled in here.

use std::sync::RwLock;

const DEFAULT_GROWTH_FACTOR: usize = 2;
const TIGHTENING_RATIO: f64 = 0.9;

#[derive(Debug)]
struct BitFilter {
    bits: Vec<u64>,
    num_bits: usize,
    num_hashes: u32,
    inserted: usize,
    capacity: usize,
}

impl BitFilter {
    fn new(capacity: usize, false_positive_rate: f64) -> Self {
        let capacity = capacity.max(1);
        let fp = false_positive_rate.clamp(1e-6, 0.5);
        let num_bits = optimal_num_bits(capacity, fp);
        let num_hashes = optimal_num_hashes(num_bits, capacity);
        let words = num_bits.div_ceil(64);
        Self {
            bits: vec![0u64; words],
            num_bits,
            num_hashes: num_hashes.max(1),
            inserted: 0,
            capacity,
        }
    }

    fn positions(&self, item: &str) -> impl Iterator<Item = usize> + '_ {
        let (h1, h2) = double_hash(item);
        (0..self.num_hashes).map(move |i| {
            let combined = h1.wrapping_add((i as u64).wrapping_mul(h2));
            (combined % self.num_bits as u64) as usize
        })
    }

    fn add(&mut self, item: &str) {
        let mut was_new = false;
        let positions: Vec<usize> = self.positions(item).collect();
        for pos in positions {
            let word = pos / 64;
            let bit = pos % 64;
            let mask = 1u64 << bit;
            if self.bits[word] & mask == 0 {
                was_new = true;
            }
            self.bits[word] |= mask;
        }
        if was_new {
            self.inserted += 1;
        }
    }

    fn contains(&self, item: &str) -> bool {
        self.positions(item).all(|pos| {
            let word = pos / 64;
            let bit = pos % 64;
            self.bits[word] & (1u64 << bit) != 0
        })
    }

    fn is_full(&self) -> bool {
        self.inserted >= self.capacity
    }
}

fn optimal_num_bits(capacity: usize, fp: f64) -> usize {
    let n = capacity as f64;
    let m = -(n * fp.ln()) / (std::f64::consts::LN_2 * std::f64::consts::LN_2);
    (m.ceil() as usize).max(64)
}

fn optimal_num_hashes(num_bits: usize, capacity: usize) -> u32 {
    let m = num_bits as f64;
    let n = (capacity as f64).max(1.0);
    (((m / n) * std::f64::consts::LN_2).round() as u32).clamp(1, 32)
}

fn double_hash(item: &str) -> (u64, u64) {
    let h1 = blake3::hash(item.as_bytes());
    let bytes = h1.as_bytes();
    let a = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
    let b = u64::from_le_bytes(bytes[8..16].try_into().unwrap());
    (a, b | 1) // ensure the second hash is odd so it's coprime with power-of-two-ish moduli
}

/// Growth mode for a `MembershipFilter`: whether and how new tiers are sized
/// relative to the previous one.
#[derive(Debug, Clone, Copy)]
pub enum GrowthMode {
    /// Each new tier doubles the previous tier's capacity (the classic
    /// scalable-bloom-filter growth curve).
    Geometric { factor: usize },
    /// Each new tier has the same capacity as the first.
    Constant,
}

impl Default for GrowthMode {
    fn default() -> Self {
        GrowthMode::Geometric {
            factor: DEFAULT_GROWTH_FACTOR,
        }
    }
}

struct Inner {
    tiers: Vec<BitFilter>,
    initial_capacity: usize,
    target_false_positive_rate: f64,
    growth_mode: GrowthMode,
    ceiling_tiers: usize,
    full_warned: bool,
}

impl Inner {
    fn current_fp_for_tier(&self, tier_index: usize) -> f64 {
        self.target_false_positive_rate * TIGHTENING_RATIO.powi(tier_index as i32)
    }

    fn push_new_tier(&mut self) {
        let tier_index = self.tiers.len();
        let capacity = match self.growth_mode {
            GrowthMode::Geometric { factor } => {
                self.initial_capacity * factor.max(1).pow(tier_index as u32)
            }
            GrowthMode::Constant => self.initial_capacity,
        };
        let fp = self.current_fp_for_tier(tier_index);
        self.tiers.push(BitFilter::new(capacity, fp));
    }
}

/// A scalable approximate membership set. `add` is idempotent; `contains`
/// never false-negatives on a previously added item, and false-positives
/// occur with probability at most `target_false_positive_rate` for a filter
/// within its designed capacity.
pub struct MembershipFilter {
    inner: RwLock<Inner>,
}

impl MembershipFilter {
    pub fn new(initial_capacity: usize, target_false_positive_rate: f64, growth_mode: GrowthMode) -> Self {
        let mut inner = Inner {
            tiers: Vec::new(),
            initial_capacity: initial_capacity.max(1),
            target_false_positive_rate,
            growth_mode,
            ceiling_tiers: 32,
            full_warned: false,
        };
        inner.push_new_tier();
        Self {
            inner: RwLock::new(inner),
        }
    }

    /// `add` is idempotent. Returns `Err(CrawlError::MembershipFull)` as a
    /// warning (not fatal) once the tier-growth ceiling is reached; the
    /// item is still added to the last tier and the call can be ignored by
    /// the caller.
    pub fn add(&self, item: &str) -> Result<(), crate::error::CrawlError> {
        if self.contains(item) {
            return Ok(());
        }
        let mut guard = self.inner.write().unwrap();
        let last = guard.tiers.len() - 1;
        if guard.tiers[last].is_full() {
            if guard.tiers.len() >= guard.ceiling_tiers {
                guard.tiers[last].add(item);
                if !guard.full_warned {
                    guard.full_warned = true;
                    return Err(crate::error::CrawlError::MembershipFull);
                }
                return Ok(());
            }
            guard.push_new_tier();
        }
        let last = guard.tiers.len() - 1;
        guard.tiers[last].add(item);
        Ok(())
    }

    pub fn contains(&self, item: &str) -> bool {
        let guard = self.inner.read().unwrap();
        guard.tiers.iter().any(|tier| tier.contains(item))
    }

    pub fn len_estimate(&self) -> usize {
        let guard = self.inner.read().unwrap();
        guard.tiers.iter().map(|t| t.inserted).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_false_negatives() {
        let filter = MembershipFilter::new(1000, 0.01, GrowthMode::default());
        let items: Vec<String> = (0..2000).map(|i| format!("https://example.com/page/{i}")).collect();
        for item in &items {
            filter.add(item).ok();
        }
        for item in &items {
            assert!(filter.contains(item), "false negative for {item}");
        }
    }

    #[test]
    fn unseen_items_are_usually_absent() {
        let filter = MembershipFilter::new(1000, 0.01, GrowthMode::default());
        for i in 0..1000 {
            filter.add(&format!("seen-{i}")).ok();
        }
        let mut false_positives = 0;
        let trials = 2000;
        for i in 0..trials {
            if filter.contains(&format!("unseen-{i}")) {
                false_positives += 1;
            }
        }
        let rate = false_positives as f64 / trials as f64;
        assert!(rate < 0.1, "false positive rate too high: {rate}");
    }

    #[test]
    fn add_is_idempotent() {
        let filter = MembershipFilter::new(100, 0.01, GrowthMode::default());
        filter.add("https://example.com/x").ok();
        let count_before = filter.len_estimate();
        filter.add("https://example.com/x").ok();
        assert_eq!(filter.len_estimate(), count_before);
    }

    #[test]
    fn grows_past_initial_capacity_without_losing_membership() {
        let filter = MembershipFilter::new(8, 0.05, GrowthMode::Geometric { factor: 2 });
        let items: Vec<String> = (0..500).map(|i| format!("url-{i}")).collect();
        for item in &items {
            filter.add(item).ok();
        }
        for item in &items {
            assert!(filter.contains(item));
        }
    }
}
