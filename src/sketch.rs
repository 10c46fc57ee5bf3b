//src/sketch.rs

use ahash::AHashSet;

use crate::kmer::hash64;

/// FracMinHash retention divisor: a k-mer hash is kept when it falls in
/// the lowest `1/SKETCH_SCALE` of the hash space. Reads are short (one
/// amplicon), so the scale stays small to keep false negatives rare;
/// coarse misses cannot be corrected downstream.
pub const SKETCH_SCALE: u64 = 10;

/// How many candidate species the coarse tier may hand to fine scoring.
pub const COARSE_TOP_N: usize = 5;

/// Bounded approximate summary of one species' whole k-mer content.
/// Scaled MinHash: keep every hash `<= u64::MAX / scale`, giving an
/// unbiased containment estimator between sketches drawn with the same
/// scale. Built once at index time, read-only afterward.
#[derive(Clone, Debug, Default)]
pub struct FracMinHash {
    hashes: AHashSet<u64>,
    max_hash: u64,
}

impl FracMinHash {
    pub fn new(scale: u64) -> Self {
        Self {
            hashes: AHashSet::new(),
            max_hash: u64::MAX / scale,
        }
    }

    /// Offer a canonical k-mer; retained only if its hash is eligible.
    #[inline]
    pub fn insert_kmer(&mut self, canon_kmer: u64) {
        let h = hash64(canon_kmer);
        if h <= self.max_hash {
            self.hashes.insert(h);
        }
    }

    #[inline]
    pub fn contains_hash(&self, h: u64) -> bool {
        self.hashes.contains(&h)
    }

    pub fn max_hash(&self) -> u64 {
        self.max_hash
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    /// Sorted hash list for serialization.
    pub fn to_sorted_hashes(&self) -> Vec<u64> {
        let mut v: Vec<u64> = self.hashes.iter().copied().collect();
        v.sort_unstable();
        v
    }

    /// Rebuild from a serialized hash list.
    pub fn from_hashes(hashes: Vec<u64>, scale: u64) -> Self {
        Self {
            hashes: hashes.into_iter().collect(),
            max_hash: u64::MAX / scale,
        }
    }
}

/// The single capability the classifier needs from the coarse tier:
/// shortlist candidate species for a read's k-mer set. Keeping this a
/// trait lets the sketch algorithm change without touching the classifier.
pub trait CoarseFilter {
    /// Candidate species indices ranked by similarity, best first,
    /// truncated to `top_n`. Empty when nothing matches.
    fn candidates(&self, read_kmers: &[u64], top_n: usize) -> Vec<u16>;
}

/// Coarse filter over one FracMinHash sketch per species.
pub struct SketchFilter {
    sketches: Vec<FracMinHash>,
}

impl SketchFilter {
    pub fn new(sketches: Vec<FracMinHash>) -> Self {
        Self { sketches }
    }

    pub fn sketches(&self) -> &[FracMinHash] {
        &self.sketches
    }
}

impl CoarseFilter for SketchFilter {
    fn candidates(&self, read_kmers: &[u64], top_n: usize) -> Vec<u16> {
        if self.sketches.is_empty() {
            return Vec::new();
        }
        let max_hash = self.sketches[0].max_hash();

        // Sketch-eligible hashes of the read, deduplicated.
        let mut eligible: Vec<u64> = read_kmers
            .iter()
            .map(|&k| hash64(k))
            .filter(|&h| h <= max_hash)
            .collect();
        eligible.sort_unstable();
        eligible.dedup();
        if eligible.is_empty() {
            return Vec::new();
        }

        let mut scored: Vec<(usize, u16)> = self
            .sketches
            .iter()
            .enumerate()
            .map(|(i, sk)| {
                let hits = eligible.iter().filter(|&&h| sk.contains_hash(h)).count();
                (hits, i as u16)
            })
            .filter(|&(hits, _)| hits > 0)
            .collect();

        // Rank by hit count; species index breaks ties so the ordering
        // is stable across runs.
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        scored.truncate(top_n);
        scored.into_iter().map(|(_, i)| i).collect()
    }
}
