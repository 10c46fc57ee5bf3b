use crate::evidence::SpeciesMask;
use crate::index::KmerIndex;
use crate::kmer::{canonical_kmers, raw_kmers};

use super::{MIN_FINE_CONTAINMENT, PRIMER_MIN_STRENGTH};

/// What one read contributed.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadOutcome {
    /// Per-marker candidate species sets. A mask with several bits means
    /// the read is consistent with several close relatives; that
    /// ambiguity is deliberately preserved for the estimator; picking
    /// a single best species here would bias abundances toward
    /// whichever candidate sorts first.
    Evidence(Vec<(u16, SpeciesMask)>),
    /// Well-formed, but matched nothing.
    Unclassified,
    /// Too short, or no window free of non-ACGT characters.
    Malformed,
}

/// Classify one read (or merged pair) against the index:
/// 1. decode the canonical k-mer set;
/// 2. use primer matches to hint which markers to score;
/// 3. shortlist candidate species via the coarse sketch;
/// 4. confirm each (marker, candidate) by exact containment, keeping
///    every species that clears the threshold.
pub fn classify_read(index: &KmerIndex, seq: &[u8]) -> ReadOutcome {
    let kmers = canonical_kmers(seq, index.k());
    if kmers.is_empty() {
        return ReadOutcome::Malformed;
    }

    let primer_kmers = raw_kmers(seq, index.primer_k());
    let hinted = index.primer_hint(&primer_kmers, PRIMER_MIN_STRENGTH);

    let candidates = index.coarse_candidates(&kmers);
    if candidates.is_empty() {
        return ReadOutcome::Unclassified;
    }

    // No primer context: score every marker rather than rejecting the
    // read outright, since amplicon-interior fragments carry no primer.
    let markers: Vec<u16> = if hinted.is_empty() {
        (0..index.db().n_markers() as u16).collect()
    } else {
        hinted
    };

    let mut evidence = Vec::new();
    for m in markers {
        let mut mask: SpeciesMask = 0;
        for &s in &candidates {
            // None = no reference coverage for this (marker, species)
            if let Some(score) = index.fine_score(&kmers, m, s) {
                if score >= MIN_FINE_CONTAINMENT {
                    mask |= 1 << s;
                }
            }
        }
        if mask != 0 {
            evidence.push((m, mask));
        }
    }

    if evidence.is_empty() {
        ReadOutcome::Unclassified
    } else {
        ReadOutcome::Evidence(evidence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kmer::SplitMix64;
    use crate::refdb::RefDb;
    use std::fmt::Write as _;

    fn synth_seq(seed: u64, len: usize) -> String {
        let mut rng = SplitMix64::new(seed);
        (0..len)
            .map(|_| b"ACGT"[(rng.next_u64() % 4) as usize] as char)
            .collect()
    }

    /// Two species sharing a 120 bp stretch of their cytb amplicon.
    fn shared_region_index() -> KmerIndex {
        let shared = synth_seq(99, 120);
        let ref_a = format!("{}{}", synth_seq(1, 300), shared);
        let ref_b = format!("{}{}", shared, synth_seq(2, 300));
        let mut cat = String::new();
        let _ = writeln!(cat, "species\tBos_taurus\tBeef (Cow)\thalal\t1000");
        let _ = writeln!(cat, "species\tBubalus_bubalis\tBuffalo\thalal\t1000");
        let _ = writeln!(cat, "marker\tcytb\t-\t-");
        let _ = writeln!(cat, "ref\tBos_taurus\tcytb\t{ref_a}");
        let _ = writeln!(cat, "ref\tBubalus_bubalis\tcytb\t{ref_b}");
        KmerIndex::build(RefDb::parse(&cat).unwrap()).unwrap()
    }

    #[test]
    fn read_from_one_species_yields_single_bit_evidence() {
        let idx = shared_region_index();
        let refseq = idx.db().marker_ref(0, 0).unwrap().to_string();
        // unique region of species 0 only
        match classify_read(&idx, &refseq.as_bytes()[50..250]) {
            ReadOutcome::Evidence(ev) => {
                assert_eq!(ev, vec![(0u16, 0b01u32)]);
            }
            other => panic!("expected evidence, got {other:?}"),
        }
    }

    #[test]
    fn shared_region_read_keeps_both_species() {
        let idx = shared_region_index();
        let ref_a = idx.db().marker_ref(0, 0).unwrap().to_string();
        // the last 120 bp of ref A are shared with ref B verbatim
        let read = &ref_a.as_bytes()[ref_a.len() - 110..];
        match classify_read(&idx, read) {
            ReadOutcome::Evidence(ev) => {
                assert_eq!(ev.len(), 1);
                assert_eq!(ev[0].1, 0b11, "ambiguity must be preserved");
            }
            other => panic!("expected ambiguous evidence, got {other:?}"),
        }
    }

    #[test]
    fn garbage_reads_are_malformed_not_fatal() {
        let idx = shared_region_index();
        assert_eq!(classify_read(&idx, b""), ReadOutcome::Malformed);
        assert_eq!(classify_read(&idx, b"ACGT"), ReadOutcome::Malformed);
        let all_n = vec![b'N'; 100];
        assert_eq!(classify_read(&idx, &all_n), ReadOutcome::Malformed);
    }

    #[test]
    fn foreign_dna_is_unclassified() {
        let idx = shared_region_index();
        let foreign = synth_seq(7777, 300);
        assert_eq!(
            classify_read(&idx, foreign.as_bytes()),
            ReadOutcome::Unclassified
        );
    }
}
