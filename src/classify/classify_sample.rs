use rayon::prelude::*;

use crate::evidence::EvidenceMatrix;
use crate::fastq::ReadRecord;
use crate::index::KmerIndex;

use super::{classify_read, ReadOutcome};

/// Classify every read of one sample in parallel and accumulate the
/// evidence matrix. Reads are independent, so this folds thread-local
/// matrices and reduces them with a commutative merge, so the final matrix
/// never depends on scheduling order.
pub fn classify_sample(index: &KmerIndex, records: &[ReadRecord]) -> EvidenceMatrix {
    let fresh = || EvidenceMatrix::new(index.db().n_markers(), index.db().n_species());

    let matrix = records
        .par_iter()
        .fold(fresh, |mut acc, rec| {
            acc.reads_seen += 1;
            match classify_read(index, rec.seq.as_bytes()) {
                ReadOutcome::Evidence(evidence) => {
                    acc.reads_classified += 1;
                    for (marker, mask) in evidence {
                        acc.add(marker, mask, 1.0);
                    }
                }
                ReadOutcome::Unclassified => {}
                ReadOutcome::Malformed => {
                    acc.reads_skipped += 1;
                }
            }
            acc
        })
        .reduce(fresh, |mut a, b| {
            a.merge(b);
            a
        });

    log::debug!(
        "classified {}/{} reads ({} malformed)",
        matrix.reads_classified,
        matrix.reads_seen,
        matrix.reads_skipped
    );
    matrix
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

    fn two_species_index() -> KmerIndex {
        let mut cat = String::new();
        let _ = writeln!(cat, "species\tGallus_gallus\tChicken\thalal\t1000");
        let _ = writeln!(cat, "species\tSus_scrofa\tPork (Pig)\tharam\t1000");
        let _ = writeln!(cat, "marker\tcytb\t-\t-");
        let _ = writeln!(cat, "ref\tGallus_gallus\tcytb\t{}", synth_seq(11, 500));
        let _ = writeln!(cat, "ref\tSus_scrofa\tcytb\t{}", synth_seq(22, 500));
        KmerIndex::build(RefDb::parse(&cat).unwrap()).unwrap()
    }

    fn reads_from(refseq: &str, n: usize, len: usize) -> Vec<ReadRecord> {
        (0..n)
            .map(|i| {
                let start = (i * 13) % (refseq.len() - len);
                ReadRecord {
                    id: format!("r{i}"),
                    seq: refseq[start..start + len].to_string(),
                }
            })
            .collect()
    }

    #[test]
    fn accumulates_counts_and_counters() {
        let idx = two_species_index();
        let chicken_ref = idx.db().marker_ref(0, 0).unwrap().to_string();
        let mut records = reads_from(&chicken_ref, 30, 150);
        records.push(ReadRecord {
            id: "junk".into(),
            seq: "NNNN".into(),
        });

        let ev = classify_sample(&idx, &records);
        assert_eq!(ev.reads_seen, 31);
        assert_eq!(ev.reads_skipped, 1);
        assert_eq!(ev.reads_classified, 30);

        // all evidence points at species 0
        let share = ev.read_share();
        assert!((share[0] - 1.0).abs() < 1e-9);
        assert_eq!(share[1], 0.0);
    }

    #[test]
    fn classification_is_deterministic_under_parallelism() {
        let idx = two_species_index();
        let pork_ref = idx.db().marker_ref(1, 0).unwrap().to_string();
        let records = reads_from(&pork_ref, 200, 120);
        let a = classify_sample(&idx, &records);
        let b = classify_sample(&idx, &records);
        assert_eq!(a.classes_all(), b.classes_all());
        assert_eq!(a.reads_classified, b.reads_classified);
    }
}
