//src/report.rs

use crate::em::EmResult;
use crate::evidence::EvidenceMatrix;
use crate::refdb::RefDb;
use crate::stats::{ConfidenceIntervals, CI_SENTINEL};
use crate::types::{HalalStatus, SampleReport, SpeciesReport, Verdict};

/// A species is "detected" above this mass percentage. Trace-level
/// carry-over below it never drives a verdict.
pub const DETECTION_THRESHOLD_PCT: f64 = 0.5;

/// Fewer classified reads than this cannot support any verdict.
pub const MIN_CLASSIFIED_READS: u64 = 50;

/// Assemble the per-sample report from the estimator outputs. Statuses
/// are copied straight from the catalog; the sequence data never gets
/// a vote on what counts as haram.
pub fn build_report(
    sample_id: &str,
    db: &RefDb,
    evidence: &EvidenceMatrix,
    em: &EmResult,
    ci: &ConfidenceIntervals,
    agreement: Option<f64>,
) -> SampleReport {
    let read_share = evidence.read_share();

    let mut species: Vec<SpeciesReport> = db
        .species()
        .iter()
        .enumerate()
        .map(|(s, sp)| {
            let to_pct = |v: f64| if v < 0.0 { CI_SENTINEL } else { v * 100.0 };
            SpeciesReport {
                species_id: sp.id.clone(),
                common_name: sp.common_name.clone(),
                status: sp.status,
                weight_pct: em.fractions[s] * 100.0,
                read_pct: read_share[s] * 100.0,
                ci_lo: to_pct(ci.lo[s]),
                ci_hi: to_pct(ci.hi[s]),
            }
        })
        .collect();
    species.sort_by(|a, b| b.weight_pct.total_cmp(&a.weight_pct));

    let verdict = decide_verdict(&species, evidence.reads_classified);

    SampleReport {
        sample_id: sample_id.to_string(),
        verdict,
        total_reads: evidence.reads_seen,
        classified_reads: evidence.reads_classified,
        skipped_reads: evidence.reads_skipped,
        cross_marker_agreement: agreement,
        species,
    }
}

fn decide_verdict(species: &[SpeciesReport], classified_reads: u64) -> Verdict {
    if classified_reads < MIN_CLASSIFIED_READS {
        return Verdict::Inconclusive;
    }

    let above = |status: HalalStatus| {
        species
            .iter()
            .any(|s| s.status == status && s.weight_pct >= DETECTION_THRESHOLD_PCT)
    };

    if above(HalalStatus::Haram) {
        Verdict::Fail
    } else if above(HalalStatus::Mashbooh) || above(HalalStatus::Unknown) {
        Verdict::Inconclusive
    } else {
        Verdict::Pass
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::em::estimate;
    use crate::stats::bootstrap_intervals;

    const CATALOG: &str = "\
species\tBos_taurus\tBeef (Cow)\thalal\t1000
species\tSus_scrofa\tPork (Pig)\tharam\t1000
species\tEquus_caballus\tHorse\tmashbooh\t1000
marker\tcytb\t-\t-
ref\tBos_taurus\tcytb\tACGTACGTACGTACGTACGTACGTACGT
ref\tSus_scrofa\tcytb\tTTGCTTGCTTGCTTGCTTGCTTGCTTGC
ref\tEquus_caballus\tcytb\tGGATGGATGGATGGATGGATGGATGGAT
";

    fn report_for(classes: &[(u16, u32, f64)], classified: u64) -> SampleReport {
        let db = RefDb::parse(CATALOG).unwrap();
        let mut ev = EvidenceMatrix::new(1, 3);
        for &(m, mask, w) in classes {
            ev.add(m, mask, w);
        }
        ev.reads_seen = classified;
        ev.reads_classified = classified;
        let cn = db.copy_numbers();
        let em = estimate(&ev.classes_all(), 3, &cn);
        let ci = bootstrap_intervals(&ev, &cn, &em);
        let r = build_report("test_sample", &db, &ev, &em, &ci, None);
        // report-wide invariants checked on every constructed report
        for sp in &r.species {
            assert!((0.0..=100.0).contains(&sp.weight_pct));
            if sp.ci_lo >= 0.0 {
                assert!(sp.ci_lo <= sp.weight_pct + 1e-9);
                assert!(sp.weight_pct <= sp.ci_hi + 1e-9);
            }
        }
        r
    }

    #[test]
    fn pure_beef_passes_with_full_weight() {
        let r = report_for(&[(0, 0b001, 100.0)], 100);
        assert_eq!(r.verdict, Verdict::Pass);
        assert_eq!(r.species[0].species_id, "Bos_taurus");
        assert!((r.species[0].weight_pct - 100.0).abs() < 1e-6);
        assert_eq!(r.species[1].weight_pct, 0.0);
    }

    #[test]
    fn pork_above_threshold_fails() {
        let r = report_for(&[(0, 0b001, 90.0), (0, 0b010, 10.0)], 100);
        assert_eq!(r.verdict, Verdict::Fail);
        assert!(r.haram_weight_pct() > DETECTION_THRESHOLD_PCT);
    }

    #[test]
    fn mashbooh_without_haram_is_inconclusive() {
        let r = report_for(&[(0, 0b001, 80.0), (0, 0b100, 20.0)], 100);
        assert_eq!(r.verdict, Verdict::Inconclusive);
    }

    #[test]
    fn too_few_reads_is_inconclusive_even_if_clean() {
        let r = report_for(&[(0, 0b001, 10.0)], 10);
        assert_eq!(r.verdict, Verdict::Inconclusive);
    }

    #[test]
    fn zero_evidence_yields_degenerate_inconclusive_report() {
        let r = report_for(&[], 0);
        assert_eq!(r.verdict, Verdict::Inconclusive);
        assert!(r.species.iter().all(|s| s.weight_pct == 0.0));
        assert!(r.species.iter().all(|s| s.ci_lo < 0.0 && s.ci_hi < 0.0));
        assert!(r.cross_marker_agreement.is_none());
    }

    #[test]
    fn status_is_a_catalog_lookup() {
        let r = report_for(&[(0, 0b010, 100.0)], 100);
        let pork = r.species.iter().find(|s| s.species_id == "Sus_scrofa").unwrap();
        assert_eq!(pork.status, HalalStatus::Haram);
        let beef = r.species.iter().find(|s| s.species_id == "Bos_taurus").unwrap();
        assert_eq!(beef.status, HalalStatus::Halal);
    }
}
