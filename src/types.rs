//src/types.rs

use std::fmt;

/// Religious classification of a species, as recorded in the reference
/// catalog. Never inferred from sequence data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HalalStatus {
    Halal,
    Haram,
    /// Doubtful: permissibility disputed or slaughter-dependent.
    Mashbooh,
    Unknown,
}

impl HalalStatus {
    /// Parse the catalog spelling ("halal", "haram", "mashbooh", "unknown").
    pub fn from_catalog(s: &str) -> Option<Self> {
        match s {
            "halal" => Some(HalalStatus::Halal),
            "haram" => Some(HalalStatus::Haram),
            "mashbooh" | "doubtful" => Some(HalalStatus::Mashbooh),
            "unknown" => Some(HalalStatus::Unknown),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HalalStatus::Halal => "halal",
            HalalStatus::Haram => "haram",
            HalalStatus::Mashbooh => "mashbooh",
            HalalStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for HalalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-sample verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// No haram content detected.
    Pass,
    /// Haram content detected above the detection threshold.
    Fail,
    /// Not enough evidence to decide either way.
    Inconclusive,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Verdict::Pass => "pass",
            Verdict::Fail => "fail",
            Verdict::Inconclusive => "inconclusive",
        };
        f.write_str(s)
    }
}

/// One row of the per-sample report: a single species and its estimated
/// share of the sample.
#[derive(Debug, Clone)]
pub struct SpeciesReport {
    pub species_id: String,
    pub common_name: String,
    /// Copied from the reference catalog at report time.
    pub status: HalalStatus,
    /// Mass-weighted percentage after mito copy-number correction.
    pub weight_pct: f64,
    /// Raw classified-read share percentage (no copy-number correction).
    pub read_pct: f64,
    /// Bootstrap confidence interval bounds in percentage units.
    /// Negative when no interval could be computed (zero evidence).
    pub ci_lo: f64,
    pub ci_hi: f64,
}

/// Complete result for one sample. Immutable once produced; percentages
/// need not sum to 100 (unclassified mass is implicit).
#[derive(Debug, Clone)]
pub struct SampleReport {
    pub sample_id: String,
    pub verdict: Verdict,
    /// Reads seen in the input (after any subsampling cap).
    pub total_reads: u64,
    /// Reads that produced at least one (marker, species) hit.
    pub classified_reads: u64,
    /// Records skipped as malformed.
    pub skipped_reads: u64,
    /// Consistency of independent per-marker estimates, in [0,1].
    /// `None` when fewer than two markers had usable evidence.
    pub cross_marker_agreement: Option<f64>,
    /// Sorted by `weight_pct` descending.
    pub species: Vec<SpeciesReport>,
}

impl SampleReport {
    /// Total weight assigned to haram species, in percent.
    pub fn haram_weight_pct(&self) -> f64 {
        self.species
            .iter()
            .filter(|s| s.status == HalalStatus::Haram)
            .map(|s| s.weight_pct)
            .sum()
    }
}
