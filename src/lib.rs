// src/lib.rs
pub mod classify;
pub mod em;
pub mod error;
pub mod evidence;
pub mod fastq;
pub mod index;
pub mod kmer;
pub mod pipeline;
pub mod refdb;
pub mod report;
pub mod sample;
pub mod sketch;
pub mod stats;
pub mod types;

pub use crate::error::HalalError;
pub use crate::index::KmerIndex;
pub use crate::pipeline::{Analysis, AnalysisOptions, AnalysisState, ProgressSnapshot};
pub use crate::refdb::RefDb;
pub use crate::sample::{resolve_samples, Sample};
pub use crate::types::{HalalStatus, SampleReport, SpeciesReport, Verdict};

use crate::classify::classify_sample;
use crate::em::estimate;
use crate::fastq::load_sample_reads;
use crate::report::build_report;
use crate::stats::{bootstrap_intervals, cross_marker_agreement};

/// Analyze one sample synchronously against a loaded index: read input,
/// classify, estimate abundances, and build the report. This is the
/// same per-sample path the background pipeline runs; use `Analysis`
/// instead when a shell needs progress polling and cancellation.
pub fn analyze_sample(
    index: &KmerIndex,
    sample: &Sample,
    subsample_cap: Option<u64>,
) -> Result<SampleReport, HalalError> {
    let loaded = load_sample_reads(sample, subsample_cap, &mut |_| true)?;

    let mut evidence = classify_sample(index, &loaded.records);
    evidence.reads_skipped += loaded.skipped;

    let copy_numbers = index.db().copy_numbers();
    let em = estimate(&evidence.classes_all(), index.db().n_species(), &copy_numbers);
    let ci = bootstrap_intervals(&evidence, &copy_numbers, &em);
    let agreement = cross_marker_agreement(&evidence, &copy_numbers);

    Ok(build_report(
        &sample.name,
        index.db(),
        &evidence,
        &em,
        &ci,
        agreement,
    ))
}
