//src/pipeline.rs

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::classify::classify_sample;
use crate::em::estimate;
use crate::error::HalalError;
use crate::fastq::load_sample_reads;
use crate::index::KmerIndex;
use crate::report::build_report;
use crate::sample::Sample;
use crate::stats::{bootstrap_intervals, cross_marker_agreement};
use crate::types::SampleReport;

/// Default reads-per-sample cap when subsampling is requested.
pub const DEFAULT_SUBSAMPLE_CAP: u64 = 500_000;

/// Pipeline states, strictly ordered. No back-transitions except via a
/// fresh `start` from one of the three restartable states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisState {
    Idle,
    LoadingIndex,
    ReadingInput,
    Classifying,
    EstimatingAbundance,
    GeneratingReport,
    Done,
    Error,
}

impl AnalysisState {
    fn to_u8(self) -> u8 {
        match self {
            AnalysisState::Idle => 0,
            AnalysisState::LoadingIndex => 1,
            AnalysisState::ReadingInput => 2,
            AnalysisState::Classifying => 3,
            AnalysisState::EstimatingAbundance => 4,
            AnalysisState::GeneratingReport => 5,
            AnalysisState::Done => 6,
            AnalysisState::Error => 7,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => AnalysisState::Idle,
            1 => AnalysisState::LoadingIndex,
            2 => AnalysisState::ReadingInput,
            3 => AnalysisState::Classifying,
            4 => AnalysisState::EstimatingAbundance,
            5 => AnalysisState::GeneratingReport,
            6 => AnalysisState::Done,
            _ => AnalysisState::Error,
        }
    }

    /// States a new run may be started from.
    pub fn can_start(self) -> bool {
        matches!(
            self,
            AnalysisState::Idle | AnalysisState::Done | AnalysisState::Error
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct AnalysisOptions {
    /// Reads-per-sample cap for memory-constrained runs.
    pub subsample_cap: Option<u64>,
}

/// One immutable progress snapshot for a polling caller.
#[derive(Debug, Clone, Copy)]
pub struct ProgressSnapshot {
    pub state: AnalysisState,
    pub sample_index: usize,
    pub n_samples: usize,
    pub reads_seen: u64,
}

/// Fields the worker writes and pollers read. The worker owns every
/// write; callers only ever load, so plain atomic publishes are enough.
struct Shared {
    state: AtomicU8,
    sample_index: AtomicUsize,
    n_samples: AtomicUsize,
    reads_seen: AtomicU64,
    cancel: AtomicBool,
    reports: Mutex<Vec<SampleReport>>,
    error: Mutex<Option<String>>,
}

impl Shared {
    fn set_state(&self, s: AnalysisState) {
        self.state.store(s.to_u8(), Ordering::Release);
    }

    fn state(&self) -> AnalysisState {
        AnalysisState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn fail(&self, message: String) {
        log::error!("analysis failed: {message}");
        *self.error.lock() = Some(message);
        self.set_state(AnalysisState::Error);
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }
}

/// The pipeline controller. One run at a time on a dedicated worker
/// thread; the shell polls `progress()` and collects `reports()` when
/// the state turns terminal.
pub struct Analysis {
    shared: Arc<Shared>,
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Default for Analysis {
    fn default() -> Self {
        Self::new()
    }
}

impl Analysis {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: AtomicU8::new(AnalysisState::Idle.to_u8()),
                sample_index: AtomicUsize::new(0),
                n_samples: AtomicUsize::new(0),
                reads_seen: AtomicU64::new(0),
                cancel: AtomicBool::new(false),
                reports: Mutex::new(Vec::new()),
                error: Mutex::new(None),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn state(&self) -> AnalysisState {
        self.shared.state()
    }

    pub fn progress(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            state: self.shared.state(),
            sample_index: self.shared.sample_index.load(Ordering::Acquire),
            n_samples: self.shared.n_samples.load(Ordering::Acquire),
            reads_seen: self.shared.reads_seen.load(Ordering::Acquire),
        }
    }

    /// Reports completed so far. Stable once the state is terminal;
    /// mid-run it grows sample by sample.
    pub fn reports(&self) -> Vec<SampleReport> {
        self.shared.reports.lock().clone()
    }

    pub fn error_message(&self) -> Option<String> {
        self.shared.error.lock().clone()
    }

    /// Ask a running analysis to stop. Honored at read-batch and sample
    /// boundaries; completed sample reports are preserved and the run
    /// ends in `Done`, not `Error`.
    pub fn cancel(&self) {
        self.shared.cancel.store(true, Ordering::Release);
    }

    /// Start a run. Rejected (without state change) when a run is
    /// active, the sample set is empty, or the index path is missing.
    pub fn start(
        &self,
        samples: Vec<Sample>,
        index_path: PathBuf,
        options: AnalysisOptions,
    ) -> Result<(), HalalError> {
        if !self.shared.state().can_start() {
            return Err(HalalError::RunActive);
        }
        if samples.is_empty() {
            return Err(HalalError::NoSamples);
        }
        if index_path.as_os_str().is_empty() {
            return Err(HalalError::NoIndex);
        }

        // reap a finished previous worker, if any
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }

        self.shared.cancel.store(false, Ordering::Release);
        self.shared.reads_seen.store(0, Ordering::Release);
        self.shared.sample_index.store(0, Ordering::Release);
        self.shared.n_samples.store(samples.len(), Ordering::Release);
        self.shared.reports.lock().clear();
        *self.shared.error.lock() = None;
        self.shared.set_state(AnalysisState::LoadingIndex);

        let shared = Arc::clone(&self.shared);
        let handle = std::thread::spawn(move || {
            run_worker(&shared, &samples, &index_path, &options);
        });
        *self.worker.lock() = Some(handle);
        Ok(())
    }

    /// Block until the current worker (if any) finishes. Mostly for
    /// tests and CLI use; a GUI shell polls instead.
    pub fn wait(&self) {
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

fn run_worker(
    shared: &Shared,
    samples: &[Sample],
    index_path: &std::path::Path,
    options: &AnalysisOptions,
) {
    let index = match KmerIndex::load(index_path) {
        Ok(idx) => idx,
        Err(e) => {
            shared.fail(e.to_string());
            return;
        }
    };
    let copy_numbers = index.db().copy_numbers();

    let mut any_sample_succeeded = false;
    let mut last_sample_error: Option<String> = None;

    for (i, sample) in samples.iter().enumerate() {
        if shared.cancelled() {
            log::info!("run cancelled before sample '{}'", sample.name);
            shared.set_state(AnalysisState::Done);
            return;
        }

        shared.sample_index.store(i, Ordering::Release);
        shared.reads_seen.store(0, Ordering::Release);
        shared.set_state(AnalysisState::ReadingInput);

        let loaded = match load_sample_reads(sample, options.subsample_cap, &mut |n| {
            shared.reads_seen.store(n, Ordering::Release);
            !shared.cancelled()
        }) {
            Ok(l) => l,
            Err(e) => {
                // fatal for this sample only; the rest of the run goes on
                log::warn!("skipping sample '{}': {e}", sample.name);
                last_sample_error = Some(e.to_string());
                continue;
            }
        };
        if loaded.cancelled {
            log::info!("run cancelled while reading '{}'", sample.name);
            shared.set_state(AnalysisState::Done);
            return;
        }

        shared.set_state(AnalysisState::Classifying);
        let mut evidence = classify_sample(&index, &loaded.records);
        evidence.reads_skipped += loaded.skipped;
        drop(loaded);

        if shared.cancelled() {
            shared.set_state(AnalysisState::Done);
            return;
        }

        shared.set_state(AnalysisState::EstimatingAbundance);
        let em = estimate(
            &evidence.classes_all(),
            index.db().n_species(),
            &copy_numbers,
        );
        let ci = bootstrap_intervals(&evidence, &copy_numbers, &em);
        let agreement = cross_marker_agreement(&evidence, &copy_numbers);

        shared.set_state(AnalysisState::GeneratingReport);
        let report = build_report(&sample.name, index.db(), &evidence, &em, &ci, agreement);
        log::info!(
            "sample '{}': verdict {}, {} classified reads",
            sample.name,
            report.verdict,
            report.classified_reads
        );
        shared.reports.lock().push(report);
        any_sample_succeeded = true;
    }

    if !any_sample_succeeded {
        if let Some(msg) = last_sample_error {
            shared.fail(msg);
            return;
        }
    }
    shared.set_state(AnalysisState::Done);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kmer::SplitMix64;
    use crate::refdb::RefDb;
    use crate::sample::resolve_samples;
    use crate::types::Verdict;
    use std::fmt::Write as _;
    use std::io::Write as _;

    fn synth_seq(seed: u64, len: usize) -> String {
        let mut rng = SplitMix64::new(seed);
        (0..len)
            .map(|_| b"ACGT"[(rng.next_u64() % 4) as usize] as char)
            .collect()
    }

    fn build_test_index(dir: &std::path::Path) -> (PathBuf, String) {
        let chicken_ref = synth_seq(5, 600);
        let mut cat = String::new();
        let _ = writeln!(cat, "species\tGallus_gallus\tChicken\thalal\t1000");
        let _ = writeln!(cat, "species\tSus_scrofa\tPork (Pig)\tharam\t800");
        let _ = writeln!(cat, "marker\tcytb\t-\t-");
        let _ = writeln!(cat, "ref\tGallus_gallus\tcytb\t{chicken_ref}");
        let _ = writeln!(cat, "ref\tSus_scrofa\tcytb\t{}", synth_seq(6, 600));
        let index = KmerIndex::build(RefDb::parse(&cat).unwrap()).unwrap();
        let path = dir.join("test.idx");
        index.save(&path).unwrap();
        (path, chicken_ref)
    }

    fn write_fastq(path: &std::path::Path, refseq: &str, n_reads: usize) {
        let mut f = std::fs::File::create(path).unwrap();
        for i in 0..n_reads {
            let start = (i * 7) % (refseq.len() - 150);
            let read = &refseq[start..start + 150];
            writeln!(f, "@r{i}\n{read}\n+\n{}", "I".repeat(150)).unwrap();
        }
    }

    fn wait_done(analysis: &Analysis) -> AnalysisState {
        analysis.wait();
        analysis.state()
    }

    #[test]
    fn rejects_empty_input_without_leaving_idle() {
        let analysis = Analysis::new();
        assert!(matches!(
            analysis.start(Vec::new(), PathBuf::from("x.idx"), Default::default()),
            Err(HalalError::NoSamples)
        ));
        let sample = Sample {
            name: "s".into(),
            files: vec![PathBuf::from("s.fq")],
        };
        assert!(matches!(
            analysis.start(vec![sample], PathBuf::new(), Default::default()),
            Err(HalalError::NoIndex)
        ));
        assert_eq!(analysis.state(), AnalysisState::Idle);
    }

    #[test]
    fn full_run_reaches_done_with_reports() {
        let dir = tempfile::tempdir().unwrap();
        let (index_path, chicken_ref) = build_test_index(dir.path());
        let fq = dir.path().join("farm_sample.fastq");
        write_fastq(&fq, &chicken_ref, 200);

        let samples = resolve_samples(&[fq]).unwrap();
        let analysis = Analysis::new();
        analysis
            .start(samples, index_path.clone(), Default::default())
            .unwrap();
        assert_eq!(wait_done(&analysis), AnalysisState::Done);

        let reports = analysis.reports();
        assert_eq!(reports.len(), 1);
        let r = &reports[0];
        assert_eq!(r.sample_id, "farm_sample");
        assert_eq!(r.verdict, Verdict::Pass);
        assert!(r.species[0].species_id == "Gallus_gallus");
        assert!(r.species[0].weight_pct > 99.0);

        // a terminal state is restartable
        let samples = resolve_samples(&[dir.path().join("farm_sample.fastq")]).unwrap();
        analysis.start(samples, index_path, Default::default()).unwrap();
        assert_eq!(wait_done(&analysis), AnalysisState::Done);
    }

    #[test]
    fn unreadable_sample_is_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let (index_path, chicken_ref) = build_test_index(dir.path());
        let good = dir.path().join("good.fastq");
        write_fastq(&good, &chicken_ref, 100);

        let samples = vec![
            Sample {
                name: "good".into(),
                files: vec![good],
            },
            Sample {
                name: "missing".into(),
                files: vec![dir.path().join("does_not_exist.fastq")],
            },
        ];
        let analysis = Analysis::new();
        analysis.start(samples, index_path, Default::default()).unwrap();
        assert_eq!(wait_done(&analysis), AnalysisState::Done);
        assert_eq!(analysis.reports().len(), 1);
    }

    #[test]
    fn all_samples_unreadable_surfaces_error() {
        let dir = tempfile::tempdir().unwrap();
        let (index_path, _) = build_test_index(dir.path());
        let samples = vec![Sample {
            name: "missing".into(),
            files: vec![dir.path().join("nope.fastq")],
        }];
        let analysis = Analysis::new();
        analysis.start(samples, index_path, Default::default()).unwrap();
        assert_eq!(wait_done(&analysis), AnalysisState::Error);
        assert!(analysis.error_message().is_some());
        assert!(analysis.reports().is_empty());
    }

    #[test]
    fn bad_index_path_errors_before_processing() {
        let dir = tempfile::tempdir().unwrap();
        let bogus = dir.path().join("bogus.idx");
        std::fs::write(&bogus, b"not an index").unwrap();
        let samples = vec![Sample {
            name: "s".into(),
            files: vec![dir.path().join("s.fastq")],
        }];
        let analysis = Analysis::new();
        analysis.start(samples, bogus, Default::default()).unwrap();
        assert_eq!(wait_done(&analysis), AnalysisState::Error);
        let msg = analysis.error_message().unwrap();
        assert!(msg.contains("index"), "unexpected message: {msg}");
    }

    #[test]
    fn cancellation_preserves_completed_reports() {
        let dir = tempfile::tempdir().unwrap();
        let (index_path, chicken_ref) = build_test_index(dir.path());

        // sample 1 is small; samples 2 and 3 are big enough that
        // cancellation lands while sample 2 is still being read
        let s1 = dir.path().join("first.fastq");
        write_fastq(&s1, &chicken_ref, 200);
        let s2 = dir.path().join("second.fastq");
        write_fastq(&s2, &chicken_ref, 30_000);
        let s3 = dir.path().join("third.fastq");
        write_fastq(&s3, &chicken_ref, 30_000);

        let samples = resolve_samples(&[s1, s2, s3]).unwrap();
        let analysis = Analysis::new();
        analysis.start(samples, index_path, Default::default()).unwrap();

        // cancel as soon as the first report lands
        while analysis.reports().is_empty() {
            if analysis.state() == AnalysisState::Error {
                panic!("run failed: {:?}", analysis.error_message());
            }
            std::thread::sleep(std::time::Duration::from_micros(200));
        }
        analysis.cancel();

        let final_state = wait_done(&analysis);
        assert_ne!(final_state, AnalysisState::Error);
        assert_eq!(final_state, AnalysisState::Done);
        let reports = analysis.reports();
        assert!(!reports.is_empty() && reports.len() < 3);
        assert_eq!(reports[0].sample_id, "first");
    }

    #[test]
    fn subsample_cap_limits_total_reads() {
        let dir = tempfile::tempdir().unwrap();
        let (index_path, chicken_ref) = build_test_index(dir.path());
        let fq = dir.path().join("deep.fastq");
        write_fastq(&fq, &chicken_ref, 2_000);

        let samples = resolve_samples(&[fq]).unwrap();
        let analysis = Analysis::new();
        analysis
            .start(
                samples,
                index_path,
                AnalysisOptions {
                    subsample_cap: Some(500),
                },
            )
            .unwrap();
        assert_eq!(wait_done(&analysis), AnalysisState::Done);
        let reports = analysis.reports();
        assert_eq!(reports[0].total_reads, 500);
    }
}
