use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;

use halalseq_rs::pipeline::DEFAULT_SUBSAMPLE_CAP;
use halalseq_rs::{analyze_sample, resolve_samples, KmerIndex, RefDb};

const SPINNER_TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];

fn spinner(color: &str, msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .tick_strings(SPINNER_TICKS)
            .template(&format!("{{spinner:.{color}}} {{msg}}"))
            .expect("Invalid spinner template"),
    );
    pb.set_message(msg.to_string());
    pb
}

fn usage() -> ! {
    eprintln!("usage:");
    eprintln!("  halalseq-rs index <catalog.tsv> <out.idx>");
    eprintln!("  halalseq-rs analyze [--subsample] <index.idx> <reads.fastq[.gz]> [more files ...]");
    std::process::exit(2);
}

fn main() {
    env_logger::init();

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let subsample = args.iter().any(|a| a == "--subsample");
    args.retain(|a| a != "--subsample");

    match args.first().map(String::as_str) {
        Some("index") if args.len() == 3 => build_index(&args[1], &args[2]),
        Some("analyze") if args.len() >= 3 => analyze(&args[1], &args[2..], subsample),
        _ => usage(),
    }
}

fn build_index(catalog_path: &str, out_path: &str) {
    let sp = spinner("blue", &format!("Loading catalog {catalog_path}..."));
    let db = RefDb::from_path(catalog_path).expect("Could not load reference catalog");
    sp.finish_with_message(format!(
        "Catalog: {} species, {} markers, {} references.",
        db.n_species(),
        db.n_markers(),
        db.n_marker_refs()
    ));

    let sp = spinner("green", "Building k-mer index...");
    let index = KmerIndex::build(db).expect("Index construction failed");
    index.save(out_path).expect("Could not write index file");
    sp.finish_with_message(format!("Index written to {out_path}."));
}

fn analyze(index_path: &str, read_args: &[String], subsample: bool) {
    let cap = subsample.then_some(DEFAULT_SUBSAMPLE_CAP);
    let sp = spinner("blue", &format!("Loading index {index_path}..."));
    let index = KmerIndex::load(index_path).expect("Could not load index");
    sp.finish_with_message(format!(
        "Index loaded: {} species, {} markers.",
        index.db().n_species(),
        index.db().n_markers()
    ));

    let paths: Vec<PathBuf> = read_args.iter().map(PathBuf::from).collect();
    let samples = resolve_samples(&paths).expect("Could not resolve samples");
    println!(
        "{} sample(s) from {} file(s).",
        samples.len(),
        paths.len()
    );

    for sample in &samples {
        let sp = spinner(
            "green",
            &format!(
                "Analyzing {}{}...",
                sample.name,
                if sample.is_paired() { " (R1+R2)" } else { "" }
            ),
        );
        let report = match analyze_sample(&index, sample, cap) {
            Ok(r) => r,
            Err(e) => {
                sp.finish_with_message(format!("{}: SKIPPED ({e})", sample.name));
                continue;
            }
        };
        sp.finish_with_message(format!(
            "{}: {} ({} reads, {} classified)",
            report.sample_id,
            report.verdict.to_string().to_uppercase(),
            report.total_reads,
            report.classified_reads
        ));

        println!("  {:<24} {:>9} {:>8} {:>8} {:>15}", "species", "status", "weight", "reads", "ci");
        for sp_row in &report.species {
            if sp_row.weight_pct < 0.01 && sp_row.read_pct < 0.01 {
                continue;
            }
            let ci = if sp_row.ci_lo >= 0.0 {
                format!("{:.1}-{:.1}%", sp_row.ci_lo, sp_row.ci_hi)
            } else {
                "-".to_string()
            };
            println!(
                "  {:<24} {:>9} {:>7.1}% {:>7.1}% {:>15}",
                sp_row.species_id, sp_row.status, sp_row.weight_pct, sp_row.read_pct, ci
            );
        }
        if let Some(agreement) = report.cross_marker_agreement {
            println!("  cross-marker agreement: {agreement:.2}");
        }
    }
}
