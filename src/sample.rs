//src/sample.rs

use std::path::{Path, PathBuf};

use crate::error::HalalError;

/// Most input files one run will accept.
pub const MAX_INPUT_FILES: usize = 32;

/// A logical sample: one file (single-end) or an R1/R2 pair.
/// R1 is always `files[0]`.
#[derive(Debug, Clone)]
pub struct Sample {
    pub name: String,
    pub files: Vec<PathBuf>,
}

impl Sample {
    pub fn is_paired(&self) -> bool {
        self.files.len() == 2
    }
}

/// Strip `.gz` and then one sequence extension from a file name.
fn stem_of(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = name.strip_suffix(".gz").unwrap_or(&name);
    for ext in [".fastq", ".fq", ".fasta", ".fa"] {
        if let Some(s) = name.strip_suffix(ext) {
            return s.to_string();
        }
    }
    name.to_string()
}

/// Split a stem into (pair key, mate number) when it ends in a
/// recognized paired-end marker: `_R1`/`_R2` or `_1`/`_2`.
fn pair_marker(stem: &str) -> Option<(String, u8)> {
    for (suffix, mate) in [("_R1", 1u8), ("_R2", 2), ("_1", 1), ("_2", 2)] {
        if let Some(prefix) = stem.strip_suffix(suffix) {
            if !prefix.is_empty() {
                return Some((prefix.to_string(), mate));
            }
        }
    }
    None
}

/// Group input paths into logical samples. Pure filename inspection, no
/// I/O. Deterministic: the output order follows the first-seen order of
/// each sample's defining file, and a pair's R1 always comes first
/// regardless of selection order.
pub fn resolve_samples(paths: &[PathBuf]) -> Result<Vec<Sample>, HalalError> {
    if paths.len() > MAX_INPUT_FILES {
        return Err(HalalError::TooManyFiles(paths.len()));
    }

    // (stem, marker) per path, computed once
    let parsed: Vec<(String, Option<(String, u8)>)> = paths
        .iter()
        .map(|p| {
            let stem = stem_of(p);
            let marker = pair_marker(&stem);
            (stem, marker)
        })
        .collect();

    let mut consumed = vec![false; paths.len()];
    let mut samples = Vec::new();

    for i in 0..paths.len() {
        if consumed[i] {
            continue;
        }
        consumed[i] = true;

        if let Some((key, mate)) = &parsed[i].1 {
            // look for the partner with the same key and the other mate
            let partner = (i + 1..paths.len()).find(|&j| {
                !consumed[j]
                    && parsed[j].1.as_ref() == Some(&(key.clone(), 3 - mate))
                    && paths[j].parent() == paths[i].parent()
            });
            if let Some(j) = partner {
                consumed[j] = true;
                let (r1, r2) = if *mate == 1 { (i, j) } else { (j, i) };
                samples.push(Sample {
                    name: key.clone(),
                    files: vec![paths[r1].clone(), paths[r2].clone()],
                });
                continue;
            }
        }

        // no partner: a one-file sample under its full stem
        samples.push(Sample {
            name: parsed[i].0.clone(),
            files: vec![paths[i].clone()],
        });
    }

    Ok(samples)
}
