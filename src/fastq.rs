//src/fastq.rs

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use flate2::read::MultiGzDecoder;

use crate::error::HalalError;
use crate::sample::Sample;

/// A minimal representation of one read (or merged read pair).
/// Qualities are dropped at the door, nothing downstream uses them.
#[derive(Debug, Clone)]
pub struct ReadRecord {
    pub id: String,
    pub seq: String,
}

#[derive(Clone, Copy, PartialEq, Debug)]
enum Format {
    Fastq,
    Fasta,
    Unknown,
}

/// Streaming FASTQ/FASTA reader with transparent gzip support.
/// Malformed records are skipped and counted, never fatal; an I/O error
/// mid-stream ends iteration and is surfaced through `take_io_error`.
pub struct SequenceReader {
    reader: Box<dyn BufRead + Send>,
    format: Format,
    skipped: u64,
    /// carry-over header when FASTA parsing reads one line ahead
    pending_header: Option<String>,
    io_error: Option<std::io::Error>,
    done: bool,
}

impl std::fmt::Debug for SequenceReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequenceReader")
            .field("format", &self.format)
            .field("skipped", &self.skipped)
            .field("pending_header", &self.pending_header)
            .field("io_error", &self.io_error)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

impl SequenceReader {
    /// Open a sequence file. A file that cannot be opened is an
    /// `UnreadableInput`: fatal for the sample, recoverable for the run.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, HalalError> {
        let path = path.as_ref();
        let f = File::open(path).map_err(|e| HalalError::UnreadableInput {
            path: path.to_path_buf(),
            source: e,
        })?;

        let is_gz = path
            .extension()
            .map(|ext| ext == "gz")
            .unwrap_or(false);

        let reader: Box<dyn BufRead + Send> = if is_gz {
            Box::new(BufReader::new(MultiGzDecoder::new(f)))
        } else {
            Box::new(BufReader::new(f))
        };

        Ok(Self {
            reader,
            format: Format::Unknown,
            skipped: 0,
            pending_header: None,
            io_error: None,
            done: false,
        })
    }

    /// Records skipped as malformed so far.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// An I/O error that interrupted iteration, if any.
    pub fn take_io_error(&mut self) -> Option<std::io::Error> {
        self.io_error.take()
    }

    fn read_line(&mut self, buf: &mut String) -> Option<usize> {
        buf.clear();
        match self.reader.read_line(buf) {
            Ok(n) => Some(n),
            Err(e) => {
                self.io_error = Some(e);
                self.done = true;
                None
            }
        }
    }

    fn next_fastq(&mut self, header_line: String) -> Option<ReadRecord> {
        let mut line = String::new();

        // sequence line
        if self.read_line(&mut line)? == 0 {
            self.skipped += 1; // header with no sequence
            self.done = true;
            return None;
        }
        let seq = line.trim_end().to_string();

        // plus line and quality line, both discarded
        if self.read_line(&mut line)? == 0 || self.read_line(&mut line)? == 0 {
            self.done = true;
        }

        let id = header_line[1..]
            .split_whitespace()
            .next()
            .unwrap_or("")
            .to_string();
        if seq.is_empty() {
            self.skipped += 1;
            return None;
        }
        Some(ReadRecord { id, seq })
    }

    fn next_fasta(&mut self, header_line: String) -> Option<ReadRecord> {
        let mut seq = String::new();
        let mut line = String::new();
        loop {
            let n = self.read_line(&mut line)?;
            if n == 0 {
                self.done = true;
                break;
            }
            let trimmed = line.trim_end();
            if trimmed.starts_with('>') {
                self.pending_header = Some(trimmed.to_string());
                break;
            }
            seq.push_str(trimmed);
        }
        let id = header_line[1..]
            .split_whitespace()
            .next()
            .unwrap_or("")
            .to_string();
        if seq.is_empty() {
            self.skipped += 1;
            return None;
        }
        Some(ReadRecord { id, seq })
    }
}

impl Iterator for SequenceReader {
    type Item = ReadRecord;

    fn next(&mut self) -> Option<ReadRecord> {
        loop {
            if self.done && self.pending_header.is_none() {
                return None;
            }

            let header = if let Some(h) = self.pending_header.take() {
                h
            } else {
                let mut line = String::new();
                let n = self.read_line(&mut line)?;
                if n == 0 {
                    self.done = true;
                    return None;
                }
                line.trim_end().to_string()
            };

            if header.is_empty() {
                continue;
            }

            if self.format == Format::Unknown {
                self.format = match header.as_bytes().first().copied() {
                    Some(b'@') => Format::Fastq,
                    Some(b'>') => Format::Fasta,
                    _ => Format::Unknown,
                };
            }

            let record = match (self.format, header.as_bytes().first().copied()) {
                (Format::Fastq, Some(b'@')) => self.next_fastq(header),
                (Format::Fasta, Some(b'>')) => self.next_fasta(header),
                _ => {
                    // stray line where a header should be
                    self.skipped += 1;
                    continue;
                }
            };
            match record {
                Some(r) => return Some(r),
                None if self.done && self.pending_header.is_none() => return None,
                None => continue, // skipped a malformed record, keep going
            }
        }
    }
}

/// Everything read from one sample's file(s).
pub struct LoadedReads {
    pub records: Vec<ReadRecord>,
    pub skipped: u64,
    /// True when the progress callback asked to stop early.
    pub cancelled: bool,
}

/// Stream a sample into memory, merging paired files record-by-record.
/// Mates are joined with an `N` so no k-mer window spans the junction.
/// `progress` is called with the running read count every batch and may
/// return `false` to stop (cancellation checkpoint). `cap` bounds reads
/// per sample for memory-constrained runs.
pub fn load_sample_reads(
    sample: &Sample,
    cap: Option<u64>,
    progress: &mut dyn FnMut(u64) -> bool,
) -> Result<LoadedReads, HalalError> {
    const PROGRESS_BATCH: u64 = 1024;

    let mut r1 = SequenceReader::open(&sample.files[0])?;
    let mut r2 = match sample.files.get(1) {
        Some(p) => Some(SequenceReader::open(p)?),
        None => None,
    };

    let mut records = Vec::new();
    let mut seen = 0u64;
    let mut cancelled = false;

    loop {
        if let Some(limit) = cap {
            if seen >= limit {
                log::info!(
                    "subsample cap reached for '{}' at {} reads",
                    sample.name,
                    limit
                );
                break;
            }
        }

        let Some(mate1) = r1.next() else { break };
        let merged = match r2.as_mut() {
            Some(r2) => match r2.next() {
                Some(mate2) => ReadRecord {
                    id: mate1.id,
                    seq: format!("{}N{}", mate1.seq, mate2.seq),
                },
                // R2 exhausted before R1: keep the unpaired mate as-is
                None => mate1,
            },
            None => mate1,
        };
        records.push(merged);
        seen += 1;

        if seen % PROGRESS_BATCH == 0 && !progress(seen) {
            cancelled = true;
            break;
        }
    }
    progress(seen);

    // a mid-stream I/O failure poisons the whole file
    for reader in std::iter::once(&mut r1).chain(r2.as_mut()) {
        if let Some(e) = reader.take_io_error() {
            return Err(HalalError::UnreadableInput {
                path: sample.files[0].clone(),
                source: e,
            });
        }
    }

    let skipped = r1.skipped() + r2.as_ref().map_or(0, |r| r.skipped());
    Ok(LoadedReads {
        records,
        skipped,
        cancelled,
    })
}
