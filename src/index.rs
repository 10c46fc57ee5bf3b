//src/index.rs

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use ahash::{AHashMap, AHashSet};

use crate::error::HalalError;
use crate::kmer::{canonical_kmers, raw_kmers, reverse_complement, KMER_K, PRIMER_K};
use crate::refdb::RefDb;
use crate::sketch::{CoarseFilter, FracMinHash, SketchFilter, COARSE_TOP_N, SKETCH_SCALE};

/// File type code for HalalSeq index files.
pub const INDEX_MAGIC: &[u8; 8] = b"HSEQIDX1";

/// Read orientation relative to the marker amplicon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    Forward,
    Reverse,
}

/// Strand-specific primer k-mer sets for one marker. A forward-oriented
/// read carries the forward primer and the reverse complement of the
/// reverse primer; a reverse-oriented read carries their complements.
#[derive(Default)]
struct PrimerSet {
    fwd: AHashSet<u64>,
    rev: AHashSet<u64>,
}

impl PrimerSet {
    fn from_primers(primer_f: Option<&str>, primer_r: Option<&str>) -> Self {
        let mut set = PrimerSet::default();
        let mut add = |seq: &str, flip: bool| {
            for kmer in raw_kmers(seq.as_bytes(), PRIMER_K) {
                let (f, r) = (kmer, reverse_complement(kmer, PRIMER_K));
                if flip {
                    set.rev.insert(f);
                    set.fwd.insert(r);
                } else {
                    set.fwd.insert(f);
                    set.rev.insert(r);
                }
            }
        };
        if let Some(p) = primer_f {
            add(p, false);
        }
        if let Some(p) = primer_r {
            // the reverse primer anneals to the opposite strand
            add(p, true);
        }
        set
    }

    fn is_empty(&self) -> bool {
        self.fwd.is_empty() && self.rev.is_empty()
    }
}

/// Two-tier k-mer index bound to the reference catalog it was built from:
/// a coarse per-species sketch for candidate shortlisting, fine exact
/// per-(marker, species) k-mer sets for confirmation, and per-marker
/// primer sets for orientation/marker hinting. Construction is the one
/// heavyweight operation and runs offline; per-sample pipelines load a
/// pre-built file.
pub struct KmerIndex {
    db: RefDb,
    k: usize,
    primer_k: usize,
    scale: u64,
    coarse: SketchFilter,
    fine: AHashMap<(u16, u16), AHashSet<u64>>,
    primers: Vec<PrimerSet>,
}

impl KmerIndex {
    /// Build from a catalog. Slow, and expected to run offline: it walks
    /// every reference sequence once per tier.
    pub fn build(db: RefDb) -> Result<Self, HalalError> {
        let n_species = db.n_species() as u16;
        let n_markers = db.n_markers() as u16;

        let mut sketches: Vec<FracMinHash> =
            (0..n_species).map(|_| FracMinHash::new(SKETCH_SCALE)).collect();
        let mut fine: AHashMap<(u16, u16), AHashSet<u64>> = AHashMap::new();

        for s in 0..n_species {
            for m in 0..n_markers {
                let Some(refseq) = db.marker_ref(s, m) else {
                    continue;
                };
                let kmers = canonical_kmers(refseq.as_bytes(), KMER_K);
                if kmers.is_empty() {
                    log::warn!(
                        "reference for ({}, {}) is shorter than k={}; pair has no coverage",
                        db.species()[s as usize].id,
                        db.markers()[m as usize].id,
                        KMER_K
                    );
                    continue;
                }
                for &kmer in &kmers {
                    sketches[s as usize].insert_kmer(kmer);
                }
                fine.insert((m, s), kmers.into_iter().collect());
            }
        }

        let primers = db
            .markers()
            .iter()
            .map(|mk| PrimerSet::from_primers(mk.primer_f.as_deref(), mk.primer_r.as_deref()))
            .collect();

        log::info!(
            "Built index: {} species sketches, {} fine sets",
            n_species,
            fine.len()
        );

        Ok(Self {
            db,
            k: KMER_K,
            primer_k: PRIMER_K,
            scale: SKETCH_SCALE,
            coarse: SketchFilter::new(sketches),
            fine,
            primers,
        })
    }

    pub fn db(&self) -> &RefDb {
        &self.db
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn primer_k(&self) -> usize {
        self.primer_k
    }

    // -----------------------------------------------------------------------
    //  Queries
    // -----------------------------------------------------------------------

    /// Coarse shortlist: candidate species for a read's canonical k-mer
    /// set, best first, at most `COARSE_TOP_N`. False positives are fine
    /// (fine scoring catches them); an empty result means unclassified.
    pub fn coarse_candidates(&self, read_kmers: &[u64]) -> Vec<u16> {
        self.coarse.candidates(read_kmers, COARSE_TOP_N)
    }

    /// Exact containment of the read's k-mers in one (marker, species)
    /// reference set. `None` when the pair has no coverage.
    pub fn fine_score(&self, read_kmers: &[u64], marker: u16, species: u16) -> Option<f64> {
        let set = self.fine.get(&(marker, species))?;
        if read_kmers.is_empty() {
            return Some(0.0);
        }
        let hits = read_kmers.iter().filter(|k| set.contains(k)).count();
        Some(hits as f64 / read_kmers.len() as f64)
    }

    /// Match the read's strand-preserved primer k-mers against one
    /// marker's primer sets. Returns the better orientation and the
    /// fraction of that primer set found in the read; `None` when the
    /// marker has no primers or nothing matches.
    pub fn primer_match(&self, read_primer_kmers: &[u64], marker: u16) -> Option<(Orientation, f64)> {
        let set = &self.primers[marker as usize];
        if set.is_empty() {
            return None;
        }
        let count = |s: &AHashSet<u64>| read_primer_kmers.iter().filter(|k| s.contains(k)).count();
        let (fh, rh) = (count(&set.fwd), count(&set.rev));
        if fh == 0 && rh == 0 {
            return None;
        }
        if fh >= rh {
            Some((Orientation::Forward, fh as f64 / set.fwd.len().max(1) as f64))
        } else {
            Some((Orientation::Reverse, rh as f64 / set.rev.len().max(1) as f64))
        }
    }

    /// Markers whose primer sets match the read, for restricting fine
    /// scoring. Empty means no primer context anywhere.
    pub fn primer_hint(&self, read_primer_kmers: &[u64], min_strength: f64) -> Vec<u16> {
        (0..self.db.n_markers() as u16)
            .filter(|&m| {
                self.primer_match(read_primer_kmers, m)
                    .is_some_and(|(_, strength)| strength >= min_strength)
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    //  On-disk format
    // -----------------------------------------------------------------------

    /// Serialize to `path`. Layout (all integers little-endian):
    /// magic, k, primer_k, scale, embedded catalog text, declared
    /// species/marker geometry, per-species sketches, per-marker primer
    /// sets, per-(marker, species) fine sets.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), HalalError> {
        let mut w = BufWriter::new(File::create(path)?);

        w.write_all(INDEX_MAGIC)?;
        w.write_all(&(self.k as u32).to_le_bytes())?;
        w.write_all(&(self.primer_k as u32).to_le_bytes())?;
        w.write_all(&self.scale.to_le_bytes())?;

        let catalog = self.db.to_catalog_text();
        w.write_all(&(catalog.len() as u32).to_le_bytes())?;
        w.write_all(catalog.as_bytes())?;

        let n_species = self.db.n_species() as u32;
        let n_markers = self.db.n_markers() as u32;
        w.write_all(&n_species.to_le_bytes())?;
        w.write_all(&n_markers.to_le_bytes())?;

        let write_id = |w: &mut BufWriter<File>, id: &str| -> std::io::Result<()> {
            w.write_all(&(id.len() as u16).to_le_bytes())?;
            w.write_all(id.as_bytes())
        };
        let write_hashes = |w: &mut BufWriter<File>, hashes: &[u64]| -> std::io::Result<()> {
            w.write_all(&(hashes.len() as u32).to_le_bytes())?;
            for h in hashes {
                w.write_all(&h.to_le_bytes())?;
            }
            Ok(())
        };

        for (s, sp) in self.db.species().iter().enumerate() {
            write_id(&mut w, &sp.id)?;
            write_hashes(&mut w, &self.coarse.sketches()[s].to_sorted_hashes())?;
        }

        for (m, mk) in self.db.markers().iter().enumerate() {
            write_id(&mut w, &mk.id)?;
            let sorted = |set: &AHashSet<u64>| {
                let mut v: Vec<u64> = set.iter().copied().collect();
                v.sort_unstable();
                v
            };
            write_hashes(&mut w, &sorted(&self.primers[m].fwd))?;
            write_hashes(&mut w, &sorted(&self.primers[m].rev))?;
        }

        let mut pairs: Vec<(&(u16, u16), &AHashSet<u64>)> = self.fine.iter().collect();
        pairs.sort_by_key(|(k, _)| **k);
        w.write_all(&(pairs.len() as u32).to_le_bytes())?;
        for ((m, s), set) in pairs {
            w.write_all(&m.to_le_bytes())?;
            w.write_all(&s.to_le_bytes())?;
            let mut v: Vec<u64> = set.iter().copied().collect();
            v.sort_unstable();
            write_hashes(&mut w, &v)?;
        }

        w.flush()?;
        Ok(())
    }

    /// Load a pre-built index, validating the index section against the
    /// embedded catalog before anything downstream trusts it.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, HalalError> {
        let data = std::fs::read(&path)
            .map_err(|e| HalalError::IndexLoadFailed(format!("{}: {e}", path.as_ref().display())))?;
        let mut r = Reader::new(&data);

        let magic = r.take(INDEX_MAGIC.len())?;
        if magic != INDEX_MAGIC {
            return Err(HalalError::IndexLoadFailed(
                "not a HalalSeq index (bad magic)".into(),
            ));
        }
        let k = r.read_u32()? as usize;
        let primer_k = r.read_u32()? as usize;
        let scale = r.read_u64()?;
        if k == 0 || k > 32 || primer_k == 0 || primer_k > 32 || scale == 0 {
            return Err(HalalError::IndexLoadFailed("implausible index geometry".into()));
        }

        let catalog_len = r.read_u32()? as usize;
        let catalog_bytes = r.take(catalog_len)?;
        let catalog_text = std::str::from_utf8(catalog_bytes)
            .map_err(|_| HalalError::IndexLoadFailed("embedded catalog is not UTF-8".into()))?;
        let db = RefDb::parse(catalog_text)
            .map_err(|e| HalalError::IndexLoadFailed(format!("embedded catalog: {e}")))?;

        let n_species = r.read_u32()? as usize;
        let n_markers = r.read_u32()? as usize;
        if n_species != db.n_species() {
            return Err(HalalError::IndexMismatch(format!(
                "index declares {} species, database has {}",
                n_species,
                db.n_species()
            )));
        }
        if n_markers != db.n_markers() {
            return Err(HalalError::IndexMismatch(format!(
                "index declares {} markers, database has {}",
                n_markers,
                db.n_markers()
            )));
        }

        let mut sketches = Vec::with_capacity(n_species);
        for s in 0..n_species {
            let id = r.read_id()?;
            if id != db.species()[s].id {
                return Err(HalalError::IndexMismatch(format!(
                    "species {s} is '{id}' in the index but '{}' in the database",
                    db.species()[s].id
                )));
            }
            sketches.push(FracMinHash::from_hashes(r.read_hashes()?, scale));
        }

        let mut primers = Vec::with_capacity(n_markers);
        for m in 0..n_markers {
            let id = r.read_id()?;
            if id != db.markers()[m].id {
                return Err(HalalError::IndexMismatch(format!(
                    "marker {m} is '{id}' in the index but '{}' in the database",
                    db.markers()[m].id
                )));
            }
            let fwd: AHashSet<u64> = r.read_hashes()?.into_iter().collect();
            let rev: AHashSet<u64> = r.read_hashes()?.into_iter().collect();
            primers.push(PrimerSet { fwd, rev });
        }

        let n_pairs = r.read_u32()? as usize;
        let mut fine: AHashMap<(u16, u16), AHashSet<u64>> = AHashMap::with_capacity(n_pairs);
        for _ in 0..n_pairs {
            let m = r.read_u16()?;
            let s = r.read_u16()?;
            if (m as usize) >= n_markers || (s as usize) >= n_species {
                return Err(HalalError::IndexMismatch(format!(
                    "fine set references ({m}, {s}) outside database geometry"
                )));
            }
            if db.marker_ref(s, m).is_none() {
                return Err(HalalError::IndexMismatch(format!(
                    "fine set for ({m}, {s}) has no reference in the database"
                )));
            }
            fine.insert((m, s), r.read_hashes()?.into_iter().collect());
        }

        log::info!(
            "Loaded index: k={k}, {} species, {} markers, {} fine sets",
            n_species,
            n_markers,
            fine.len()
        );

        Ok(Self {
            db,
            k,
            primer_k,
            scale,
            coarse: SketchFilter::new(sketches),
            fine,
            primers,
        })
    }
}

/// Bounds-checked little-endian slice reader.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], HalalError> {
        if self.pos + n > self.data.len() {
            return Err(HalalError::IndexLoadFailed("index file truncated".into()));
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn read_u16(&mut self) -> Result<u16, HalalError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn read_u32(&mut self) -> Result<u32, HalalError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_u64(&mut self) -> Result<u64, HalalError> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_le_bytes(arr))
    }

    fn read_id(&mut self) -> Result<String, HalalError> {
        let len = self.read_u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| HalalError::IndexLoadFailed("identifier is not UTF-8".into()))
    }

    fn read_hashes(&mut self) -> Result<Vec<u64>, HalalError> {
        let n = self.read_u32()? as usize;
        let mut v = Vec::with_capacity(n);
        for _ in 0..n {
            v.push(self.read_u64()?);
        }
        Ok(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kmer::SplitMix64;
    use std::fmt::Write as _;

    fn synth_seq(seed: u64, len: usize) -> String {
        let mut rng = SplitMix64::new(seed);
        (0..len)
            .map(|_| b"ACGT"[(rng.next_u64() % 4) as usize] as char)
            .collect()
    }

    fn test_catalog(n_species: usize) -> String {
        let mut out = String::new();
        let names = [
            ("Bos_taurus", "Beef (Cow)", "halal"),
            ("Sus_scrofa", "Pork (Pig)", "haram"),
            ("Gallus_gallus", "Chicken", "halal"),
            ("Equus_caballus", "Horse", "mashbooh"),
        ];
        for (i, (id, common, status)) in names.iter().take(n_species).enumerate() {
            let _ = writeln!(out, "species\t{id}\t{common}\t{status}\t{}", 500 + i * 100);
        }
        let _ = writeln!(
            out,
            "marker\tcytb\tCCATCCAACATCTCAGCATGATGAAA\tGCCCCTCAGAATGATATTTGTCCTCA"
        );
        let _ = writeln!(out, "marker\t16s\t-\t-");
        for (i, (id, _, _)) in names.iter().take(n_species).enumerate() {
            let _ = writeln!(out, "ref\t{id}\tcytb\t{}", synth_seq(i as u64 + 1, 600));
            let _ = writeln!(out, "ref\t{id}\t16s\t{}", synth_seq(i as u64 + 101, 400));
        }
        out
    }

    pub(super) fn test_index(n_species: usize) -> KmerIndex {
        let db = RefDb::parse(&test_catalog(n_species)).unwrap();
        KmerIndex::build(db).unwrap()
    }

    #[test]
    fn fine_score_is_exact_containment() {
        let idx = test_index(2);
        let refseq = idx.db().marker_ref(0, 0).unwrap().to_string();
        let read = &refseq.as_bytes()[100..300];
        let kmers = canonical_kmers(read, KMER_K);
        // all read k-mers come from the reference
        assert_eq!(idx.fine_score(&kmers, 0, 0), Some(1.0));
        // the 16s pair exists too, but this read is cytb-only
        let sc = idx.fine_score(&kmers, 1, 0).unwrap();
        assert!(sc < 0.1);
    }

    #[test]
    fn primer_match_detects_orientation() {
        let idx = test_index(2);
        let fwd_primer = b"CCATCCAACATCTCAGCATGATGAAA";
        let kmers = raw_kmers(fwd_primer, PRIMER_K);
        let (orient, strength) = idx.primer_match(&kmers, 0).unwrap();
        assert_eq!(orient, Orientation::Forward);
        assert!(strength > 0.0);

        // reverse-complemented read flips the call
        let rc: Vec<u8> = fwd_primer
            .iter()
            .rev()
            .map(|&b| match b {
                b'A' => b'T',
                b'T' => b'A',
                b'C' => b'G',
                _ => b'C',
            })
            .collect();
        let (orient, _) = idx.primer_match(&raw_kmers(&rc, PRIMER_K), 0).unwrap();
        assert_eq!(orient, Orientation::Reverse);

        // marker without primers never matches
        assert!(idx.primer_match(&kmers, 1).is_none());
    }

    #[test]
    fn index_round_trips_on_disk() {
        let idx = test_index(3);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.idx");
        idx.save(&path).unwrap();

        let loaded = KmerIndex::load(&path).unwrap();
        assert_eq!(loaded.db().n_species(), 3);
        assert_eq!(loaded.k(), KMER_K);

        // queries behave identically after the round trip
        let refseq = idx.db().marker_ref(1, 0).unwrap().to_string();
        let kmers = canonical_kmers(&refseq.as_bytes()[50..250], KMER_K);
        assert_eq!(
            idx.fine_score(&kmers, 0, 1),
            loaded.fine_score(&kmers, 0, 1)
        );
        assert_eq!(idx.coarse_candidates(&kmers), loaded.coarse_candidates(&kmers));
    }

    #[test]
    fn mismatched_geometry_fails_before_any_read() {
        // Build from a 3-species database, then doctor the declared
        // species count, as if the index were built from a different
        // database than the one it embeds.
        let idx = test_index(3);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doctored.idx");
        idx.save(&path).unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        let catalog_len_at = INDEX_MAGIC.len() + 4 + 4 + 8;
        let catalog_len = u32::from_le_bytes(
            bytes[catalog_len_at..catalog_len_at + 4].try_into().unwrap(),
        ) as usize;
        let n_species_at = catalog_len_at + 4 + catalog_len;
        bytes[n_species_at..n_species_at + 4].copy_from_slice(&2u32.to_le_bytes());
        std::fs::write(&path, &bytes).unwrap();

        match KmerIndex::load(&path) {
            Err(HalalError::IndexMismatch(msg)) => {
                assert!(msg.contains("2 species"));
            }
            Err(e) => panic!("expected IndexMismatch, got {e:?}"),
            Ok(_) => panic!("doctored index loaded cleanly"),
        }
    }

    #[test]
    fn garbage_fails_as_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.idx");
        std::fs::write(&path, b"definitely not an index").unwrap();
        assert!(matches!(
            KmerIndex::load(&path),
            Err(HalalError::IndexLoadFailed(_))
        ));
    }
}
