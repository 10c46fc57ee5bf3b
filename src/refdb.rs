//src/refdb.rs

use std::fmt::Write as FmtWrite;
use std::path::Path;

use ahash::AHashMap;

use crate::error::HalalError;
use crate::types::HalalStatus;

/// Hard cap on catalog size: candidate sets are carried as a `u32`
/// species bitmask throughout classification.
pub const MAX_SPECIES: usize = 32;

/// One species entry in the reference catalog.
#[derive(Debug, Clone)]
pub struct Species {
    /// Stable binomial key, e.g. `Sus_scrofa`.
    pub id: String,
    /// Display name, e.g. `Pork (Pig)`.
    pub common_name: String,
    pub status: HalalStatus,
    /// Read-count to biomass normalization factor. Mitochondrial copy
    /// number varies by orders of magnitude between tissues and species.
    pub mito_copy_number: f64,
}

/// One mitochondrial marker (amplified region), with optional primers.
#[derive(Debug, Clone)]
pub struct Marker {
    pub id: String,
    pub primer_f: Option<String>,
    pub primer_r: Option<String>,
}

/// The reference catalog: species, markers, and the sparse
/// per-(species, marker) amplicon reference sequences. Immutable after
/// load; safe to share across worker threads.
///
/// Parsed from a tab-separated text catalog:
/// ```text
/// species <id>         <common name>  <status>  <mito copy number>
/// marker  <id>         <fwd primer|-> <rev primer|->
/// ref     <species id> <marker id>    <amplicon sequence>
/// ```
/// Blank lines and `#` comments are allowed. Unlike lenient taxonomy
/// parsers, any malformed line fails the whole load: the catalog is the
/// trust anchor for every downstream verdict.
pub struct RefDb {
    species: Vec<Species>,
    markers: Vec<Marker>,
    refs: AHashMap<(u16, u16), String>,
    species_by_id: AHashMap<String, u16>,
    markers_by_id: AHashMap<String, u16>,
}

impl RefDb {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, HalalError> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, HalalError> {
        let corrupt = |line_no: usize, msg: &str| {
            HalalError::CorruptDatabase(format!("line {line_no}: {msg}"))
        };

        let mut species: Vec<Species> = Vec::new();
        let mut markers: Vec<Marker> = Vec::new();
        let mut refs: AHashMap<(u16, u16), String> = AHashMap::new();
        let mut species_by_id: AHashMap<String, u16> = AHashMap::new();
        let mut markers_by_id: AHashMap<String, u16> = AHashMap::new();
        // ref lines may precede their species/marker lines, so resolve last
        let mut pending_refs: Vec<(usize, String, String, String)> = Vec::new();

        for (i, raw) in text.lines().enumerate() {
            let line_no = i + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split('\t').collect();
            match fields[0] {
                "species" => {
                    if fields.len() != 5 {
                        return Err(corrupt(line_no, "species record needs 5 fields"));
                    }
                    let id = fields[1].trim().to_string();
                    if id.is_empty() {
                        return Err(corrupt(line_no, "empty species id"));
                    }
                    if species_by_id.contains_key(&id) {
                        return Err(corrupt(line_no, "duplicate species id"));
                    }
                    if species.len() >= MAX_SPECIES {
                        return Err(corrupt(line_no, "more than 32 species"));
                    }
                    let status = HalalStatus::from_catalog(fields[3].trim())
                        .ok_or_else(|| corrupt(line_no, "unrecognized halal status"))?;
                    let cn: f64 = fields[4]
                        .trim()
                        .parse()
                        .map_err(|_| corrupt(line_no, "bad mito copy number"))?;
                    if !cn.is_finite() || cn <= 0.0 {
                        return Err(corrupt(line_no, "mito copy number must be positive"));
                    }
                    species_by_id.insert(id.clone(), species.len() as u16);
                    species.push(Species {
                        id,
                        common_name: fields[2].trim().to_string(),
                        status,
                        mito_copy_number: cn,
                    });
                }
                "marker" => {
                    if fields.len() != 4 {
                        return Err(corrupt(line_no, "marker record needs 4 fields"));
                    }
                    let id = fields[1].trim().to_string();
                    if id.is_empty() {
                        return Err(corrupt(line_no, "empty marker id"));
                    }
                    if markers_by_id.contains_key(&id) {
                        return Err(corrupt(line_no, "duplicate marker id"));
                    }
                    let primer = |f: &str| {
                        let f = f.trim();
                        if f.is_empty() || f == "-" {
                            None
                        } else {
                            Some(f.to_ascii_uppercase())
                        }
                    };
                    markers_by_id.insert(id.clone(), markers.len() as u16);
                    markers.push(Marker {
                        id,
                        primer_f: primer(fields[2]),
                        primer_r: primer(fields[3]),
                    });
                }
                "ref" => {
                    if fields.len() != 4 {
                        return Err(corrupt(line_no, "ref record needs 4 fields"));
                    }
                    let seq = fields[3].trim().to_ascii_uppercase();
                    if seq.is_empty() || !seq.bytes().all(|b| matches!(b, b'A' | b'C' | b'G' | b'T' | b'N')) {
                        return Err(corrupt(line_no, "ref sequence must be ACGTN"));
                    }
                    pending_refs.push((
                        line_no,
                        fields[1].trim().to_string(),
                        fields[2].trim().to_string(),
                        seq,
                    ));
                }
                other => {
                    return Err(corrupt(line_no, &format!("unknown record type '{other}'")));
                }
            }
        }

        for (line_no, sp, mk, seq) in pending_refs {
            let &s = species_by_id
                .get(&sp)
                .ok_or_else(|| corrupt(line_no, &format!("ref names unknown species '{sp}'")))?;
            let &m = markers_by_id
                .get(&mk)
                .ok_or_else(|| corrupt(line_no, &format!("ref names unknown marker '{mk}'")))?;
            if refs.insert((s, m), seq).is_some() {
                return Err(corrupt(line_no, "duplicate ref for (species, marker)"));
            }
        }

        if species.is_empty() {
            return Err(HalalError::CorruptDatabase("no species records".into()));
        }
        if markers.is_empty() {
            return Err(HalalError::CorruptDatabase("no marker records".into()));
        }
        if refs.is_empty() {
            return Err(HalalError::CorruptDatabase("no ref records".into()));
        }

        log::info!(
            "Loaded reference catalog: {} species, {} markers, {} references",
            species.len(),
            markers.len(),
            refs.len()
        );

        Ok(Self {
            species,
            markers,
            refs,
            species_by_id,
            markers_by_id,
        })
    }

    pub fn n_species(&self) -> usize {
        self.species.len()
    }

    pub fn n_markers(&self) -> usize {
        self.markers.len()
    }

    pub fn species(&self) -> &[Species] {
        &self.species
    }

    pub fn markers(&self) -> &[Marker] {
        &self.markers
    }

    pub fn species_index(&self, id: &str) -> Option<u16> {
        self.species_by_id.get(id).copied()
    }

    pub fn marker_index(&self, id: &str) -> Option<u16> {
        self.markers_by_id.get(id).copied()
    }

    /// Amplicon reference sequence for a (species, marker) pair.
    /// `None` means no coverage for that pair.
    pub fn marker_ref(&self, species: u16, marker: u16) -> Option<&str> {
        self.refs.get(&(species, marker)).map(|s| s.as_str())
    }

    pub fn marker_ref_len(&self, species: u16, marker: u16) -> Option<usize> {
        self.marker_ref(species, marker).map(|s| s.len())
    }

    pub fn n_marker_refs(&self) -> usize {
        self.refs.len()
    }

    /// Per-species mito copy-number constants, indexed by species index.
    pub fn copy_numbers(&self) -> Vec<f64> {
        self.species.iter().map(|s| s.mito_copy_number).collect()
    }

    /// Re-serialize to catalog text. Used to embed the catalog inside the
    /// index file so one artifact is self-contained.
    pub fn to_catalog_text(&self) -> String {
        let mut out = String::new();
        for s in &self.species {
            let _ = writeln!(
                out,
                "species\t{}\t{}\t{}\t{}",
                s.id, s.common_name, s.status, s.mito_copy_number
            );
        }
        for m in &self.markers {
            let _ = writeln!(
                out,
                "marker\t{}\t{}\t{}",
                m.id,
                m.primer_f.as_deref().unwrap_or("-"),
                m.primer_r.as_deref().unwrap_or("-")
            );
        }
        for ((s, m), seq) in &self.refs {
            let _ = writeln!(
                out,
                "ref\t{}\t{}\t{}",
                self.species[*s as usize].id, self.markers[*m as usize].id, seq
            );
        }
        out
    }
}
