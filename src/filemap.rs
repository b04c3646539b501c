//! Mapping from `(cell_id, subcell_id)` to the survey image that covers it.
//!
//! The text form is a whitespace-separated table with a header row naming
//! at least the columns `SCn` (cell id), `SCm` (sub-cell id) and `fileNPath`:
//!
//! ```text
//! # optional comments
//! SCn  SCm  fileNPath
//! 2404 5    rings.v3.skycell.2404.005.stk.fits
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::{Result, SkycellError};
use crate::grid::SUBCELLS_PER_SIDE;

const SUBCELL_COUNT: usize = (SUBCELLS_PER_SIDE * SUBCELLS_PER_SIDE) as usize;

const CELL_COLUMN: &str = "SCn";
const SUBCELL_COLUMN: &str = "SCm";
const PATH_COLUMN: &str = "fileNPath";

/// `(cell_id, subcell_id)` to source-path lookup.
#[derive(Debug, Clone, Default)]
pub struct CellFileTable {
    /// Index into `paths` per registered sub-cell, ordered by cell then sub-cell.
    lookup: BTreeMap<(u32, u8), u32>,
    paths: Vec<PathBuf>,
}

impl CellFileTable {
    /// Build a table from `(cell_id, subcell_id, path)` triples. A repeated
    /// key keeps the last path given for it.
    pub fn from_entries<I>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = (u32, u8, PathBuf)>,
    {
        let entries: Vec<_> = entries.into_iter().collect();
        for &(cell, sub, _) in &entries {
            check_key(cell, sub).map_err(|m| SkycellError::invalid_file_table(0, m))?;
        }
        Ok(Self::build(entries))
    }

    fn build(entries: Vec<(u32, u8, PathBuf)>) -> Self {
        let mut lookup = BTreeMap::new();
        let mut paths = Vec::new();
        let mut interned: HashMap<PathBuf, u32> = HashMap::new();

        for (cell, sub, path) in entries {
            let idx = *interned.entry(path).or_insert_with_key(|p| {
                paths.push(p.clone());
                (paths.len() - 1) as u32
            });
            if let Some(old) = lookup.insert((cell, sub), idx) {
                warn!(
                    cell,
                    subcell = sub,
                    replaced = %paths[old as usize].display(),
                    "duplicate skycell entry"
                );
            }
        }

        Self { lookup, paths }
    }

    /// Parse the text form. Relative paths are kept as written.
    pub fn parse(text: &str) -> Result<Self> {
        Self::parse_with_base(text, None)
    }

    /// Read a table file. Relative paths are resolved against the file's
    /// directory.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let table = Self::parse_with_base(&text, path.parent())?;
        info!(
            path = %path.display(),
            entries = table.len(),
            files = table.paths.len(),
            "loaded cell-to-file table"
        );
        Ok(table)
    }

    fn parse_with_base(text: &str, base: Option<&Path>) -> Result<Self> {
        let mut columns: Option<(usize, usize, usize)> = None;
        let mut entries = Vec::new();

        for (i, line) in text.lines().enumerate() {
            let line_no = i + 1;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') || is_rule(trimmed) {
                continue;
            }
            let fields: Vec<&str> = trimmed.split_whitespace().collect();

            let Some((cell_col, sub_col, path_col)) = columns else {
                columns = Some(header_columns(&fields, line_no)?);
                continue;
            };

            let needed = cell_col.max(sub_col).max(path_col) + 1;
            if fields.len() < needed {
                return Err(SkycellError::invalid_file_table(
                    line_no,
                    format!("expected {needed} columns, found {}", fields.len()),
                ));
            }
            let cell: u32 = fields[cell_col].parse().map_err(|_| {
                SkycellError::invalid_file_table(line_no, format!("bad cell id {:?}", fields[cell_col]))
            })?;
            let sub: u8 = fields[sub_col].parse().map_err(|_| {
                SkycellError::invalid_file_table(line_no, format!("bad sub-cell id {:?}", fields[sub_col]))
            })?;
            check_key(cell, sub).map_err(|m| SkycellError::invalid_file_table(line_no, m))?;

            let path = PathBuf::from(fields[path_col]);
            let path = match base {
                Some(base) if path.is_relative() => base.join(path),
                _ => path,
            };
            entries.push((cell, sub, path));
        }

        if columns.is_none() {
            return Err(SkycellError::invalid_file_table(0, "no header row"));
        }
        Ok(Self::build(entries))
    }

    /// Build a table from survey files under `dir` matching the glob
    /// `pattern`, reading cell and sub-cell ids from names containing
    /// `skycell.<cell>.<subcell>`.
    pub fn scan(dir: &Path, pattern: &str) -> Result<Self> {
        let glob_pattern = dir.join(pattern);
        let mut entries = Vec::new();

        for entry in glob::glob(&glob_pattern.to_string_lossy())? {
            let path = match entry {
                Ok(path) => path,
                Err(e) => {
                    warn!(error = %e, "unreadable path while scanning");
                    continue;
                }
            };
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            match parse_skycell_name(name) {
                Some((cell, sub)) => entries.push((cell, sub, path)),
                None => debug!(path = %path.display(), "not a skycell image, skipped"),
            }
        }

        // Glob order is alphabetical; keep it so duplicates resolve predictably.
        let table = Self::build(entries);
        info!(
            pattern = %glob_pattern.display(),
            entries = table.len(),
            "scanned survey images"
        );
        Ok(table)
    }

    /// Write the text form, rows ordered by cell then sub-cell.
    pub fn write_to<W: Write>(&self, mut w: W) -> Result<()> {
        writeln!(w, "{CELL_COLUMN} {SUBCELL_COLUMN} {PATH_COLUMN}")?;
        let mut line_no = 1;
        for (&(cell, sub), &idx) in &self.lookup {
            line_no += 1;
            let path = self.paths[idx as usize].to_string_lossy();
            if path.is_empty() || path.chars().any(char::is_whitespace) {
                return Err(SkycellError::invalid_file_table(
                    line_no,
                    format!("path {path:?} cannot be written to a whitespace-separated table"),
                ));
            }
            writeln!(w, "{cell} {sub} {path}")?;
        }
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = fs::File::create(path)?;
        self.write_to(std::io::BufWriter::new(file))
    }

    /// Index of the source registered for a sub-cell. Cell 0 (uncovered)
    /// never has one.
    pub fn lookup(&self, cell_id: u32, subcell_id: u8) -> Option<usize> {
        if cell_id == 0 {
            return None;
        }
        self.lookup
            .get(&(cell_id, subcell_id))
            .map(|&idx| idx as usize)
    }

    /// Path registered for a sub-cell.
    pub fn source_for(&self, cell_id: u32, subcell_id: u8) -> Option<&Path> {
        self.lookup(cell_id, subcell_id).map(|idx| self.path(idx))
    }

    pub fn path(&self, index: usize) -> &Path {
        &self.paths[index]
    }

    /// Distinct source paths, in first-seen order.
    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    /// Number of registered `(cell, sub-cell)` pairs.
    pub fn len(&self) -> usize {
        self.lookup.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lookup.is_empty()
    }
}

fn check_key(cell: u32, sub: u8) -> std::result::Result<(), String> {
    if cell == 0 {
        return Err("cell id 0 is reserved for uncovered points".to_string());
    }
    if sub as usize >= SUBCELL_COUNT {
        return Err(format!("sub-cell id {sub} is not below {SUBCELL_COUNT}"));
    }
    Ok(())
}

fn header_columns(fields: &[&str], line_no: usize) -> Result<(usize, usize, usize)> {
    let find = |name: &str| {
        fields
            .iter()
            .position(|f| *f == name)
            .ok_or_else(|| SkycellError::invalid_file_table(line_no, format!("missing column {name}")))
    };
    Ok((find(CELL_COLUMN)?, find(SUBCELL_COLUMN)?, find(PATH_COLUMN)?))
}

/// Separator rows of fixed-width tables, e.g. `---- --- -------`.
fn is_rule(line: &str) -> bool {
    line.chars().all(|c| c == '-' || c.is_whitespace())
}

/// Cell and sub-cell ids from a name like `rings.v3.skycell.2404.005.stk.fits`.
pub fn parse_skycell_name(name: &str) -> Option<(u32, u8)> {
    const TAG: &str = "skycell.";
    let start = name.to_ascii_lowercase().find(TAG)? + TAG.len();
    let mut parts = name[start..].split('.');
    let cell: u32 = parts.next()?.parse().ok()?;
    let sub: u8 = parts.next()?.parse().ok()?;
    check_key(cell, sub).ok()?;
    Some((cell, sub))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# survey stack products
SCn SCm fileNPath
---- --- ---------
2404 5 RINGS.V3.skycell.2404.005.stk.fits

2404 6 RINGS.V3.skycell.2404.006.stk.fits
1 99 /data/skycell.0001.099.fits
";

    #[test]
    fn parses_header_and_rows() {
        let table = CellFileTable::parse(SAMPLE).unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(
            table.source_for(2404, 5),
            Some(Path::new("RINGS.V3.skycell.2404.005.stk.fits"))
        );
        assert_eq!(table.source_for(1, 99), Some(Path::new("/data/skycell.0001.099.fits")));
        assert_eq!(table.lookup(2404, 7), None);
        assert_eq!(table.lookup(9999, 0), None);
        assert_eq!(table.lookup(0, 0), None);
    }

    #[test]
    fn largest_cell_id_is_a_plain_entry() {
        let text = "SCn SCm fileNPath\n4294967295 0 a.fits\n3 1 b.fits\n";
        let table = CellFileTable::parse(text).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.source_for(u32::MAX, 0), Some(Path::new("a.fits")));
        assert_eq!(table.lookup(u32::MAX, 1), None);

        let mut out = Vec::new();
        table.write_to(&mut out).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "SCn SCm fileNPath\n3 1 b.fits\n4294967295 0 a.fits\n"
        );
    }

    #[test]
    fn columns_found_by_name() {
        let text = "fileNPath extra SCm SCn\na.fits x 3 12\n";
        let table = CellFileTable::parse(text).unwrap();
        assert_eq!(table.source_for(12, 3), Some(Path::new("a.fits")));
    }

    #[test]
    fn shared_paths_are_interned() {
        let text = "SCn SCm fileNPath\n5 0 a.fits\n5 1 a.fits\n6 0 b.fits\n";
        let table = CellFileTable::parse(text).unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(table.paths().len(), 2);
        assert_eq!(table.lookup(5, 0), table.lookup(5, 1));
        assert_ne!(table.lookup(5, 0), table.lookup(6, 0));
    }

    #[test]
    fn later_duplicate_wins() {
        let text = "SCn SCm fileNPath\n5 0 a.fits\n5 0 b.fits\n";
        let table = CellFileTable::parse(text).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.source_for(5, 0), Some(Path::new("b.fits")));
    }

    #[test]
    fn rejects_malformed_input() {
        let missing_column = CellFileTable::parse("SCn fileNPath\n1 a.fits\n").unwrap_err();
        assert!(missing_column.to_string().contains("SCm"));

        let short_row = CellFileTable::parse("SCn SCm fileNPath\n1 2\n").unwrap_err();
        assert!(matches!(short_row, SkycellError::InvalidFileTable { line: 2, .. }));

        assert!(CellFileTable::parse("SCn SCm fileNPath\nx 2 a.fits\n").is_err());
        assert!(CellFileTable::parse("SCn SCm fileNPath\n1 100 a.fits\n").is_err());
        assert!(CellFileTable::parse("SCn SCm fileNPath\n0 1 a.fits\n").is_err());
        assert!(CellFileTable::parse("# only a comment\n").is_err());
    }

    #[test]
    fn load_resolves_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let table_path = dir.path().join("cells.txt");
        fs::write(&table_path, "SCn SCm fileNPath\n7 1 img/a.fits\n7 2 /abs/b.fits\n").unwrap();

        let table = CellFileTable::load(&table_path).unwrap();
        assert_eq!(table.source_for(7, 1), Some(dir.path().join("img/a.fits").as_path()));
        assert_eq!(table.source_for(7, 2), Some(Path::new("/abs/b.fits")));
    }

    #[test]
    fn write_then_parse_keeps_entries() {
        let table = CellFileTable::from_entries([
            (3, 10, PathBuf::from("c.fits")),
            (1, 0, PathBuf::from("a.fits")),
        ])
        .unwrap();
        let mut out = Vec::new();
        table.write_to(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text, "SCn SCm fileNPath\n1 0 a.fits\n3 10 c.fits\n");

        let bad = CellFileTable::from_entries([(1, 0, PathBuf::from("a b.fits"))]).unwrap();
        assert!(bad.write_to(Vec::new()).is_err());
    }

    #[test]
    fn skycell_names() {
        assert_eq!(parse_skycell_name("rings.v3.skycell.2404.005.stk.fits"), Some((2404, 5)));
        assert_eq!(parse_skycell_name("RINGS.V3.SKYCELL.0635.099.png"), Some((635, 99)));
        assert_eq!(parse_skycell_name("skycell.0001.100.fits"), None);
        assert_eq!(parse_skycell_name("skycell.0000.001.fits"), None);
        assert_eq!(parse_skycell_name("notes.txt"), None);
    }

    #[test]
    fn scan_finds_survey_files() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "rings.v3.skycell.1200.011.stk.fits",
            "rings.v3.skycell.1200.012.stk.fits",
            "readme.fits",
            "rings.v3.skycell.1201.000.stk.png",
        ] {
            fs::write(dir.path().join(name), b"").unwrap();
        }

        let table = CellFileTable::scan(dir.path(), "*.fits").unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(
            table.source_for(1200, 12),
            Some(dir.path().join("rings.v3.skycell.1200.012.stk.fits").as_path())
        );
        assert_eq!(table.lookup(1201, 0), None);
    }
}
