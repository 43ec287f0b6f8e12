//! Spreadsheet loading: file bytes → ordered [`Chunk`]s with provenance.
//!
//! Supported inputs are OOXML workbooks (`.xlsx`, `.xlsm`), legacy BIFF
//! workbooks (`.xls`) and CSV. XLSX is read directly from the zip container
//! with `quick-xml`; sheet names and order come from `xl/workbook.xml` and its
//! relationships part, falling back to `xl/worksheets/sheetN.xml` order when
//! those are missing. Date-formatted numbers are rendered as ISO dates using
//! the number formats in `xl/styles.xml`. `.xls` files are decoded with
//! `calamine` into the same sheet model.
//!
//! Anything else (unknown types, corrupt archives, malformed XML, cell
//! references outside the sheet grid) fails with
//! [`PipelineError::UnsupportedFormat`]. A readable workbook that holds no
//! text is not an error: it simply yields zero chunks.

use std::borrow::Cow;
use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use quick_xml::events::{BytesStart, Event};
use tracing::debug;

use crate::config::{LoaderConfig, LoaderMode};
use crate::error::{PipelineError, Result};
use crate::models::{Chunk, Provenance};

/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// Sheet grid limits shared by OOXML and BIFF8 writers.
const MAX_ROWS: u32 = 1_048_576;
const MAX_COLUMNS: u32 = 16_384;

/// Compound File Binary signature at the start of every `.xls`.
const CFB_MAGIC: &[u8] = b"\xD0\xCF\x11\xE0\xA1\xB1\x1A\xE1";

/// A spreadsheet handed to the pipeline, either on disk or already in memory.
#[derive(Debug, Clone)]
pub enum DocumentSource {
    Path(PathBuf),
    Bytes { name: String, bytes: Vec<u8> },
}

impl DocumentSource {
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        DocumentSource::Path(path.into())
    }

    pub fn from_bytes(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        DocumentSource::Bytes {
            name: name.into(),
            bytes,
        }
    }

    /// File name used for format detection and the `source` provenance key.
    pub fn name(&self) -> String {
        match self {
            DocumentSource::Path(p) => p
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| p.display().to_string()),
            DocumentSource::Bytes { name, .. } => name.clone(),
        }
    }

    /// Raw file bytes.
    pub fn read(&self) -> Result<Cow<'_, [u8]>> {
        match self {
            DocumentSource::Path(p) => std::fs::read(p).map(Cow::Owned).map_err(|e| {
                PipelineError::UnsupportedFormat(format!("cannot read {}: {}", p.display(), e))
            }),
            DocumentSource::Bytes { bytes, .. } => Ok(Cow::Borrowed(bytes.as_slice())),
        }
    }
}

/// Load a spreadsheet into chunks according to `config.mode`.
pub fn load(source: &DocumentSource, config: &LoaderConfig) -> Result<Vec<Chunk>> {
    let bytes = source.read()?;
    load_bytes(&source.name(), &bytes, config)
}

/// Load an in-memory spreadsheet. `name` drives format detection.
pub fn load_bytes(name: &str, bytes: &[u8], config: &LoaderConfig) -> Result<Vec<Chunk>> {
    let sheets = match detect_format(name, bytes)? {
        Format::Xlsx => read_xlsx(bytes, config)?,
        Format::Xls => read_xls(bytes, config)?,
        Format::Csv => read_csv(name, bytes, config)?,
    };

    let chunks: Vec<Chunk> = match config.mode {
        LoaderMode::Rows => sheets.iter().flat_map(|s| row_chunks(name, s)).collect(),
        LoaderMode::Sheets => sheets.iter().filter_map(|s| sheet_chunk(name, s)).collect(),
    };

    debug!(
        source = name,
        sheets = sheets.len(),
        chunks = chunks.len(),
        "spreadsheet loaded"
    );
    Ok(chunks)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Xlsx,
    Xls,
    Csv,
}

fn detect_format(name: &str, bytes: &[u8]) -> Result<Format> {
    let ext = Path::new(name)
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase());

    match ext.as_deref() {
        Some("xlsx") | Some("xlsm") => Ok(Format::Xlsx),
        Some("xls") => Ok(Format::Xls),
        Some("csv") => Ok(Format::Csv),
        _ if bytes.starts_with(b"PK\x03\x04") => Ok(Format::Xlsx),
        _ if bytes.starts_with(CFB_MAGIC) => Ok(Format::Xls),
        _ => Err(PipelineError::UnsupportedFormat(format!(
            "{}: expected an .xlsx, .xlsm, .xls or .csv spreadsheet",
            name
        ))),
    }
}

// ============ Sheet model ============

#[derive(Debug, Clone, PartialEq)]
struct Cell {
    /// 0-based column index (`A` = 0).
    column: u32,
    value: String,
}

#[derive(Debug, Clone, PartialEq)]
struct SheetRow {
    /// 1-based row number as shown by spreadsheet applications.
    number: u32,
    cells: Vec<Cell>,
}

#[derive(Debug, Clone, PartialEq)]
struct Sheet {
    name: String,
    rows: Vec<SheetRow>,
}

/// `0 → "A"`, `25 → "Z"`, `26 → "AA"`.
fn column_letters(mut index: u32) -> String {
    let mut out = Vec::new();
    loop {
        out.push(b'A' + (index % 26) as u8);
        if index < 26 {
            break;
        }
        index = index / 26 - 1;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

/// Parses the column part of an A1 reference (`"AB12"` → 27).
fn column_index(reference: &str) -> Option<u32> {
    let letters: String = reference
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect();
    if letters.is_empty() {
        return None;
    }
    let mut acc: u32 = 0;
    for c in letters.chars() {
        let digit = (c.to_ascii_uppercase() as u8 - b'A') as u32 + 1;
        acc = acc.checked_mul(26)?.checked_add(digit)?;
    }
    Some(acc - 1)
}

// ============ Chunking ============

fn row_chunks(source: &str, sheet: &Sheet) -> Vec<Chunk> {
    let mut rows = sheet.rows.iter().filter(|r| !r.cells.is_empty());
    let Some(header_row) = rows.next() else {
        return Vec::new();
    };
    let headers: HashMap<u32, &str> = header_row
        .cells
        .iter()
        .map(|c| (c.column, c.value.as_str()))
        .collect();

    rows.map(|row| {
        let text = row
            .cells
            .iter()
            .map(|cell| {
                let label = headers
                    .get(&cell.column)
                    .copied()
                    .filter(|h| !h.is_empty())
                    .map(str::to_string)
                    .unwrap_or_else(|| column_letters(cell.column));
                format!("{}: {}", label, cell.value)
            })
            .collect::<Vec<_>>()
            .join("\n");

        let first = row.cells.first().map(|c| c.column).unwrap_or(0);
        let last = row.cells.last().map(|c| c.column).unwrap_or(first);
        let mut provenance = base_provenance(source, &sheet.name, "row");
        provenance.insert("row".into(), row.number.to_string());
        provenance.insert(
            "cells".into(),
            format!(
                "{}{}:{}{}",
                column_letters(first),
                row.number,
                column_letters(last),
                row.number
            ),
        );
        Chunk::new(text, provenance)
    })
    .collect()
}

fn sheet_chunk(source: &str, sheet: &Sheet) -> Option<Chunk> {
    let rows: Vec<&SheetRow> = sheet.rows.iter().filter(|r| !r.cells.is_empty()).collect();
    let (first, last) = (rows.first()?, rows.last()?);

    let text = rows
        .iter()
        .map(|r| {
            r.cells
                .iter()
                .map(|c| c.value.as_str())
                .collect::<Vec<_>>()
                .join("\t")
        })
        .collect::<Vec<_>>()
        .join("\n");
    let max_col = rows
        .iter()
        .filter_map(|r| r.cells.last().map(|c| c.column))
        .max()
        .unwrap_or(0);

    let mut provenance = base_provenance(source, &sheet.name, "sheet");
    provenance.insert(
        "cells".into(),
        format!("A{}:{}{}", first.number, column_letters(max_col), last.number),
    );
    Some(Chunk::new(text, provenance))
}

fn base_provenance(source: &str, sheet: &str, element: &str) -> Provenance {
    let mut p = Provenance::new();
    p.insert("source".into(), source.to_string());
    p.insert("sheet".into(), sheet.to_string());
    p.insert("element".into(), element.to_string());
    p
}

// ============ CSV ============

fn read_csv(name: &str, bytes: &[u8], config: &LoaderConfig) -> Result<Vec<Sheet>> {
    let sheet_name = Path::new(name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string());

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(bytes);

    let mut rows = Vec::new();
    let mut cell_count = 0usize;
    for (idx, record) in reader.records().enumerate() {
        let record = record.map_err(|e| {
            PipelineError::UnsupportedFormat(format!("{}: invalid CSV: {}", name, e))
        })?;
        let mut cells = Vec::new();
        for (col, field) in record.iter().enumerate() {
            let value = field.trim();
            if value.is_empty() {
                continue;
            }
            cells.push(Cell {
                column: col as u32,
                value: value.to_string(),
            });
            cell_count += 1;
        }
        rows.push(SheetRow {
            number: idx as u32 + 1,
            cells,
        });
        if cell_count >= config.max_cells_per_sheet {
            break;
        }
    }

    Ok(vec![Sheet {
        name: sheet_name,
        rows,
    }])
}

// ============ Dates ============

/// How a date-formatted serial number is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DateKind {
    Date,
    DateTime,
    Time,
}

impl DateKind {
    fn pattern(self) -> &'static str {
        match self {
            DateKind::Date => "%Y-%m-%d",
            DateKind::DateTime => "%Y-%m-%d %H:%M:%S",
            DateKind::Time => "%H:%M:%S",
        }
    }
}

/// Built-in number formats that display dates or times.
fn builtin_date_kind(num_fmt_id: u32) -> Option<DateKind> {
    match num_fmt_id {
        14..=17 => Some(DateKind::Date),
        22 => Some(DateKind::DateTime),
        18..=21 | 45..=47 => Some(DateKind::Time),
        _ => None,
    }
}

/// Classify a custom format code such as `dd/mm/yyyy hh:mm`.
///
/// Only the first section counts; quoted literals, escaped characters and
/// `[...]` modifiers are ignored.
fn classify_format_code(code: &str) -> Option<DateKind> {
    let mut tokens = String::new();
    let mut chars = code.chars();
    let (mut quoted, mut bracketed) = (false, false);
    while let Some(c) = chars.next() {
        match c {
            '"' if !bracketed => quoted = !quoted,
            _ if quoted => {}
            '\\' => {
                chars.next();
            }
            '[' => bracketed = true,
            ']' => bracketed = false,
            _ if bracketed => {}
            ';' => break,
            c => tokens.push(c.to_ascii_lowercase()),
        }
    }
    let date = tokens.contains('y') || tokens.contains('d');
    let time = tokens.contains('h') || tokens.contains('s');
    match (date, time) {
        (true, true) => Some(DateKind::DateTime),
        (true, false) => Some(DateKind::Date),
        (false, true) => Some(DateKind::Time),
        (false, false) => None,
    }
}

/// Render a spreadsheet serial date. `None` when it is outside 0..=9999-12-31.
fn format_serial_date(serial: f64, kind: DateKind, date1904: bool) -> Option<String> {
    if !serial.is_finite() || !(0.0..2_958_466.0).contains(&serial) {
        return None;
    }
    let mut days = serial.trunc() as i64;
    let mut secs = (serial.fract() * 86_400.0).round() as i64;
    if secs >= 86_400 {
        days += 1;
        secs -= 86_400;
    }
    let epoch = if date1904 {
        NaiveDate::from_ymd_opt(1904, 1, 1)?
    } else {
        // The 1900 system counts a 29 February 1900 that never existed.
        if days < 61 {
            days += 1;
        }
        NaiveDate::from_ymd_opt(1899, 12, 30)?
    };
    let at = epoch
        .and_hms_opt(0, 0, 0)?
        .checked_add_signed(chrono::Duration::days(days))?
        .checked_add_signed(chrono::Duration::seconds(secs))?;
    Some(at.format(kind.pattern()).to_string())
}

/// `34.0 → "34"`, `4.5 → "4.5"`.
fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}

// ============ XLS ============

fn read_xls(bytes: &[u8], config: &LoaderConfig) -> Result<Vec<Sheet>> {
    use calamine::Reader;

    let invalid = |e: calamine::XlsError| PipelineError::UnsupportedFormat(format!("invalid xls: {}", e));
    let mut workbook = calamine::Xls::new(Cursor::new(bytes)).map_err(invalid)?;
    let names: Vec<String> = workbook
        .sheets_metadata()
        .iter()
        .filter(|s| matches!(s.typ, calamine::SheetType::WorkSheet))
        .map(|s| s.name.clone())
        .collect();

    let mut sheets = Vec::new();
    for name in names.into_iter().take(config.max_sheets) {
        let range = workbook.worksheet_range(&name).map_err(invalid)?;
        let rows = range_rows(&range, config.max_cells_per_sheet);
        sheets.push(Sheet { name, rows });
    }
    Ok(sheets)
}

fn range_rows(range: &calamine::Range<calamine::Data>, max_cells: usize) -> Vec<SheetRow> {
    let Some((top, left)) = range.start() else {
        return Vec::new();
    };
    let mut rows: Vec<SheetRow> = Vec::new();
    for (r, c, data) in range.used_cells().take(max_cells) {
        let Some(value) = xls_cell_value(data) else {
            continue;
        };
        let cell = Cell {
            column: left.saturating_add(c as u32),
            value,
        };
        let number = top.saturating_add(r as u32).saturating_add(1);
        match rows.last_mut() {
            Some(row) if row.number == number => row.cells.push(cell),
            _ => rows.push(SheetRow {
                number,
                cells: vec![cell],
            }),
        }
    }
    rows
}

fn xls_cell_value(data: &calamine::Data) -> Option<String> {
    use calamine::Data;

    let value = match data {
        Data::String(s) => s.trim().to_string(),
        Data::Float(f) => format_number(*f),
        Data::Int(i) => i.to_string(),
        Data::Bool(b) => (if *b { "TRUE" } else { "FALSE" }).to_string(),
        Data::DateTime(dt) => {
            let serial = dt.as_f64();
            let kind = if serial.fract() == 0.0 {
                DateKind::Date
            } else if serial < 1.0 {
                DateKind::Time
            } else {
                DateKind::DateTime
            };
            format_serial_date(serial, kind, false).unwrap_or_else(|| format_number(serial))
        }
        Data::DateTimeIso(s) | Data::DurationIso(s) => s.clone(),
        _ => return None,
    };
    (!value.is_empty()).then_some(value)
}

// ============ XLSX ============

type Archive<'a> = zip::ZipArchive<Cursor<&'a [u8]>>;

fn ooxml(e: impl std::fmt::Display) -> PipelineError {
    PipelineError::UnsupportedFormat(format!("invalid xlsx: {}", e))
}

fn read_xlsx(bytes: &[u8], config: &LoaderConfig) -> Result<Vec<Sheet>> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).map_err(ooxml)?;
    let shared_strings = read_shared_strings(&mut archive)?;
    let styles = CellStyles {
        date_kinds: read_styles(&mut archive)?,
        date1904: read_date1904(&mut archive)?,
    };
    let entries = list_sheets(&mut archive)?;
    if entries.is_empty() {
        return Err(PipelineError::UnsupportedFormat(
            "archive contains no worksheets".to_string(),
        ));
    }

    let mut sheets = Vec::new();
    for (name, path) in entries.into_iter().take(config.max_sheets) {
        let xml = read_zip_entry_bounded(&mut archive, &path, MAX_XML_ENTRY_BYTES)?;
        let rows = parse_sheet_rows(&xml, &shared_strings, &styles, config.max_cells_per_sheet)?;
        sheets.push(Sheet { name, rows });
    }
    Ok(sheets)
}

fn has_entry(archive: &Archive<'_>, name: &str) -> bool {
    archive.file_names().any(|n| n == name)
}

fn read_zip_entry_bounded(archive: &mut Archive<'_>, name: &str, max_bytes: u64) -> Result<Vec<u8>> {
    let entry = archive.by_name(name).map_err(ooxml)?;
    let mut out = Vec::new();
    entry
        .take(max_bytes)
        .read_to_end(&mut out)
        .map_err(ooxml)?;
    if out.len() as u64 >= max_bytes {
        return Err(ooxml(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, max_bytes
        )));
    }
    Ok(out)
}

fn attr_value(e: &BytesStart<'_>, local: &[u8]) -> Option<String> {
    e.attributes().flatten().find_map(|a| {
        if a.key.local_name().as_ref() == local {
            a.unescape_value().ok().map(|v| v.into_owned())
        } else {
            None
        }
    })
}

/// Shared string table. The part is optional: numeric-only workbooks omit it.
fn read_shared_strings(archive: &mut Archive<'_>) -> Result<Vec<String>> {
    if !has_entry(archive, "xl/sharedStrings.xml") {
        return Ok(Vec::new());
    }
    let xml = read_zip_entry_bounded(archive, "xl/sharedStrings.xml", MAX_XML_ENTRY_BYTES)?;

    let mut strings = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    reader.config_mut().trim_text(false);
    let mut buf = Vec::new();
    let mut current = String::new();
    let mut in_si = false;
    let mut in_t = false;
    // Phonetic runs repeat the text in another script; skip them.
    let mut in_phonetic = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => {
                    in_si = true;
                    current.clear();
                }
                b"rPh" => in_phonetic = true,
                b"t" if in_si && !in_phonetic => in_t = true,
                _ => {}
            },
            Ok(Event::Empty(e)) => {
                if e.local_name().as_ref() == b"si" {
                    strings.push(String::new());
                }
            }
            Ok(Event::Text(te)) if in_t => {
                current.push_str(te.unescape().map_err(ooxml)?.as_ref());
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"si" => {
                    in_si = false;
                    strings.push(current.trim().to_string());
                }
                b"rPh" => in_phonetic = false,
                b"t" => in_t = false,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ooxml(e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

/// Date rendering context for numeric cells.
#[derive(Debug, Default)]
struct CellStyles {
    /// Indexed by a cell's `s` attribute, i.e. its position in `cellXfs`.
    date_kinds: Vec<Option<DateKind>>,
    date1904: bool,
}

impl CellStyles {
    fn date_kind(&self, style: Option<usize>) -> Option<DateKind> {
        style.and_then(|i| self.date_kinds.get(i).copied().flatten())
    }
}

fn read_styles(archive: &mut Archive<'_>) -> Result<Vec<Option<DateKind>>> {
    if !has_entry(archive, "xl/styles.xml") {
        return Ok(Vec::new());
    }
    let xml = read_zip_entry_bounded(archive, "xl/styles.xml", MAX_XML_ENTRY_BYTES)?;
    parse_styles(&xml)
}

fn parse_styles(xml: &[u8]) -> Result<Vec<Option<DateKind>>> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut custom: HashMap<u32, Option<DateKind>> = HashMap::new();
    let mut xf_formats: Vec<u32> = Vec::new();
    let mut in_cell_xfs = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"cellXfs" => in_cell_xfs = true,
            Ok(Event::End(e)) if e.local_name().as_ref() == b"cellXfs" => in_cell_xfs = false,
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"numFmt" => {
                    let id = attr_value(&e, b"numFmtId").and_then(|v| v.parse().ok());
                    if let (Some(id), Some(code)) = (id, attr_value(&e, b"formatCode")) {
                        custom.insert(id, classify_format_code(&code));
                    }
                }
                // cellStyleXfs also holds <xf>; only cellXfs is indexed by cells.
                b"xf" if in_cell_xfs => xf_formats.push(
                    attr_value(&e, b"numFmtId")
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(0),
                ),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ooxml(e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(xf_formats
        .into_iter()
        .map(|id| custom.get(&id).copied().unwrap_or_else(|| builtin_date_kind(id)))
        .collect())
}

/// Whether the workbook counts days from 1904 (`<workbookPr date1904="1"/>`).
fn read_date1904(archive: &mut Archive<'_>) -> Result<bool> {
    if !has_entry(archive, "xl/workbook.xml") {
        return Ok(false);
    }
    let xml = read_zip_entry_bounded(archive, "xl/workbook.xml", MAX_XML_ENTRY_BYTES)?;
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) if e.local_name().as_ref() == b"workbookPr" => {
                return Ok(matches!(
                    attr_value(&e, b"date1904").as_deref(),
                    Some("1") | Some("true")
                ));
            }
            Ok(Event::Eof) => return Ok(false),
            Err(e) => return Err(ooxml(e)),
            _ => {}
        }
        buf.clear();
    }
}

/// Returns `(sheet name, zip path)` pairs in workbook order.
fn list_sheets(archive: &mut Archive<'_>) -> Result<Vec<(String, String)>> {
    if has_entry(archive, "xl/workbook.xml") && has_entry(archive, "xl/_rels/workbook.xml.rels") {
        let workbook = read_zip_entry_bounded(archive, "xl/workbook.xml", MAX_XML_ENTRY_BYTES)?;
        let rels =
            read_zip_entry_bounded(archive, "xl/_rels/workbook.xml.rels", MAX_XML_ENTRY_BYTES)?;
        let targets = parse_relationships(&rels)?;

        let mut sheets = Vec::new();
        for (name, rel_id) in parse_workbook_sheets(&workbook)? {
            if let Some(path) = targets.get(&rel_id) {
                if has_entry(archive, path) {
                    sheets.push((name, path.clone()));
                }
            }
        }
        if !sheets.is_empty() {
            return Ok(sheets);
        }
    }
    Ok(list_worksheet_paths(archive))
}

fn parse_workbook_sheets(xml: &[u8]) -> Result<Vec<(String, String)>> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut sheets = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) if e.local_name().as_ref() == b"sheet" => {
                if let (Some(name), Some(id)) = (attr_value(&e, b"name"), attr_value(&e, b"id")) {
                    sheets.push((name, id));
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ooxml(e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(sheets)
}

fn parse_relationships(xml: &[u8]) -> Result<HashMap<String, String>> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut targets = HashMap::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e))
                if e.local_name().as_ref() == b"Relationship" =>
            {
                if let (Some(id), Some(target)) = (attr_value(&e, b"Id"), attr_value(&e, b"Target"))
                {
                    let path = match target.strip_prefix('/') {
                        Some(absolute) => absolute.to_string(),
                        None => format!("xl/{}", target),
                    };
                    targets.insert(id, path);
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ooxml(e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(targets)
}

fn list_worksheet_paths(archive: &Archive<'_>) -> Vec<(String, String)> {
    let mut paths: Vec<(u32, String)> = archive
        .file_names()
        .filter(|n| n.starts_with("xl/worksheets/sheet") && n.ends_with(".xml"))
        .map(|n| {
            let num = n
                .trim_start_matches("xl/worksheets/sheet")
                .trim_end_matches(".xml")
                .parse::<u32>()
                .unwrap_or(u32::MAX);
            (num, n.to_string())
        })
        .collect();
    paths.sort();
    paths
        .into_iter()
        .enumerate()
        .map(|(i, (_, path))| (format!("Sheet{}", i + 1), path))
        .collect()
}

/// Row number from `<row r="..">`, or the next one in sequence when absent.
fn row_number(e: &BytesStart<'_>, next: u32) -> Result<u32> {
    let number = match attr_value(e, b"r") {
        Some(r) => r
            .trim()
            .parse::<u32>()
            .map_err(|_| ooxml(format!("invalid row number '{}'", r)))?,
        None => next,
    };
    if number == 0 || number > MAX_ROWS {
        return Err(ooxml(format!("row {} is outside 1..={}", number, MAX_ROWS)));
    }
    Ok(number)
}

/// Column index from `<c r="..">`, or the next one in sequence when absent.
fn cell_column(e: &BytesStart<'_>, next: u32) -> Result<u32> {
    let column = attr_value(e, b"r")
        .and_then(|r| column_index(&r))
        .unwrap_or(next);
    if column >= MAX_COLUMNS {
        return Err(ooxml(format!(
            "column {} is outside A..={}",
            column_letters(column),
            column_letters(MAX_COLUMNS - 1)
        )));
    }
    Ok(column)
}

fn parse_sheet_rows(
    xml: &[u8],
    shared_strings: &[String],
    styles: &CellStyles,
    max_cells: usize,
) -> Result<Vec<SheetRow>> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(false);
    let mut buf = Vec::new();

    let mut rows: Vec<SheetRow> = Vec::new();
    let mut current: Option<SheetRow> = None;
    let mut next_row_number = 1u32;
    let mut next_column = 0u32;

    let mut column = 0u32;
    let mut cell_type: Option<String> = None;
    let mut cell_style: Option<usize> = None;
    let mut cell_text = String::new();
    let mut in_value = false;
    let mut cell_count = 0usize;

    loop {
        if cell_count >= max_cells {
            break;
        }
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"row" => {
                    let number = row_number(&e, next_row_number)?;
                    next_row_number = number + 1;
                    next_column = 0;
                    current = Some(SheetRow {
                        number,
                        cells: Vec::new(),
                    });
                }
                b"c" => {
                    column = cell_column(&e, next_column)?;
                    next_column = column + 1;
                    cell_type = attr_value(&e, b"t");
                    cell_style = attr_value(&e, b"s").and_then(|s| s.parse().ok());
                    cell_text.clear();
                }
                // <v> holds the cached value; <t> appears inside inline strings.
                b"v" | b"t" => in_value = true,
                _ => {}
            },
            Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"row" => {
                    next_row_number = row_number(&e, next_row_number)? + 1;
                }
                b"c" => {
                    next_column = cell_column(&e, next_column)? + 1;
                }
                _ => {}
            },
            Ok(Event::Text(te)) if in_value => {
                cell_text.push_str(te.unescape().map_err(ooxml)?.as_ref());
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"v" | b"t" => in_value = false,
                b"c" => {
                    let value = resolve_cell_value(
                        cell_type.as_deref(),
                        &cell_text,
                        shared_strings,
                        styles.date_kind(cell_style).map(|kind| (kind, styles.date1904)),
                    );
                    if !value.is_empty() {
                        if let Some(row) = current.as_mut() {
                            row.cells.push(Cell { column, value });
                            cell_count += 1;
                        }
                    }
                    cell_type = None;
                    cell_style = None;
                    cell_text.clear();
                }
                b"row" => {
                    if let Some(row) = current.take() {
                        rows.push(row);
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ooxml(e)),
            _ => {}
        }
        buf.clear();
    }

    if let Some(row) = current.take() {
        rows.push(row);
    }
    for row in &mut rows {
        row.cells.sort_by_key(|c| c.column);
    }
    Ok(rows)
}

/// Cell text for display. `date` is the style's date kind and the workbook's
/// 1904 flag, applied to numeric cells only.
fn resolve_cell_value(
    cell_type: Option<&str>,
    raw: &str,
    shared_strings: &[String],
    date: Option<(DateKind, bool)>,
) -> String {
    let raw = raw.trim();
    match cell_type {
        Some("s") => raw
            .parse::<usize>()
            .ok()
            .and_then(|i| shared_strings.get(i))
            .cloned()
            .unwrap_or_default(),
        Some("b") => match raw {
            "1" => "TRUE".to_string(),
            "0" => "FALSE".to_string(),
            other => other.to_string(),
        },
        None | Some("n") => date
            .and_then(|(kind, date1904)| {
                let serial = raw.parse::<f64>().ok()?;
                format_serial_date(serial, kind, date1904)
            })
            .unwrap_or_else(|| raw.to_string()),
        _ => raw.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_letters_roundtrip_edges() {
        assert_eq!(column_letters(0), "A");
        assert_eq!(column_letters(25), "Z");
        assert_eq!(column_letters(26), "AA");
        assert_eq!(column_letters(701), "ZZ");
        assert_eq!(column_letters(702), "AAA");
        assert_eq!(column_index("A1"), Some(0));
        assert_eq!(column_index("ab12"), Some(27));
        assert_eq!(column_index("12"), None);
    }

    #[test]
    fn xls_is_detected_by_extension_or_signature() {
        assert_eq!(detect_format("survey.XLS", b"").unwrap(), Format::Xls);
        assert_eq!(detect_format("upload", CFB_MAGIC).unwrap(), Format::Xls);
    }

    #[test]
    fn truncated_xls_is_unsupported_format() {
        let err = load_bytes("survey.xls", b"\xD0\xCF\x11\xE0", &LoaderConfig::default())
            .unwrap_err();
        assert!(matches!(err, PipelineError::UnsupportedFormat(_)));
    }

    #[test]
    fn row_numbers_past_the_grid_are_unsupported_format() {
        for xml in [
            &br#"<worksheet><sheetData><row r="4294967295"><c r="A1"><v>1</v></c></row></sheetData></worksheet>"#[..],
            &br#"<worksheet><sheetData><row r="1048577"><c><v>1</v></c></row></sheetData></worksheet>"#[..],
            &br#"<worksheet><sheetData><row r="99999999999"/></sheetData></worksheet>"#[..],
            &br#"<worksheet><sheetData><row r="0"><c><v>1</v></c></row></sheetData></worksheet>"#[..],
            &br#"<worksheet><sheetData><row r="1"><c r="XFE1"><v>1</v></c></row></sheetData></worksheet>"#[..],
        ] {
            let err = parse_sheet_rows(xml, &[], &CellStyles::default(), 1000).unwrap_err();
            assert!(matches!(err, PipelineError::UnsupportedFormat(_)), "{:?}", err);
        }
    }

    #[test]
    fn last_row_and_column_of_the_grid_are_accepted() {
        let xml = br#"<worksheet><sheetData>
            <row r="1048576"><c r="XFD1048576"><v>1</v></c></row>
        </sheetData></worksheet>"#;
        let rows = parse_sheet_rows(xml, &[], &CellStyles::default(), 1000).unwrap();
        assert_eq!(rows[0].number, MAX_ROWS);
        assert_eq!(rows[0].cells[0].column, MAX_COLUMNS - 1);
    }

    #[test]
    fn date_styles_render_serials_as_dates() {
        let styles_xml = br#"<styleSheet>
            <numFmts count="1"><numFmt numFmtId="164" formatCode="dd/mm/yyyy\ hh:mm"/></numFmts>
            <cellStyleXfs count="1"><xf numFmtId="14"/></cellStyleXfs>
            <cellXfs count="4"><xf numFmtId="0"/><xf numFmtId="14" applyNumberFormat="1"/><xf numFmtId="164"/><xf numFmtId="2"/></cellXfs>
        </styleSheet>"#;
        let styles = CellStyles {
            date_kinds: parse_styles(styles_xml).unwrap(),
            date1904: false,
        };
        assert_eq!(
            styles.date_kinds,
            vec![None, Some(DateKind::Date), Some(DateKind::DateTime), None]
        );

        let xml = br#"<worksheet><sheetData>
            <row r="2"><c r="A2" s="1"><v>45123</v></c><c r="B2" s="2"><v>45123.5</v></c><c r="C2" s="3"><v>4.5</v></c><c r="D2"><v>45123</v></c></row>
        </sheetData></worksheet>"#;
        let rows = parse_sheet_rows(xml, &[], &styles, 1000).unwrap();
        let values: Vec<&str> = rows[0].cells.iter().map(|c| c.value.as_str()).collect();
        assert_eq!(values, vec!["2023-07-16", "2023-07-16 12:00:00", "4.5", "45123"]);
    }

    #[test]
    fn format_codes_are_classified() {
        assert_eq!(classify_format_code("yyyy-mm-dd"), Some(DateKind::Date));
        assert_eq!(classify_format_code("[h]:mm:ss"), Some(DateKind::Time));
        assert_eq!(classify_format_code("General"), None);
        assert_eq!(classify_format_code("0.00\" days\""), None);
        assert_eq!(classify_format_code("#,##0;[Red]-#,##0"), None);
    }

    #[test]
    fn serial_dates_cover_both_epochs() {
        assert_eq!(format_serial_date(1.0, DateKind::Date, false).as_deref(), Some("1900-01-01"));
        assert_eq!(format_serial_date(61.0, DateKind::Date, false).as_deref(), Some("1900-03-01"));
        assert_eq!(format_serial_date(0.0, DateKind::Date, true).as_deref(), Some("1904-01-01"));
        assert_eq!(format_serial_date(0.25, DateKind::Time, false).as_deref(), Some("06:00:00"));
        assert_eq!(format_serial_date(-1.0, DateKind::Date, false), None);
    }

    #[test]
    fn zip_content_without_extension_is_sniffed() {
        assert_eq!(detect_format("upload", b"PK\x03\x04rest").unwrap(), Format::Xlsx);
        assert!(detect_format("notes.txt", b"hello").is_err());
    }

    #[test]
    fn parses_shared_inline_numeric_and_bool_cells() {
        let shared = vec!["Brand".to_string(), "Acme".to_string()];
        let xml = br#"<worksheet><sheetData>
            <row r="1"><c r="A1" t="s"><v>0</v></c><c r="C1" t="inlineStr"><is><t>Score</t></is></c></row>
            <row r="3"><c r="A3" t="s"><v>1</v></c><c r="B3" t="b"><v>1</v></c><c r="C3"><f>1+1</f><v>4.5</v></c><c r="D3"/></row>
        </sheetData></worksheet>"#;
        let rows = parse_sheet_rows(xml, &shared, &CellStyles::default(), 1000).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].number, 1);
        assert_eq!(rows[0].cells[1].column, 2);
        assert_eq!(rows[0].cells[1].value, "Score");
        assert_eq!(rows[1].number, 3);
        let values: Vec<&str> = rows[1].cells.iter().map(|c| c.value.as_str()).collect();
        assert_eq!(values, vec!["Acme", "TRUE", "4.5"]);
    }

    #[test]
    fn cell_limit_stops_parsing() {
        let xml = br#"<worksheet><sheetData>
            <row r="1"><c><v>1</v></c><c><v>2</v></c><c><v>3</v></c></row>
        </sheetData></worksheet>"#;
        let rows = parse_sheet_rows(xml, &[], &CellStyles::default(), 2).unwrap();
        assert_eq!(rows[0].cells.len(), 2);
    }

    #[test]
    fn rows_mode_labels_cells_by_header() {
        let sheet = Sheet {
            name: "Responses".into(),
            rows: vec![
                SheetRow {
                    number: 1,
                    cells: vec![
                        Cell { column: 0, value: "Product".into() },
                        Cell { column: 1, value: "Product Link".into() },
                    ],
                },
                SheetRow {
                    number: 2,
                    cells: vec![
                        Cell { column: 0, value: "Eco Bottle".into() },
                        Cell { column: 1, value: "http://example.com/x".into() },
                        Cell { column: 3, value: "extra".into() },
                    ],
                },
            ],
        };
        let chunks = row_chunks("survey.xlsx", &sheet);
        assert_eq!(chunks.len(), 1);
        assert_eq!(
            chunks[0].text,
            "Product: Eco Bottle\nProduct Link: http://example.com/x\nD: extra"
        );
        assert_eq!(chunks[0].provenance["row"], "2");
        assert_eq!(chunks[0].provenance["cells"], "A2:D2");
        assert_eq!(chunks[0].provenance["element"], "row");
    }

    #[test]
    fn header_only_sheet_has_no_chunks() {
        let sheet = Sheet {
            name: "Empty".into(),
            rows: vec![SheetRow {
                number: 1,
                cells: vec![Cell { column: 0, value: "Question".into() }],
            }],
        };
        assert!(row_chunks("s.xlsx", &sheet).is_empty());
        assert!(sheet_chunk("s.xlsx", &sheet).is_some());
    }

    #[test]
    fn csv_is_loaded_as_single_sheet() {
        let csv = b"Product,Product Link\nEco Bottle,http://example.com/x\n,\nRefill Pack,http://example.com/y\n";
        let chunks = load_bytes("answers.csv", csv, &LoaderConfig::default()).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].provenance["sheet"], "answers");
        assert_eq!(chunks[1].provenance["row"], "4");
        assert!(chunks[1].text.contains("Product Link: http://example.com/y"));
    }
}
