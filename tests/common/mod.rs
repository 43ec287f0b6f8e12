//! Shared fixtures and backend doubles for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use survey_qa::embedding::{normalize, Embedder};
use survey_qa::error::{PipelineError, Result};
use survey_qa::llm::LanguageModel;
use survey_qa::models::REFUSAL;
use survey_qa::pipeline::Pipeline;

// ============ XLSX fixtures ============

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn column(index: usize) -> String {
    let mut out = Vec::new();
    let mut i = index;
    loop {
        out.push(b'A' + (i % 26) as u8);
        if i < 26 {
            break;
        }
        i = i / 26 - 1;
    }
    out.reverse();
    String::from_utf8(out).unwrap()
}

fn sheet_xml(rows: &[Vec<&str>]) -> String {
    let mut xml = String::from(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><sheetData>"#,
    );
    for (r, row) in rows.iter().enumerate() {
        xml.push_str(&format!(r#"<row r="{}">"#, r + 1));
        for (c, value) in row.iter().enumerate() {
            if value.is_empty() {
                continue;
            }
            xml.push_str(&format!(
                r#"<c r="{}{}" t="inlineStr"><is><t>{}</t></is></c>"#,
                column(c),
                r + 1,
                escape(value)
            ));
        }
        xml.push_str("</row>");
    }
    xml.push_str("</sheetData></worksheet>");
    xml
}

/// Build an in-memory `.xlsx` with the given named sheets of inline-string cells.
pub fn xlsx(sheets: &[(&str, Vec<Vec<&str>>)]) -> Vec<u8> {
    xlsx_with_extra(sheets, &[])
}

/// Like [`xlsx`], plus arbitrary extra archive entries (e.g. images).
pub fn xlsx_with_extra(sheets: &[(&str, Vec<Vec<&str>>)], extra: &[(&str, &[u8])]) -> Vec<u8> {
    let mut buf = Vec::new();
    {
        let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
        let opts = zip::write::SimpleFileOptions::default();

        zip.start_file("[Content_Types].xml", opts).unwrap();
        zip.write_all(
            br#"<?xml version="1.0" encoding="UTF-8"?><Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"/>"#,
        )
        .unwrap();

        let mut workbook = String::from(
            r#"<?xml version="1.0" encoding="UTF-8"?><workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><sheets>"#,
        );
        let mut rels = String::from(
            r#"<?xml version="1.0" encoding="UTF-8"?><Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">"#,
        );
        for (i, (name, _)) in sheets.iter().enumerate() {
            workbook.push_str(&format!(
                r#"<sheet name="{}" sheetId="{}" r:id="rId{}"/>"#,
                escape(name),
                i + 1,
                i + 1
            ));
            rels.push_str(&format!(
                r#"<Relationship Id="rId{}" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet{}.xml"/>"#,
                i + 1,
                i + 1
            ));
        }
        workbook.push_str("</sheets></workbook>");
        rels.push_str("</Relationships>");

        zip.start_file("xl/workbook.xml", opts).unwrap();
        zip.write_all(workbook.as_bytes()).unwrap();
        zip.start_file("xl/_rels/workbook.xml.rels", opts).unwrap();
        zip.write_all(rels.as_bytes()).unwrap();

        for (i, (_, rows)) in sheets.iter().enumerate() {
            zip.start_file(format!("xl/worksheets/sheet{}.xml", i + 1), opts)
                .unwrap();
            zip.write_all(sheet_xml(rows).as_bytes()).unwrap();
        }
        for (path, bytes) in extra {
            zip.start_file(*path, opts).unwrap();
            zip.write_all(bytes).unwrap();
        }
        zip.finish().unwrap();
    }
    buf
}

/// Zip archive from raw `(path, content)` parts, for workbooks shaped the way
/// Excel writes them (shared strings, styles, absolute relationship targets).
pub fn zip_parts(parts: &[(&str, &str)]) -> Vec<u8> {
    let mut buf = Vec::new();
    {
        let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
        let opts = zip::write::SimpleFileOptions::default();
        for (path, content) in parts {
            zip.start_file(*path, opts).unwrap();
            zip.write_all(content.as_bytes()).unwrap();
        }
        zip.finish().unwrap();
    }
    buf
}

// ============ XLS (BIFF8) fixtures ============

fn biff_record(out: &mut Vec<u8>, kind: u16, data: &[u8]) {
    out.extend_from_slice(&kind.to_le_bytes());
    out.extend_from_slice(&(data.len() as u16).to_le_bytes());
    out.extend_from_slice(data);
}

/// BOF record body; `dt` is 0x0005 for the workbook globals, 0x0010 for a worksheet.
fn biff_bof(dt: u16) -> Vec<u8> {
    let mut d = Vec::new();
    d.extend_from_slice(&0x0600u16.to_le_bytes());
    d.extend_from_slice(&dt.to_le_bytes());
    d.extend_from_slice(&0x0DBBu16.to_le_bytes());
    d.extend_from_slice(&0x07CCu16.to_le_bytes());
    d.extend_from_slice(&0u32.to_le_bytes());
    d.extend_from_slice(&0x0006u32.to_le_bytes());
    d
}

/// Build an in-memory legacy `.xls`. Cells that parse as numbers are written
/// as NUMBER records, everything else through the shared string table.
/// Text must be ASCII.
pub fn xls(sheets: &[(&str, Vec<Vec<&str>>)]) -> Vec<u8> {
    let mut strings: Vec<&str> = Vec::new();
    for (_, rows) in sheets {
        for value in rows.iter().flatten() {
            if !value.is_empty() && value.parse::<f64>().is_err() && !strings.contains(value) {
                strings.push(*value);
            }
        }
    }

    let mut stream = Vec::new();
    biff_record(&mut stream, 0x0809, &biff_bof(0x0005));
    biff_record(&mut stream, 0x0042, &1200u16.to_le_bytes());

    let mut position_slots = Vec::new();
    for (name, _) in sheets {
        let mut d = vec![0u8; 4];
        d.extend_from_slice(&[0, 0, name.len() as u8, 0]);
        d.extend_from_slice(name.as_bytes());
        position_slots.push(stream.len() + 4);
        biff_record(&mut stream, 0x0085, &d);
    }

    let mut sst = Vec::new();
    sst.extend_from_slice(&(strings.len() as u32).to_le_bytes());
    sst.extend_from_slice(&(strings.len() as u32).to_le_bytes());
    for s in &strings {
        sst.extend_from_slice(&(s.len() as u16).to_le_bytes());
        sst.push(0);
        sst.extend_from_slice(s.as_bytes());
    }
    biff_record(&mut stream, 0x00FC, &sst);
    biff_record(&mut stream, 0x000A, &[]);

    for ((_, rows), slot) in sheets.iter().zip(position_slots) {
        let offset = stream.len() as u32;
        stream[slot..slot + 4].copy_from_slice(&offset.to_le_bytes());

        biff_record(&mut stream, 0x0809, &biff_bof(0x0010));
        for (r, row) in rows.iter().enumerate() {
            for (c, value) in row.iter().enumerate() {
                if value.is_empty() {
                    continue;
                }
                let mut d = Vec::new();
                d.extend_from_slice(&(r as u16).to_le_bytes());
                d.extend_from_slice(&(c as u16).to_le_bytes());
                d.extend_from_slice(&0u16.to_le_bytes());
                match value.parse::<f64>() {
                    Ok(number) => {
                        d.extend_from_slice(&number.to_le_bytes());
                        biff_record(&mut stream, 0x0203, &d);
                    }
                    Err(_) => {
                        let index = strings.iter().position(|s| s == value).unwrap() as u32;
                        d.extend_from_slice(&index.to_le_bytes());
                        biff_record(&mut stream, 0x00FD, &d);
                    }
                }
            }
        }
        biff_record(&mut stream, 0x000A, &[]);
    }
    // Keep the stream out of the compound file's mini-stream.
    stream.resize(stream.len().max(8192), 0);

    let mut file =
        cfb::CompoundFile::create_with_version(cfb::Version::V3, std::io::Cursor::new(Vec::new()))
            .unwrap();
    {
        let mut workbook = file.create_stream("/Workbook").unwrap();
        workbook.write_all(&stream).unwrap();
        workbook.flush().unwrap();
    }
    file.flush().unwrap();
    file.into_inner().into_inner()
}

/// Survey with a product-link column; only Acme's packaging is compostable.
pub fn product_survey() -> Vec<u8> {
    xlsx(&[(
        "Responses",
        vec![
            vec!["Brand", "Packaging", "Product Link"],
            vec!["Acme Refill", "Fully compostable packaging", "http://example.com/x"],
            vec!["Globex", "Plastic blister pack", "http://example.com/y"],
        ],
    )])
}

// ============ Embedder doubles ============

/// Bag-of-words embedder: each distinct lowercase word gets its own dimension.
///
/// Vectors are stable for the lifetime of one instance.
pub struct KeywordEmbedder {
    dims: usize,
    vocab: Mutex<HashMap<String, usize>>,
}

impl KeywordEmbedder {
    pub fn new() -> Self {
        Self {
            dims: 512,
            vocab: Mutex::new(HashMap::new()),
        }
    }

    fn vector(&self, text: &str) -> Result<Vec<f32>> {
        let mut vocab = self.vocab.lock().unwrap();
        // Last dimension is a constant bias so empty text still has a direction.
        let mut v = vec![0.0f32; self.dims];
        v[self.dims - 1] = 0.01;
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let next = vocab.len();
            let slot = *vocab.entry(word.to_lowercase()).or_insert(next);
            v[slot % (self.dims - 1)] += 1.0;
        }
        normalize(v)
    }
}

impl Default for KeywordEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Embedder for KeywordEmbedder {
    fn model_name(&self) -> &str {
        "keyword-test"
    }

    fn dims(&self) -> Option<usize> {
        Some(self.dims)
    }

    async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.vector(t)).collect()
    }
}

/// Embedder that always fails.
pub struct FailingEmbedder;

#[async_trait]
impl Embedder for FailingEmbedder {
    fn model_name(&self) -> &str {
        "failing"
    }

    fn dims(&self) -> Option<usize> {
        None
    }

    async fn embed_many(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Err(PipelineError::Embedding("backend unavailable".into()))
    }
}

/// Embedder that drops the last vector of every batch.
pub struct ShortEmbedder;

#[async_trait]
impl Embedder for ShortEmbedder {
    fn model_name(&self) -> &str {
        "short"
    }

    fn dims(&self) -> Option<usize> {
        Some(2)
    }

    async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().skip(1).map(|_| vec![1.0, 0.0]).collect())
    }
}

// ============ Language model doubles ============

/// Answers from the evidence block that mentions `keyword`, citing its
/// product link in a deliberately long answer. Refuses when none matches.
pub struct ScriptedLlm {
    keyword: String,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedLlm {
    pub fn new(keyword: &str) -> Self {
        Self {
            keyword: keyword.to_string(),
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_prompt(&self) -> Option<String> {
        self.prompts.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl LanguageModel for ScriptedLlm {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(prompt.to_string());

        let link = prompt
            .split("\n\n")
            .filter(|block| block.contains(&self.keyword))
            .flat_map(|block| block.lines())
            .find_map(|line| line.strip_prefix("Product Link: "));

        Ok(match link {
            Some(link) => format!(
                "The best option is Acme Refill. Its packaging is fully compostable. \
                 Respondents rated it highest. It is sold in the UK. Prices are 4.5 GBP. \
                 It also ships without plastic. You can buy it at {}.",
                link
            ),
            None => REFUSAL.to_string(),
        })
    }
}

/// Language model that always fails.
pub struct FailingLlm;

#[async_trait]
impl LanguageModel for FailingLlm {
    fn model_name(&self) -> &str {
        "failing"
    }

    async fn generate(&self, _prompt: &str) -> Result<String> {
        Err(PipelineError::Generation("connection refused".into()))
    }
}

/// Language model that never answers within a test's stage timeout.
pub struct SlowLlm;

#[async_trait]
impl LanguageModel for SlowLlm {
    fn model_name(&self) -> &str {
        "slow"
    }

    async fn generate(&self, _prompt: &str) -> Result<String> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok("too late".into())
    }
}

pub fn pipeline_with(llm: Arc<dyn LanguageModel>) -> Pipeline {
    Pipeline::new(Arc::new(KeywordEmbedder::new()), llm)
}
