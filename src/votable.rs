//! VOTable inspection
//!
//! Only the shape of the first TABLE is extracted: its FIELD count and the
//! number of rows, whether serialised as TABLEDATA or as a base64
//! BINARY/BINARY2 stream.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::error::{ProbeError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoTableSummary {
    pub num_rows: u64,
    pub num_columns: u64,
}

pub fn inspect_file(path: &Path) -> Result<VoTableSummary> {
    let file = File::open(path)?;
    if file.metadata()?.len() == 0 {
        return Err(ProbeError::ResultParse(format!(
            "{} is empty",
            path.display()
        )));
    }
    inspect(Reader::from_reader(BufReader::new(file)))
}

pub fn inspect_bytes(data: &[u8]) -> Result<VoTableSummary> {
    if data.is_empty() {
        return Err(ProbeError::ResultParse("empty document".into()));
    }
    inspect(Reader::from_reader(data))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Encoding {
    Binary,
    Binary2,
}

/// Column layout needed to walk binary rows
#[derive(Debug, Clone, PartialEq)]
struct FieldLayout {
    datatype: String,
    arraysize: Option<String>,
}

#[derive(Default)]
struct TableScan {
    in_table: bool,
    fields: Vec<FieldLayout>,
    rows: u64,
    encoding: Option<Encoding>,
    stream: Option<StreamDecoder>,
}

fn inspect<R: BufRead>(mut reader: Reader<R>) -> Result<VoTableSummary> {
    reader.trim_text(true);

    let mut buf = Vec::new();
    let mut scan = TableScan::default();
    let mut saw_root = false;

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => {
                if let Some(summary) = scan.visit(&e, false, &mut saw_root)? {
                    return Ok(summary);
                }
            }
            Event::Empty(e) => {
                if let Some(summary) = scan.visit(&e, true, &mut saw_root)? {
                    return Ok(summary);
                }
            }
            Event::Text(t) => {
                if let Some(stream) = scan.stream.as_mut() {
                    stream.feed_text(&t.unescape()?)?;
                }
            }
            Event::End(e) => {
                if let Some(summary) = scan.close(e.local_name().as_ref())? {
                    return Ok(summary);
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if !saw_root {
        return Err(ProbeError::ResultParse("no VOTABLE element found".into()));
    }
    Err(ProbeError::ResultParse("no TABLE found in VOTable".into()))
}

impl TableScan {
    fn visit(&mut self, e: &BytesStart<'_>, empty: bool, saw_root: &mut bool) -> Result<Option<VoTableSummary>> {
        let name = e.local_name();
        let name = name.as_ref();
        if !*saw_root {
            if name != b"VOTABLE" {
                return Err(ProbeError::ResultParse(format!(
                    "root element is {}, not VOTABLE",
                    String::from_utf8_lossy(name)
                )));
            }
            *saw_root = true;
        }
        self.open(name, e, empty)
    }

    fn open(&mut self, name: &[u8], e: &BytesStart<'_>, empty: bool) -> Result<Option<VoTableSummary>> {
        match name {
            b"TABLE" => {
                self.in_table = true;
                if empty {
                    return Ok(Some(self.summary()));
                }
            }
            b"FIELD" if self.in_table => {
                let datatype = attribute(e, b"datatype")?.unwrap_or_else(|| "char".into());
                let arraysize = attribute(e, b"arraysize")?;
                self.fields.push(FieldLayout { datatype, arraysize });
            }
            b"TR" if self.in_table => self.rows += 1,
            b"BINARY" if self.in_table => self.encoding = Some(Encoding::Binary),
            b"BINARY2" if self.in_table => self.encoding = Some(Encoding::Binary2),
            b"FITS" if self.in_table => {
                return Err(ProbeError::ResultParse(
                    "FITS serialisation is not supported".into(),
                ))
            }
            b"STREAM" => {
                if let Some(encoding) = self.encoding {
                    if attribute(e, b"href")?.is_some() {
                        return Err(ProbeError::ResultParse(
                            "external STREAM references are not supported".into(),
                        ));
                    }
                    if !empty {
                        let rows = RowCounter::new(&self.fields, encoding == Encoding::Binary2)?;
                        self.stream = Some(StreamDecoder::new(rows));
                    }
                }
            }
            _ => {}
        }
        Ok(None)
    }

    fn close(&mut self, name: &[u8]) -> Result<Option<VoTableSummary>> {
        match name {
            b"STREAM" => {
                if let Some(stream) = self.stream.take() {
                    self.rows += stream.finish()?;
                }
            }
            b"TABLE" if self.in_table => return Ok(Some(self.summary())),
            _ => {}
        }
        Ok(None)
    }

    fn summary(&self) -> VoTableSummary {
        VoTableSummary {
            num_rows: self.rows,
            num_columns: self.fields.len() as u64,
        }
    }
}

fn attribute(e: &BytesStart<'_>, key: &[u8]) -> Result<Option<String>> {
    for attr in e.attributes() {
        let attr = attr?;
        if attr.key.local_name().as_ref() == key {
            return Ok(Some(attr.unescape_value()?.into_owned()));
        }
    }
    Ok(None)
}

/// Decodes base64 STREAM text as it arrives, handing whole quanta to the row counter
struct StreamDecoder {
    pending: Vec<u8>,
    rows: RowCounter,
}

impl StreamDecoder {
    fn new(rows: RowCounter) -> Self {
        Self {
            pending: Vec::with_capacity(4),
            rows,
        }
    }

    fn feed_text(&mut self, text: &str) -> Result<()> {
        self.pending
            .extend(text.bytes().filter(|b| !b.is_ascii_whitespace()));
        let whole = self.pending.len() - self.pending.len() % 4;
        if whole == 0 {
            return Ok(());
        }
        let decoded = decode_base64(&self.pending[..whole])?;
        self.pending.drain(..whole);
        self.rows.feed(&decoded)
    }

    fn finish(mut self) -> Result<u64> {
        if !self.pending.is_empty() {
            let decoded = decode_base64(&self.pending)?;
            self.rows.feed(&decoded)?;
        }
        self.rows.finish()
    }
}

fn decode_base64(quanta: &[u8]) -> Result<Vec<u8>> {
    STANDARD
        .decode(quanta)
        .map_err(|e| ProbeError::ResultParse(format!("bad base64 stream: {}", e)))
}

/// Bytes per element for a VOTable primitive; `bit` is handled separately
fn element_size(datatype: &str) -> Result<usize> {
    Ok(match datatype {
        "boolean" | "unsignedByte" | "char" => 1,
        "short" | "unicodeChar" => 2,
        "int" | "float" => 4,
        "long" | "double" | "floatComplex" => 8,
        "doubleComplex" => 16,
        "bit" => 0,
        other => {
            return Err(ProbeError::ResultParse(format!(
                "unknown datatype {}",
                other
            )))
        }
    })
}

/// Fixed element count, or `None` for variable-length arrays
fn fixed_count(arraysize: Option<&str>) -> Result<Option<usize>> {
    let Some(size) = arraysize else {
        return Ok(Some(1));
    };
    if size.ends_with('*') {
        return Ok(None);
    }
    let mut count = 1usize;
    for dim in size.split('x') {
        let dim: usize = dim.trim().parse().map_err(|_| {
            ProbeError::ResultParse(format!("bad arraysize {}", size))
        })?;
        count = count
            .checked_mul(dim)
            .ok_or_else(|| ProbeError::ResultParse(format!("arraysize {} is too large", size)))?;
    }
    Ok(Some(count))
}

#[derive(Debug, Clone, Copy)]
struct ColumnLayout {
    element_size: usize,
    is_bit: bool,
    fixed: Option<usize>,
}

impl ColumnLayout {
    fn byte_len(&self, count: usize) -> Result<usize> {
        if self.is_bit {
            return Ok(count.div_ceil(8));
        }
        count
            .checked_mul(self.element_size)
            .ok_or_else(|| ProbeError::ResultParse(format!("{} elements is too large", count)))
    }
}

/// Counts BINARY/BINARY2 rows over decoded bytes fed in arbitrary chunks
struct RowCounter {
    columns: Vec<ColumnLayout>,
    mask_len: usize,
    /// Next column to start; `None` between rows
    column: Option<usize>,
    /// Bytes of the current item still to skip
    skip: usize,
    /// Length prefix of a variable-length column being collected
    prefix: Option<Vec<u8>>,
    rows: u64,
}

impl RowCounter {
    fn new(fields: &[FieldLayout], binary2: bool) -> Result<Self> {
        let columns = fields
            .iter()
            .map(|f| {
                let element_size = element_size(&f.datatype)?;
                let is_bit = f.datatype == "bit";
                let mut layout = ColumnLayout {
                    element_size,
                    is_bit,
                    fixed: None,
                };
                if let Some(count) = fixed_count(f.arraysize.as_deref())? {
                    layout.fixed = Some(layout.byte_len(count)?);
                }
                Ok(layout)
            })
            .collect::<Result<Vec<_>>>()?;
        let mask_len = if binary2 { fields.len().div_ceil(8) } else { 0 };
        Ok(Self {
            columns,
            mask_len,
            column: None,
            skip: 0,
            prefix: None,
            rows: 0,
        })
    }

    /// Smallest number of bytes a row can occupy
    fn min_row_len(&self) -> usize {
        self.columns
            .iter()
            .map(|c| c.fixed.unwrap_or(4))
            .fold(self.mask_len, usize::saturating_add)
    }

    fn feed(&mut self, mut data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        if self.columns.is_empty() {
            return Err(ProbeError::ResultParse("binary data without FIELDs".into()));
        }
        if self.min_row_len() == 0 {
            return Err(ProbeError::ResultParse("zero-width binary row".into()));
        }

        while !data.is_empty() {
            if self.skip > 0 {
                let n = self.skip.min(data.len());
                self.skip -= n;
                data = &data[n..];
            } else if let Some(prefix) = self.prefix.as_mut() {
                let n = (4 - prefix.len()).min(data.len());
                prefix.extend_from_slice(&data[..n]);
                data = &data[n..];
                if prefix.len() == 4 {
                    let count = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]);
                    self.prefix = None;
                    let index = self.column.unwrap_or_default();
                    self.skip = self.columns[index].byte_len(count as usize)?;
                    self.column = Some(index + 1);
                }
            } else {
                self.advance();
            }
        }
        Ok(())
    }

    /// Move to the next item of the row layout
    fn advance(&mut self) {
        match self.column {
            None => {
                self.column = Some(0);
                self.skip = self.mask_len;
            }
            Some(i) if i == self.columns.len() => {
                self.rows += 1;
                self.column = None;
            }
            Some(i) => match self.columns[i].fixed {
                Some(len) => {
                    self.skip = len;
                    self.column = Some(i + 1);
                }
                None => self.prefix = Some(Vec::with_capacity(4)),
            },
        }
    }

    fn finish(mut self) -> Result<u64> {
        if self.skip > 0 || self.prefix.is_some() {
            return Err(ProbeError::ResultParse("truncated binary stream".into()));
        }
        // Trailing zero-length columns close the last row
        while let Some(i) = self.column {
            if i == self.columns.len() {
                self.rows += 1;
                break;
            }
            if self.columns[i].fixed != Some(0) {
                return Err(ProbeError::ResultParse("truncated binary stream".into()));
            }
            self.column = Some(i + 1);
        }
        Ok(self.rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::testing::SMALL_VOTABLE;
    use std::io::Write;

    fn binary_votable(tag: &str, fields: &str, payload: &[u8]) -> String {
        format!(
            r#"<?xml version="1.0"?>
<VOTABLE version="1.4"><RESOURCE><TABLE>{}
<DATA><{tag}><STREAM encoding="base64">{}</STREAM></{tag}></DATA>
</TABLE></RESOURCE></VOTABLE>"#,
            fields,
            STANDARD.encode(payload),
            tag = tag
        )
    }

    #[test]
    fn test_tabledata() {
        let summary = inspect_bytes(SMALL_VOTABLE.as_bytes()).unwrap();
        assert_eq!(summary, VoTableSummary { num_rows: 2, num_columns: 3 });
    }

    #[test]
    fn test_table_without_data() {
        let xml = r#"<VOTABLE><RESOURCE><TABLE><FIELD name="a" datatype="int"/></TABLE></RESOURCE></VOTABLE>"#;
        let summary = inspect_bytes(xml.as_bytes()).unwrap();
        assert_eq!(summary, VoTableSummary { num_rows: 0, num_columns: 1 });
    }

    #[test]
    fn test_binary_rows() {
        // int + variable-length char
        let fields = r#"<FIELD name="id" datatype="int"/><FIELD name="name" datatype="char" arraysize="*"/>"#;
        let mut payload = Vec::new();
        for (id, name) in [(1i32, "ab"), (2, "cde"), (3, "")] {
            payload.extend_from_slice(&id.to_be_bytes());
            payload.extend_from_slice(&(name.len() as u32).to_be_bytes());
            payload.extend_from_slice(name.as_bytes());
        }
        let xml = binary_votable("BINARY", fields, &payload);
        let summary = inspect_bytes(xml.as_bytes()).unwrap();
        assert_eq!(summary, VoTableSummary { num_rows: 3, num_columns: 2 });

        payload.pop();
        let xml = binary_votable("BINARY", fields, &payload);
        assert!(inspect_bytes(xml.as_bytes()).is_err());
    }

    #[test]
    fn test_binary2_null_mask() {
        let fields = r#"<FIELD name="ra" datatype="double"/><FIELD name="flags" datatype="bit" arraysize="10"/>"#;
        let mut payload = Vec::new();
        for ra in [10.5f64, 20.25] {
            payload.push(0u8);
            payload.extend_from_slice(&ra.to_be_bytes());
            payload.extend_from_slice(&[0u8, 0u8]);
        }
        let xml = binary_votable("BINARY2", fields, &payload);
        let summary = inspect_bytes(xml.as_bytes()).unwrap();
        assert_eq!(summary, VoTableSummary { num_rows: 2, num_columns: 2 });
    }

    fn assert_unreadable(fields: &str, payload: &[u8]) {
        let xml = binary_votable("BINARY", fields, payload);
        match inspect_bytes(xml.as_bytes()) {
            Err(ProbeError::ResultParse(_)) => {}
            other => panic!("expected a parse error, got {:?}", other),
        }
    }

    #[test]
    fn test_zero_width_rows_rejected() {
        assert_unreadable(r#"<FIELD name="a" datatype="int" arraysize="0"/>"#, &[0, 0, 0, 1]);
        assert_unreadable(
            r#"<FIELD name="f" datatype="bit" arraysize="0"/><FIELD name="c" datatype="char" arraysize="0x3"/>"#,
            &[0xff],
        );
    }

    #[test]
    fn test_oversized_arraysize_rejected() {
        assert_unreadable(
            r#"<FIELD name="a" datatype="double" arraysize="4294967296x4294967296"/>"#,
            &[0; 8],
        );
        assert_unreadable(
            r#"<FIELD name="a" datatype="doubleComplex" arraysize="1152921504606846976"/>"#,
            &[0; 16],
        );
    }

    #[test]
    fn test_variable_length_past_end_rejected() {
        let fields = r#"<FIELD name="id" datatype="short"/><FIELD name="name" datatype="char" arraysize="*"/>"#;
        let mut payload = vec![0, 7];
        payload.extend_from_slice(&100u32.to_be_bytes());
        payload.extend_from_slice(b"abc");
        assert_unreadable(fields, &payload);

        // Length prefix itself cut short
        assert_unreadable(fields, &[0, 7, 0, 0]);
    }

    #[test]
    fn test_bit_arrays() {
        let fields = r#"<FIELD name="id" datatype="unsignedByte"/><FIELD name="flags" datatype="bit" arraysize="*"/>"#;
        let mut payload = Vec::new();
        for bits in [12u32, 3, 0] {
            payload.push(1u8);
            payload.extend_from_slice(&bits.to_be_bytes());
            payload.extend(std::iter::repeat(0u8).take(bits.div_ceil(8) as usize));
        }
        let xml = binary_votable("BINARY", fields, &payload);
        let summary = inspect_bytes(xml.as_bytes()).unwrap();
        assert_eq!(summary, VoTableSummary { num_rows: 3, num_columns: 2 });

        // 12 bits need two bytes
        let mut short = vec![1u8];
        short.extend_from_slice(&12u32.to_be_bytes());
        short.push(0);
        assert_unreadable(fields, &short);
    }

    #[test]
    fn test_stream_text_split_anywhere() {
        let fields = vec![FieldLayout {
            datatype: "int".into(),
            arraysize: None,
        }];
        let payload: Vec<u8> = (0..40u8).collect();
        let text = STANDARD.encode(&payload);
        let (head, tail) = text.split_at(7);

        let mut stream = StreamDecoder::new(RowCounter::new(&fields, false).unwrap());
        stream.feed_text(head).unwrap();
        stream.feed_text("\n  ").unwrap();
        for chunk in tail.as_bytes().chunks(5) {
            stream.feed_text(std::str::from_utf8(chunk).unwrap()).unwrap();
        }
        assert_eq!(stream.finish().unwrap(), 10);

        let mut broken = StreamDecoder::new(RowCounter::new(&fields, false).unwrap());
        broken.feed_text("AAAAA").unwrap();
        assert!(matches!(broken.finish(), Err(ProbeError::ResultParse(_))));
    }

    #[test]
    fn test_rejects_non_votables() {
        assert!(inspect_bytes(b"").is_err());
        assert!(inspect_bytes(b"<html><body>Service unavailable</body></html>").is_err());
        assert!(inspect_bytes(b"<VOTABLE><RESOURCE/></VOTABLE>").is_err());
        assert!(inspect_bytes(b"<VOTABLE><RESOURCE><TABLE><DATA><FITS/></DATA></TABLE></RESOURCE></VOTABLE>").is_err());
        assert!(inspect_bytes(b"<VOTABLE><RESOURCE><TABLE><FIELD></RESOURCE>").is_err());
    }

    #[test]
    fn test_inspect_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("result.xml");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(SMALL_VOTABLE.as_bytes())
            .unwrap();
        assert_eq!(inspect_file(&path).unwrap().num_rows, 2);

        let empty = dir.path().join("empty.xml");
        std::fs::File::create(&empty).unwrap();
        assert!(matches!(inspect_file(&empty), Err(ProbeError::ResultParse(_))));
    }
}
