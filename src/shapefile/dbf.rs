//! Streaming reader for the dBase `.dbf` attribute table.

use anyhow::{Context, Result, ensure};
use byteorder::{LittleEndian, ReadBytesExt};
use serde_json::{Number, Value};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use crate::geojson::Properties;

const DESCRIPTOR_LEN: usize = 32;
const HEADER_TERMINATOR: u8 = 0x0D;

/// Text encoding of character fields, normally named by a `.cpg` file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    Utf8,
    Latin1,
    /// UTF-8 where valid, Latin-1 otherwise.
    #[default]
    Auto,
}

impl Encoding {
    /// Interpret the content of a `.cpg` file.
    pub fn from_cpg(text: &str) -> Self {
        let label = text.trim().to_ascii_uppercase().replace(['-', '_', ' '], "");
        match label.as_str() {
            "UTF8" | "65001" => Encoding::Utf8,
            "ISO88591" | "LATIN1" | "88591" | "1252" | "CP1252" | "WINDOWS1252" | "ANSI1252" => Encoding::Latin1,
            _ => Encoding::Auto,
        }
    }

    fn decode(self, bytes: &[u8]) -> String {
        match self {
            Encoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            Encoding::Latin1 => bytes.iter().map(|&b| b as char).collect(),
            Encoding::Auto => match std::str::from_utf8(bytes) {
                Ok(s) => s.to_string(),
                Err(_) => Encoding::Latin1.decode(bytes),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub name: String,
    pub kind: u8,
    pub length: usize,
    pub decimals: u8,
}

pub struct DbfReader<R: Read> {
    reader: R,
    fields: Vec<FieldDescriptor>,
    record_len: usize,
    remaining: u32,
    encoding: Encoding,
}

impl DbfReader<BufReader<File>> {
    pub fn open(path: &Path, encoding: Encoding) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
        Self::new(BufReader::new(file), encoding).with_context(|| format!("reading {}", path.display()))
    }
}

impl<R: Read> DbfReader<R> {
    pub fn new(mut reader: R, encoding: Encoding) -> Result<Self> {
        let mut prefix = [0u8; 4];
        reader.read_exact(&mut prefix)?;
        let num_records = reader.read_u32::<LittleEndian>()?;
        let header_len = reader.read_u16::<LittleEndian>()? as usize;
        let record_len = reader.read_u16::<LittleEndian>()? as usize;
        let mut reserved = [0u8; 20];
        reader.read_exact(&mut reserved)?;
        ensure!(header_len > DESCRIPTOR_LEN, "invalid .dbf header length {header_len}");

        let mut fields = Vec::new();
        let mut consumed = DESCRIPTOR_LEN;
        loop {
            let marker = reader.read_u8()?;
            consumed += 1;
            if marker == HEADER_TERMINATOR {
                break;
            }
            ensure!(consumed + DESCRIPTOR_LEN - 1 <= header_len, "field descriptors overrun the header");
            let mut descriptor = [0u8; DESCRIPTOR_LEN];
            descriptor[0] = marker;
            reader.read_exact(&mut descriptor[1..])?;
            consumed += DESCRIPTOR_LEN - 1;
            fields.push(parse_descriptor(&descriptor, encoding));
        }
        ensure!(consumed <= header_len, "field descriptors overrun the header");
        std::io::copy(&mut (&mut reader).take((header_len - consumed) as u64), &mut std::io::sink())?;

        let data_len: usize = fields.iter().map(|f| f.length).sum();
        ensure!(
            record_len == data_len + 1,
            "record length {record_len} does not match field widths {data_len}"
        );

        Ok(Self {
            reader,
            fields,
            record_len,
            remaining: num_records,
            encoding,
        })
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    /// Read the next record's attributes. Deleted records are returned like
    /// any other, keeping the table aligned with the geometry records.
    pub fn next_record(&mut self) -> Result<Option<Properties>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        let mut record = vec![0u8; self.record_len];
        match self.reader.read_exact(&mut record) {
            Ok(()) => {}
            // Some writers stop early; a missing tail is treated as the end.
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        self.remaining -= 1;

        let mut properties = Properties::new();
        let mut offset = 1;
        for field in &self.fields {
            let raw = &record[offset..offset + field.length];
            offset += field.length;
            properties.insert(field.name.clone(), field_value(field, raw, self.encoding));
        }
        Ok(Some(properties))
    }
}

fn parse_descriptor(descriptor: &[u8; DESCRIPTOR_LEN], encoding: Encoding) -> FieldDescriptor {
    let name_bytes = &descriptor[..11];
    let name_end = name_bytes.iter().position(|&b| b == 0).unwrap_or(name_bytes.len());
    FieldDescriptor {
        name: encoding.decode(&name_bytes[..name_end]).trim().to_string(),
        kind: descriptor[11].to_ascii_uppercase(),
        length: descriptor[16] as usize,
        decimals: descriptor[17],
    }
}

fn field_value(field: &FieldDescriptor, raw: &[u8], encoding: Encoding) -> Value {
    let text = encoding.decode(raw);
    let trimmed = text.trim_matches(|c: char| c == ' ' || c == '\0');

    match field.kind {
        b'N' | b'F' => numeric(trimmed, field.decimals),
        b'L' => match trimmed.chars().next() {
            Some('T' | 't' | 'Y' | 'y') => Value::Bool(true),
            Some('F' | 'f' | 'N' | 'n') => Value::Bool(false),
            _ => Value::Null,
        },
        b'D' if trimmed.len() == 8 && trimmed.bytes().all(|b| b.is_ascii_digit()) => {
            Value::String(format!("{}-{}-{}", &trimmed[..4], &trimmed[4..6], &trimmed[6..]))
        }
        b'D' => Value::Null,
        _ => Value::String(trimmed.to_string()),
    }
}

fn numeric(text: &str, decimals: u8) -> Value {
    if text.is_empty() || text.chars().all(|c| c == '*') {
        return Value::Null;
    }
    if decimals == 0 {
        if let Ok(n) = text.parse::<i64>() {
            return Value::Number(n.into());
        }
    }
    text.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map_or(Value::Null, Value::Number)
}
