// src/gcode/instruction.rs - Immutable machine instruction with ASCII and binary codecs
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use super::GCodeError;

/// The fixed field alphabet understood by the firmware, in canonical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Field {
    N,
    M,
    G,
    X,
    Y,
    Z,
    E,
    F,
    T,
    S,
    P,
}

impl Field {
    pub const ALL: [Field; 11] = [
        Field::N,
        Field::M,
        Field::G,
        Field::X,
        Field::Y,
        Field::Z,
        Field::E,
        Field::F,
        Field::T,
        Field::S,
        Field::P,
    ];

    pub fn from_char(c: char) -> Option<Field> {
        match c.to_ascii_uppercase() {
            'N' => Some(Field::N),
            'M' => Some(Field::M),
            'G' => Some(Field::G),
            'X' => Some(Field::X),
            'Y' => Some(Field::Y),
            'Z' => Some(Field::Z),
            'E' => Some(Field::E),
            'F' => Some(Field::F),
            'T' => Some(Field::T),
            'S' => Some(Field::S),
            'P' => Some(Field::P),
            _ => None,
        }
    }

    pub fn as_char(self) -> char {
        match self {
            Field::N => 'N',
            Field::M => 'M',
            Field::G => 'G',
            Field::X => 'X',
            Field::Y => 'Y',
            Field::Z => 'Z',
            Field::E => 'E',
            Field::F => 'F',
            Field::T => 'T',
            Field::S => 'S',
            Field::P => 'P',
        }
    }

    /// Bit in the first binary flags word.
    fn binary_flag(self) -> u16 {
        match self {
            Field::N => 1 << 0,
            Field::M => 1 << 1,
            Field::G => 1 << 2,
            Field::X => 1 << 3,
            Field::Y => 1 << 4,
            Field::Z => 1 << 5,
            Field::E => 1 << 6,
            Field::F => 1 << 8,
            Field::T => 1 << 9,
            Field::S => 1 << 10,
            Field::P => 1 << 11,
        }
    }

    /// Encoded width in bytes.
    fn binary_width(self) -> usize {
        match self {
            Field::N | Field::M | Field::G => 2,
            Field::X | Field::Y | Field::Z | Field::E | Field::F => 4,
            Field::T => 1,
            Field::S | Field::P => 4,
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

const BINARY_ALWAYS_SET: u16 = 1 << 7;
const BINARY_V2: u16 = 1 << 12;
const BINARY_HEADER_LEN: usize = 4;
const BINARY_CHECKSUM_LEN: usize = 2;

/// One machine instruction: field values plus an optional comment.
///
/// Instructions are immutable; every "mutation" returns a new value.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Instruction {
    fields: BTreeMap<Field, f64>,
    comment: Option<String>,
}

impl Instruction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field_value(field: Field, value: f64) -> Self {
        Self::new().with_field(field, value)
    }

    pub fn comment_only(comment: impl Into<String>) -> Self {
        Self { fields: BTreeMap::new(), comment: Some(comment.into()) }
    }

    /// Parse a single textual line.
    pub fn parse(text: &str) -> Result<Self, GCodeError> {
        let (code_part, comment) = split_comment(text);
        let mut fields = BTreeMap::new();

        let chars: Vec<char> = code_part.chars().collect();
        let mut pos = 0;
        while pos < chars.len() {
            let c = chars[pos];
            if c.is_whitespace() {
                pos += 1;
                continue;
            }
            // ASCII checksum suffix, not part of the instruction
            if c == '*' {
                break;
            }
            let field = Field::from_char(c).ok_or_else(|| {
                if c.is_ascii_alphabetic() {
                    GCodeError::IncompatibleCode { field: c, text: text.to_string() }
                } else {
                    GCodeError::Parse { text: text.to_string(), line: None }
                }
            })?;
            pos += 1;
            let start = pos;
            while pos < chars.len()
                && (chars[pos].is_ascii_digit() || matches!(chars[pos], '.' | '-' | '+'))
            {
                pos += 1;
            }
            let number: String = chars[start..pos].iter().collect();
            let value = if number.is_empty() {
                0.0
            } else {
                number
                    .parse::<f64>()
                    .map_err(|_| GCodeError::Parse { text: text.to_string(), line: None })?
            };
            if fields.insert(field, value).is_some() {
                return Err(GCodeError::Parse { text: text.to_string(), line: None });
            }
        }

        if fields.is_empty() && comment.is_none() {
            return Err(GCodeError::Parse { text: text.to_string(), line: None });
        }
        Ok(Self { fields, comment })
    }

    pub fn comment(&self) -> Option<&str> {
        self.comment.as_deref()
    }

    pub fn has_fields(&self) -> bool {
        !self.fields.is_empty()
    }

    pub fn has(&self, field: Field) -> bool {
        self.fields.contains_key(&field)
    }

    pub fn get(&self, field: Field) -> Option<f64> {
        self.fields.get(&field).copied()
    }

    pub fn value_or(&self, field: Field, fallback: f64) -> f64 {
        self.get(field).unwrap_or(fallback)
    }

    /// Fields in canonical order.
    pub fn fields(&self) -> impl Iterator<Item = (Field, f64)> + '_ {
        self.fields.iter().map(|(field, value)| (*field, *value))
    }

    pub fn g(&self) -> Option<u16> {
        self.get(Field::G).map(|v| v as u16)
    }

    pub fn m(&self) -> Option<u16> {
        self.get(Field::M).map(|v| v as u16)
    }

    pub fn line_number(&self) -> Option<u16> {
        self.get(Field::N).map(|v| v as u16)
    }

    /// G0 or G1.
    pub fn is_move(&self) -> bool {
        matches!(self.g(), Some(0) | Some(1))
    }

    pub fn with_field(&self, field: Field, value: f64) -> Self {
        let mut fields = self.fields.clone();
        fields.insert(field, value);
        Self { fields, comment: self.comment.clone() }
    }

    /// Add `offset` to a field; a missing field counts as zero.
    pub fn adjusting_field(&self, field: Field, offset: f64) -> Self {
        self.with_field(field, self.value_or(field, 0.0) + offset)
    }

    pub fn without_field(&self, field: Field) -> Self {
        let mut fields = self.fields.clone();
        fields.remove(&field);
        Self { fields, comment: self.comment.clone() }
    }

    pub fn with_comment(&self, comment: impl Into<String>) -> Self {
        Self { fields: self.fields.clone(), comment: Some(comment.into()) }
    }

    pub fn without_comment(&self) -> Self {
        Self { fields: self.fields.clone(), comment: None }
    }

    /// Text form, fields in canonical order followed by the comment.
    pub fn to_ascii(&self) -> String {
        let mut out = String::new();
        for (field, value) in self.fields() {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push(field.as_char());
            out.push_str(&format_value(value));
        }
        if let Some(comment) = &self.comment {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push(';');
            out.push_str(comment);
        }
        out
    }

    /// Compact binary form (Repetier protocol V2) with a Fletcher-16 trailer.
    /// Comments are not transmitted.
    pub fn to_binary(&self) -> Vec<u8> {
        let mut flags = BINARY_ALWAYS_SET | BINARY_V2;
        for (field, _) in self.fields() {
            flags |= field.binary_flag();
        }

        let mut packet = Vec::with_capacity(32);
        packet.extend_from_slice(&flags.to_le_bytes());
        packet.extend_from_slice(&0u16.to_le_bytes());

        for (field, value) in self.fields() {
            match field {
                Field::N | Field::M | Field::G => {
                    packet.extend_from_slice(&(value as i64 as u16).to_le_bytes())
                }
                Field::X | Field::Y | Field::Z | Field::E | Field::F => {
                    packet.extend_from_slice(&(value as f32).to_le_bytes())
                }
                Field::T => packet.push(value as u8),
                Field::S | Field::P => packet.extend_from_slice(&(value as i32).to_le_bytes()),
            }
        }

        let (sum1, sum2) = fletcher16(&packet);
        packet.push(sum1);
        packet.push(sum2);
        packet
    }

    /// Total packet length announced by the first four bytes of a binary
    /// packet, or `None` when the header is not a binary header.
    pub fn binary_length(header: &[u8]) -> Option<usize> {
        if header.len() < BINARY_HEADER_LEN {
            return None;
        }
        let flags = u16::from_le_bytes([header[0], header[1]]);
        if flags & BINARY_ALWAYS_SET == 0 || flags & BINARY_V2 == 0 {
            return None;
        }
        let body: usize = Field::ALL
            .iter()
            .filter(|field| flags & field.binary_flag() != 0)
            .map(|field| field.binary_width())
            .sum();
        Some(BINARY_HEADER_LEN + body + BINARY_CHECKSUM_LEN)
    }

    pub fn from_binary(packet: &[u8]) -> Result<Self, GCodeError> {
        let expected = Self::binary_length(packet)
            .ok_or_else(|| GCodeError::Binary("missing binary header".to_string()))?;
        if packet.len() != expected {
            return Err(GCodeError::Binary(format!(
                "expected {} bytes, got {}",
                expected,
                packet.len()
            )));
        }
        let (body, trailer) = packet.split_at(expected - BINARY_CHECKSUM_LEN);
        let (sum1, sum2) = fletcher16(body);
        if trailer != [sum1, sum2] {
            return Err(GCodeError::Binary("checksum mismatch".to_string()));
        }

        let flags = u16::from_le_bytes([packet[0], packet[1]]);
        let mut fields = BTreeMap::new();
        let mut pos = BINARY_HEADER_LEN;
        for field in Field::ALL {
            if flags & field.binary_flag() == 0 {
                continue;
            }
            let bytes = &body[pos..pos + field.binary_width()];
            let value = match field {
                Field::N | Field::M | Field::G => u16::from_le_bytes([bytes[0], bytes[1]]) as f64,
                Field::X | Field::Y | Field::Z | Field::E | Field::F => {
                    f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64
                }
                Field::T => bytes[0] as f64,
                Field::S | Field::P => {
                    i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64
                }
            };
            fields.insert(field, value);
            pos += field.binary_width();
        }
        Ok(Self { fields, comment: None })
    }
}

impl FromStr for Instruction {
    type Err = GCodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_ascii())
    }
}

/// Split a line into its code part and an optional comment. Both `;` and
/// parenthetical comments end field parsing.
fn split_comment(text: &str) -> (&str, Option<String>) {
    match text.find([';', '(']) {
        Some(idx) if text[idx..].starts_with(';') => {
            (&text[..idx], Some(text[idx + 1..].trim().to_string()))
        }
        Some(idx) => {
            let rest = &text[idx + 1..];
            let inner = rest.find(')').map_or(rest, |end| &rest[..end]);
            (&text[..idx], Some(inner.trim().to_string()))
        }
        None => (text, None),
    }
}

/// At most six decimals, trailing zeros trimmed.
fn format_value(value: f64) -> String {
    let text = format!("{:.6}", value);
    match text.trim_end_matches('0').trim_end_matches('.') {
        "-0" | "" => "0".to_string(),
        trimmed => trimmed.to_string(),
    }
}

pub(crate) fn fletcher16(data: &[u8]) -> (u8, u8) {
    let mut sum1: u16 = 0;
    let mut sum2: u16 = 0;
    for &byte in data {
        sum1 = (sum1 + byte as u16) % 255;
        sum2 = (sum2 + sum1) % 255;
    }
    (sum1 as u8, sum2 as u8)
}
