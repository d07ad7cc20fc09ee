//! ASTM E1394 record model.
//!
//! Each record kind serializes to one pipe-delimited line. Empty fields are
//! kept as empty segments so column positions stay fixed:
//! ```text
//! H|\^&|||<sender>^<version>|||||P|1|<timestamp>
//! P|<seq>||<id>||<name>||^<age>^Year|<gender>||||||||<owner>|<species>||<weight>^Kg||||||||||||||||
//! O|<seq>|<specimen>||^^^<panel>|<action>|<timestamp>|||||N||||||||||||||
//! R|<seq>|^^^<test>|<value>|<unit>|<range>|<flag>||||F||<timestamp>
//! C|<seq>|I|<comment>|G
//! L|<seq>|N
//! ```
//!
//! # Timestamps
//!
//! A record whose `timestamp` is empty gets the current local time
//! (`yyyyMMddHHmmss`) substituted *at serialization time*. Serializing such a
//! record twice at different instants can therefore yield different lines;
//! only the timestamp field differs.
//!
//! # Escaping
//!
//! Only the field delimiter is escaped in free-text values, as the E1394
//! sequence `&F&`. Everything else, including `&` and the component
//! delimiter `^` (e.g. `SN^Connect`), goes on the wire as given.

use serde::Serialize;

use crate::error::{AstmError, Result};

/// Field delimiter.
pub const FIELD_DELIMITER: char = '|';
/// Component delimiter.
pub const COMPONENT_DELIMITER: char = '^';
/// Delimiter definition carried in the header record.
pub const DELIMITER_DEFINITION: &str = "\\^&";
/// chrono format for record timestamps.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

/// Current local time as an ASTM timestamp.
pub fn current_timestamp() -> String {
    chrono::Local::now().format(TIMESTAMP_FORMAT).to_string()
}

fn timestamp_or_now(timestamp: &str) -> String {
    if timestamp.is_empty() {
        current_timestamp()
    } else {
        timestamp.to_string()
    }
}

const FIELD_ESCAPE: &str = "&F&";

fn escape(value: &str) -> String {
    value.replace(FIELD_DELIMITER, FIELD_ESCAPE)
}

fn unescape(value: &str) -> String {
    value.replace(FIELD_ESCAPE, "|")
}

/// Fixed-width line of fields, joined by `|`.
struct FieldLine {
    fields: Vec<String>,
}

impl FieldLine {
    fn new(record_type: char, width: usize) -> Self {
        let mut fields = vec![String::new(); width];
        fields[0] = record_type.to_string();
        Self { fields }
    }

    fn set(mut self, index: usize, value: impl Into<String>) -> Self {
        self.fields[index] = value.into();
        self
    }

    fn text(self, index: usize, value: &str) -> Self {
        self.set(index, escape(value))
    }

    fn finish(self) -> String {
        self.fields.join("|")
    }
}

/// Split fields of one record line; missing trailing fields read as empty.
struct Fields<'a> {
    parts: Vec<&'a str>,
    kind: &'static str,
}

impl<'a> Fields<'a> {
    fn new(line: &'a str, kind: &'static str, required: usize) -> Result<Self> {
        let parts: Vec<&str> = line.split(FIELD_DELIMITER).collect();
        if parts.len() < required {
            return Err(AstmError::Parse(format!(
                "{} record has {} fields, expected at least {}",
                kind,
                parts.len(),
                required
            )));
        }
        Ok(Self { parts, kind })
    }

    fn raw(&self, index: usize) -> &'a str {
        self.parts.get(index).copied().unwrap_or("")
    }

    fn text(&self, index: usize) -> String {
        unescape(self.raw(index))
    }

    fn sequence(&self, index: usize) -> Result<u32> {
        self.raw(index).parse().map_err(|_| {
            AstmError::Parse(format!(
                "{} record has invalid sequence number '{}'",
                self.kind,
                self.raw(index)
            ))
        })
    }

    fn stripped(&self, index: usize, prefix: &str, suffix: &str) -> Result<String> {
        let raw = self.raw(index);
        raw.strip_prefix(prefix)
            .and_then(|s| s.strip_suffix(suffix))
            .map(unescape)
            .ok_or_else(|| {
                AstmError::Parse(format!(
                    "{} record field {} '{}' does not match {}..{}",
                    self.kind, index, raw, prefix, suffix
                ))
            })
    }
}

/// Abnormal flag attached to a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultFlag {
    Normal,
    Low,
    High,
    /// Critically low.
    Critical,
    CriticalHigh,
    Abnormal,
}

impl ResultFlag {
    /// Wire code.
    pub fn code(self) -> &'static str {
        match self {
            Self::Normal => "N",
            Self::Low => "L",
            Self::High => "H",
            Self::Critical => "<",
            Self::CriticalHigh => ">",
            Self::Abnormal => "A",
        }
    }

    /// Human-readable description.
    pub fn description(self) -> &'static str {
        match self {
            Self::Normal => "Normal",
            Self::Low => "Low",
            Self::High => "High",
            Self::Critical => "Critical Low",
            Self::CriticalHigh => "Critical High",
            Self::Abnormal => "Abnormal",
        }
    }

    /// Inverse of [`code`](Self::code).
    pub fn from_code(code: &str) -> Option<Self> {
        Some(match code {
            "N" => Self::Normal,
            "L" => Self::Low,
            "H" => Self::High,
            "<" => Self::Critical,
            ">" => Self::CriticalHigh,
            "A" => Self::Abnormal,
            _ => return None,
        })
    }
}

impl std::fmt::Display for ResultFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.description())
    }
}

/// Order action code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionCode {
    /// `A`: add to an existing order (result reporting).
    Add,
    /// `N`: new order (work list add).
    New,
    /// `C`: cancel order (work list remove).
    Cancel,
    /// `Q`: quality-control / query.
    Query,
}

impl ActionCode {
    pub fn code(self) -> &'static str {
        match self {
            Self::Add => "A",
            Self::New => "N",
            Self::Cancel => "C",
            Self::Query => "Q",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        Some(match code {
            "A" => Self::Add,
            "N" => Self::New,
            "C" => Self::Cancel,
            "Q" => Self::Query,
            _ => return None,
        })
    }
}

/// `H` record: message header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeaderRecord {
    pub sender: String,
    pub software_version: String,
    /// Empty means "now" at serialization time.
    pub timestamp: String,
}

impl HeaderRecord {
    const WIDTH: usize = 12;

    pub fn new(sender: impl Into<String>, software_version: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            software_version: software_version.into(),
            timestamp: String::new(),
        }
    }

    /// Set an explicit timestamp instead of serialization-time substitution.
    pub fn with_timestamp(mut self, timestamp: impl Into<String>) -> Self {
        self.timestamp = timestamp.into();
        self
    }

    pub fn to_astm(&self) -> String {
        FieldLine::new('H', Self::WIDTH)
            .set(1, DELIMITER_DEFINITION)
            .set(
                4,
                format!("{}^{}", escape(&self.sender), escape(&self.software_version)),
            )
            .set(9, "P")
            .set(10, "1")
            .set(11, timestamp_or_now(&self.timestamp))
            .finish()
    }

    fn parse(line: &str) -> Result<Self> {
        let fields = Fields::new(line, "Header", Self::WIDTH)?;
        let (sender, version) = fields.raw(4).rsplit_once(COMPONENT_DELIMITER).ok_or_else(|| {
            AstmError::Parse(format!(
                "Header sender field '{}' lacks a version component",
                fields.raw(4)
            ))
        })?;
        Ok(Self {
            sender: unescape(sender),
            software_version: unescape(version),
            timestamp: fields.text(11),
        })
    }
}

/// `P` record: patient demographics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatientRecord {
    pub sequence: u32,
    pub patient_id: String,
    pub name: String,
    /// Age in years.
    pub age: String,
    pub gender: String,
    pub species: String,
    /// Weight in kilograms.
    pub weight: String,
    pub owner: String,
}

impl PatientRecord {
    const WIDTH: usize = 36;

    pub fn to_astm(&self) -> String {
        FieldLine::new('P', Self::WIDTH)
            .set(1, self.sequence.to_string())
            .text(3, &self.patient_id)
            .text(5, &self.name)
            .set(7, format!("^{}^Year", escape(&self.age)))
            .text(8, &self.gender)
            .text(16, &self.owner)
            .text(17, &self.species)
            .set(19, format!("{}^Kg", escape(&self.weight)))
            .finish()
    }

    fn parse(line: &str) -> Result<Self> {
        let fields = Fields::new(line, "Patient", 20)?;
        Ok(Self {
            sequence: fields.sequence(1)?,
            patient_id: fields.text(3),
            name: fields.text(5),
            age: fields.stripped(7, "^", "^Year")?,
            gender: fields.text(8),
            owner: fields.text(16),
            species: fields.text(17),
            weight: fields.stripped(19, "", "^Kg")?,
        })
    }
}

/// `O` record: test order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderRecord {
    pub sequence: u32,
    pub specimen_id: String,
    pub panel_id: String,
    pub action: ActionCode,
    /// Empty means "now" at serialization time.
    pub timestamp: String,
}

impl OrderRecord {
    const WIDTH: usize = 26;
    /// Report type, always "N".
    pub const REPORT_TYPE: &'static str = "N";

    pub fn new(
        sequence: u32,
        specimen_id: impl Into<String>,
        panel_id: impl Into<String>,
        action: ActionCode,
    ) -> Self {
        Self {
            sequence,
            specimen_id: specimen_id.into(),
            panel_id: panel_id.into(),
            action,
            timestamp: String::new(),
        }
    }

    pub fn to_astm(&self) -> String {
        FieldLine::new('O', Self::WIDTH)
            .set(1, self.sequence.to_string())
            .text(2, &self.specimen_id)
            .set(4, format!("^^^{}", escape(&self.panel_id)))
            .set(5, self.action.code())
            .set(6, timestamp_or_now(&self.timestamp))
            .set(11, Self::REPORT_TYPE)
            .finish()
    }

    fn parse(line: &str) -> Result<Self> {
        let fields = Fields::new(line, "Order", 12)?;
        let action = ActionCode::from_code(fields.raw(5)).ok_or_else(|| {
            AstmError::Parse(format!("Unknown order action code '{}'", fields.raw(5)))
        })?;
        Ok(Self {
            sequence: fields.sequence(1)?,
            specimen_id: fields.text(2),
            panel_id: fields.stripped(4, "^^^", "")?,
            action,
            timestamp: fields.text(6),
        })
    }
}

/// `R` record: one test result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResultRecord {
    pub sequence: u32,
    pub test_id: String,
    pub value: String,
    pub unit: String,
    pub reference_range: String,
    pub flag: ResultFlag,
    /// Empty means "now" at serialization time.
    pub timestamp: String,
}

impl ResultRecord {
    const WIDTH: usize = 13;
    /// Result status, always final.
    pub const STATUS_FINAL: &'static str = "F";

    pub fn to_astm(&self) -> String {
        FieldLine::new('R', Self::WIDTH)
            .set(1, self.sequence.to_string())
            .set(2, format!("^^^{}", escape(&self.test_id)))
            .text(3, &self.value)
            .text(4, &self.unit)
            .text(5, &self.reference_range)
            .set(6, self.flag.code())
            .set(10, Self::STATUS_FINAL)
            .set(12, timestamp_or_now(&self.timestamp))
            .finish()
    }

    fn parse(line: &str) -> Result<Self> {
        let fields = Fields::new(line, "Result", 7)?;
        let flag = ResultFlag::from_code(fields.raw(6)).ok_or_else(|| {
            AstmError::Parse(format!("Unknown result flag '{}'", fields.raw(6)))
        })?;
        Ok(Self {
            sequence: fields.sequence(1)?,
            test_id: fields.stripped(2, "^^^", "")?,
            value: fields.text(3),
            unit: fields.text(4),
            reference_range: fields.text(5),
            flag,
            timestamp: fields.text(12),
        })
    }
}

/// `C` record: free-text comment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommentRecord {
    pub sequence: u32,
    pub text: String,
}

impl CommentRecord {
    const WIDTH: usize = 5;
    /// Comment source, "I" (instrument).
    pub const SOURCE: &'static str = "I";
    /// Comment type, "G" (generic).
    pub const KIND: &'static str = "G";

    pub fn new(sequence: u32, text: impl Into<String>) -> Self {
        Self {
            sequence,
            text: text.into(),
        }
    }

    pub fn to_astm(&self) -> String {
        FieldLine::new('C', Self::WIDTH)
            .set(1, self.sequence.to_string())
            .set(2, Self::SOURCE)
            .text(3, &self.text)
            .set(4, Self::KIND)
            .finish()
    }

    fn parse(line: &str) -> Result<Self> {
        let fields = Fields::new(line, "Comment", 4)?;
        Ok(Self {
            sequence: fields.sequence(1)?,
            text: fields.text(3),
        })
    }
}

/// `L` record: message terminator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TerminatorRecord {
    pub sequence: u32,
}

impl TerminatorRecord {
    /// Termination code, "N" (normal).
    pub const NORMAL: &'static str = "N";

    pub fn new(sequence: u32) -> Self {
        Self { sequence }
    }

    pub fn to_astm(&self) -> String {
        format!("L|{}|{}", self.sequence, Self::NORMAL)
    }

    fn parse(line: &str) -> Result<Self> {
        let fields = Fields::new(line, "Terminator", 2)?;
        Ok(Self {
            sequence: fields.sequence(1)?,
        })
    }
}

/// Any of the six record kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Record {
    Header(HeaderRecord),
    Patient(PatientRecord),
    Order(OrderRecord),
    Result(ResultRecord),
    Comment(CommentRecord),
    Terminator(TerminatorRecord),
}

impl Record {
    /// Record type letter.
    pub fn record_type(&self) -> char {
        match self {
            Self::Header(_) => 'H',
            Self::Patient(_) => 'P',
            Self::Order(_) => 'O',
            Self::Result(_) => 'R',
            Self::Comment(_) => 'C',
            Self::Terminator(_) => 'L',
        }
    }

    /// Serialize to one ASTM line (no trailing CR).
    pub fn to_astm(&self) -> String {
        match self {
            Self::Header(r) => r.to_astm(),
            Self::Patient(r) => r.to_astm(),
            Self::Order(r) => r.to_astm(),
            Self::Result(r) => r.to_astm(),
            Self::Comment(r) => r.to_astm(),
            Self::Terminator(r) => r.to_astm(),
        }
    }

    /// Parse one ASTM line. A trailing CR is ignored.
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        let kind = line
            .split(FIELD_DELIMITER)
            .next()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| AstmError::Parse("Empty record".into()))?;

        match kind {
            "H" => HeaderRecord::parse(line).map(Self::Header),
            "P" => PatientRecord::parse(line).map(Self::Patient),
            "O" => OrderRecord::parse(line).map(Self::Order),
            "R" => ResultRecord::parse(line).map(Self::Result),
            "C" => CommentRecord::parse(line).map(Self::Comment),
            "L" => TerminatorRecord::parse(line).map(Self::Terminator),
            other => Err(AstmError::Parse(format!("Unknown record type '{}'", other))),
        }
    }
}

macro_rules! impl_from_record {
    ($($variant:ident => $ty:ty),* $(,)?) => {
        $(impl From<$ty> for Record {
            fn from(record: $ty) -> Self {
                Self::$variant(record)
            }
        })*
    };
}

impl_from_record! {
    Header => HeaderRecord,
    Patient => PatientRecord,
    Order => OrderRecord,
    Result => ResultRecord,
    Comment => CommentRecord,
    Terminator => TerminatorRecord,
}
