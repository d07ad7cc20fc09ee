//! Message aggregate: one logical ASTM transmission.
//!
//! A message always begins with exactly one header and ends with exactly one
//! terminator. Between them come an optional patient, then orders, results,
//! and comments, in that order. The layout is fixed by the struct itself;
//! [`MessageBuilder::build`] additionally checks that sequence numbers start
//! at 1 and increase by one within each record kind.

use serde::Serialize;

use crate::error::{AstmError, Result};
use crate::record::{
    CommentRecord, HeaderRecord, OrderRecord, PatientRecord, Record, ResultRecord,
    TerminatorRecord,
};

/// What a message is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    AnalyticResult,
    ConnectionStatus,
    WorkList,
}

impl MessageKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::AnalyticResult => "Analytic Result",
            Self::ConnectionStatus => "Connection Status",
            Self::WorkList => "Work List",
        }
    }
}

/// An immutable, fully built message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    kind: MessageKind,
    header: HeaderRecord,
    patient: Option<PatientRecord>,
    orders: Vec<OrderRecord>,
    results: Vec<ResultRecord>,
    comments: Vec<CommentRecord>,
    terminator: TerminatorRecord,
}

impl Message {
    /// Start building a message around its header.
    pub fn builder(kind: MessageKind, header: HeaderRecord) -> MessageBuilder {
        MessageBuilder {
            kind,
            header,
            patient: None,
            orders: Vec::new(),
            results: Vec::new(),
            comments: Vec::new(),
            terminator: TerminatorRecord::new(1),
        }
    }

    /// Header + single comment + terminator, as used for status notifications.
    pub fn comment_only(kind: MessageKind, header: HeaderRecord, comment: &str) -> Self {
        Self {
            kind,
            header,
            patient: None,
            orders: Vec::new(),
            results: Vec::new(),
            comments: vec![CommentRecord::new(1, comment)],
            terminator: TerminatorRecord::new(1),
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn header(&self) -> &HeaderRecord {
        &self.header
    }

    pub fn patient(&self) -> Option<&PatientRecord> {
        self.patient.as_ref()
    }

    pub fn orders(&self) -> &[OrderRecord] {
        &self.orders
    }

    pub fn results(&self) -> &[ResultRecord] {
        &self.results
    }

    pub fn comments(&self) -> &[CommentRecord] {
        &self.comments
    }

    pub fn terminator(&self) -> &TerminatorRecord {
        &self.terminator
    }

    /// Number of records (and therefore frames).
    pub fn len(&self) -> usize {
        2 + usize::from(self.patient.is_some())
            + self.orders.len()
            + self.results.len()
            + self.comments.len()
    }

    /// Always `false`: header and terminator are mandatory.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Records in transmission order.
    pub fn records(&self) -> Vec<Record> {
        let mut records = Vec::with_capacity(self.len());
        records.push(Record::Header(self.header.clone()));
        records.extend(self.patient.clone().map(Record::Patient));
        records.extend(self.orders.iter().cloned().map(Record::Order));
        records.extend(self.results.iter().cloned().map(Record::Result));
        records.extend(self.comments.iter().cloned().map(Record::Comment));
        records.push(Record::Terminator(self.terminator.clone()));
        records
    }

    /// Serialize every record, in transmission order.
    ///
    /// Empty timestamps are filled with the current time on each call.
    pub fn serialize_all(&self) -> Vec<String> {
        self.records().iter().map(Record::to_astm).collect()
    }

    /// Reassemble a message from received records.
    ///
    /// The kind is inferred: results make it an analytic result, orders
    /// without results a work list, anything else a status message.
    pub fn from_records(records: Vec<Record>) -> Result<Self> {
        let mut iter = records.into_iter();
        let header = match iter.next() {
            Some(Record::Header(h)) => h,
            _ => {
                return Err(AstmError::InvalidMessage(
                    "Message must start with a header record".into(),
                ))
            }
        };

        let mut builder = Message::builder(MessageKind::ConnectionStatus, header);
        let mut terminated = false;
        // Patient, then orders, then results; comments only after the patient.
        let mut past_patient = false;
        let mut past_orders = false;
        for record in iter {
            if terminated {
                return Err(AstmError::InvalidMessage(
                    "Records found after the terminator".into(),
                ));
            }
            builder = match record {
                Record::Header(_) => {
                    return Err(AstmError::InvalidMessage("Duplicate header record".into()))
                }
                Record::Patient(_) if builder.patient.is_some() => {
                    return Err(AstmError::InvalidMessage(
                        "At most one patient record is allowed".into(),
                    ))
                }
                Record::Patient(_) if past_patient => {
                    return Err(AstmError::InvalidMessage(
                        "Patient record must precede orders, results and comments".into(),
                    ))
                }
                Record::Order(_) if past_orders => {
                    return Err(AstmError::InvalidMessage(
                        "Order record must precede results".into(),
                    ))
                }
                Record::Patient(p) => builder.patient(p),
                Record::Order(o) => {
                    past_patient = true;
                    builder.order(o)
                }
                Record::Result(r) => {
                    past_patient = true;
                    past_orders = true;
                    builder.result(r)
                }
                Record::Comment(c) => {
                    past_patient = true;
                    builder.comment(c)
                }
                Record::Terminator(t) => {
                    terminated = true;
                    builder.terminator(t)
                }
            };
        }
        if !terminated {
            return Err(AstmError::InvalidMessage(
                "Message must end with a terminator record".into(),
            ));
        }

        builder.kind = if !builder.results.is_empty() {
            MessageKind::AnalyticResult
        } else if !builder.orders.is_empty() {
            MessageKind::WorkList
        } else {
            MessageKind::ConnectionStatus
        };
        builder.build()
    }
}

/// Incremental construction of a [`Message`].
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    kind: MessageKind,
    header: HeaderRecord,
    patient: Option<PatientRecord>,
    orders: Vec<OrderRecord>,
    results: Vec<ResultRecord>,
    comments: Vec<CommentRecord>,
    terminator: TerminatorRecord,
}

impl MessageBuilder {
    /// Set the patient, replacing any earlier one.
    pub fn patient(mut self, patient: PatientRecord) -> Self {
        self.patient = Some(patient);
        self
    }

    pub fn order(mut self, order: OrderRecord) -> Self {
        self.orders.push(order);
        self
    }

    pub fn result(mut self, result: ResultRecord) -> Self {
        self.results.push(result);
        self
    }

    pub fn results(mut self, results: impl IntoIterator<Item = ResultRecord>) -> Self {
        self.results.extend(results);
        self
    }

    pub fn comment(mut self, comment: CommentRecord) -> Self {
        self.comments.push(comment);
        self
    }

    /// Override the default terminator (`L|1|N`).
    pub fn terminator(mut self, terminator: TerminatorRecord) -> Self {
        self.terminator = terminator;
        self
    }

    /// Validate sequence numbering and produce the message.
    pub fn build(self) -> Result<Message> {
        if let Some(patient) = &self.patient {
            check_sequence("Patient", std::iter::once(patient.sequence))?;
        }
        check_sequence("Order", self.orders.iter().map(|o| o.sequence))?;
        check_sequence("Result", self.results.iter().map(|r| r.sequence))?;
        check_sequence("Comment", self.comments.iter().map(|c| c.sequence))?;
        check_sequence("Terminator", std::iter::once(self.terminator.sequence))?;

        Ok(self.finish())
    }

    /// Assign sequence numbers (1, 2, 3, ... per record kind) and produce the
    /// message. Any numbers set on the added records are overwritten.
    pub fn build_numbered(mut self) -> Message {
        if let Some(patient) = &mut self.patient {
            patient.sequence = 1;
        }
        for (sequence, order) in (1u32..).zip(self.orders.iter_mut()) {
            order.sequence = sequence;
        }
        for (sequence, result) in (1u32..).zip(self.results.iter_mut()) {
            result.sequence = sequence;
        }
        for (sequence, comment) in (1u32..).zip(self.comments.iter_mut()) {
            comment.sequence = sequence;
        }
        self.terminator.sequence = 1;
        self.finish()
    }

    fn finish(self) -> Message {
        Message {
            kind: self.kind,
            header: self.header,
            patient: self.patient,
            orders: self.orders,
            results: self.results,
            comments: self.comments,
            terminator: self.terminator,
        }
    }
}

fn check_sequence(kind: &str, sequences: impl Iterator<Item = u32>) -> Result<()> {
    for (expected, actual) in (1u32..).zip(sequences) {
        if actual != expected {
            return Err(AstmError::InvalidMessage(format!(
                "{} sequence number {} out of order, expected {}",
                kind, actual, expected
            )));
        }
    }
    Ok(())
}
