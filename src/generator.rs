//! Canned and randomized messages for test scenarios.
//!
//! All randomness flows through a caller-supplied [`rand::Rng`] so runs can
//! be reproduced with a seeded generator.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;

use crate::message::{Message, MessageKind};
use crate::panel::{TestDefinition, TestPanel};
use crate::record::{
    ActionCode, HeaderRecord, OrderRecord, PatientRecord, ResultFlag, ResultRecord,
};

/// Sender name used by the simulated instrument.
pub const DEFAULT_SENDER: &str = "Skyla Solution";
/// Software version reported by canned scenarios.
pub const INSTRUMENT_VERSION: &str = "4.2.0.0";
/// Comment sent once the connection is established.
pub const CONNECT_COMMENT: &str = "SN^Connect";
/// Comment sent before the connection is closed.
pub const DISCONNECT_COMMENT: &str = "SN^Disconnect";

const PATIENT_NAMES: [&str; 8] = [
    "Max", "Bella", "Charlie", "Luna", "Cooper", "Lucy", "Bear", "Daisy",
];
const OWNER_NAMES: [&str; 8] = [
    "Smith", "Johnson", "Williams", "Brown", "Jones", "Garcia", "Miller", "Davis",
];

/// Named test scenarios.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Scenario {
    NormalLiverPanel,
    AbnormalResults,
    SingleGlucoseTest,
    RandomLiverPanel,
    RandomKidneyPanel,
    AddToWorkList,
    CancelFromWorkList,
    StatusComment,
}

impl Scenario {
    pub const ALL: [Scenario; 8] = [
        Self::NormalLiverPanel,
        Self::AbnormalResults,
        Self::SingleGlucoseTest,
        Self::RandomLiverPanel,
        Self::RandomKidneyPanel,
        Self::AddToWorkList,
        Self::CancelFromWorkList,
        Self::StatusComment,
    ];

    /// Display name.
    pub fn name(self) -> &'static str {
        match self {
            Self::NormalLiverPanel => "Normal Liver Panel",
            Self::AbnormalResults => "Abnormal Results",
            Self::SingleGlucoseTest => "Single Glucose Test",
            Self::RandomLiverPanel => "Random Liver Panel",
            Self::RandomKidneyPanel => "Random Kidney Panel",
            Self::AddToWorkList => "Add to Work List",
            Self::CancelFromWorkList => "Cancel from Work List",
            Self::StatusComment => "Status Comment",
        }
    }

    /// Build this scenario's message.
    pub fn build<R: Rng + ?Sized>(self, rng: &mut R) -> Message {
        match self {
            Self::NormalLiverPanel => normal_liver_panel(),
            Self::AbnormalResults => abnormal_results(),
            Self::SingleGlucoseTest => single_glucose_test(),
            Self::RandomLiverPanel => random_panel_message(&TestPanel::LIVER, rng),
            Self::RandomKidneyPanel => random_panel_message(&TestPanel::KIDNEY, rng),
            Self::AddToWorkList => work_list(ActionCode::New, "WL001", TestPanel::LIVER.id),
            Self::CancelFromWorkList => {
                work_list(ActionCode::Cancel, "WL001", TestPanel::LIVER.id)
            }
            Self::StatusComment => status_comment("SN^Queued"),
        }
    }
}

impl std::fmt::Display for Scenario {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

fn instrument_header() -> HeaderRecord {
    HeaderRecord::new(DEFAULT_SENDER, INSTRUMENT_VERSION)
}

fn patient(
    id: &str,
    name: &str,
    age: &str,
    gender: &str,
    weight: &str,
    owner: &str,
) -> PatientRecord {
    PatientRecord {
        sequence: 1,
        patient_id: id.into(),
        name: name.into(),
        age: age.into(),
        gender: gender.into(),
        species: "Canine".into(),
        weight: weight.into(),
        owner: owner.into(),
    }
}

fn canned_result(
    sequence: u32,
    test: &TestDefinition,
    value: &str,
    flag: ResultFlag,
) -> ResultRecord {
    ResultRecord {
        sequence,
        test_id: test.id.into(),
        value: value.into(),
        unit: test.unit.into(),
        reference_range: test.reference_range.into(),
        flag,
        timestamp: String::new(),
    }
}

fn panel_message(
    patient: PatientRecord,
    specimen_id: &str,
    panel_id: &str,
    results: Vec<ResultRecord>,
) -> Message {
    Message::builder(MessageKind::AnalyticResult, instrument_header())
        .patient(patient)
        .order(OrderRecord::new(1, specimen_id, panel_id, ActionCode::Add))
        .results(results)
        .build_numbered()
}

/// Liver panel with two normal results.
pub fn normal_liver_panel() -> Message {
    let tests = TestPanel::LIVER.tests;
    panel_message(
        patient("BBB", "金城武", "5", "M", "16", "OwnerName"),
        "000030",
        TestPanel::LIVER.id,
        vec![
            canned_result(1, &tests[0], "3.0", ResultFlag::Normal),
            canned_result(2, &tests[1], "35", ResultFlag::Normal),
        ],
    )
}

/// Liver panel with one low and one high result.
pub fn abnormal_results() -> Message {
    let tests = TestPanel::LIVER.tests;
    panel_message(
        patient("CCC", "Test Patient", "3", "F", "12", "Owner"),
        "000031",
        TestPanel::LIVER.id,
        vec![
            canned_result(1, &tests[0], "1.8", ResultFlag::Low),
            canned_result(2, &tests[1], "150", ResultFlag::High),
        ],
    )
}

/// A single out-of-range glucose result.
pub fn single_glucose_test() -> Message {
    let glucose = TestDefinition {
        id: "GLU",
        name: "Glucose",
        unit: "mg/dL",
        reference_range: "74-143",
        normal_min: 74.0,
        normal_max: 143.0,
    };
    panel_message(
        patient("DDD", "Single Test", "7", "M", "20", "SingleOwner"),
        "000032",
        glucose.id,
        vec![canned_result(1, &glucose, "145", glucose.flag_for(145.0))],
    )
}

/// Work-list add (`ActionCode::New`) or cancel (`ActionCode::Cancel`) message.
pub fn work_list(action: ActionCode, specimen_id: &str, panel_id: &str) -> Message {
    Message::builder(MessageKind::WorkList, instrument_header())
        .order(OrderRecord::new(1, specimen_id, panel_id, action))
        .build_numbered()
}

/// Header + comment + terminator.
pub fn status_comment(comment: &str) -> Message {
    Message::comment_only(MessageKind::AnalyticResult, instrument_header(), comment)
}

/// Connection status notification sent on connect/disconnect.
pub fn connection_status(sender: &str, software_version: &str, comment: &str) -> Message {
    Message::comment_only(
        MessageKind::ConnectionStatus,
        HeaderRecord::new(sender, software_version),
        comment,
    )
}

/// Result for `value` with its flag derived from the test's normal range.
///
/// The value is rendered with one decimal digit.
pub fn result_for_value(test: &TestDefinition, value: f64) -> ResultRecord {
    ResultRecord {
        sequence: 1,
        test_id: test.id.into(),
        value: format!("{:.1}", value),
        unit: test.unit.into(),
        reference_range: test.reference_range.into(),
        flag: test.flag_for(value),
        timestamp: String::new(),
    }
}

/// Random value within ±30% of the normal range's midpoint.
pub fn random_value<R: Rng + ?Sized>(test: &TestDefinition, rng: &mut R) -> f64 {
    let variation: f64 = rng.gen_range(0.7..=1.3);
    test.midpoint() * variation
}

/// Random result for one test.
pub fn random_result<R: Rng + ?Sized>(test: &TestDefinition, rng: &mut R) -> ResultRecord {
    result_for_value(test, random_value(test, rng))
}

/// Random canine patient.
pub fn random_patient<R: Rng + ?Sized>(rng: &mut R) -> PatientRecord {
    let name = PATIENT_NAMES.choose(rng).copied().unwrap_or("Unknown");
    let owner = OWNER_NAMES.choose(rng).copied().unwrap_or("Unknown");
    let gender = if rng.gen_bool(0.5) { "M" } else { "F" };

    PatientRecord {
        sequence: 1,
        patient_id: format!("PET{:03}", rng.gen_range(1..=999)),
        name: name.into(),
        age: rng.gen_range(1..=15).to_string(),
        gender: gender.into(),
        species: "Canine".into(),
        weight: rng.gen_range(5..=50).to_string(),
        owner: owner.into(),
    }
}

/// Random patient, random specimen id, one random result per panel test.
pub fn random_panel_message<R: Rng + ?Sized>(panel: &TestPanel, rng: &mut R) -> Message {
    let results = panel.tests.iter().map(|t| random_result(t, rng)).collect();
    let specimen_id = format!("{:06}", rng.gen_range(1..=999_999));
    panel_message(random_patient(rng), &specimen_id, panel.id, results)
}
