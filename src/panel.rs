//! Test panel reference data.

use serde::Serialize;

use crate::record::ResultFlag;

/// One analyte with its reference interval.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TestDefinition {
    pub id: &'static str,
    pub name: &'static str,
    pub unit: &'static str,
    /// Reference range as printed on the result record.
    pub reference_range: &'static str,
    pub normal_min: f64,
    pub normal_max: f64,
}

impl TestDefinition {
    /// Flag for `value` against this test's normal bounds.
    ///
    /// Below half the lower bound is critical, above one and a half times the
    /// upper bound is critically high.
    pub fn flag_for(&self, value: f64) -> ResultFlag {
        if value < self.normal_min {
            if value < self.normal_min * 0.5 {
                ResultFlag::Critical
            } else {
                ResultFlag::Low
            }
        } else if value > self.normal_max {
            if value > self.normal_max * 1.5 {
                ResultFlag::CriticalHigh
            } else {
                ResultFlag::High
            }
        } else {
            ResultFlag::Normal
        }
    }

    /// Midpoint of the normal range.
    #[inline]
    pub fn midpoint(&self) -> f64 {
        (self.normal_min + self.normal_max) / 2.0
    }
}

/// Named, ordered set of tests.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TestPanel {
    pub id: &'static str,
    pub name: &'static str,
    pub tests: &'static [TestDefinition],
}

impl TestPanel {
    pub const LIVER: TestPanel = TestPanel {
        id: "LiverPanel",
        name: "Liver Panel",
        tests: &[
            TestDefinition {
                id: "ALB",
                name: "Albumin",
                unit: "g/dL",
                reference_range: "2.3-4.0",
                normal_min: 2.3,
                normal_max: 4.0,
            },
            TestDefinition {
                id: "ALT",
                name: "Alanine Aminotransferase",
                unit: "U/L",
                reference_range: "10-100",
                normal_min: 10.0,
                normal_max: 100.0,
            },
            TestDefinition {
                id: "AST",
                name: "Aspartate Aminotransferase",
                unit: "U/L",
                reference_range: "15-66",
                normal_min: 15.0,
                normal_max: 66.0,
            },
            TestDefinition {
                id: "ALP",
                name: "Alkaline Phosphatase",
                unit: "U/L",
                reference_range: "23-212",
                normal_min: 23.0,
                normal_max: 212.0,
            },
            TestDefinition {
                id: "TBIL",
                name: "Total Bilirubin",
                unit: "mg/dL",
                reference_range: "0.1-0.3",
                normal_min: 0.1,
                normal_max: 0.3,
            },
        ],
    };

    pub const KIDNEY: TestPanel = TestPanel {
        id: "KidneyPanel",
        name: "Kidney Panel",
        tests: &[
            TestDefinition {
                id: "BUN",
                name: "Blood Urea Nitrogen",
                unit: "mg/dL",
                reference_range: "7-27",
                normal_min: 7.0,
                normal_max: 27.0,
            },
            TestDefinition {
                id: "CREA",
                name: "Creatinine",
                unit: "mg/dL",
                reference_range: "0.5-1.8",
                normal_min: 0.5,
                normal_max: 1.8,
            },
            TestDefinition {
                id: "UA",
                name: "Uric Acid",
                unit: "mg/dL",
                reference_range: "0-1",
                normal_min: 0.0,
                normal_max: 1.0,
            },
            TestDefinition {
                id: "PHOS",
                name: "Phosphorus",
                unit: "mg/dL",
                reference_range: "2.5-6.8",
                normal_min: 2.5,
                normal_max: 6.8,
            },
        ],
    };

    /// Every built-in panel.
    pub const ALL: [TestPanel; 2] = [Self::LIVER, Self::KIDNEY];

    /// Look up a built-in panel by id.
    pub fn by_id(id: &str) -> Option<TestPanel> {
        Self::ALL.into_iter().find(|p| p.id == id)
    }

    /// Look up a test in this panel.
    pub fn test(&self, id: &str) -> Option<&'static TestDefinition> {
        self.tests.iter().find(|t| t.id == id)
    }
}
