use std::fmt;

use serde::{Serialize, Serializer};

/// Number of classes the classifier emits scores for.
pub const LABEL_COUNT: usize = 7;

/// Findings the classifier distinguishes, in model output order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Disease {
    BacterialPneumonia,
    Covid19,
    Edema,
    LungOpacity,
    Normal,
    Tuberculosis,
    ViralPneumonia,
}

impl Disease {
    pub const ALL: [Disease; LABEL_COUNT] = [
        Disease::BacterialPneumonia,
        Disease::Covid19,
        Disease::Edema,
        Disease::LungOpacity,
        Disease::Normal,
        Disease::Tuberculosis,
        Disease::ViralPneumonia,
    ];

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn label(self) -> &'static str {
        match self {
            Disease::BacterialPneumonia => "Bacterial Pneumonia",
            Disease::Covid19 => "COVID-19",
            Disease::Edema => "Edema",
            Disease::LungOpacity => "Lung Opacity",
            Disease::Normal => "Normal",
            Disease::Tuberculosis => "Tuberculosis",
            Disease::ViralPneumonia => "Viral Pneumonia",
        }
    }
}

/// Label attached to a classification. `Unknown` covers output indices the
/// label table has no entry for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Diagnosis {
    Known(Disease),
    Unknown,
}

impl Diagnosis {
    pub fn from_index(index: usize) -> Self {
        Disease::from_index(index).map_or(Diagnosis::Unknown, Diagnosis::Known)
    }

    pub fn label(self) -> &'static str {
        match self {
            Diagnosis::Known(disease) => disease.label(),
            Diagnosis::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for Diagnosis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl Serialize for Diagnosis {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.label())
    }
}
