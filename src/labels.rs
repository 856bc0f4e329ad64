use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::LoadError;

#[derive(Debug, Deserialize)]
struct LabelRow {
    label: String,
    idx: usize,
}

/// Disease label for every output index of the disease head, and back.
#[derive(Debug, Clone, Default)]
pub struct LabelMapping {
    by_index: BTreeMap<usize, String>,
    by_label: HashMap<String, usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LabelEntry<'a> {
    pub idx: usize,
    pub label: &'a str,
}

impl LabelMapping {
    /// Parses `label,idx` rows. Other columns are ignored; a repeated label or
    /// index is an error.
    pub fn from_reader(reader: impl Read) -> Result<Self, String> {
        let mut mapping = Self::default();
        let mut rows = csv::Reader::from_reader(reader);
        for (line, row) in rows.deserialize::<LabelRow>().enumerate() {
            let LabelRow { label, idx } = row.map_err(|err| err.to_string())?;
            if let Some(previous) = mapping.by_index.get(&idx) {
                return Err(format!(
                    "row {}: index {idx} already assigned to `{previous}`",
                    line + 1
                ));
            }
            if mapping.by_label.contains_key(&label) {
                return Err(format!("row {}: duplicate label `{label}`", line + 1));
            }
            mapping.by_label.insert(label.clone(), idx);
            mapping.by_index.insert(idx, label);
        }
        Ok(mapping)
    }

    pub fn load(path: &Path) -> Result<Self, LoadError> {
        let file = std::fs::File::open(path).map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_reader(file).map_err(|reason| LoadError::Labels {
            path: path.to_path_buf(),
            reason,
        })
    }

    pub fn len(&self) -> usize {
        self.by_index.len()
    }

    pub fn label(&self, idx: usize) -> Option<&str> {
        self.by_index.get(&idx).map(String::as_str)
    }

    pub fn index(&self, label: &str) -> Option<usize> {
        self.by_label.get(label).copied()
    }

    /// Entries in ascending index order.
    pub fn entries(&self) -> impl Iterator<Item = LabelEntry<'_>> {
        self.by_index.iter().map(|(&idx, label)| LabelEntry {
            idx,
            label: label.as_str(),
        })
    }
}

/// One rung of the Fitzpatrick skin-type scale as reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FitzpatrickScale {
    /// Clinical value; -1 stands for an unrecorded skin type.
    pub value: i8,
    pub label: &'static str,
}

const UNKNOWN: FitzpatrickScale = FitzpatrickScale {
    value: -1,
    label: "Unknown",
};

/// Fitzpatrick head output index -> clinical scale.
///
/// The training labels were shifted so that the "unknown" class (-1) became
/// class 0. Types I..VI keep their own number as their index.
pub const FITZPATRICK_SCALES: [FitzpatrickScale; 7] = [
    UNKNOWN,
    FitzpatrickScale { value: 1, label: "I" },
    FitzpatrickScale { value: 2, label: "II" },
    FitzpatrickScale { value: 3, label: "III" },
    FitzpatrickScale { value: 4, label: "IV" },
    FitzpatrickScale { value: 5, label: "V" },
    FitzpatrickScale { value: 6, label: "VI" },
];

impl FitzpatrickScale {
    /// Scale for a head output index. Indices past the table keep their
    /// number as value and are labelled "Unknown".
    pub fn from_index(idx: usize) -> Self {
        FITZPATRICK_SCALES.get(idx).copied().unwrap_or_else(|| {
            FitzpatrickScale {
                value: i8::try_from(idx).unwrap_or(i8::MAX),
                label: UNKNOWN.label,
            }
        })
    }

    /// Head output index for a clinical value.
    pub fn index_of(value: i8) -> Option<usize> {
        FITZPATRICK_SCALES
            .iter()
            .position(|scale| scale.value == value)
    }

    pub fn label_for(value: i8) -> &'static str {
        Self::index_of(value)
            .map(|idx| FITZPATRICK_SCALES[idx].label)
            .unwrap_or(UNKNOWN.label)
    }

    /// Value -> label table published by the labels endpoint. Value 0 is
    /// listed as "Unknown" too, since some datasets record unknown as 0.
    pub fn published_table() -> BTreeMap<i8, &'static str> {
        let mut table: BTreeMap<i8, &'static str> = FITZPATRICK_SCALES
            .iter()
            .map(|scale| (scale.value, scale.label))
            .collect();
        table.insert(0, UNKNOWN.label);
        table
    }
}
