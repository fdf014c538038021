use serde::{Serialize, Deserialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordNumber(pub u64);

impl From<u64> for RecordNumber {
    fn from(n: u64) -> Self {
        RecordNumber(n)
    }
}

impl fmt::Display for RecordNumber {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A record as stored in a file: primary data plus its secondary index values.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Record {
    pub value: Vec<u8>,
    /// Field name → index values. A field may index a record under several values.
    pub index: BTreeMap<String, Vec<Vec<u8>>>,
}

impl Record {
    pub fn new(value: impl Into<Vec<u8>>) -> Self {
        Record {
            value: value.into(),
            index: BTreeMap::new(),
        }
    }

    pub fn with_index(mut self, field: &str, value: impl Into<Vec<u8>>) -> Self {
        self.add_index_value(field, value);
        self
    }

    pub fn add_index_value(&mut self, field: &str, value: impl Into<Vec<u8>>) {
        self.index.entry(field.to_string()).or_default().push(value.into());
    }

    /// Index values for `field`, sorted with duplicates removed.
    pub fn index_values(&self, field: &str) -> Vec<&[u8]> {
        let mut values: Vec<&[u8]> = self
            .index
            .get(field)
            .map(|v| v.iter().map(|x| x.as_slice()).collect())
            .unwrap_or_default();
        values.sort_unstable();
        values.dedup();
        values
    }
}
