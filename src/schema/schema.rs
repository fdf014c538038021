use std::collections::{BTreeMap, BTreeSet};
use serde::{Serialize, Deserialize};
use crate::core::error::{Error, ErrorKind, Result};
use crate::storage::keys::RESERVED_FIELD_NAMES;

/// One file: its primary field and the secondary fields that are indexed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDefinition {
    pub primary: String,
    pub secondary: BTreeSet<String>,
}

/// Logical schema shared by every engine a database is opened on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSpec {
    pub files: BTreeMap<String, FileDefinition>,
}

impl FileSpec {
    pub fn new() -> Self {
        FileSpec::default()
    }

    pub fn add_file(mut self, name: &str, primary: &str, secondary: &[&str]) -> Self {
        self.files.insert(
            name.to_string(),
            FileDefinition {
                primary: primary.to_string(),
                secondary: secondary.iter().map(|s| s.to_string()).collect(),
            },
        );
        self
    }

    pub fn file(&self, name: &str) -> Option<&FileDefinition> {
        self.files.get(name)
    }

    pub fn file_names(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(|s| s.as_str())
    }

    pub fn secondary_fields(&self, file: &str) -> impl Iterator<Item = &str> {
        self.files
            .get(file)
            .into_iter()
            .flat_map(|d| d.secondary.iter().map(|s| s.as_str()))
    }

    /// Names become engine key parts, so they are restricted to ASCII
    /// alphanumerics and `-`.
    pub fn validate(&self) -> Result<()> {
        for (name, definition) in &self.files {
            Self::check_name("file", name)?;
            Self::check_name("primary field", &definition.primary)?;
            for field in &definition.secondary {
                Self::check_name("field", field)?;
                if RESERVED_FIELD_NAMES.contains(&field.as_str()) {
                    return Err(Error::new(
                        ErrorKind::InvalidArgument,
                        format!("Field name '{}' in file '{}' is reserved", field, name),
                    ));
                }
            }
        }
        Ok(())
    }

    fn check_name(what: &str, name: &str) -> Result<()> {
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                format!("Invalid {} name '{}'", what, name),
            ));
        }
        Ok(())
    }

    /// Every file and field of `self` is present in `stored` with the same definition.
    pub fn is_consistent_with(&self, stored: &FileSpec) -> bool {
        self.files
            .iter()
            .all(|(name, definition)| stored.files.get(name) == Some(definition))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
