use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// File extension of every archive container.
pub const CONTAINER_EXT: &str = "tar";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Category {
    Metadata,
    English,
    Regional,
    Other(String),
}

impl Category {
    pub fn defaults() -> Vec<Category> {
        vec![Category::Metadata, Category::English, Category::Regional]
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Metadata => "metadata",
            Self::English => "english",
            Self::Regional => "regional",
            Self::Other(name) => name,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let name = s.trim().to_ascii_lowercase();
        match name.as_str() {
            "metadata" => Ok(Self::Metadata),
            "english" => Ok(Self::English),
            "regional" => Ok(Self::Regional),
            "" => bail!("category cannot be empty"),
            other => {
                let valid = other
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
                if !valid {
                    bail!("invalid category `{s}`: use [a-z0-9_-]");
                }
                Ok(Self::Other(other.to_string()))
            }
        }
    }
}

impl TryFrom<String> for Category {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Category> for String {
    fn from(value: Category) -> Self {
        value.as_str().to_string()
    }
}

/// One ever-growing archive lineage: all containers of a category in a year.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ArchiveKey {
    pub year: i32,
    pub category: Category,
}

impl ArchiveKey {
    pub fn new(year: i32, category: Category) -> Self {
        Self { year, category }
    }

    /// Remote directory holding this key's containers and index, with a
    /// trailing slash. Metadata lives apart from document categories.
    pub fn remote_dir(&self) -> String {
        match self.category {
            Category::Metadata => format!("metadata/{CONTAINER_EXT}/year={}/", self.year),
            _ => format!(
                "data/{CONTAINER_EXT}/year={}/{}/",
                self.year,
                self.category.as_str()
            ),
        }
    }

    pub fn index_key(&self) -> String {
        format!("{}{}.index.json", self.remote_dir(), self.category.as_str())
    }

    /// Name of the first part; later parts are timestamp-derived.
    pub fn canonical_part_name(&self) -> String {
        self.category.as_str().to_string()
    }

    pub fn container_key(&self, part_name: &str) -> String {
        format!("{}{}", self.remote_dir(), container_file_name(part_name))
    }
}

impl fmt::Display for ArchiveKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.year, self.category)
    }
}

pub fn container_file_name(part_name: &str) -> String {
    format!("{part_name}.{CONTAINER_EXT}")
}

/// Pull `year=YYYY` out of a remote key.
pub fn year_from_remote_key(key: &str) -> Option<i32> {
    key.split('/')
        .find_map(|segment| segment.strip_prefix("year="))
        .and_then(|year| year.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_and_documents_use_separate_trees() {
        let meta = ArchiveKey::new(1999, Category::Metadata);
        assert_eq!(meta.index_key(), "metadata/tar/year=1999/metadata.index.json");
        assert_eq!(meta.container_key("metadata"), "metadata/tar/year=1999/metadata.tar");

        let english = ArchiveKey::new(1999, Category::English);
        assert_eq!(
            english.container_key("part-20250101T120000"),
            "data/tar/year=1999/english/part-20250101T120000.tar"
        );
    }

    #[test]
    fn categories_round_trip_through_strings() {
        assert_eq!("Regional".parse::<Category>().unwrap(), Category::Regional);
        assert_eq!(
            "hindi".parse::<Category>().unwrap(),
            Category::Other("hindi".into())
        );
        assert!("../etc".parse::<Category>().is_err());
        let json = serde_json::to_string(&Category::English).unwrap();
        assert_eq!(json, "\"english\"");
    }

    #[test]
    fn year_is_read_from_partition_segment() {
        assert_eq!(
            year_from_remote_key("data/tar/year=2003/english/english.tar"),
            Some(2003)
        );
        assert_eq!(year_from_remote_key("data/tar/english.tar"), None);
    }
}
