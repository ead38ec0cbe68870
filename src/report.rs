//! Memory report loading
//!
//! The memory report is the ground truth produced by the first compilation:
//! one entry per emitted section with its real size, address, type and,
//! for task sections, the name of the owning task.

use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use crate::{Address, PlacementError, Result};

/// One section as actually emitted by the compiler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionFact {
    pub name: String,
    pub size: u64,
    pub address: Address,

    /// Report type of the section, matched against the accepted types of
    /// placement rules
    pub kind: String,

    /// Owning task or co-runner (`id_name` in the report)
    pub owner: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawReport {
    sections: Vec<RawSection>,
}

#[derive(Debug, Deserialize)]
struct RawSection {
    name: Option<String>,
    size: Option<u64>,
    address: Option<Address>,
    #[serde(rename = "type")]
    kind: Option<String>,
    id_name: Option<String>,
}

impl RawSection {
    fn into_fact(self, index: usize) -> Result<SectionFact> {
        let missing = |field| PlacementError::MalformedReport { index, field };
        Ok(SectionFact {
            name: self.name.ok_or_else(|| missing("name"))?,
            size: self.size.ok_or_else(|| missing("size"))?,
            address: self.address.ok_or_else(|| missing("address"))?,
            kind: self.kind.unwrap_or_default(),
            owner: self.id_name,
        })
    }
}

/// Lookup from section name to its [`SectionFact`]
#[derive(Debug, Clone, Default)]
pub struct SectionFactTable {
    facts: HashMap<String, SectionFact>,
}

impl SectionFactTable {
    /// Build a table from already decoded facts
    pub fn from_facts<I: IntoIterator<Item = SectionFact>>(facts: I) -> Result<Self> {
        let mut table = SectionFactTable::default();
        for fact in facts {
            if table.facts.contains_key(&fact.name) {
                return Err(PlacementError::DuplicateSection(fact.name));
            }
            table.facts.insert(fact.name.clone(), fact);
        }
        Ok(table)
    }

    /// Parse a JSON memory report, `{"sections": [...]}`
    pub fn from_json(json: &str) -> Result<Self> {
        let report: RawReport = serde_json::from_str(json)?;
        Self::from_raw(report)
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let report: RawReport = serde_json::from_reader(reader)?;
        Self::from_raw(report)
    }

    /// Load the memory report at `path`
    #[tracing::instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let table = Self::from_reader(BufReader::new(file))?;
        tracing::debug!(sections = table.len(), "loaded memory report");
        Ok(table)
    }

    fn from_raw(report: RawReport) -> Result<Self> {
        let facts = report
            .sections
            .into_iter()
            .enumerate()
            .map(|(index, raw)| raw.into_fact(index))
            .collect::<Result<Vec<_>>>()?;
        Self::from_facts(facts)
    }

    pub fn get(&self, name: &str) -> Option<&SectionFact> {
        self.facts.get(name)
    }

    /// Look up a section every later stage expects to exist
    pub fn lookup(&self, name: &str) -> Result<&SectionFact> {
        self.get(name)
            .ok_or_else(|| PlacementError::UnknownSection(String::from(name)))
    }

    pub fn size_of(&self, name: &str) -> Result<u64> {
        self.lookup(name).map(|fact| fact.size)
    }

    /// True when the report knows `name` and attributes it to one of `owners`.
    /// Sections missing from the report belong to nobody.
    pub fn owned_by(&self, name: &str, owners: &BTreeSet<String>) -> bool {
        self.get(name)
            .and_then(|fact| fact.owner.as_ref())
            .map_or(false, |owner| owners.contains(owner))
    }

    pub fn len(&self) -> usize {
        self.facts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }
}
