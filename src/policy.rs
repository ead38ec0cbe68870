//! Placement policy
//!
//! The policy is the placement configuration file: an ordered list of
//! elements, one per task or co-runner, each with rules saying where the
//! owner's sections of a given type must go. Element order matters, later
//! elements are placed against the map left by earlier ones.

use serde::Deserialize;
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use crate::{Address, PlacementError, Result};

/// Where a rule sends the domains it accepts
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Append to the named region
    Region(String),

    /// Place at an address, in whichever region contains it
    Address(Address),

    /// Place at an address inside the named region
    RegionAt { region: String, address: Address },
}

impl Target {
    pub fn region(&self) -> Option<&str> {
        match *self {
            Target::Region(ref region) | Target::RegionAt { ref region, .. } => {
                Some(region.as_str())
            }
            Target::Address(_) => None,
        }
    }

    pub fn address(&self) -> Option<Address> {
        match *self {
            Target::Address(address) | Target::RegionAt { address, .. } => Some(address),
            Target::Region(_) => None,
        }
    }
}

/// One `sections` entry of a policy element
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementRule {
    /// Memory report section types this rule moves
    pub accepted_types: BTreeSet<String>,
    pub target: Target,
}

impl PlacementRule {
    pub fn accepts(&self, kind: &str) -> bool {
        self.accepted_types.contains(kind)
    }
}

/// Owners and rules shared by both kinds of element
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementRules {
    pub names: BTreeSet<String>,
    pub rules: Vec<PlacementRule>,
}

/// A policy element, matched against the memory map differently per kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyElement {
    /// Matches domains holding a section the memory report attributes to
    /// one of the task names
    Task(ElementRules),

    /// Matches domains whose identifier is one of the co-runner names
    Corunner(ElementRules),
}

impl PolicyElement {
    pub fn body(&self) -> &ElementRules {
        match *self {
            PolicyElement::Task(ref body) | PolicyElement::Corunner(ref body) => body,
        }
    }

    pub fn body_mut(&mut self) -> &mut ElementRules {
        match *self {
            PolicyElement::Task(ref mut body) | PolicyElement::Corunner(ref mut body) => body,
        }
    }

    pub fn names(&self) -> &BTreeSet<String> {
        &self.body().names
    }

    pub fn rules(&self) -> &[PlacementRule] {
        &self.body().rules
    }

    pub fn kind(&self) -> &'static str {
        match *self {
            PolicyElement::Task(_) => "task",
            PolicyElement::Corunner(_) => "corunner",
        }
    }
}

/// Parsed and validated placement configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlacementPolicy {
    pub elements: Vec<PolicyElement>,

    /// Memory report, unless given on the command line
    pub memreport: Option<PathBuf>,

    /// Default memory map, unless given on the command line
    pub default_kmemory: Option<PathBuf>,

    /// Output memory map, defaults to overwriting the default one
    pub out_kmemory: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct RawPolicy {
    elements: Vec<RawElement>,
    memreport: Option<PathBuf>,
    default_kmemory: Option<PathBuf>,
    out_kmemory: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum RawElement {
    Task(RawElementBody),
    Corunner(RawElementBody),
}

#[derive(Debug, Deserialize)]
struct RawElementBody {
    #[serde(default)]
    names: Vec<String>,
    #[serde(default)]
    sections: Vec<RawRule>,
}

#[derive(Debug, Deserialize)]
struct RawRule {
    #[serde(default)]
    names: Vec<String>,
    region: Option<String>,
    address: Option<Address>,
}

impl RawRule {
    fn validate(self, element: usize, rule: usize) -> Result<PlacementRule> {
        let target = match (self.region, self.address) {
            (Some(region), Some(address)) => Target::RegionAt { region, address },
            (Some(region), None) => Target::Region(region),
            (None, Some(address)) => Target::Address(address),
            (None, None) => return Err(PlacementError::PlacementRuleValidation { element, rule }),
        };
        Ok(PlacementRule {
            accepted_types: self.names.into_iter().collect(),
            target,
        })
    }
}

impl RawElementBody {
    fn validate(self, element: usize) -> Result<ElementRules> {
        let rules = self
            .sections
            .into_iter()
            .enumerate()
            .map(|(rule, raw)| raw.validate(element, rule))
            .collect::<Result<Vec<_>>>()?;
        Ok(ElementRules {
            names: self.names.into_iter().collect(),
            rules,
        })
    }
}

impl PlacementPolicy {
    pub fn new(elements: Vec<PolicyElement>) -> Self {
        PlacementPolicy {
            elements,
            ..PlacementPolicy::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let raw: RawPolicy = serde_json::from_str(json)?;
        Self::from_raw(raw)
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let raw: RawPolicy = serde_json::from_reader(reader)?;
        Self::from_raw(raw)
    }

    /// Load and validate the placement configuration at `path`
    #[tracing::instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let policy = Self::from_reader(BufReader::new(file))?;
        tracing::debug!(elements = policy.elements.len(), "loaded placement policy");
        Ok(policy)
    }

    fn from_raw(raw: RawPolicy) -> Result<Self> {
        let elements = raw
            .elements
            .into_iter()
            .enumerate()
            .map(|(index, element)| match element {
                RawElement::Task(body) => body.validate(index).map(PolicyElement::Task),
                RawElement::Corunner(body) => body.validate(index).map(PolicyElement::Corunner),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(PlacementPolicy {
            elements,
            memreport: raw.memreport,
            default_kmemory: raw.default_kmemory,
            out_kmemory: raw.out_kmemory,
        })
    }

    /// Bind the policy to the owners of one build.
    ///
    /// Task elements take `tasks` as their names and co-runner elements take
    /// `corunners`. Co-runner elements are dropped when the build has no
    /// co-runner.
    pub fn bind_owners(&mut self, tasks: &[String], corunners: &[String]) {
        self.elements.retain(|element| match *element {
            PolicyElement::Corunner(_) => !corunners.is_empty(),
            PolicyElement::Task(_) => true,
        });
        for element in self.elements.iter_mut() {
            let names = match *element {
                PolicyElement::Task(_) => tasks,
                PolicyElement::Corunner(_) => corunners,
            };
            element.body_mut().names = names.iter().cloned().collect();
        }
    }
}
