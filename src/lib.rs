//! Places the memory domains of tasks and co-runners into a kernel
//! memory map ("kmemory") that has already been linked once.
//!
//! A placement pass reads three inputs:
//! * the default memory map, regions holding ordered domains of output sections
//! * the memory report, the true size, address and owner of every section
//!   after the first compilation
//! * a placement policy naming which owners' sections go to which region
//!   or address
//!
//! and rewrites the memory map so the next compilation links the selected
//! domains where the policy wants them, without overlapping any domain
//! already placed.

use thiserror::Error;

pub mod map;
pub mod place;
pub mod policy;
pub mod report;

pub use map::{Domain, MemoryMapDocument, OutputSection, Region, SectionKind, Span};
pub use place::place;
pub use policy::{PlacementPolicy, PlacementRule, PolicyElement, Target};
pub use report::{SectionFact, SectionFactTable};

/// Physical address or size in bytes
pub type Address = u64;

/// Alignment given to the first output section of a freshly placed run
/// of domains when the section declares none
pub const PAGE_ALIGNMENT: u64 = 4096;

/// PlacementError union type
#[derive(Debug, Error)]
pub enum PlacementError {
    #[error("Memory report entry {index} is missing required field {field:?}")]
    MalformedReport { index: usize, field: &'static str },

    #[error("Duplicate section, {0:?} already defined")]
    DuplicateSection(String),

    #[error("Section {0:?} is not in the memory report")]
    UnknownSection(String),

    #[error("Rule {rule} of placement element {element} needs a region or an address")]
    PlacementRuleValidation { element: usize, rule: usize },

    #[error("No region contains address {0:#X}")]
    UnresolvedAddress(Address),

    #[error("Region with name {0:?} is unknown")]
    UnknownRegion(String),

    #[error("Address {address:#X} is outside of region {region:?}")]
    AddressOutsideRegion { region: String, address: Address },

    #[error("Region {region:?} overflows, layout ends at {end:#X} past {limit:#X}")]
    RegionOverflow {
        region: String,
        end: Address,
        limit: Address,
    },

    #[error("Domains {first:?} and {second:?} overlap in region {region:?}")]
    Overlap {
        region: String,
        first: String,
        second: String,
    },

    #[error("Memory map has no regions")]
    NoRegions,

    #[error("Address computation runs past the end of the address space")]
    AddressOverflow,

    #[error("Memory map entry {0:?} is not a list")]
    NotAList(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, PlacementError>;

/// Round `value` up to the next multiple of `alignment`
pub(crate) fn align_up(value: Address, alignment: u64) -> Result<Address> {
    if alignment <= 1 {
        return Ok(value);
    }
    match value % alignment {
        0 => Ok(value),
        rem => offset(value, alignment - rem),
    }
}

/// `base + by`, failing instead of wrapping around
pub(crate) fn offset(base: Address, by: u64) -> Result<Address> {
    base.checked_add(by).ok_or(PlacementError::AddressOverflow)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_multiple() {
        assert_eq!(align_up(0x1000, 4096).unwrap(), 0x1000);
        assert_eq!(align_up(0x1001, 4096).unwrap(), 0x2000);
        assert_eq!(align_up(0x1234, 0x10).unwrap(), 0x1240);
        assert_eq!(align_up(0x1234, 24).unwrap(), 0x1248);
    }

    #[test]
    fn align_up_ignores_trivial_alignment() {
        assert_eq!(align_up(0x1235, 0).unwrap(), 0x1235);
        assert_eq!(align_up(0x1235, 1).unwrap(), 0x1235);
    }

    #[test]
    fn align_up_rejects_wrap_around() {
        match align_up(u64::MAX - 2, 0x10) {
            Err(PlacementError::AddressOverflow) => {}
            result => panic!("Expected address overflow, but got {:?}", result),
        }
        assert_eq!(align_up(u64::MAX - 0xf, 0x10).unwrap(), u64::MAX - 0xf);
        assert!(offset(u64::MAX, 1).is_err());
    }

    #[test]
    fn errors_render_addresses_in_hex() {
        let err = PlacementError::UnresolvedAddress(0x4000_0000);
        assert_eq!(err.to_string(), "No region contains address 0x40000000");
        let err = PlacementError::RegionOverflow {
            region: String::from("flash"),
            end: 0x2100,
            limit: 0x2000,
        };
        assert_eq!(
            err.to_string(),
            "Region \"flash\" overflows, layout ends at 0x2100 past 0x2000"
        );
    }
}
