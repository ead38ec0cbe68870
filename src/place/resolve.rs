use crate::map::{MemoryMapDocument, Region};
use crate::policy::Target;
use crate::{Address, PlacementError, Result};

fn index_by_address(document: &MemoryMapDocument, address: Address) -> Result<usize> {
    document
        .regions
        .iter()
        .position(|region| region.contains(address))
        .ok_or(PlacementError::UnresolvedAddress(address))
}

/// Find the region whose `[physical_address, physical_address + size)`
/// range contains `address`
pub fn resolve_by_address(document: &MemoryMapDocument, address: Address) -> Result<&Region> {
    let index = index_by_address(document, address)?;
    Ok(&document.regions[index])
}

/// Region a rule target designates. A named region wins over address
/// resolution, the address must then lie inside it.
pub fn resolve_target<'a>(
    document: &'a mut MemoryMapDocument,
    target: &Target,
) -> Result<&'a mut Region> {
    match *target {
        Target::Address(address) => {
            let index = index_by_address(document, address)?;
            Ok(&mut document.regions[index])
        }
        Target::Region(ref name) => document
            .region_mut(name)
            .ok_or_else(|| PlacementError::UnknownRegion(name.clone())),
        Target::RegionAt {
            ref region,
            address,
        } => {
            let found = document
                .region_mut(region)
                .ok_or_else(|| PlacementError::UnknownRegion(region.clone()))?;
            if !found.contains(address) {
                return Err(PlacementError::AddressOutsideRegion {
                    region: region.clone(),
                    address,
                });
            }
            Ok(found)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn document() -> MemoryMapDocument {
        MemoryMapDocument::new(vec![
            Region::new("flash", 0x0000_0000, 0x0010_0000),
            Region::new("sram", 0x4000_0000, 0x0008_0000),
        ])
    }

    #[test]
    fn resolves_enclosing_region() {
        let doc = document();
        assert_eq!(resolve_by_address(&doc, 0x0).unwrap().name, "flash");
        assert_eq!(resolve_by_address(&doc, 0x000f_ffff).unwrap().name, "flash");
        assert_eq!(resolve_by_address(&doc, 0x4000_1000).unwrap().name, "sram");
    }

    #[test]
    fn region_end_is_exclusive() {
        let doc = document();
        match resolve_by_address(&doc, 0x0010_0000) {
            Err(PlacementError::UnresolvedAddress(address)) => assert_eq!(address, 0x0010_0000),
            result => panic!("Expected unresolved address, but got {:?}", result),
        }
    }

    #[test]
    fn named_region_skips_resolution() {
        let mut doc = document();
        let target = Target::Region(String::from("sram"));
        assert_eq!(resolve_target(&mut doc, &target).unwrap().name, "sram");

        let target = Target::Address(0x10);
        assert_eq!(resolve_target(&mut doc, &target).unwrap().name, "flash");
    }

    #[test]
    fn rejects_unknown_region() {
        let mut doc = document();
        let target = Target::Region(String::from("dtcm"));
        match resolve_target(&mut doc, &target) {
            Err(PlacementError::UnknownRegion(name)) => assert_eq!(name, "dtcm"),
            result => panic!("Expected unknown region, but got {:?}", result),
        }
    }

    #[test]
    fn rejects_address_outside_named_region() {
        let mut doc = document();
        let target = Target::RegionAt {
            region: String::from("flash"),
            address: 0x4000_0000,
        };
        match resolve_target(&mut doc, &target) {
            Err(PlacementError::AddressOutsideRegion { region, address }) => {
                assert_eq!(region, "flash");
                assert_eq!(address, 0x4000_0000);
            }
            result => panic!("Expected address outside region, but got {:?}", result),
        }
    }
}
