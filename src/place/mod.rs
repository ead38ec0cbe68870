//! The placement pass
//!
//! For every policy element, in order: detach the owner's domains from the
//! memory map, then hand them to the rules of the element. The first rule
//! accepting a domain decides where it goes, either appended to a region or
//! pinned at an address.

mod extract;
mod insert;
mod resolve;

pub use extract::{extract, Extracted};
pub use insert::insert;
pub use resolve::{resolve_by_address, resolve_target};

use crate::map::MemoryMapDocument;
use crate::policy::{PlacementPolicy, PolicyElement};
use crate::report::SectionFactTable;
use crate::Result;

/// Apply `policy` to `document`.
///
/// Elements are placed strictly in policy order. On error the document is
/// left exactly as it was passed in.
#[tracing::instrument(skip_all, fields(elements = policy.elements.len()))]
pub fn place(
    document: &mut MemoryMapDocument,
    facts: &SectionFactTable,
    policy: &PlacementPolicy,
) -> Result<()> {
    let mut work = document.clone();
    for element in policy.elements.iter() {
        place_element(&mut work, facts, element)?;
    }
    *document = work;
    Ok(())
}

/// Place the domains of a single element
pub fn place_element(
    document: &mut MemoryMapDocument,
    facts: &SectionFactTable,
    element: &PolicyElement,
) -> Result<()> {
    let mut pending = extract(document, facts, element)?;
    if pending.is_empty() {
        tracing::debug!(
            kind = element.kind(),
            names = ?element.names(),
            "nothing to place"
        );
        return Ok(());
    }

    for rule in element.rules() {
        let mut claimed = Vec::new();
        let mut rest = Vec::new();
        for extracted in pending {
            if extracted.accepted_by(rule, facts)? {
                claimed.push(extracted);
            } else {
                rest.push(extracted);
            }
        }
        pending = rest;
        if claimed.is_empty() {
            continue;
        }

        let region = resolve_target(document, &rule.target)?;
        let mut domains = Vec::with_capacity(claimed.len());
        for extracted in claimed {
            tracing::info!(
                kind = element.kind(),
                domain = extracted.domain.label(),
                from = %extracted.origin,
                to = %region.name,
                address = ?rule.target.address(),
                "placing"
            );
            domains.push(extracted.domain);
        }
        insert(region, domains, rule.target.address(), facts)?;
    }
    Ok(())
}
