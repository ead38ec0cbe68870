use std::collections::BTreeSet;

use crate::map::{Domain, MemoryMapDocument};
use crate::policy::{PlacementRule, PolicyElement};
use crate::report::SectionFactTable;
use crate::Result;

/// A domain detached from the memory map, waiting to be placed again
#[derive(Debug, Clone)]
pub struct Extracted {
    pub domain: Domain,

    /// Names of the domain's sections that made it match
    pub matched: BTreeSet<String>,

    /// Region the domain was taken from
    pub origin: String,
}

impl Extracted {
    pub fn accepted_by(&self, rule: &PlacementRule, facts: &SectionFactTable) -> Result<bool> {
        accepts(rule, &self.matched, facts)
    }
}

/// True when one of the `matched` sections has a type `rule` moves
fn accepts(
    rule: &PlacementRule,
    matched: &BTreeSet<String>,
    facts: &SectionFactTable,
) -> Result<bool> {
    for name in matched.iter() {
        if rule.accepts(&facts.lookup(name)?.kind) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Sections through which `domain` belongs to the element's owners
fn owned_sections(
    domain: &Domain,
    element: &PolicyElement,
    facts: &SectionFactTable,
) -> BTreeSet<String> {
    match *element {
        PolicyElement::Corunner(ref body) => match domain.identifier {
            Some(ref identifier) if body.names.contains(identifier) => {
                domain.section_names().map(String::from).collect()
            }
            _ => BTreeSet::new(),
        },
        PolicyElement::Task(ref body) => domain
            .section_names()
            .filter(|name| facts.owned_by(name, &body.names))
            .map(String::from)
            .collect(),
    }
}

/// Detach every domain of `element`'s owners that one of its rules accepts.
///
/// Co-runner domains match on their identifier, task domains when any of
/// their sections is attributed to the task by the memory report. A domain
/// moves as a whole. Domains are returned in document order, and an element
/// matching nothing yields an empty list. The document is only modified
/// once every domain has been examined.
#[tracing::instrument(skip_all, fields(kind = element.kind()))]
pub fn extract(
    document: &mut MemoryMapDocument,
    facts: &SectionFactTable,
    element: &PolicyElement,
) -> Result<Vec<Extracted>> {
    let mut found = Vec::new();
    for (region_index, region) in document.regions.iter().enumerate() {
        for (domain_index, domain) in region.domains().iter().enumerate() {
            let matched = owned_sections(domain, element, facts);
            if matched.is_empty() {
                continue;
            }
            let mut accepted = false;
            for rule in element.rules() {
                if accepts(rule, &matched, facts)? {
                    accepted = true;
                    break;
                }
            }
            if accepted {
                found.push((region_index, domain_index, matched));
            } else {
                tracing::warn!(
                    domain = domain.label(),
                    region = %region.name,
                    "no rule accepts the section types of this domain, leaving it in place"
                );
            }
        }
    }

    // Back to front so earlier indices stay valid.
    let mut extracted = Vec::with_capacity(found.len());
    for (region_index, domain_index, matched) in found.into_iter().rev() {
        let region = &mut document.regions[region_index];
        let mut domain = region.domains_mut().remove(domain_index);
        domain.mark_relocated();
        tracing::debug!(domain = domain.label(), region = %region.name, "extracted");
        extracted.push(Extracted {
            domain,
            matched,
            origin: region.name.clone(),
        });
    }
    extracted.reverse();
    Ok(extracted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::{OutputSection, Region};
    use crate::policy::{ElementRules, Target};
    use crate::report::SectionFact;
    use crate::PlacementError;

    fn fact(name: &str, kind: &str, owner: Option<&str>) -> SectionFact {
        SectionFact {
            name: String::from(name),
            size: 0x10,
            address: 0,
            kind: String::from(kind),
            owner: owner.map(String::from),
        }
    }

    fn facts() -> SectionFactTable {
        SectionFactTable::from_facts(vec![
            fact(".text_task_G", "TEXT", Some("task_G")),
            fact(".data_task_G", "DATA", Some("task_G")),
            fact(".text_task_H", "TEXT", Some("task_H")),
            fact(".shared", "DATA", None),
            fact(".text_co_runner_flash1", "TEXT", None),
            fact(".data_co_runner_flash1", "DATA", None),
        ])
        .unwrap()
    }

    fn document() -> MemoryMapDocument {
        MemoryMapDocument::new(vec![
            Region::new("flash", 0x0, 0x10000).with_domains(vec![
                Domain::new(Some("task_G_text"), vec![OutputSection::new(".text_task_G")]),
                Domain::new(Some("task_H_text"), vec![OutputSection::new(".text_task_H")]),
                Domain::new(
                    Some("co_runner_flash1"),
                    vec![OutputSection::new(".text_co_runner_flash1")],
                ),
            ]),
            Region::new("sram", 0x4000_0000, 0x10000).with_domains(vec![
                Domain::new(
                    None,
                    vec![OutputSection::new(".shared"), OutputSection::new(".data_task_G")],
                ),
                Domain::new(
                    Some("co_runner_flash1"),
                    vec![OutputSection::new(".data_co_runner_flash1")],
                ),
            ]),
            Region::new("dtcm", 0x5000_0000, 0x1000),
        ])
    }

    fn rule(types: &[&str]) -> PlacementRule {
        PlacementRule {
            accepted_types: types.iter().map(|kind| String::from(*kind)).collect(),
            target: Target::Region(String::from("dtcm")),
        }
    }

    fn body(names: &[&str], rules: Vec<PlacementRule>) -> ElementRules {
        ElementRules {
            names: names.iter().map(|name| String::from(*name)).collect(),
            rules,
        }
    }

    fn labels(extracted: &[Extracted]) -> Vec<&str> {
        extracted.iter().map(|e| e.domain.label()).collect()
    }

    #[test]
    fn corunner_matches_identifier() {
        let mut doc = document();
        let element =
            PolicyElement::Corunner(body(&["co_runner_flash1"], vec![rule(&["TEXT", "DATA"])]));
        let extracted = extract(&mut doc, &facts(), &element).unwrap();

        assert_eq!(labels(&extracted), vec!["co_runner_flash1", "co_runner_flash1"]);
        assert_eq!(extracted[0].origin, "flash");
        assert_eq!(extracted[1].origin, "sram");
        assert!(extracted.iter().all(|e| e.domain.is_relocated()));
        assert_eq!(doc.region("flash").unwrap().domains().len(), 2);
        assert_eq!(doc.region("sram").unwrap().domains().len(), 1);
    }

    #[test]
    fn task_matches_whole_domain_through_report_owner() {
        let mut doc = document();
        let element = PolicyElement::Task(body(&["task_G"], vec![rule(&["TEXT", "DATA"])]));
        let extracted = extract(&mut doc, &facts(), &element).unwrap();

        assert_eq!(extracted.len(), 2);
        assert_eq!(extracted[0].domain.label(), "task_G_text");
        // The shared section is not split out of the task's data domain
        let data = &extracted[1];
        assert_eq!(data.domain.output_sections.len(), 2);
        assert_eq!(data.matched.len(), 1);
        assert!(data.matched.contains(".data_task_G"));

        let flash = doc.region("flash").unwrap();
        assert_eq!(flash.domains()[0].label(), "task_H_text");
        assert_eq!(doc.region("sram").unwrap().domains().len(), 1);
    }

    #[test]
    fn rules_limit_extraction_by_type() {
        let mut doc = document();
        let element = PolicyElement::Task(body(&["task_G"], vec![rule(&["TEXT"])]));
        let extracted = extract(&mut doc, &facts(), &element).unwrap();
        assert_eq!(labels(&extracted), vec!["task_G_text"]);
        assert_eq!(doc.region("sram").unwrap().domains().len(), 2);
    }

    #[test]
    fn unmatched_owner_extracts_nothing() {
        let mut doc = document();
        let before = doc.clone();
        let element = PolicyElement::Corunner(body(&["co_runner_read9"], vec![rule(&["TEXT"])]));
        let extracted = extract(&mut doc, &facts(), &element).unwrap();
        assert!(extracted.is_empty());
        assert_eq!(doc, before);
    }

    #[test]
    fn corunner_section_missing_from_report_fails() {
        let mut doc = document();
        doc.region_mut("dtcm").unwrap().domains_mut().push(Domain::new(
            Some("co_runner_flash1"),
            vec![OutputSection::new(".stack_co_runner_flash1")],
        ));
        let before = doc.clone();
        let element = PolicyElement::Corunner(body(&["co_runner_flash1"], vec![rule(&["TEXT"])]));
        match extract(&mut doc, &facts(), &element) {
            Err(PlacementError::UnknownSection(name)) => {
                assert_eq!(name, ".stack_co_runner_flash1")
            }
            result => panic!("Expected unknown section, but got {:?}", result),
        }
        assert_eq!(doc, before);
    }
}
