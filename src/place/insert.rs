use crate::map::{Domain, Region, Span};
use crate::report::SectionFactTable;
use crate::{align_up, offset, Address, PlacementError, Result, PAGE_ALIGNMENT};

/// Insert `domains` into `region`, keeping their order.
///
/// Without an address the domains are appended after everything already in
/// the region and left for the linker to lay out; only a domain landing in
/// an empty region is pinned, at the region start.
///
/// With an address the domains are pinned as one contiguous run starting
/// there. The run goes in front of the first domain ending past the address.
/// If that domain is cut by the run, it is pinned again right after it and
/// the shift cascades to the following domains until one no longer
/// overlaps. Pinned sections inside a shifted domain move along with it.
///
/// The region layout is checked for overlaps and overflow afterwards.
#[tracing::instrument(skip_all, fields(region = %region.name))]
pub fn insert(
    region: &mut Region,
    domains: Vec<Domain>,
    address: Option<Address>,
    facts: &SectionFactTable,
) -> Result<()> {
    if domains.is_empty() {
        return Ok(());
    }
    let placed = match address {
        None => {
            append(region, domains);
            Ok(())
        }
        Some(address) => insert_at(region, domains, address, facts),
    };
    placed
        .and_then(|_| region.check_layout(facts))
        .map_err(|err| region.attribute_overflow(err))
}

fn append(region: &mut Region, domains: Vec<Domain>) {
    let base = region.physical_address;
    let was_empty = region.domains().is_empty();
    let list = region.domains_mut();
    for (index, mut domain) in domains.into_iter().enumerate() {
        domain.unpin();
        domain.mark_relocated();
        if was_empty && index == 0 {
            domain.pin(base);
        }
        tracing::debug!(domain = domain.label(), "appended");
        list.push(domain);
    }
}

fn insert_at(
    region: &mut Region,
    domains: Vec<Domain>,
    address: Address,
    facts: &SectionFactTable,
) -> Result<()> {
    if !region.contains(address) {
        return Err(PlacementError::AddressOutsideRegion {
            region: region.name.clone(),
            address,
        });
    }
    let spans = region.layout(facts)?;
    let bracket = spans.iter().position(|span| address < span.end);

    // Only the head of the run gets the default page alignment, the rest
    // follows contiguously.
    let mut cursor = address;
    let mut run = Vec::with_capacity(domains.len());
    for (index, mut domain) in domains.into_iter().enumerate() {
        let default = if index == 0 { PAGE_ALIGNMENT } else { 1 };
        let start = align_up(cursor, domain.alignment().unwrap_or(default))?;
        domain.unpin();
        domain.mark_relocated();
        domain.pin(start);
        cursor = domain.end(start, facts)?;
        tracing::debug!(
            domain = domain.label(),
            start = format_args!("{:#X}", start),
            "pinned"
        );
        run.push(domain);
    }
    let run_end = cursor;

    let position = bracket.unwrap_or(spans.len());
    let count = run.len();
    let list = region.domains_mut();
    for (at, domain) in run.into_iter().enumerate() {
        list.insert(position + at, domain);
    }

    if let Some(index) = bracket {
        if run_end > spans[index].start {
            tracing::debug!(
                inserted = format_args!("{:#X}", run_end - address),
                "run overlaps the following domains, shifting"
            );
            cascade(list, position + count, run_end, &spans[index..], facts)?;
        }
    }
    Ok(())
}

/// Push the domains from `list[first..]`, whose spans before the insertion
/// were `old`, past `floor`.
///
/// The first one is pinned at `floor`. Each following pinned domain moves by
/// the shift its predecessor received, unpinned ones follow their
/// predecessor on their own. Pinned sections after the first move with
/// their domain. Stops at the first domain that no longer overlaps.
fn cascade(
    list: &mut [Domain],
    first: usize,
    floor: Address,
    old: &[Span],
    facts: &SectionFactTable,
) -> Result<()> {
    let mut prev_end = floor;
    let mut shift = 0;
    for (index, span) in old.iter().enumerate() {
        if span.start >= prev_end {
            break;
        }
        let domain = &mut list[first + index];
        let start = if index == 0 || domain.pinned_address().is_some() {
            let wanted = prev_end.max(offset(span.start, shift)?);
            let start = align_up(wanted, domain.alignment().unwrap_or(PAGE_ALIGNMENT))?;
            domain.pin(start);
            start
        } else {
            domain.resolve_start(prev_end, facts)?
        };
        domain.carry_pins(start, start - span.start, facts)?;
        tracing::debug!(
            domain = domain.label(),
            from = format_args!("{:#X}", span.start),
            to = format_args!("{:#X}", start),
            "shifted"
        );
        shift = start - span.start;
        prev_end = domain.end(start, facts)?;
    }
    Ok(())
}
