//! The kernel memory map document
//!
//! Regions own ordered domains, domains own ordered output sections. Only
//! the fields the placement engine reasons about are typed; everything else
//! in the document rides along in the `extra` maps and is written back
//! untouched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::report::SectionFactTable;
use crate::{align_up, offset, Address, PlacementError, Result};

/// Type tag of an output section
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SectionKind {
    Const,
    Data,
    Bss,
}

/// Smallest unit laid out by the linker, e.g. `.text_co_runner_flash1`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSection {
    pub name: String,

    /// Pinned address, absent when the linker places the section after
    /// its predecessor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub physical_address: Option<Address>,

    /// Byte alignment of the section start
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alignment: Option<u64>,

    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<SectionKind>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initialization: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl OutputSection {
    pub fn new(name: &str) -> Self {
        OutputSection {
            name: String::from(name),
            physical_address: None,
            alignment: None,
            kind: None,
            initialization: None,
            extra: Map::new(),
        }
    }

    /// Pin the section at `address`
    pub fn at(mut self, address: Address) -> Self {
        self.physical_address = Some(address);
        self
    }

    pub fn aligned(mut self, alignment: u64) -> Self {
        self.alignment = Some(alignment);
        self
    }
}

/// Placement unit, all output sections of a domain move together
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Domain {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,

    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub protection: Value,

    pub output_sections: Vec<OutputSection>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,

    /// Set once the domain left the place the memory report describes
    #[serde(skip)]
    relocated: bool,
}

impl Domain {
    pub fn new(identifier: Option<&str>, output_sections: Vec<OutputSection>) -> Self {
        Domain {
            identifier: identifier.map(String::from),
            protection: Value::Null,
            output_sections,
            extra: Map::new(),
            relocated: false,
        }
    }

    pub fn section_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.output_sections.iter().map(|section| section.name.as_str())
    }

    /// Address pinned on the first output section
    pub fn pinned_address(&self) -> Option<Address> {
        self.output_sections
            .first()
            .and_then(|section| section.physical_address)
    }

    /// Declared alignment of the first output section
    pub fn alignment(&self) -> Option<u64> {
        self.output_sections
            .first()
            .and_then(|section| section.alignment)
            .filter(|&alignment| alignment > 1)
    }

    /// Sum of the reported sizes of every output section
    pub fn size(&self, facts: &SectionFactTable) -> Result<u64> {
        self.section_names()
            .map(|name| facts.size_of(name))
            .sum::<Result<u64>>()
    }

    /// Name used in logs and errors
    pub fn label(&self) -> &str {
        match self.identifier {
            Some(ref identifier) => identifier.as_str(),
            None => self.section_names().next().unwrap_or("<empty>"),
        }
    }

    pub fn is_relocated(&self) -> bool {
        self.relocated
    }

    pub(crate) fn mark_relocated(&mut self) {
        self.relocated = true;
    }

    pub(crate) fn pin(&mut self, address: Address) {
        if let Some(first) = self.output_sections.first_mut() {
            first.physical_address = Some(address);
        }
    }

    /// Forget every pinned address, they describe a previous placement
    pub(crate) fn unpin(&mut self) {
        for section in self.output_sections.iter_mut() {
            section.physical_address = None;
        }
    }

    /// Start address given the end of the preceding domain, `floor`.
    ///
    /// A pinned domain starts at its pin. An unpinned domain still where the
    /// memory report saw it starts at its reported address, never below
    /// `floor`. A relocated, unpinned domain follows its predecessor.
    pub fn resolve_start(&self, floor: Address, facts: &SectionFactTable) -> Result<Address> {
        if let Some(address) = self.pinned_address() {
            return Ok(address);
        }
        let floor = align_up(floor, self.alignment().unwrap_or(1))?;
        match self.output_sections.first() {
            Some(first) if !self.relocated => Ok(facts.lookup(&first.name)?.address.max(floor)),
            _ => Ok(floor),
        }
    }

    /// Span of every output section when the domain starts at `start`.
    ///
    /// Sections after the first sit at their pin when they have one, else
    /// they follow the previous section at their declared alignment.
    pub fn section_spans(&self, start: Address, facts: &SectionFactTable) -> Result<Vec<Span>> {
        let mut spans = Vec::with_capacity(self.output_sections.len());
        let mut cursor = start;
        for (index, section) in self.output_sections.iter().enumerate() {
            let begin = match section.physical_address {
                _ if index == 0 => start,
                Some(address) => address,
                None => align_up(cursor, section.alignment.unwrap_or(1))?,
            };
            let end = offset(begin, facts.size_of(&section.name)?)?;
            spans.push(Span { start: begin, end });
            cursor = end;
        }
        Ok(spans)
    }

    /// First address past the domain when it starts at `start`
    pub fn end(&self, start: Address, facts: &SectionFactTable) -> Result<Address> {
        let spans = self.section_spans(start, facts)?;
        Ok(spans.iter().fold(start, |end, span| end.max(span.end)))
    }

    /// Carry the pinned sections after the first along with a domain whose
    /// start moved `delta` bytes up to `start`. Each one keeps its distance
    /// to the start where it can, never lands on the section before it and
    /// stays aligned.
    pub(crate) fn carry_pins(
        &mut self,
        start: Address,
        delta: u64,
        facts: &SectionFactTable,
    ) -> Result<()> {
        let mut cursor = start;
        for (index, section) in self.output_sections.iter_mut().enumerate() {
            let alignment = section.alignment.unwrap_or(1);
            let begin = match section.physical_address {
                _ if index == 0 => start,
                Some(address) => {
                    let moved = align_up(offset(address, delta)?.max(cursor), alignment)?;
                    section.physical_address = Some(moved);
                    moved
                }
                None => align_up(cursor, alignment)?,
            };
            cursor = offset(begin, facts.size_of(&section.name)?)?;
        }
        Ok(())
    }
}

/// Resolved `[start, end)` extent of a domain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: Address,
    pub end: Address,
}

impl Span {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Physical memory area holding placed domains
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub name: String,
    pub physical_address: Address,
    pub size: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    domains: Option<Vec<Domain>>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Region {
    pub fn new(name: &str, physical_address: Address, size: u64) -> Self {
        Region {
            name: String::from(name),
            physical_address,
            size,
            domains: None,
            extra: Map::new(),
        }
    }

    pub fn with_domains(mut self, domains: Vec<Domain>) -> Self {
        self.domains = Some(domains);
        self
    }

    /// First address past the region, saturating at the top of the
    /// address space
    pub fn end(&self) -> Address {
        self.physical_address.saturating_add(self.size)
    }

    pub fn contains(&self, address: Address) -> bool {
        address >= self.physical_address && address - self.physical_address < self.size
    }

    pub fn domains(&self) -> &[Domain] {
        self.domains.as_deref().unwrap_or(&[])
    }

    /// Mutable domain list, created empty when the region had none
    pub fn domains_mut(&mut self) -> &mut Vec<Domain> {
        self.domains.get_or_insert_with(Vec::new)
    }

    /// Resolved span of every domain, in list order
    pub fn layout(&self, facts: &SectionFactTable) -> Result<Vec<Span>> {
        let mut spans = Vec::with_capacity(self.domains().len());
        let mut floor = self.physical_address;
        for domain in self.domains() {
            let start = domain
                .resolve_start(floor, facts)
                .map_err(|err| self.attribute_overflow(err))?;
            let end = domain
                .end(start, facts)
                .map_err(|err| self.attribute_overflow(err))?;
            spans.push(Span { start, end });
            floor = end;
        }
        Ok(spans)
    }

    /// Turn an address overflow into an overflow of this region
    pub(crate) fn attribute_overflow(&self, err: PlacementError) -> PlacementError {
        match err {
            PlacementError::AddressOverflow => PlacementError::RegionOverflow {
                region: self.name.clone(),
                end: Address::MAX,
                limit: self.end(),
            },
            err => err,
        }
    }

    /// Check that consecutive domains, and the sections inside each domain,
    /// do not overlap and that the layout stays within the region
    pub fn check_layout(&self, facts: &SectionFactTable) -> Result<()> {
        let spans = self.layout(facts)?;
        let domains = self.domains();
        for (domain, span) in domains.iter().zip(spans.iter()) {
            let sections = domain.section_spans(span.start, facts)?;
            for (index, pair) in sections.windows(2).enumerate() {
                if pair[0].end > pair[1].start {
                    return Err(PlacementError::Overlap {
                        region: self.name.clone(),
                        first: domain.output_sections[index].name.clone(),
                        second: domain.output_sections[index + 1].name.clone(),
                    });
                }
            }
        }
        for (index, pair) in spans.windows(2).enumerate() {
            if pair[0].end > pair[1].start {
                return Err(PlacementError::Overlap {
                    region: self.name.clone(),
                    first: String::from(domains[index].label()),
                    second: String::from(domains[index + 1].label()),
                });
            }
        }
        if let Some(first) = spans.first() {
            if first.start < self.physical_address {
                return Err(PlacementError::AddressOutsideRegion {
                    region: self.name.clone(),
                    address: first.start,
                });
            }
        }
        if let Some(last) = spans.last() {
            if last.end > self.end() {
                return Err(PlacementError::RegionOverflow {
                    region: self.name.clone(),
                    end: last.end,
                    limit: self.end(),
                });
            }
        }
        Ok(())
    }
}

/// Memory map fragment generated for a co-runner
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Fragment {
    #[serde(default)]
    pub domains: Vec<Domain>,
    #[serde(default)]
    pub groups: Vec<Value>,
    #[serde(default)]
    pub objects: Vec<Value>,
}

impl Fragment {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }
}

/// Whole memory map, `{"kmemory": {"regions": [...], ...}}` on disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryMapDocument {
    pub regions: Vec<Region>,

    /// `groups`, `objects` and the rest of the `kmemory` object
    #[serde(flatten)]
    pub extra: Map<String, Value>,

    /// Keys next to `kmemory` at the top of the file
    #[serde(skip)]
    envelope: Map<String, Value>,
}

#[derive(Deserialize)]
struct Envelope {
    kmemory: MemoryMapDocument,
    #[serde(flatten)]
    rest: Map<String, Value>,
}

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    kmemory: &'a MemoryMapDocument,
    #[serde(flatten)]
    rest: &'a Map<String, Value>,
}

impl MemoryMapDocument {
    pub fn new(regions: Vec<Region>) -> Self {
        MemoryMapDocument {
            regions,
            extra: Map::new(),
            envelope: Map::new(),
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let envelope: Envelope = serde_json::from_str(json)?;
        Ok(Self::from_envelope(envelope))
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let envelope: Envelope = serde_json::from_reader(reader)?;
        Ok(Self::from_envelope(envelope))
    }

    /// Load the memory map at `path`
    #[tracing::instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let document = Self::from_reader(BufReader::new(file))?;
        tracing::debug!(regions = document.regions.len(), "loaded memory map");
        Ok(document)
    }

    fn from_envelope(envelope: Envelope) -> Self {
        let mut document = envelope.kmemory;
        document.envelope = envelope.rest;
        document
    }

    /// Write the document as indented JSON into `out`
    pub fn write<Wr: Write>(&self, out: &mut Wr) -> Result<()> {
        let envelope = EnvelopeRef {
            kmemory: self,
            rest: &self.envelope,
        };
        serde_json::to_writer_pretty(&mut *out, &envelope)?;
        writeln!(out)?;
        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        let mut out = Vec::new();
        self.write(&mut out)?;
        String::from_utf8(out).map_err(|err| {
            PlacementError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, err))
        })
    }

    /// Write the document to `path`, replacing it if it exists
    #[tracing::instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut out = BufWriter::new(File::create(path.as_ref())?);
        self.write(&mut out)?;
        out.flush()?;
        Ok(())
    }

    pub fn region(&self, name: &str) -> Option<&Region> {
        self.regions.iter().find(|region| region.name == name)
    }

    pub fn region_mut(&mut self, name: &str) -> Option<&mut Region> {
        self.regions.iter_mut().find(|region| region.name == name)
    }

    /// Check the layout of every region
    pub fn check_layout(&self, facts: &SectionFactTable) -> Result<()> {
        for region in self.regions.iter() {
            region.check_layout(facts)?;
        }
        Ok(())
    }

    /// Merge a co-runner fragment into the largest region.
    ///
    /// Fragment domains go after the region's domains. When the region had
    /// none, the first merged section is pinned at the region start. The
    /// fragment's groups and objects are appended to the map's own lists.
    #[tracing::instrument(skip_all)]
    pub fn merge_fragment(&mut self, fragment: Fragment) -> Result<()> {
        let mut largest: Option<&mut Region> = None;
        for region in self.regions.iter_mut() {
            let bigger = largest.as_ref().map_or(true, |current| region.size > current.size);
            if bigger {
                largest = Some(region);
            }
        }
        let region = largest.ok_or(PlacementError::NoRegions)?;

        let base = region.physical_address;
        let was_empty = region.domains().is_empty();
        let count = fragment.domains.len();
        let domains = region.domains_mut();
        domains.extend(fragment.domains);
        if was_empty {
            if let Some(first) = domains.first_mut() {
                first.pin(base);
            }
        }
        tracing::info!(region = %region.name, domains = count, "merged fragment");

        self.append_list("groups", fragment.groups)?;
        self.append_list("objects", fragment.objects)?;
        Ok(())
    }

    fn append_list(&mut self, key: &str, values: Vec<Value>) -> Result<()> {
        if values.is_empty() {
            return Ok(());
        }
        match self
            .extra
            .entry(key)
            .or_insert_with(|| Value::Array(Vec::new()))
        {
            Value::Array(list) => {
                list.extend(values);
                Ok(())
            }
            _ => Err(PlacementError::NotAList(String::from(key))),
        }
    }

    /// Point the `core_N_co_runner_stack.c` object of every core running a
    /// co-runner at that co-runner's `.stack_` section. A co-runner runs on
    /// the core named by the trailing digit of its name.
    #[tracing::instrument(skip_all)]
    pub fn bind_corunner_stacks(&mut self, corunners: &[String]) -> Result<()> {
        let objects = match self.extra.get_mut("objects") {
            Some(Value::Array(objects)) => objects,
            Some(_) => return Err(PlacementError::NotAList(String::from("objects"))),
            None => return Ok(()),
        };
        for corunner in corunners {
            let core = match corunner.chars().last().filter(char::is_ascii_digit) {
                Some(core) => core,
                None => {
                    tracing::warn!(corunner = %corunner, "co-runner name carries no core number");
                    continue;
                }
            };
            let id = format!("core_{}_co_runner_stack.c", core);
            let stack = objects
                .iter_mut()
                .find(|object| object.get("id").and_then(Value::as_str) == Some(id.as_str()));
            match stack {
                Some(Value::Object(object)) => {
                    let group = Value::String(format!(".stack_{}", corunner));
                    object.insert(String::from("groups"), Value::Array(vec![group]));
                    tracing::debug!(object = %id, corunner = %corunner, "bound stack");
                }
                _ => tracing::warn!(object = %id, "no stack object for this core"),
            }
        }
        Ok(())
    }
}
