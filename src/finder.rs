//! The offset finder driver.
//!
//! `OffsetFinder` owns the dump reader, the runtime region model and the
//! finding list. Handlers are registered per search type and invoked by
//! region/target index so they can freely mutate driver state; the driver is
//! the sole writer of regions, targets and findings.

use crate::asm;
use crate::config::{self, AccessType, AnchorType, SearchRegion, SearchType};
use crate::decryptor::Decryptor;
use crate::dump::{DumpProducer, DumpReader, Mode};
use crate::error::{Error, Result};
use crate::matcher;
use crate::pattern::{self, MatchRange};
use crate::resolver;

use iced_x86::{Instruction, Mnemonic};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// A value extracted by a search handler.
#[derive(Clone, Debug, Serialize)]
pub enum FoundValue {
    U32(u32),
    U64(u64),
    Decryptor32(Decryptor<u32>),
    Decryptor64(Decryptor<u64>),
}

impl FoundValue {
    /// The scalar form, when the finding is a plain value.
    pub fn scalar(&self) -> Option<u64> {
        match self {
            FoundValue::U32(v) => Some(*v as u64),
            FoundValue::U64(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for FoundValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FoundValue::U32(v) => write!(f, "0x{:X}", v),
            FoundValue::U64(v) => write!(f, "0x{:X}", v),
            FoundValue::Decryptor32(d) => write!(f, "{}", d),
            FoundValue::Decryptor64(d) => write!(f, "{}", d),
        }
    }
}

/// One discovered offset: the configured target that produced it plus the
/// extracted value.
#[derive(Clone, Debug, Serialize)]
pub struct Finding {
    pub target: config::SearchTarget,
    pub value: FoundValue,
}

/// Pre-hook run for every `Normal` region before its targets are handled.
pub type RegionHandlerFn = fn(&mut OffsetFinder, usize) -> bool;

/// Per-search-type handler, dispatched by (region index, target index).
pub type SearchHandlerFn = fn(&mut OffsetFinder, usize, usize) -> bool;

/// External printer: findings, layout file, output file, profile name.
pub type PrintHandlerFn = fn(&[Finding], &Path, &Path, &str) -> Result<()>;

/// Drives one or more search passes over an analyzed dump.
pub struct OffsetFinder {
    reader: DumpReader,
    regions: Vec<SearchRegion>,
    findings: Vec<Finding>,
    document: Option<Value>,
    config_path: Option<PathBuf>,
    sync_enabled: bool,
    region_handler: Option<RegionHandlerFn>,
    search_handlers: HashMap<SearchType, SearchHandlerFn>,
    visited: HashSet<String>,
}

impl OffsetFinder {
    /// Open and analyze a regions-mode dump. Fails when the dump cannot be
    /// opened or carries no usable `.text` section.
    pub fn init(path: impl AsRef<Path>) -> Result<Self> {
        Self::init_with_mode(path, Mode::Regions)
    }

    /// Open and analyze a dump in an explicit layout mode.
    pub fn init_with_mode(path: impl AsRef<Path>, mode: Mode) -> Result<Self> {
        let path = path.as_ref();
        info!("opening memory dump: {}", path.display());

        let mut reader = DumpReader::open(path)?;
        reader.analyze(mode)?;

        if reader.section(".text").is_none() {
            warn!("text section missing or unreadable");
            return Err(Error::SectionNotFound {
                name: ".text".into(),
            });
        }

        Ok(Self {
            reader,
            regions: Vec::new(),
            findings: Vec::new(),
            document: None,
            config_path: None,
            sync_enabled: false,
            region_handler: None,
            search_handlers: HashMap::new(),
            visited: HashSet::new(),
        })
    }

    /// Drive an external dump producer against a live process, then open
    /// the file it wrote.
    pub fn init_from_pid(
        producer: &mut dyn DumpProducer,
        pid: u32,
        path: impl AsRef<Path>,
    ) -> Result<Self> {
        let path = path.as_ref();
        info!("attaching to target process (pid: {})", pid);

        producer.attach(pid)?;
        let regions_dumped = producer.dump(path, Mode::Regions)?;

        if regions_dumped == 0 {
            return Err(Error::Producer("no memory regions were dumped".into()));
        }

        info!(
            "dumped {} memory regions to {}",
            regions_dumped,
            path.display()
        );
        Self::init(path)
    }

    /// Register the pre-hook run for every `Normal` region.
    pub fn use_region_handler(&mut self, handler: RegionHandlerFn) {
        self.region_handler = Some(handler);
    }

    /// Register per-search-type handlers. Declare these before `find`.
    pub fn use_search_handlers(
        &mut self,
        handlers: impl IntoIterator<Item = (SearchType, SearchHandlerFn)>,
    ) {
        self.search_handlers.extend(handlers);
    }

    /// Load a configuration file and execute one find pass over it.
    pub fn find_config_file(&mut self, path: impl AsRef<Path>, sync: bool) -> Result<()> {
        let path = path.as_ref();
        info!("reading search configuration: {}", path.display());

        let document = config::load_document(path)?;
        self.regions = config::regions_from_document(&document);
        self.document = Some(document);
        self.config_path = Some(path.to_path_buf());

        self.find(sync);
        Ok(())
    }

    /// Execute one find pass over an already-loaded region list.
    pub fn find_regions(&mut self, regions: Vec<SearchRegion>, sync: bool) {
        self.regions = regions;
        self.find(sync);
    }

    fn find(&mut self, sync: bool) {
        self.sync_enabled = sync;
        self.visited.clear();
        self.findings.clear();

        for index in 0..self.regions.len() {
            // The main loop directly handles only Normal regions;
            // XReference regions are entered through their referencing
            // target.
            if self.regions[index].access_type != AccessType::Normal {
                continue;
            }

            let Some(region_handler) = self.region_handler else {
                warn!(
                    "no region handler registered; skipping region '{}'",
                    self.regions[index].region_id
                );
                continue;
            };

            if !region_handler(self, index) {
                continue;
            }

            self.handle_search_targets(index);
        }
    }

    /// Dispatch every unhandled target of a region to its registered
    /// handler. A failed handler logs and the pass continues.
    pub fn handle_search_targets(&mut self, region_index: usize) {
        for target_index in 0..self.regions[region_index].search_for.len() {
            let target = &self.regions[region_index].search_for[target_index];

            if target.handled {
                continue;
            }

            let search_type = target.search_type;
            let search_id = target.search_id.clone();

            let Some(handler) = self.search_handlers.get(&search_type).copied() else {
                warn!(
                    "no handler registered for search type {:?} (id: {})",
                    search_type, search_id
                );
                continue;
            };

            if !handler(self, region_index, target_index) {
                debug!("search target failed (id: {})", search_id);
            }
        }
    }

    /// Resolve a `Function` region's base: find the function whose body
    /// contains every declared anchor, verified against the function set's
    /// boundaries. On success the region's range offset is updated.
    pub fn set_function_base(&mut self, region_index: usize) -> Option<u64> {
        let region = &self.regions[region_index];
        let region_id = region.region_id.clone();
        info!("resolving function base (id: {})", region_id);

        if region.anchors.is_empty() {
            warn!("region '{}' declares no anchors", region_id);
            return None;
        }

        let function_size = region.region_range.size + region.region_range.size_variation;
        if function_size == 0 {
            warn!("region '{}' has no size to scan", region_id);
            return None;
        }

        let anchors = region.anchors.clone();

        // String anchors are resolved in .rdata up front; the candidate
        // loop then looks for instructions referencing those offsets.
        let mut string_offsets: HashMap<usize, u64> = HashMap::new();

        for (i, anchor) in anchors.iter().enumerate() {
            if anchor.kind != AnchorType::String {
                continue;
            }

            let Some(text) = anchor.value.text() else {
                warn!("string anchor in '{}' has a non-string value", region_id);
                return None;
            };

            let wanted = anchor.index as usize;
            let Some(matches) = self.reader.find_string_utf16(text, wanted + 1) else {
                warn!("no matches for string anchor '{}' in .rdata", text);
                return None;
            };

            let Some(&offset) = matches.get(wanted) else {
                warn!(
                    "string anchor '{}' has no occurrence with index {}",
                    text, wanted
                );
                return None;
            };

            string_offsets.insert(i, offset);
        }

        let lea_filter =
            |instr: &Instruction| instr.mnemonic() == Mnemonic::Lea && instr.op_count() >= 2;

        let functions: Vec<u64> = self.reader.functions().iter().copied().collect();

        for (position, &candidate) in functions.iter().enumerate() {
            let mut anchor_offsets = Vec::with_capacity(anchors.len());

            for (i, anchor) in anchors.iter().enumerate() {
                let found = match anchor.kind {
                    AnchorType::String => resolver::find_rip_relative_reference(
                        &self.reader,
                        candidate,
                        function_size,
                        string_offsets[&i],
                        Some(&lea_filter),
                    )
                    .map(|e| e.range.offset),
                    AnchorType::Pattern => anchor.value.text().and_then(|text| {
                        pattern::find_pattern_in_range(
                            &self.reader,
                            candidate,
                            function_size,
                            text,
                        )
                        .map(|r| r.offset)
                    }),
                    AnchorType::PatternSubsequence => pattern::find_pattern_subsequence(
                        &self.reader,
                        candidate,
                        function_size,
                        &anchor.value.texts(),
                    )
                    .map(|m| m.coverage.offset),
                    AnchorType::InstructionSubsequence => {
                        let mut templates = Vec::new();

                        for line in anchor.value.texts() {
                            match asm::parse_instruction(&line) {
                                Some(template) => templates.push(template),
                                None => {
                                    // A malformed instruction needs fixing in
                                    // the configuration, not another candidate.
                                    warn!("failed to parse anchor instruction '{}'", line);
                                    return None;
                                }
                            }
                        }

                        matcher::find_instruction_subsequence(
                            &self.reader,
                            candidate,
                            function_size,
                            &templates,
                        )
                        .map(|m| m.coverage.offset)
                    }
                };

                match found {
                    Some(offset) => anchor_offsets.push(offset),
                    None => break,
                }
            }

            if anchor_offsets.len() != anchors.len() {
                continue;
            }

            // Boundary verification: every anchor must lie strictly between
            // this candidate and the next function in the set.
            let Some(&next) = functions.get(position + 1) else {
                continue;
            };

            if anchor_offsets
                .iter()
                .all(|&offset| offset > candidate && offset < next)
            {
                debug!(
                    "anchors verified inside [0x{:X}, 0x{:X})",
                    candidate, next
                );

                self.regions[region_index].region_range.offset = candidate;
                info!("function base set (id: {}): 0x{:X}", region_id, candidate);
                return Some(candidate);
            }
        }

        warn!("failed to resolve function base (id: {})", region_id);
        None
    }

    /// Record that a region is being processed in this pass. Returns false
    /// when the region was already visited, which a cross-reference handler
    /// must treat as a refusal to recurse.
    pub fn enter_region(&mut self, region_id: &str) -> bool {
        self.visited.insert(region_id.to_string())
    }

    /// Rewrite one target's configured search range (region-relative) in
    /// the loaded document. A no-op unless sync was requested.
    pub fn sync_search_range(
        &mut self,
        region_index: usize,
        target_index: usize,
        range: MatchRange,
    ) {
        if !self.sync_enabled {
            return;
        }

        let region_id = self.regions[region_index].region_id.clone();
        let search_id = self.regions[region_index].search_for[target_index]
            .search_id
            .clone();

        if let Some(document) = self.document.as_mut() {
            config::sync_search_range(document, &region_id, &search_id, range);
        }
    }

    /// Write the updated configuration back to its file. Recommended after
    /// `find` so the configured ranges follow binary updates.
    pub fn sync_search_config(&self) -> Result<bool> {
        if !self.sync_enabled {
            return Ok(false);
        }

        let (Some(document), Some(path)) = (&self.document, &self.config_path) else {
            return Ok(false);
        };

        fs::write(path, serde_json::to_string_pretty(document)?)?;
        info!("updated search configuration: {}", path.display());
        Ok(true)
    }

    /// Hand the findings to an external printer.
    pub fn print(
        &self,
        handler: PrintHandlerFn,
        layout_path: &Path,
        output_path: &Path,
        profile_name: &str,
    ) -> Result<()> {
        handler(&self.findings, layout_path, output_path, profile_name)
    }

    pub fn add_find(&mut self, finding: Finding) {
        self.findings.push(finding);
    }

    pub fn findings(&self) -> &[Finding] {
        &self.findings
    }

    pub fn reader(&self) -> &DumpReader {
        &self.reader
    }

    pub fn regions(&self) -> &[SearchRegion] {
        &self.regions
    }

    pub fn regions_mut(&mut self) -> &mut Vec<SearchRegion> {
        &mut self.regions
    }

    /// The raw configuration document, when one is loaded.
    pub fn document(&self) -> Option<&Value> {
        self.document.as_ref()
    }
}
