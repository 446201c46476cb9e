//! Dump reading and analysis.
//!
//! A dump comes in one of two layouts:
//!
//! - *Regions mode*: a metadata header, a table of memory region records, and
//!   the raw region payloads concatenated in table order. Reads go through a
//!   virtual-to-file offset translation against the region table.
//! - *Sparse mode*: a raw on-disk image. Reads pass through unchanged.
//!
//! After the mode-specific bookkeeping, analysis parses the PE section table,
//! collects direct `call` targets in `.text` into an ordered function set, and
//! extracts the file version from the `.rsrc` resource tree. PE parse failures
//! degrade the PE state to absent; I/O failures surface as empty byte slices.

use crate::error::{Error, Result};
use crate::matcher::decode_at;
use crate::pe::{
    self, normalize_section_name, PeSection, PeSections, DOS_LFANEW_OFFSET, DOS_MAGIC,
    FILE_HEADER_SIZE, PE_SIGNATURE, SECTION_HEADER_SIZE,
};

use iced_x86::{Decoder, DecoderOptions, Instruction, Mnemonic, OpKind};
use tracing::debug;

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Size of the fixed dump metadata header.
pub const METADATA_SIZE: u64 = 24;

/// Size of one region record in the regions section.
pub const REGION_RECORD_SIZE: u64 = 32;

/// Dump layout mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Metadata + region table + concatenated region payloads.
    Regions,
    /// Raw on-disk image; no translation.
    Sparse,
}

/// One memory region record from the dump's region table.
///
/// `address_end` is inclusive. Regions are stored in ascending
/// `address_begin` order and do not overlap.
#[derive(Clone, Copy, Debug, Default)]
pub struct MemoryRegion {
    pub address_begin: u64,
    pub address_end: u64,
    pub protection: u8,
    pub private_memory: bool,
    pub initially_committed: bool,
}

impl MemoryRegion {
    /// Byte size of the region payload.
    pub fn size(&self) -> u64 {
        (self.address_end + 1) - self.address_begin
    }

    fn parse(record: &[u8]) -> Option<Self> {
        Some(Self {
            address_begin: pe::read_u64(record, 0)?,
            address_end: pe::read_u64(record, 8)?,
            protection: pe::read_u64(record, 16)? as u8,
            private_memory: *record.get(24)? != 0,
            initially_committed: *record.get(25)? != 0,
        })
    }
}

/// The region containing the image base, plus the base's in-region offset.
#[derive(Clone, Copy, Debug)]
pub struct BaseRegionInfo {
    pub region: MemoryRegion,
    pub region_offset: u64,
}

/// Dump metadata, populated once at analysis.
#[derive(Clone, Debug, Default)]
pub struct DumpMetadata {
    pub regions_section_size: u64,
    pub dump_section_size: u64,
    pub base_address: u64,
    /// File offset where the concatenated region payloads begin.
    pub dump_section_offset: u64,
    pub base_region: Option<BaseRegionInfo>,
}

/// External collaborator that produces dump files from live processes.
///
/// The engine never acquires memory itself; `OffsetFinder::init_from_pid`
/// drives a producer and then opens the file it wrote.
pub trait DumpProducer {
    fn attach(&mut self, pid: u32) -> Result<()>;
    fn dump(&mut self, path: &Path, mode: Mode) -> Result<usize>;
}

/// Reads a process dump and answers byte-range queries against it.
///
/// The reader exclusively owns the file handle for its lifetime; components
/// that need bytes receive owned vectors, never the handle.
pub struct DumpReader {
    path: PathBuf,
    file: RefCell<File>,
    mode: Mode,
    metadata: DumpMetadata,
    regions: Vec<MemoryRegion>,
    pe_header: Option<PeSection>,
    pe_sections: Option<PeSections>,
    functions: BTreeSet<u64>,
    file_version: Option<String>,
}

impl DumpReader {
    /// Open a dump file for random reads. No validation happens here.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)
            .map_err(|e| Error::DumpOpenFailed(format!("{}: {}", path.display(), e)))?;

        Ok(Self {
            path,
            file: RefCell::new(file),
            mode: Mode::Sparse,
            metadata: DumpMetadata::default(),
            regions: Vec::new(),
            pe_header: None,
            pe_sections: None,
            functions: BTreeSet::new(),
            file_version: None,
        })
    }

    /// Analyze the dump in the given mode.
    ///
    /// Regions mode consumes the metadata header and region table first;
    /// both modes then parse the PE section table, build the function set
    /// from `.text` and extract the file version.
    pub fn analyze(&mut self, mode: Mode) -> Result<()> {
        self.mode = mode;

        if mode == Mode::Regions {
            let header = self.raw_read(0, METADATA_SIZE as usize);

            self.metadata.regions_section_size =
                pe::read_u64(&header, 0).ok_or_else(|| Error::DumpOpenFailed(
                    "dump too short for metadata header".into(),
                ))?;
            self.metadata.dump_section_size = pe::read_u64(&header, 8).unwrap_or(0);
            self.metadata.base_address = pe::read_u64(&header, 16).unwrap_or(0);

            let regions_end = METADATA_SIZE + self.metadata.regions_section_size;
            let mut offset = METADATA_SIZE;

            while offset < regions_end {
                let record = self.raw_read(offset, REGION_RECORD_SIZE as usize);
                let Some(region) = MemoryRegion::parse(&record) else {
                    break;
                };

                let base = self.metadata.base_address;
                if base >= region.address_begin && base <= region.address_end {
                    self.metadata.base_region = Some(BaseRegionInfo {
                        region,
                        region_offset: base - region.address_begin,
                    });
                }

                self.regions.push(region);
                offset += REGION_RECORD_SIZE;
            }

            self.metadata.dump_section_offset = regions_end;
            debug!(regions = self.regions.len(), "loaded dump region table");
        }

        self.extract_pe_sections();
        self.extract_functions();
        self.extract_file_version();
        Ok(())
    }

    /// Translate a virtual offset (relative to the image base) into a file
    /// offset. Returns `None` when no region covers the address.
    pub fn translate(&self, virtual_offset: u64) -> Option<u64> {
        let virtual_address = self.metadata.base_address.wrapping_add(virtual_offset);
        let mut file_offset = self.metadata.dump_section_offset;

        for region in &self.regions {
            if virtual_address >= region.address_begin && virtual_address <= region.address_end {
                return Some(file_offset + (virtual_address - region.address_begin));
            }

            file_offset += region.size();
        }

        None
    }

    /// Read `size` bytes at a virtual offset.
    ///
    /// In regions mode the offset is translated first; an untranslatable
    /// offset or any I/O failure yields an empty (or short) slice. Callers
    /// must treat an empty result as "cannot answer", never as fatal.
    pub fn read(&self, offset: u64, size: usize) -> Vec<u8> {
        match self.mode {
            Mode::Regions => match self.translate(offset) {
                Some(file_offset) => self.raw_read(file_offset, size),
                None => Vec::new(),
            },
            Mode::Sparse => self.raw_read(offset, size),
        }
    }

    fn raw_read(&self, offset: u64, size: usize) -> Vec<u8> {
        let mut file = self.file.borrow_mut();

        if file.seek(SeekFrom::Start(offset)).is_err() {
            return Vec::new();
        }

        let mut buffer = vec![0u8; size];
        let mut filled = 0usize;

        while filled < size {
            match file.read(&mut buffer[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => return Vec::new(),
            }
        }

        buffer.truncate(filled);
        buffer
    }

    /// Parse the DOS/NT headers and section table. Any failure leaves the
    /// PE state absent; later callers treat that as "cannot answer".
    fn extract_pe_sections(&mut self) {
        self.pe_header = None;
        self.pe_sections = None;

        match self.parse_pe() {
            Ok((header, sections)) => {
                self.pe_header = Some(header);
                self.pe_sections = Some(sections);
            }
            Err(e) => debug!("PE parse failed, continuing without sections: {}", e),
        }
    }

    fn parse_pe(&self) -> Result<(PeSection, PeSections)> {
        let dos = self.read(0, 0x40);
        if pe::read_u16(&dos, 0) != Some(DOS_MAGIC) {
            return Err(Error::InvalidDosSignature(0));
        }

        let pe_offset = pe::read_u32(&dos, DOS_LFANEW_OFFSET as usize)
            .ok_or(Error::InvalidDosSignature(DOS_LFANEW_OFFSET))? as u64;

        let nt = self.read(pe_offset, 4 + FILE_HEADER_SIZE as usize);
        if pe::read_u32(&nt, 0) != Some(PE_SIGNATURE) {
            return Err(Error::InvalidPeSignature(pe_offset));
        }

        let number_of_sections =
            pe::read_u16(&nt, 4 + 2).ok_or(Error::InvalidPeSignature(pe_offset))?;
        let optional_header_size =
            pe::read_u16(&nt, 4 + 16).ok_or(Error::InvalidPeSignature(pe_offset))?;

        // Skip the optional header entirely; only the section table matters.
        let table_offset = pe_offset + 4 + FILE_HEADER_SIZE + optional_header_size as u64;
        let table_size = number_of_sections as u64 * SECTION_HEADER_SIZE;

        let table = self.read(table_offset, table_size as usize);
        if table.len() < table_size as usize {
            return Err(Error::InvalidPeSignature(table_offset));
        }

        let mut sections = Vec::with_capacity(number_of_sections as usize);

        for i in 0..number_of_sections as usize {
            let record = &table[i * SECTION_HEADER_SIZE as usize..];
            let name = normalize_section_name(&record[..8], i);
            let virtual_size = pe::read_u32(record, 8).unwrap_or(0) as u64;
            let virtual_address = pe::read_u32(record, 12).unwrap_or(0) as u64;

            sections.push(PeSection::new(name, virtual_address, virtual_size));
        }

        // Pseudo-section covering DOS + NT headers + section table.
        let header = PeSection::new(".header", 0, table_offset + table_size);
        Ok((header, PeSections::new(sections)))
    }

    /// Enumerate `.text` for `call imm` instructions and collect callee
    /// offsets that land back inside `.text` into the ordered function set.
    /// The set approximates the function table; indirect calls are missed.
    fn extract_functions(&mut self) {
        let Some(text) = self.section(".text").cloned() else {
            return;
        };

        let buffer = self.read(text.virtual_offset, text.virtual_size as usize);
        if buffer.is_empty() {
            return;
        }

        let mut decoder = Decoder::with_ip(64, &buffer, text.virtual_offset, DecoderOptions::NONE);
        let mut instr = Instruction::default();
        let mut offset = 0usize;

        while offset < buffer.len() {
            if !decode_at(&mut decoder, &mut instr, text.virtual_offset, offset) {
                offset += 1;
                continue;
            }

            if instr.mnemonic() == Mnemonic::Call
                && instr.op_count() >= 1
                && matches!(
                    instr.op0_kind(),
                    OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64
                )
            {
                let target = instr.near_branch_target();

                if target >= text.virtual_offset && target < text.end() {
                    self.functions.insert(target);
                }
            }

            offset += instr.len();
        }

        debug!(functions = self.functions.len(), "built function set from .text");
    }

    fn extract_file_version(&mut self) {
        self.file_version = None;

        let Some(rsrc) = self.section(".rsrc").cloned() else {
            return;
        };

        let data = self.read(rsrc.virtual_offset, rsrc.virtual_size as usize);
        if data.is_empty() {
            return;
        }

        self.file_version = pe::parse_version_resource(&data, rsrc.virtual_offset);
    }

    /// Locate up to `max_matches` occurrences of `text` encoded as UTF-16 LE
    /// inside `.rdata`. Offsets are virtual offsets of each occurrence.
    pub fn find_string_utf16(&self, text: &str, max_matches: usize) -> Option<Vec<u64>> {
        let rdata = self.section(".rdata")?;
        let buffer = self.read(rdata.virtual_offset, rdata.virtual_size as usize);

        if buffer.is_empty() {
            return None;
        }

        let mut pattern = Vec::with_capacity(text.len() * 2);
        for unit in text.encode_utf16() {
            pattern.extend_from_slice(&unit.to_le_bytes());
        }

        let mut matches = Vec::new();

        for i in 0..buffer.len().saturating_sub(pattern.len()) + 1 {
            if buffer.len() - i < pattern.len() {
                break;
            }

            if buffer[i..i + pattern.len()] == pattern[..] {
                matches.push(rdata.virtual_offset + i as u64);

                if matches.len() >= max_matches {
                    break;
                }
            }
        }

        if matches.is_empty() {
            None
        } else {
            Some(matches)
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn metadata(&self) -> &DumpMetadata {
        &self.metadata
    }

    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }

    /// The `.header` pseudo-section, if the PE headers parsed.
    pub fn pe_header(&self) -> Option<&PeSection> {
        self.pe_header.as_ref()
    }

    pub fn pe_sections(&self) -> Option<&PeSections> {
        self.pe_sections.as_ref()
    }

    /// Convenience lookup into the parsed section table.
    pub fn section(&self, name: &str) -> Option<&PeSection> {
        self.pe_sections.as_ref()?.get(name)
    }

    /// Ordered set of function offsets discovered from `call` edges.
    pub fn functions(&self) -> &BTreeSet<u64> {
        &self.functions
    }

    pub fn file_version(&self) -> Option<&str> {
        self.file_version.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(name: &str, bytes: &[u8]) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "offscan_dump_test_{}_{}",
            std::process::id(),
            name
        ));
        let mut file = File::create(&path).unwrap();
        file.write_all(bytes).unwrap();
        path
    }

    fn region_record(begin: u64, end: u64, protection: u64) -> [u8; 32] {
        let mut record = [0u8; 32];
        record[0..8].copy_from_slice(&begin.to_le_bytes());
        record[8..16].copy_from_slice(&end.to_le_bytes());
        record[16..24].copy_from_slice(&protection.to_le_bytes());
        record[24] = 1; // private
        record[25] = 1; // initially committed
        record
    }

    /// Two regions with a gap between them; base address in the first.
    fn build_region_dump() -> Vec<u8> {
        let mut dump = Vec::new();

        let regions_size = 2 * REGION_RECORD_SIZE;
        dump.extend_from_slice(&regions_size.to_le_bytes());
        dump.extend_from_slice(&0x3000u64.to_le_bytes());
        dump.extend_from_slice(&0x1_4000_0000u64.to_le_bytes());

        dump.extend_from_slice(&region_record(0x1_4000_0000, 0x1_4000_0FFF, 0x20));
        dump.extend_from_slice(&region_record(0x1_4000_3000, 0x1_4000_4FFF, 0x04));

        // Payloads: region 1 is 0x1000 bytes, region 2 is 0x2000 bytes.
        let mut payload = vec![0u8; 0x3000];
        payload[0x10] = 0xAA;
        payload[0x1000 + 0x20] = 0xBB; // first byte area of region 2
        dump.extend_from_slice(&payload);

        dump
    }

    #[test]
    fn test_region_translation() {
        let path = write_temp("translate", &build_region_dump());
        let mut reader = DumpReader::open(&path).unwrap();
        reader.analyze(Mode::Regions).unwrap();

        let dump_start = METADATA_SIZE + 2 * REGION_RECORD_SIZE;
        assert_eq!(reader.metadata().dump_section_offset, dump_start);
        assert_eq!(reader.regions().len(), 2);

        // Offset 0x10 lands in region 1.
        assert_eq!(reader.translate(0x10), Some(dump_start + 0x10));

        // Virtual offset 0x3020 lands 0x20 into region 2, whose payload
        // starts after region 1's 0x1000 bytes.
        assert_eq!(reader.translate(0x3020), Some(dump_start + 0x1000 + 0x20));

        // The gap between regions is untranslatable.
        assert_eq!(reader.translate(0x2000), None);
    }

    #[test]
    fn test_region_read_and_base_info() {
        let path = write_temp("read", &build_region_dump());
        let mut reader = DumpReader::open(&path).unwrap();
        reader.analyze(Mode::Regions).unwrap();

        assert_eq!(reader.read(0x10, 1), vec![0xAA]);
        assert_eq!(reader.read(0x3020, 1), vec![0xBB]);
        assert!(reader.read(0x2000, 16).is_empty());

        let base = reader.metadata().base_region.as_ref().unwrap();
        assert_eq!(base.region.address_begin, 0x1_4000_0000);
        assert_eq!(base.region_offset, 0);
        assert!(base.region.private_memory);
    }

    #[test]
    fn test_non_pe_dump_degrades_to_absent() {
        let path = write_temp("nope", &build_region_dump());
        let mut reader = DumpReader::open(&path).unwrap();
        reader.analyze(Mode::Regions).unwrap();

        assert!(reader.pe_sections().is_none());
        assert!(reader.pe_header().is_none());
        assert!(reader.functions().is_empty());
        assert!(reader.file_version().is_none());
    }

    #[test]
    fn test_read_clips_to_file_end() {
        let path = write_temp("clip", &[1u8, 2, 3, 4]);
        let mut reader = DumpReader::open(&path).unwrap();
        reader.analyze(Mode::Sparse).unwrap();

        assert_eq!(reader.read(2, 16), vec![3, 4]);
        assert!(reader.read(100, 4).is_empty());
    }
}
