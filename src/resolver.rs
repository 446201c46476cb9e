//! RIP-relative resolution and scalar extraction.
//!
//! Four routines share one decode loop over a byte window: resolving the
//! first RIP-relative target, locating the instruction whose RIP-relative
//! target equals a given offset, and extracting the first immediate or
//! displacement. A decode failure advances by one byte with no state carried.

use crate::dump::DumpReader;
use crate::matcher::{decode_at, decoded_immediate, raw_displacement};
use crate::pattern::MatchRange;

use iced_x86::{Decoder, DecoderOptions, Instruction, OpKind};

/// A located value: the instruction range it came from plus the value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Extraction<T> {
    pub range: MatchRange,
    pub value: T,
}

/// Per-instruction predicate used to narrow resolution scans.
pub type InstructionFilter<'a> = &'a dyn Fn(&Instruction) -> bool;

/// Resolve the RIP-relative target of one operand of a decoded instruction:
/// either a `[rip + disp]` memory operand or a signed (relative) immediate.
/// The target is the byte immediately after the instruction plus the
/// displacement.
fn rip_relative_target(instr: &Instruction, op: u32) -> Option<u64> {
    match instr.op_kind(op) {
        OpKind::Memory => {
            if instr.is_ip_rel_memory_operand() && instr.memory_displ_size() > 0 {
                Some(instr.ip_rel_memory_address())
            } else {
                None
            }
        }
        _ => {
            let (value, _, signed) = decoded_immediate(instr, op)?;

            if signed {
                Some(instr.next_ip().wrapping_add(value))
            } else {
                None
            }
        }
    }
}

fn scan<T>(
    reader: &DumpReader,
    start: u64,
    size: u64,
    filter: Option<InstructionFilter<'_>>,
    mut visit: impl FnMut(&Instruction, u64) -> Option<T>,
) -> Option<T> {
    let buffer = reader.read(start, size as usize);
    if buffer.is_empty() {
        return None;
    }

    let mut decoder = Decoder::with_ip(64, &buffer, start, DecoderOptions::NONE);
    let mut instr = Instruction::default();
    let mut offset = 0usize;

    while offset < buffer.len() {
        if !decode_at(&mut decoder, &mut instr, start, offset) {
            offset += 1;
            continue;
        }

        if let Some(filter) = filter {
            if !filter(&instr) {
                offset += instr.len();
                continue;
            }
        }

        if let Some(result) = visit(&instr, start + offset as u64) {
            return Some(result);
        }

        offset += instr.len();
    }

    None
}

/// Resolve the first RIP-relative target in `[start, start + size)`,
/// optionally restricted to instructions passing `filter`.
pub fn resolve_rip_relative(
    reader: &DumpReader,
    start: u64,
    size: u64,
    filter: Option<InstructionFilter<'_>>,
) -> Option<Extraction<u64>> {
    scan(reader, start, size, filter, |instr, instr_start| {
        for op in 0..instr.op_count() {
            if let Some(target) = rip_relative_target(instr, op) {
                return Some(Extraction {
                    range: MatchRange::new(instr_start, instr.len() as u64),
                    value: target,
                });
            }
        }

        None
    })
}

/// Find the first instruction whose resolved RIP-relative target equals
/// `target`. The extraction value is the instruction's start offset.
pub fn find_rip_relative_reference(
    reader: &DumpReader,
    start: u64,
    size: u64,
    target: u64,
    filter: Option<InstructionFilter<'_>>,
) -> Option<Extraction<u64>> {
    scan(reader, start, size, filter, |instr, instr_start| {
        for op in 0..instr.op_count() {
            if rip_relative_target(instr, op) == Some(target) {
                return Some(Extraction {
                    range: MatchRange::new(instr_start, instr.len() as u64),
                    value: instr_start,
                });
            }
        }

        None
    })
}

/// Extract the first immediate operand value encountered.
pub fn extract_immediate(reader: &DumpReader, start: u64, size: u64) -> Option<Extraction<u64>> {
    scan(reader, start, size, None, |instr, instr_start| {
        for op in 0..instr.op_count() {
            if let Some((value, _, _)) = decoded_immediate(instr, op) {
                return Some(Extraction {
                    range: MatchRange::new(instr_start, instr.len() as u64),
                    value,
                });
            }
        }

        None
    })
}

/// Extract the first memory-operand displacement with a non-zero encoded
/// size.
pub fn extract_displacement(
    reader: &DumpReader,
    start: u64,
    size: u64,
) -> Option<Extraction<u32>> {
    scan(reader, start, size, None, |instr, instr_start| {
        for op in 0..instr.op_count() {
            if instr.op_kind(op) == OpKind::Memory && instr.memory_displ_size() > 0 {
                return Some(Extraction {
                    range: MatchRange::new(instr_start, instr.len() as u64),
                    value: raw_displacement(instr) as u32,
                });
            }
        }

        None
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dump::{DumpReader, Mode};

    use iced_x86::Mnemonic;
    use std::fs::File;
    use std::io::Write;

    fn reader_over(name: &str, bytes: &[u8]) -> DumpReader {
        let path = std::env::temp_dir().join(format!(
            "offscan_resolver_test_{}_{}",
            std::process::id(),
            name
        ));
        File::create(&path).unwrap().write_all(bytes).unwrap();

        let mut reader = DumpReader::open(&path).unwrap();
        reader.analyze(Mode::Sparse).unwrap();
        reader
    }

    // mov rax, [rip+0x11223344] at offset 0.
    const RIP_LOAD: &[u8] = &[0x48, 0x8B, 0x05, 0x44, 0x33, 0x22, 0x11];

    #[test]
    fn test_resolve_rip_relative_memory() {
        let reader = reader_over("ripmem", RIP_LOAD);
        let found = resolve_rip_relative(&reader, 0, 7, None).unwrap();

        // Target is instruction end (7) plus the displacement.
        assert_eq!(found.value, 7 + 0x11223344);
        assert_eq!(found.range, MatchRange::new(0, 7));
    }

    #[test]
    fn test_resolution_uses_file_offsets() {
        // The same instruction at file offset 0x2000 resolves relative to
        // its own end there.
        let mut bytes = vec![0u8; 0x2000];
        bytes.extend_from_slice(RIP_LOAD);
        let reader = reader_over("ripbase", &bytes);

        let found = resolve_rip_relative(&reader, 0x2000, 7, None).unwrap();
        assert_eq!(found.value, 0x2007 + 0x11223344);
        assert_eq!(found.range, MatchRange::new(0x2000, 7));
    }

    #[test]
    fn test_resolve_rip_relative_call() {
        // nop; call +0x20 (relative to the call's end at 6)
        let bytes = [0x90, 0xE8, 0x20, 0x00, 0x00, 0x00];
        let reader = reader_over("ripcall", &bytes);

        let found = resolve_rip_relative(&reader, 0, bytes.len() as u64, None).unwrap();
        assert_eq!(found.value, 6 + 0x20);
        assert_eq!(found.range, MatchRange::new(1, 5));
    }

    #[test]
    fn test_resolver_filter() {
        // call rel32; lea rax, [rip+0x10]
        let bytes = [
            0xE8, 0x00, 0x01, 0x00, 0x00, // call
            0x48, 0x8D, 0x05, 0x10, 0x00, 0x00, 0x00, // lea rax, [rip+0x10]
        ];
        let reader = reader_over("filter", &bytes);

        let only_lea = |instr: &Instruction| instr.mnemonic() == Mnemonic::Lea;
        let found =
            resolve_rip_relative(&reader, 0, bytes.len() as u64, Some(&only_lea)).unwrap();

        assert_eq!(found.range.offset, 5);
        assert_eq!(found.value, 12 + 0x10);
    }

    #[test]
    fn test_find_rip_relative_reference() {
        // Padding, then lea rcx, [rip+disp] resolving to 0x100.
        let mut bytes = vec![0x90, 0x90];
        let lea_start = bytes.len() as u64;
        let disp = 0x100u32 - (lea_start as u32 + 7);
        bytes.extend_from_slice(&[0x48, 0x8D, 0x0D]);
        bytes.extend_from_slice(&disp.to_le_bytes());
        let reader = reader_over("ripref", &bytes);

        let found =
            find_rip_relative_reference(&reader, 0, bytes.len() as u64, 0x100, None).unwrap();
        assert_eq!(found.value, lea_start);

        assert!(
            find_rip_relative_reference(&reader, 0, bytes.len() as u64, 0x101, None).is_none()
        );
    }

    #[test]
    fn test_extract_immediate() {
        // nop; mov edx, 0x12345678; ret
        let bytes = [0x90, 0xBA, 0x78, 0x56, 0x34, 0x12, 0xC3];
        let reader = reader_over("imm", &bytes);

        let found = extract_immediate(&reader, 0, bytes.len() as u64).unwrap();
        assert_eq!(found.value, 0x12345678);
        assert_eq!(found.range, MatchRange::new(1, 5));
    }

    #[test]
    fn test_extract_displacement() {
        // xor rax, rdx; mov rax, [rcx+0x18]
        let bytes = [0x48, 0x31, 0xD0, 0x48, 0x8B, 0x41, 0x18];
        let reader = reader_over("disp", &bytes);

        let found = extract_displacement(&reader, 0, bytes.len() as u64).unwrap();
        assert_eq!(found.value, 0x18);
        assert_eq!(found.range, MatchRange::new(3, 4));
    }

    #[test]
    fn test_extract_displacement_rip_relative_is_raw() {
        let reader = reader_over("ripdisp", RIP_LOAD);
        let found = extract_displacement(&reader, 0, 7).unwrap();
        assert_eq!(found.value, 0x11223344);
    }

    #[test]
    fn test_empty_window() {
        let reader = reader_over("emptywin", &[]);
        assert!(extract_immediate(&reader, 0, 16).is_none());
        assert!(resolve_rip_relative(&reader, 0, 16, None).is_none());
    }
}
