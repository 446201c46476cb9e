//! Instruction-template matching over byte ranges.
//!
//! Scans decode one instruction at a time; a decode failure advances the
//! window by exactly one byte and never aborts the scan. Sequence matching
//! is contiguous (a mismatch resets progress), subsequence matching is
//! gapped (interleaved instructions are admitted between matched steps).

use crate::asm::{InstructionPattern, MemOperandPattern, OperandPattern};
use crate::dump::DumpReader;
use crate::pattern::{MatchRange, SubsequenceMatch};

use iced_x86::{Decoder, DecoderOptions, Instruction, OpKind};

/// Decode one instruction at `offset` inside the decoder's buffer, with the
/// instruction pointer rebased so RIP-relative math resolves to file offsets.
/// Returns false when the bytes do not decode.
pub(crate) fn decode_at(
    decoder: &mut Decoder<'_>,
    instr: &mut Instruction,
    base: u64,
    offset: usize,
) -> bool {
    if decoder.set_position(offset).is_err() {
        return false;
    }

    decoder.set_ip(base + offset as u64);
    decoder.decode_out(instr);
    !instr.is_invalid()
}

/// Decoded immediate view: value, encoded width in bits, and whether the
/// encoding is sign-extended. Near branches are reported as their relative
/// displacement so templates match what the instruction encodes.
pub(crate) fn decoded_immediate(instr: &Instruction, op: u32) -> Option<(u64, u32, bool)> {
    let imm = match instr.op_kind(op) {
        OpKind::Immediate8 => (instr.immediate8() as u64, 8, false),
        OpKind::Immediate8_2nd => (instr.immediate8_2nd() as u64, 8, false),
        OpKind::Immediate16 => (instr.immediate16() as u64, 16, false),
        OpKind::Immediate32 => (instr.immediate32() as u64, 32, false),
        OpKind::Immediate64 => (instr.immediate64(), 64, false),
        OpKind::Immediate8to16 => (instr.immediate8to16() as i64 as u64, 8, true),
        OpKind::Immediate8to32 => (instr.immediate8to32() as i64 as u64, 8, true),
        OpKind::Immediate8to64 => (instr.immediate8to64() as u64, 8, true),
        OpKind::Immediate32to64 => (instr.immediate32to64() as u64, 32, true),
        OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => (
            instr.near_branch_target().wrapping_sub(instr.next_ip()),
            32,
            true,
        ),
        _ => return None,
    };

    Some(imm)
}

fn truncate_to_width(value: u64, bits: u32) -> u64 {
    if bits >= 64 {
        value
    } else {
        value & ((1u64 << bits) - 1)
    }
}

/// Raw memory displacement of the current memory operand. RIP-relative
/// operands store the resolved address, so the next-IP is subtracted back
/// out to recover the encoded displacement.
pub(crate) fn raw_displacement(instr: &Instruction) -> i64 {
    if instr.is_ip_rel_memory_operand() {
        instr.memory_displacement64().wrapping_sub(instr.next_ip()) as i64
    } else {
        instr.memory_displacement64() as i64
    }
}

fn memory_operand_matches(instr: &Instruction, mem: &MemOperandPattern) -> bool {
    if let Some(base) = mem.base {
        if instr.memory_base() != base {
            return false;
        }
    }

    if let Some(index) = mem.index {
        if instr.memory_index() != index {
            return false;
        }
    }

    if let Some(scale) = mem.scale {
        if instr.memory_index_scale() != scale as u32 {
            return false;
        }
    }

    if let Some(disp) = mem.disp {
        if raw_displacement(instr) != disp {
            return false;
        }
    }

    true
}

/// Match one decoded instruction against a template.
///
/// The template mnemonic (when present) and the visible operand count must
/// both agree; each non-wildcard operand must match by type, and every
/// non-absent sub-field must equal the decoded value. Sign-extended
/// immediates are truncated to their encoded width before comparison.
pub fn match_instruction(instr: &Instruction, template: &InstructionPattern) -> bool {
    if let Some(mnemonic) = template.mnemonic {
        if instr.mnemonic() != mnemonic {
            return false;
        }
    }

    if instr.op_count() as usize != template.operands.len() {
        return false;
    }

    for (i, operand) in template.operands.iter().enumerate() {
        let Some(operand) = operand else {
            continue; // total wildcard
        };

        let op = i as u32;

        let matched = match instr.op_kind(op) {
            OpKind::Register => matches!(
                operand,
                OperandPattern::Register(r) if *r == instr.op_register(op)
            ),
            OpKind::Memory => match operand {
                OperandPattern::Memory(mem) => memory_operand_matches(instr, mem),
                _ => false,
            },
            _ => match (operand, decoded_immediate(instr, op)) {
                (OperandPattern::Immediate(template_value), Some((value, bits, signed))) => {
                    if signed {
                        truncate_to_width(value, bits) == *template_value
                    } else {
                        value == *template_value
                    }
                }
                _ => false,
            },
        };

        if !matched {
            return false;
        }
    }

    true
}

/// Find a contiguous run of instructions matching the template list.
///
/// Any mismatch resets progress to the first template without rewinding the
/// scan position. Returns the per-step match ranges plus the coverage from
/// the first to the last matched instruction.
pub fn find_instruction_sequence(
    reader: &DumpReader,
    start: u64,
    size: u64,
    templates: &[InstructionPattern],
) -> Option<SubsequenceMatch> {
    scan_instructions(reader, start, size, templates, true)
}

/// Find an ordered but gapped run of instructions matching the template
/// list; instructions that match no pending step are skipped without
/// resetting progress.
pub fn find_instruction_subsequence(
    reader: &DumpReader,
    start: u64,
    size: u64,
    templates: &[InstructionPattern],
) -> Option<SubsequenceMatch> {
    scan_instructions(reader, start, size, templates, false)
}

fn scan_instructions(
    reader: &DumpReader,
    start: u64,
    size: u64,
    templates: &[InstructionPattern],
    contiguous: bool,
) -> Option<SubsequenceMatch> {
    if templates.is_empty() {
        return None;
    }

    let buffer = reader.read(start, size as usize);
    if buffer.is_empty() {
        return None;
    }

    let mut decoder = Decoder::with_ip(64, &buffer, start, DecoderOptions::NONE);
    let mut instr = Instruction::default();

    let mut matches: Vec<MatchRange> = Vec::new();
    let mut template_index = 0usize;
    let mut offset = 0usize;

    while offset < buffer.len() {
        if !decode_at(&mut decoder, &mut instr, start, offset) {
            offset += 1;

            if contiguous {
                template_index = 0;
                matches.clear();
            }

            continue;
        }

        if match_instruction(&instr, &templates[template_index]) {
            matches.push(MatchRange::new(start + offset as u64, instr.len() as u64));
            template_index += 1;

            if template_index == templates.len() {
                let first = matches[0];
                let last = matches[matches.len() - 1];

                return Some(SubsequenceMatch {
                    coverage: MatchRange::new(first.offset, last.end() - first.offset),
                    matches,
                });
            }
        } else if contiguous {
            template_index = 0;
            matches.clear();
        }

        offset += instr.len();
    }

    None
}
