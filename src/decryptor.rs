//! Symbolic extraction of obfuscated decryption routines.
//!
//! The walker interprets a short instruction stream, tracking per-register
//! constants (`mov reg, imm` / `mov reg, reg`) and building decryption
//! chains out of `xor`, `ror`/`rol` and `shr`/`shl` instructions acting on a
//! tracked register. A completed chain yields its constants plus a
//! closed-form pseudocode expression in one parameter.
//!
//! Only instructions of the chain's operand width take part; everything
//! else, including undecodable bytes, is stepped over.

use crate::codegen::{self, PARAM_NAME};
use crate::dump::DumpReader;
use crate::matcher::{decode_at, decoded_immediate};
use crate::pattern::MatchRange;
use crate::resolver::Extraction;

use iced_x86::{Decoder, DecoderOptions, Instruction, Mnemonic, OpKind, Register};
use serde::Serialize;

use std::collections::HashMap;
use std::fmt;

/// Scalar width a decryptor operates on. Implemented for `u32` and `u64`.
pub trait DecryptWidth:
    Copy + Default + Eq + fmt::UpperHex + Serialize + 'static
{
    const BITS: u32;
    const IS_32BIT: bool;
    /// C-side type name used in generated pseudocode.
    const TYPE_NAME: &'static str;

    fn from_u64(value: u64) -> Self;
    fn as_u64(&self) -> u64;
    fn is_zero(&self) -> bool;
}

impl DecryptWidth for u32 {
    const BITS: u32 = 32;
    const IS_32BIT: bool = true;
    const TYPE_NAME: &'static str = "std::uint32_t";

    fn from_u64(value: u64) -> Self {
        value as u32
    }

    fn as_u64(&self) -> u64 {
        *self as u64
    }

    fn is_zero(&self) -> bool {
        *self == 0
    }
}

impl DecryptWidth for u64 {
    const BITS: u32 = 64;
    const IS_32BIT: bool = false;
    const TYPE_NAME: &'static str = "std::uint64_t";

    fn from_u64(value: u64) -> Self {
        value
    }

    fn as_u64(&self) -> u64 {
        *self
    }

    fn is_zero(&self) -> bool {
        *self == 0
    }
}

/// A recovered decryption routine: its constants and pseudocode.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Decryptor<W> {
    pub is_32bit: bool,
    pub xor1: W,
    pub xor2: W,
    /// Whether a register-sourced XOR was folded into the chain.
    pub xor3_from_reg: bool,
    pub rotate: u8,
    pub is_rotate_right: bool,
    pub shift: u8,
    pub is_shift_right: bool,
    pub pseudocode: String,
}

impl<W: DecryptWidth> fmt::Display for Decryptor<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "xor1=0x{:X} xor2=0x{:X} {}=0x{:02X} {}=0x{:02X}",
            self.xor1,
            self.xor2,
            if self.is_rotate_right { "ror" } else { "rol" },
            self.rotate,
            if self.is_shift_right { "shr" } else { "shl" },
            self.shift,
        )
    }
}

/// Tracks known per-register constants at one operand width.
struct RegisterTracker<W> {
    values: HashMap<Register, W>,
}

impl<W: DecryptWidth> RegisterTracker<W> {
    fn new() -> Self {
        Self {
            values: HashMap::new(),
        }
    }

    fn store(&mut self, register: Register, value: W) {
        self.values.insert(register, value);
    }

    fn propagate(&mut self, dst: Register, src: Register) {
        match self.values.get(&src).copied() {
            Some(value) => {
                self.values.insert(dst, value);
            }
            None => {
                self.values.remove(&dst);
            }
        }
    }

    /// Resolve an operand to a constant: an immediate directly, a register
    /// through the tracked constants, anything else not at all.
    fn resolve_operand(&self, instr: &Instruction, op: u32) -> Option<W> {
        match instr.op_kind(op) {
            OpKind::Register => self.values.get(&instr.op_register(op)).copied(),
            _ => decoded_immediate(instr, op).map(|(value, _, _)| W::from_u64(value)),
        }
    }
}

#[derive(Default)]
struct Checklist {
    xor1: bool,
    xor2: bool,
    xor3: bool,
    rotate: bool,
    shift: bool,
}

impl Checklist {
    // All three xor slots are gone; further xors on the chain are no-ops.
    fn xors_complete(&self) -> bool {
        self.xor1 && self.xor2 && self.xor3
    }
}

struct Chain<W> {
    id: u32,
    completed: bool,
    extracted: Decryptor<W>,
    checklist: Checklist,
    pseudocode: HashMap<Register, String>,
    ranges: Vec<MatchRange>,
}

impl<W: DecryptWidth> Chain<W> {
    fn new(id: u32) -> Self {
        Self {
            id,
            completed: false,
            extracted: Decryptor {
                is_32bit: W::IS_32BIT,
                ..Decryptor::default()
            },
            checklist: Checklist::default(),
            pseudocode: HashMap::new(),
            ranges: Vec::new(),
        }
    }

    /// Pseudocode accumulated for a register so far, or the bare parameter
    /// when the register has no expression yet.
    fn pseudo_or_param(&self, register: Register) -> String {
        self.pseudocode
            .get(&register)
            .cloned()
            .unwrap_or_else(|| PARAM_NAME.to_string())
    }

    /// A chain is complete once both xor constants, the rotate amount and
    /// the shift amount are recorded and non-zero.
    fn is_complete(&self) -> bool {
        self.checklist.xor1
            && self.checklist.xor2
            && self.checklist.rotate
            && self.checklist.shift
            && !self.extracted.xor1.is_zero()
            && !self.extracted.xor2.is_zero()
            && self.extracted.rotate > 0
            && self.extracted.shift > 0
    }
}

fn rotate_intrinsic<W: DecryptWidth>(right: bool) -> &'static str {
    match (W::IS_32BIT, right) {
        (true, true) => "_rotr",
        (true, false) => "_rotl",
        (false, true) => "_rotr64",
        (false, false) => "_rotl64",
    }
}

/// Walk `[start, start + size)` and extract every completed decryption
/// chain, reported in chain-creation order together with the overall byte
/// coverage of their instructions.
pub fn extract_decryptors<W: DecryptWidth>(
    reader: &DumpReader,
    start: u64,
    size: u64,
) -> Option<Extraction<Vec<Decryptor<W>>>> {
    let buffer = reader.read(start, size as usize);
    if buffer.is_empty() {
        return None;
    }

    let mut chains: Vec<Chain<W>> = Vec::new();
    let mut completed: Vec<usize> = Vec::new();

    // register -> chain index; a register is "chained" iff present here.
    let mut chain_map: HashMap<Register, usize> = HashMap::new();
    let mut next_id = 0u32;

    let mut create_chain = |chains: &mut Vec<Chain<W>>,
                            chain_map: &mut HashMap<Register, usize>,
                            register: Register| {
        let id = next_id;
        next_id += 1;
        chains.push(Chain::new(id));

        let index = chains.len() - 1;
        chain_map.insert(register, index);
        index
    };

    let mut tracker = RegisterTracker::<W>::new();
    let mut decoder = Decoder::with_ip(64, &buffer, start, DecoderOptions::NONE);
    let mut instr = Instruction::default();
    let mut offset = 0usize;

    while offset < buffer.len() {
        if !decode_at(&mut decoder, &mut instr, start, offset) {
            offset += 1;
            continue;
        }

        let step = instr.len();

        // Only two-operand instructions of the tracked width participate.
        if instr.op_count() < 2
            || instr.op0_kind() != OpKind::Register
            || instr.op0_register().size() as u32 * 8 != W::BITS
        {
            offset += step;
            continue;
        }

        let instr_range = MatchRange::new(start + offset as u64, step as u64);
        let dst = instr.op0_register();
        let src = match instr.op1_kind() {
            OpKind::Register => Some(instr.op1_register()),
            _ => None,
        };

        let dst_chained = chain_map.get(&dst).copied();
        let src_chained = src.and_then(|r| chain_map.get(&r).copied());

        match instr.mnemonic() {
            Mnemonic::Mov if src.is_none() && decoded_immediate(&instr, 1).is_some() => {
                // mov reg, imm. A fresh chain records where a constant was
                // staged, so a later register-sourced xor can account for
                // these bytes in its coverage.
                if dst_chained.is_none() {
                    let index = create_chain(&mut chains, &mut chain_map, dst);
                    chains[index].ranges.push(instr_range);
                }

                if let Some((value, _, _)) = decoded_immediate(&instr, 1) {
                    tracker.store(dst, W::from_u64(value));
                }
            }
            Mnemonic::Mov if src.is_some() => {
                let src = src.unwrap();
                tracker.propagate(dst, src);

                if let Some(index) = src_chained {
                    chain_map.insert(dst, index);

                    if let Some(code) = chains[index].pseudocode.get(&src).cloned() {
                        chains[index].pseudocode.insert(dst, code);
                    }
                }
            }
            Mnemonic::Xor => {
                let resolved = tracker.resolve_operand(&instr, 1);

                match dst_chained {
                    None => {
                        let index = create_chain(&mut chains, &mut chain_map, dst);
                        let chain = &mut chains[index];

                        match resolved {
                            Some(value) => {
                                chain
                                    .pseudocode
                                    .insert(dst, format!("{} ^ 0x{:X}", PARAM_NAME, value));
                                chain.extracted.xor1 = value;
                                chain.checklist.xor1 = true;
                                chain.ranges.push(instr_range);

                                if let Some(src_index) = src_chained {
                                    let src_ranges = chains[src_index].ranges.clone();
                                    chains[index].ranges.extend(src_ranges);
                                }
                            }
                            None => {
                                let rhs = src
                                    .map(|r| chains[index].pseudo_or_param(r))
                                    .unwrap_or_else(|| PARAM_NAME.to_string());
                                chains[index]
                                    .pseudocode
                                    .insert(dst, format!("{} ^ {}", PARAM_NAME, rhs));
                            }
                        }
                    }
                    Some(index) => {
                        if chains[index].checklist.xors_complete() {
                            offset += step;
                            continue;
                        }

                        let prev = chains[index].pseudo_or_param(dst);

                        match resolved {
                            Some(value) => {
                                let chain = &mut chains[index];

                                if !chain.checklist.xor1 {
                                    chain.extracted.xor1 = value;
                                    chain.checklist.xor1 = true;
                                } else if !chain.checklist.xor2 {
                                    chain.extracted.xor2 = value;
                                    chain.checklist.xor2 = true;
                                } else {
                                    // Both immediate slots filled; no-op.
                                    offset += step;
                                    continue;
                                }

                                chain
                                    .pseudocode
                                    .insert(dst, format!("{} ^ 0x{:X}", prev, value));
                                chain.ranges.push(instr_range);

                                if let Some(src_index) = src_chained {
                                    let src_ranges = chains[src_index].ranges.clone();
                                    chains[index].ranges.extend(src_ranges);
                                }
                            }
                            None => {
                                let rhs = src
                                    .map(|r| chains[index].pseudo_or_param(r))
                                    .unwrap_or_else(|| PARAM_NAME.to_string());

                                let chain = &mut chains[index];
                                chain.pseudocode.insert(dst, format!("{} ^ {}", prev, rhs));
                                chain.extracted.xor3_from_reg = true;
                                chain.checklist.xor3 = true;
                                chain.ranges.push(instr_range);
                            }
                        }
                    }
                }
            }
            Mnemonic::Ror | Mnemonic::Rol => {
                let right = instr.mnemonic() == Mnemonic::Ror;
                let intrinsic = rotate_intrinsic::<W>(right);
                let resolved = tracker.resolve_operand(&instr, 1);

                let index = match dst_chained {
                    Some(index) => {
                        if chains[index].checklist.rotate {
                            offset += step;
                            continue;
                        }
                        index
                    }
                    None => create_chain(&mut chains, &mut chain_map, dst),
                };

                let prev = if dst_chained.is_some() {
                    chains[index].pseudo_or_param(dst)
                } else {
                    PARAM_NAME.to_string()
                };

                match resolved {
                    Some(value) => {
                        let chain = &mut chains[index];
                        chain.extracted.rotate = value_as_u8(value);
                        chain.extracted.is_rotate_right = right;
                        chain.checklist.rotate = true;
                        chain.pseudocode.insert(
                            dst,
                            format!("{}({}, 0x{:02X})", intrinsic, prev, chain.extracted.rotate),
                        );
                        chain.ranges.push(instr_range);
                    }
                    None => {
                        let rhs = src
                            .map(|r| chains[index].pseudo_or_param(r))
                            .unwrap_or_else(|| PARAM_NAME.to_string());

                        let chain = &mut chains[index];
                        chain
                            .pseudocode
                            .insert(dst, format!("{}({}, {})", intrinsic, prev, rhs));

                        if dst_chained.is_some() {
                            chain.checklist.rotate = true;
                        }
                    }
                }
            }
            Mnemonic::Shr | Mnemonic::Shl => {
                let right = instr.mnemonic() == Mnemonic::Shr;
                let operator = if right { ">>" } else { "<<" };
                let resolved = tracker.resolve_operand(&instr, 1);

                let index = match dst_chained {
                    Some(index) => {
                        if chains[index].checklist.shift {
                            offset += step;
                            continue;
                        }
                        index
                    }
                    None => create_chain(&mut chains, &mut chain_map, dst),
                };

                let prev = if dst_chained.is_some() {
                    chains[index].pseudo_or_param(dst)
                } else {
                    PARAM_NAME.to_string()
                };

                match resolved {
                    Some(value) => {
                        let chain = &mut chains[index];
                        chain.extracted.shift = value_as_u8(value);
                        chain.extracted.is_shift_right = right;
                        chain.checklist.shift = true;
                        chain.pseudocode.insert(
                            dst,
                            format!("({}) {} 0x{:02X}", prev, operator, chain.extracted.shift),
                        );
                        chain.ranges.push(instr_range);
                    }
                    None => {
                        let rhs = src
                            .map(|r| chains[index].pseudo_or_param(r))
                            .unwrap_or_else(|| PARAM_NAME.to_string());

                        let chain = &mut chains[index];
                        chain
                            .pseudocode
                            .insert(dst, format!("({}) {} {}", prev, operator, rhs));

                        if dst_chained.is_some() {
                            chain.checklist.shift = true;
                        }
                    }
                }
            }
            _ => {}
        }

        // Completion check against the register's current chain.
        if let Some(&index) = chain_map.get(&dst) {
            let chain = &mut chains[index];

            if !chain.completed && chain.is_complete() {
                let raw = chain.pseudo_or_param(dst);
                chain.extracted.pseudocode = codegen::make_function(W::TYPE_NAME, &raw);
                chain.completed = true;
                completed.push(index);
            }
        }

        offset += step;
    }

    if completed.is_empty() {
        return None;
    }

    // Report in creation order, not completion order.
    completed.sort_by_key(|&index| chains[index].id);

    let mut all_ranges: Vec<MatchRange> = Vec::new();
    let mut decryptors = Vec::with_capacity(completed.len());

    for &index in &completed {
        all_ranges.extend(chains[index].ranges.iter().copied());
        decryptors.push(chains[index].extracted.clone());
    }

    all_ranges.sort_by_key(|r| r.offset);
    let first = all_ranges.first()?;
    let last = all_ranges.last()?;

    Some(Extraction {
        range: MatchRange::new(first.offset, last.end() - first.offset),
        value: decryptors,
    })
}

fn value_as_u8<W: DecryptWidth>(value: W) -> u8 {
    value.as_u64() as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dump::{DumpReader, Mode};

    use std::fs::File;
    use std::io::Write;

    fn reader_over(name: &str, bytes: &[u8]) -> DumpReader {
        let path = std::env::temp_dir().join(format!(
            "offscan_decryptor_test_{}_{}",
            std::process::id(),
            name
        ));
        File::create(&path).unwrap().write_all(bytes).unwrap();

        let mut reader = DumpReader::open(&path).unwrap();
        reader.analyze(Mode::Sparse).unwrap();
        reader
    }

    /// mov rax, imm32; xor rax, imm32; ror rax, 0x11; xor rax, imm32;
    /// shr rax, 0x05
    fn chain_64(xor1: u32, xor2: u32) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&[0x48, 0xC7, 0xC0, 0x01, 0x00, 0x00, 0x00]); // mov rax, 1
        bytes.extend_from_slice(&[0x48, 0x35]); // xor rax, imm32
        bytes.extend_from_slice(&xor1.to_le_bytes());
        bytes.extend_from_slice(&[0x48, 0xC1, 0xC8, 0x11]); // ror rax, 0x11
        bytes.extend_from_slice(&[0x48, 0x35]); // xor rax, imm32
        bytes.extend_from_slice(&xor2.to_le_bytes());
        bytes.extend_from_slice(&[0x48, 0xC1, 0xE8, 0x05]); // shr rax, 0x05
        bytes
    }

    #[test]
    fn test_single_chain_64() {
        let bytes = chain_64(0x0BAD_F00D, 0x00C0_FFEE);
        let reader = reader_over("chain64", &bytes);

        let found = extract_decryptors::<u64>(&reader, 0, bytes.len() as u64).unwrap();
        assert_eq!(found.value.len(), 1);

        let decryptor = &found.value[0];
        assert!(!decryptor.is_32bit);
        assert_eq!(decryptor.xor1, 0x0BAD_F00D);
        assert_eq!(decryptor.xor2, 0x00C0_FFEE);
        assert!(!decryptor.xor3_from_reg);
        assert_eq!(decryptor.rotate, 0x11);
        assert!(decryptor.is_rotate_right);
        assert_eq!(decryptor.shift, 0x05);
        assert!(decryptor.is_shift_right);

        assert!(decryptor.pseudocode.contains(
            "return (_rotr64(<ParamName> ^ 0xBADF00D, 0x11) ^ 0xC0FFEE) >> 0x05;"
        ));

        // Coverage spans from the staging mov to the final shift.
        assert_eq!(found.range.offset, 0);
        assert_eq!(found.range.end(), bytes.len() as u64);
    }

    #[test]
    fn test_chain_via_register_constant() {
        // mov rcx, imm; xor via register; rol; xor imm; shl
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&[0x48, 0xC7, 0xC1, 0x0D, 0xF0, 0xAD, 0x0B]); // mov rcx, 0xBADF00D
        bytes.extend_from_slice(&[0x48, 0x31, 0xC8]); // xor rax, rcx
        bytes.extend_from_slice(&[0x48, 0xC1, 0xC0, 0x07]); // rol rax, 7
        bytes.extend_from_slice(&[0x48, 0x35, 0xEE, 0xFF, 0xC0, 0x00]); // xor rax, 0xC0FFEE
        bytes.extend_from_slice(&[0x48, 0xC1, 0xE0, 0x03]); // shl rax, 3
        let reader = reader_over("regchain", &bytes);

        let found = extract_decryptors::<u64>(&reader, 0, bytes.len() as u64).unwrap();
        let decryptor = &found.value[0];

        // The register xor resolves through the tracked constant.
        assert_eq!(decryptor.xor1, 0x0BAD_F00D);
        assert_eq!(decryptor.xor2, 0x00C0_FFEE);
        assert!(!decryptor.is_rotate_right);
        assert_eq!(decryptor.rotate, 0x07);
        assert!(!decryptor.is_shift_right);
        assert_eq!(decryptor.shift, 0x03);
    }

    #[test]
    fn test_untracked_register_xor_marks_xor3() {
        // xor imm; ror; xor rdx (untracked); xor imm; shr
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&[0x48, 0x35, 0x11, 0x11, 0x00, 0x00]); // xor rax, 0x1111
        bytes.extend_from_slice(&[0x48, 0xC1, 0xC8, 0x09]); // ror rax, 9
        bytes.extend_from_slice(&[0x48, 0x31, 0xD0]); // xor rax, rdx
        bytes.extend_from_slice(&[0x48, 0x35, 0x22, 0x22, 0x00, 0x00]); // xor rax, 0x2222
        bytes.extend_from_slice(&[0x48, 0xC1, 0xE8, 0x04]); // shr rax, 4
        let reader = reader_over("xor3", &bytes);

        let found = extract_decryptors::<u64>(&reader, 0, bytes.len() as u64).unwrap();
        let decryptor = &found.value[0];

        assert_eq!(decryptor.xor1, 0x1111);
        assert_eq!(decryptor.xor2, 0x2222);
        assert!(decryptor.xor3_from_reg);
    }

    #[test]
    fn test_width_mismatch_is_ignored() {
        // A complete 64-bit chain yields nothing when scanning for 32-bit.
        let bytes = chain_64(0x1111, 0x2222);
        let reader = reader_over("width", &bytes);
        assert!(extract_decryptors::<u32>(&reader, 0, bytes.len() as u64).is_none());
    }

    #[test]
    fn test_32bit_chain() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&[0x35, 0x0D, 0xF0, 0xAD, 0x0B]); // xor eax, 0xBADF00D
        bytes.extend_from_slice(&[0xC1, 0xC8, 0x0B]); // ror eax, 11
        bytes.extend_from_slice(&[0x35, 0xEE, 0xFF, 0xC0, 0x00]); // xor eax, 0xC0FFEE
        bytes.extend_from_slice(&[0xC1, 0xE8, 0x02]); // shr eax, 2
        let reader = reader_over("x32", &bytes);

        let found = extract_decryptors::<u32>(&reader, 0, bytes.len() as u64).unwrap();
        let decryptor = &found.value[0];

        assert!(decryptor.is_32bit);
        assert_eq!(decryptor.xor1, 0x0BAD_F00D);
        assert_eq!(decryptor.xor2, 0x00C0_FFEE);
        assert!(decryptor.pseudocode.contains("_rotr("));
        assert!(decryptor.pseudocode.contains("std::uint32_t"));
    }

    #[test]
    fn test_incomplete_chain_yields_nothing() {
        // xor + ror but no second xor or shift.
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&[0x48, 0x35, 0x11, 0x11, 0x00, 0x00]);
        bytes.extend_from_slice(&[0x48, 0xC1, 0xC8, 0x09]);
        let reader = reader_over("incomplete", &bytes);

        assert!(extract_decryptors::<u64>(&reader, 0, bytes.len() as u64).is_none());
    }

    #[test]
    fn test_interleaved_chains_report_in_creation_order() {
        // Two interleaved 32-bit chains on eax and ecx.
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&[0x35, 0x01, 0x01, 0x00, 0x00]); // xor eax, 0x101
        bytes.extend_from_slice(&[0x81, 0xF1, 0x02, 0x02, 0x00, 0x00]); // xor ecx, 0x202
        bytes.extend_from_slice(&[0xC1, 0xC8, 0x03]); // ror eax, 3
        bytes.extend_from_slice(&[0xC1, 0xC9, 0x04]); // ror ecx, 4
        bytes.extend_from_slice(&[0x35, 0x05, 0x05, 0x00, 0x00]); // xor eax, 0x505
        bytes.extend_from_slice(&[0x81, 0xF1, 0x06, 0x06, 0x00, 0x00]); // xor ecx, 0x606
        bytes.extend_from_slice(&[0xC1, 0xE9, 0x08]); // shr ecx, 8 (ecx completes first)
        bytes.extend_from_slice(&[0xC1, 0xE8, 0x07]); // shr eax, 7
        let reader = reader_over("interleaved", &bytes);

        let found = extract_decryptors::<u32>(&reader, 0, bytes.len() as u64).unwrap();
        assert_eq!(found.value.len(), 2);

        // eax's chain was created first, so it reports first even though
        // ecx's completed first.
        assert_eq!(found.value[0].xor1, 0x101);
        assert_eq!(found.value[0].shift, 7);
        assert_eq!(found.value[1].xor1, 0x202);
        assert_eq!(found.value[1].shift, 8);
    }
}
