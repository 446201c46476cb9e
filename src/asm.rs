//! Textual instruction parsing for instruction matching.
//!
//! Turns lines like `mov rax, [rcx+0x18]` or `lea ?, [rip+?]` into match
//! templates. `?` is a wildcard at every level: mnemonic, whole operand, or
//! any component of a memory operand. Segment prefixes and operand encodings
//! are not parsed.

use iced_x86::{Mnemonic, Register};

use std::collections::HashMap;
use std::sync::OnceLock;

/// Memory operand template. Absent fields are wildcards.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemOperandPattern {
    pub base: Option<Register>,
    pub index: Option<Register>,
    pub scale: Option<u8>,
    pub disp: Option<i64>,
}

/// One parsed operand shape. A `None` operand slot in
/// [`InstructionPattern::operands`] is a total wildcard.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperandPattern {
    Register(Register),
    Immediate(u64),
    Memory(MemOperandPattern),
}

/// A parsed instruction template. An absent mnemonic matches any mnemonic;
/// the operand vector length must equal a candidate's visible operand count.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InstructionPattern {
    pub mnemonic: Option<Mnemonic>,
    pub operands: Vec<Option<OperandPattern>>,
}

// The mnemonic and register lookup tables are process-wide shared state,
// initialized exactly once on first use and read-only thereafter.

fn mnemonic_table() -> &'static HashMap<String, Mnemonic> {
    static TABLE: OnceLock<HashMap<String, Mnemonic>> = OnceLock::new();

    TABLE.get_or_init(|| {
        Mnemonic::values()
            .filter(|&m| m != Mnemonic::INVALID)
            .map(|m| (format!("{:?}", m).to_uppercase(), m))
            .collect()
    })
}

fn register_table() -> &'static HashMap<String, Register> {
    static TABLE: OnceLock<HashMap<String, Register>> = OnceLock::new();

    TABLE.get_or_init(|| {
        Register::values()
            .filter(|&r| r != Register::None)
            .map(|r| (format!("{:?}", r).to_uppercase(), r))
            .collect()
    })
}

/// Case-insensitive mnemonic lookup.
pub fn parse_mnemonic(text: &str) -> Option<Mnemonic> {
    mnemonic_table().get(&text.to_uppercase()).copied()
}

/// Case-insensitive register lookup.
pub fn parse_register(text: &str) -> Option<Register> {
    register_table().get(&text.to_uppercase()).copied()
}

fn is_register(text: &str) -> bool {
    parse_register(text).is_some()
}

fn parse_u64(text: &str) -> Option<u64> {
    let text = text.trim();

    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        text.parse().ok()
    }
}

/// Parse the inside of a `[...]` memory operand. Components are split on
/// `+`/`-` boundaries; each is `?`, a `reg*scale` pair (either side may be
/// `?`), a plain register, or a signed displacement. Displacements
/// accumulate; base and index slots fill in appearance order.
pub fn parse_memory_operand(text: &str) -> Option<MemOperandPattern> {
    let trimmed = text.trim();

    if trimmed.len() < 2 || !trimmed.starts_with('[') || !trimmed.ends_with(']') {
        return None;
    }

    let content = &trimmed[1..trimmed.len() - 1];
    let mut operand = MemOperandPattern::default();

    let mut tokens: Vec<(char, String)> = Vec::new();
    let mut sign = '+';
    let mut start = 0usize;

    for (i, c) in content.char_indices() {
        if c == '+' || c == '-' {
            tokens.push((sign, content[start..i].to_string()));
            sign = c;
            start = i + 1;
        }
    }
    tokens.push((sign, content[start..].to_string()));

    for (sign, token) in tokens {
        let token = token.trim();

        if token.is_empty() || token == "?" {
            // Wildcard component; leaves every slot untouched.
            continue;
        }

        if let Some(star) = token.find('*') {
            let reg = token[..star].trim();
            let scale = token[star + 1..].trim();

            if reg != "?" {
                operand.index = parse_register(reg);
            }

            if scale != "?" {
                operand.scale = Some(parse_u64(scale)? as u8);
            }
        } else if is_register(token) {
            let register = parse_register(token);

            if operand.base.is_none() {
                operand.base = register;
            } else {
                operand.index = register;
            }
        } else {
            let mut value = parse_u64(token)? as i64;

            if sign == '-' {
                value = -value;
            }

            operand.disp = Some(operand.disp.unwrap_or(0) + value);
        }
    }

    Some(operand)
}

/// Parse one textual instruction into a match template.
///
/// Operand tokens are comma-separated; the mnemonic is the first
/// whitespace-delimited word. Returns `None` for an unknown mnemonic or an
/// unparseable immediate; a malformed memory operand degrades to a wildcard.
pub fn parse_instruction(text: &str) -> Option<InstructionPattern> {
    let mut parts: Vec<String> = text.split(',').map(|s| s.to_string()).collect();

    if parts.is_empty() {
        return None;
    }

    let first = parts[0].trim().to_string();
    let mnemonic_text = match first.find(char::is_whitespace) {
        Some(space) => {
            let (mnemonic, rest) = first.split_at(space);
            parts[0] = rest.to_string();
            mnemonic.to_string()
        }
        None => {
            parts.remove(0);
            first
        }
    };

    let mnemonic_text = mnemonic_text.trim();

    let mut pattern = InstructionPattern::default();

    if mnemonic_text != "?" {
        pattern.mnemonic = Some(parse_mnemonic(mnemonic_text)?);
    }

    for raw in parts {
        let token = raw.trim();

        let operand = if token == "?" {
            None
        } else if token.starts_with('[') && token.ends_with(']') {
            // A malformed memory operand degrades to a wildcard.
            parse_memory_operand(token).map(OperandPattern::Memory)
        } else if is_register(token) {
            Some(OperandPattern::Register(parse_register(token)?))
        } else {
            Some(OperandPattern::Immediate(parse_u64(token)?))
        };

        pattern.operands.push(operand);
    }

    Some(pattern)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_tables_case_insensitive() {
        assert_eq!(parse_mnemonic("mov"), Some(Mnemonic::Mov));
        assert_eq!(parse_mnemonic("MOV"), Some(Mnemonic::Mov));
        assert_eq!(parse_register("rax"), Some(Register::RAX));
        assert_eq!(parse_register("R15"), Some(Register::R15));
        assert!(parse_mnemonic("frobnicate").is_none());
        assert!(parse_register("rqq").is_none());
    }

    #[test]
    fn test_parse_register_operands() {
        let pattern = parse_instruction("mov rax, rcx").unwrap();
        assert_eq!(pattern.mnemonic, Some(Mnemonic::Mov));
        assert_eq!(pattern.operands.len(), 2);
        assert_eq!(
            pattern.operands[0],
            Some(OperandPattern::Register(Register::RAX))
        );
        assert_eq!(
            pattern.operands[1],
            Some(OperandPattern::Register(Register::RCX))
        );
    }

    #[test]
    fn test_parse_wildcards() {
        // The first whitespace-delimited word is the mnemonic, so a fully
        // wildcarded two-operand template reads "? ?, ?".
        let pattern = parse_instruction("? ?, ?").unwrap();
        assert_eq!(pattern.mnemonic, None);
        assert_eq!(pattern.operands, vec![None, None]);

        let pattern = parse_instruction("xor ?, 0x11").unwrap();
        assert_eq!(pattern.mnemonic, Some(Mnemonic::Xor));
        assert_eq!(pattern.operands[0], None);
        assert_eq!(pattern.operands[1], Some(OperandPattern::Immediate(0x11)));
    }

    #[test]
    fn test_parse_memory_operand_components() {
        let mem = parse_memory_operand("[rcx+rdx*4+0x18]").unwrap();
        assert_eq!(mem.base, Some(Register::RCX));
        assert_eq!(mem.index, Some(Register::RDX));
        assert_eq!(mem.scale, Some(4));
        assert_eq!(mem.disp, Some(0x18));

        let mem = parse_memory_operand("[rbp-0x20]").unwrap();
        assert_eq!(mem.base, Some(Register::RBP));
        assert_eq!(mem.disp, Some(-0x20));

        let mem = parse_memory_operand("[rip+?]").unwrap();
        assert_eq!(mem.base, Some(Register::RIP));
        assert_eq!(mem.disp, None);
    }

    #[test]
    fn test_memory_operand_accumulates_displacements() {
        let mem = parse_memory_operand("[rax+0x10-0x4]").unwrap();
        assert_eq!(mem.disp, Some(0xC));
    }

    #[test]
    fn test_memory_base_then_index_order() {
        let mem = parse_memory_operand("[rax+rbx]").unwrap();
        assert_eq!(mem.base, Some(Register::RAX));
        assert_eq!(mem.index, Some(Register::RBX));
    }

    #[test]
    fn test_unknown_mnemonic_fails() {
        assert!(parse_instruction("blorp rax, rcx").is_none());
    }

    #[test]
    fn test_plain_mnemonic_without_operands() {
        let pattern = parse_instruction("ret").unwrap();
        assert_eq!(pattern.mnemonic, Some(Mnemonic::Ret));
        assert!(pattern.operands.is_empty());
    }
}
