//! # offscan
//!
//! An offset-discovery engine for 64-bit Windows executable dumps.
//!
//! ## Overview
//!
//! Given a memory dump of a process (or a raw on-disk image) and a declarative
//! JSON search configuration, offscan locates semantically meaningful byte
//! positions inside the image — function entry points, hardcoded constants,
//! instruction displacements, RIP-relative references, and small obfuscated
//! decryption routines — and collects them as a named finding list.
//!
//! The engine works in layers:
//!
//! 1. [`dump::DumpReader`] maps virtual offsets back to file offsets for
//!    region-mode dumps and parses the PE section table from the image.
//! 2. [`pattern`], [`matcher`] and [`resolver`] scan byte ranges for byte
//!    patterns with nibble wildcards, partially-wildcarded instruction
//!    templates, and RIP-relative targets.
//! 3. [`decryptor`] symbolically recovers chains of `XOR`/`ROR`/`SHR`
//!    arithmetic on a tracked register into closed-form pseudocode.
//! 4. [`finder::OffsetFinder`] drives everything from a search configuration
//!    and optionally syncs the discovered ranges back into it, so the next
//!    run against a slightly changed binary needs less search work.

#![warn(clippy::all)]
#![warn(rust_2018_idioms)]

pub mod error;
pub mod pe;
pub mod dump;
pub mod pattern;
pub mod asm;
pub mod matcher;
pub mod resolver;
pub mod decryptor;
pub mod codegen;
pub mod config;
pub mod finder;
pub mod handlers;

pub use error::{Error, Result};
pub use dump::{DumpMetadata, DumpProducer, DumpReader, MemoryRegion, Mode};
pub use finder::{Finding, FoundValue, OffsetFinder};
pub use pattern::MatchRange;
