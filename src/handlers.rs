//! Search handlers.
//!
//! One handler per search type, registered with the driver before a pass.
//! The immediate/displacement/reference handlers share a generic matcher
//! pipeline parameterized by the extractor; the cross-reference handler
//! re-enters the driver for the referenced region; the decryptor handlers
//! pair extracted chains with grouped targets.

use crate::asm;
use crate::config::{AccessType, MatcherMode, MatcherType, Range, RegionType, SearchType};
use crate::decryptor::{self, DecryptWidth, Decryptor};
use crate::dump::DumpReader;
use crate::finder::{Finding, FoundValue, OffsetFinder, SearchHandlerFn};
use crate::matcher;
use crate::pattern::{self, MatchRange};
use crate::resolver::{self, Extraction};

use tracing::{debug, info, warn};

/// The default handler table covering every search type.
pub fn default_search_handlers() -> Vec<(SearchType, SearchHandlerFn)> {
    vec![
        (SearchType::Immediate, immediate_handler as SearchHandlerFn),
        (SearchType::Displacement, displacement_handler),
        (SearchType::Reference, reference_handler),
        (SearchType::XReference, xreference_handler),
        (SearchType::TslDecryptor32, tsl_decryptor32_handler),
        (SearchType::TslDecryptor64, tsl_decryptor64_handler),
    ]
}

/// Pre-hook run for each `Normal` region: resolves the region base before
/// any of its targets are searched.
pub fn region_handler(finder: &mut OffsetFinder, region_index: usize) -> bool {
    match finder.regions()[region_index].region_type {
        RegionType::Function => finder.set_function_base(region_index).is_some(),
        RegionType::Section => {
            let name = finder.regions()[region_index].region_id.clone();

            let Some(section) = finder.reader().section(&name).cloned() else {
                warn!("section region '{}' not found in the PE section table", name);
                return false;
            };

            let region = &mut finder.regions_mut()[region_index];
            region.region_range.offset = section.virtual_offset;
            region.region_range.size = section.virtual_size;
            true
        }
    }
}

/// Compute the search window for a target, relative to the region base.
///
/// The offset backs up by the offset variation (clamped at zero); the size
/// grows by both variations. A declared size at or below its own variation
/// falls back to the region size, and the final window is truncated to the
/// region's extent.
pub fn set_boundaries(region_range: &Range, search_range: &Range) -> MatchRange {
    let region_size = region_range.size + region_range.size_variation;

    let mut offset = search_range.offset;
    let mut size =
        search_range.offset_variation + search_range.size + search_range.size_variation;

    if offset >= search_range.offset_variation {
        offset -= search_range.offset_variation;
    } else {
        offset = 0;
    }

    if search_range.size <= search_range.size_variation {
        let variation = if search_range.size_variation == 0 {
            region_range.size_variation
        } else {
            0
        };

        size = region_range.size + variation;
    }

    if offset + size > region_size {
        size = region_size.saturating_sub(offset);
    }

    MatchRange::new(offset, size)
}

/// Result of the matcher pipeline: the extracted value plus the coverage
/// used for range synchronization.
struct PipelineResult<T> {
    extraction: Extraction<T>,
    coverage: MatchRange,
}

/// Generic matcher pipeline.
///
/// With no matchers declared, the extractor runs over the adjusted window
/// directly and the matched instruction's own range becomes the coverage.
/// Otherwise matchers run in declared order — `First` accepts one match,
/// `All` requires every matcher to agree on the same instruction offset —
/// and the extractor starts at the agreed instruction.
fn run_value_extractor<T>(
    finder: &OffsetFinder,
    region_index: usize,
    target_index: usize,
    extract: &dyn Fn(&DumpReader, u64, u64) -> Option<Extraction<T>>,
) -> Option<PipelineResult<T>> {
    let region = &finder.regions()[region_index];
    let target = &region.search_for[target_index];

    let window = set_boundaries(&region.region_range, &target.search_range);
    let search_start = region.region_range.offset + window.offset;

    if target.matcher_mode == MatcherMode::None {
        debug!(
            "extracting (id: {}) without matcher, using the search range only",
            target.search_id
        );

        let extraction = extract(finder.reader(), search_start, window.size)?;

        return Some(PipelineResult {
            coverage: extraction.range,
            extraction,
        });
    }

    if target.matchers.is_empty() {
        warn!(
            "'Matchers' must contain a matcher in modes other than 'None' (id: {})",
            target.search_id
        );
        return None;
    }

    let to_match = match target.matcher_mode {
        MatcherMode::First => 1,
        _ => target.matchers.len(),
    };

    let mut matcher_ranges: Vec<MatchRange> = Vec::new();
    let mut instruction_offsets: Vec<u64> = Vec::new();
    let mut instruction_offset = 0u64;
    let mut successful = 0usize;

    for matcher_config in &target.matchers {
        debug!(
            "locating target instruction with {:?} (id: {})",
            matcher_config.kind, target.search_id
        );

        let found: Option<MatchRange> = match matcher_config.kind {
            MatcherType::Pattern => matcher_config.value.text().and_then(|text| {
                pattern::find_pattern_in_range(finder.reader(), search_start, window.size, text)
            }),
            MatcherType::PatternSubsequence => pattern::find_pattern_subsequence(
                finder.reader(),
                search_start,
                window.size,
                &matcher_config.value.texts(),
            )
            .and_then(|m| m.matches.get(matcher_config.index).copied()),
            MatcherType::InstructionSubsequence => {
                let mut templates = Vec::new();

                for line in matcher_config.value.texts() {
                    match asm::parse_instruction(&line) {
                        Some(template) => templates.push(template),
                        None => {
                            warn!("failed to parse matcher instruction '{}'", line);
                            return None;
                        }
                    }
                }

                if templates.is_empty() {
                    warn!("no matcher instructions were parsed (id: {})", target.search_id);
                    return None;
                }

                matcher::find_instruction_subsequence(
                    finder.reader(),
                    search_start,
                    window.size,
                    &templates,
                )
                .and_then(|m| m.matches.get(matcher_config.index).copied())
            }
        };

        if let Some(range) = found {
            matcher_ranges.push(range);
            instruction_offset = range.offset + matcher_config.offset;
            instruction_offsets.push(instruction_offset);
            successful += 1;
        }

        if successful == to_match {
            break;
        }
    }

    if successful < to_match {
        warn!(
            "failed to match instruction with matcher(s) (mode: {:?}, id: {})",
            target.matcher_mode, target.search_id
        );
        return None;
    }

    if instruction_offsets.iter().any(|&offset| offset != instruction_offset) {
        warn!(
            "all matchers succeeded but instruction offsets differ (id: {})",
            target.search_id
        );

        for (i, offset) in instruction_offsets.iter().enumerate() {
            warn!("  {}: 0x{:X}", i, offset);
        }

        return None;
    }

    let lowest = matcher_ranges.iter().map(|r| r.offset).min()?;
    let highest = matcher_ranges.iter().map(|r| r.end()).max()?;

    let extraction = extract(finder.reader(), instruction_offset, window.size)?;

    Some(PipelineResult {
        extraction,
        coverage: MatchRange::new(lowest, highest - lowest),
    })
}

/// Shared tail of the scalar handlers: sync the coverage and record the
/// finding.
fn finish_scalar<T: Copy>(
    finder: &mut OffsetFinder,
    region_index: usize,
    target_index: usize,
    result: PipelineResult<T>,
    wrap: fn(T) -> FoundValue,
) -> bool {
    let region_offset = finder.regions()[region_index].region_range.offset;
    let target = finder.regions()[region_index].search_for[target_index].clone();
    let value = wrap(result.extraction.value);

    info!("found value (id: {}): {}", target.search_id, value);

    finder.sync_search_range(
        region_index,
        target_index,
        MatchRange::new(
            result.coverage.offset - region_offset,
            result.coverage.size,
        ),
    );

    finder.add_find(Finding { target, value });
    true
}

pub fn immediate_handler(
    finder: &mut OffsetFinder,
    region_index: usize,
    target_index: usize,
) -> bool {
    let Some(result) = run_value_extractor(finder, region_index, target_index, &|reader,
                                                                                 start,
                                                                                 size| {
        resolver::extract_immediate(reader, start, size)
    }) else {
        warn!(
            "unable to find immediate value (id: {})",
            finder.regions()[region_index].search_for[target_index].search_id
        );
        return false;
    };

    finish_scalar(finder, region_index, target_index, result, FoundValue::U64)
}

pub fn displacement_handler(
    finder: &mut OffsetFinder,
    region_index: usize,
    target_index: usize,
) -> bool {
    let Some(result) = run_value_extractor(finder, region_index, target_index, &|reader,
                                                                                 start,
                                                                                 size| {
        resolver::extract_displacement(reader, start, size)
    }) else {
        warn!(
            "unable to find displacement value (id: {})",
            finder.regions()[region_index].search_for[target_index].search_id
        );
        return false;
    };

    finish_scalar(finder, region_index, target_index, result, FoundValue::U32)
}

pub fn reference_handler(
    finder: &mut OffsetFinder,
    region_index: usize,
    target_index: usize,
) -> bool {
    let Some(result) = run_value_extractor(finder, region_index, target_index, &|reader,
                                                                                 start,
                                                                                 size| {
        resolver::resolve_rip_relative(reader, start, size, None)
    }) else {
        warn!(
            "unable to resolve RIP-relative value (id: {})",
            finder.regions()[region_index].search_for[target_index].search_id
        );
        return false;
    };

    finish_scalar(finder, region_index, target_index, result, FoundValue::U64)
}

/// Resolve a RIP-relative target, then enter the referenced region with its
/// base set to that target and handle its own targets. Adds no finding of
/// its own; the source target's range still syncs from its matchers.
pub fn xreference_handler(
    finder: &mut OffsetFinder,
    region_index: usize,
    target_index: usize,
) -> bool {
    let search_id = finder.regions()[region_index].search_for[target_index]
        .search_id
        .clone();

    let Some(result) = run_value_extractor(finder, region_index, target_index, &|reader,
                                                                                 start,
                                                                                 size| {
        resolver::resolve_rip_relative(reader, start, size, None)
    }) else {
        warn!("unable to resolve cross-reference offset (id: {})", search_id);
        return false;
    };

    let target_offset = result.extraction.value;
    info!(
        "resolved cross-reference offset (id: {}): 0x{:X}",
        search_id, target_offset
    );

    let next_id = finder.regions()[region_index].search_for[target_index]
        .next_region
        .as_ref()
        .map(|n| n.id.clone());

    let Some(next_id) = next_id else {
        warn!("cross-reference target '{}' names no next region", search_id);
        return false;
    };

    let mut handled = false;

    if let Some(next_index) = finder
        .regions()
        .iter()
        .position(|r| r.region_id == next_id)
    {
        if finder.regions()[next_index].access_type != AccessType::XReference {
            warn!(
                "found region '{}' but its access type is not 'XReference'",
                next_id
            );
        } else if !finder.enter_region(&next_id) {
            warn!(
                "refusing cross-reference into already-visited region '{}'",
                next_id
            );
        } else {
            finder.regions_mut()[next_index].region_range.offset = target_offset;
            finder.handle_search_targets(next_index);
            handled = true;
        }
    } else {
        warn!("cross-referenced region '{}' does not exist", next_id);
    }

    let region_offset = finder.regions()[region_index].region_range.offset;
    finder.sync_search_range(
        region_index,
        target_index,
        MatchRange::new(
            result.coverage.offset - region_offset,
            result.coverage.size,
        ),
    );

    if !handled {
        warn!("failed to handle cross-reference (id: {})", search_id);
        return false;
    }

    true
}

pub fn tsl_decryptor32_handler(
    finder: &mut OffsetFinder,
    region_index: usize,
    target_index: usize,
) -> bool {
    decryptor_handler::<u32>(finder, region_index, target_index, FoundValue::Decryptor32)
}

pub fn tsl_decryptor64_handler(
    finder: &mut OffsetFinder,
    region_index: usize,
    target_index: usize,
) -> bool {
    decryptor_handler::<u64>(finder, region_index, target_index, FoundValue::Decryptor64)
}

/// Extract decryption chains over the target's window.
///
/// A grouped target consumes every same-type member of its group across the
/// whole search set: the extractor must return exactly one chain per member
/// and each member is paired with the chain at its own group index. All
/// members are marked handled either way.
fn decryptor_handler<W: DecryptWidth>(
    finder: &mut OffsetFinder,
    region_index: usize,
    target_index: usize,
    wrap: fn(Decryptor<W>) -> FoundValue,
) -> bool {
    let (window, region_offset, search_id, group, search_type) = {
        let region = &finder.regions()[region_index];
        let target = &region.search_for[target_index];

        (
            set_boundaries(&region.region_range, &target.search_range),
            region.region_range.offset,
            target.search_id.clone(),
            target.group.clone(),
            target.search_type,
        )
    };

    let label = if W::IS_32BIT {
        "TslDecryptor32"
    } else {
        "TslDecryptor64"
    };

    let Some(scan) = decryptor::extract_decryptors::<W>(
        finder.reader(),
        region_offset + window.offset,
        window.size,
    ) else {
        warn!("unable to find {} function(s) (id: {})", label, search_id);
        return false;
    };

    let decryptors = scan.value;

    if let Some(group) = group {
        // (region index, target index, group index) of every member.
        let mut members: Vec<(usize, usize, usize)> = Vec::new();
        let mut members_valid = true;

        for r in 0..finder.regions().len() {
            for t in 0..finder.regions()[r].search_for.len() {
                let candidate = &finder.regions()[r].search_for[t];

                let Some(candidate_group) = &candidate.group else {
                    continue;
                };

                if candidate_group.id != group.id {
                    continue;
                }

                if candidate.search_type != search_type {
                    warn!(
                        "grouped finds must share a search type (group: {}, id: {})",
                        group.id, candidate.search_id
                    );
                    continue;
                }

                match candidate_group.index {
                    Some(index) => members.push((r, t, index)),
                    None => {
                        warn!(
                            "group member '{}' lacks a group index",
                            candidate.search_id
                        );
                        members_valid = false;
                    }
                }
            }
        }

        // Exclude every member from future driver dispatch; this handler
        // is the only place the group is processed.
        for &(r, t, _) in &members {
            finder.regions_mut()[r].search_for[t].handled = true;
        }

        if !members_valid {
            return false;
        }

        members.sort_by_key(|&(_, _, index)| index);

        if decryptors.len() != members.len() {
            warn!(
                "group '{}' expects {} decryptors but {} were extracted (id: {})",
                group.id,
                members.len(),
                decryptors.len(),
                search_id
            );
            return false;
        }

        info!("found {} functions (group: {}):", label, group.id);

        for &(r, t, index) in &members {
            let Some(decryptor) = decryptors.get(index) else {
                warn!(
                    "group index {} is out of range of the extracted decryptors (group: {})",
                    index, group.id
                );
                return false;
            };

            let member = finder.regions()[r].search_for[t].clone();
            info!("  {}: {}", member.search_id, decryptor);

            finder.add_find(Finding {
                target: member,
                value: wrap(decryptor.clone()),
            });
        }

        return true;
    }

    // Lone target: use the first extracted chain.
    let Some(first) = decryptors.first().cloned() else {
        return false;
    };

    info!("found {} function (id: {}): {}", label, search_id, first);

    finder.sync_search_range(
        region_index,
        target_index,
        MatchRange::new(scan.range.offset - region_offset, scan.range.size),
    );

    let target = {
        let target = &mut finder.regions_mut()[region_index].search_for[target_index];
        target.handled = true;
        target.clone()
    };

    finder.add_find(Finding {
        target,
        value: wrap(first),
    });
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(offset: u64, size: u64, offset_variation: u64, size_variation: u64) -> Range {
        Range {
            offset,
            size,
            offset_variation,
            size_variation,
        }
    }

    #[test]
    fn test_boundaries_plain_window() {
        let region = range(0, 0x1000, 0, 0);
        let search = range(0x100, 0x40, 0, 0);

        let window = set_boundaries(&region, &search);
        assert_eq!(window, MatchRange::new(0x100, 0x40));
    }

    #[test]
    fn test_boundaries_offset_variation_backs_up() {
        let region = range(0, 0x1000, 0, 0);
        let search = range(0x100, 0x40, 0x20, 0x10);

        let window = set_boundaries(&region, &search);
        assert_eq!(window.offset, 0xE0);
        assert_eq!(window.size, 0x20 + 0x40 + 0x10);
    }

    #[test]
    fn test_boundaries_offset_variation_clamps_at_zero() {
        let region = range(0, 0x1000, 0, 0);
        let search = range(0x10, 0x40, 0x100, 0);

        let window = set_boundaries(&region, &search);
        assert_eq!(window.offset, 0x10);
    }

    #[test]
    fn test_boundaries_small_size_falls_back_to_region() {
        let region = range(0, 0x1000, 0, 0x80);

        // No declared size at all: region size plus region variation.
        let window = set_boundaries(&region, &range(0, 0, 0, 0));
        assert_eq!(window, MatchRange::new(0, 0x1080));

        // Size at or below its own variation: region size alone.
        let window = set_boundaries(&region, &range(0, 0x10, 0, 0x20));
        assert_eq!(window, MatchRange::new(0, 0x1000));
    }

    #[test]
    fn test_boundaries_truncated_to_region_end() {
        let region = range(0, 0x100, 0, 0);
        let search = range(0xF0, 0x40, 0, 0);

        let window = set_boundaries(&region, &search);
        assert_eq!(window, MatchRange::new(0xF0, 0x10));
    }
}
