//! Search configuration model and loading.
//!
//! The configuration is a JSON array of regions; comments (`//` and
//! `/* */`) are allowed and stripped before parsing. The raw document is
//! kept alongside the typed model so discovered ranges can be written back
//! in place without disturbing unrelated keys.
//!
//! A malformed entry is skipped with a log line at its own granularity — a
//! bad anchor drops the anchor, a bad target drops the target, a bad region
//! drops the region. Parsing never aborts the pass.

use crate::error::{Error, Result};
use crate::pattern::MatchRange;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use std::fs;
use std::path::Path;

/// How a region's base is resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegionType {
    Section,
    Function,
}

/// How a region is reached by the driver. `Normal` regions are iterated
/// directly; `XReference` regions are only entered through a
/// cross-reference target that sets their base first.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessType {
    #[default]
    Normal,
    XReference,
}

/// What a search target extracts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SearchType {
    Immediate,
    Displacement,
    Reference,
    XReference,
    TslDecryptor32,
    TslDecryptor64,
}

/// How a target's matchers combine. `None` means no matchers are declared
/// and the extractor runs over the search window directly.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatcherMode {
    #[default]
    None,
    First,
    All,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatcherType {
    Pattern,
    PatternSubsequence,
    InstructionSubsequence,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnchorType {
    String,
    Pattern,
    PatternSubsequence,
    InstructionSubsequence,
}

/// A byte window with drift tolerances. The variation fields only exist in
/// configuration form; they widen matching windows across binary updates
/// and are never rewritten by sync.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Range {
    pub offset: u64,
    pub size: u64,
    pub offset_variation: u64,
    pub size_variation: u64,
}

/// A configuration value that is either one string or a list of strings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    One(String),
    Many(Vec<String>),
}

impl ConfigValue {
    /// The single-string form, when that is what the entry holds.
    pub fn text(&self) -> Option<&str> {
        match self {
            ConfigValue::One(s) => Some(s),
            ConfigValue::Many(_) => None,
        }
    }

    /// The list form; a single string becomes a one-element list.
    pub fn texts(&self) -> Vec<String> {
        match self {
            ConfigValue::One(s) => vec![s.clone()],
            ConfigValue::Many(list) => list.clone(),
        }
    }
}

/// A declarative marker used to verify candidate function bases.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Anchor {
    #[serde(rename = "Type")]
    pub kind: AnchorType,
    pub value: ConfigValue,
    /// Selects among multiple occurrences of a `String` anchor.
    #[serde(default)]
    pub index: u64,
}

/// A sub-rule locating the instruction a value is extracted from.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Matcher {
    #[serde(rename = "Type")]
    pub kind: MatcherType,
    pub value: ConfigValue,
    /// Offset from the matched range to the target instruction.
    #[serde(default)]
    pub offset: u64,
    /// Which step of a subsequence anchors the target instruction.
    #[serde(default)]
    pub index: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NextRegion {
    #[serde(rename = "ID")]
    pub id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Group {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(default)]
    pub index: Option<usize>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct PrintGroup {
    #[serde(rename = "ID")]
    pub id: String,
    pub index: usize,
}

/// Layout instructions for the external printer. Targets without one are
/// not printed.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PrintSpec {
    pub name: String,
    #[serde(default)]
    pub group: PrintGroup,
}

/// One search target inside a region.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SearchTarget {
    #[serde(rename = "SearchID")]
    pub search_id: String,
    pub search_type: SearchType,
    #[serde(default)]
    pub search_range: Range,
    #[serde(default)]
    pub matcher_mode: MatcherMode,
    #[serde(default)]
    pub matchers: Vec<Matcher>,
    /// Required iff `search_type` is `XReference`.
    #[serde(default)]
    pub next_region: Option<NextRegion>,
    #[serde(default)]
    pub group: Option<Group>,
    #[serde(default)]
    pub print: Option<PrintSpec>,
    /// Set once a group handler has consumed this target; the driver skips
    /// handled targets.
    #[serde(skip)]
    pub handled: bool,
}

/// A region to search: a PE section or a function body, with anchors to
/// locate it and targets to find inside it.
#[derive(Clone, Debug)]
pub struct SearchRegion {
    pub region_id: String,
    pub region_type: RegionType,
    pub access_type: AccessType,
    pub region_range: Range,
    pub anchors: Vec<Anchor>,
    pub search_for: Vec<SearchTarget>,
}

/// Strip `//` and `/* */` comments outside string literals so the
/// configuration can carry annotations.
pub fn strip_json_comments(input: &str) -> String {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    let mut in_string = false;
    let mut escaped = false;

    while let Some(c) = chars.next() {
        if in_string {
            output.push(c);

            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }

            continue;
        }

        match c {
            '"' => {
                in_string = true;
                output.push(c);
            }
            '/' => match chars.peek() {
                Some('/') => {
                    for next in chars.by_ref() {
                        if next == '\n' {
                            output.push('\n');
                            break;
                        }
                    }
                }
                Some('*') => {
                    chars.next();
                    let mut prev = '\0';

                    for next in chars.by_ref() {
                        if prev == '*' && next == '/' {
                            break;
                        }
                        prev = next;
                    }
                }
                _ => output.push(c),
            },
            _ => output.push(c),
        }
    }

    output
}

/// Parse a configuration file into its raw document.
pub fn load_document(path: impl AsRef<Path>) -> Result<Value> {
    let content = fs::read_to_string(path.as_ref())?;
    let value: Value = serde_json::from_str(&strip_json_comments(&content))?;

    if !value.is_array() {
        return Err(Error::Config(
            "top-level search configuration must be an array of regions".into(),
        ));
    }

    Ok(value)
}

fn field<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    let v = value.get(key)?;
    if v.is_null() {
        None
    } else {
        Some(v)
    }
}

fn parse_entry<T: serde::de::DeserializeOwned>(value: &Value, what: &str) -> Option<T> {
    match serde_json::from_value(value.clone()) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            warn!("invalid {} entry, skipping: {}", what, e);
            None
        }
    }
}

/// Build the runtime region list from a raw document. Invalid entries are
/// skipped at their own granularity with a log line.
pub fn regions_from_document(document: &Value) -> Vec<SearchRegion> {
    let mut regions = Vec::new();

    let Some(entries) = document.as_array() else {
        warn!("search configuration is not an array; nothing to do");
        return regions;
    };

    for entry in entries {
        let Some(region_id) = field(entry, "RegionID").and_then(Value::as_str) else {
            warn!("region without 'RegionID', skipping");
            continue;
        };

        let Some(region_type) =
            field(entry, "RegionType").and_then(|v| parse_entry::<RegionType>(v, "RegionType"))
        else {
            warn!("region '{}' has an invalid 'RegionType', skipping", region_id);
            continue;
        };

        let access_type = match field(entry, "AccessType") {
            Some(v) => match parse_entry::<AccessType>(v, "AccessType") {
                Some(access) => access,
                None => {
                    warn!("region '{}' has an invalid 'AccessType', skipping", region_id);
                    continue;
                }
            },
            None => AccessType::default(),
        };

        let region_range = field(entry, "RegionRange")
            .and_then(|v| parse_entry::<Range>(v, "RegionRange"))
            .unwrap_or_default();

        let mut anchors = Vec::new();
        if let Some(list) = field(entry, "Anchors").and_then(Value::as_array) {
            for anchor in list {
                if let Some(anchor) = parse_entry::<Anchor>(anchor, "Anchor") {
                    anchors.push(anchor);
                }
            }
        }

        let mut search_for = Vec::new();
        if let Some(list) = field(entry, "SearchFor").and_then(Value::as_array) {
            for target in list {
                let Some(target) = parse_entry::<SearchTarget>(target, "SearchTarget") else {
                    continue;
                };

                if target.search_type == SearchType::XReference && target.next_region.is_none() {
                    warn!(
                        "target '{}' is an XReference but has no 'NextRegion', skipping",
                        target.search_id
                    );
                    continue;
                }

                search_for.push(target);
            }
        }

        regions.push(SearchRegion {
            region_id: region_id.to_string(),
            region_type,
            access_type,
            region_range,
            anchors,
            search_for,
        });
    }

    regions
}

/// Rewrite one target's `SearchRange` inside the raw document. The offset
/// is relative to the region base; variation fields are never touched.
pub fn sync_search_range(
    document: &mut Value,
    region_id: &str,
    search_id: &str,
    range: MatchRange,
) {
    let Some(regions) = document.as_array_mut() else {
        return;
    };

    for region in regions {
        if region.get("RegionID").and_then(Value::as_str) != Some(region_id) {
            continue;
        }

        if let Some(targets) = region.get_mut("SearchFor").and_then(Value::as_array_mut) {
            for target in targets {
                if target.get("SearchID").and_then(Value::as_str) != Some(search_id) {
                    continue;
                }

                target["SearchRange"]["Offset"] = Value::from(range.offset);
                target["SearchRange"]["Size"] = Value::from(range.size);
                return;
            }
        }

        return;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_strip_line_and_block_comments() {
        let input = "[\n  // region list\n  { \"A\": 1 }, /* trailing */ { \"B\": 2 }\n]";
        let stripped = strip_json_comments(input);
        let value: Value = serde_json::from_str(&stripped).unwrap();
        assert_eq!(value[0]["A"], 1);
        assert_eq!(value[1]["B"], 2);
    }

    #[test]
    fn test_strip_preserves_strings() {
        let input = r#"{ "url": "https://example.com/x", "p": "a /* not */ comment" }"#;
        let stripped = strip_json_comments(input);
        let value: Value = serde_json::from_str(&stripped).unwrap();
        assert_eq!(value["url"], "https://example.com/x");
        assert_eq!(value["p"], "a /* not */ comment");
    }

    fn sample_document() -> Value {
        json!([
            {
                "RegionID": ".text",
                "RegionType": "Section",
                "SearchFor": [
                    {
                        "SearchID": "SomeImmediate",
                        "SearchType": "Immediate",
                        "SearchRange": { "Offset": 16, "Size": 32, "SizeVariation": 8 },
                        "MatcherMode": "First",
                        "Matchers": [
                            { "Type": "Pattern", "Value": "48 8B ?? ??", "Offset": 2 }
                        ]
                    },
                    {
                        "SearchID": "BadType",
                        "SearchType": "Telepathy"
                    },
                    {
                        "SearchID": "DanglingXref",
                        "SearchType": "XReference"
                    }
                ]
            },
            {
                "RegionID": "SomeFunction",
                "RegionType": "Function",
                "AccessType": "XReference",
                "RegionRange": { "Size": 1024 },
                "Anchors": [
                    { "Type": "String", "Value": "Hello", "Index": 1 },
                    { "Type": "PatternSubsequence", "Value": ["48 89", "C3"] },
                    { "Type": "Hologram", "Value": "?" }
                ],
                "SearchFor": []
            },
            {
                "RegionID": "Broken",
                "RegionType": "Nonsense",
                "SearchFor": []
            }
        ])
    }

    #[test]
    fn test_regions_from_document_granular_skipping() {
        let regions = regions_from_document(&sample_document());

        // The "Broken" region is dropped entirely.
        assert_eq!(regions.len(), 2);

        // Bad target and dangling xref are dropped, the good one survives.
        let text = &regions[0];
        assert_eq!(text.region_id, ".text");
        assert_eq!(text.region_type, RegionType::Section);
        assert_eq!(text.access_type, AccessType::Normal);
        assert_eq!(text.search_for.len(), 1);

        let target = &text.search_for[0];
        assert_eq!(target.search_type, SearchType::Immediate);
        assert_eq!(target.matcher_mode, MatcherMode::First);
        assert_eq!(target.search_range.offset, 16);
        assert_eq!(target.search_range.size_variation, 8);
        assert_eq!(target.matchers.len(), 1);
        assert_eq!(target.matchers[0].offset, 2);
        assert!(!target.handled);

        // Bad anchor is dropped, the two good ones survive.
        let function = &regions[1];
        assert_eq!(function.access_type, AccessType::XReference);
        assert_eq!(function.anchors.len(), 2);
        assert_eq!(function.anchors[0].index, 1);
        assert_eq!(function.anchors[0].value.text(), Some("Hello"));
        assert_eq!(function.anchors[1].value.texts(), vec!["48 89", "C3"]);
    }

    #[test]
    fn test_sync_search_range_rewrites_in_place() {
        let mut document = sample_document();

        sync_search_range(
            &mut document,
            ".text",
            "SomeImmediate",
            MatchRange::new(0x90, 0x16),
        );

        let range = &document[0]["SearchFor"][0]["SearchRange"];
        assert_eq!(range["Offset"], 0x90);
        assert_eq!(range["Size"], 0x16);
        // Variation fields stay untouched.
        assert_eq!(range["SizeVariation"], 8);
    }

    #[test]
    fn test_sync_creates_missing_search_range() {
        let mut document = json!([
            {
                "RegionID": "R",
                "RegionType": "Section",
                "SearchFor": [ { "SearchID": "S", "SearchType": "Immediate" } ]
            }
        ]);

        sync_search_range(&mut document, "R", "S", MatchRange::new(4, 2));
        assert_eq!(document[0]["SearchFor"][0]["SearchRange"]["Offset"], 4);
    }
}
