//! Trusted, statically-known transforms
//!
//! Tools are a closed enum resolved through one compile-time table, so a tool
//! reference can only fail to resolve when it is parsed from a slug.

use std::fmt;
use std::str::FromStr;

use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use similar::{ChangeTag, TextDiff};

use crate::normalize::normalize;
use crate::types::{EngineError, ExecutionResult, InputPayload, Options, encode_bytes};

/// Identifier of a catalog tool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolId {
    Base64Encode,
    Base64Decode,
    UpperCase,
    LowerCase,
    Sha256,
    TextDiff,
    ColorBreakdown,
    JsonTree,
    SvgPreview,
}

impl ToolId {
    pub const ALL: [ToolId; 9] = [
        ToolId::Base64Encode,
        ToolId::Base64Decode,
        ToolId::UpperCase,
        ToolId::LowerCase,
        ToolId::Sha256,
        ToolId::TextDiff,
        ToolId::ColorBreakdown,
        ToolId::JsonTree,
        ToolId::SvgPreview,
    ];

    fn index(self) -> usize {
        match self {
            ToolId::Base64Encode => 0,
            ToolId::Base64Decode => 1,
            ToolId::UpperCase => 2,
            ToolId::LowerCase => 3,
            ToolId::Sha256 => 4,
            ToolId::TextDiff => 5,
            ToolId::ColorBreakdown => 6,
            ToolId::JsonTree => 7,
            ToolId::SvgPreview => 8,
        }
    }

    /// The catalog entry for this tool
    pub fn entry(self) -> &'static ToolEntry {
        &CATALOG[self.index()]
    }

    pub fn slug(self) -> &'static str {
        self.entry().slug
    }
}

impl fmt::Display for ToolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

impl FromStr for ToolId {
    type Err = EngineError;

    fn from_str(slug: &str) -> Result<Self, Self::Err> {
        CATALOG
            .iter()
            .find(|entry| entry.slug == slug)
            .map(|entry| entry.id)
            .ok_or_else(|| EngineError::UnknownTool(slug.to_string()))
    }
}

/// Broad grouping of tools; decides where they run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolCategory {
    Encoding,
    Text,
    Hashing,
    Diffing,
    ImageProcessing,
    Color,
    Structure,
}

impl ToolCategory {
    /// CPU-heavy categories always run in an isolated context
    pub fn is_resource_sensitive(self) -> bool {
        matches!(
            self,
            ToolCategory::Hashing | ToolCategory::Diffing | ToolCategory::ImageProcessing
        )
    }
}

/// The contract every tool implements
///
/// `Err(message)` is a user-input failure, the same as returning
/// `{ "error": message }`.
pub trait Transform: Send + Sync {
    fn apply(&self, input: &InputPayload, options: &Options) -> Result<Value, String>;
}

type TransformFn = fn(&InputPayload, &Options) -> Result<Value, String>;

/// One row of the catalog
pub struct ToolEntry {
    pub id: ToolId,
    pub slug: &'static str,
    pub description: &'static str,
    pub category: ToolCategory,
    transform: TransformFn,
}

impl ToolEntry {
    pub fn runs_isolated(&self) -> bool {
        self.category.is_resource_sensitive()
    }

    /// Apply the transform and normalize what it returns
    pub fn invoke(&self, input: &InputPayload, options: &Options) -> ExecutionResult {
        match self.apply(input, options) {
            Ok(raw) => normalize(&raw),
            Err(message) => ExecutionResult::user_input(message),
        }
    }
}

impl Transform for ToolEntry {
    fn apply(&self, input: &InputPayload, options: &Options) -> Result<Value, String> {
        (self.transform)(input, options)
    }
}

impl fmt::Debug for ToolEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolEntry")
            .field("id", &self.id)
            .field("category", &self.category)
            .finish()
    }
}

/// Every tool, in `ToolId::index` order
pub static CATALOG: [ToolEntry; 9] = [
    ToolEntry {
        id: ToolId::Base64Encode,
        slug: "base64-encode",
        description: "Encode text or bytes as base64",
        category: ToolCategory::Encoding,
        transform: base64_encode,
    },
    ToolEntry {
        id: ToolId::Base64Decode,
        slug: "base64-decode",
        description: "Decode base64 to text, or to a download when not UTF-8",
        category: ToolCategory::Encoding,
        transform: base64_decode,
    },
    ToolEntry {
        id: ToolId::UpperCase,
        slug: "upper-case",
        description: "Convert text to upper case",
        category: ToolCategory::Text,
        transform: upper_case,
    },
    ToolEntry {
        id: ToolId::LowerCase,
        slug: "lower-case",
        description: "Convert text to lower case",
        category: ToolCategory::Text,
        transform: lower_case,
    },
    ToolEntry {
        id: ToolId::Sha256,
        slug: "sha256",
        description: "SHA-256 digest as hex",
        category: ToolCategory::Hashing,
        transform: sha256,
    },
    ToolEntry {
        id: ToolId::TextDiff,
        slug: "text-diff",
        description: "Compare two texts by lines, words or characters",
        category: ToolCategory::Diffing,
        transform: text_diff,
    },
    ToolEntry {
        id: ToolId::ColorBreakdown,
        slug: "color-breakdown",
        description: "Show a color as hex, RGB and HSL",
        category: ToolCategory::Color,
        transform: color_breakdown,
    },
    ToolEntry {
        id: ToolId::JsonTree,
        slug: "json-tree",
        description: "Render a JSON document as a tree",
        category: ToolCategory::Structure,
        transform: json_tree,
    },
    ToolEntry {
        id: ToolId::SvgPreview,
        slug: "svg-preview",
        description: "Preview SVG markup as an image",
        category: ToolCategory::ImageProcessing,
        transform: svg_preview,
    },
];

// ============================================================================
// Transforms
// ============================================================================

fn single_text(input: &InputPayload) -> Result<&str, String> {
    match input {
        InputPayload::Empty => Ok(""),
        InputPayload::Text(text) => Ok(text),
        _ => Err("expected a single text input".to_string()),
    }
}

fn flag(options: &Options, name: &str) -> bool {
    options.get(name).and_then(|v| v.as_bool()).unwrap_or(false)
}

fn base64_encode(input: &InputPayload, options: &Options) -> Result<Value, String> {
    let bytes = match input {
        InputPayload::Binary(bytes) => bytes.as_slice(),
        other => single_text(other)?.as_bytes(),
    };
    let encoded = if flag(options, "url_safe") {
        URL_SAFE.encode(bytes)
    } else {
        STANDARD.encode(bytes)
    };
    Ok(Value::String(encoded))
}

fn base64_decode(input: &InputPayload, options: &Options) -> Result<Value, String> {
    let text = single_text(input)?;
    let cleaned: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    let decoded = if flag(options, "url_safe") {
        URL_SAFE.decode(cleaned.as_bytes())
    } else {
        STANDARD.decode(cleaned.as_bytes())
    }
    .map_err(|e| format!("invalid base64: {}", e))?;

    match String::from_utf8(decoded) {
        Ok(text) => Ok(Value::String(text)),
        Err(e) => Ok(json!({
            "kind": "download",
            "filename": "decoded.bin",
            "mime": "application/octet-stream",
            "bytes": encode_bytes(e.as_bytes()),
        })),
    }
}

fn upper_case(input: &InputPayload, _options: &Options) -> Result<Value, String> {
    Ok(Value::String(single_text(input)?.to_uppercase()))
}

fn lower_case(input: &InputPayload, _options: &Options) -> Result<Value, String> {
    Ok(Value::String(single_text(input)?.to_lowercase()))
}

fn sha256(input: &InputPayload, options: &Options) -> Result<Value, String> {
    let digest = match input {
        InputPayload::Binary(bytes) => Sha256::digest(bytes),
        other => Sha256::digest(single_text(other)?.as_bytes()),
    };
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    if flag(options, "uppercase") {
        Ok(Value::String(hex.to_uppercase()))
    } else {
        Ok(Value::String(hex))
    }
}

fn text_diff(input: &InputPayload, options: &Options) -> Result<Value, String> {
    let InputPayload::DualText { left, right } = input else {
        return Err("expected two texts to compare".to_string());
    };
    let mode = options.get("mode").and_then(|v| v.as_str()).unwrap_or("lines");
    let diff = match mode {
        "lines" => TextDiff::from_lines(left.as_str(), right.as_str()),
        "words" => TextDiff::from_words(left.as_str(), right.as_str()),
        "chars" => TextDiff::from_chars(left.as_str(), right.as_str()),
        other => return Err(format!("unknown diff mode: {}", other)),
    };

    let changes: Vec<Value> = diff
        .iter_all_changes()
        .map(|change| {
            let tag = match change.tag() {
                ChangeTag::Insert => "added",
                ChangeTag::Delete => "removed",
                ChangeTag::Equal => "unchanged",
            };
            json!({ "tag": tag, "value": change.value() })
        })
        .collect();
    Ok(json!({ "kind": "diff", "changes": changes }))
}

fn color_breakdown(input: &InputPayload, _options: &Options) -> Result<Value, String> {
    let text = single_text(input)?.trim();
    let [r, g, b] = parse_color(text).ok_or_else(|| format!("unrecognized color: {}", text))?;
    let hex = format!("#{:02x}{:02x}{:02x}", r, g, b);
    let [h, s, l] = rgb_to_hsl(r, g, b);
    Ok(json!({
        "kind": "color-breakdown",
        "hex": hex,
        "rgb": [r, g, b],
        "hsl": [h, s, l],
        "preview": hex,
    }))
}

/// `#rgb`, `#rrggbb` or `rgb(r, g, b)`
fn parse_color(text: &str) -> Option<[u8; 3]> {
    if let Some(hex) = text.strip_prefix('#') {
        let expanded: String = match hex.len() {
            3 => hex.chars().flat_map(|c| [c, c]).collect(),
            6 => hex.to_string(),
            _ => return None,
        };
        let channel = |i: usize| u8::from_str_radix(expanded.get(i..i + 2)?, 16).ok();
        return Some([channel(0)?, channel(2)?, channel(4)?]);
    }
    let inner = text.strip_prefix("rgb(")?.strip_suffix(')')?;
    let parts: Vec<u8> = inner
        .split(',')
        .map(|p| p.trim().parse::<u8>().ok())
        .collect::<Option<_>>()?;
    match parts.as_slice() {
        [r, g, b] => Some([*r, *g, *b]),
        _ => None,
    }
}

fn rgb_to_hsl(r: u8, g: u8, b: u8) -> [f64; 3] {
    let (r, g, b) = (r as f64 / 255.0, g as f64 / 255.0, b as f64 / 255.0);
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let l = (max + min) / 2.0;
    let delta = max - min;
    if delta == 0.0 {
        return [0.0, 0.0, round1(l * 100.0)];
    }
    let s = delta / (1.0 - (2.0 * l - 1.0).abs());
    let h = if max == r {
        60.0 * (((g - b) / delta).rem_euclid(6.0))
    } else if max == g {
        60.0 * ((b - r) / delta + 2.0)
    } else {
        60.0 * ((r - g) / delta + 4.0)
    };
    [round1(h), round1(s * 100.0), round1(l * 100.0)]
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

fn json_tree(input: &InputPayload, _options: &Options) -> Result<Value, String> {
    let document: Value =
        serde_json::from_str(single_text(input)?).map_err(|e| format!("invalid JSON: {}", e))?;
    Ok(json!({ "kind": "visual-tree", "root": tree_node("root", &document) }))
}

fn tree_node(label: &str, value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let children: Vec<Value> = map.iter().map(|(k, v)| tree_node(k, v)).collect();
            json!({ "label": label, "children": children })
        }
        Value::Array(items) => {
            let children: Vec<Value> = items
                .iter()
                .enumerate()
                .map(|(i, v)| tree_node(&i.to_string(), v))
                .collect();
            json!({ "label": label, "children": children })
        }
        Value::String(text) => json!({ "label": label, "value": text }),
        scalar => json!({ "label": label, "value": scalar.to_string() }),
    }
}

fn svg_preview(input: &InputPayload, _options: &Options) -> Result<Value, String> {
    let markup = single_text(input)?.trim();
    if !markup.starts_with("<svg") && !markup.starts_with("<?xml") {
        return Err("input is not SVG markup".to_string());
    }
    Ok(json!({
        "kind": "image",
        "src": format!("data:image/svg+xml;base64,{}", STANDARD.encode(markup.as_bytes())),
        "alt": "SVG preview",
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DiffTag, FailureKind, OptionValue, StructuredResult};

    #[test]
    fn test_catalog_order_matches_ids() {
        for id in ToolId::ALL {
            assert_eq!(id.entry().id, id);
        }
    }

    #[test]
    fn test_slug_round_trip() {
        for id in ToolId::ALL {
            assert_eq!(id.slug().parse::<ToolId>().unwrap(), id);
        }
        assert!(matches!(
            "no-such-tool".parse::<ToolId>(),
            Err(EngineError::UnknownTool(_))
        ));
    }

    #[test]
    fn test_serde_slug_matches_catalog_slug() {
        for id in ToolId::ALL {
            assert_eq!(serde_json::to_value(id).unwrap(), json!(id.slug()));
        }
    }

    #[test]
    fn test_resource_sensitive_routing() {
        assert!(ToolId::Sha256.entry().runs_isolated());
        assert!(ToolId::TextDiff.entry().runs_isolated());
        assert!(ToolId::SvgPreview.entry().runs_isolated());
        assert!(!ToolId::Base64Encode.entry().runs_isolated());
    }

    #[test]
    fn test_base64_decode_invalid_is_user_input() {
        let result = ToolId::Base64Decode.entry().invoke(&"%%%".into(), &Options::new());
        assert_eq!(result.as_failure().unwrap().kind, FailureKind::UserInput);
    }

    #[test]
    fn test_base64_decode_binary_becomes_download() {
        let result = ToolId::Base64Decode.entry().invoke(&"/w==".into(), &Options::new());
        match result {
            ExecutionResult::Structured(StructuredResult::Download(download)) => {
                assert_eq!(download.bytes, vec![0xff]);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_sha256_hex() {
        let result = ToolId::Sha256.entry().invoke(&"abc".into(), &Options::new());
        assert_eq!(
            result.as_text(),
            Some("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
        );
    }

    #[test]
    fn test_text_diff_lines() {
        let input = InputPayload::DualText {
            left: "a\nb\n".to_string(),
            right: "a\nc\n".to_string(),
        };
        let result = ToolId::TextDiff.entry().invoke(&input, &Options::new());
        let ExecutionResult::Structured(StructuredResult::Diff(diff)) = result else {
            panic!("expected a diff");
        };
        let tags: Vec<DiffTag> = diff.changes.iter().map(|c| c.tag).collect();
        assert_eq!(tags, vec![DiffTag::Unchanged, DiffTag::Removed, DiffTag::Added]);
    }

    #[test]
    fn test_text_diff_rejects_unknown_mode() {
        let input = InputPayload::DualText {
            left: "a".to_string(),
            right: "b".to_string(),
        };
        let mut options = Options::new();
        options.insert("mode".to_string(), OptionValue::from("sentences"));
        let result = ToolId::TextDiff.entry().invoke(&input, &options);
        assert_eq!(result, ExecutionResult::user_input("unknown diff mode: sentences"));
    }

    #[test]
    fn test_color_breakdown() {
        let result = ToolId::ColorBreakdown.entry().invoke(&"#f80".into(), &Options::new());
        let ExecutionResult::Structured(StructuredResult::ColorBreakdown(color)) = result else {
            panic!("expected a color breakdown");
        };
        assert_eq!(color.hex, "#ff8800");
        assert_eq!(color.rgb, [255, 136, 0]);
        assert_eq!(color.hsl[1], 100.0);
        assert_eq!(color.hsl[2], 50.0);
    }

    #[test]
    fn test_parse_color_forms() {
        assert_eq!(parse_color("rgb(1, 2, 3)"), Some([1, 2, 3]));
        assert_eq!(parse_color("#000000"), Some([0, 0, 0]));
        assert_eq!(parse_color("#12"), None);
        assert_eq!(parse_color("rgb(1, 2)"), None);
    }

    #[test]
    fn test_json_tree() {
        let result = ToolId::JsonTree.entry().invoke(&r#"{"a": [1, 2]}"#.into(), &Options::new());
        let ExecutionResult::Structured(StructuredResult::VisualTree(tree)) = result else {
            panic!("expected a tree");
        };
        assert_eq!(tree.root.children[0].label, "a");
        assert_eq!(tree.root.children[0].children[1].value.as_deref(), Some("2"));
    }

    #[test]
    fn test_dual_input_rejected_by_single_text_tools() {
        let input = InputPayload::DualText {
            left: "a".to_string(),
            right: "b".to_string(),
        };
        let result = ToolId::UpperCase.entry().invoke(&input, &Options::new());
        assert_eq!(result, ExecutionResult::user_input("expected a single text input"));
    }
}
