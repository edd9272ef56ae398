//! The allow-list of names visible to dynamically-authored scripts
//!
//! Scripts run on an engine created with [`Engine::new_raw`]: no module
//! resolver, no file or network access and no standard library. Everything a
//! script can call or read is installed here, one [`Capability`] at a time.
//! Identifiers outside the set resolve to `()` rather than raising.
//!
//! This is protection against accidental damage and runaway loops in code the
//! user chose to run. It is not a security boundary for hostile code; use the
//! isolation layer for that, which bounds time but not what the code computes.

use std::collections::BTreeSet;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use rhai::packages::{
    BasicArrayPackage, BasicBlobPackage, BasicMapPackage, BasicMathPackage, CorePackage,
    MoreStringPackage, Package,
};
use rhai::{Blob, Dynamic, Engine, EvalAltResult, Scope};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha384, Sha512};

use crate::engine::dynamic_to_json;

/// Largest buffer `random_values` will fill, matching the usual web crypto quota
pub const MAX_RANDOM_BYTES: i64 = 65_536;

/// One group of names scripts may use
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    /// Operators, `type_of`, ranges, function pointers and basic strings
    Core,
    Math,
    Strings,
    Arrays,
    Maps,
    /// Byte arrays
    Blobs,
    Json,
    TextCodec,
    /// Hash digests and random bytes only
    Crypto,
}

impl Capability {
    pub const ALL: [Capability; 9] = [
        Capability::Core,
        Capability::Math,
        Capability::Strings,
        Capability::Arrays,
        Capability::Maps,
        Capability::Blobs,
        Capability::Json,
        Capability::TextCodec,
        Capability::Crypto,
    ];

    /// Functions this capability adds beyond the packages it installs
    pub fn function_names(self) -> &'static [&'static str] {
        match self {
            Capability::Json => &["json_parse", "json_stringify"],
            Capability::TextCodec => &[
                "utf8_encode",
                "utf8_decode",
                "base64_encode",
                "base64_decode",
                "hex_encode",
            ],
            Capability::Crypto => &["digest", "random_values"],
            _ => &[],
        }
    }

    /// Read-only constants this capability binds
    pub fn constant_names(self) -> &'static [&'static str] {
        match self {
            Capability::Core => &["MAX_SAFE_INTEGER"],
            Capability::Math => &["PI", "E"],
            _ => &[],
        }
    }

    fn install(self, engine: &mut Engine) {
        match self {
            Capability::Core => {
                CorePackage::new().register_into_engine(engine);
            }
            Capability::Math => {
                BasicMathPackage::new().register_into_engine(engine);
            }
            Capability::Strings => {
                MoreStringPackage::new().register_into_engine(engine);
            }
            Capability::Arrays => {
                BasicArrayPackage::new().register_into_engine(engine);
            }
            Capability::Maps => {
                BasicMapPackage::new().register_into_engine(engine);
            }
            Capability::Blobs => {
                BasicBlobPackage::new().register_into_engine(engine);
            }
            Capability::Json => {
                engine.register_fn("json_parse", json_parse);
                engine.register_fn("json_stringify", json_stringify);
            }
            Capability::TextCodec => {
                engine.register_fn("utf8_encode", utf8_encode);
                engine.register_fn("utf8_decode", utf8_decode);
                engine.register_fn("base64_encode", base64_encode_blob);
                engine.register_fn("base64_encode", base64_encode_str);
                engine.register_fn("base64_decode", base64_decode);
                engine.register_fn("hex_encode", hex_encode);
            }
            Capability::Crypto => {
                engine.register_fn("digest", digest_blob);
                engine.register_fn("digest", digest_str);
                engine.register_fn("random_values", random_values);
            }
        }
    }

    fn constants(self) -> Vec<(&'static str, Dynamic)> {
        match self {
            Capability::Core => vec![("MAX_SAFE_INTEGER", Dynamic::from(9_007_199_254_740_991_i64))],
            Capability::Math => vec![
                ("PI", Dynamic::from(std::f64::consts::PI)),
                ("E", Dynamic::from(std::f64::consts::E)),
            ],
            _ => Vec::new(),
        }
    }
}

/// The set of capabilities granted to one execution
///
/// Cheap to clone; engines and scopes derived from it are created per
/// execution and never shared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySet {
    capabilities: BTreeSet<Capability>,
}

impl Default for CapabilitySet {
    fn default() -> Self {
        Self::standard()
    }
}

impl CapabilitySet {
    /// Every capability
    pub fn standard() -> Self {
        Self {
            capabilities: Capability::ALL.into_iter().collect(),
        }
    }

    /// Only the given capabilities; `Core` is always included
    pub fn only(capabilities: impl IntoIterator<Item = Capability>) -> Self {
        let mut capabilities: BTreeSet<Capability> = capabilities.into_iter().collect();
        capabilities.insert(Capability::Core);
        Self { capabilities }
    }

    pub fn contains(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.capabilities.iter().copied()
    }

    /// Names of the registered non-package functions, for auditing
    pub fn function_names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self
            .iter()
            .flat_map(|c| c.function_names().iter().copied())
            .collect();
        names.dedup();
        names
    }

    /// Names of the bound constants, for auditing
    pub fn constant_names(&self) -> Vec<&'static str> {
        self.iter()
            .flat_map(|c| c.constant_names().iter().copied())
            .collect()
    }

    /// Register every granted capability on a fresh engine
    pub fn install(&self, engine: &mut Engine) {
        for capability in self.iter() {
            capability.install(engine);
        }
    }

    /// Fresh scope holding the granted constants
    pub fn scope(&self) -> Scope<'static> {
        let mut scope = Scope::new();
        for capability in self.iter() {
            for (name, value) in capability.constants() {
                scope.push_constant_dynamic(name, value);
            }
        }
        scope
    }
}

// ============================================================================
// Capability functions
// ============================================================================

type FnResult<T> = Result<T, Box<EvalAltResult>>;

fn json_parse(text: &str) -> FnResult<Dynamic> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| format!("JSON parse error: {}", e))?;
    rhai::serde::to_dynamic(value)
}

fn json_stringify(value: Dynamic) -> FnResult<String> {
    let json = dynamic_to_json(&value).map_err(|e| e.to_string())?;
    Ok(json.to_string())
}

fn utf8_encode(text: &str) -> Blob {
    text.as_bytes().to_vec()
}

fn utf8_decode(bytes: Blob) -> String {
    String::from_utf8_lossy(&bytes).into_owned()
}

fn base64_encode_blob(bytes: Blob) -> String {
    BASE64.encode(bytes)
}

fn base64_encode_str(text: &str) -> String {
    BASE64.encode(text.as_bytes())
}

fn base64_decode(encoded: &str) -> FnResult<Blob> {
    BASE64
        .decode(encoded.trim().as_bytes())
        .map_err(|e| format!("invalid base64: {}", e).into())
}

fn hex_encode(bytes: Blob) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn digest_blob(algorithm: &str, data: Blob) -> FnResult<Blob> {
    let digest = match algorithm.to_ascii_uppercase().as_str() {
        "SHA-256" | "SHA256" => Sha256::digest(&data).to_vec(),
        "SHA-384" | "SHA384" => Sha384::digest(&data).to_vec(),
        "SHA-512" | "SHA512" => Sha512::digest(&data).to_vec(),
        other => return Err(format!("unsupported digest algorithm: {}", other).into()),
    };
    Ok(digest)
}

fn digest_str(algorithm: &str, text: &str) -> FnResult<Blob> {
    digest_blob(algorithm, text.as_bytes().to_vec())
}

fn random_values(len: i64) -> FnResult<Blob> {
    if !(0..=MAX_RANDOM_BYTES).contains(&len) {
        return Err(format!(
            "random_values length must be between 0 and {}",
            MAX_RANDOM_BYTES
        )
        .into());
    }
    let mut buf = vec![0u8; len as usize];
    getrandom::getrandom(&mut buf).map_err(|e| format!("random source unavailable: {}", e))?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_with(set: &CapabilitySet) -> Engine {
        let mut engine = Engine::new_raw();
        set.install(&mut engine);
        engine
    }

    #[test]
    fn test_standard_set_lists_functions() {
        let set = CapabilitySet::standard();
        let names = set.function_names();
        assert!(names.contains(&"digest"));
        assert!(names.contains(&"json_parse"));
        assert!(set.constant_names().contains(&"PI"));
    }

    #[test]
    fn test_only_always_keeps_core() {
        let set = CapabilitySet::only([Capability::Math]);
        assert!(set.contains(Capability::Core));
        assert!(set.contains(Capability::Math));
        assert!(!set.contains(Capability::Crypto));
    }

    #[test]
    fn test_digest_matches_known_vector() {
        let engine = engine_with(&CapabilitySet::standard());
        let hex: String = engine
            .eval(r#"hex_encode(digest("SHA-256", "abc"))"#)
            .unwrap();
        assert_eq!(
            hex,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_missing_capability_is_not_callable() {
        let engine = engine_with(&CapabilitySet::only([Capability::Math]));
        assert!(engine.eval::<Dynamic>(r#"digest("SHA-256", "abc")"#).is_err());
    }

    #[test]
    fn test_base64_round_trip_in_script() {
        let engine = engine_with(&CapabilitySet::standard());
        let text: String = engine
            .eval(r#"utf8_decode(base64_decode(base64_encode("hello")))"#)
            .unwrap();
        assert_eq!(text, "hello");
    }

    #[test]
    fn test_random_values_bounds() {
        assert_eq!(random_values(16).unwrap().len(), 16);
        assert!(random_values(MAX_RANDOM_BYTES + 1).is_err());
        assert!(random_values(-1).is_err());
    }

    #[test]
    fn test_json_parse_produces_map() {
        let engine = engine_with(&CapabilitySet::standard());
        let n: i64 = engine.eval(r#"json_parse("{\"a\": 2}").a"#).unwrap();
        assert_eq!(n, 2);
    }

    #[test]
    fn test_scope_binds_constants() {
        let scope = CapabilitySet::standard().scope();
        assert!(scope.contains("PI"));
        assert!(scope.contains("MAX_SAFE_INTEGER"));
        assert!(!CapabilitySet::only([]).scope().contains("PI"));
    }
}
