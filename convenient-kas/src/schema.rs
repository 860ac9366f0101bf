//! Configuration schema and format version constants
//!
//! Every configuration file is validated against the same JSON schema
//! (Draft 4) before any of its content is looked at. The schema and the
//! supported range of `header.version` are built once per process.

use serde_json::{Value as JsonValue, json};
use std::sync::OnceLock;

/// Current configuration format version
pub const FILE_VERSION: i64 = 14;

/// Oldest configuration format version this crate still understands
pub const COMPATIBLE_FILE_VERSION: i64 = 1;

/// Inclusive range of accepted `header.version` values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionRange {
    pub min: i64,
    pub max: i64,
}

impl VersionRange {
    pub fn new(min: i64, max: i64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, version: i64) -> bool {
        self.min <= version && version <= self.max
    }
}

impl Default for VersionRange {
    fn default() -> Self {
        Self::new(COMPATIBLE_FILE_VERSION, FILE_VERSION)
    }
}

/// A compiled schema together with the accepted version range
pub struct ConfigSchema {
    validator: Option<jsonschema::Validator>,
    versions: VersionRange,
}

impl std::fmt::Debug for ConfigSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigSchema")
            .field("validating", &self.validator.is_some())
            .field("versions", &self.versions)
            .finish()
    }
}

impl ConfigSchema {
    /// The built-in kas configuration schema
    ///
    /// # Panics
    ///
    /// Panics if the built-in schema does not compile (a programming error,
    /// covered by the unit tests below).
    pub fn kas() -> &'static ConfigSchema {
        static SCHEMA: OnceLock<ConfigSchema> = OnceLock::new();
        SCHEMA.get_or_init(|| {
            ConfigSchema::new(&kas_schema(), VersionRange::default())
                .expect("built-in configuration schema must compile")
        })
    }

    /// Compile a custom schema document
    pub fn new(schema: &JsonValue, versions: VersionRange) -> Result<Self, String> {
        let validator = jsonschema::options()
            .with_draft(jsonschema::Draft::Draft4)
            .build(schema)
            .map_err(|e| e.to_string())?;
        Ok(Self {
            validator: Some(validator),
            versions,
        })
    }

    /// A schema that accepts any document, only the version gate applies
    pub fn permissive(versions: VersionRange) -> Self {
        Self {
            validator: None,
            versions,
        }
    }

    pub fn versions(&self) -> VersionRange {
        self.versions
    }

    /// Validate a document, returning every error sorted for stable output
    pub fn validate(&self, instance: &JsonValue) -> Vec<String> {
        let Some(validator) = &self.validator else {
            return Vec::new();
        };
        let mut errors: Vec<String> = validator
            .iter_errors(instance)
            .map(|e| e.to_string())
            .collect();
        errors.sort();
        errors.dedup();
        errors
    }
}

fn kas_schema() -> JsonValue {
    let refspec = json!({ "type": "string" });
    let layer = json!({
        "oneOf": [
            { "type": "null" },
            { "type": "integer" },
            { "type": "boolean" },
            { "type": "string" },
        ]
    });
    let patch = json!({
        "oneOf": [
            {
                "type": "object",
                "required": ["path"],
                "additionalProperties": false,
                "properties": {
                    "repo": { "type": "string" },
                    "path": { "type": "string" },
                },
            },
            { "type": "null" },
        ]
    });
    let string_map = json!({
        "type": "object",
        "additionalProperties": { "type": "string" },
    });

    json!({
        "type": "object",
        "required": ["header"],
        "additionalProperties": true,
        "properties": {
            "header": {
                "type": "object",
                "required": ["version"],
                "additionalProperties": false,
                "properties": {
                    "version": {
                        "oneOf": [
                            { "type": "string", "enum": ["0.10"] },
                            { "type": "integer" },
                        ]
                    },
                    "includes": {
                        "type": "array",
                        "items": {
                            "oneOf": [
                                { "type": "string" },
                                {
                                    "type": "object",
                                    "required": ["repo", "file"],
                                    "additionalProperties": false,
                                    "properties": {
                                        "repo": { "type": "string" },
                                        "file": { "type": "string" },
                                    },
                                },
                            ]
                        },
                    },
                },
            },
            "build_system": {
                "type": "string",
                "enum": ["openembedded", "oe", "isar"],
            },
            "defaults": {
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "repos": {
                        "type": "object",
                        "additionalProperties": false,
                        "properties": {
                            "branch": refspec,
                            "tag": refspec,
                            "refspec": refspec,
                            "patches": {
                                "type": "object",
                                "additionalProperties": false,
                                "properties": {
                                    "repo": { "type": "string" },
                                },
                            },
                        },
                    },
                },
            },
            "machine": { "type": "string" },
            "distro": { "type": "string" },
            "env": {
                "type": "object",
                "additionalProperties": {
                    "oneOf": [
                        { "type": "string" },
                        { "type": "null" },
                    ]
                },
            },
            "target": {
                "oneOf": [
                    { "type": "string" },
                    { "type": "array", "items": { "type": "string" } },
                ]
            },
            "task": { "type": "string" },
            "repos": {
                "type": "object",
                "additionalProperties": {
                    "oneOf": [
                        {
                            "type": "object",
                            "additionalProperties": false,
                            "properties": {
                                "name": { "type": "string" },
                                "url": { "type": "string" },
                                "type": { "type": "string" },
                                "commit": { "type": "string" },
                                "branch": refspec,
                                "tag": refspec,
                                "refspec": refspec,
                                "path": { "type": "string" },
                                "signed": { "type": "boolean" },
                                "allowed_signers": {
                                    "type": "array",
                                    "items": { "type": "string" },
                                },
                                "layers": {
                                    "type": "object",
                                    "additionalProperties": layer,
                                },
                                "patches": {
                                    "type": "object",
                                    "additionalProperties": patch,
                                },
                            },
                        },
                        { "type": "null" },
                    ]
                },
            },
            "overrides": {
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "repos": {
                        "type": "object",
                        "additionalProperties": {
                            "type": "object",
                            "additionalProperties": false,
                            "properties": {
                                "commit": { "type": "string" },
                                "branch": { "type": "string" },
                            },
                        },
                    },
                },
            },
            "bblayers_conf_header": string_map,
            "local_conf_header": string_map,
            "proxy_config": string_map,
            "_source_dir": { "type": "string" },
            "_source_dir_host": { "type": "string" },
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_schema_compiles() {
        let schema = ConfigSchema::kas();
        assert_eq!(schema.versions(), VersionRange::new(1, 14));
    }

    #[test]
    fn minimal_document_is_valid() {
        let doc = json!({ "header": { "version": 14 } });
        assert!(ConfigSchema::kas().validate(&doc).is_empty());
    }

    #[test]
    fn errors_are_collected_and_sorted() {
        let doc = json!({
            "header": { "version": "x", "bogus": 1 },
            "machine": 42,
        });
        let errors = ConfigSchema::kas().validate(&doc);
        assert!(errors.len() >= 2);
        let mut sorted = errors.clone();
        sorted.sort();
        assert_eq!(errors, sorted);
    }

    #[test]
    fn structured_include_requires_file() {
        let doc = json!({
            "header": { "version": 14, "includes": [{ "repo": "meta" }] },
        });
        assert!(!ConfigSchema::kas().validate(&doc).is_empty());
    }

    #[test]
    fn permissive_schema_accepts_anything() {
        let schema = ConfigSchema::permissive(VersionRange::new(4, 5));
        assert!(schema.validate(&json!([1, 2, 3])).is_empty());
        assert!(schema.versions().contains(4));
        assert!(schema.versions().contains(5));
        assert!(!schema.versions().contains(6));
    }
}
