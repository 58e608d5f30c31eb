//! Model descriptors and the registry that creates them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, ErrorKind};

/// What a model is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelCategory {
    /// Text generation.
    Text,
    /// Multimodal vision-language model.
    Vision,
    /// Multimodal projector loaded alongside a vision model.
    Mmproj,
    /// Speech model.
    Speech,
    /// Embedding model.
    Embedding,
}

/// Immutable description of a downloadable model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Unique identifier.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Declared size in bytes.
    pub size_bytes: u64,
    /// Download URL.
    pub url: String,
    /// Expected SHA-256 as lower-case hex, when declared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    /// File format tag (e.g. "gguf").
    pub format: String,
    /// Quantization tag (e.g. "q4_k_m").
    pub quantization: String,
    /// Model category.
    pub category: ModelCategory,
}

fn is_hex_lower(s: &str) -> bool {
    s.bytes()
        .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

impl ModelDescriptor {
    fn validate(&self) -> Result<(), EngineError> {
        if self.id.trim().is_empty() {
            return Err(EngineError::new(
                ErrorKind::InvalidConfig,
                "model id must not be empty",
            ));
        }
        if self.url.trim().is_empty() {
            return Err(EngineError::new(
                ErrorKind::InvalidConfig,
                format!("model {:?} has an empty download url", self.id),
            ));
        }
        if let Some(sha) = &self.sha256 {
            if sha.len() != 64 || !is_hex_lower(sha) {
                return Err(EngineError::new(
                    ErrorKind::InvalidConfig,
                    format!(
                        "model {:?} checksum must be 64 lower-case hex characters",
                        self.id
                    ),
                ));
            }
        }
        Ok(())
    }
}

/// Registry of known model descriptors, keyed by id.
#[derive(Debug, Default, Clone)]
pub struct ModelRegistry {
    by_id: BTreeMap<String, ModelDescriptor>,
}

impl ModelRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a descriptor. Ids are unique; registering an existing id fails.
    pub fn register(&mut self, descriptor: ModelDescriptor) -> Result<(), EngineError> {
        descriptor.validate()?;
        if self.by_id.contains_key(&descriptor.id) {
            return Err(EngineError::new(
                ErrorKind::InvalidConfig,
                format!("model {:?} is already registered", descriptor.id),
            ));
        }
        self.by_id.insert(descriptor.id.clone(), descriptor);
        Ok(())
    }

    /// Look up a descriptor.
    pub fn get(&self, id: &str) -> Option<&ModelDescriptor> {
        self.by_id.get(id)
    }

    /// Like [`ModelRegistry::get`], but failing with `ModelNotFound`.
    pub fn require(&self, id: &str) -> Result<&ModelDescriptor, EngineError> {
        self.get(id).ok_or_else(|| {
            EngineError::new(
                ErrorKind::ModelNotFound,
                format!("model {id:?} is not registered"),
            )
        })
    }

    /// All descriptors, ordered by id.
    pub fn list(&self) -> impl Iterator<Item = &ModelDescriptor> {
        self.by_id.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(id: &str) -> ModelDescriptor {
        ModelDescriptor {
            id: id.to_string(),
            name: "Test model".to_string(),
            size_bytes: 1024,
            url: "https://models.example/test.gguf".to_string(),
            sha256: None,
            format: "gguf".to_string(),
            quantization: "q4_0".to_string(),
            category: ModelCategory::Text,
        }
    }

    #[test]
    fn register_and_lookup() {
        let mut registry = ModelRegistry::new();
        registry.register(descriptor("m1")).expect("register");

        assert!(registry.get("m1").is_some());
        assert!(registry.get("m2").is_none());
        assert_eq!(
            registry.require("m2").expect_err("missing").kind,
            ErrorKind::ModelNotFound
        );
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let mut registry = ModelRegistry::new();
        registry.register(descriptor("m1")).expect("register");
        let err = registry.register(descriptor("m1")).expect_err("duplicate");
        assert_eq!(err.kind, ErrorKind::InvalidConfig);
    }

    #[test]
    fn checksum_must_be_lowercase_hex() {
        let mut registry = ModelRegistry::new();

        let mut bad = descriptor("m1");
        bad.sha256 = Some("ABC".to_string());
        assert!(registry.register(bad).is_err());

        let mut good = descriptor("m1");
        good.sha256 = Some("a".repeat(64));
        registry.register(good).expect("valid checksum");
    }
}
