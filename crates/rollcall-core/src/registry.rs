//! Student Registry capability set.
//!
//! The registry exclusively owns persisted identity state. The engine only
//! talks to it through [`Registry`]; [`MemoryRegistry`] is a process-local
//! implementation used for tests and embedding.

use crate::types::Attributes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("registry backend: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("stored vector for {code} is corrupt: {reason}")]
    CorruptVector { code: String, reason: String },
}

impl RegistryError {
    pub fn backend(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Backend(Box::new(err))
    }
}

/// Reference image and the vector computed from it. Always written together.
#[derive(Debug, Clone, PartialEq)]
pub struct EnrollmentData {
    /// Encoded image bytes (PNG).
    pub image: Vec<u8>,
    /// Little-endian f32 vector bytes.
    pub vector: Vec<u8>,
}

/// Create-or-update command for one identity.
///
/// On create every field is stored as given. On update only attributes that
/// are `Some` overwrite stored values, and `enrollment` (when present)
/// replaces the image and vector pair.
#[derive(Debug, Clone, PartialEq)]
pub struct Upsert {
    pub code: String,
    pub attributes: Attributes,
    pub enrollment: Option<EnrollmentData>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertResult {
    pub record_id: i64,
    pub created: bool,
}

/// A persisted identity as the registry stores it.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryRecord {
    pub record_id: i64,
    pub code: String,
    pub attributes: Attributes,
    pub enrolled_image: Option<Vec<u8>>,
    pub feature_vector: Option<Vec<u8>>,
    /// RFC 3339 timestamps.
    pub created_at: String,
    pub updated_at: String,
}

/// Listing view without the binary columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordSummary {
    pub record_id: i64,
    pub code: String,
    pub attributes: Attributes,
    pub has_image: bool,
    pub has_vector: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl From<&RegistryRecord> for RecordSummary {
    fn from(r: &RegistryRecord) -> Self {
        Self {
            record_id: r.record_id,
            code: r.code.clone(),
            attributes: r.attributes.clone(),
            has_image: r.enrolled_image.is_some(),
            has_vector: r.feature_vector.is_some(),
            created_at: r.created_at.clone(),
            updated_at: r.updated_at.clone(),
        }
    }
}

/// One vectorised identity, as returned by [`Registry::list_with_vectors`].
#[derive(Debug, Clone, PartialEq)]
pub struct VectorRow {
    pub code: String,
    pub attributes: Attributes,
    pub vector: Vec<u8>,
}

/// Persistence for identity records.
///
/// Implementations must make `upsert` atomic and serialise concurrent
/// writes to the same `code`. Iteration order of the list methods must be
/// stable across calls.
pub trait Registry {
    fn upsert(&mut self, command: Upsert) -> Result<UpsertResult, RegistryError>;

    /// Every record that has a feature vector, in stable order.
    fn list_with_vectors(&self) -> Result<Vec<VectorRow>, RegistryError>;

    fn get_by_code(&self, code: &str) -> Result<Option<RegistryRecord>, RegistryError>;

    /// Remove the record for `code`; returns how many records were removed.
    fn delete(&mut self, code: &str) -> Result<usize, RegistryError>;

    /// Every record, in stable order.
    fn list(&self) -> Result<Vec<RecordSummary>, RegistryError>;
}

/// In-memory registry. Records iterate in insertion order.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    records: Vec<RegistryRecord>,
    next_id: i64,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Registry for MemoryRegistry {
    fn upsert(&mut self, command: Upsert) -> Result<UpsertResult, RegistryError> {
        let now = chrono::Utc::now().to_rfc3339();

        if let Some(existing) = self.records.iter_mut().find(|r| r.code == command.code) {
            command.attributes.apply_to(&mut existing.attributes);
            if let Some(data) = command.enrollment {
                existing.enrolled_image = Some(data.image);
                existing.feature_vector = Some(data.vector);
            }
            existing.updated_at = now;
            return Ok(UpsertResult { record_id: existing.record_id, created: false });
        }

        self.next_id += 1;
        let (enrolled_image, feature_vector) = match command.enrollment {
            Some(data) => (Some(data.image), Some(data.vector)),
            None => (None, None),
        };
        self.records.push(RegistryRecord {
            record_id: self.next_id,
            code: command.code,
            attributes: command.attributes,
            enrolled_image,
            feature_vector,
            created_at: now.clone(),
            updated_at: now,
        });
        Ok(UpsertResult { record_id: self.next_id, created: true })
    }

    fn list_with_vectors(&self) -> Result<Vec<VectorRow>, RegistryError> {
        Ok(self
            .records
            .iter()
            .filter_map(|r| {
                r.feature_vector.as_ref().map(|v| VectorRow {
                    code: r.code.clone(),
                    attributes: r.attributes.clone(),
                    vector: v.clone(),
                })
            })
            .collect())
    }

    fn get_by_code(&self, code: &str) -> Result<Option<RegistryRecord>, RegistryError> {
        Ok(self.records.iter().find(|r| r.code == code).cloned())
    }

    fn delete(&mut self, code: &str) -> Result<usize, RegistryError> {
        let before = self.records.len();
        self.records.retain(|r| r.code != code);
        Ok(before - self.records.len())
    }

    fn list(&self) -> Result<Vec<RecordSummary>, RegistryError> {
        Ok(self.records.iter().map(RecordSummary::from).collect())
    }
}
