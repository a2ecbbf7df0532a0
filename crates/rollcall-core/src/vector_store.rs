//! Typed access to identity vectors held by a [`Registry`].
//!
//! Vectors are persisted as little-endian `f32` bytes.

use crate::matcher::GalleryEntry;
use crate::registry::{EnrollmentData, Registry, RegistryError, Upsert, UpsertResult};
use crate::types::{Attributes, FeatureVector, FEATURE_LEN};

const F32_BYTES: usize = std::mem::size_of::<f32>();

/// An identity record with its vector decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityRecord {
    pub record_id: i64,
    pub code: String,
    pub attributes: Attributes,
    pub enrolled_image: Option<Vec<u8>>,
    pub feature_vector: Option<FeatureVector>,
    pub created_at: String,
    pub updated_at: String,
}

pub fn vector_to_bytes(vector: &FeatureVector) -> Vec<u8> {
    vector.values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Decode stored vector bytes, checking the canonical length.
pub fn vector_from_bytes(code: &str, bytes: &[u8]) -> Result<FeatureVector, RegistryError> {
    if bytes.len() != FEATURE_LEN * F32_BYTES {
        return Err(RegistryError::CorruptVector {
            code: code.to_string(),
            reason: format!("expected {} bytes, got {}", FEATURE_LEN * F32_BYTES, bytes.len()),
        });
    }
    let values = bytes
        .chunks_exact(F32_BYTES)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    Ok(FeatureVector { values })
}

/// Create or update `code`, writing the image and its vector as one pair.
pub fn write_identity<R: Registry + ?Sized>(
    registry: &mut R,
    code: &str,
    attributes: Attributes,
    enrollment: Option<(Vec<u8>, &FeatureVector)>,
) -> Result<UpsertResult, RegistryError> {
    registry.upsert(Upsert {
        code: code.to_string(),
        attributes,
        enrollment: enrollment.map(|(image, vector)| EnrollmentData {
            image,
            vector: vector_to_bytes(vector),
        }),
    })
}

pub fn read_identity<R: Registry + ?Sized>(
    registry: &R,
    code: &str,
) -> Result<Option<IdentityRecord>, RegistryError> {
    let Some(record) = registry.get_by_code(code)? else {
        return Ok(None);
    };
    let feature_vector = record
        .feature_vector
        .as_deref()
        .map(|bytes| vector_from_bytes(&record.code, bytes))
        .transpose()?;

    Ok(Some(IdentityRecord {
        record_id: record.record_id,
        code: record.code,
        attributes: record.attributes,
        enrolled_image: record.enrolled_image,
        feature_vector,
        created_at: record.created_at,
        updated_at: record.updated_at,
    }))
}

/// All vectorised identities in registry order.
///
/// A corrupt stored vector fails the whole read rather than being skipped.
pub fn gallery<R: Registry + ?Sized>(registry: &R) -> Result<Vec<GalleryEntry>, RegistryError> {
    registry
        .list_with_vectors()?
        .into_iter()
        .map(|row| {
            let vector = vector_from_bytes(&row.code, &row.vector)?;
            Ok(GalleryEntry {
                code: row.code,
                attributes: row.attributes,
                vector,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MemoryRegistry;

    fn ramp() -> FeatureVector {
        FeatureVector {
            values: (0..FEATURE_LEN).map(|i| i as f32 / FEATURE_LEN as f32).collect(),
        }
    }

    #[test]
    fn test_bytes_length() {
        assert_eq!(vector_to_bytes(&ramp()).len(), FEATURE_LEN * 4);
    }

    #[test]
    fn test_bytes_little_endian() {
        let v = FeatureVector { values: vec![1.0] };
        assert_eq!(vector_to_bytes(&v), vec![0x00, 0x00, 0x80, 0x3f]);
    }

    #[test]
    fn test_from_bytes_rejects_wrong_length() {
        let err = vector_from_bytes("S9", &[0u8; 12]).unwrap_err();
        match err {
            RegistryError::CorruptVector { code, .. } => assert_eq!(code, "S9"),
            other => panic!("unexpected {other}"),
        }
    }

    #[test]
    fn test_write_and_read_identity() {
        let mut reg = MemoryRegistry::new();
        let v = ramp();
        write_identity(&mut reg, "S1", Attributes::default(), Some((b"png".to_vec(), &v))).unwrap();
        let rec = read_identity(&reg, "S1").unwrap().unwrap();
        assert_eq!(rec.feature_vector, Some(v));
        assert_eq!(rec.enrolled_image.as_deref(), Some(&b"png"[..]));
        assert!(read_identity(&reg, "nobody").unwrap().is_none());
    }

    #[test]
    fn test_gallery_order_and_corruption() {
        let mut reg = MemoryRegistry::new();
        let v = ramp();
        write_identity(&mut reg, "B", Attributes::default(), Some((vec![], &v))).unwrap();
        write_identity(&mut reg, "A", Attributes::default(), Some((vec![], &v))).unwrap();
        let codes: Vec<String> = gallery(&reg).unwrap().into_iter().map(|g| g.code).collect();
        assert_eq!(codes, vec!["B", "A"]);

        reg.upsert(Upsert {
            code: "C".into(),
            attributes: Attributes::default(),
            enrollment: Some(EnrollmentData { image: vec![], vector: vec![1, 2, 3] }),
        })
        .unwrap();
        assert!(matches!(gallery(&reg), Err(RegistryError::CorruptVector { .. })));
    }
}
