//! CBOR serialization of model types.

use crate::error::{ModelError, ModelResult};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encodes `value` as CBOR.
pub fn to_cbor<T: Serialize + ?Sized>(value: &T) -> ModelResult<Vec<u8>> {
    let mut bytes = Vec::new();
    ciborium::into_writer(value, &mut bytes)
        .map_err(|e| ModelError::serialization(e.to_string()))?;
    Ok(bytes)
}

/// Decodes a CBOR-encoded value.
pub fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> ModelResult<T> {
    ciborium::from_reader(bytes).map_err(|e| ModelError::serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BranchId, ClassInfo, FeatureInfo, FeatureValue, ObjectId, Revision};
    use std::sync::Arc;

    #[test]
    fn revision_survives_cbor() {
        let class = Arc::new(
            ClassInfo::new("test", "Item")
                .with_feature(FeatureInfo::attribute("name"))
                .with_feature(FeatureInfo::references("links")),
        );
        let mut rev = Revision::new(ObjectId::temp(4), class, BranchId::MAIN);
        rev.set("name", "widget".into()).unwrap();
        rev.list_mut("links")
            .unwrap()
            .push(FeatureValue::Ref(ObjectId::permanent(9)));

        let bytes = to_cbor(&rev).unwrap();
        let decoded: Revision = from_cbor(&bytes).unwrap();
        assert_eq!(decoded, rev);
    }

    #[test]
    fn garbage_is_rejected() {
        let result: ModelResult<Revision> = from_cbor(&[0xff, 0x00]);
        assert!(matches!(result, Err(ModelError::Serialization(_))));
    }
}
