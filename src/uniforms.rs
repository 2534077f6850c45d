//! Named uniform cells shared by both engines.

use indexmap::IndexMap;

use crate::{
    error::{EngineError, LayoutError},
    layout::{layout_with, FieldValue, Packing, Record, RecordLayout},
};

#[derive(Clone, Copy, Debug, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Uniform {
    pub value: FieldValue,
}

impl From<Uniform> for FieldValue {
    fn from(uniform: Uniform) -> Self {
        uniform.value
    }
}

/// Uniform cells in declaration order. The order fixes the WGSL struct layout.
pub type Uniforms = IndexMap<String, Uniform>;

impl Record for Uniforms {
    fn fields(&self) -> Vec<(&str, FieldValue)> {
        self.iter()
            .map(|(name, uniform)| (name.as_str(), uniform.value))
            .collect()
    }

    fn set_field(&mut self, name: &str, value: FieldValue) {
        if let Some(uniform) = self.get_mut(name) {
            uniform.value = value;
        }
    }
}

/// Wrap plain values into uniform cells.
pub fn as_uniforms<K, V>(values: impl IntoIterator<Item = (K, V)>) -> Uniforms
where
    K: Into<String>,
    V: Into<FieldValue>,
{
    values
        .into_iter()
        .map(|(name, value)| (name.into(), Uniform { value: value.into() }))
        .collect()
}

/// Overwrite existing cells and append new ones.
pub fn update_uniforms<K, V>(uniforms: &mut Uniforms, values: impl IntoIterator<Item = (K, V)>)
where
    K: Into<String>,
    V: Into<FieldValue>,
{
    for (name, value) in values {
        let value = value.into();
        uniforms
            .entry(name.into())
            .and_modify(|uniform| uniform.value = value)
            .or_insert(Uniform { value });
    }
}

/// Overwrite existing cells only. Used once a program's uniform block is fixed: every name must already exist and
/// keep its kind. Either every value is written or, on error, none is.
pub(crate) fn assign_uniforms<K, V>(
    uniforms: &mut Uniforms,
    values: impl IntoIterator<Item = (K, V)>,
) -> Result<(), EngineError>
where
    K: Into<String>,
    V: Into<FieldValue>,
{
    let values: Vec<(String, FieldValue)> = values
        .into_iter()
        .map(|(name, value)| (name.into(), value.into()))
        .collect();
    for (name, value) in &values {
        let Some(uniform) = uniforms.get(name) else {
            return Err(EngineError::UnknownUniform(name.clone()));
        };
        if uniform.value.kind() != value.kind() {
            return Err(LayoutError::KindMismatch {
                field: name.clone(),
                expected: uniform.value.kind(),
                found: value.kind(),
            }
            .into());
        }
    }
    for (name, value) in values {
        uniforms.set_field(&name, value);
    }
    Ok(())
}

pub fn uniform_layout(uniforms: &Uniforms) -> Result<RecordLayout, LayoutError> {
    layout_with(uniforms, Packing::Wgsl)
}

/// Bytes of the WGSL uniform block described by `uniforms`, padded to whole 16 byte rows. Empty when there are no
/// uniforms.
pub fn pack_uniforms(uniforms: &Uniforms) -> Result<Vec<u8>, LayoutError> {
    if uniforms.is_empty() {
        return Ok(Vec::new());
    }
    let layout = uniform_layout(uniforms)?;
    let mut data = vec![0.0f32; layout.record_size().next_multiple_of(4)];
    layout.write_record(&mut data, 0, uniforms)?;
    Ok(bytemuck::cast_slice(&data).to_vec())
}

#[cfg(test)]
mod tests {
    use glam::{Vec2, Vec3};

    use super::*;

    #[test]
    fn as_uniforms_wraps_values() {
        let uniforms = as_uniforms([("time", FieldValue::Scalar(0.5)), ("scale", Vec2::ONE.into())]);
        assert_eq!(uniforms["time"].value, FieldValue::Scalar(0.5));
        assert_eq!(uniforms.get_index(1).map(|(k, _)| k.as_str()), Some("scale"));
    }

    #[test]
    fn update_overwrites_and_appends() {
        let mut uniforms = as_uniforms([("time", 0.0f32)]);
        update_uniforms(&mut uniforms, [("time", 2.0f32), ("dt", 0.1)]);
        assert_eq!(uniforms.len(), 2);
        assert_eq!(uniforms["time"].value, FieldValue::Scalar(2.0));
        assert_eq!(uniforms["dt"].value, FieldValue::Scalar(0.1));
    }

    #[test]
    fn assign_keeps_the_block_fixed() {
        let mut uniforms = as_uniforms([("time", 0.0f32)]);
        assign_uniforms(&mut uniforms, [("time", 1.0f32)]).unwrap();
        assert_eq!(uniforms["time"].value, FieldValue::Scalar(1.0));
        assert!(matches!(
            assign_uniforms(&mut uniforms, [("dt", 1.0f32)]),
            Err(EngineError::UnknownUniform(name)) if name == "dt"
        ));
        assert!(matches!(
            assign_uniforms(&mut uniforms, [("time", Vec2::ONE)]),
            Err(EngineError::Layout(LayoutError::KindMismatch { .. }))
        ));
    }

    #[test]
    fn failed_assignment_changes_nothing() {
        let mut uniforms = as_uniforms([("time", 0.5f32)]);
        assert!(matches!(
            assign_uniforms(&mut uniforms, [("time", 2.0f32), ("dt", 1.0)]),
            Err(EngineError::UnknownUniform(name)) if name == "dt"
        ));
        assert!(assign_uniforms(
            &mut uniforms,
            [("time", FieldValue::Scalar(3.0)), ("time", Vec2::ONE.into())]
        )
        .is_err());
        assert_eq!(uniforms["time"].value, FieldValue::Scalar(0.5));
    }

    #[test]
    fn uniform_cells_convert_back_to_values() {
        let uniforms = as_uniforms([("dt", 0.05f32), ("b", 0.19)]);
        let mut copy = Uniforms::new();
        update_uniforms(&mut copy, uniforms.clone());
        assert_eq!(copy, uniforms);
    }

    #[test]
    fn packing_pads_to_rows() {
        assert!(pack_uniforms(&Uniforms::new()).unwrap().is_empty());

        let mut uniforms = as_uniforms([("time", 1.0f32)]);
        update_uniforms(&mut uniforms, [("center", Vec3::new(2.0, 3.0, 4.0))]);
        let bytes = pack_uniforms(&uniforms).unwrap();
        assert_eq!(bytes.len(), 32);
        let floats: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(floats, vec![1.0, 0.0, 0.0, 0.0, 2.0, 3.0, 4.0, 0.0]);
    }
}
