//! Field layouts derived from a prototype record, so CPU mirrors of GPU storage and uniform buffers don't need
//! hand-maintained offset tables.
//!
//! Offsets and sizes are counted in `f32` components, not bytes.

pub mod adapter;

use glam::{Vec2, Vec3, Vec4};
use indexmap::IndexMap;

use crate::error::LayoutError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Deserialize, serde::Serialize)]
pub enum FieldKind {
    Scalar,
    Vec2,
    Vec3,
    Vec4,
}

impl FieldKind {
    pub const fn components(self) -> usize {
        match self {
            FieldKind::Scalar => 1,
            FieldKind::Vec2 => 2,
            FieldKind::Vec3 => 3,
            FieldKind::Vec4 => 4,
        }
    }

    /// Alignment in components for WGSL host-shareable structs.
    pub const fn alignment(self) -> usize {
        match self {
            FieldKind::Scalar => 1,
            FieldKind::Vec2 => 2,
            FieldKind::Vec3 | FieldKind::Vec4 => 4,
        }
    }

    pub const fn from_components(components: usize) -> Option<Self> {
        match components {
            1 => Some(FieldKind::Scalar),
            2 => Some(FieldKind::Vec2),
            3 => Some(FieldKind::Vec3),
            4 => Some(FieldKind::Vec4),
            _ => None,
        }
    }

    pub const fn vertex_format(self) -> wgpu::VertexFormat {
        match self {
            FieldKind::Scalar => wgpu::VertexFormat::Float32,
            FieldKind::Vec2 => wgpu::VertexFormat::Float32x2,
            FieldKind::Vec3 => wgpu::VertexFormat::Float32x3,
            FieldKind::Vec4 => wgpu::VertexFormat::Float32x4,
        }
    }

    pub const fn wgsl_type(self) -> &'static str {
        match self {
            FieldKind::Scalar => "f32",
            FieldKind::Vec2 => "vec2<f32>",
            FieldKind::Vec3 => "vec3<f32>",
            FieldKind::Vec4 => "vec4<f32>",
        }
    }
}

/// One field value of a record.
#[derive(Clone, Copy, Debug, PartialEq, serde::Deserialize, serde::Serialize)]
pub enum FieldValue {
    Scalar(f32),
    Vec2(Vec2),
    Vec3(Vec3),
    Vec4(Vec4),
}

impl FieldValue {
    pub const fn kind(&self) -> FieldKind {
        match self {
            FieldValue::Scalar(_) => FieldKind::Scalar,
            FieldValue::Vec2(_) => FieldKind::Vec2,
            FieldValue::Vec3(_) => FieldKind::Vec3,
            FieldValue::Vec4(_) => FieldKind::Vec4,
        }
    }

    /// Interpret a loose component slice, e.g. a value coming from a script or a config file.
    pub fn from_components(components: &[f32]) -> Option<Self> {
        Some(match *components {
            [x] => FieldValue::Scalar(x),
            [x, y] => FieldValue::Vec2(Vec2::new(x, y)),
            [x, y, z] => FieldValue::Vec3(Vec3::new(x, y, z)),
            [x, y, z, w] => FieldValue::Vec4(Vec4::new(x, y, z, w)),
            _ => return None,
        })
    }

    /// Write the components to the front of `dst`.
    pub fn write(&self, dst: &mut [f32]) {
        match self {
            FieldValue::Scalar(x) => dst[0] = *x,
            FieldValue::Vec2(v) => v.write_to_slice(dst),
            FieldValue::Vec3(v) => v.write_to_slice(dst),
            FieldValue::Vec4(v) => v.write_to_slice(dst),
        }
    }

    pub fn read(kind: FieldKind, src: &[f32]) -> Self {
        match kind {
            FieldKind::Scalar => FieldValue::Scalar(src[0]),
            FieldKind::Vec2 => FieldValue::Vec2(Vec2::from_slice(src)),
            FieldKind::Vec3 => FieldValue::Vec3(Vec3::from_slice(src)),
            FieldKind::Vec4 => FieldValue::Vec4(Vec4::from_slice(src)),
        }
    }

    pub fn as_scalar(&self) -> Option<f32> {
        match self {
            FieldValue::Scalar(x) => Some(*x),
            _ => None,
        }
    }

    pub fn as_vec2(&self) -> Option<Vec2> {
        match self {
            FieldValue::Vec2(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_vec3(&self) -> Option<Vec3> {
        match self {
            FieldValue::Vec3(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_vec4(&self) -> Option<Vec4> {
        match self {
            FieldValue::Vec4(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<f32> for FieldValue {
    fn from(value: f32) -> Self {
        FieldValue::Scalar(value)
    }
}

impl From<Vec2> for FieldValue {
    fn from(value: Vec2) -> Self {
        FieldValue::Vec2(value)
    }
}

impl From<Vec3> for FieldValue {
    fn from(value: Vec3) -> Self {
        FieldValue::Vec3(value)
    }
}

impl From<Vec4> for FieldValue {
    fn from(value: Vec4) -> Self {
        FieldValue::Vec4(value)
    }
}

/// A struct whose fields can be enumerated in a stable order.
///
/// ```ignore
/// impl Record for Particle {
///     fn fields(&self) -> Vec<(&str, FieldValue)> {
///         vec![("pos", self.pos.into()), ("vel", self.vel.into()), ("lifetime", self.lifetime.into())]
///     }
///     fn set_field(&mut self, name: &str, value: FieldValue) { ... }
/// }
/// ```
pub trait Record: Clone {
    fn fields(&self) -> Vec<(&str, FieldValue)>;
    fn set_field(&mut self, name: &str, value: FieldValue);
}

/// A record whose fields are only known at runtime.
pub type DynamicRecord = IndexMap<String, FieldValue>;

impl Record for DynamicRecord {
    fn fields(&self) -> Vec<(&str, FieldValue)> {
        self.iter().map(|(name, value)| (name.as_str(), *value)).collect()
    }

    fn set_field(&mut self, name: &str, value: FieldValue) {
        if let Some(slot) = self.get_mut(name) {
            *slot = value;
        }
    }
}

/// Build a [`DynamicRecord`] from loose component slices.
pub fn dynamic_record<'a>(
    fields: impl IntoIterator<Item = (&'a str, &'a [f32])>,
) -> Result<DynamicRecord, LayoutError> {
    let mut record = DynamicRecord::new();
    for (name, components) in fields {
        let value =
            FieldValue::from_components(components).ok_or_else(|| LayoutError::UnsupportedValue {
                field: name.to_owned(),
                components: components.len(),
            })?;
        if record.insert(name.to_owned(), value).is_some() {
            return Err(LayoutError::DuplicateField(name.to_owned()));
        }
    }
    Ok(record)
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub enum Packing {
    /// Fields back to back, as in a plain `Float32Array`.
    #[default]
    Packed,
    /// WGSL host-shareable alignment: vec2 on 2 components, vec3/vec4 on 4, record size rounded to the widest field.
    Wgsl,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldLayout {
    pub name: String,
    pub kind: FieldKind,
    pub size: usize,
    pub offset: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordLayout {
    fields: Vec<FieldLayout>,
    record_size: usize,
    packing: Packing,
}

/// Packed layout of `proto`, fields in declaration order.
pub fn layout_of<R: Record>(proto: &R) -> Result<RecordLayout, LayoutError> {
    layout_with(proto, Packing::Packed)
}

pub fn layout_with<R: Record>(proto: &R, packing: Packing) -> Result<RecordLayout, LayoutError> {
    let mut fields: Vec<FieldLayout> = Vec::new();
    let mut offset = 0usize;
    let mut max_align = 1usize;
    for (name, value) in proto.fields() {
        if fields.iter().any(|f| f.name == name) {
            return Err(LayoutError::DuplicateField(name.to_owned()));
        }
        let kind = value.kind();
        if packing == Packing::Wgsl {
            let align = kind.alignment();
            max_align = max_align.max(align);
            offset = offset.next_multiple_of(align);
        }
        fields.push(FieldLayout {
            name: name.to_owned(),
            kind,
            size: kind.components(),
            offset,
        });
        offset += kind.components();
    }
    let record_size = match packing {
        Packing::Packed => offset,
        Packing::Wgsl => offset.next_multiple_of(max_align),
    };
    Ok(RecordLayout {
        fields,
        record_size,
        packing,
    })
}

impl RecordLayout {
    pub fn fields(&self) -> &[FieldLayout] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldLayout> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Components per record, including any alignment padding.
    pub fn record_size(&self) -> usize {
        self.record_size
    }

    pub fn byte_stride(&self) -> u64 {
        (self.record_size * std::mem::size_of::<f32>()) as u64
    }

    pub fn packing(&self) -> Packing {
        self.packing
    }

    /// Write `record` into the slot of `dst` that starts at `index * record_size`.
    pub fn write_record<R: Record>(
        &self,
        dst: &mut [f32],
        index: usize,
        record: &R,
    ) -> Result<(), LayoutError> {
        let base = self.record_base(dst.len(), index)?;
        let values = record.fields();
        for field in &self.fields {
            let value = values
                .iter()
                .find(|(name, _)| *name == field.name)
                .map(|(_, value)| *value)
                .ok_or_else(|| LayoutError::MissingField(field.name.clone()))?;
            self.check_kind(field, &value)?;
            value.write(&mut dst[base + field.offset..]);
        }
        Ok(())
    }

    /// Read the record at `index`, starting from a clone of `proto`.
    pub fn read_record<R: Record>(
        &self,
        src: &[f32],
        index: usize,
        proto: &R,
    ) -> Result<R, LayoutError> {
        let base = self.record_base(src.len(), index)?;
        let mut record = proto.clone();
        for field in &self.fields {
            let start = base + field.offset;
            record.set_field(
                &field.name,
                FieldValue::read(field.kind, &src[start..start + field.size]),
            );
        }
        Ok(record)
    }

    /// Update a single field of the record at `index`.
    pub fn write_field(
        &self,
        dst: &mut [f32],
        index: usize,
        name: &str,
        value: FieldValue,
    ) -> Result<(), LayoutError> {
        let base = self.record_base(dst.len(), index)?;
        let field = self
            .field(name)
            .ok_or_else(|| LayoutError::MissingField(name.to_owned()))?;
        self.check_kind(field, &value)?;
        value.write(&mut dst[base + field.offset..]);
        Ok(())
    }

    fn check_kind(&self, field: &FieldLayout, value: &FieldValue) -> Result<(), LayoutError> {
        if value.kind() != field.kind {
            return Err(LayoutError::KindMismatch {
                field: field.name.clone(),
                expected: field.kind,
                found: value.kind(),
            });
        }
        Ok(())
    }

    fn record_base(&self, scalars: usize, index: usize) -> Result<usize, LayoutError> {
        let len = if self.record_size == 0 {
            0
        } else {
            scalars / self.record_size
        };
        if index >= len {
            return Err(LayoutError::IndexOutOfRange { index, len });
        }
        Ok(index * self.record_size)
    }

    /// One instance-rate vertex attribute per field, all striding over the same buffer.
    pub fn vertex_attributes(&self, first_location: u32) -> Vec<wgpu::VertexAttribute> {
        self.fields
            .iter()
            .zip(first_location..)
            .map(|(field, shader_location)| wgpu::VertexAttribute {
                format: field.kind.vertex_format(),
                offset: (field.offset * std::mem::size_of::<f32>()) as u64,
                shader_location,
            })
            .collect()
    }

    pub fn vertex_buffer_layout<'a>(
        &self,
        attributes: &'a [wgpu::VertexAttribute],
    ) -> wgpu::VertexBufferLayout<'a> {
        wgpu::VertexBufferLayout {
            array_stride: self.byte_stride(),
            step_mode: wgpu::VertexStepMode::Instance,
            attributes,
        }
    }

    /// A WGSL struct declaration matching this layout. Only meaningful for [`Packing::Wgsl`].
    pub fn wgsl_struct(&self, name: &str) -> String {
        let mut out = format!("struct {name} {{\n");
        for field in &self.fields {
            out.push_str(&format!("    {}: {},\n", field.name, field.kind.wgsl_type()));
        }
        out.push_str("}\n");
        out
    }
}

/// A CPU-resident array of records sharing one layout.
#[derive(Clone, Debug)]
pub struct RecordArray<R> {
    proto: R,
    layout: RecordLayout,
    data: Vec<f32>,
    len: usize,
}

impl<R: Record> RecordArray<R> {
    /// `len` copies of `proto`.
    pub fn new(proto: R, len: usize, packing: Packing) -> Result<Self, LayoutError> {
        let layout = layout_with(&proto, packing)?;
        let mut data = vec![0.0; len * layout.record_size()];
        for index in 0..len {
            layout.write_record(&mut data, index, &proto)?;
        }
        Ok(Self {
            proto,
            layout,
            data,
            len,
        })
    }

    pub fn layout(&self) -> &RecordLayout {
        &self.layout
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, index: usize) -> Result<R, LayoutError> {
        self.layout.read_record(&self.data, index, &self.proto)
    }

    pub fn set(&mut self, index: usize, record: &R) -> Result<(), LayoutError> {
        self.layout.write_record(&mut self.data, index, record)
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    struct Particle {
        pos: Vec4,
        vel: Vec4,
        col: Vec4,
        lifetime: f32,
        pad: f32,
    }

    impl Default for Particle {
        fn default() -> Self {
            Self {
                pos: Vec4::ZERO,
                vel: Vec4::ZERO,
                col: Vec4::ONE,
                lifetime: 0.0,
                pad: 0.0,
            }
        }
    }

    impl Record for Particle {
        fn fields(&self) -> Vec<(&str, FieldValue)> {
            vec![
                ("pos", self.pos.into()),
                ("vel", self.vel.into()),
                ("col", self.col.into()),
                ("lifetime", self.lifetime.into()),
                ("pad", self.pad.into()),
            ]
        }

        fn set_field(&mut self, name: &str, value: FieldValue) {
            match name {
                "pos" => self.pos = value.as_vec4().unwrap_or(self.pos),
                "vel" => self.vel = value.as_vec4().unwrap_or(self.vel),
                "col" => self.col = value.as_vec4().unwrap_or(self.col),
                "lifetime" => self.lifetime = value.as_scalar().unwrap_or(self.lifetime),
                "pad" => self.pad = value.as_scalar().unwrap_or(self.pad),
                _ => {}
            }
        }
    }

    fn triples(layout: &RecordLayout) -> Vec<(&str, usize, usize)> {
        layout
            .fields()
            .iter()
            .map(|f| (f.name.as_str(), f.size, f.offset))
            .collect()
    }

    #[test]
    fn packed_layout_follows_declaration_order() {
        let layout = layout_of(&Particle::default()).unwrap();
        assert_eq!(
            triples(&layout),
            vec![
                ("pos", 4, 0),
                ("vel", 4, 4),
                ("col", 4, 8),
                ("lifetime", 1, 12),
                ("pad", 1, 13),
            ]
        );
        assert_eq!(layout.record_size(), 14);
    }

    #[test]
    fn layout_is_deterministic() {
        let proto = Particle::default();
        let first = layout_of(&proto).unwrap();
        let second = layout_of(&proto).unwrap();
        assert_eq!(first, second);

        let mut expected_offset = 0;
        for field in first.fields() {
            assert_eq!(field.offset, expected_offset);
            expected_offset += field.size;
        }
        assert_eq!(first.record_size(), expected_offset);
    }

    #[test]
    fn wgsl_packing_aligns_vectors() {
        let proto = dynamic_record([
            ("mass", &[1.0][..]),
            ("vel", &[0.0, 0.0, 0.0][..]),
            ("uv", &[0.0, 0.0][..]),
        ])
        .unwrap();
        let layout = layout_with(&proto, Packing::Wgsl).unwrap();
        assert_eq!(triples(&layout), vec![("mass", 1, 0), ("vel", 3, 4), ("uv", 2, 8)]);
        assert_eq!(layout.record_size(), 12);
    }

    #[test]
    fn unsupported_component_counts_are_rejected() {
        let matrix = [0.0f32; 16];
        let err = dynamic_record([("pos", &[0.0, 1.0][..]), ("model", &matrix[..])]).unwrap_err();
        assert_eq!(
            err,
            LayoutError::UnsupportedValue {
                field: "model".into(),
                components: 16
            }
        );
    }

    #[test]
    fn record_array_round_trips_typed_records() {
        let mut records = RecordArray::new(Particle::default(), 3, Packing::Packed).unwrap();
        assert_eq!(records.get(2).unwrap(), Particle::default());

        let moved = Particle {
            pos: Vec4::new(1.0, 2.0, 3.0, 1.0),
            lifetime: 4.5,
            ..Default::default()
        };
        records.set(1, &moved).unwrap();
        assert_eq!(records.get(1).unwrap(), moved);
        assert_eq!(records.as_slice()[14..18], [1.0, 2.0, 3.0, 1.0]);
        assert_eq!(records.as_slice()[14 + 12], 4.5);
        assert!(matches!(
            records.get(3),
            Err(LayoutError::IndexOutOfRange { index: 3, len: 3 })
        ));
    }

    #[test]
    fn vertex_attributes_stride_over_fields() {
        let layout = layout_of(&Particle::default()).unwrap();
        let attributes = layout.vertex_attributes(2);
        assert_eq!(attributes.len(), 5);
        assert_eq!(attributes[1].offset, 16);
        assert_eq!(attributes[1].shader_location, 3);
        assert_eq!(attributes[3].format, wgpu::VertexFormat::Float32);
        let buffer_layout = layout.vertex_buffer_layout(&attributes);
        assert_eq!(buffer_layout.array_stride, 56);
    }

    #[test]
    fn kind_mismatch_is_reported() {
        let proto = dynamic_record([("pos", &[0.0, 0.0][..])]).unwrap();
        let layout = layout_of(&proto).unwrap();
        let mut data = vec![0.0; 2];
        let err = layout
            .write_field(&mut data, 0, "pos", FieldValue::Scalar(1.0))
            .unwrap_err();
        assert!(matches!(err, LayoutError::KindMismatch { .. }));
    }
}
