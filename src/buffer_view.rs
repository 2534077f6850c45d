//! Fixed-arity views over flat numeric arrays, used to build initial-condition textures and to read back simulation
//! state on the CPU. A `Vec4Buffer` of `n` elements is exactly the texel payload of an RGBA float texture with `n`
//! texels.

use std::{borrow::Cow, marker::PhantomData};

use glam::{Vec2, Vec3, Vec4};
use nanorand::{Rng, WyRand};

use crate::error::BufferError;

/// A scalar type a buffer can be backed by.
pub trait Scalar: Copy + Default {
    fn to_f32(self) -> f32;
    fn from_f32(value: f32) -> Self;
    /// Borrow `values` as `f32` if they already are, copying otherwise.
    fn as_f32s(values: &[Self]) -> Cow<'_, [f32]>;
}

impl Scalar for f32 {
    fn to_f32(self) -> f32 {
        self
    }

    fn from_f32(value: f32) -> Self {
        value
    }

    fn as_f32s(values: &[Self]) -> Cow<'_, [f32]> {
        Cow::Borrowed(values)
    }
}

impl Scalar for f64 {
    fn to_f32(self) -> f32 {
        self as f32
    }

    fn from_f32(value: f32) -> Self {
        value as f64
    }

    fn as_f32s(values: &[Self]) -> Cow<'_, [f32]> {
        Cow::Owned(values.iter().map(|v| *v as f32).collect())
    }
}

/// Backing store of a [`VecBuffer`].
pub trait Storage {
    type Scalar: Scalar;
    fn scalars(&self) -> &[Self::Scalar];
}

pub trait StorageMut: Storage {
    fn scalars_mut(&mut self) -> &mut [Self::Scalar];
}

impl<T: Scalar> Storage for Vec<T> {
    type Scalar = T;
    fn scalars(&self) -> &[T] {
        self
    }
}

impl<T: Scalar> StorageMut for Vec<T> {
    fn scalars_mut(&mut self) -> &mut [T] {
        self
    }
}

impl<T: Scalar> Storage for Box<[T]> {
    type Scalar = T;
    fn scalars(&self) -> &[T] {
        self
    }
}

impl<T: Scalar> StorageMut for Box<[T]> {
    fn scalars_mut(&mut self) -> &mut [T] {
        self
    }
}

impl<T: Scalar> Storage for &[T] {
    type Scalar = T;
    fn scalars(&self) -> &[T] {
        self
    }
}

impl<T: Scalar> Storage for &mut [T] {
    type Scalar = T;
    fn scalars(&self) -> &[T] {
        self
    }
}

impl<T: Scalar> StorageMut for &mut [T] {
    fn scalars_mut(&mut self) -> &mut [T] {
        self
    }
}

/// A tuple type stored as `ARITY` consecutive scalars.
pub trait Element: Copy {
    const ARITY: usize;
    fn read<T: Scalar>(src: &[T]) -> Self;
    fn write<T: Scalar>(self, dst: &mut [T]);
}

impl Element for Vec2 {
    const ARITY: usize = 2;

    fn read<T: Scalar>(src: &[T]) -> Self {
        Vec2::new(src[0].to_f32(), src[1].to_f32())
    }

    fn write<T: Scalar>(self, dst: &mut [T]) {
        dst[0] = T::from_f32(self.x);
        dst[1] = T::from_f32(self.y);
    }
}

impl Element for Vec3 {
    const ARITY: usize = 3;

    fn read<T: Scalar>(src: &[T]) -> Self {
        Vec3::new(src[0].to_f32(), src[1].to_f32(), src[2].to_f32())
    }

    fn write<T: Scalar>(self, dst: &mut [T]) {
        dst[0] = T::from_f32(self.x);
        dst[1] = T::from_f32(self.y);
        dst[2] = T::from_f32(self.z);
    }
}

impl Element for Vec4 {
    const ARITY: usize = 4;

    fn read<T: Scalar>(src: &[T]) -> Self {
        Vec4::new(
            src[0].to_f32(),
            src[1].to_f32(),
            src[2].to_f32(),
            src[3].to_f32(),
        )
    }

    fn write<T: Scalar>(self, dst: &mut [T]) {
        dst[0] = T::from_f32(self.x);
        dst[1] = T::from_f32(self.y);
        dst[2] = T::from_f32(self.z);
        dst[3] = T::from_f32(self.w);
    }
}

/// Indexed access to a flat array interpreted as a sequence of `V` tuples.
#[derive(Clone, Debug)]
pub struct VecBuffer<V, S = Vec<f32>> {
    data: S,
    len: usize,
    _element: PhantomData<V>,
}

pub type Vec2Buffer<S = Vec<f32>> = VecBuffer<Vec2, S>;
pub type Vec3Buffer<S = Vec<f32>> = VecBuffer<Vec3, S>;
pub type Vec4Buffer<S = Vec<f32>> = VecBuffer<Vec4, S>;

impl<V: Element> VecBuffer<V> {
    /// A zeroed buffer of `count` elements.
    pub fn empty(count: usize) -> Self {
        Self {
            data: vec![0.0; count * V::ARITY],
            len: count,
            _element: PhantomData,
        }
    }

    pub fn from_elements(elements: impl IntoIterator<Item = V>) -> Self {
        let mut data = Vec::new();
        let mut len = 0;
        for element in elements {
            let offset = data.len();
            data.resize(offset + V::ARITY, 0.0);
            element.write(&mut data[offset..]);
            len += 1;
        }
        Self {
            data,
            len,
            _element: PhantomData,
        }
    }
}

impl<V: Element, S: Storage> VecBuffer<V, S> {
    /// Wrap existing storage without copying it.
    pub fn view(data: S) -> Result<Self, BufferError> {
        let scalars = data.scalars().len();
        if scalars % V::ARITY != 0 {
            return Err(BufferError::InvalidLength {
                len: scalars,
                arity: V::ARITY,
            });
        }
        Ok(Self {
            data,
            len: scalars / V::ARITY,
            _element: PhantomData,
        })
    }

    pub const fn arity(&self) -> usize {
        V::ARITY
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn check(&self, index: usize) -> Result<usize, BufferError> {
        if index >= self.len {
            return Err(BufferError::IndexOutOfRange {
                index,
                len: self.len,
            });
        }
        Ok(index * V::ARITY)
    }

    pub fn get(&self, index: usize) -> Result<V, BufferError> {
        let offset = self.check(index)?;
        Ok(V::read(&self.data.scalars()[offset..offset + V::ARITY]))
    }

    pub fn iter(&self) -> impl Iterator<Item = V> + '_ {
        self.data.scalars().chunks_exact(V::ARITY).map(V::read)
    }

    /// Contiguous `f32` scalars, borrowed when the storage already is `f32`.
    pub fn data_array(&self) -> Cow<'_, [f32]> {
        S::Scalar::as_f32s(self.data.scalars())
    }

    pub fn to_owned_buffer(&self) -> VecBuffer<V> {
        VecBuffer {
            data: self.data_array().into_owned(),
            len: self.len,
            _element: PhantomData,
        }
    }

    pub fn into_inner(self) -> S {
        self.data
    }
}

impl<V: Element, S: StorageMut> VecBuffer<V, S> {
    pub fn set(&mut self, index: usize, value: V) -> Result<(), BufferError> {
        let offset = self.check(index)?;
        value.write(&mut self.data.scalars_mut()[offset..offset + V::ARITY]);
        Ok(())
    }
}

impl<V: Element> VecBuffer<V> {
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.data)
    }
}

/// A standard normal sample (Box-Muller).
fn gaussian(rng: &mut WyRand) -> f32 {
    // 1 - u keeps the logarithm finite
    let u1 = 1.0 - rng.generate::<f32>();
    let u2 = rng.generate::<f32>();
    (-2.0 * u1.ln()).sqrt() * (std::f32::consts::TAU * u2).cos()
}

/// Midpoint-displacement subdivision of the path stored in `path[start..=end]`.
///
/// The tuples at `start` and `end` must already hold the path endpoints and are left untouched. Every index strictly
/// between them is overwritten: each segment's midpoint element receives the average of the segment's endpoints,
/// jittered by a Gaussian with standard deviation `deviation * segment length`, and both halves are then subdivided
/// in turn. With `deviation == 0` the result is the straight line between the endpoints.
pub fn complexify_path<S: StorageMut>(
    path: &mut Vec3Buffer<S>,
    start: usize,
    end: usize,
    deviation: f32,
    rng: &mut WyRand,
) -> Result<(), BufferError> {
    if start > end || end >= path.len() {
        return Err(BufferError::InvalidRange {
            start,
            end,
            len: path.len(),
        });
    }

    let mut segments = vec![(start, end)];
    while let Some((si, ei)) = segments.pop() {
        let mid = si + (ei - si) / 2;
        if mid <= si {
            continue;
        }

        let sv = path.get(si)?;
        let ev = path.get(ei)?;
        let center = (sv + ev) / 2.0;
        let stddev = deviation * sv.distance(center) * 2.0;
        let jitter = Vec3::new(gaussian(rng), gaussian(rng), gaussian(rng)) * stddev;
        path.set(mid, center + jitter)?;

        segments.push((mid, ei));
        segments.push((si, mid));
    }
    Ok(())
}
