use derive_more::{Deref, DerefMut, Display, From, Into};
use itertools::Itertools;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Extents of an n-d index space, outermost axis first.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash, Deref, DerefMut, From, Into, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[display("[{}]", _0.iter().format(", "))]
pub struct Shape(Vec<usize>);

impl<const N: usize> From<[usize; N]> for Shape {
    #[inline]
    fn from(value: [usize; N]) -> Self {
        Self(value.to_vec())
    }
}

impl From<&[usize]> for Shape {
    #[inline]
    fn from(value: &[usize]) -> Self {
        Self(value.to_vec())
    }
}

/// Row-major strides of `shape`.
pub fn strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for axis in (0..shape.len().saturating_sub(1)).rev() {
        strides[axis] = strides[axis + 1] * shape[axis + 1];
    }
    strides
}

impl Shape {
    #[inline]
    pub fn new(shape: impl Into<Vec<usize>>) -> Self {
        Self(shape.into())
    }

    /// Number of elements. A 0-d shape holds one.
    #[inline]
    pub fn size(&self) -> usize {
        self.iter().product()
    }

    #[inline]
    pub fn strides(&self) -> Vec<usize> {
        strides(self)
    }

    /// Row-major flat index of `coord`.
    #[inline]
    pub fn flatten(&self, coord: &[usize]) -> usize {
        coord.iter().zip_eq(self.strides()).map(|(x, s)| x * s).sum()
    }

    /// Coordinate of the row-major flat `index`.
    pub fn unflatten(&self, mut index: usize) -> Vec<usize> {
        let mut coord = vec![0; self.len()];
        for (axis, &dim) in self.iter().enumerate().rev() {
            coord[axis] = index % dim;
            index /= dim;
        }
        coord
    }

    /// Iterates over every coordinate in row-major order.
    #[inline]
    pub fn coords(&self) -> Coords {
        Coords::new(self.to_vec())
    }

    /// Broadcasts two shapes by right-aligning them.
    /// Returns `None` if a pair of dimensions is neither equal nor 1.
    pub fn broadcast(&self, other: &Shape) -> Option<Shape> {
        let len = self.len().max(other.len());
        let lhs = std::iter::repeat_n(1, len - self.len()).chain(self.iter().copied());
        let rhs = std::iter::repeat_n(1, len - other.len()).chain(other.iter().copied());
        lhs.zip(rhs)
            .map(|(x, y)| match (x, y) {
                (x, y) if x == y => Some(x),
                (1, y) => Some(y),
                (x, 1) => Some(x),
                _ => None,
            })
            .collect::<Option<Vec<_>>>()
            .map(Shape)
    }

    /// Strides of `self` when read as the broadcast shape `output`.
    /// Broadcast axes get a stride of 0.
    pub fn broadcast_strides(&self, output: &[usize]) -> Vec<usize> {
        let strides = self.strides();
        let pad = output.len() - self.len();
        (0..output.len())
            .map(|axis| match axis.checked_sub(pad) {
                Some(axis) if self[axis] != 1 => strides[axis],
                _ => 0,
            })
            .collect()
    }
}

/// Row-major coordinate iterator.
#[derive(Debug, Clone)]
pub struct Coords {
    shape: Vec<usize>,
    next: Option<Vec<usize>>,
}

impl Coords {
    pub fn new(shape: Vec<usize>) -> Self {
        let next = match shape.contains(&0) {
            true => None,
            false => Some(vec![0; shape.len()]),
        };
        Self { shape, next }
    }
}

impl Iterator for Coords {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next.take()?;
        let mut next = current.clone();
        for axis in (0..next.len()).rev() {
            next[axis] += 1;
            if next[axis] < self.shape[axis] {
                self.next = Some(next);
                return Some(current);
            }
            next[axis] = 0;
        }
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::Shape;

    #[test]
    fn test_flatten() {
        let shape = Shape::from([2, 3, 4]);
        assert_eq!(shape.size(), 24);
        assert_eq!(shape.strides(), vec![12, 4, 1]);
        for (index, coord) in shape.coords().enumerate() {
            assert_eq!(shape.flatten(&coord), index);
            assert_eq!(shape.unflatten(index), coord);
        }
        assert_eq!(shape.coords().count(), 24);
        assert_eq!(format!("{shape}"), "[2, 3, 4]");
    }

    #[test]
    fn test_scalar_coords() {
        let shape = Shape::default();
        assert_eq!(shape.size(), 1);
        assert_eq!(shape.coords().collect::<Vec<_>>(), vec![Vec::<usize>::new()]);
    }

    #[test]
    fn test_broadcast() {
        let lhs = Shape::from([4, 1, 3]);
        let rhs = Shape::from([5, 3]);
        assert_eq!(lhs.broadcast(&rhs), Some(Shape::from([4, 5, 3])));
        assert_eq!(rhs.broadcast_strides(&[4, 5, 3]), vec![0, 3, 1]);
        assert_eq!(lhs.broadcast_strides(&[4, 5, 3]), vec![3, 0, 1]);
        assert!(Shape::from([4, 2]).broadcast(&Shape::from([3])).is_none());
    }
}
