use std::fmt;

// Shape — N-dimensional shape of a tensor
//
// The shapes that actually flow through a style-transfer graph are a small
// family: image tensors [1, 3, H, W], feature maps [1, C, H', W'], flattened
// feature matrices [C, N], Gram matrices [C, C], per-channel constants
// [1, 3, 1, 1], and scalar losses []. The Shape type stays fully general
// regardless — the broadcasting rules below are what let a [1, 3, 1, 1]
// normalization constant apply to a [1, 3, H, W] image.

/// N-dimensional shape of a tensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Shape(Vec<usize>);

impl Shape {
    /// Create a new shape from a vector of dimension sizes.
    pub fn new(dims: Vec<usize>) -> Self {
        Shape(dims)
    }

    /// The dimension sizes as a slice.
    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    /// Number of dimensions (0 for scalar, 4 for an image tensor).
    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Total number of elements. A scalar shape [] has 1 element.
    pub fn elem_count(&self) -> usize {
        self.0.iter().product::<usize>().max(1)
    }

    /// Row-major (C-order) strides for this shape.
    ///
    /// For [1, 3, 64, 64] the strides are [12288, 4096, 64, 1]: the last
    /// dimension is contiguous and each earlier dimension jumps by the
    /// product of the sizes after it.
    pub fn stride_contiguous(&self) -> Vec<usize> {
        let mut strides = vec![0usize; self.rank()];
        if self.rank() > 0 {
            strides[self.rank() - 1] = 1;
            for i in (0..self.rank() - 1).rev() {
                strides[i] = strides[i + 1] * self.0[i + 1];
            }
        }
        strides
    }

    /// Size of a specific dimension.
    pub fn dim(&self, d: usize) -> crate::Result<usize> {
        self.0.get(d).copied().ok_or(crate::Error::DimOutOfRange {
            dim: d,
            rank: self.rank(),
        })
    }

    /// Compute the broadcast output shape of two input shapes.
    ///
    /// NumPy rules: align from the right; dimensions are compatible when
    /// equal or when one of them is 1; missing leading dimensions count
    /// as 1. `[1, 3, 64, 64]` vs `[1, 3, 1, 1]` → `[1, 3, 64, 64]`.
    pub fn broadcast_shape(lhs: &Shape, rhs: &Shape) -> crate::Result<Shape> {
        let l = lhs.dims();
        let r = rhs.dims();
        let max_rank = l.len().max(r.len());
        let mut result = Vec::with_capacity(max_rank);

        for i in 0..max_rank {
            let ld = if i < l.len() { l[l.len() - 1 - i] } else { 1 };
            let rd = if i < r.len() { r[r.len() - 1 - i] } else { 1 };

            if ld == rd {
                result.push(ld);
            } else if ld == 1 {
                result.push(rd);
            } else if rd == 1 {
                result.push(ld);
            } else {
                return Err(crate::Error::msg(format!(
                    "shapes {:?} and {:?} are not broadcast-compatible (dim {} from right: {} vs {})",
                    l, r, i, ld, rd
                )));
            }
        }

        result.reverse();
        Ok(Shape::new(result))
    }

    /// Strides that read this shape's data as if it had `target` shape.
    ///
    /// Broadcast dimensions (size 1 here, larger in the target) and missing
    /// leading dimensions get stride 0, repeating the single element.
    /// `source_strides` are the actual strides of the underlying view.
    pub fn broadcast_strides(&self, source_strides: &[usize], target: &Shape) -> Vec<usize> {
        let self_dims = self.dims();
        let target_dims = target.dims();

        let mut result = vec![0usize; target_dims.len()];
        let offset = target_dims.len() - self_dims.len();

        for i in 0..self_dims.len() {
            if self_dims[i] == target_dims[i + offset] {
                result[i + offset] = source_strides[i];
            }
            // else: self_dims[i] == 1, stride stays 0 (broadcast)
        }
        result
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, "]")
    }
}

// From impls so call sites can write Shape::from((1, 3, h, w)).

impl From<()> for Shape {
    fn from(_: ()) -> Self {
        Shape(vec![])
    }
}

impl From<usize> for Shape {
    fn from(d: usize) -> Self {
        Shape(vec![d])
    }
}

impl From<(usize, usize)> for Shape {
    fn from((d0, d1): (usize, usize)) -> Self {
        Shape(vec![d0, d1])
    }
}

impl From<(usize, usize, usize)> for Shape {
    fn from((d0, d1, d2): (usize, usize, usize)) -> Self {
        Shape(vec![d0, d1, d2])
    }
}

impl From<(usize, usize, usize, usize)> for Shape {
    fn from((d0, d1, d2, d3): (usize, usize, usize, usize)) -> Self {
        Shape(vec![d0, d1, d2, d3])
    }
}

impl From<Vec<usize>> for Shape {
    fn from(v: Vec<usize>) -> Self {
        Shape(v)
    }
}

impl From<&[usize]> for Shape {
    fn from(s: &[usize]) -> Self {
        Shape(s.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_shape() {
        let s = Shape::from(());
        assert_eq!(s.rank(), 0);
        assert_eq!(s.elem_count(), 1);
        assert_eq!(s.stride_contiguous(), Vec::<usize>::new());
    }

    #[test]
    fn test_image_shape() {
        let s = Shape::from((1, 3, 64, 64));
        assert_eq!(s.rank(), 4);
        assert_eq!(s.elem_count(), 3 * 64 * 64);
        assert_eq!(s.stride_contiguous(), vec![12288, 4096, 64, 1]);
    }

    #[test]
    fn test_broadcast_channel_constant() {
        // Per-channel normalization constant against an image tensor.
        let img = Shape::from((1, 3, 8, 8));
        let chan = Shape::from((1, 3, 1, 1));
        let out = Shape::broadcast_shape(&img, &chan).unwrap();
        assert_eq!(out.dims(), &[1, 3, 8, 8]);
    }

    #[test]
    fn test_broadcast_incompatible() {
        let a = Shape::from((2, 3));
        let b = Shape::from((2, 4));
        assert!(Shape::broadcast_shape(&a, &b).is_err());
    }

    #[test]
    fn test_broadcast_strides() {
        let chan = Shape::from((1, 3, 1, 1));
        let target = Shape::from((1, 3, 8, 8));
        let strides = chan.broadcast_strides(&chan.stride_contiguous(), &target);
        // Channel dim keeps its stride, broadcast dims read with stride 0.
        assert_eq!(strides, vec![3, 1, 0, 0]);
    }

    #[test]
    fn test_display() {
        let s = Shape::from((3, 4));
        assert_eq!(format!("{}", s), "[3, 4]");
    }
}
