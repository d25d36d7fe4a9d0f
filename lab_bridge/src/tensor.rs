//! Strided tensors over shared storage, exposed to scripts as
//! `tensor.ByteTensor` and `tensor.DoubleTensor`.

mod script;

pub use script::{install, TENSOR_MODULE};

use std::cell::{Ref, RefCell};
use std::fmt;
use std::rc::Rc;

use thiserror::Error;

/// Element type of a tensor class.
pub trait Element: Copy + Default + PartialEq + fmt::Debug + 'static {
    const CLASS_NAME: &'static str;

    /// Convert a script number, `None` when it is not representable.
    fn from_number(value: f64) -> Option<Self>;

    fn to_number(self) -> f64;
}

impl Element for u8 {
    const CLASS_NAME: &'static str = "tensor.ByteTensor";

    fn from_number(value: f64) -> Option<Self> {
        (value.fract() == 0.0 && (0.0..=255.0).contains(&value)).then_some(value as u8)
    }

    fn to_number(self) -> f64 {
        f64::from(self)
    }
}

impl Element for f64 {
    const CLASS_NAME: &'static str = "tensor.DoubleTensor";

    fn from_number(value: f64) -> Option<Self> {
        Some(value)
    }

    fn to_number(self) -> f64 {
        self
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TensorError {
    #[error("dimension {dim} out of range for {dims} dimensions")]
    DimOutOfRange { dim: usize, dims: usize },
    #[error("index {index} out of range for dimension {dim} of size {size}")]
    IndexOutOfRange { dim: usize, index: usize, size: usize },
    #[error("expected {expected} elements, got {actual}")]
    ElementCount { expected: usize, actual: usize },
    #[error("tensor is not contiguous")]
    NotContiguous,
    #[error("tensor storage is in use")]
    StorageBusy,
    #[error("shape {shape:?} is too large")]
    TooLarge { shape: Vec<usize> },
}

/// View onto shared storage. Cloning a `Tensor` creates another view of the
/// same elements; use [`Tensor::clone_contiguous`] for a copy.
#[derive(Clone)]
pub struct Tensor<E> {
    storage: Rc<RefCell<Vec<E>>>,
    shape: Vec<usize>,
    strides: Vec<usize>,
    offset: usize,
}

impl<E: Element> Tensor<E> {
    pub fn zeros(shape: Vec<usize>) -> Result<Self, TensorError> {
        let len = element_count(&shape)?;
        let mut data = Vec::new();
        if data.try_reserve_exact(len).is_err() {
            return Err(TensorError::TooLarge { shape });
        }
        data.resize(len, E::default());
        Ok(Self::with_storage(data, shape))
    }

    pub fn from_vec(shape: Vec<usize>, data: Vec<E>) -> Result<Self, TensorError> {
        let expected = element_count(&shape)?;
        if expected != data.len() {
            return Err(TensorError::ElementCount {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self::with_storage(data, shape))
    }

    fn with_storage(data: Vec<E>, shape: Vec<usize>) -> Self {
        let strides = row_major_strides(&shape);
        Self {
            storage: Rc::new(RefCell::new(data)),
            shape,
            strides,
            offset: 0,
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }

    /// Row-major with no gaps. Strides of unit dimensions are ignored.
    pub fn is_contiguous(&self) -> bool {
        let mut expected = 1;
        for (size, stride) in self.shape.iter().zip(&self.strides).rev() {
            if *size != 1 && *stride != expected {
                return false;
            }
            expected *= size;
        }
        true
    }

    /// Elements in row-major order without copying, when contiguous.
    pub fn contiguous_data(&self) -> Option<Ref<'_, [E]>> {
        if !self.is_contiguous() {
            return None;
        }
        let range = self.offset..self.offset + self.num_elements();
        Some(Ref::map(self.storage.borrow(), |data| &data[range]))
    }

    pub fn to_vec(&self) -> Vec<E> {
        let data = self.storage.borrow();
        let mut values = Vec::with_capacity(self.num_elements());
        self.for_each_offset(|offset| values.push(data[offset]));
        values
    }

    pub fn get(&self, index: &[usize]) -> Result<E, TensorError> {
        if index.len() != self.shape.len() {
            return Err(TensorError::DimOutOfRange {
                dim: index.len(),
                dims: self.shape.len(),
            });
        }
        let mut offset = self.offset;
        for (dim, (&position, &size)) in index.iter().zip(&self.shape).enumerate() {
            if position >= size {
                return Err(TensorError::IndexOutOfRange {
                    dim,
                    index: position,
                    size,
                });
            }
            offset += position * self.strides[dim];
        }
        Ok(self.storage.borrow()[offset])
    }

    /// View with `dim` removed, fixed at `index`.
    pub fn select(&self, dim: usize, index: usize) -> Result<Self, TensorError> {
        self.check_index(dim, index)?;
        let mut view = self.clone();
        view.offset += index * view.strides[dim];
        view.shape.remove(dim);
        view.strides.remove(dim);
        Ok(view)
    }

    /// View of `length` entries of `dim` starting at `start`.
    pub fn narrow(&self, dim: usize, start: usize, length: usize) -> Result<Self, TensorError> {
        let size = self.check_dim(dim)?;
        if start + length > size {
            return Err(TensorError::IndexOutOfRange {
                dim,
                index: start + length,
                size,
            });
        }
        let mut view = self.clone();
        view.offset += start * view.strides[dim];
        view.shape[dim] = length;
        Ok(view)
    }

    pub fn transpose(&self, first: usize, second: usize) -> Result<Self, TensorError> {
        self.check_dim(first)?;
        self.check_dim(second)?;
        let mut view = self.clone();
        view.shape.swap(first, second);
        view.strides.swap(first, second);
        Ok(view)
    }

    /// View with a new shape over the same elements. Contiguous only.
    pub fn reshape(&self, shape: Vec<usize>) -> Result<Self, TensorError> {
        if !self.is_contiguous() {
            return Err(TensorError::NotContiguous);
        }
        let expected = element_count(&shape)?;
        if expected != self.num_elements() {
            return Err(TensorError::ElementCount {
                expected: self.num_elements(),
                actual: expected,
            });
        }
        Ok(Self {
            storage: self.storage.clone(),
            strides: row_major_strides(&shape),
            shape,
            offset: self.offset,
        })
    }

    pub fn clone_contiguous(&self) -> Self {
        Self::with_storage(self.to_vec(), self.shape.clone())
    }

    pub fn fill(&self, value: E) -> Result<(), TensorError> {
        let mut data = self
            .storage
            .try_borrow_mut()
            .map_err(|_| TensorError::StorageBusy)?;
        self.for_each_offset(|offset| data[offset] = value);
        Ok(())
    }

    /// Overwrite every element with `values` taken in row-major order.
    pub fn assign(&self, values: &[E]) -> Result<(), TensorError> {
        if values.len() != self.num_elements() {
            return Err(TensorError::ElementCount {
                expected: self.num_elements(),
                actual: values.len(),
            });
        }
        let mut data = self
            .storage
            .try_borrow_mut()
            .map_err(|_| TensorError::StorageBusy)?;
        let mut source = values.iter();
        self.for_each_offset(|offset| {
            if let Some(value) = source.next() {
                data[offset] = *value;
            }
        });
        Ok(())
    }

    fn check_dim(&self, dim: usize) -> Result<usize, TensorError> {
        self.shape
            .get(dim)
            .copied()
            .ok_or(TensorError::DimOutOfRange {
                dim,
                dims: self.shape.len(),
            })
    }

    fn check_index(&self, dim: usize, index: usize) -> Result<usize, TensorError> {
        let size = self.check_dim(dim)?;
        if index >= size {
            return Err(TensorError::IndexOutOfRange { dim, index, size });
        }
        Ok(size)
    }

    fn for_each_offset(&self, mut f: impl FnMut(usize)) {
        if self.shape.iter().any(|&size| size == 0) {
            return;
        }
        let mut index = vec![0; self.shape.len()];
        loop {
            let offset = self.offset
                + index
                    .iter()
                    .zip(&self.strides)
                    .map(|(position, stride)| position * stride)
                    .sum::<usize>();
            f(offset);

            let mut dim = self.shape.len();
            loop {
                if dim == 0 {
                    return;
                }
                dim -= 1;
                index[dim] += 1;
                if index[dim] < self.shape[dim] {
                    break;
                }
                index[dim] = 0;
            }
        }
    }
}

impl<E: Element> fmt::Debug for Tensor<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(E::CLASS_NAME)
            .field("shape", &self.shape)
            .field("values", &self.to_vec())
            .finish()
    }
}

/// Number of elements in `shape`. The product of the non-zero sizes must
/// fit in `usize` as well, since it bounds every row-major stride.
fn element_count(shape: &[usize]) -> Result<usize, TensorError> {
    let too_large = || TensorError::TooLarge {
        shape: shape.to_vec(),
    };
    let nonzero = shape
        .iter()
        .filter(|&&size| size != 0)
        .try_fold(1usize, |count, &size| count.checked_mul(size))
        .ok_or_else(too_large)?;
    if shape.contains(&0) {
        Ok(0)
    } else {
        Ok(nonzero)
    }
}

fn row_major_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for dim in (0..shape.len().saturating_sub(1)).rev() {
        strides[dim] = strides[dim + 1] * shape[dim + 1];
    }
    strides
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matrix() -> Tensor<f64> {
        Tensor::from_vec(vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).expect("matrix")
    }

    #[test]
    fn from_vec_checks_element_count() {
        assert_eq!(
            Tensor::<u8>::from_vec(vec![2, 2], vec![1, 2, 3]).err(),
            Some(TensorError::ElementCount {
                expected: 4,
                actual: 3
            })
        );
    }

    #[test]
    fn select_and_narrow_share_storage() {
        let tensor = matrix();
        let row = tensor.select(0, 1).expect("row");
        assert_eq!(row.shape(), &[3]);
        assert_eq!(row.to_vec(), vec![4.0, 5.0, 6.0]);
        assert!(row.is_contiguous());

        let column = tensor.select(1, 2).expect("column");
        assert_eq!(column.to_vec(), vec![3.0, 6.0]);
        assert!(!column.is_contiguous());
        assert!(column.contiguous_data().is_none());

        column.fill(0.0).expect("fill");
        assert_eq!(tensor.to_vec(), vec![1.0, 2.0, 0.0, 4.0, 5.0, 0.0]);

        let middle = tensor.narrow(1, 1, 1).expect("narrow");
        assert_eq!(middle.shape(), &[2, 1]);
        assert_eq!(middle.to_vec(), vec![2.0, 5.0]);
    }

    #[test]
    fn transpose_swaps_strides() {
        let transposed = matrix().transpose(0, 1).expect("transpose");
        assert_eq!(transposed.shape(), &[3, 2]);
        assert_eq!(transposed.to_vec(), vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
        assert!(!transposed.is_contiguous());
        assert_eq!(transposed.get(&[2, 1]), Ok(6.0));

        let copy = transposed.clone_contiguous();
        assert!(copy.is_contiguous());
        assert_eq!(copy.contiguous_data().expect("data").to_vec(), transposed.to_vec());
    }

    #[test]
    fn reshape_requires_contiguity_and_matching_count() {
        let tensor = matrix();
        let flat = tensor.reshape(vec![6]).expect("reshape");
        assert_eq!(flat.contiguous_data().expect("data").len(), 6);
        assert_eq!(
            tensor.reshape(vec![4]).err(),
            Some(TensorError::ElementCount {
                expected: 6,
                actual: 4
            })
        );
        let transposed = tensor.transpose(0, 1).expect("transpose");
        assert_eq!(transposed.reshape(vec![6]).err(), Some(TensorError::NotContiguous));
    }

    #[test]
    fn oversized_shapes_are_errors() {
        let shape = vec![usize::MAX / 2, 3];
        assert_eq!(
            Tensor::<u8>::zeros(shape.clone()).err(),
            Some(TensorError::TooLarge { shape })
        );
        assert!(Tensor::<u8>::zeros(vec![0, usize::MAX, 2]).is_err());
        assert_eq!(
            matrix().reshape(vec![usize::MAX, 2, 3]).err(),
            Some(TensorError::TooLarge {
                shape: vec![usize::MAX, 2, 3]
            })
        );
        let empty = Tensor::<f64>::zeros(vec![0, 4]).expect("empty");
        assert_eq!(empty.num_elements(), 0);
    }

    #[test]
    fn out_of_range_arguments_are_errors() {
        let tensor = matrix();
        assert_eq!(
            tensor.select(2, 0).err(),
            Some(TensorError::DimOutOfRange { dim: 2, dims: 2 })
        );
        assert_eq!(
            tensor.select(0, 2).err(),
            Some(TensorError::IndexOutOfRange {
                dim: 0,
                index: 2,
                size: 2
            })
        );
        assert!(tensor.narrow(1, 2, 2).is_err());
    }

    #[test]
    fn assign_writes_in_row_major_order() {
        let tensor = Tensor::<u8>::zeros(vec![2, 2]).expect("zeros");
        let transposed = tensor.transpose(0, 1).expect("transpose");
        transposed.assign(&[1, 2, 3, 4]).expect("assign");
        assert_eq!(tensor.to_vec(), vec![1, 3, 2, 4]);
        assert!(transposed.assign(&[1]).is_err());
    }

    #[test]
    fn byte_elements_reject_unrepresentable_numbers() {
        assert_eq!(u8::from_number(255.0), Some(255));
        assert_eq!(u8::from_number(256.0), None);
        assert_eq!(u8::from_number(1.5), None);
        assert_eq!(u8::from_number(-1.0), None);
    }
}
