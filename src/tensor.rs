//! Tensor descriptors exchanged with the model executor
//!
//! A [`TensorDescriptor`] bundles a storage-location tag, an element-type
//! tag, an ordered shape, and the owned data buffer. The driver owns every
//! descriptor created for a call; the model executor only reads input
//! descriptors and writes into output descriptors it does not own.
//!
//! Unlike a general tensor library, zero-sized shapes are legal here: the
//! unconditional-generation case substitutes sentinel empty input buffers.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{RepartirError, Result};

/// Where a buffer lives
///
/// In this core the tag records the contract with the executor; the
/// reporting rank performs an explicit device-to-host copy before any
/// host-visible read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Storage {
    /// Host-resident memory
    Host,
    /// Device-resident memory
    Device,
}

/// Element type of a descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DType {
    /// 32-bit signed integers (token ids, lengths, beam indices)
    I32,
    /// 32-bit floats (log probabilities)
    F32,
}

/// Owned backing buffer of a descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TensorData {
    /// Integer payload
    I32(Vec<i32>),
    /// Float payload
    F32(Vec<f32>),
}

/// Shaped, typed, storage-tagged buffer framing one inference call
///
/// # Examples
///
/// ```
/// use repartir::tensor::{DType, Storage, TensorDescriptor};
///
/// let ids = TensorDescriptor::from_i32(Storage::Device, vec![2, 3], vec![1, 2, 3, 4, 5, 6])
///     .unwrap();
/// assert_eq!(ids.shape(), &[2, 3]);
/// assert_eq!(ids.dtype(), DType::I32);
/// assert_eq!(ids.element_count(), 6);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorDescriptor {
    storage: Storage,
    dtype: DType,
    shape: Vec<usize>,
    data: TensorData,
}

impl TensorDescriptor {
    /// Create an integer descriptor from a shape and flat row-major data
    ///
    /// # Errors
    ///
    /// Returns `InvalidShape` if the shape is empty or the data length does
    /// not equal the shape product.
    pub fn from_i32(storage: Storage, shape: Vec<usize>, data: Vec<i32>) -> Result<Self> {
        Self::check_shape(&shape, data.len())?;
        Ok(Self {
            storage,
            dtype: DType::I32,
            shape,
            data: TensorData::I32(data),
        })
    }

    /// Create a float descriptor from a shape and flat row-major data
    ///
    /// # Errors
    ///
    /// Returns `InvalidShape` if the shape is empty or the data length does
    /// not equal the shape product.
    pub fn from_f32(storage: Storage, shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        Self::check_shape(&shape, data.len())?;
        Ok(Self {
            storage,
            dtype: DType::F32,
            shape,
            data: TensorData::F32(data),
        })
    }

    /// Create a zero-filled integer descriptor
    ///
    /// # Errors
    ///
    /// Returns `InvalidShape` if the shape is empty.
    pub fn zeros_i32(storage: Storage, shape: Vec<usize>) -> Result<Self> {
        let count = shape.iter().product();
        Self::from_i32(storage, shape, vec![0; count])
    }

    /// Create a zero-filled float descriptor
    ///
    /// # Errors
    ///
    /// Returns `InvalidShape` if the shape is empty.
    pub fn zeros_f32(storage: Storage, shape: Vec<usize>) -> Result<Self> {
        let count = shape.iter().product();
        Self::from_f32(storage, shape, vec![0.0; count])
    }

    fn check_shape(shape: &[usize], data_len: usize) -> Result<()> {
        if shape.is_empty() {
            return Err(RepartirError::InvalidShape {
                reason: "shape cannot be empty".to_string(),
            });
        }
        let expected: usize = shape.iter().product();
        if data_len != expected {
            return Err(RepartirError::InvalidShape {
                reason: format!(
                    "data length ({data_len}) does not match shape {shape:?} (expected {expected})"
                ),
            });
        }
        Ok(())
    }

    /// Storage-location tag
    #[must_use]
    pub fn storage(&self) -> Storage {
        self.storage
    }

    /// Element-type tag
    #[must_use]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Ordered shape, outer dimension first
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Total number of elements
    #[must_use]
    pub fn element_count(&self) -> usize {
        match &self.data {
            TensorData::I32(v) => v.len(),
            TensorData::F32(v) => v.len(),
        }
    }

    /// Integer view of the data, if this is an I32 descriptor
    #[must_use]
    pub fn as_i32(&self) -> Option<&[i32]> {
        match &self.data {
            TensorData::I32(v) => Some(v),
            TensorData::F32(_) => None,
        }
    }

    /// Mutable integer view, if this is an I32 descriptor
    #[must_use]
    pub fn as_i32_mut(&mut self) -> Option<&mut [i32]> {
        match &mut self.data {
            TensorData::I32(v) => Some(v),
            TensorData::F32(_) => None,
        }
    }

    /// Float view of the data, if this is an F32 descriptor
    #[must_use]
    pub fn as_f32(&self) -> Option<&[f32]> {
        match &self.data {
            TensorData::F32(v) => Some(v),
            TensorData::I32(_) => None,
        }
    }

    /// Mutable float view, if this is an F32 descriptor
    #[must_use]
    pub fn as_f32_mut(&mut self) -> Option<&mut [f32]> {
        match &mut self.data {
            TensorData::F32(v) => Some(v),
            TensorData::I32(_) => None,
        }
    }

    /// Copy an integer buffer out to host memory
    ///
    /// Models the explicit device-to-host copy performed by the reporting
    /// rank before any host-visible read.
    ///
    /// # Errors
    ///
    /// Returns `InvalidShape` if this is not an I32 descriptor.
    pub fn to_host_i32(&self) -> Result<Vec<i32>> {
        self.as_i32()
            .map(<[i32]>::to_vec)
            .ok_or_else(|| RepartirError::InvalidShape {
                reason: format!("expected I32 data, found {:?}", self.dtype),
            })
    }
}

impl fmt::Display for TensorDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TensorDescriptor(storage={:?}, dtype={:?}, shape={:?})",
            self.storage, self.dtype, self.shape
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_i32_descriptor() {
        let t = TensorDescriptor::from_i32(Storage::Device, vec![2, 3], vec![1, 2, 3, 4, 5, 6])
            .unwrap();
        assert_eq!(t.shape(), &[2, 3]);
        assert_eq!(t.dtype(), DType::I32);
        assert_eq!(t.storage(), Storage::Device);
        assert_eq!(t.element_count(), 6);
        assert_eq!(t.as_i32().unwrap(), &[1, 2, 3, 4, 5, 6]);
        assert!(t.as_f32().is_none());
    }

    #[test]
    fn test_zero_sized_shape_is_legal() {
        // Sentinel empty input buffer for unconditional generation
        let t = TensorDescriptor::from_i32(Storage::Device, vec![4, 0], vec![]).unwrap();
        assert_eq!(t.element_count(), 0);
        assert_eq!(t.shape(), &[4, 0]);
    }

    #[test]
    fn test_empty_shape_fails() {
        let result = TensorDescriptor::from_i32(Storage::Host, vec![], vec![1]);
        assert!(matches!(
            result.unwrap_err(),
            RepartirError::InvalidShape { .. }
        ));
    }

    #[test]
    fn test_data_shape_mismatch_fails() {
        let result = TensorDescriptor::from_i32(Storage::Host, vec![2, 2], vec![1, 2, 3]);
        assert!(result.is_err());
    }

    #[test]
    fn test_zeros_constructors() {
        let ids = TensorDescriptor::zeros_i32(Storage::Device, vec![2, 2, 4]).unwrap();
        assert_eq!(ids.element_count(), 16);
        assert!(ids.as_i32().unwrap().iter().all(|&v| v == 0));

        let probs = TensorDescriptor::zeros_f32(Storage::Device, vec![3, 2]).unwrap();
        assert_eq!(probs.dtype(), DType::F32);
        assert_eq!(probs.as_f32().unwrap().len(), 6);
    }

    #[test]
    fn test_mutable_views() {
        let mut t = TensorDescriptor::zeros_i32(Storage::Device, vec![4]).unwrap();
        t.as_i32_mut().unwrap()[2] = 7;
        assert_eq!(t.as_i32().unwrap(), &[0, 0, 7, 0]);
        assert!(t.as_f32_mut().is_none());
    }

    #[test]
    fn test_to_host_copy() {
        let t = TensorDescriptor::from_i32(Storage::Device, vec![3], vec![9, 8, 7]).unwrap();
        let host = t.to_host_i32().unwrap();
        assert_eq!(host, vec![9, 8, 7]);

        let f = TensorDescriptor::zeros_f32(Storage::Device, vec![1]).unwrap();
        assert!(f.to_host_i32().is_err());
    }

    #[test]
    fn test_display() {
        let t = TensorDescriptor::zeros_i32(Storage::Host, vec![1]).unwrap();
        let s = format!("{t}");
        assert!(s.contains("Host"));
        assert!(s.contains("I32"));
    }
}
