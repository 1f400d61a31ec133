use std::fmt;
use std::path::Path;

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use ndarray::{ArrayD, IxDyn};

/// Tensor statistics for debugging and validation
#[derive(Debug, Clone, serde::Serialize)]
pub struct TensorStats {
    pub shape: Vec<usize>,
    pub min: f32,
    pub max: f32,
    pub mean: f32,
    pub sum: f32,
}

impl TensorStats {
    /// Compute statistics for a tensor
    pub fn from_tensor(tensor: &Tensor) -> candle_core::Result<Self> {
        let shape = tensor.dims().to_vec();
        let data: Vec<f32> = tensor.flatten_all()?.to_dtype(DType::F32)?.to_vec1()?;

        let min = data.iter().cloned().fold(f32::INFINITY, f32::min);
        let max = data.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let sum: f32 = data.iter().sum();
        let mean = sum / data.len().max(1) as f32;

        Ok(Self {
            shape,
            min,
            max,
            mean,
            sum,
        })
    }

    /// Log the statistics of `tensor` under `name` at debug level
    pub fn log(name: &str, tensor: &Tensor) -> candle_core::Result<Self> {
        let stats = Self::from_tensor(tensor)?;
        tracing::debug!(%name, %stats, "tensor stats");
        Ok(stats)
    }
}

impl fmt::Display for TensorStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} min={:.4} max={:.4} mean={:.4} sum={:.4}",
            self.shape, self.min, self.max, self.mean, self.sum
        )
    }
}

/// Write a tensor as an f32 `.npy` array
pub fn write_npy<P: AsRef<Path>>(path: P, tensor: &Tensor) -> Result<()> {
    let data: Vec<f32> = tensor.flatten_all()?.to_dtype(DType::F32)?.to_vec1()?;
    let array = ArrayD::from_shape_vec(IxDyn(tensor.dims()), data)?;
    ndarray_npy::write_npy(path.as_ref(), &array)?;
    Ok(())
}

/// Read an f32 `.npy` array into a tensor on `device`
pub fn read_npy<P: AsRef<Path>>(path: P, device: &Device) -> Result<Tensor> {
    let array: ArrayD<f32> = ndarray_npy::read_npy(path.as_ref())?;
    let shape = array.shape().to_vec();
    let data: Vec<f32> = array.iter().copied().collect();
    Ok(Tensor::from_vec(data, shape, device)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats() {
        let tensor = Tensor::new(&[[1f32, -2.], [3., 6.]], &Device::Cpu).unwrap();
        let stats = TensorStats::from_tensor(&tensor).unwrap();
        assert_eq!(stats.shape, vec![2, 2]);
        assert_eq!(stats.min, -2.0);
        assert_eq!(stats.max, 6.0);
        assert_eq!(stats.sum, 8.0);
        assert_eq!(stats.mean, 2.0);
    }

    #[test]
    fn test_npy_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mask.npy");
        let mask = Tensor::new(&[[1u8, 0, 1]], &Device::Cpu).unwrap();

        write_npy(&path, &mask).unwrap();
        let loaded = read_npy(&path, &Device::Cpu).unwrap();
        assert_eq!(loaded.dims(), &[1, 3]);
        assert_eq!(loaded.to_vec2::<f32>().unwrap(), vec![vec![1.0, 0.0, 1.0]]);
    }

    #[test]
    fn test_read_missing_file() {
        assert!(read_npy("/nonexistent/bev.npy", &Device::Cpu).is_err());
    }
}
