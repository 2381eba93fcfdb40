//! Tensor bridge: moves host-side [`PropertyBatch`] buffers onto a burn device.

use burn::prelude::*;
use burn::tensor::TensorData;
use properties::PropertyBatch;

/// Device tensors for one batch. Masks are float 0/1.
#[derive(Debug, Clone)]
pub struct BatchTensors<B: Backend> {
    /// `(variants, samples, properties)`
    pub properties: Tensor<B, 3>,
    /// `(variants,)`
    pub variant_weights: Tensor<B, 1>,
    /// `(variants, samples)`
    pub scaled_target: Tensor<B, 2>,
    pub is_good: Tensor<B, 2>,
    pub is_bad: Tensor<B, 2>,
}

impl<B: Backend> BatchTensors<B> {
    pub fn from_batch(batch: &PropertyBatch, device: &B::Device) -> Self {
        let v = batch.num_variants();
        let s = batch.num_samples;
        let p = batch.num_properties;
        Self {
            properties: Tensor::from_data(
                TensorData::new(batch.batch_tensor.clone(), [v, s, p]),
                device,
            ),
            variant_weights: Tensor::from_data(
                TensorData::new(batch.variant_weights.clone(), [v]),
                device,
            ),
            scaled_target: Tensor::from_data(
                TensorData::new(batch.scaled_target.clone(), [v, s]),
                device,
            ),
            is_good: mask_to_tensor(&batch.genotype_is_good, [v, s], device),
            is_bad: mask_to_tensor(&batch.genotype_is_bad, [v, s], device),
        }
    }
}

fn mask_to_tensor<B: Backend>(mask: &[bool], shape: [usize; 2], device: &B::Device) -> Tensor<B, 2> {
    let values: Vec<f32> = mask.iter().map(|&m| if m { 1.0 } else { 0.0 }).collect();
    Tensor::from_data(TensorData::new(values, shape), device)
}

/// Extract a single f64 scalar from a one-element tensor.
pub fn tensor_to_f64<B: Backend>(tensor: Tensor<B, 1>) -> f64 {
    tensor.into_scalar().elem::<f64>()
}
