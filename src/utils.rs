/// Utility functions for embed-sim
use candle_core::{Result, Tensor};

use crate::layers::Layer;

/// Calculate the number of parameters in a tensor
pub fn count_parameters(tensor: &Tensor) -> usize {
    tensor.dims().iter().product()
}

/// Total number of parameters held by a layer
pub fn count_layer_parameters(layer: &dyn Layer) -> usize {
    layer.weights().iter().map(|w| count_parameters(w.tensor())).sum()
}

/// Mask that is 1 wherever `ids` differs from `pad_id`
pub fn padding_mask(ids: &Tensor, pad_id: u32) -> Result<Tensor> {
    ids.ne(pad_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_count_parameters() -> Result<()> {
        let device = Device::Cpu;
        let t = Tensor::zeros((4, 3, 2), DType::F32, &device)?;
        assert_eq!(count_parameters(&t), 24);
        Ok(())
    }

    #[test]
    fn test_padding_mask_i64_ids() -> Result<()> {
        let device = Device::Cpu;
        let ids = Tensor::new(&[2i64, 1, 2, 0], &device)?;
        let mask = padding_mask(&ids, 2)?;
        assert_eq!(mask.dtype(), DType::U8);
        assert_eq!(mask.to_vec1::<u8>()?, vec![0, 1, 0, 1]);
        Ok(())
    }
}
