//! uint8 quantization of stored embeddings.

use ndarray::Array1;

/// An embedding stored as one byte per dimension.
///
/// Maps [min, max] → [0, 255] linearly; original ≈ byte * scale + offset.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedVector {
    pub bytes: Vec<u8>,
    pub scale: f32,
    pub offset: f32,
}

impl QuantizedVector {
    pub fn quantize(values: &[f32]) -> Self {
        let min_val = values.iter().copied().fold(f32::INFINITY, f32::min);
        let max_val = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);

        let range = max_val - min_val;
        if !range.is_finite() || range < 1e-9 {
            return Self {
                bytes: vec![0u8; values.len()],
                scale: 0.0,
                offset: if min_val.is_finite() { min_val } else { 0.0 },
            };
        }

        let scale = range / 255.0;
        let bytes = values
            .iter()
            .map(|&v| ((v - min_val) / scale).round().clamp(0.0, 255.0) as u8)
            .collect();

        Self {
            bytes,
            scale,
            offset: min_val,
        }
    }

    pub fn dequantize(&self) -> Array1<f32> {
        Array1::from_iter(self.bytes.iter().map(|&b| b as f32 * self.scale + self.offset))
    }

    pub fn dim(&self) -> usize {
        self.bytes.len()
    }
}
