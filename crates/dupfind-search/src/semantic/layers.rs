//! Inference-only building blocks of the duplicate model.

use dupfind_core::vocab::PAD_TOKEN;
use dupfind_core::{Result, RetrievalError};

/// Element-wise activation applied after a dense layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Linear,
    Relu,
}

/// Fully connected layer. `weight` is row-major `[input_dim, output_dim]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Dense {
    weight: Vec<f32>,
    bias: Vec<f32>,
    input_dim: usize,
    output_dim: usize,
    activation: Activation,
}

impl Dense {
    /// # Errors
    ///
    /// Returns [`RetrievalError::Model`] if `output_dim` is zero or the weight
    /// or bias length does not match the layer shape.
    pub fn new(
        weight: Vec<f32>,
        bias: Vec<f32>,
        input_dim: usize,
        output_dim: usize,
        activation: Activation,
    ) -> Result<Self> {
        if output_dim == 0 {
            return Err(RetrievalError::Model(format!(
                "dense layer over {input_dim} inputs has no outputs"
            )));
        }
        if weight.len() != input_dim * output_dim {
            return Err(RetrievalError::Model(format!(
                "dense weight has {} values, expected {input_dim}x{output_dim}",
                weight.len()
            )));
        }
        if bias.len() != output_dim {
            return Err(RetrievalError::Model(format!(
                "dense bias has {} values, expected {output_dim}",
                bias.len()
            )));
        }
        Ok(Self {
            weight,
            bias,
            input_dim,
            output_dim,
            activation,
        })
    }

    #[must_use]
    pub const fn input_dim(&self) -> usize {
        self.input_dim
    }

    #[must_use]
    pub const fn output_dim(&self) -> usize {
        self.output_dim
    }

    #[must_use]
    pub fn weight(&self) -> &[f32] {
        &self.weight
    }

    #[must_use]
    pub fn bias(&self) -> &[f32] {
        &self.bias
    }

    /// # Errors
    ///
    /// Returns [`RetrievalError::Model`] if `input` is not `input_dim` long.
    pub fn forward(&self, input: &[f32]) -> Result<Vec<f32>> {
        if input.len() != self.input_dim {
            return Err(RetrievalError::Model(format!(
                "dense input has {} values, expected {}",
                input.len(),
                self.input_dim
            )));
        }

        let mut out = self.bias.clone();
        for (x, row) in input.iter().zip(self.weight.chunks_exact(self.output_dim)) {
            for (acc, w) in out.iter_mut().zip(row) {
                *acc += x * w;
            }
        }
        if self.activation == Activation::Relu {
            for value in &mut out {
                *value = value.max(0.0);
            }
        }
        Ok(out)
    }
}

/// Token encoder: the mean of the embedding rows of all non-padding tokens.
///
/// Tokens outside the table are skipped like padding. A sequence with no
/// usable token encodes to the zero vector.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingBag {
    table: Vec<f32>,
    vocab_size: usize,
    dim: usize,
}

impl EmbeddingBag {
    /// # Errors
    ///
    /// Returns [`RetrievalError::Model`] if `table` is not `vocab_size x dim`
    /// or `dim` is zero.
    pub fn new(table: Vec<f32>, vocab_size: usize, dim: usize) -> Result<Self> {
        if dim == 0 || table.len() != vocab_size * dim {
            return Err(RetrievalError::Model(format!(
                "embedding table has {} values, expected {vocab_size}x{dim}",
                table.len()
            )));
        }
        Ok(Self {
            table,
            vocab_size,
            dim,
        })
    }

    #[must_use]
    pub const fn dim(&self) -> usize {
        self.dim
    }

    #[must_use]
    pub const fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    #[must_use]
    pub fn table(&self) -> &[f32] {
        &self.table
    }

    #[must_use]
    pub fn encode(&self, tokens: &[u32]) -> Vec<f32> {
        let mut out = vec![0.0_f32; self.dim];
        let mut used = 0_usize;
        for &token in tokens {
            let Ok(row) = usize::try_from(token) else {
                continue;
            };
            if token == PAD_TOKEN || row >= self.vocab_size {
                continue;
            }
            let start = row * self.dim;
            for (acc, value) in out.iter_mut().zip(&self.table[start..start + self.dim]) {
                *acc += value;
            }
            used += 1;
        }
        if used > 1 {
            let scale = 1.0 / used as f32;
            for value in &mut out {
                *value *= scale;
            }
        }
        out
    }
}

/// Scale `vector` to unit Euclidean length in place. Zero vectors are left alone.
pub fn l2_normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for value in vector {
            *value /= norm;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: &[f32], b: &[f32]) -> bool {
        a.len() == b.len() && a.iter().zip(b).all(|(x, y)| (x - y).abs() < 1e-6)
    }

    #[test]
    fn dense_applies_weight_bias_and_relu() {
        // 2 inputs -> 2 outputs
        let layer = Dense::new(
            vec![1.0, -1.0, 2.0, -2.0],
            vec![0.5, 0.0],
            2,
            2,
            Activation::Relu,
        )
        .expect("valid layer");

        let out = layer.forward(&[1.0, 1.0]).expect("forward");
        assert!(close(&out, &[3.5, 0.0]), "got {out:?}");
    }

    #[test]
    fn dense_linear_keeps_negative_outputs() {
        let layer = Dense::new(vec![-1.0], vec![0.0], 1, 1, Activation::Linear).expect("layer");
        assert!(close(&layer.forward(&[2.0]).expect("forward"), &[-2.0]));
    }

    #[test]
    fn dense_rejects_bad_shapes() {
        assert!(Dense::new(vec![1.0; 3], vec![0.0; 2], 2, 2, Activation::Linear).is_err());
        assert!(Dense::new(vec![1.0; 4], vec![0.0; 3], 2, 2, Activation::Linear).is_err());

        let layer = Dense::new(vec![1.0; 4], vec![0.0; 2], 2, 2, Activation::Linear).expect("layer");
        assert!(layer.forward(&[1.0]).is_err());
    }

    #[test]
    fn dense_without_outputs_is_rejected() {
        let err = Dense::new(Vec::new(), Vec::new(), 3, 0, Activation::Relu).unwrap_err();
        assert!(matches!(err, RetrievalError::Model(_)));
        assert!(err.to_string().contains("no outputs"), "got: {err}");
    }

    #[test]
    fn embedding_bag_averages_non_padding_rows() {
        // row 0 is padding, rows 1 and 2 are real tokens
        let bag = EmbeddingBag::new(vec![9.0, 9.0, 1.0, 0.0, 0.0, 3.0], 3, 2).expect("bag");

        assert!(close(&bag.encode(&[1, 2, 0, 0]), &[0.5, 1.5]));
        assert!(close(&bag.encode(&[2]), &[0.0, 3.0]));
        assert!(close(&bag.encode(&[0, 0]), &[0.0, 0.0]));
        assert!(close(&bag.encode(&[7]), &[0.0, 0.0]));
    }

    #[test]
    fn l2_normalize_yields_unit_length() {
        let mut v = vec![3.0, 4.0];
        l2_normalize(&mut v);
        assert!(close(&v, &[0.6, 0.8]));

        let mut zero = vec![0.0, 0.0];
        l2_normalize(&mut zero);
        assert!(close(&zero, &[0.0, 0.0]));
    }
}
