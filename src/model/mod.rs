mod errors;
mod traits;

pub use errors::ModelError;
pub use traits::Model;

/// Deterministic single-output linear model, `y = w·x + b`. The flat
/// parameter vector is `w` followed by `b`.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearModel {
    weights: Vec<f32>,
    bias: f32,
}

impl LinearModel {
    pub fn zeros(inputs: usize) -> Self {
        Self {
            weights: vec![0.0; inputs],
            bias: 0.0,
        }
    }

    fn forward(&self, obs: &[f32]) -> Result<f32, ModelError> {
        if obs.len() != self.weights.len() {
            return Err(ModelError::InputLength {
                expected: self.weights.len(),
                got: obs.len(),
            });
        }
        Ok(self.weights.iter().zip(obs).map(|(w, x)| w * x).sum::<f32>() + self.bias)
    }
}

impl Model for LinearModel {
    fn get_output(&self, obs: &[Vec<f32>]) -> Result<Vec<Vec<f32>>, ModelError> {
        obs.iter().map(|o| Ok(vec![self.forward(o)?])).collect()
    }

    fn get_action(&mut self, obs: &[f32]) -> Result<(Vec<f32>, f32), ModelError> {
        Ok((vec![self.forward(obs)?], 0.0))
    }

    fn get_trainable_flat(&self) -> Vec<f32> {
        let mut flat = self.weights.clone();
        flat.push(self.bias);
        flat
    }

    fn set_trainable_flat(&mut self, params: &[f32]) -> Result<(), ModelError> {
        let expected = self.weights.len() + 1;
        if params.len() != expected {
            return Err(ModelError::ParamLength {
                expected,
                got: params.len(),
            });
        }
        let (weights, bias) = params.split_at(self.weights.len());
        self.weights.copy_from_slice(weights);
        self.bias = bias[0];
        Ok(())
    }
}
