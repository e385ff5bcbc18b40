use std::collections::HashMap;

use candle_core::{backprop::GradStore, DType, Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::{config, error::to_runtime_error, TrainingError};

const EPS: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdamWConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
}

impl From<&config::OptimizerConfig> for AdamWConfig {
    fn from(value: &config::OptimizerConfig) -> Self {
        Self {
            learning_rate: value.learning_rate,
            beta1: value.beta1,
            beta2: value.beta2,
            epsilon: value.epsilon,
            weight_decay: value.weight_decay,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrainerOptimizerOptions {
    pub clip_global_norm: Option<f64>,
    /// Parameter-name fragments exempt from weight decay.
    pub weight_decay_exclude: Vec<String>,
}

impl Default for TrainerOptimizerOptions {
    fn default() -> Self {
        Self {
            clip_global_norm: None,
            weight_decay_exclude: vec!["bias".to_string(), ".bn".to_string()],
        }
    }
}

impl From<&config::OptimizerConfig> for TrainerOptimizerOptions {
    fn from(value: &config::OptimizerConfig) -> Self {
        Self {
            clip_global_norm: value.max_grad_norm,
            ..Self::default()
        }
    }
}

/// AdamW over a fixed, named set of `f32` variables.
#[derive(Debug)]
pub struct TrainerOptimizer {
    config: AdamWConfig,
    params: Vec<ParameterSlot>,
    step: usize,
    clip_global_norm: Option<f64>,
}

#[derive(Debug)]
struct ParameterSlot {
    name: String,
    param: Var,
    first_moment: Tensor,
    second_moment: Tensor,
    apply_weight_decay: bool,
}

/// What one optimizer step did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepStats {
    /// Global gradient norm before clipping.
    pub grad_norm: f64,
    pub clipped: bool,
    pub updated_parameters: usize,
}

impl TrainerOptimizer {
    pub fn new(
        named_parameters: Vec<(String, Var)>,
        config: AdamWConfig,
        options: TrainerOptimizerOptions,
    ) -> Result<Self, TrainingError> {
        if named_parameters.is_empty() {
            return Err(TrainingError::initialization(
                "optimizer requires at least one parameter",
            ));
        }

        let mut params = Vec::with_capacity(named_parameters.len());
        for (name, var) in named_parameters {
            let tensor = var.as_tensor();
            if tensor.dtype() != DType::F32 {
                return Err(TrainingError::initialization(format!(
                    "optimizer expects f32 parameters, '{}' is {:?}",
                    name,
                    tensor.dtype()
                )));
            }
            let first_moment = tensor.zeros_like().map_err(to_runtime_error)?;
            let second_moment = tensor.zeros_like().map_err(to_runtime_error)?;
            let apply_weight_decay =
                should_apply_weight_decay(&name, &options.weight_decay_exclude);

            params.push(ParameterSlot {
                name,
                param: var,
                first_moment,
                second_moment,
                apply_weight_decay,
            });
        }

        Ok(Self {
            config,
            params,
            step: 0,
            clip_global_norm: options.clip_global_norm,
        })
    }

    pub fn learning_rate(&self) -> f64 {
        self.config.learning_rate
    }

    pub fn steps_taken(&self) -> usize {
        self.step
    }

    /// Applies one AdamW update from `grads`. Parameters without a gradient
    /// are left untouched.
    pub fn step(&mut self, grads: &mut GradStore) -> Result<StepStats, TrainingError> {
        let mut processed = Vec::new();
        for (index, slot) in self.params.iter().enumerate() {
            if let Some(grad) = grads.remove(slot.param.as_tensor()) {
                let norm = tensor_l2_norm(&grad)?;
                processed.push(ProcessedGradient { index, grad, norm });
            }
        }

        let grad_norm = processed
            .iter()
            .map(|g| g.norm * g.norm)
            .sum::<f64>()
            .sqrt();
        if processed.is_empty() {
            return Ok(StepStats {
                grad_norm,
                clipped: false,
                updated_parameters: 0,
            });
        }

        let mut clipped = false;
        if let Some(max_norm) = self.clip_global_norm {
            if grad_norm > max_norm {
                let scale = max_norm / (grad_norm + EPS);
                for item in &mut processed {
                    item.grad = item.grad.affine(scale, 0.0).map_err(to_runtime_error)?;
                }
                clipped = true;
            }
        }

        self.step += 1;
        let updated_parameters = processed.len();
        self.apply_adamw(processed)?;

        Ok(StepStats {
            grad_norm,
            clipped,
            updated_parameters,
        })
    }

    fn apply_adamw(&mut self, processed: Vec<ProcessedGradient>) -> Result<(), TrainingError> {
        let cfg = self.config;
        let bias_correction1 = 1.0 - cfg.beta1.powi(self.step as i32);
        let bias_correction2 = 1.0 - cfg.beta2.powi(self.step as i32);
        let scale_m = if bias_correction1.abs() < EPS {
            1.0
        } else {
            1.0 / bias_correction1
        };
        let scale_v = if bias_correction2.abs() < EPS {
            1.0
        } else {
            1.0 / bias_correction2
        };

        for item in processed {
            let slot = &mut self.params[item.index];

            let new_m = (slot
                .first_moment
                .affine(cfg.beta1, 0.0)
                .map_err(to_runtime_error)?
                + item.grad.affine(1.0 - cfg.beta1, 0.0).map_err(to_runtime_error)?)
            .map_err(to_runtime_error)?;
            let new_v = (slot
                .second_moment
                .affine(cfg.beta2, 0.0)
                .map_err(to_runtime_error)?
                + item
                    .grad
                    .sqr()
                    .and_then(|g| g.affine(1.0 - cfg.beta2, 0.0))
                    .map_err(to_runtime_error)?)
            .map_err(to_runtime_error)?;

            let m_hat = new_m.affine(scale_m, 0.0).map_err(to_runtime_error)?;
            let denom = new_v
                .affine(scale_v, 0.0)
                .and_then(|v| v.sqrt())
                .and_then(|v| v.affine(1.0, cfg.epsilon))
                .map_err(to_runtime_error)?;
            let update = m_hat
                .div(&denom)
                .and_then(|u| u.affine(cfg.learning_rate, 0.0))
                .map_err(to_runtime_error)?;

            let base = slot.param.as_tensor().detach();
            let decayed = if slot.apply_weight_decay && cfg.weight_decay != 0.0 {
                base.affine(1.0 - cfg.learning_rate * cfg.weight_decay, 0.0)
                    .map_err(to_runtime_error)?
            } else {
                base
            };

            let next = decayed.sub(&update).map_err(to_runtime_error)?;
            slot.param.set(&next).map_err(to_runtime_error)?;
            slot.first_moment = new_m;
            slot.second_moment = new_v;
        }

        Ok(())
    }

    pub fn state(&self) -> Result<OptimizerState, TrainingError> {
        let mut parameters = Vec::with_capacity(self.params.len());
        for slot in &self.params {
            let shape = slot.param.as_tensor().dims().to_vec();
            let numel = numel(&shape);
            parameters.push(ParameterState {
                name: slot.name.clone(),
                first_moment: flatten_to_vec(&slot.first_moment, numel)?,
                second_moment: flatten_to_vec(&slot.second_moment, numel)?,
                shape,
            });
        }

        Ok(OptimizerState {
            step: self.step,
            learning_rate: self.config.learning_rate,
            parameters,
        })
    }

    pub fn load_state(&mut self, state: OptimizerState) -> Result<(), TrainingError> {
        let mut by_name: HashMap<_, _> = state
            .parameters
            .into_iter()
            .map(|param| (param.name.clone(), param))
            .collect();

        let mut restored = Vec::with_capacity(self.params.len());
        for slot in &self.params {
            let saved = by_name.remove(&slot.name).ok_or_else(|| {
                TrainingError::runtime(format!("optimizer state missing parameter '{}'", slot.name))
            })?;

            let dims = slot.param.as_tensor().dims();
            if dims != saved.shape.as_slice() {
                return Err(TrainingError::runtime(format!(
                    "optimizer state shape mismatch for '{}': expected {:?}, found {:?}",
                    slot.name, dims, saved.shape
                )));
            }
            let expected = numel(dims);
            if expected != saved.first_moment.len() || expected != saved.second_moment.len() {
                return Err(TrainingError::runtime(format!(
                    "optimizer state size mismatch for '{}'",
                    slot.name
                )));
            }

            let device = slot.param.as_tensor().device();
            let first = Tensor::from_vec(saved.first_moment, dims, device)
                .map_err(to_runtime_error)?;
            let second = Tensor::from_vec(saved.second_moment, dims, device)
                .map_err(to_runtime_error)?;
            restored.push((first, second));
        }

        if !by_name.is_empty() {
            let mut extra: Vec<_> = by_name.into_keys().collect();
            extra.sort();
            return Err(TrainingError::runtime(format!(
                "optimizer state has parameters not present in the model: {}",
                extra.join(", ")
            )));
        }

        for (slot, (first, second)) in self.params.iter_mut().zip(restored) {
            slot.first_moment = first;
            slot.second_moment = second;
        }
        self.step = state.step;
        Ok(())
    }
}

struct ProcessedGradient {
    index: usize,
    grad: Tensor,
    norm: f64,
}

fn should_apply_weight_decay(name: &str, exclusions: &[String]) -> bool {
    !exclusions
        .iter()
        .any(|pattern| !pattern.is_empty() && name.contains(pattern.as_str()))
}

fn tensor_l2_norm(tensor: &Tensor) -> Result<f64, TrainingError> {
    let value = tensor
        .sqr()
        .and_then(|t| t.sum_all())
        .and_then(|t| t.to_dtype(DType::F32))
        .and_then(|t| t.to_vec0::<f32>())
        .map_err(to_runtime_error)?;
    Ok(f64::from(value).sqrt())
}

fn flatten_to_vec(tensor: &Tensor, expected: usize) -> Result<Vec<f32>, TrainingError> {
    let flat = tensor
        .flatten_all()
        .and_then(|t| t.to_vec1::<f32>())
        .map_err(to_runtime_error)?;
    if flat.len() != expected {
        return Err(TrainingError::runtime(
            "unexpected element count during serialization",
        ));
    }
    Ok(flat)
}

fn numel(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// Serializable AdamW moments, keyed by parameter name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OptimizerState {
    pub step: usize,
    pub learning_rate: f64,
    pub parameters: Vec<ParameterState>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParameterState {
    pub name: String,
    pub shape: Vec<usize>,
    pub first_moment: Vec<f32>,
    pub second_moment: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn config() -> AdamWConfig {
        AdamWConfig {
            learning_rate: 0.1,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.0,
        }
    }

    fn quadratic_step(optimizer: &mut TrainerOptimizer, var: &Var) -> anyhow::Result<StepStats> {
        let loss = var.as_tensor().sqr()?.sum_all()?;
        let mut grads = loss.backward()?;
        Ok(optimizer.step(&mut grads)?)
    }

    #[test]
    fn step_moves_parameters_against_the_gradient() -> anyhow::Result<()> {
        let var = Var::new(&[1.0f32, -2.0], &Device::Cpu)?;
        let mut optimizer = TrainerOptimizer::new(
            vec![("w".to_string(), var.clone())],
            config(),
            TrainerOptimizerOptions::default(),
        )?;

        let stats = quadratic_step(&mut optimizer, &var)?;
        let values = var.as_tensor().to_vec1::<f32>()?;
        assert!(values[0] < 1.0);
        assert!(values[1] > -2.0);
        assert_eq!(stats.updated_parameters, 1);
        assert_eq!(optimizer.steps_taken(), 1);
        Ok(())
    }

    #[test]
    fn global_norm_clipping_reports_pre_clip_norm() -> anyhow::Result<()> {
        let var = Var::new(&[3.0f32, 4.0], &Device::Cpu)?;
        let mut optimizer = TrainerOptimizer::new(
            vec![("w".to_string(), var.clone())],
            config(),
            TrainerOptimizerOptions {
                clip_global_norm: Some(1.0),
                ..TrainerOptimizerOptions::default()
            },
        )?;

        let stats = quadratic_step(&mut optimizer, &var)?;
        assert!((stats.grad_norm - 10.0).abs() < 1e-4);
        assert!(stats.clipped);
        Ok(())
    }

    #[test]
    fn state_round_trips_through_json() -> anyhow::Result<()> {
        let var = Var::new(&[0.5f32, 0.25, -1.0], &Device::Cpu)?;
        let named = vec![("down1.conv.conv1.weight".to_string(), var.clone())];
        let mut optimizer =
            TrainerOptimizer::new(named.clone(), config(), TrainerOptimizerOptions::default())?;
        quadratic_step(&mut optimizer, &var)?;

        let json = serde_json::to_string(&optimizer.state()?)?;
        let restored: OptimizerState = serde_json::from_str(&json)?;

        let mut fresh =
            TrainerOptimizer::new(named, config(), TrainerOptimizerOptions::default())?;
        fresh.load_state(restored)?;
        assert_eq!(fresh.state()?, optimizer.state()?);
        Ok(())
    }

    #[test]
    fn load_state_rejects_foreign_parameters() -> anyhow::Result<()> {
        let var = Var::new(&[1.0f32], &Device::Cpu)?;
        let mut optimizer = TrainerOptimizer::new(
            vec![("head.weight".to_string(), var)],
            config(),
            TrainerOptimizerOptions::default(),
        )?;
        let state = OptimizerState {
            step: 3,
            learning_rate: 0.1,
            parameters: vec![ParameterState {
                name: "stem.conv1.weight".to_string(),
                shape: vec![1],
                first_moment: vec![0.0],
                second_moment: vec![0.0],
            }],
        };
        assert!(optimizer.load_state(state).is_err());
        assert_eq!(optimizer.steps_taken(), 0);
        Ok(())
    }

    #[test]
    fn biases_and_norm_layers_skip_weight_decay() {
        let exclude = TrainerOptimizerOptions::default().weight_decay_exclude;
        assert!(!should_apply_weight_decay("head.bias", &exclude));
        assert!(!should_apply_weight_decay("stem.bn1.weight", &exclude));
        assert!(should_apply_weight_decay("stem.conv1.weight", &exclude));
    }
}
