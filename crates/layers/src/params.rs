//! Explicit parameter ownership for a decoder instance.
//!
//! Components register their variables eagerly when they are constructed and
//! keep the returned [`Var`] handles; the store only records them so callers
//! can hand the full set to an optimiser or inspect them by name. Names are
//! hierarchical (`attention_decoder/local/predict/weight`) and may be
//! registered once: a second registration under the same name is an error
//! rather than a silent reuse. Sampling draws from a seeded [`StdRng`], so two
//! stores created with the same seed and fed the same registration sequence
//! hold bit-identical parameters.

use std::collections::HashMap;

use candle_core::{DType, Device, Error, Result, Tensor, Var};
use rand::{rngs::StdRng, SeedableRng};

use crate::{checks, linear::LinearInit};

/// Ordered collection of named trainable variables.
#[derive(Debug)]
pub struct ParameterStore {
    device: Device,
    dtype: DType,
    seed: u64,
    rng: StdRng,
    entries: Vec<(String, Var)>,
    index: HashMap<String, usize>,
}

impl ParameterStore {
    /// Creates an empty store whose parameters live on `device` with `dtype`.
    pub fn new(device: &Device, dtype: DType, seed: u64) -> Self {
        Self {
            device: device.clone(),
            dtype,
            seed,
            rng: StdRng::seed_from_u64(seed),
            entries: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Device hosting every registered parameter.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Storage dtype of every registered parameter.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Seed the sampling RNG was created with.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Samples a new parameter of shape `dims` following `init`.
    pub fn sample(&mut self, name: &str, dims: &[usize], init: &LinearInit) -> Result<Var> {
        self.ensure_vacant(name)?;
        let count: usize = dims.iter().product();
        if count == 0 {
            return Err(Error::Msg(format!(
                "{name}: parameter shape {:?} has no elements",
                dims
            )));
        }
        let values = init.sample(count, &mut self.rng)?;
        let tensor = Tensor::from_vec(values, dims, &self.device)?;
        self.register(name, tensor)
    }

    /// Registers a zero-initialised parameter of shape `dims`.
    pub fn zeros(&mut self, name: &str, dims: &[usize]) -> Result<Var> {
        self.ensure_vacant(name)?;
        let tensor = Tensor::zeros(dims, self.dtype, &self.device)?;
        self.register(name, tensor)
    }

    /// Registers an existing tensor (for example pretrained weights) under `name`.
    pub fn register(&mut self, name: &str, tensor: Tensor) -> Result<Var> {
        self.ensure_vacant(name)?;
        checks::ensure_float_dtype(name, self.dtype)?;
        if !tensor.device().same_device(&self.device) {
            return Err(Error::Msg(format!(
                "{name}: parameter must reside on the store device"
            )));
        }
        let tensor = if tensor.dtype() == self.dtype {
            tensor
        } else {
            tensor.to_dtype(self.dtype)?
        };
        let var = Var::from_tensor(&tensor)?;
        log::debug!("registered parameter {} {:?}", name, var.dims());
        self.index.insert(name.to_string(), self.entries.len());
        self.entries.push((name.to_string(), var.clone()));
        Ok(var)
    }

    /// Looks up a previously registered parameter.
    pub fn get(&self, name: &str) -> Option<&Var> {
        self.index.get(name).map(|&idx| &self.entries[idx].1)
    }

    /// Clones every variable handle, e.g. for an optimiser.
    pub fn all_vars(&self) -> Vec<Var> {
        self.entries.iter().map(|(_, var)| var.clone()).collect()
    }

    /// Number of registered parameters.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no parameters.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total number of scalar weights across all parameters.
    pub fn num_elements(&self) -> usize {
        self.entries.iter().map(|(_, var)| var.elem_count()).sum()
    }

    fn ensure_vacant(&self, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(Error::Msg("parameter names must be non-empty".into()));
        }
        if self.index.contains_key(name) {
            return Err(Error::Msg(format!(
                "parameter {name} is already registered"
            )));
        }
        Ok(())
    }
}
