//! Sweep definition documents.
//!
//! A definition is a TOML file listing the output and input variables of a
//! sweep, plus optional simulated resources so the sweep can be exercised
//! without hardware:
//!
//! ```toml
//! [[outputs]]
//! name = "bias"
//! order = 1
//! resource_name = "dac0"
//! config = { type = "lin_space", initial = 0.0, final = 1.0, steps = 11 }
//! wait = "20ms"
//!
//! [[inputs]]
//! name = "current"
//! resource_name = "adc0"
//!
//! [[resources]]
//! name = "dac0"
//! kind = "echo"
//!
//! [[resources]]
//! name = "adc0"
//! kind = "noise"
//! min = -1e-9
//! max = 1e-9
//! ```

use crate::error::SweepResult;
use crate::resource::mock::MockResource;
use crate::resource::{ResourceRegistry, Value};
use crate::variables::{InputVariable, OutputVariable, VariableSpace};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// A complete sweep definition
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SweepDefinition {
    /// Swept variables
    #[serde(default)]
    pub outputs: Vec<OutputVariable>,
    /// Measured variables
    #[serde(default)]
    pub inputs: Vec<InputVariable>,
    /// Simulated resources
    #[serde(default)]
    pub resources: Vec<MockResourceSpec>,
}

/// Simulated resource kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MockKind {
    /// Reads return the last written value
    Echo,
    /// Reads return `value`
    Constant,
    /// Reads return uniform noise in `[min, max)`
    Noise,
}

/// Declaration of a simulated resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MockResourceSpec {
    /// Registry name
    pub name: String,
    /// Behavior
    pub kind: MockKind,
    /// Value for `constant`
    #[serde(default)]
    pub value: Option<Value>,
    /// Lower bound for `noise`
    #[serde(default)]
    pub min: f64,
    /// Upper bound for `noise`
    #[serde(default = "default_noise_max")]
    pub max: f64,
    /// Override readability
    #[serde(default)]
    pub readable: Option<bool>,
    /// Override writability
    #[serde(default)]
    pub writable: Option<bool>,
    /// Simulated I/O latency
    #[serde(default, with = "humantime_serde")]
    pub latency: Duration,
}

fn default_noise_max() -> f64 {
    1.0
}

impl MockResourceSpec {
    /// Instantiate the simulated resource
    pub fn build(&self) -> MockResource {
        let mut resource = match self.kind {
            MockKind::Echo => MockResource::echo(),
            MockKind::Constant => {
                MockResource::constant(self.value.clone().unwrap_or(Value::Float(0.0)))
            }
            MockKind::Noise => MockResource::noise(self.min, self.max),
        };
        if let Some(readable) = self.readable {
            resource = resource.readable_as(readable);
        }
        if let Some(writable) = self.writable {
            resource = resource.writable_as(writable);
        }
        resource.with_latency(self.latency)
    }
}

impl SweepDefinition {
    /// Parse a definition from TOML text
    pub fn from_toml_str(text: &str) -> SweepResult<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Load a definition file
    pub fn load<P: AsRef<Path>>(path: P) -> SweepResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    /// Sort and group the variables
    pub fn space(&self) -> SweepResult<VariableSpace> {
        VariableSpace::new(self.outputs.clone(), self.inputs.clone())
    }

    /// Registry holding every simulated resource
    pub fn registry(&self) -> ResourceRegistry {
        let mut registry = ResourceRegistry::new();
        for spec in &self.resources {
            registry.insert(spec.name.clone(), Arc::new(spec.build()));
        }
        registry
    }
}
