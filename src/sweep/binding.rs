//! Resource bindings, resolved once before a sweep starts.
//!
//! Every output variable binds to a writable resource, every input variable to
//! a readable one. An output variable with an empty resource name binds to a
//! placeholder: it still occupies a column, but writing to it does nothing.
//!
//! Resolution collects *all* problems before failing so the operator can fix
//! the setup in one pass.

use crate::error::{SweepError, SweepResult};
use crate::resource::{Resource, ResourceRegistry, Value};
use crate::variables::VariableSpace;
use anyhow::Result;
use std::fmt;
use std::sync::Arc;

/// Where an output value goes
#[derive(Clone)]
pub enum OutputBinding {
    /// A live, writable resource
    Resource {
        /// Registry name
        name: String,
        /// The resource
        resource: Arc<dyn Resource>,
    },
    /// No physical channel; writes are accepted and dropped
    Placeholder {
        /// Slot label used in logs
        slot: String,
    },
}

impl OutputBinding {
    /// Label used in logs and abort reasons
    pub fn name(&self) -> &str {
        match self {
            OutputBinding::Resource { name, .. } => name,
            OutputBinding::Placeholder { slot } => slot,
        }
    }

    /// Whether writes reach a device
    pub fn is_placeholder(&self) -> bool {
        matches!(self, OutputBinding::Placeholder { .. })
    }

    /// Write `value`; a no-op for placeholders
    pub async fn write(&self, value: Value) -> Result<()> {
        match self {
            OutputBinding::Resource { resource, .. } => resource.write(value).await,
            OutputBinding::Placeholder { .. } => Ok(()),
        }
    }
}

impl fmt::Debug for OutputBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputBinding::Resource { name, .. } => write!(f, "Resource({name})"),
            OutputBinding::Placeholder { slot } => write!(f, "Placeholder({slot})"),
        }
    }
}

/// A readable resource feeding one input column
#[derive(Clone)]
pub struct InputBinding {
    /// Registry name
    pub name: String,
    /// The resource
    pub resource: Arc<dyn Resource>,
}

impl fmt::Debug for InputBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Input({})", self.name)
    }
}

/// All bindings for one sweep, shaped like the variable space.
#[derive(Debug, Clone, Default)]
pub struct ResourceBindings {
    /// One entry per output variable, grouped like the space
    pub outputs: Vec<Vec<OutputBinding>>,
    /// One entry per input variable
    pub inputs: Vec<InputBinding>,
}

impl ResourceBindings {
    /// Names of the input resources, in column order
    pub fn input_names(&self) -> Vec<String> {
        self.inputs.iter().map(|b| b.name.clone()).collect()
    }

    /// Whether these bindings line up with `space`
    pub fn matches(&self, space: &VariableSpace) -> bool {
        self.inputs.len() == space.inputs().len()
            && self.outputs.len() == space.groups().len()
            && self
                .outputs
                .iter()
                .zip(space.groups())
                .all(|(bindings, group)| bindings.len() == group.len())
    }
}

/// Problems found while binding
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindingReport {
    /// Names not present in the registry
    pub missing: Vec<String>,
    /// Output resources that cannot be written
    pub unwritable: Vec<String>,
    /// Input resources that cannot be read
    pub unreadable: Vec<String>,
}

impl BindingReport {
    /// Whether no problems were found
    pub fn is_empty(&self) -> bool {
        self.missing.is_empty() && self.unwritable.is_empty() && self.unreadable.is_empty()
    }
}

impl fmt::Display for BindingReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if !self.missing.is_empty() {
            parts.push(format!("missing resources: {}", self.missing.join(", ")));
        }
        if !self.unreadable.is_empty() {
            parts.push(format!("unreadable resources: {}", self.unreadable.join(", ")));
        }
        if !self.unwritable.is_empty() {
            parts.push(format!("unwritable resources: {}", self.unwritable.join(", ")));
        }
        f.write_str(&parts.join("; "))
    }
}

/// Resolve every variable of `space` against `registry`.
pub fn bind_resources(
    space: &VariableSpace,
    registry: &ResourceRegistry,
) -> SweepResult<ResourceBindings> {
    let mut report = BindingReport::default();
    let mut bindings = ResourceBindings::default();
    let mut slot = 0usize;

    for group in space.groups() {
        let mut group_bindings = Vec::with_capacity(group.len());
        for var in group {
            let name = &var.variable.resource_name;
            if name.is_empty() {
                group_bindings.push(OutputBinding::Placeholder {
                    slot: format!("placeholder:{slot}"),
                });
            } else {
                match registry.get(name) {
                    None => report.missing.push(name.clone()),
                    Some(resource) if !resource.writable() => report.unwritable.push(name.clone()),
                    Some(resource) => group_bindings.push(OutputBinding::Resource {
                        name: name.clone(),
                        resource,
                    }),
                }
            }
            slot += 1;
        }
        bindings.outputs.push(group_bindings);
    }

    for var in space.inputs() {
        let name = &var.resource_name;
        match registry.get(name) {
            None => report.missing.push(name.clone()),
            Some(resource) if !resource.readable() => report.unreadable.push(name.clone()),
            Some(resource) => bindings.inputs.push(InputBinding {
                name: name.clone(),
                resource,
            }),
        }
    }

    if !report.is_empty() {
        return Err(SweepError::InvalidBindings(report));
    }
    Ok(bindings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::mock::MockResource;
    use crate::variables::{InputVariable, OutputVariable, ValueConfig};

    fn two_points() -> ValueConfig {
        ValueConfig::LinSpace {
            initial: 0.0,
            final_value: 1.0,
            steps: 2,
        }
    }

    #[test]
    fn test_bind_with_placeholder() {
        let space = VariableSpace::new(
            vec![
                OutputVariable::new("a", "dac0", two_points()),
                OutputVariable::new("b", "", two_points()),
            ],
            vec![InputVariable::new("m", "adc0")],
        )
        .unwrap();

        let mut registry = ResourceRegistry::new();
        registry.insert("dac0", Arc::new(MockResource::echo()));
        registry.insert("adc0", Arc::new(MockResource::constant(Value::Float(1.0))));

        let bindings = bind_resources(&space, &registry).unwrap();
        assert!(bindings.matches(&space));
        assert_eq!(bindings.outputs[0][0].name(), "dac0");
        assert!(bindings.outputs[0][1].is_placeholder());
        assert_eq!(bindings.input_names(), vec!["adc0".to_string()]);
    }

    #[test]
    fn test_bind_reports_every_problem() {
        let space = VariableSpace::new(
            vec![
                OutputVariable::new("a", "ghost", two_points()),
                OutputVariable::new("b", "adc0", two_points()),
            ],
            vec![
                InputVariable::new("m", "dac_wo"),
                InputVariable::new("n", "nowhere"),
            ],
        )
        .unwrap();

        let mut registry = ResourceRegistry::new();
        registry.insert("adc0", Arc::new(MockResource::constant(Value::Float(1.0))));
        registry.insert(
            "dac_wo",
            Arc::new(MockResource::echo().readable_as(false)),
        );

        let Err(SweepError::InvalidBindings(report)) = bind_resources(&space, &registry) else {
            panic!("expected binding failure");
        };
        assert_eq!(report.missing, vec!["ghost".to_string(), "nowhere".to_string()]);
        assert_eq!(report.unwritable, vec!["adc0".to_string()]);
        assert_eq!(report.unreadable, vec!["dac_wo".to_string()]);
        assert_eq!(
            report.to_string(),
            "missing resources: ghost, nowhere; unreadable resources: dac_wo; unwritable resources: adc0"
        );
    }

    #[tokio::test]
    async fn test_placeholder_write_is_noop() {
        let binding = OutputBinding::Placeholder {
            slot: "placeholder:0".into(),
        };
        assert!(binding.write(Value::Float(3.0)).await.is_ok());
    }
}
