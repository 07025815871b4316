//! Sweep variables and the iteration space they define.
//!
//! Output variables are swept: every step writes a value to each variable's
//! resource. Variables sharing the same `order` form a *group* and advance in
//! lockstep; groups nest like the wheels of an odometer, the group with the
//! highest order being the outermost (slowest) loop.
//!
//! ```text
//! order 2:  V ──────────── 0.0 ─────────────── 1.0 ──────────
//! order 1:  I ── 0 ── 1 ── 2 ──┐  0 ── 1 ── 2 ──
//!                              └ inner group resets, outer advances
//! ```
//!
//! Input variables are measured once per step, in declaration order.

use crate::error::{SweepError, SweepResult};
use crate::resource::Value;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Values taken by an output variable over one pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ValueConfig {
    /// `steps` evenly spaced points from `initial` to `final`, inclusive
    LinSpace {
        /// First value
        initial: f64,
        /// Last value
        #[serde(rename = "final")]
        final_value: f64,
        /// Number of points
        steps: usize,
    },
    /// An explicit list of values
    List {
        /// Values in sweep order
        values: Vec<Value>,
    },
}

impl ValueConfig {
    /// Materialize the configured values
    pub fn values(&self) -> Vec<Value> {
        match self {
            ValueConfig::LinSpace {
                initial,
                final_value,
                steps,
            } => match *steps {
                0 => Vec::new(),
                1 => vec![Value::Float(*initial)],
                n => (0..n)
                    .map(|i| {
                        let frac = i as f64 / (n - 1) as f64;
                        Value::Float(initial + (final_value - initial) * frac)
                    })
                    .collect(),
            },
            ValueConfig::List { values } => values.clone(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_smooth_steps() -> usize {
    10
}

/// A swept quantity written to a resource every step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputVariable {
    /// Column name in the export
    pub name: String,
    /// Nesting order; equal orders form one group, higher is outer
    #[serde(default)]
    pub order: i32,
    /// Disabled variables are ignored entirely
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Bound resource; empty means a placeholder slot
    #[serde(default)]
    pub resource_name: String,
    /// Values to sweep
    pub config: ValueConfig,
    /// Number of intermediate points used for smooth ramps
    #[serde(default = "default_smooth_steps")]
    pub smooth_steps: usize,
    /// Ramp from `const` to the first value at start, and back at the end
    #[serde(default)]
    pub smooth_from: bool,
    /// Ramp between consecutive values whenever this variable's group changes
    #[serde(default)]
    pub smooth_transition: bool,
    /// Resting value used by `smooth_from`
    #[serde(default, rename = "const")]
    pub const_value: f64,
    /// Settle time after writing this variable
    #[serde(default, with = "humantime_serde")]
    pub wait: Duration,
}

impl OutputVariable {
    /// Output variable with default options
    pub fn new(name: impl Into<String>, resource_name: impl Into<String>, config: ValueConfig) -> Self {
        Self {
            name: name.into(),
            order: 0,
            enabled: true,
            resource_name: resource_name.into(),
            config,
            smooth_steps: default_smooth_steps(),
            smooth_from: false,
            smooth_transition: false,
            const_value: 0.0,
            wait: Duration::ZERO,
        }
    }

    /// Set the nesting order
    pub fn with_order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    /// Set the per-variable settle time
    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }
}

/// A measured quantity read from a resource every step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputVariable {
    /// Column name in the export
    pub name: String,
    /// Resource to read
    #[serde(default)]
    pub resource_name: String,
    /// Disabled variables are ignored entirely
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl InputVariable {
    /// Enabled input variable
    pub fn new(name: impl Into<String>, resource_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            resource_name: resource_name.into(),
            enabled: true,
        }
    }
}

/// An output variable with its materialized values
#[derive(Debug, Clone, PartialEq)]
pub struct SweptVariable {
    /// The variable definition
    pub variable: OutputVariable,
    /// Values in sweep order
    pub values: Vec<Value>,
}

/// Output variables advanced together
pub type Group = Vec<SweptVariable>;

/// Sort output variables into groups and compute the item count.
///
/// Groups are ordered by descending `order`; members of a group by name.
/// Every member of a group must have the same number of values.
pub fn sort_variables(variables: Vec<OutputVariable>) -> SweepResult<(Vec<Group>, usize)> {
    if variables.is_empty() {
        return Err(SweepError::NoOutputVariables);
    }

    let mut swept = Vec::with_capacity(variables.len());
    for variable in variables {
        let values = variable.config.values();
        if values.is_empty() {
            return Err(SweepError::EmptyValues(variable.name));
        }
        swept.push(SweptVariable { variable, values });
    }

    // Stable: equal names keep declaration order
    swept.sort_by(|a, b| {
        b.variable
            .order
            .cmp(&a.variable.order)
            .then_with(|| a.variable.name.cmp(&b.variable.name))
    });

    let mut groups: Vec<Group> = Vec::new();
    for var in swept {
        match groups.last_mut() {
            Some(group) if group[0].variable.order == var.variable.order => group.push(var),
            _ => groups.push(vec![var]),
        }
    }

    let mut num_items = 1usize;
    for group in &groups {
        let len = group[0].values.len();
        if group.iter().any(|v| v.values.len() != len) {
            let details = group
                .iter()
                .map(|v| format!("{}={}", v.variable.name, v.values.len()))
                .collect::<Vec<_>>()
                .join(", ");
            return Err(SweepError::GroupLengthMismatch {
                order: group[0].variable.order,
                details,
            });
        }
        num_items = num_items.saturating_mul(len);
    }

    Ok((groups, num_items))
}

/// The complete, sorted description of a sweep.
#[derive(Debug, Clone)]
pub struct VariableSpace {
    groups: Vec<Group>,
    inputs: Vec<InputVariable>,
    num_items: usize,
}

impl VariableSpace {
    /// Build the space from raw variable definitions.
    ///
    /// Disabled variables are dropped, as are input variables with no
    /// resource (there is nothing to measure).
    pub fn new(outputs: Vec<OutputVariable>, inputs: Vec<InputVariable>) -> SweepResult<Self> {
        let outputs: Vec<OutputVariable> = outputs.into_iter().filter(|v| v.enabled).collect();
        let inputs: Vec<InputVariable> = inputs
            .into_iter()
            .filter(|v| v.enabled && !v.resource_name.is_empty())
            .collect();

        let (groups, num_items) = sort_variables(outputs)?;
        Ok(Self {
            groups,
            inputs,
            num_items,
        })
    }

    /// Output groups, outermost first
    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    /// Measured variables in column order
    pub fn inputs(&self) -> &[InputVariable] {
        &self.inputs
    }

    /// Items in one pass over the space
    pub fn num_items(&self) -> usize {
        self.num_items
    }

    /// Output variable names, flattened in group order
    pub fn output_names(&self) -> Vec<String> {
        self.groups
            .iter()
            .flatten()
            .map(|v| v.variable.name.clone())
            .collect()
    }

    /// Input variable names in order
    pub fn input_names(&self) -> Vec<String> {
        self.inputs.iter().map(|v| v.name.clone()).collect()
    }

    /// Export header: `__time__`, outputs, inputs
    pub fn header(&self) -> Vec<String> {
        std::iter::once("__time__".to_string())
            .chain(self.output_names())
            .chain(self.input_names())
            .collect()
    }

    /// Fresh iterator over this space
    pub fn iter(&self) -> SweepIterator {
        SweepIterator::new(self.groups.iter().map(|g| g[0].values.len()).collect())
    }

    /// Values of group `pos` at `index`, one per member
    pub fn group_values(&self, pos: usize, index: usize) -> Vec<Value> {
        self.groups[pos]
            .iter()
            .map(|v| v.values[index].clone())
            .collect()
    }
}

/// Odometer over the group lengths of a `VariableSpace`.
///
/// Owned by the sweep controller and passed through the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepIterator {
    lengths: Vec<usize>,
    positions: Vec<usize>,
    started: bool,
    exhausted: bool,
}

impl SweepIterator {
    /// Iterator over groups of the given lengths
    pub fn new(lengths: Vec<usize>) -> Self {
        let positions = vec![0; lengths.len()];
        let exhausted = lengths.is_empty() || lengths.contains(&0);
        Self {
            lengths,
            positions,
            started: false,
            exhausted,
        }
    }

    /// Advance to the next item.
    ///
    /// Returns the indices of the groups whose values changed, or `None`
    /// once the space is exhausted. The first advance reports every group.
    pub fn advance(&mut self) -> Option<Vec<usize>> {
        if self.exhausted {
            return None;
        }
        if !self.started {
            self.started = true;
            return Some((0..self.lengths.len()).collect());
        }

        let mut changed = Vec::new();
        let mut pos = self.lengths.len();
        while pos > 0 {
            pos -= 1;
            changed.push(pos);
            self.positions[pos] += 1;
            if self.positions[pos] < self.lengths[pos] {
                changed.reverse();
                return Some(changed);
            }
            self.positions[pos] = 0;
        }

        // Carried out of the outermost group
        self.exhausted = true;
        None
    }

    /// Start over from the first item
    pub fn reset(&mut self) {
        *self = Self::new(std::mem::take(&mut self.lengths));
    }

    /// Current index within each group
    pub fn positions(&self) -> &[usize] {
        &self.positions
    }
}

/// Intermediate points strictly between `from` and `to`.
///
/// `steps` is the number of segments; a path of `steps - 1` interior points
/// is returned, so the caller writes the endpoint itself.
pub fn smooth_path(from: f64, to: f64, steps: usize) -> Vec<f64> {
    if steps < 2 || from == to {
        return Vec::new();
    }
    (1..steps)
        .map(|i| from + (to - from) * (i as f64 / steps as f64))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lin(initial: f64, final_value: f64, steps: usize) -> ValueConfig {
        ValueConfig::LinSpace {
            initial,
            final_value,
            steps,
        }
    }

    #[test]
    fn test_linspace_values() {
        assert_eq!(
            lin(0.0, 1.0, 3).values(),
            vec![Value::Float(0.0), Value::Float(0.5), Value::Float(1.0)]
        );
        assert_eq!(lin(2.0, 9.0, 1).values(), vec![Value::Float(2.0)]);
        assert!(lin(0.0, 1.0, 0).values().is_empty());
    }

    #[test]
    fn test_sort_groups_by_descending_order_then_name() {
        let vars = vec![
            OutputVariable::new("b", "r1", lin(0.0, 1.0, 2)).with_order(1),
            OutputVariable::new("outer", "r2", lin(0.0, 1.0, 3)).with_order(5),
            OutputVariable::new("a", "r3", lin(0.0, 1.0, 2)).with_order(1),
        ];

        let (groups, num_items) = sort_variables(vars).unwrap();
        let names: Vec<Vec<&str>> = groups
            .iter()
            .map(|g| g.iter().map(|v| v.variable.name.as_str()).collect())
            .collect();

        assert_eq!(names, vec![vec!["outer"], vec!["a", "b"]]);
        assert_eq!(num_items, 6);
    }

    #[test]
    fn test_sort_rejects_mismatched_group() {
        let vars = vec![
            OutputVariable::new("a", "r1", lin(0.0, 1.0, 2)),
            OutputVariable::new("b", "r2", lin(0.0, 1.0, 3)),
        ];
        let err = sort_variables(vars).unwrap_err();
        assert!(matches!(err, SweepError::GroupLengthMismatch { order: 0, .. }));
        assert!(err.to_string().contains("a=2, b=3"));
    }

    #[test]
    fn test_sort_rejects_empty_inputs() {
        assert!(matches!(
            sort_variables(Vec::new()),
            Err(SweepError::NoOutputVariables)
        ));
        assert!(matches!(
            sort_variables(vec![OutputVariable::new("a", "r", lin(0.0, 1.0, 0))]),
            Err(SweepError::EmptyValues(name)) if name == "a"
        ));
    }

    #[test]
    fn test_space_filters_disabled_and_unbound() {
        let mut disabled = OutputVariable::new("off", "r9", lin(0.0, 1.0, 7));
        disabled.enabled = false;
        let outputs = vec![OutputVariable::new("v", "", lin(0.0, 1.0, 4)), disabled];
        let inputs = vec![
            InputVariable::new("i1", "adc1"),
            InputVariable::new("i2", ""),
            InputVariable {
                enabled: false,
                ..InputVariable::new("i3", "adc3")
            },
        ];

        let space = VariableSpace::new(outputs, inputs).unwrap();
        assert_eq!(space.num_items(), 4);
        assert_eq!(space.header(), vec!["__time__", "v", "i1"]);
    }

    #[test]
    fn test_iterator_odometer_order() {
        let mut it = SweepIterator::new(vec![2, 3]);
        let mut seen = Vec::new();
        let mut changes = Vec::new();
        while let Some(changed) = it.advance() {
            seen.push(it.positions().to_vec());
            changes.push(changed);
        }

        assert_eq!(
            seen,
            vec![
                vec![0, 0],
                vec![0, 1],
                vec![0, 2],
                vec![1, 0],
                vec![1, 1],
                vec![1, 2]
            ]
        );
        assert_eq!(changes[0], vec![0, 1]);
        assert_eq!(changes[1], vec![1]);
        assert_eq!(changes[3], vec![0, 1]);
        assert!(it.advance().is_none());
    }

    #[test]
    fn test_iterator_reset_restarts() {
        let mut it = SweepIterator::new(vec![2]);
        assert!(it.advance().is_some());
        assert!(it.advance().is_some());
        assert!(it.advance().is_none());

        it.reset();
        assert_eq!(it.advance(), Some(vec![0]));
        assert_eq!(it.positions(), &[0]);
    }

    #[test]
    fn test_smooth_path_interior_points() {
        assert_eq!(smooth_path(0.0, 1.0, 4), vec![0.25, 0.5, 0.75]);
        assert!(smooth_path(0.0, 1.0, 1).is_empty());
        assert!(smooth_path(3.0, 3.0, 10).is_empty());
    }

    #[test]
    fn test_output_variable_from_toml() {
        let var: OutputVariable = toml::from_str(
            r#"
name = "gate"
order = 2
resource_name = "dac0"
smooth_from = true
const = 0.5
wait = "150ms"
config = { type = "lin_space", initial = -1.0, final = 1.0, steps = 5 }
"#,
        )
        .unwrap();

        assert_eq!(var.order, 2);
        assert!(var.enabled);
        assert!(var.smooth_from);
        assert_eq!(var.const_value, 0.5);
        assert_eq!(var.wait, Duration::from_millis(150));
        assert_eq!(var.smooth_steps, 10);
        assert_eq!(var.config.values().len(), 5);
    }
}
