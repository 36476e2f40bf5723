//! Calibrated parameters and the ordered space they form.

use serde::{Deserialize, Serialize};

/// A real-valued parameter with an inclusive range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    /// Parameter name, used for statistics and reporting.
    pub name: String,
    /// Lower bound (inclusive).
    pub lower: f64,
    /// Upper bound (inclusive).
    pub upper: f64,
}

impl Parameter {
    /// Create a parameter.
    pub fn new(name: impl Into<String>, lower: f64, upper: f64) -> Self {
        Self {
            name: name.into(),
            lower,
            upper,
        }
    }

    /// Width of the range.
    pub fn span(&self) -> f64 {
        self.upper - self.lower
    }

    /// Check whether `value` lies within the bounds.
    pub fn contains(&self, value: f64) -> bool {
        value >= self.lower && value <= self.upper
    }
}

/// Ordered sequence of parameters. Order defines the chromosome layout.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterSpace {
    parameters: Vec<Parameter>,
}

impl ParameterSpace {
    /// Create from an ordered list of parameters.
    pub fn new(parameters: Vec<Parameter>) -> Self {
        Self { parameters }
    }

    /// Append a parameter.
    pub fn with(mut self, name: impl Into<String>, lower: f64, upper: f64) -> Self {
        self.parameters.push(Parameter::new(name, lower, upper));
        self
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Parameter> {
        self.parameters.iter()
    }

    /// Parameter names in layout order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.parameters.iter().map(|p| p.name.as_str())
    }
}

impl<'a> IntoIterator for &'a ParameterSpace {
    type Item = &'a Parameter;
    type IntoIter = std::slice::Iter<'a, Parameter>;

    fn into_iter(self) -> Self::IntoIter {
        self.parameters.iter()
    }
}

impl std::ops::Index<usize> for ParameterSpace {
    type Output = Parameter;

    fn index(&self, index: usize) -> &Parameter {
        &self.parameters[index]
    }
}
