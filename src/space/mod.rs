//! Configuration space builder.
//!
//! A [`ParameterSpace`] is the ordered list of tunable parameters and their
//! candidate values. [`SearchSpace`] combines it with [`Restriction`]s and
//! enumerates the valid part of the Cartesian product lazily, first parameter
//! slowest, last parameter fastest.

mod configuration;
mod restriction;
mod value;

pub use configuration::Configuration;
pub use restriction::Restriction;
pub use value::ParamValue;

use crate::errors::{Result, TunerError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Job-file representation of one parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamEntry {
    pub name: String,
    pub values: Vec<ParamValue>,
}

/// Ordered mapping from parameter name to its candidate values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<ParamEntry>", into = "Vec<ParamEntry>")]
pub struct ParameterSpace {
    params: Vec<(String, Vec<ParamValue>)>,
}

impl ParameterSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with<V, I>(mut self, name: &str, values: I) -> Result<Self>
    where
        V: Into<ParamValue>,
        I: IntoIterator<Item = V>,
    {
        self.insert(name, values.into_iter().map(Into::into).collect())?;
        Ok(self)
    }

    pub fn insert(&mut self, name: &str, values: Vec<ParamValue>) -> Result<()> {
        if name.is_empty() {
            return Err(TunerError::config("parameter name must not be empty"));
        }
        if self.contains(name) {
            return Err(TunerError::config(format!(
                "parameter `{}` is defined twice",
                name
            )));
        }
        if values.is_empty() {
            return Err(TunerError::config(format!(
                "parameter `{}` has no candidate values",
                name
            )));
        }
        self.params.push((name.to_string(), values));
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.params.iter().any(|(n, _)| n == name)
    }

    pub fn values(&self, name: &str) -> Option<&[ParamValue]> {
        self.params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_slice())
    }

    pub fn names(&self) -> Vec<String> {
        self.params.iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[ParamValue])> {
        self.params.iter().map(|(n, v)| (n.as_str(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

impl TryFrom<Vec<ParamEntry>> for ParameterSpace {
    type Error = TunerError;

    fn try_from(entries: Vec<ParamEntry>) -> Result<Self> {
        let mut space = ParameterSpace::new();
        for entry in entries {
            space.insert(&entry.name, entry.values)?;
        }
        Ok(space)
    }
}

impl From<ParameterSpace> for Vec<ParamEntry> {
    fn from(space: ParameterSpace) -> Self {
        space
            .params
            .into_iter()
            .map(|(name, values)| ParamEntry { name, values })
            .collect()
    }
}

/// The restricted Cartesian product of a parameter space.
#[derive(Debug, Clone)]
pub struct SearchSpace {
    names: Arc<[String]>,
    values: Vec<Vec<ParamValue>>,
    restrictions: Vec<Restriction>,
}

impl SearchSpace {
    /// Fails if the space is empty or a restriction reads an undefined parameter.
    pub fn new(params: ParameterSpace, restrictions: Vec<Restriction>) -> Result<Self> {
        if params.is_empty() {
            return Err(TunerError::config("no tunable parameters defined"));
        }
        for restriction in &restrictions {
            for name in restriction.referenced() {
                if !params.contains(&name) {
                    return Err(TunerError::UndefinedParameter {
                        name,
                        restriction: restriction.to_string(),
                    });
                }
            }
        }
        let (names, values): (Vec<String>, Vec<Vec<ParamValue>>) =
            params.params.into_iter().unzip();
        Ok(Self {
            names: names.into(),
            values,
            restrictions,
        })
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn values(&self, param: usize) -> &[ParamValue] {
        &self.values[param]
    }

    /// Number of candidate values per parameter.
    pub fn dims(&self) -> Vec<usize> {
        self.values.iter().map(Vec::len).collect()
    }

    pub fn restrictions(&self) -> &[Restriction] {
        &self.restrictions
    }

    /// Size of the unrestricted product, saturating at `u64::MAX`.
    pub fn cartesian_size(&self) -> u64 {
        self.values
            .iter()
            .fold(1u64, |acc, v| acc.saturating_mul(v.len() as u64))
    }

    /// True if the configuration satisfies every restriction.
    pub fn is_valid(&self, config: &Configuration) -> bool {
        self.restrictions.iter().all(|r| r.check(config))
    }

    /// Build a configuration from per-parameter value indices.
    pub fn configuration(&self, positions: &[usize]) -> Option<Configuration> {
        if positions.len() != self.values.len() {
            return None;
        }
        let values = positions
            .iter()
            .zip(&self.values)
            .map(|(&i, vals)| vals.get(i).cloned())
            .collect::<Option<Vec<_>>>()?;
        Some(Configuration::new(Arc::clone(&self.names), values))
    }

    /// Inverse of [`SearchSpace::configuration`].
    pub fn positions(&self, config: &Configuration) -> Option<Vec<usize>> {
        self.names
            .iter()
            .zip(&self.values)
            .map(|(name, vals)| {
                let v = config.get(name)?;
                vals.iter().position(|c| c == v)
            })
            .collect()
    }

    pub fn iter(&self) -> SpaceIter<'_> {
        SpaceIter {
            space: self,
            positions: vec![0; self.values.len()],
            done: self.values.iter().any(Vec::is_empty),
        }
    }

    pub fn count(&self) -> usize {
        self.iter().count()
    }

    pub fn collect(&self) -> Vec<Configuration> {
        self.iter().collect()
    }
}

/// Lazy odometer over the value indices, yielding only valid configurations.
pub struct SpaceIter<'a> {
    space: &'a SearchSpace,
    positions: Vec<usize>,
    done: bool,
}

impl SpaceIter<'_> {
    fn advance(&mut self) {
        for i in (0..self.positions.len()).rev() {
            self.positions[i] += 1;
            if self.positions[i] < self.space.values[i].len() {
                return;
            }
            self.positions[i] = 0;
        }
        self.done = true;
    }
}

impl Iterator for SpaceIter<'_> {
    type Item = Configuration;

    fn next(&mut self) -> Option<Configuration> {
        while !self.done {
            let config = self.space.configuration(&self.positions);
            self.advance();
            if let Some(config) = config {
                if self.space.is_valid(&config) {
                    return Some(config);
                }
            }
        }
        None
    }
}
