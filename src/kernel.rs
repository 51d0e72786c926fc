//! Kernel sources and preprocessor-level parameter substitution.

use crate::errors::{Result, TunerError};
use crate::feasibility::LaunchGeometry;
use crate::space::Configuration;
use std::path::{Path, PathBuf};

/// Kernel source text plus the entry-point name to tune.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelSource {
    name: String,
    code: String,
    path: Option<PathBuf>,
}

/// A kernel ready to compile for one configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedKernel {
    pub name: String,
    /// `#define` block followed by the original source.
    pub source: String,
    pub defines: Vec<(String, String)>,
    pub config: Configuration,
}

fn contains_identifier(code: &str, ident: &str) -> bool {
    let is_ident = |c: char| c.is_alphanumeric() || c == '_';
    code.match_indices(ident).any(|(start, _)| {
        let before = code[..start].chars().next_back();
        let after = code[start + ident.len()..].chars().next();
        !before.is_some_and(is_ident) && !after.is_some_and(is_ident)
    })
}

impl KernelSource {
    pub fn from_string(name: &str, code: impl Into<String>) -> Result<Self> {
        let code = code.into();
        if name.is_empty() {
            return Err(TunerError::config("kernel name must not be empty"));
        }
        if !contains_identifier(&code, name) {
            return Err(TunerError::config(format!(
                "kernel `{}` not found in source",
                name
            )));
        }
        Ok(Self {
            name: name.to_string(),
            code,
            path: None,
        })
    }

    pub fn from_file(path: impl AsRef<Path>, name: &str) -> Result<Self> {
        let path = path.as_ref();
        let code = std::fs::read_to_string(path).map_err(|e| {
            TunerError::config(format!("cannot read kernel file {}: {}", path.display(), e))
        })?;
        let mut source = Self::from_string(name, code).map_err(|_| {
            TunerError::config(format!(
                "kernel `{}` not found in {}",
                name,
                path.display()
            ))
        })?;
        source.path = Some(path.to_path_buf());
        Ok(source)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Prepend one `#define` per parameter and per launch dimension.
    pub fn prepare(&self, config: &Configuration, geometry: &LaunchGeometry) -> PreparedKernel {
        let mut defines: Vec<(String, String)> = config
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect();
        let dims = ["x", "y", "z"];
        for (i, d) in dims.iter().enumerate() {
            let grid = format!("grid_size_{}", d);
            if config.get(&grid).is_none() {
                defines.push((grid, geometry.grid[i].to_string()));
            }
            let block = format!("block_size_{}", d);
            if config.get(&block).is_none() {
                defines.push((block, geometry.block[i].to_string()));
            }
        }

        let mut source = String::new();
        for (name, value) in &defines {
            source.push_str(&format!("#define {} {}\n", name, value));
        }
        source.push('\n');
        source.push_str(&self.code);

        PreparedKernel {
            name: self.name.clone(),
            source,
            defines,
            config: config.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VECTOR_ADD: &str = r#"
__global__ void vector_add(float *c, float *a, float *b, int n) {
    int i = blockIdx.x * block_size_x + threadIdx.x;
    if (i < n) { c[i] = a[i] + b[i]; }
}
"#;

    #[test]
    fn entry_point_must_exist() {
        assert!(KernelSource::from_string("vector_add", VECTOR_ADD).is_ok());
        assert!(KernelSource::from_string("vector", VECTOR_ADD).is_err());
        assert!(KernelSource::from_string("matmul", VECTOR_ADD).is_err());
    }

    #[test]
    fn missing_file_is_configuration_error() {
        let err = KernelSource::from_file("/nonexistent/kernel.cu", "k").unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn prepare_emits_defines() {
        let k = KernelSource::from_string("vector_add", VECTOR_ADD).unwrap();
        let cfg = Configuration::from_pairs([("block_size_x", 128)]);
        let geom = LaunchGeometry {
            block: [128, 1, 1],
            grid: [7813, 1, 1],
            shared_memory: 0,
        };
        let p = k.prepare(&cfg, &geom);
        assert!(p.source.starts_with("#define block_size_x 128\n"));
        assert!(p.source.contains("#define grid_size_x 7813\n"));
        assert!(p.source.contains("#define block_size_y 1\n"));
        assert_eq!(p.source.matches("#define block_size_x").count(), 1);
        assert!(p.source.ends_with(VECTOR_ADD));
    }
}
