use super::decomposition::DomainDecomposition;
use super::error::Error;
use crate::model::boxdim::BoxDim;
use serde::Deserialize;
use std::sync::OnceLock;

const DEFAULT_CONFIG_TOML: &str = include_str!("../../resources/default.config.toml");

static DEFAULT_CONFIG: OnceLock<StoreConfig> = OnceLock::new();

/// Growth factor applied to capacity when the arrays run out of room.
pub const DEFAULT_RESIZE_FACTOR: f64 = 9.0 / 8.0;

/// Declarative setup of a particle store.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_n_particles")]
    pub n_particles: usize,
    #[serde(default = "default_n_types")]
    pub n_types: usize,
    /// Explicit type names; generated as `A`, `B`, ... when empty.
    #[serde(default)]
    pub type_names: Vec<String>,
    /// Edge lengths of the origin-centered, fully periodic global box.
    #[serde(default = "default_box_length")]
    pub box_length: [f64; 3],
    #[serde(default = "default_resize_factor")]
    pub resize_factor: f64,
    /// Processor grid; `None` runs on a single rank without decomposition.
    #[serde(default)]
    pub grid: Option<[u32; 3]>,
}

fn default_n_particles() -> usize {
    1
}
fn default_n_types() -> usize {
    1
}
fn default_box_length() -> [f64; 3] {
    [10.0; 3]
}
fn default_resize_factor() -> f64 {
    DEFAULT_RESIZE_FACTOR
}

impl Default for StoreConfig {
    fn default() -> Self {
        get_default_config().clone()
    }
}

impl StoreConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.n_types == 0 {
            return Err(Error::ZeroTypes);
        }
        if !self.type_names.is_empty() && self.type_names.len() != self.n_types {
            return Err(Error::invalid_config(format!(
                "{} type names given for {} types",
                self.type_names.len(),
                self.n_types
            )));
        }
        if self.box_length.iter().any(|&l| !(l.is_finite() && l > 0.0)) {
            return Err(Error::invalid_config(format!(
                "box lengths must be positive, got {:?}",
                self.box_length
            )));
        }
        if !(self.resize_factor.is_finite() && self.resize_factor > 1.0) {
            return Err(Error::invalid_config(format!(
                "resize factor must exceed 1, got {}",
                self.resize_factor
            )));
        }
        if let Some(grid) = self.grid {
            DomainDecomposition::new(grid)?;
        }
        Ok(())
    }

    pub fn global_box(&self) -> BoxDim {
        BoxDim::new(self.box_length)
    }

    pub fn decomposition(&self) -> Result<Option<DomainDecomposition>, Error> {
        self.grid.map(DomainDecomposition::new).transpose()
    }

    /// Type table named by this configuration.
    pub fn type_mapping(&self) -> Vec<String> {
        if self.type_names.is_empty() {
            default_type_names(self.n_types)
        } else {
            self.type_names.clone()
        }
    }
}

/// Generates the type names `A`, `B`, ..., `Z`, `A1`, `B1`, ...
pub fn default_type_names(n_types: usize) -> Vec<String> {
    (0..n_types)
        .map(|i| {
            let letter = char::from(b'A' + (i % 26) as u8);
            match i / 26 {
                0 => letter.to_string(),
                round => format!("{letter}{round}"),
            }
        })
        .collect()
}

pub fn load_config(custom_toml: Option<&str>) -> Result<StoreConfig, Error> {
    let config = match custom_toml {
        Some(toml) => toml::from_str(toml)?,
        None => get_default_config().clone(),
    };
    config.validate()?;
    Ok(config)
}

pub fn get_default_config() -> &'static StoreConfig {
    DEFAULT_CONFIG.get_or_init(|| {
        toml::from_str(DEFAULT_CONFIG_TOML)
            .expect("Failed to parse embedded default configuration. This is a library bug.")
    })
}
