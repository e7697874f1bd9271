//! Closed registry of the service functions a model can run.
//!
//! Requests name a function by string; the name is resolved here, once, at
//! the validation boundary. Everything downstream works with
//! [`ServiceFunction`].

pub mod arguments;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use arguments::{ArgKind, ArgumentSpec, merge_defaults, validate_arguments};

const NAMESPACE: &str = "stan::services::sample::";

/// Short alias accepted for the default adaptive sampler.
pub const SAMPLE_ALIAS: &str = "sample";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArgumentError {
    #[error("unknown function `{0}`")]
    UnknownFunction(String),
    #[error("`{function}` does not take argument `{argument}`")]
    UnknownArgument {
        function: &'static str,
        argument: String,
    },
    #[error("argument `{argument}` must be {expected}")]
    InvalidValue {
        argument: String,
        expected: &'static str,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceFunction {
    /// NUTS with a diagonal metric, no adaptation.
    HmcNutsDiagE,
    /// NUTS with a diagonal metric and warm-up adaptation.
    HmcNutsDiagEAdapt,
    /// Draws with all parameters held at their initial values.
    FixedParam,
}

impl ServiceFunction {
    pub const ALL: [ServiceFunction; 3] = [
        ServiceFunction::HmcNutsDiagE,
        ServiceFunction::HmcNutsDiagEAdapt,
        ServiceFunction::FixedParam,
    ];

    /// Accepts the fully qualified name, the basename, or `sample`.
    pub fn parse(name: &str) -> Result<Self, ArgumentError> {
        let trimmed = name.trim();
        if trimmed == SAMPLE_ALIAS {
            return Ok(ServiceFunction::HmcNutsDiagEAdapt);
        }
        let base = trimmed.strip_prefix(NAMESPACE).unwrap_or(trimmed);
        Self::ALL
            .into_iter()
            .find(|f| f.basename() == base)
            .ok_or_else(|| ArgumentError::UnknownFunction(name.to_string()))
    }

    pub fn basename(self) -> &'static str {
        match self {
            ServiceFunction::HmcNutsDiagE => "hmc_nuts_diag_e",
            ServiceFunction::HmcNutsDiagEAdapt => "hmc_nuts_diag_e_adapt",
            ServiceFunction::FixedParam => "fixed_param",
        }
    }

    /// Canonical name; the one that goes into fit ids.
    pub fn full_name(self) -> &'static str {
        match self {
            ServiceFunction::HmcNutsDiagE => "stan::services::sample::hmc_nuts_diag_e",
            ServiceFunction::HmcNutsDiagEAdapt => "stan::services::sample::hmc_nuts_diag_e_adapt",
            ServiceFunction::FixedParam => "stan::services::sample::fixed_param",
        }
    }

    pub fn arguments(self) -> &'static [ArgumentSpec] {
        arguments::for_function(self)
    }

    /// Whether the run has a warm-up adaptation report in its sample stream.
    pub fn adapts(self) -> bool {
        matches!(self, ServiceFunction::HmcNutsDiagEAdapt)
    }
}

impl fmt::Display for ServiceFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.full_name())
    }
}
