//! Argument names, types and defaults of each service function.
//!
//! Defaults follow CmdStan, except `refresh` (progress granularity is ours
//! to choose) and `random_seed` (current unix time, like CmdStan, but only
//! ever filled in after the fit id has been computed).

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

use super::{ArgumentError, ServiceFunction};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    Int,
    UInt,
    Real,
    Bool,
}

impl ArgKind {
    fn expected(self) -> &'static str {
        match self {
            ArgKind::Int => "an integer",
            ArgKind::UInt => "a non-negative integer",
            ArgKind::Real => "a number",
            ArgKind::Bool => "a boolean",
        }
    }

    fn accepts(self, value: &Value) -> bool {
        match self {
            ArgKind::Int => value.as_i64().is_some(),
            ArgKind::UInt => value.as_u64().is_some(),
            ArgKind::Real => value.is_number(),
            ArgKind::Bool => value.is_boolean() || matches!(value.as_u64(), Some(0 | 1)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DefaultValue {
    Int(i64),
    Real(f64),
    Bool(bool),
    /// Seconds since the epoch at merge time.
    UnixTime,
}

impl DefaultValue {
    fn to_value(self) -> Value {
        match self {
            DefaultValue::Int(v) => Value::from(v),
            DefaultValue::Real(v) => Value::from(v),
            DefaultValue::Bool(v) => Value::from(v),
            DefaultValue::UnixTime => Value::from(
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs() & u64::from(u32::MAX))
                    .unwrap_or(0),
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArgumentSpec {
    pub name: &'static str,
    pub kind: ArgKind,
    pub default: DefaultValue,
}

const fn arg(name: &'static str, kind: ArgKind, default: DefaultValue) -> ArgumentSpec {
    ArgumentSpec {
        name,
        kind,
        default,
    }
}

const CHAIN: ArgumentSpec = arg("chain", ArgKind::UInt, DefaultValue::Int(1));
const RANDOM_SEED: ArgumentSpec = arg("random_seed", ArgKind::UInt, DefaultValue::UnixTime);
const INIT_RADIUS: ArgumentSpec = arg("init_radius", ArgKind::Real, DefaultValue::Real(2.0));
const NUM_WARMUP: ArgumentSpec = arg("num_warmup", ArgKind::UInt, DefaultValue::Int(1000));
const NUM_SAMPLES: ArgumentSpec = arg("num_samples", ArgKind::UInt, DefaultValue::Int(1000));
const NUM_THIN: ArgumentSpec = arg("num_thin", ArgKind::UInt, DefaultValue::Int(1));
const SAVE_WARMUP: ArgumentSpec = arg("save_warmup", ArgKind::Bool, DefaultValue::Bool(false));
const REFRESH: ArgumentSpec = arg("refresh", ArgKind::UInt, DefaultValue::Int(100));
const STEPSIZE: ArgumentSpec = arg("stepsize", ArgKind::Real, DefaultValue::Real(1.0));
const STEPSIZE_JITTER: ArgumentSpec = arg("stepsize_jitter", ArgKind::Real, DefaultValue::Real(0.0));
const MAX_DEPTH: ArgumentSpec = arg("max_depth", ArgKind::UInt, DefaultValue::Int(10));
const DELTA: ArgumentSpec = arg("delta", ArgKind::Real, DefaultValue::Real(0.8));
const GAMMA: ArgumentSpec = arg("gamma", ArgKind::Real, DefaultValue::Real(0.05));
const KAPPA: ArgumentSpec = arg("kappa", ArgKind::Real, DefaultValue::Real(0.75));
const T0: ArgumentSpec = arg("t0", ArgKind::Real, DefaultValue::Real(10.0));
const INIT_BUFFER: ArgumentSpec = arg("init_buffer", ArgKind::UInt, DefaultValue::Int(75));
const TERM_BUFFER: ArgumentSpec = arg("term_buffer", ArgKind::UInt, DefaultValue::Int(50));
const WINDOW: ArgumentSpec = arg("window", ArgKind::UInt, DefaultValue::Int(25));

static HMC_NUTS_DIAG_E: [ArgumentSpec; 11] = [
    CHAIN,
    RANDOM_SEED,
    INIT_RADIUS,
    NUM_WARMUP,
    NUM_SAMPLES,
    NUM_THIN,
    SAVE_WARMUP,
    REFRESH,
    STEPSIZE,
    STEPSIZE_JITTER,
    MAX_DEPTH,
];

static HMC_NUTS_DIAG_E_ADAPT: [ArgumentSpec; 18] = [
    CHAIN,
    RANDOM_SEED,
    INIT_RADIUS,
    NUM_WARMUP,
    NUM_SAMPLES,
    NUM_THIN,
    SAVE_WARMUP,
    REFRESH,
    STEPSIZE,
    STEPSIZE_JITTER,
    MAX_DEPTH,
    DELTA,
    GAMMA,
    KAPPA,
    T0,
    INIT_BUFFER,
    TERM_BUFFER,
    WINDOW,
];

static FIXED_PARAM: [ArgumentSpec; 6] = [
    CHAIN,
    RANDOM_SEED,
    INIT_RADIUS,
    NUM_SAMPLES,
    NUM_THIN,
    REFRESH,
];

pub(super) fn for_function(function: ServiceFunction) -> &'static [ArgumentSpec] {
    match function {
        ServiceFunction::HmcNutsDiagE => &HMC_NUTS_DIAG_E,
        ServiceFunction::HmcNutsDiagEAdapt => &HMC_NUTS_DIAG_E_ADAPT,
        ServiceFunction::FixedParam => &FIXED_PARAM,
    }
}

/// Reject names `function` does not take and values of the wrong type.
pub fn validate_arguments(
    function: ServiceFunction,
    arguments: &BTreeMap<String, Value>,
) -> Result<(), ArgumentError> {
    let specs = function.arguments();
    for (name, value) in arguments {
        let spec = specs
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| ArgumentError::UnknownArgument {
                function: function.full_name(),
                argument: name.clone(),
            })?;
        if !spec.kind.accepts(value) {
            return Err(ArgumentError::InvalidValue {
                argument: name.clone(),
                expected: spec.kind.expected(),
            });
        }
        if spec.name == RANDOM_SEED.name && value.as_u64().is_some_and(|v| v > u64::from(u32::MAX)) {
            return Err(ArgumentError::InvalidValue {
                argument: name.clone(),
                expected: "a 32-bit unsigned integer",
            });
        }
    }
    Ok(())
}

/// The full argument set a worker needs: caller values win, every other
/// argument of `function` gets its default.
pub fn merge_defaults(
    function: ServiceFunction,
    arguments: &BTreeMap<String, Value>,
) -> BTreeMap<String, Value> {
    let mut merged = arguments.clone();
    for spec in function.arguments() {
        merged
            .entry(spec.name.to_string())
            .or_insert_with(|| spec.default.to_value());
    }
    merged
}
