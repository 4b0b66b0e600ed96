//! Task and result value types produced by the sampling algorithm.
//!
//! The store treats these as opaque, hashable values. A task names the
//! restrictive formula module that generated it (`rfm_guid`) and carries that
//! module's parameters in a generic [`FormulaParams`] tuple; only the module's
//! own [`crate::rfm::RfmCodec`] knows what the tuple means.

use std::fmt;

/// One scalar in a formula module's parameter tuple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ParamValue {
    /// Signed integer parameter.
    Int(i64),
    /// Free-form text parameter.
    Text(String),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Text(v) => write!(f, "{v:?}"),
        }
    }
}

/// Module-specific formula parameters, interpreted only by the module's codec.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FormulaParams(pub Vec<ParamValue>);

impl FormulaParams {
    /// Creates a parameter tuple from its values.
    pub fn new(values: impl IntoIterator<Item = ParamValue>) -> Self {
        Self(values.into_iter().collect())
    }

    /// Returns the parameter values.
    pub fn values(&self) -> &[ParamValue] {
        &self.0
    }
}

/// Identifies one sampling task.
///
/// Equality and hashing are structural, so two tasks built from the same
/// module, parameters, and knobs are the same histogram key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RfBmcTask {
    /// Identifier of the restrictive formula module that produced the task.
    pub rfm_guid: String,
    /// Module-specific parameters.
    pub rfm_formula_params: FormulaParams,
    /// Number of random constraints.
    pub a: u32,
    /// Bound on the number of models searched for.
    pub q: u32,
}

impl RfBmcTask {
    /// Creates a new task.
    pub fn new(rfm_guid: impl Into<String>, rfm_formula_params: FormulaParams, a: u32, q: u32) -> Self {
        Self {
            rfm_guid: rfm_guid.into(),
            rfm_formula_params,
            a,
            q,
        }
    }
}

impl fmt::Display for RfBmcTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.rfm_guid)?;
        for (i, value) in self.rfm_formula_params.values().iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{value}")?;
        }
        write!(f, ") a={} q={}", self.a, self.q)
    }
}

/// Outcome of running a task once.
///
/// `bmc` is the bounded model count: the number of models found, up to the
/// task's `q`. `None` means the run ended without a count (e.g. it timed out).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RfBmcResult {
    /// Models found, or `None` when the run produced no count.
    pub bmc: Option<u64>,
}

impl RfBmcResult {
    /// Creates a result with a count.
    pub fn new(bmc: Option<u64>) -> Self {
        Self { bmc }
    }
}

impl fmt::Display for RfBmcResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.bmc {
            Some(count) => write!(f, "bmc={count}"),
            None => write!(f, "bmc=none"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_task_equality_is_structural() {
        let params = FormulaParams::new([ParamValue::Int(500)]);
        let t1 = RfBmcTask::new("xor", params.clone(), 3, 8);
        let t2 = RfBmcTask::new("xor", params, 3, 8);
        assert_eq!(t1, t2);

        let set: HashSet<_> = [t1, t2].into_iter().collect();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_task_display() {
        let task = RfBmcTask::new(
            "hash-family",
            FormulaParams::new([ParamValue::Text("tab".to_string()), ParamValue::Int(32)]),
            2,
            4,
        );
        assert_eq!(task.to_string(), "hash-family(\"tab\", 32) a=2 q=4");
    }

    #[test]
    fn test_result_display() {
        assert_eq!(RfBmcResult::new(Some(3)).to_string(), "bmc=3");
        assert_eq!(RfBmcResult::new(None).to_string(), "bmc=none");
    }
}
