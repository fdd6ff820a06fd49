// config.rs — JSON deployment plans
//
// A plan bundles everything a run needs: the initial context (types and
// buffers), the scheduled operations with their kernel fragments, and the
// pass pipeline. Tiling solutions are recorded in the plan next to the
// fragment they belong to.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::block::{CodeFragment, ExecutionBlock, TileAnnotation};
use crate::closure::{ClosureGeneration, ClosureTemplates, MemoryRegions};
use crate::context::NetworkContext;
use crate::diag::CompileError;
use crate::future::{FutureResolution, FutureTemplates};
use crate::memory::{MemoryManagement, MemoryTemplates, StructInitialization};
use crate::pass::{CodeTransformationPass, Verbosity};
use crate::pipeline::{CodeTransformation, ScheduledOperation};
use crate::template::{Bindings, Template};
use crate::tiling::{
    MemcpyTransfer, MemoryConstraint, PrecomputedTiling, TileLoopGeneration,
    TilingVariableReplacement, VariableReplacementUpdate,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentPlan {
    #[serde(default)]
    pub context: NetworkContext,
    pub operations: Vec<OperationPlan>,
    pub pipeline: Vec<PassConfig>,
    #[serde(default)]
    pub verbosity: Verbosity,
    /// Name of the generated entry function.
    #[serde(default = "default_entry")]
    pub entry: String,
}

fn default_entry() -> String {
    "dlc_run".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationPlan {
    pub name: String,
    pub fragments: Vec<FragmentPlan>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FragmentPlan {
    pub template: String,
    #[serde(default)]
    pub bindings: Bindings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tiling: Option<TilingPlan>,
}

/// Memory constraint of a kernel and the solver's answer for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TilingPlan {
    pub constraint: MemoryConstraint,
    #[serde(flatten)]
    pub solution: PrecomputedTiling,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "pass", rename_all = "snake_case")]
pub enum PassConfig {
    TilingVariableReplacement {
        level: String,
    },
    VariableReplacementUpdate,
    TileLoopGeneration {
        /// Copy tiles in and out with `memcpy` around each iteration.
        #[serde(default)]
        transfers: bool,
        #[serde(default)]
        open: Option<String>,
        #[serde(default)]
        close: Option<String>,
    },
    FutureResolution {
        #[serde(default)]
        templates: FutureTemplates,
    },
    ClosureGeneration {
        #[serde(default)]
        write_back: bool,
        /// Restrict packaged buffers to a level window.
        #[serde(default)]
        regions: Option<MemoryRegions>,
        #[serde(default)]
        templates: ClosureTemplates,
        /// Lifetime code for buffers outside `regions`.
        #[serde(default)]
        memory: MemoryTemplates,
    },
    StructInitialization {
        #[serde(default)]
        template: Option<String>,
    },
    MemoryManagement {
        #[serde(default)]
        templates: MemoryTemplates,
    },
    MemoryPassthrough,
}

impl PassConfig {
    pub fn build(&self) -> Box<dyn CodeTransformationPass> {
        match self {
            PassConfig::TilingVariableReplacement { level } => {
                Box::new(TilingVariableReplacement::new(level.clone()))
            }
            PassConfig::VariableReplacementUpdate => Box::new(VariableReplacementUpdate::default()),
            PassConfig::TileLoopGeneration {
                transfers,
                open,
                close,
            } => {
                let mut pass = TileLoopGeneration::default();
                if let (Some(open), Some(close)) = (open, close) {
                    pass = pass.with_templates(Template::new(open.as_str()), Template::new(close.as_str()));
                }
                if *transfers {
                    pass = pass.with_transfers(Arc::new(MemcpyTransfer));
                }
                Box::new(pass)
            }
            PassConfig::FutureResolution { templates } => {
                Box::new(FutureResolution::new(templates.clone()))
            }
            PassConfig::ClosureGeneration {
                write_back,
                regions,
                templates,
                memory,
            } => {
                let mut pass = ClosureGeneration::new(templates.clone())
                    .with_write_back(*write_back)
                    .with_memory_templates(memory.clone());
                if let Some(regions) = regions {
                    pass = pass.memory_aware(regions.clone());
                }
                Box::new(pass)
            }
            PassConfig::StructInitialization { template } => match template {
                Some(t) => Box::new(StructInitialization::new(Template::new(t.as_str()))),
                None => Box::new(StructInitialization::default()),
            },
            PassConfig::MemoryManagement { templates } => {
                Box::new(MemoryManagement::new(templates.clone()))
            }
            PassConfig::MemoryPassthrough => Box::new(MemoryManagement::passthrough()),
        }
    }
}

impl FragmentPlan {
    fn fragment(&self) -> CodeFragment {
        let fragment = CodeFragment::new(Template::new(self.template.as_str()), self.bindings.clone());
        match &self.tiling {
            Some(plan) => fragment.with_tiling(TileAnnotation {
                constraint: plan.constraint.clone(),
                solver: Arc::new(plan.solution.clone()),
            }),
            None => fragment,
        }
    }
}

impl OperationPlan {
    pub fn scheduled(&self) -> ScheduledOperation {
        ScheduledOperation {
            name: self.name.clone(),
            block: ExecutionBlock::from_fragments(self.fragments.iter().map(FragmentPlan::fragment)),
        }
    }
}

impl DeploymentPlan {
    pub fn from_json(json: &str) -> Result<Self, CompileError> {
        let mut plan: DeploymentPlan =
            serde_json::from_str(json).map_err(|e| CompileError::Serialization(e.to_string()))?;
        plan.context.validate()?;
        plan.context.reindex();
        Ok(plan)
    }

    pub fn transformation(&self) -> CodeTransformation {
        let mut pipeline = CodeTransformation::new();
        for pass in &self.pipeline {
            pipeline.push(pass.build());
        }
        pipeline
    }

    pub fn schedule(&self) -> Vec<ScheduledOperation> {
        self.operations.iter().map(OperationPlan::scheduled).collect()
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pass::PassId;

    const PLAN: &str = r#"{
        "context": {
            "types": { "descs": [ { "Float": { "width": 32, "mantissa": 23, "exponent": 8 } } ] },
            "locals": { "entries": [
                { "name": "x", "ty": 0, "size": 64, "users": ["relu"] },
                { "name": "y", "ty": 0, "size": 64, "users": [] }
            ] }
        },
        "operations": [
            { "name": "relu", "fragments": [
                { "template": "relu(${in}, ${out});",
                  "bindings": { "in": { "name": "x" }, "out": { "name": "y" } } }
            ] }
        ],
        "pipeline": [
            { "pass": "closure_generation", "write_back": false },
            { "pass": "struct_initialization" },
            { "pass": "memory_passthrough" }
        ]
    }"#;

    #[test]
    fn plan_parses_with_defaults() {
        let plan = DeploymentPlan::from_json(PLAN).unwrap();
        assert_eq!(plan.entry, "dlc_run");
        assert!(!plan.verbosity.annotate);
        let x = plan.context.lookup("x").unwrap();
        assert!(x.deploy && !x.live);
        assert_eq!(
            plan.transformation().pass_ids(),
            vec![
                PassId::ClosureGeneration,
                PassId::StructInitialization,
                PassId::MemoryPassthrough
            ]
        );
        assert_eq!(plan.schedule()[0].block.len(), 1);
    }

    #[test]
    fn unknown_pass_is_a_serialization_error() {
        let bad = PLAN.replace("memory_passthrough", "memory_magic");
        assert!(matches!(
            DeploymentPlan::from_json(&bad),
            Err(CompileError::Serialization(_))
        ));
    }

    #[test]
    fn zero_width_descriptor_is_rejected_on_load() {
        let bad = PLAN.replace(
            r#"{ "Float": { "width": 32, "mantissa": 23, "exponent": 8 } }"#,
            r#"{ "Int": { "width": 0, "signed": true } }"#,
        );
        assert_ne!(bad, PLAN);
        assert!(matches!(
            DeploymentPlan::from_json(&bad),
            Err(CompileError::InvalidType { .. })
        ));
    }

    #[test]
    fn tiling_plan_flattens_solution() {
        let json = r#"{
            "template": "k(${in});",
            "bindings": { "in": { "name": "x" } },
            "tiling": {
                "constraint": { "tensors": { "x": { "levels": { "L1": { "offset": 0, "length": 32 } } } } },
                "schedules": [ { "input_base_offsets": { "in": [0, 32] } } ]
            }
        }"#;
        let plan: FragmentPlan = serde_json::from_str(json).unwrap();
        let tiling = plan.tiling.as_ref().unwrap();
        assert_eq!(tiling.solution.schedules[0].num_tiles(), Some(2));
        assert!(plan.fragment().tiling.is_some());
    }
}
