//! Step contract and flow definitions.
//!
//! A [`FlowDefinition`] declares a flow type, an initial step, and a map
//! from step name to step function. Step functions receive a read-only
//! view of the run plus the run's input payload and return a
//! [`StepOutcome`]. Definitions validate eagerly at registration time;
//! a broken definition is a fatal configuration error, never a run-time
//! fault.
//!
//! # Example
//!
//! ```rust,ignore
//! use flow_engine::definition::{FlowDefinition, StepOutcome};
//!
//! let def = FlowDefinition::new("counter", "increment")
//!     .step("increment", ["finish"], |_run, input| async move {
//!         let value = input["value"].as_i64().unwrap_or(0) + 1;
//!         StepOutcome::continue_to(["finish"], serde_json::json!({ "value": value }))
//!     })
//!     .step("finish", [], |_run, _input| async move {
//!         StepOutcome::complete(serde_json::json!({}))
//!     });
//!
//! def.validate()?;
//! ```

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::error::{FlowError, FlowResult};
use crate::store::FlowRun;

/// Result of executing a single step.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    /// Merge `output` into run state and advance to one of `next_steps`.
    /// The run stays RUNNING.
    Continue {
        next_steps: BTreeSet<String>,
        output: Value,
    },
    /// Merge `output` into run state and pause the run until resumed.
    Pause { output: Value },
    /// Merge `output` into run state and complete the run. Terminal.
    Complete { output: Value },
    /// Fail the run with the given message. Terminal.
    Fail { error: String },
}

impl StepOutcome {
    /// Continue to one of the given steps with a partial state update.
    pub fn continue_to<I, S>(next_steps: I, output: Value) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Continue {
            next_steps: next_steps.into_iter().map(Into::into).collect(),
            output,
        }
    }

    /// Pause the run with a partial state update.
    #[must_use]
    pub fn pause(output: Value) -> Self {
        Self::Pause { output }
    }

    /// Complete the run with a final state update.
    #[must_use]
    pub fn complete(output: Value) -> Self {
        Self::Complete { output }
    }

    /// Fail the run with an error message.
    pub fn fail(error: impl Into<String>) -> Self {
        Self::Fail {
            error: error.into(),
        }
    }
}

/// Boxed future returned by a step function.
pub type StepFuture = BoxFuture<'static, StepOutcome>;

/// A step function: `(run, input) -> StepOutcome`.
pub type StepFn = Arc<dyn Fn(FlowRun, Value) -> StepFuture + Send + Sync>;

/// One registered step: its function plus the successor steps it may
/// continue to. Successors are declared up front so the whole graph can
/// be validated before any run starts.
#[derive(Clone)]
pub struct StepDef {
    /// Step name.
    pub name: String,
    /// Steps this step may `Continue` to.
    pub next_steps: BTreeSet<String>,
    /// The step function.
    pub func: StepFn,
}

impl fmt::Debug for StepDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepDef")
            .field("name", &self.name)
            .field("next_steps", &self.next_steps)
            .finish_non_exhaustive()
    }
}

/// A named workflow definition: flow type, initial step, and step map.
#[derive(Clone)]
pub struct FlowDefinition {
    flow_type: String,
    initial_step: String,
    steps: HashMap<String, StepDef>,
}

impl fmt::Debug for FlowDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowDefinition")
            .field("flow_type", &self.flow_type)
            .field("initial_step", &self.initial_step)
            .field("steps", &self.steps.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl FlowDefinition {
    /// Create an empty definition with a flow type and initial step name.
    pub fn new(flow_type: impl Into<String>, initial_step: impl Into<String>) -> Self {
        Self {
            flow_type: flow_type.into(),
            initial_step: initial_step.into(),
            steps: HashMap::new(),
        }
    }

    /// Register a step with its declared successors.
    #[must_use]
    pub fn step<I, S, F, Fut>(mut self, name: impl Into<String>, next_steps: I, func: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(FlowRun, Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = StepOutcome> + Send + 'static,
    {
        let name = name.into();
        let step = StepDef {
            name: name.clone(),
            next_steps: next_steps.into_iter().map(Into::into).collect(),
            func: Arc::new(move |run, input| Box::pin(func(run, input))),
        };
        self.steps.insert(name, step);
        self
    }

    /// Flow type tag.
    #[must_use]
    pub fn flow_type(&self) -> &str {
        &self.flow_type
    }

    /// Initial step name.
    #[must_use]
    pub fn initial_step(&self) -> &str {
        &self.initial_step
    }

    /// Look up a step by name.
    #[must_use]
    pub fn get_step(&self, name: &str) -> Option<&StepDef> {
        self.steps.get(name)
    }

    /// Validate the definition.
    ///
    /// Checks that the initial step exists and that every declared
    /// successor resolves to a registered step.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::InvalidDefinition`] naming the offending step.
    pub fn validate(&self) -> FlowResult<()> {
        if self.steps.is_empty() {
            return Err(FlowError::InvalidDefinition(format!(
                "flow '{}' has no steps",
                self.flow_type
            )));
        }

        if !self.steps.contains_key(&self.initial_step) {
            return Err(FlowError::InvalidDefinition(format!(
                "flow '{}': initial step '{}' is not in the step map",
                self.flow_type, self.initial_step
            )));
        }

        for step in self.steps.values() {
            for next in &step.next_steps {
                if !self.steps.contains_key(next) {
                    return Err(FlowError::InvalidDefinition(format!(
                        "flow '{}': step '{}' continues to unknown step '{}'",
                        self.flow_type, step.name, next
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Registry of validated flow definitions, keyed by flow type.
#[derive(Clone, Default)]
pub struct FlowRegistry {
    definitions: HashMap<String, FlowDefinition>,
}

impl fmt::Debug for FlowRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowRegistry")
            .field("flow_types", &self.definitions.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl FlowRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition, validating it first.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::InvalidDefinition`] if validation fails or a
    /// definition for the same flow type is already registered.
    pub fn register(&mut self, definition: FlowDefinition) -> FlowResult<()> {
        definition.validate()?;
        let flow_type = definition.flow_type().to_string();
        if self.definitions.contains_key(&flow_type) {
            return Err(FlowError::InvalidDefinition(format!(
                "flow type '{flow_type}' registered twice"
            )));
        }
        self.definitions.insert(flow_type, definition);
        Ok(())
    }

    /// Look up a definition by flow type.
    #[must_use]
    pub fn get(&self, flow_type: &str) -> Option<&FlowDefinition> {
        self.definitions.get(flow_type)
    }

    /// Registered flow types.
    #[must_use]
    pub fn flow_types(&self) -> Vec<&str> {
        self.definitions.keys().map(String::as_str).collect()
    }
}
