//! The stage graph: registered stages, guarded routes and loop descriptors.
//!
//! ## Architecture
//!
//! 1. **Builder** - collects stages, routes and loops and validates them once
//! 2. **Router** - picks the first route out of a stage whose guard holds
//! 3. **Loop Controller** - counts loop entries and escalates at the bound
//!
//! All configuration errors (ties, gaps, dead ends, unknown stages, inputs no
//! one writes) surface from [`GraphBuilder::build`], never mid-run.

mod guard;
mod loops;

pub use guard::{Dimension, Guard};
pub use loops::{LoopBounds, LoopController, LoopDescriptor, Step};

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::errors::{GraphError, RoutingError};
use crate::stage::{Stage, StageKind};
use crate::state::{Field, LoopKind, StageName, StateContainer};

/// Directed edge `from --guard--> to`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub from: StageName,
    pub guard: Guard,
    pub to: StageName,
}

/// Outgoing routes per stage, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct Router {
    routes: HashMap<StageName, Vec<Route>>,
}

impl Router {
    pub fn routes_from(&self, stage: &StageName) -> &[Route] {
        self.routes.get(stage).map_or(&[], |v| v.as_slice())
    }

    /// First route out of `stage` whose guard holds.
    pub fn route(&self, stage: &StageName, state: &StateContainer) -> Result<StageName, RoutingError> {
        self.routes_from(stage)
            .iter()
            .find(|r| r.guard.holds(state))
            .map(|r| r.to.clone())
            .ok_or_else(|| RoutingError {
                stage: stage.clone(),
            })
    }
}

/// A validated, immutable stage graph.
pub struct StageGraph {
    stages: HashMap<StageName, Arc<dyn Stage>>,
    order: Vec<StageName>,
    router: Router,
    loops: LoopController,
    entry: StageName,
    terminal: StageName,
}

impl std::fmt::Debug for StageGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageGraph")
            .field("stages", &self.order)
            .field("entry", &self.entry)
            .field("terminal", &self.terminal)
            .finish()
    }
}

impl StageGraph {
    pub fn entry(&self) -> &StageName {
        &self.entry
    }

    pub fn terminal(&self) -> &StageName {
        &self.terminal
    }

    pub fn is_terminal(&self, stage: &StageName) -> bool {
        *stage == self.terminal
    }

    pub fn stage(&self, name: &StageName) -> Option<&Arc<dyn Stage>> {
        self.stages.get(name)
    }

    /// Stage names in registration order.
    pub fn stage_names(&self) -> &[StageName] {
        &self.order
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn loops(&self) -> &LoopController {
        &self.loops
    }

    /// Route out of `from`, then apply loop accounting.
    pub fn next_step(&self, from: &StageName, state: &StateContainer) -> Result<Step, RoutingError> {
        let target = self.router.route(from, state)?;
        Ok(self.loops.decide(target, state))
    }
}

pub struct GraphBuilder {
    entry: StageName,
    terminal: StageName,
    stages: Vec<Arc<dyn Stage>>,
    routes: Vec<Route>,
    loops: Vec<LoopDescriptor>,
}

impl GraphBuilder {
    pub fn new(entry: impl Into<StageName>, terminal: impl Into<StageName>) -> Self {
        Self {
            entry: entry.into(),
            terminal: terminal.into(),
            stages: Vec::new(),
            routes: Vec::new(),
            loops: Vec::new(),
        }
    }

    pub fn stage(mut self, stage: Arc<dyn Stage>) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn stages(mut self, stages: impl IntoIterator<Item = Arc<dyn Stage>>) -> Self {
        self.stages.extend(stages);
        self
    }

    pub fn route(mut self, from: impl Into<StageName>, guard: Guard, to: impl Into<StageName>) -> Self {
        self.routes.push(Route {
            from: from.into(),
            guard,
            to: to.into(),
        });
        self
    }

    pub fn with_loop(mut self, descriptor: LoopDescriptor) -> Self {
        self.loops.push(descriptor);
        self
    }

    /// Validate and freeze the graph.
    pub fn build(self) -> Result<StageGraph, GraphError> {
        let mut stages: HashMap<StageName, Arc<dyn Stage>> = HashMap::new();
        let mut order = Vec::with_capacity(self.stages.len());
        for stage in self.stages {
            let name = stage.definition().name().clone();
            if stages.contains_key(&name) {
                return Err(GraphError::DuplicateStage(name));
            }
            order.push(name.clone());
            stages.insert(name, stage);
        }

        if !stages.contains_key(&self.entry) {
            return Err(GraphError::MissingEntry(self.entry));
        }
        if !stages.contains_key(&self.terminal) {
            return Err(GraphError::MissingTerminal(self.terminal));
        }

        let mut routes: HashMap<StageName, Vec<Route>> = HashMap::new();
        for route in self.routes {
            if !stages.contains_key(&route.from) {
                return Err(GraphError::UnknownSource(route.from));
            }
            if !stages.contains_key(&route.to) {
                return Err(GraphError::UnknownTarget {
                    from: route.from,
                    to: route.to,
                });
            }
            routes.entry(route.from.clone()).or_default().push(route);
        }

        for name in &order {
            let outgoing = routes.get(name).map_or(&[][..], |v| v.as_slice());
            if *name == self.terminal {
                if !outgoing.is_empty() {
                    return Err(GraphError::TerminalHasRoutes(name.clone()));
                }
                continue;
            }
            if outgoing.is_empty() {
                return Err(GraphError::DeadEnd(name.clone()));
            }
            check_guards(name, outgoing)?;
        }

        check_inputs(&order, &stages)?;
        check_categories(&order, &stages)?;

        for lp in &self.loops {
            let label = lp.kind.as_str().to_string();
            for stage in [&lp.entry, &lp.exit, &lp.escalation] {
                if !stages.contains_key(stage) {
                    return Err(GraphError::UnknownLoopStage {
                        name: label,
                        stage: stage.clone(),
                    });
                }
            }
            if lp.bound == 0 {
                return Err(GraphError::ZeroLoopBound { name: label });
            }
        }

        Ok(StageGraph {
            stages,
            order,
            router: Router { routes },
            loops: LoopController::new(self.loops),
            entry: self.entry,
            terminal: self.terminal,
        })
    }
}

/// Exactly one route out of a stage must match any state.
fn check_guards(stage: &StageName, outgoing: &[Route]) -> Result<(), GraphError> {
    for (i, a) in outgoing.iter().enumerate() {
        for b in &outgoing[i + 1..] {
            if a.guard.overlaps(&b.guard) {
                return Err(GraphError::AmbiguousRoutes {
                    stage: stage.clone(),
                    first: a.guard.to_string(),
                    second: b.guard.to_string(),
                });
            }
        }
    }

    // With no overlaps, a lone Always covers everything and any other guard
    // needs its complement alongside it.
    let guards: BTreeSet<&'static str> = outgoing.iter().map(|r| r.guard.as_str()).collect();
    for route in outgoing {
        if let Some(complement) = route.guard.complement() {
            if !guards.contains(complement.as_str()) {
                return Err(GraphError::IncompleteRoutes {
                    stage: stage.clone(),
                    missing: complement.to_string(),
                });
            }
        }
    }
    Ok(())
}

/// Every declared input must be written by some stage or come with the order.
fn check_inputs(
    order: &[StageName],
    stages: &HashMap<StageName, Arc<dyn Stage>>,
) -> Result<(), GraphError> {
    let written: BTreeSet<Field> = stages
        .values()
        .flat_map(|s| s.definition().output_fields().iter().copied())
        .collect();
    for name in order {
        let Some(stage) = stages.get(name) else {
            continue;
        };
        for field in stage.definition().input_fields() {
            if !field.provided_by_order() && !written.contains(field) {
                return Err(GraphError::UnsatisfiedInput {
                    stage: name.clone(),
                    field: *field,
                });
            }
        }
    }
    Ok(())
}

/// Validating stages may only write assessments.
fn check_categories(
    order: &[StageName],
    stages: &HashMap<StageName, Arc<dyn Stage>>,
) -> Result<(), GraphError> {
    for name in order {
        let Some(stage) = stages.get(name) else {
            continue;
        };
        let def = stage.definition();
        if def.kind() != StageKind::Validating {
            continue;
        }
        if let Some(field) = def.output_fields().iter().find(|f| !f.is_assessment()) {
            return Err(GraphError::ContentFromValidator {
                stage: name.clone(),
                field: *field,
            });
        }
    }
    Ok(())
}

/// The standard order-to-document pipeline over the given stages.
pub fn standard_graph(
    stages: Vec<Arc<dyn Stage>>,
    bounds: LoopBounds,
) -> Result<StageGraph, GraphError> {
    use crate::stage::names::*;

    GraphBuilder::new(ANALYZE_REQUIREMENTS, FINISH)
        .stages(stages)
        .route(ANALYZE_REQUIREMENTS, Guard::Always, WRITE_DRAFT)
        .route(WRITE_DRAFT, Guard::Always, INTEGRATE_CITATIONS)
        .route(INTEGRATE_CITATIONS, Guard::Always, CHECK_WORD_COUNT)
        .route(CHECK_WORD_COUNT, Guard::WordCountInWindow, CHECK_QUALITY)
        .route(CHECK_WORD_COUNT, Guard::WordCountOutsideWindow, ADJUST_LENGTH)
        .route(ADJUST_LENGTH, Guard::Always, CHECK_WORD_COUNT)
        .route(CHECK_QUALITY, Guard::QualityPassed, CHECK_ORIGINALITY)
        .route(CHECK_QUALITY, Guard::QualityFailed, REVISE)
        .route(REVISE, Guard::Always, REAPPLY_CITATIONS)
        .route(REAPPLY_CITATIONS, Guard::Always, CHECK_QUALITY)
        .route(CHECK_ORIGINALITY, Guard::OriginalityWithinThreshold, VERIFY_QUALITY)
        .route(CHECK_ORIGINALITY, Guard::OriginalityAboveThreshold, HUMANIZE)
        .route(HUMANIZE, Guard::Always, CHECK_ORIGINALITY)
        // Humanizing may break rules or drift the length; fixes keep its voice.
        .route(VERIFY_QUALITY, Guard::QualityPassed, VERIFY_WORD_COUNT)
        .route(VERIFY_QUALITY, Guard::QualityFailed, REPAIR_QUALITY)
        .route(REPAIR_QUALITY, Guard::Always, VERIFY_QUALITY)
        .route(VERIFY_WORD_COUNT, Guard::WordCountInWindow, GENERATE_REFERENCES)
        .route(VERIFY_WORD_COUNT, Guard::WordCountOutsideWindow, FIT_LENGTH)
        .route(FIT_LENGTH, Guard::Always, VERIFY_QUALITY)
        .route(GENERATE_REFERENCES, Guard::Always, FINISH)
        .with_loop(LoopDescriptor {
            kind: LoopKind::Length,
            entry: ADJUST_LENGTH.into(),
            exit: CHECK_QUALITY.into(),
            bound: bounds.length,
            termination: Guard::WordCountInWindow,
            escalation: CHECK_QUALITY.into(),
        })
        .with_loop(LoopDescriptor {
            kind: LoopKind::Quality,
            entry: REVISE.into(),
            exit: CHECK_ORIGINALITY.into(),
            bound: bounds.quality,
            termination: Guard::QualityPassed,
            escalation: CHECK_ORIGINALITY.into(),
        })
        .with_loop(LoopDescriptor {
            kind: LoopKind::Originality,
            entry: HUMANIZE.into(),
            exit: VERIFY_QUALITY.into(),
            bound: bounds.originality,
            termination: Guard::OriginalityWithinThreshold,
            escalation: VERIFY_QUALITY.into(),
        })
        .with_loop(LoopDescriptor {
            kind: LoopKind::Quality,
            entry: REPAIR_QUALITY.into(),
            exit: VERIFY_WORD_COUNT.into(),
            bound: bounds.quality,
            termination: Guard::QualityPassed,
            escalation: VERIFY_WORD_COUNT.into(),
        })
        .with_loop(LoopDescriptor {
            kind: LoopKind::Length,
            entry: FIT_LENGTH.into(),
            exit: GENERATE_REFERENCES.into(),
            bound: bounds.length,
            termination: Guard::WordCountInWindow,
            escalation: GENERATE_REFERENCES.into(),
        })
        .build()
}
