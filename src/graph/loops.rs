//! Bounded feedback loops layered over plain routing.

use serde::{Deserialize, Serialize};

use super::Guard;
use crate::state::{ControlUpdate, LoopKind, StageName, StateContainer};

/// Iteration bounds per loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopBounds {
    pub length: u32,
    pub quality: u32,
    pub originality: u32,
}

impl Default for LoopBounds {
    fn default() -> Self {
        Self {
            length: 50,
            quality: 50,
            originality: 20,
        }
    }
}

impl LoopBounds {
    pub fn get(&self, kind: LoopKind) -> u32 {
        match kind {
            LoopKind::Length => self.length,
            LoopKind::Quality => self.quality,
            LoopKind::Originality => self.originality,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoopDescriptor {
    pub kind: LoopKind,
    /// Stage whose selection by the router counts one iteration.
    pub entry: StageName,
    /// Stage reached when `termination` holds.
    pub exit: StageName,
    pub bound: u32,
    pub termination: Guard,
    /// Stage taken instead of `entry` once the bound is exhausted.
    pub escalation: StageName,
}

/// Where routing goes next, plus the bookkeeping to record first.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub next: StageName,
    pub updates: Vec<ControlUpdate>,
}

impl Step {
    pub fn plain(next: StageName) -> Self {
        Self {
            next,
            updates: Vec::new(),
        }
    }

    pub fn escalated(&self) -> Option<LoopKind> {
        self.updates.iter().find_map(|u| match u {
            ControlUpdate::Escalated(kind) => Some(*kind),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoopController {
    loops: Vec<LoopDescriptor>,
}

impl LoopController {
    pub fn new(loops: Vec<LoopDescriptor>) -> Self {
        Self { loops }
    }

    pub fn loops(&self) -> &[LoopDescriptor] {
        &self.loops
    }

    pub fn get(&self, kind: LoopKind) -> Option<&LoopDescriptor> {
        self.loops.iter().find(|l| l.kind == kind)
    }

    /// Apply loop accounting to the router's choice of `target`.
    pub fn decide(&self, target: StageName, state: &StateContainer) -> Step {
        if let Some(lp) = self.loops.iter().find(|l| l.exit == target) {
            if state.loops().get(lp.kind) > 0 && lp.termination.holds(state) {
                tracing::debug!(
                    kind = lp.kind.as_str(),
                    iterations = state.loops().get(lp.kind),
                    "Loop closed"
                );
            }
        }

        let Some(lp) = self.loops.iter().find(|l| l.entry == target) else {
            return Step::plain(target);
        };

        let count = state.loops().get(lp.kind);
        if count >= lp.bound {
            tracing::warn!(
                kind = lp.kind.as_str(),
                bound = lp.bound,
                escalation = %lp.escalation,
                "Loop bound reached, escalating"
            );
            return Step {
                next: lp.escalation.clone(),
                updates: vec![ControlUpdate::Escalated(lp.kind)],
            };
        }

        Step {
            next: target,
            updates: vec![ControlUpdate::LoopEntered(lp.kind)],
        }
    }
}
