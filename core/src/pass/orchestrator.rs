//! Dependency-ordered pass execution.
//!
//! The orchestrator filters the registry by configuration, resolves a
//! topological order over declared dependencies and conflicts, rejects
//! cycles before any mutation, and supervises each `apply` call.

use super::Pass;
use crate::context::ProtectionContext;
use crate::diagnostics::{codes, Diagnostic};
use crate::error::ProtectionError;
use crate::module::Module;
use modshield_config::DebugMode;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Outcome of one scheduled pass.
#[derive(Debug, Clone)]
pub struct PassRecord {
    pub id: String,
    pub applied: bool,
    pub duration: Duration,
}

/// Runs a set of passes over one module.
pub struct Orchestrator {
    passes: Vec<Box<dyn Pass>>,
}

impl Orchestrator {
    pub fn new(passes: Vec<Box<dyn Pass>>) -> Self {
        Self { passes }
    }

    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }

    /// Resolve a valid execution order.
    ///
    /// Edges run `dependency -> pass` and `conflict -> pass` (a conflicting
    /// pass, when present, executes first). Ties break by descending
    /// priority, then registration order. A cycle fails the run before any
    /// mutation.
    pub fn execution_order(&self) -> Result<Vec<usize>, ProtectionError> {
        let ids: HashMap<&str, usize> = self
            .passes
            .iter()
            .enumerate()
            .map(|(i, p)| (p.id(), i))
            .collect();

        let n = self.passes.len();
        let mut edges: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut indegree = vec![0usize; n];
        for (i, pass) in self.passes.iter().enumerate() {
            for before in pass.dependencies().iter().chain(pass.conflicts_with()) {
                // Edges only exist between enabled passes; a dependency on a
                // disabled pass imposes no ordering.
                if let Some(&from) = ids.get(*before) {
                    edges[from].push(i);
                    indegree[i] += 1;
                }
            }
        }

        if let Some(cycle) = find_cycle(&edges) {
            let names: Vec<&str> = cycle.iter().map(|&i| self.passes[i].id()).collect();
            return Err(ProtectionError::DependencyCycle(names.join(" -> ")));
        }

        // Kahn's algorithm; the ready set is re-sorted so ties resolve by
        // priority and then registration order, deterministically.
        let mut ready: Vec<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);
        while !ready.is_empty() {
            ready.sort_by_key(|&i| (-self.passes[i].priority(), i));
            let next = ready.remove(0);
            order.push(next);
            for &to in &edges[next] {
                indegree[to] -= 1;
                if indegree[to] == 0 {
                    ready.push(to);
                }
            }
        }
        debug_assert_eq!(order.len(), n);
        Ok(order)
    }

    /// Execute every pass in resolved order.
    ///
    /// Pass failures are recorded as error diagnostics and execution
    /// continues, unless debug mode is `Full`, in which case the failure
    /// propagates. The error is also returned in the record list via the
    /// caller inspecting diagnostics; fatal scheduling errors abort before
    /// any pass runs.
    pub fn run(
        &self,
        module: &mut Module,
        ctx: &mut ProtectionContext,
    ) -> Result<(Vec<PassRecord>, Vec<ProtectionError>), ProtectionError> {
        let order = self.execution_order()?;
        let mut records = Vec::with_capacity(order.len());
        let mut errors = Vec::new();

        for index in order {
            let pass = &self.passes[index];
            if !pass.can_apply(module) {
                log::debug!("skipping pass `{}`: nothing to do", pass.id());
                ctx.add_diagnostic(Diagnostic::info(
                    codes::PASS_SKIPPED,
                    format!("pass `{}` skipped: not applicable to this module", pass.id()),
                ));
                records.push(PassRecord {
                    id: pass.id().to_owned(),
                    applied: false,
                    duration: Duration::ZERO,
                });
                continue;
            }

            log::info!("running pass `{}`", pass.id());
            let start = Instant::now();
            let outcome = pass.apply(module, ctx);
            let duration = start.elapsed();

            match outcome {
                Ok(()) => {
                    ctx.mark_applied(pass.id());
                    records.push(PassRecord {
                        id: pass.id().to_owned(),
                        applied: true,
                        duration,
                    });
                }
                Err(e) => {
                    log::error!("pass `{}` failed: {e}", pass.id());
                    ctx.add_diagnostic(
                        Diagnostic::error(
                            codes::PASS_FAILED,
                            format!("pass `{}` failed: {e}", pass.id()),
                        )
                        .with_payload(serde_json::json!({ "pass": pass.id() })),
                    );
                    let error = ProtectionError::Pass {
                        id: pass.id().to_owned(),
                        source: e,
                    };
                    if ctx.config.debug_mode == DebugMode::Full {
                        return Err(error);
                    }
                    errors.push(error);
                    records.push(PassRecord {
                        id: pass.id().to_owned(),
                        applied: false,
                        duration,
                    });
                }
            }
        }
        Ok((records, errors))
    }
}

/// Depth-first cycle search tracking a recursion stack. Returns the nodes of
/// the first cycle found.
fn find_cycle(edges: &[Vec<usize>]) -> Option<Vec<usize>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        White,
        Grey,
        Black,
    }

    fn visit(
        node: usize,
        edges: &[Vec<usize>],
        marks: &mut [Mark],
        stack: &mut Vec<usize>,
    ) -> Option<Vec<usize>> {
        marks[node] = Mark::Grey;
        stack.push(node);
        for &next in &edges[node] {
            match marks[next] {
                Mark::Grey => {
                    let from = stack.iter().position(|&n| n == next).unwrap_or(0);
                    let mut cycle = stack[from..].to_vec();
                    cycle.push(next);
                    return Some(cycle);
                }
                Mark::White => {
                    if let Some(cycle) = visit(next, edges, marks, stack) {
                        return Some(cycle);
                    }
                }
                Mark::Black => {}
            }
        }
        stack.pop();
        marks[node] = Mark::Black;
        None
    }

    let mut marks = vec![Mark::White; edges.len()];
    let mut stack = Vec::new();
    for node in 0..edges.len() {
        if marks[node] == Mark::White {
            if let Some(cycle) = visit(node, edges, &mut marks, &mut stack) {
                return Some(cycle);
            }
        }
    }
    None
}
