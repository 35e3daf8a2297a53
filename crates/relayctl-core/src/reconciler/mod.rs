//! Pass orchestration.
//!
//! Thin composition of snapshot, plan, and execute. Entry gates (privilege,
//! platform) and the advisory lock are the caller's responsibility — they
//! depend on process identity and must not fire inside tests driving these
//! functions with fakes.

use secrecy::SecretString;

use crate::apply::Applier;
use crate::artifact::ArtifactSource;
use crate::error::ReconcileError;
use crate::exec::CommandRunner;
use crate::observe::Inspector;
use crate::plan::{plan_convergence, plan_teardown, ActionPlan, RemovalScope};
use crate::target::TargetState;
use crate::teardown::{run_teardown, TeardownReport};

/// Outcome of a convergence pass, for operator-facing reporting.
#[derive(Debug)]
pub struct ConvergeSummary {
    /// Steps applied, in order.
    pub applied: Vec<String>,
    /// Number of state-mutating steps in the plan.
    pub mutating_steps: usize,
    /// Plaintext credential generated this pass, surfaced exactly once.
    pub generated_credential: Option<SecretString>,
    /// True when the host already satisfied the target.
    pub already_converged: bool,
}

/// Snapshot and diff without applying; the `--dry-run` path.
///
/// # Errors
///
/// Returns an error when the host cannot be inspected.
pub fn preview<I: Inspector>(
    inspector: &I,
    target: &TargetState,
) -> Result<ActionPlan, ReconcileError> {
    let observed = inspector.observe(target)?;
    Ok(plan_convergence(target, &observed))
}

/// Run one full convergence pass.
///
/// # Errors
///
/// Fails fast on the first failing step; see `apply`.
pub fn converge<I, R, A>(
    inspector: &I,
    runner: &R,
    artifacts: &A,
    target: &TargetState,
) -> Result<ConvergeSummary, ReconcileError>
where
    I: Inspector,
    R: CommandRunner,
    A: ArtifactSource,
{
    let observed = inspector.observe(target)?;
    let plan = plan_convergence(target, &observed);
    let mutating_steps = plan.mutating_len();
    let outcome = Applier::new(runner, artifacts).apply(target, &plan)?;

    Ok(ConvergeSummary {
        applied: outcome.applied,
        mutating_steps,
        generated_credential: outcome.generated_credential,
        already_converged: outcome.noop,
    })
}

/// Run one full divergence pass. Never fails; the report carries what
/// could not be removed.
pub fn diverge<R: CommandRunner>(
    runner: &R,
    target: &TargetState,
    scope: RemovalScope,
    purge: bool,
) -> TeardownReport {
    let plan = plan_teardown(target, scope, purge);
    run_teardown(runner, &plan)
}
