//! Budget-conservation invariants.
//!
//! `check_*` return an error describing the first broken rule; restore uses
//! them to reject inconsistent stores. The `assert_*` helpers wrap them for
//! tests and add the cross-snapshot rules (monotonic counters, immutable
//! fields).

use crate::errors::{LedgerError, Result};
use crate::package::Package;
use crate::project::Project;
use crate::types::{PackageState, ProjectState};

fn violated(rule: &str, detail: String) -> LedgerError {
    LedgerError::invariant(format!("{rule}: {detail}"))
}

/// Pool bounds, reservation bounds and roster-derived counters of one package.
pub fn check_package(package: &Package) -> Result<()> {
    let id = package.id();
    let pools = [
        ("mgp", package.mgp_paid(), package.mgp_budget()),
        ("bonus", package.bonus_paid(), package.bonus_budget()),
        (
            "observer fee",
            package.observer_fee_paid(),
            package.observer_fee_budget(),
        ),
    ];
    for (pool, paid, budget) in pools {
        if paid > budget {
            return Err(violated(
                "paid within budget",
                format!("package {id} {pool} paid {paid} > budget {budget}"),
            ));
        }
    }
    if package.mgp_reserved() > package.mgp_budget() {
        return Err(violated(
            "reservation within mgp budget",
            format!(
                "package {id} reserved {} > {}",
                package.mgp_reserved(),
                package.mgp_budget()
            ),
        ));
    }
    if package.budget_returned() > package.total_budget() {
        return Err(violated(
            "returned within total",
            format!("package {id} returned {}", package.budget_returned()),
        ));
    }
    if package.spent() > package.live_budget() {
        return Err(violated(
            "spent within live budget",
            format!(
                "package {id} spent {} > live {}",
                package.spent(),
                package.live_budget()
            ),
        ));
    }
    if package.state() == PackageState::Active && package.budget_returned() != 0 {
        return Err(violated(
            "active packages hold their full budget",
            format!("package {id} returned {}", package.budget_returned()),
        ));
    }
    if package.total_bonus_scores() > package.max_bonus_scores() || package.max_bonus_scores() == 0
    {
        return Err(violated(
            "scores within denominator",
            format!(
                "package {id} scores {} / {}",
                package.total_bonus_scores(),
                package.max_bonus_scores()
            ),
        ));
    }

    let collaborators = package.collaborators();
    let observers = package.observers();
    if collaborators.len() as u64 != package.collaborator_count()
        || observers.len() as u64 != package.observer_count()
    {
        return Err(violated(
            "roster matches counters",
            format!(
                "package {id} has {} collaborators / {} observers, counters say {} / {}",
                collaborators.len(),
                observers.len(),
                package.collaborator_count(),
                package.observer_count()
            ),
        ));
    }
    if collaborators.total_scores() != package.total_bonus_scores() {
        return Err(violated(
            "score sum matches roster",
            format!("package {id}"),
        ));
    }

    let mut reserved = 0u128;
    let mut mgp_paid = 0u128;
    let mut bonus_paid = 0u128;
    for collaborator in collaborators.iter() {
        if collaborator.approval != crate::types::ApprovalState::Rejected {
            reserved = reserved.saturating_add(collaborator.mgp_amount);
        }
        if collaborator.mgp_paid {
            mgp_paid = mgp_paid.saturating_add(collaborator.mgp_amount);
        }
        bonus_paid = bonus_paid.saturating_add(collaborator.bonus_paid);
    }
    let fee_paid = observers
        .iter()
        .fold(0u128, |sum, observer| sum.saturating_add(observer.fee_paid));
    if reserved != package.mgp_reserved()
        || mgp_paid != package.mgp_paid()
        || bonus_paid != package.bonus_paid()
        || fee_paid != package.observer_fee_paid()
    {
        return Err(violated(
            "aggregates match roster",
            format!("package {id}"),
        ));
    }
    Ok(())
}

/// `budget_paid ≤ budget_allocated ≤ budget_total`, conservation across
/// packages, and every package's own rules.
pub fn check_project(project: &Project) -> Result<()> {
    let id = project.id();
    if project.budget_total() == 0 {
        return Err(violated("positive budget", format!("project {id}")));
    }
    if project.budget_allocated() > project.budget_total() {
        return Err(violated(
            "allocated within total",
            format!(
                "project {id} allocated {} > total {}",
                project.budget_allocated(),
                project.budget_total()
            ),
        ));
    }
    if project.budget_paid() > project.budget_allocated() {
        return Err(violated(
            "paid within allocated",
            format!(
                "project {id} paid {} > allocated {}",
                project.budget_paid(),
                project.budget_allocated()
            ),
        ));
    }

    let mut live = 0u128;
    let mut spent = 0u128;
    let mut open = 0u64;
    for (expected, package) in project.packages().enumerate() {
        if package.id() != expected as u64 || package.project_id() != id {
            return Err(violated(
                "sequential package ids",
                format!("project {id} package {}", package.id()),
            ));
        }
        check_package(package)?;
        live = live.saturating_add(package.live_budget());
        spent = spent.saturating_add(package.spent());
        if !package.state().is_terminal() {
            open += 1;
        }
    }
    if project.packages().count() as u64 != project.package_count() {
        return Err(violated(
            "package count",
            format!("project {id} counts {}", project.package_count()),
        ));
    }
    if live != project.budget_allocated() {
        return Err(violated(
            "conservation",
            format!(
                "project {id} packages hold {live}, allocated {}",
                project.budget_allocated()
            ),
        ));
    }
    if spent != project.budget_paid() {
        return Err(violated(
            "payments match packages",
            format!("project {id} packages spent {spent}, paid {}", project.budget_paid()),
        ));
    }
    if open != project.open_packages() {
        return Err(violated("open package count", format!("project {id}")));
    }
    if project.state() == ProjectState::Finished && open != 0 {
        return Err(violated("finished projects are closed", format!("project {id}")));
    }
    Ok(())
}

#[cfg(test)]
pub fn assert_all_project_invariants(project: &Project) {
    if let Err(err) = check_project(project) {
        panic!("{err}");
    }
}

/// Paid counters never decrease between two snapshots of the same project.
#[cfg(test)]
pub fn assert_paid_monotonic(before: &Project, after: &Project) {
    assert!(
        after.budget_paid() >= before.budget_paid(),
        "project {} budget_paid decreased from {} to {}",
        after.id(),
        before.budget_paid(),
        after.budget_paid()
    );
    for old in before.packages() {
        let new = after
            .package(old.id())
            .unwrap_or_else(|_| panic!("package {} disappeared", old.id()));
        assert!(new.mgp_paid() >= old.mgp_paid(), "mgp_paid decreased");
        assert!(new.bonus_paid() >= old.bonus_paid(), "bonus_paid decreased");
        assert!(
            new.observer_fee_paid() >= old.observer_fee_paid(),
            "observer_fee_paid decreased"
        );
    }
}

/// Token and committed budget never change after creation.
#[cfg(test)]
pub fn assert_project_immutable_fields(original: &Project, current: &Project) {
    assert_eq!(original.id(), current.id(), "project id changed");
    assert_eq!(original.token(), current.token(), "project token changed");
    assert_eq!(
        original.budget_total(),
        current.budget_total(),
        "project budget_total changed"
    );
}

/// Only forward lifecycle transitions.
#[cfg(test)]
pub fn assert_valid_state_transition(from: ProjectState, to: ProjectState) {
    let valid = from == to
        || matches!(
            (from, to),
            (ProjectState::Created, ProjectState::Approved)
                | (ProjectState::Approved, ProjectState::Active)
                | (ProjectState::Active, ProjectState::Finished)
        );
    assert!(valid, "invalid project transition from {from:?} to {to:?}");
}
