use crate::invariants::{
    assert_all_project_invariants, assert_paid_monotonic, assert_project_immutable_fields,
    assert_valid_state_transition,
};
use crate::{
    LedgerError, PackageBudget, PackageState, ParticipantId, PayoutKind, Project, ProjectId,
    ProjectState, Result, SharedLedger,
};

fn id(name: &str) -> ParticipantId {
    ParticipantId::from(name)
}

/// Run one operation and drop its events.
fn run<T>(
    ledger: &SharedLedger,
    project: ProjectId,
    op: impl FnOnce(&mut Project) -> Result<T>,
) -> Result<T> {
    ledger.with_project(project, op).map(|(value, _)| value)
}

fn setup(budget_total: u128) -> (SharedLedger, ProjectId) {
    let ledger = SharedLedger::new();
    let (project, _, _) = ledger.create_project("USDC".into(), budget_total).unwrap();
    run(&ledger, project, |p| p.approve()).unwrap();
    run(&ledger, project, |p| p.start("reward-factory".into())).unwrap();
    (ledger, project)
}

#[test]
fn test_end_to_end_budget_flow() {
    let (ledger, p) = setup(1000);
    let pkg = run(&ledger, p, |x| x.create_package(PackageBudget::new(400, 100, 100))).unwrap();
    assert_eq!(ledger.snapshot(p).unwrap().budget_allocated(), 600);

    run(&ledger, p, |x| {
        x.add_collaborators(pkg, &[(id("alice"), 150), (id("bob"), 150)])
    })
    .unwrap();
    assert_eq!(ledger.snapshot(p).unwrap().package(pkg).unwrap().mgp_headroom(), 100);

    run(&ledger, p, |x| x.approve_collaborator(pkg, &id("alice"), true)).unwrap();
    run(&ledger, p, |x| x.approve_collaborator(pkg, &id("bob"), false)).unwrap();
    assert_eq!(ledger.snapshot(p).unwrap().package(pkg).unwrap().mgp_headroom(), 250);

    let err = run(&ledger, p, |x| x.add_collaborators(pkg, &[(id("carol"), 260)])).unwrap_err();
    assert!(matches!(err, LedgerError::InvariantViolation(_)));

    let payout = run(&ledger, p, |x| x.claim_mgp(pkg, &id("alice"))).unwrap();
    assert_eq!(payout.amount, 150);
    assert_eq!(ledger.snapshot(p).unwrap().package(pkg).unwrap().mgp_paid(), 150);

    let budget_left = run(&ledger, p, |x| x.finish_package(pkg)).unwrap();
    assert_eq!(budget_left, 350);
    let project = ledger.snapshot(p).unwrap();
    assert_eq!(project.budget_allocated(), 250);
    assert_eq!(project.budget_paid(), 150);
    assert_all_project_invariants(&project);
}

#[test]
fn test_rejected_collaborator_is_never_paid() {
    let (ledger, p) = setup(1000);
    let pkg = run(&ledger, p, |x| x.create_package(PackageBudget::new(400, 0, 0))).unwrap();
    run(&ledger, p, |x| x.add_collaborators(pkg, &[(id("bob"), 150)])).unwrap();
    run(&ledger, p, |x| x.approve_collaborator(pkg, &id("bob"), false)).unwrap();
    assert!(matches!(
        run(&ledger, p, |x| x.claim_mgp(pkg, &id("bob"))),
        Err(LedgerError::InvalidState(_))
    ));
    assert!(matches!(
        run(&ledger, p, |x| x.approve_collaborator(pkg, &id("bob"), true)),
        Err(LedgerError::InvalidState(_))
    ));
}

#[test]
fn test_dispute_blocks_finish_until_resolved() {
    let (ledger, p) = setup(1000);
    let pkg = run(&ledger, p, |x| x.create_package(PackageBudget::new(100, 100, 0))).unwrap();
    run(&ledger, p, |x| x.add_collaborators(pkg, &[(id("alice"), 100)])).unwrap();
    run(&ledger, p, |x| x.approve_collaborator(pkg, &id("alice"), true)).unwrap();
    run(&ledger, p, |x| x.raise_dispute(pkg, &id("alice"))).unwrap();

    assert!(matches!(
        run(&ledger, p, |x| x.finish_package(pkg)),
        Err(LedgerError::InvalidState(_))
    ));
    let payout = run(&ledger, p, |x| x.pay_disputed_bonus(pkg, &id("alice"), 70)).unwrap();
    assert_eq!(payout.kind, PayoutKind::ArbitratedBonus);

    run(&ledger, p, |x| x.resolve_dispute(pkg, &id("alice"))).unwrap();
    assert_eq!(run(&ledger, p, |x| x.finish_package(pkg)).unwrap(), 130);
    assert_all_project_invariants(&ledger.snapshot(p).unwrap());
}

#[test]
fn test_project_finish_reports_residual() {
    let (ledger, p) = setup(1000);
    let ids = run(&ledger, p, |x| {
        x.create_packages(&[PackageBudget::new(100, 0, 10), PackageBudget::new(50, 0, 0)])
    })
    .unwrap();
    run(&ledger, p, |x| {
        x.add_observers(ids[0], &[id("olga"), id("oscar"), id("omar")])
    })
    .unwrap();
    run(&ledger, p, |x| x.cancel_package(ids[1])).unwrap();
    assert!(matches!(
        run(&ledger, p, |x| x.finish("treasury".into())),
        Err(LedgerError::InvalidState(_))
    ));
    run(&ledger, p, |x| x.finish_package(ids[0])).unwrap();

    let fee = run(&ledger, p, |x| x.claim_observer_fee(ids[0], &id("olga"))).unwrap();
    assert_eq!(fee.amount, 3);

    let residual = run(&ledger, p, |x| x.finish("treasury".into())).unwrap();
    assert_eq!(residual.amount, 997);
    assert_eq!(residual.treasury.as_str(), "treasury");

    let project = ledger.snapshot(p).unwrap();
    assert_eq!(project.state(), ProjectState::Finished);
    assert_eq!(project.package(ids[1]).unwrap().state(), PackageState::Cancelled);
    assert!(run(&ledger, p, |x| x.claim_observer_fee(ids[0], &id("oscar"))).is_err());
}

#[test]
fn test_state_transitions_and_immutable_fields() {
    let ledger = SharedLedger::new();
    let (p, _, _) = ledger.create_project("USDC".into(), 500).unwrap();
    let original = ledger.snapshot(p).unwrap();

    let mut previous = original.state();
    let steps: [fn(&mut Project) -> Result<()>; 3] = [
        |x| x.approve(),
        |x| x.start("factory".into()),
        |x| x.finish("treasury".into()).map(|_| ()),
    ];
    for step in steps {
        run(&ledger, p, step).unwrap();
        let current = ledger.snapshot(p).unwrap();
        assert_valid_state_transition(previous, current.state());
        assert_project_immutable_fields(&original, &current);
        previous = current.state();
    }
    assert!(run(&ledger, p, |x| x.approve()).is_err());
}

#[test]
fn test_paid_counters_only_grow_outside_reversal() {
    let (ledger, p) = setup(1000);
    let pkg = run(&ledger, p, |x| x.create_package(PackageBudget::new(300, 100, 0))).unwrap();
    run(&ledger, p, |x| {
        x.add_collaborators(pkg, &[(id("alice"), 100), (id("bob"), 100)])
    })
    .unwrap();
    run(&ledger, p, |x| x.approve_collaborator(pkg, &id("alice"), true)).unwrap();
    run(&ledger, p, |x| x.approve_collaborator(pkg, &id("bob"), true)).unwrap();
    run(&ledger, p, |x| {
        x.assign_bonus_scores(pkg, &[(id("alice"), 600_000), (id("bob"), 400_000)], None)
    })
    .unwrap();

    let mut before = ledger.snapshot(p).unwrap();
    for who in ["alice", "bob"] {
        run(&ledger, p, |x| x.claim_mgp(pkg, &id(who))).unwrap();
        run(&ledger, p, |x| x.claim_bonus(pkg, &id(who))).unwrap();
        let after = ledger.snapshot(p).unwrap();
        assert_paid_monotonic(&before, &after);
        before = after;
    }
    assert_eq!(before.budget_paid(), 300);
    assert!(matches!(
        run(&ledger, p, |x| x.assign_bonus_scores(pkg, &[(id("alice"), 1)], None)),
        Err(LedgerError::InvalidState(_))
    ));
}

#[test]
fn test_failed_operations_change_nothing() {
    let (ledger, p) = setup(1000);
    let pkg = run(&ledger, p, |x| x.create_package(PackageBudget::new(100, 0, 0))).unwrap();
    run(&ledger, p, |x| x.add_collaborators(pkg, &[(id("alice"), 60)])).unwrap();
    let snapshot = ledger.snapshot(p).unwrap();

    assert!(run(&ledger, p, |x| {
        x.add_collaborators(pkg, &[(id("bob"), 30), (id("alice"), 1)])
    })
    .is_err());
    assert!(run(&ledger, p, |x| x.add_collaborators(pkg, &[(id("bob"), 41)])).is_err());
    assert!(run(&ledger, p, |x| x.finish_package(pkg)).is_err());
    assert!(run(&ledger, p, |x| x.claim_mgp(pkg, &id("alice"))).is_err());
    assert!(run(&ledger, p, |x| x.create_package(PackageBudget::new(901, 0, 0))).is_err());

    assert_eq!(ledger.snapshot(p).unwrap(), snapshot);
}

#[test]
fn test_restore_continues_where_it_left_off() {
    let (ledger, p) = setup(1000);
    let pkg = run(&ledger, p, |x| x.create_package(PackageBudget::new(100, 0, 0))).unwrap();
    run(&ledger, p, |x| x.add_collaborators(pkg, &[(id("alice"), 60)])).unwrap();

    let restored = SharedLedger::restore(ledger.records()).unwrap();
    assert_eq!(restored.snapshot(p).unwrap(), ledger.snapshot(p).unwrap());
    run(&restored, p, |x| x.approve_collaborator(pkg, &id("alice"), true)).unwrap();
    assert_eq!(run(&restored, p, |x| x.claim_mgp(pkg, &id("alice"))).unwrap().amount, 60);
    let (next, _, _) = restored.create_project("EURC".into(), 5).unwrap();
    assert_eq!(next, p + 1);
}
