use crate::{
    LedgerEvent, PackageBudget, ParticipantId, Payout, PayoutKind, Project, ProjectId, Result,
    SharedLedger,
};

fn setup() -> (SharedLedger, ProjectId, Vec<LedgerEvent>) {
    let ledger = SharedLedger::new();
    let (project, mut events, _) = ledger.create_project("USDC".into(), 1000).unwrap();
    events.extend(ledger.with_project(project, |p| p.approve()).unwrap().1);
    events.extend(
        ledger
            .with_project(project, |p| p.start("factory".into()))
            .unwrap()
            .1,
    );
    (ledger, project, events)
}

/// Run one operation and append what it emitted to `log`.
fn record<T>(
    ledger: &SharedLedger,
    project: ProjectId,
    log: &mut Vec<LedgerEvent>,
    op: impl FnOnce(&mut Project) -> Result<T>,
) -> Result<T> {
    let (value, events) = ledger.with_project(project, op)?;
    log.extend(events);
    Ok(value)
}

#[test]
fn test_project_lifecycle_events() {
    let (ledger, p, mut log) = setup();
    record(&ledger, p, &mut log, |x| x.finish("treasury".into())).unwrap();

    let names: Vec<_> = log.iter().map(LedgerEvent::name).collect();
    assert_eq!(
        names,
        vec![
            "project_created",
            "project_approved",
            "project_started",
            "project_finished"
        ]
    );
    assert_eq!(
        log[0],
        LedgerEvent::ProjectCreated {
            project_id: p,
            token: "USDC".into(),
            budget_total: 1000,
        }
    );
    assert_eq!(log[3].amount(), Some(1000));
}

#[test]
fn test_package_events_carry_returned_budget() {
    let (ledger, p, _) = setup();
    let mut log = Vec::new();
    let ids = ledger
        .with_project(p, |x| {
            x.create_packages(&[PackageBudget::new(100, 50, 0), PackageBudget::new(10, 0, 0)])
        })
        .unwrap()
        .0;

    record(&ledger, p, &mut log, |x| x.cancel_package(ids[1])).unwrap();
    record(&ledger, p, &mut log, |x| x.finish_package(ids[0])).unwrap();
    assert_eq!(
        log,
        vec![
            LedgerEvent::PackageCancelled {
                project_id: p,
                package_id: ids[1],
                returned: 10,
            },
            LedgerEvent::PackageFinished {
                project_id: p,
                package_id: ids[0],
                returned: 150,
            },
        ]
    );
}

#[test]
fn test_roster_events() {
    let (ledger, p, _) = setup();
    let pkg = ledger
        .with_project(p, |x| x.create_package(PackageBudget::new(300, 0, 0)))
        .unwrap()
        .0;

    let alice = ParticipantId::from("alice");
    let bob = ParticipantId::from("bob");
    let mut events = Vec::new();
    record(&ledger, p, &mut events, |x| {
        x.add_collaborators(pkg, &[(alice.clone(), 100), (bob.clone(), 120)])
    })
    .unwrap();
    record(&ledger, p, &mut events, |x| x.approve_collaborator(pkg, &bob, false)).unwrap();

    assert_eq!(
        events[0],
        LedgerEvent::CollaboratorsAdded {
            project_id: p,
            package_id: pkg,
            collaborators: vec![alice, bob.clone()],
            reserved: 220,
        }
    );
    assert_eq!(events[1].actor(), Some(&bob));
    assert_eq!(events[1].amount(), Some(120));
}

#[test]
fn test_payout_and_reversal_events() {
    let (ledger, p, _) = setup();
    let alice = ParticipantId::from("alice");
    let pkg = ledger
        .with_project(p, |x| {
            let pkg = x.create_package(PackageBudget::new(300, 0, 0))?;
            x.add_collaborators(pkg, &[(alice.clone(), 100)])?;
            x.approve_collaborator(pkg, &alice, true)?;
            Ok(pkg)
        })
        .unwrap()
        .0;

    let mut log = Vec::new();
    let payout = record(&ledger, p, &mut log, |x| x.claim_mgp(pkg, &alice)).unwrap();
    assert_eq!(
        payout,
        Payout {
            project_id: p,
            package_id: pkg,
            payee: alice.clone(),
            asset: "USDC".into(),
            amount: 100,
            kind: PayoutKind::Mgp,
        }
    );
    record(&ledger, p, &mut log, |x| x.reverse_payout(&payout)).unwrap();

    assert_eq!(
        log,
        vec![
            LedgerEvent::PayoutRecorded {
                payout: payout.clone()
            },
            LedgerEvent::PayoutReversed { payout },
        ]
    );
    assert_eq!(ledger.snapshot(p).unwrap().budget_paid(), 0);
}

#[test]
fn test_rejected_operations_emit_nothing() {
    let (ledger, p, _) = setup();
    let mut log = Vec::new();
    assert!(record(&ledger, p, &mut log, |x| x.create_package(PackageBudget::new(2000, 0, 0))).is_err());
    assert!(record(&ledger, p, &mut log, |x| x.approve()).is_err());
    assert!(log.is_empty());

    // A later success must not carry leftovers of the rejected calls.
    record(&ledger, p, &mut log, |x| x.create_package(PackageBudget::new(10, 0, 0))).unwrap();
    assert_eq!(log.len(), 1);
}

#[test]
fn test_dispute_events() {
    let (ledger, p, _) = setup();
    let alice = ParticipantId::from("alice");
    let pkg = ledger
        .with_project(p, |x| {
            let pkg = x.create_package(PackageBudget::new(100, 0, 0))?;
            x.add_collaborators(pkg, &[(alice.clone(), 10)])?;
            Ok(pkg)
        })
        .unwrap()
        .0;

    let mut log = Vec::new();
    record(&ledger, p, &mut log, |x| x.raise_dispute(pkg, &alice)).unwrap();
    record(&ledger, p, &mut log, |x| x.resolve_dispute(pkg, &alice)).unwrap();
    record(&ledger, p, &mut log, |x| x.resolve_dispute(pkg, &alice)).unwrap();

    let names: Vec<_> = log.iter().map(LedgerEvent::name).collect();
    assert_eq!(names, vec!["dispute_raised", "dispute_resolved"]);
    assert!(log.iter().all(|e| e.package_id() == Some(pkg)));
}
