use runledger::core::error::LedgerError;
use runledger::plugins::admission::{
    AdmissionController, CommandDefinition, Invocation, Outcome, Rejection, from_fn,
};
use runledger::plugins::memory::MemoryRecordStore;
use runledger::plugins::records::{JsonMap, RecordStore, SqliteRecordStore};
use std::cell::Cell;
use std::fs;
use std::sync::{Arc, Barrier};
use std::thread;
use tempfile::tempdir;

fn sqlite_controller() -> (tempfile::TempDir, AdmissionController<SqliteRecordStore>) {
    let tmp = tempdir().unwrap();
    let store = SqliteRecordStore::open_as(tmp.path(), "tester").unwrap();
    (tmp, AdmissionController::new(store))
}

fn ok_work() -> impl runledger::plugins::admission::WorkUnit {
    from_fn(|_ctx| Ok("ok"))
}

#[test]
fn runs_once_rejects_second_invocation_before_work() {
    let (_tmp, ctl) = sqlite_controller();
    let def = CommandDefinition::new("db:migrate").runs_once(true);

    let first = ctl.execute(&def, Invocation::new(), &ok_work()).unwrap();
    assert_eq!(first.status(), "completed");
    assert_eq!(first.record().result, "ok");

    let ran = Cell::new(false);
    let second_work = from_fn(|_ctx| {
        ran.set(true);
        Ok(())
    });
    let second = ctl.execute(&def, Invocation::new(), &second_work).unwrap();

    assert!(!ran.get(), "rejected work must not execute");
    match &second {
        Outcome::Rejected { record, rejection } => {
            assert_eq!(*rejection, Rejection::AlreadyRun);
            assert_eq!(record.result, "Command has run before.");
            assert_eq!(record.status(), "failed");
            assert!(!record.has_started());
        }
        other => panic!("expected rejection, got {:?}", other),
    }
    assert!(!second.is_success());

    let store = ctl.store();
    assert_eq!(store.completed_count("db:migrate").unwrap(), 1);
    assert_eq!(store.requested_count("db:migrate").unwrap(), 2);
}

#[test]
fn runs_if_waits_for_dependency() {
    let (_tmp, ctl) = sqlite_controller();
    let seed = CommandDefinition::new("seed").runs_if(["migrate"]);

    let early = ctl.execute(&seed, Invocation::new(), &ok_work()).unwrap();
    match &early {
        Outcome::Rejected { rejection, record } => {
            assert_eq!(
                *rejection,
                Rejection::DependencyNotMet {
                    name: "migrate".to_string()
                }
            );
            assert_eq!(record.result, "Command migrate has not run yet.");
        }
        other => panic!("expected rejection, got {:?}", other),
    }

    let migrate = CommandDefinition::new("migrate");
    assert_eq!(
        ctl.execute(&migrate, Invocation::new(), &ok_work())
            .unwrap()
            .status(),
        "completed"
    );

    let later = ctl.execute(&seed, Invocation::new(), &ok_work()).unwrap();
    assert_eq!(later.status(), "completed");
}

#[test]
fn failed_dependency_does_not_satisfy_runs_if() {
    let ctl = AdmissionController::new(MemoryRecordStore::default());
    let migrate = CommandDefinition::new("migrate");
    let failing = from_fn(|_ctx| -> anyhow::Result<()> { anyhow::bail!("lock timeout") });
    assert_eq!(
        ctl.execute(&migrate, Invocation::new(), &failing)
            .unwrap()
            .status(),
        "failed"
    );

    let seed = CommandDefinition::new("seed").runs_if(["migrate"]);
    let outcome = ctl.execute(&seed, Invocation::new(), &ok_work()).unwrap();
    assert_eq!(outcome.status(), "rejected");
}

#[test]
fn doesnt_run_if_blocks_after_conflicting_command() {
    let ctl = AdmissionController::new(MemoryRecordStore::default());
    let legacy = CommandDefinition::new("legacy:import").doesnt_run_if(["v2:import"]);

    assert_eq!(
        ctl.execute(&legacy, Invocation::new(), &ok_work())
            .unwrap()
            .status(),
        "completed"
    );

    ctl.execute(&CommandDefinition::new("v2:import"), Invocation::new(), &ok_work())
        .unwrap();

    let blocked = ctl.execute(&legacy, Invocation::new(), &ok_work()).unwrap();
    match blocked {
        Outcome::Rejected { rejection, record } => {
            assert_eq!(rejection.code(), "conflicting_command_ran");
            assert_eq!(record.result, "Command v2:import has already run.");
        }
        other => panic!("expected rejection, got {:?}", other),
    }
}

#[test]
fn run_limit_admits_n_attempts_then_rejects() {
    let (_tmp, ctl) = sqlite_controller();
    let def = CommandDefinition::new("notify").run_limit(2);

    for _ in 0..2 {
        let out = ctl.execute(&def, Invocation::new(), &ok_work()).unwrap();
        assert_eq!(out.status(), "completed");
    }
    let third = ctl.execute(&def, Invocation::new(), &ok_work()).unwrap();
    match third {
        Outcome::Rejected { rejection, record } => {
            assert_eq!(
                rejection,
                Rejection::RunLimitExceeded {
                    limit: 2,
                    attempts: 2
                }
            );
            assert_eq!(
                record.result,
                "Command has been run or requested too many times."
            );
        }
        other => panic!("expected rejection, got {:?}", other),
    }
}

#[test]
fn run_limit_counts_failed_attempts() {
    let ctl = AdmissionController::new(MemoryRecordStore::default());
    let def = CommandDefinition::new("flaky").run_limit(1);
    let failing = from_fn(|_ctx| -> anyhow::Result<()> { anyhow::bail!("upstream 503") });

    let first = ctl.execute(&def, Invocation::new(), &failing).unwrap();
    assert_eq!(first.status(), "failed");

    let second = ctl.execute(&def, Invocation::new(), &ok_work()).unwrap();
    assert_eq!(second.status(), "rejected");
}

#[test]
fn run_limit_zero_never_admits() {
    let ctl = AdmissionController::new(MemoryRecordStore::default());
    let def = CommandDefinition::new("disabled").run_limit(0);
    let out = ctl.execute(&def, Invocation::new(), &ok_work()).unwrap();
    assert_eq!(out.status(), "rejected");
}

#[test]
fn work_error_fails_record_with_message() {
    let (_tmp, ctl) = sqlite_controller();
    let def = CommandDefinition::new("export");
    let work = from_fn(|_ctx| -> anyhow::Result<()> {
        Err(anyhow::anyhow!("disk full")).map_err(|e| e.context("writing chunk 7"))
    });

    let outcome = ctl.execute(&def, Invocation::new(), &work).unwrap();
    match outcome {
        Outcome::Failed { record, message } => {
            assert!(message.starts_with("Error: writing chunk 7: disk full"), "{message}");
            assert_eq!(record.result, message);
            assert!(record.deleted_at.is_some());
            assert!(record.completed_at.is_none());
        }
        other => panic!("expected failure, got {:?}", other),
    }
    assert!(!ctl.store().is_in_progress("export").unwrap());
}

#[test]
fn structured_output_is_stored_as_json() {
    let ctl = AdmissionController::new(MemoryRecordStore::default());
    let def = CommandDefinition::new("report");
    let work = from_fn(|_ctx| Ok(serde_json::json!({ "rows": 12 })));
    let outcome = ctl.execute(&def, Invocation::new(), &work).unwrap();
    assert_eq!(outcome.record().result, r#"{"rows":12}"#);
}

#[test]
fn work_sees_invocation_arguments() {
    let ctl = AdmissionController::new(MemoryRecordStore::default());
    let def = CommandDefinition::new("resize");
    let invocation = Invocation::new()
        .with_argument("bucket", "avatars")
        .with_option("dry-run", true);
    let work = from_fn(|ctx| {
        assert_eq!(ctx.arguments["bucket"], "avatars");
        assert_eq!(ctx.options["dry-run"], true);
        assert!(!ctx.nested);
        Ok(format!("record {}", ctx.record_id))
    });

    let outcome = ctl.execute(&def, invocation, &work).unwrap();
    let record = outcome.record();
    assert_eq!(record.result, format!("record {}", record.id));
    assert_eq!(record.arguments["bucket"], "avatars");
}

#[test]
fn resume_runs_a_precreated_record() {
    let (_tmp, ctl) = sqlite_controller();
    let queued = ctl
        .store()
        .create("mail:digest", &JsonMap::new(), &JsonMap::new())
        .unwrap();

    let def = CommandDefinition::new("mail:digest");
    let outcome = ctl
        .execute(&def, Invocation::resume(queued.id), &ok_work())
        .unwrap();
    assert_eq!(outcome.status(), "completed");
    assert_eq!(outcome.record().id, queued.id);
    assert_eq!(ctl.store().requested_count("mail:digest").unwrap(), 1);
}

#[test]
fn resuming_a_started_record_is_an_invariant_violation() {
    let (_tmp, ctl) = sqlite_controller();
    let store = ctl.store();
    let rec = store
        .create("mail:digest", &JsonMap::new(), &JsonMap::new())
        .unwrap();
    store.start(&rec).unwrap();

    let def = CommandDefinition::new("mail:digest");
    let err = ctl
        .execute(&def, Invocation::resume(rec.id), &ok_work())
        .unwrap_err();
    assert!(matches!(err, LedgerError::AlreadyStarted { id } if id == rec.id));
    assert!(err.is_invariant_violation());
    assert_eq!(
        err.to_string(),
        format!("The monitored command {} has already started.", rec.id)
    );

    // The failed claim left the record untouched.
    let current = store.find_by_id(rec.id).unwrap().unwrap();
    assert!(current.is_in_progress());
}

#[test]
fn resume_with_unknown_id_is_not_found() {
    let ctl = AdmissionController::new(MemoryRecordStore::default());
    let def = CommandDefinition::new("mail:digest");
    let err = ctl
        .execute(&def, Invocation::resume(404), &ok_work())
        .unwrap_err();
    assert!(matches!(err, LedgerError::NotFound(_)));
}

#[test]
fn recursive_work_shares_one_record_finalized_by_outer_call() {
    let (_tmp, ctl) = sqlite_controller();
    let def = CommandDefinition::new("tree:walk")
        .recursive(true)
        .runs_once(true);
    let visited = Cell::new(0u32);

    let leaf = from_fn(|ctx| -> anyhow::Result<&'static str> {
        assert!(ctx.nested);
        visited.set(visited.get() + 1);
        Ok("leaf")
    });
    let branch = from_fn(|ctx| -> anyhow::Result<&'static str> {
        assert!(ctx.nested);
        visited.set(visited.get() + 1);
        let inner = ctl.execute(&def, ctx.reentry(), &leaf)?;
        assert_eq!(inner.status(), "deferred");
        assert_eq!(inner.record().id, ctx.record_id);
        Ok("branch")
    });
    let root = from_fn(|ctx| -> anyhow::Result<&'static str> {
        assert!(!ctx.nested);
        let inner = ctl.execute(&def, ctx.reentry(), &branch)?;
        assert_eq!(inner.status(), "deferred");
        assert_eq!(inner.record().id, ctx.record_id);
        // The shared record stays open until the outer call returns.
        assert!(inner.record().is_in_progress());
        assert!(inner.record().result.is_empty());
        assert!(ctl.store().is_in_progress("tree:walk")?);
        Ok("root")
    });

    let outcome = ctl.execute(&def, Invocation::new(), &root).unwrap();
    assert_eq!(outcome.status(), "completed");
    assert_eq!(outcome.record().result, "root");
    assert_eq!(visited.get(), 2);

    let store = ctl.store();
    assert_eq!(store.requested_count("tree:walk").unwrap(), 1);
    assert_eq!(store.completed_count("tree:walk").unwrap(), 1);
    assert!(!store.is_in_progress("tree:walk").unwrap());
}

#[test]
fn nested_failure_fails_the_shared_record() {
    let ctl = AdmissionController::new(MemoryRecordStore::default());
    let def = CommandDefinition::new("crawl").recursive(true);

    let work = from_fn(|ctx| -> anyhow::Result<&'static str> {
        let failing = from_fn(|_ctx| -> anyhow::Result<()> { anyhow::bail!("page 3 timed out") });
        let inner = ctl.execute(&def, ctx.reentry(), &failing)?;
        assert_eq!(inner.status(), "failed");
        Ok("outer finished")
    });

    let outcome = ctl.execute(&def, Invocation::new(), &work).unwrap();
    match outcome {
        Outcome::Failed { record, message } => {
            assert!(message.contains("page 3 timed out"), "{message}");
            assert!(record.deleted_at.is_some());
            assert!(record.completed_at.is_none());
        }
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(ctl.store().requested_count("crawl").unwrap(), 1);
}

#[test]
fn middle_nested_run_reports_failure_of_deeper_run() {
    let ctl = AdmissionController::new(MemoryRecordStore::default());
    let def = CommandDefinition::new("crawl").recursive(true);
    let middle_status = Cell::new("");

    let leaf = from_fn(|_ctx| -> anyhow::Result<()> { anyhow::bail!("robots.txt denied") });
    let middle = from_fn(|ctx| -> anyhow::Result<&'static str> {
        ctl.execute(&def, ctx.reentry(), &leaf)?;
        Ok("middle done")
    });
    let root = from_fn(|ctx| -> anyhow::Result<&'static str> {
        let inner = ctl.execute(&def, ctx.reentry(), &middle)?;
        middle_status.set(inner.status());
        assert!(!inner.is_success());
        assert!(inner.message().contains("robots.txt denied"));
        Ok("root done")
    });

    let outcome = ctl.execute(&def, Invocation::new(), &root).unwrap();
    assert_eq!(middle_status.get(), "failed");
    assert_eq!(outcome.status(), "failed");
    assert!(outcome.message().contains("robots.txt denied"));
}

#[test]
fn nested_reentry_into_finished_record_is_refused() {
    let ctl = AdmissionController::new(MemoryRecordStore::default());
    let def = CommandDefinition::new("crawl").recursive(true);
    let done = ctl.execute(&def, Invocation::new(), &ok_work()).unwrap();

    let err = ctl
        .execute(&def, Invocation::nested(done.record().id), &ok_work())
        .unwrap_err();
    assert!(matches!(err, LedgerError::InvalidReentry(_)));
    assert!(err.is_invariant_violation());
}

#[test]
fn nested_reentry_into_other_command_is_refused() {
    let ctl = AdmissionController::new(MemoryRecordStore::default());
    let crawl = CommandDefinition::new("crawl").recursive(true);
    let index = CommandDefinition::new("index").recursive(true);

    let work = from_fn(|ctx| -> anyhow::Result<()> {
        let err = ctl.execute(&index, ctx.reentry(), &ok_work()).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidReentry(_)));
        Ok(())
    });
    assert_eq!(
        ctl.execute(&crawl, Invocation::new(), &work)
            .unwrap()
            .status(),
        "completed"
    );
}

#[test]
fn concurrent_runs_once_admits_exactly_one() {
    let tmp = tempdir().unwrap();
    let root = tmp.path().to_path_buf();
    SqliteRecordStore::open_as(&root, "setup").unwrap();

    let workers = 4;
    let barrier = Arc::new(Barrier::new(workers));
    let handles: Vec<_> = (0..workers)
        .map(|i| {
            let root = root.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let store = SqliteRecordStore::open_as(&root, &format!("worker-{i}")).unwrap();
                let ctl = AdmissionController::new(store);
                let def = CommandDefinition::new("billing:close").runs_once(true);
                barrier.wait();
                let work = from_fn(|_ctx| {
                    thread::sleep(std::time::Duration::from_millis(50));
                    Ok("closed")
                });
                ctl.execute(&def, Invocation::new(), &work)
                    .unwrap()
                    .status()
            })
        })
        .collect();

    let statuses: Vec<&str> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(statuses.iter().filter(|s| **s == "completed").count(), 1);
    assert_eq!(
        statuses.iter().filter(|s| **s == "rejected").count(),
        workers - 1
    );

    let store = SqliteRecordStore::open_as(&root, "check").unwrap();
    assert_eq!(store.completed_count("billing:close").unwrap(), 1);
    assert_eq!(store.requested_count("billing:close").unwrap(), workers as u64);
}

#[test]
fn admission_units_are_audited() {
    let (_tmp, ctl) = sqlite_controller();
    let def = CommandDefinition::new("audit:me");
    ctl.execute(&def, Invocation::new(), &ok_work()).unwrap();

    let events = ctl.store().broker().read_events().unwrap();
    let ops: Vec<&str> = events.iter().map(|e| e.op.as_str()).collect();
    assert_eq!(ops, vec!["ledger.init", "admission.claim", "admission.complete"]);
    assert!(events.iter().all(|e| e.status == "success"));
    assert_eq!(events[1].actor, "tester");
}

#[test]
fn unwritable_audit_log_does_not_strand_a_claimed_record() {
    let (tmp, ctl) = sqlite_controller();
    let log = tmp.path().join(runledger::core::schemas::BROKER_EVENTS_NAME);
    fs::remove_file(&log).unwrap();
    fs::create_dir_all(&log).unwrap();

    let def = CommandDefinition::new("migrate").runs_once(true);
    let ran = Cell::new(false);
    let work = from_fn(|_ctx| {
        ran.set(true);
        Ok("migrated")
    });

    let outcome = ctl.execute(&def, Invocation::new(), &work).unwrap();
    assert!(ran.get());
    assert_eq!(outcome.status(), "completed");

    let store = ctl.store();
    assert!(!store.is_in_progress("migrate").unwrap());
    assert_eq!(store.completed_count("migrate").unwrap(), 1);

    let again = ctl.execute(&def, Invocation::new(), &ok_work()).unwrap();
    assert_eq!(again.message(), "Command has run before.");
}
