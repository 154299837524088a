use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;

use crate::{
    CancelToken, Dependency, EngineError, ExecContext, OutputStamper, Pie, Reason, ResourceStamper,
    StoreError, Task, TaskFailure, TaskKey,
};

static TRIP: Mutex<Option<CancelToken>> = Mutex::new(None);
static CLAIM: AtomicBool = AtomicBool::new(true);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
enum Op {
    Read(Utf8PathBuf),
    Upper(Utf8PathBuf),
    Len(Utf8PathBuf),
    Twice(Utf8PathBuf),
    Touch(Utf8PathBuf),
    Stat(Utf8PathBuf),
    List(Utf8PathBuf),
    Choose {
        flag: Utf8PathBuf,
        a: Utf8PathBuf,
        b: Utf8PathBuf,
    },
    Write {
        path: Utf8PathBuf,
        content: String,
    },
    /// Provides `out` only while `CLAIM` is set, then reads `src`.
    Claim {
        out: Utf8PathBuf,
        src: Utf8PathBuf,
    },
    Loop(u8),
    Slow(String),
    Trip,
    Panic,
}

impl Task for Op {
    type Output = Result<String, TaskFailure>;

    fn id(&self) -> &'static str {
        match self {
            Op::Read(_) => "read",
            Op::Upper(_) => "upper",
            Op::Len(_) => "len",
            Op::Twice(_) => "twice",
            Op::Touch(_) => "touch",
            Op::Stat(_) => "stat",
            Op::List(_) => "list",
            Op::Choose { .. } => "choose",
            Op::Write { .. } => "write",
            Op::Claim { .. } => "claim",
            Op::Loop(_) => "loop",
            Op::Slow(_) => "slow",
            Op::Trip => "trip",
            Op::Panic => "panic",
        }
    }

    fn execute(&self, ctx: &mut ExecContext<Self>) -> Result<Self::Output, EngineError> {
        Ok(match self {
            Op::Read(path) => ctx
                .require_resource(path, ResourceStamper::Hash)?
                .read_to_string()
                .map_err(TaskFailure::from),
            Op::Upper(path) => ctx
                .require(&Op::Read(path.clone()))?
                .map(|text| text.to_uppercase()),
            Op::Len(path) => ctx
                .require(&Op::Read(path.clone()))?
                .map(|text| text.len().to_string()),
            Op::Twice(path) => ctx
                .require(&Op::Len(path.clone()))?
                .map(|len| len.repeat(2)),
            Op::Touch(path) => {
                let _ = ctx.require_with(&Op::Read(path.clone()), OutputStamper::Inconsequential)?;
                Ok("touched".into())
            }
            Op::Stat(path) => {
                ctx.require_resource(path, ResourceStamper::Modified)?;
                Ok("seen".into())
            }
            Op::List(path) => {
                let dir = ctx.require_resource(path, ResourceStamper::Listing)?;
                Ok(dir.path().is_dir().to_string())
            }
            Op::Choose { flag, a, b } => {
                let flag = ctx
                    .require_resource(flag, ResourceStamper::Hash)?
                    .read_to_string()
                    .unwrap_or_default();
                let path = if flag.trim() == "a" { a } else { b };
                ctx.require(&Op::Read(path.clone()))?
            }
            Op::Write { path, content } => {
                ctx.provide(path)?;
                std::fs::write(path, content)
                    .map(|_| content.clone())
                    .map_err(TaskFailure::from)
            }
            Op::Claim { out, src } => {
                if CLAIM.load(Ordering::SeqCst) {
                    ctx.provide(out)?;
                }
                ctx.require_resource(src, ResourceStamper::Hash)?
                    .read_to_string()
                    .map_err(TaskFailure::from)
            }
            Op::Loop(n) => ctx.require(&Op::Loop((n + 1) % 2))?,
            Op::Slow(text) => {
                std::thread::sleep(Duration::from_millis(50));
                Ok(text.clone())
            }
            Op::Trip => {
                if let Some(token) = TRIP.lock().unwrap().take() {
                    token.cancel();
                }
                Ok(String::new())
            }
            Op::Panic => panic!("boom"),
        })
    }
}

fn workspace() -> (TempDir, Utf8PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
    (dir, root)
}

fn durable(root: &Utf8Path) -> Pie<Op> {
    Pie::config()
        .store(root.join("store"))
        .threads(4)
        .finish()
        .unwrap()
}

fn memory() -> Pie<Op> {
    Pie::config().threads(4).finish().unwrap()
}

fn write(path: &Utf8Path, text: &str) -> Utf8PathBuf {
    std::fs::write(path, text).unwrap();
    path.to_owned()
}

fn key(op: &Op) -> TaskKey {
    TaskKey::of(op).unwrap()
}

#[test]
fn test_three_sessions_over_one_resource() {
    let (_dir, root) = workspace();
    let r = write(&root.join("r.txt"), "a");
    let k1 = Op::Upper(r.clone());

    let (output, report) = durable(&root)
        .run_in_session(|s| s.require(&k1))
        .unwrap();
    assert_eq!(output, Ok("A".to_string()));
    assert_eq!(report.executions_of("upper"), 1);

    let (output, report) = durable(&root)
        .run_in_session(|s| s.require(&k1))
        .unwrap();
    assert_eq!(output, Ok("A".to_string()));
    assert!(report.executed.is_empty());
    assert_eq!(report.reused, 2);

    write(&r, "b");
    let (output, report) = durable(&root)
        .run_in_session(|s| s.require(&k1))
        .unwrap();
    assert_eq!(output, Ok("B".to_string()));
    assert_eq!(report.executions_of("upper"), 1);
    assert_eq!(report.executions_of("read"), 1);
}

#[test]
fn test_key_executes_once_per_session() {
    let (_dir, root) = workspace();
    let a = write(&root.join("a.txt"), "hello");
    let mut pie = memory();

    let ((first, second), report) = pie
        .run_in_session(|s| {
            let first = s.require(&Op::Upper(a.clone()))?;
            assert_eq!(s.require(&Op::Len(a.clone()))?, Ok("5".to_string()));
            let second = s.require(&Op::Upper(a.clone()))?;
            Ok((first, second))
        })
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(report.executions_of("read"), 1);
    assert_eq!(report.executions_of("upper"), 1);
    assert_eq!(report.executed.len(), 3);
}

#[test]
fn test_changes_reexecute_exactly_the_affected_keys() {
    let (_dir, root) = workspace();
    let a = write(&root.join("a.txt"), "one");
    let b = write(&root.join("b.txt"), "two");
    let roots = [Op::Upper(a.clone()), Op::Upper(b.clone()), Op::Len(b.clone())];
    let mut pie = memory();

    let session = pie.new_session();
    assert!(session.require_all(&roots).iter().all(Result::is_ok));
    session.commit().unwrap();

    write(&a, "uno");
    let affected = pie.store().affected_by([a.as_path()]);

    let session = pie.new_session();
    let outputs = session.require_all(&roots);
    let report = session.commit().unwrap();

    assert_eq!(outputs[0].as_ref().unwrap(), &Ok("UNO".to_string()));
    assert_eq!(outputs[1].as_ref().unwrap(), &Ok("TWO".to_string()));

    let executed: HashSet<TaskKey> = report.executed_keys().into_iter().cloned().collect();
    assert_eq!(executed, affected);
    assert_eq!(
        executed,
        HashSet::from([key(&Op::Read(a.clone())), key(&Op::Upper(a.clone()))])
    );
}

#[test]
fn test_unchanged_output_stops_propagation() {
    let (_dir, root) = workspace();
    let a = write(&root.join("a.txt"), "ab");
    let mut pie = memory();

    assert_eq!(pie.require(&Op::Twice(a.clone())).unwrap(), Ok("22".to_string()));

    write(&a, "cd");
    let (output, report) = pie
        .run_in_session(|s| s.require(&Op::Twice(a.clone())))
        .unwrap();

    assert_eq!(output, Ok("22".to_string()));
    assert_eq!(report.executions_of("read"), 1);
    assert_eq!(report.executions_of("len"), 1);
    assert_eq!(report.executions_of("twice"), 0);
}

#[test]
fn test_inconsequential_stamp_ignores_output() {
    let (_dir, root) = workspace();
    let a = write(&root.join("a.txt"), "x");
    let mut pie = memory();

    pie.require(&Op::Touch(a.clone())).unwrap().unwrap();

    write(&a, "y");
    let (_, report) = pie
        .run_in_session(|s| s.require(&Op::Touch(a.clone())))
        .unwrap();

    assert_eq!(report.executions_of("read"), 1);
    assert_eq!(report.executions_of("touch"), 0);
}

#[test]
fn test_cycle_fails_every_session() {
    let (_dir, root) = workspace();
    let mut pie = durable(&root);

    for _ in 0..2 {
        let session = pie.new_session();
        let err = session.require(&Op::Loop(0)).unwrap_err();

        let EngineError::Cycle { path } = &err else {
            panic!("expected a cycle, got {err}");
        };
        assert_eq!(
            path,
            &vec![key(&Op::Loop(0)), key(&Op::Loop(1)), key(&Op::Loop(0))]
        );

        assert!(session.commit().unwrap_err().is_cycle());
        assert!(pie.store().is_empty());
    }

    drop(pie);
    assert!(durable(&root).store().is_empty());
}

#[test]
fn test_second_provider_conflicts() {
    let (_dir, root) = workspace();
    let out = root.join("out.txt");
    let first = Op::Write {
        path: out.clone(),
        content: "1".into(),
    };
    let second = Op::Write {
        path: out.clone(),
        content: "2".into(),
    };
    let mut pie = memory();

    let session = pie.new_session();
    assert_eq!(session.require(&first).unwrap(), Ok("1".to_string()));

    let err = session.require(&second).unwrap_err();
    let EngineError::ResourceConflict {
        path,
        first: a,
        second: b,
    } = &err
    else {
        panic!("expected a conflict, got {err}");
    };
    assert_eq!(path, &out);
    assert_eq!(a, &key(&first));
    assert_eq!(b, &key(&second));

    // the first provider is unaffected
    assert_eq!(session.require(&first).unwrap(), Ok("1".to_string()));
    assert!(session.commit().is_err());
}

#[test]
fn test_stored_provider_conflicts_without_executing() {
    let (_dir, root) = workspace();
    let out = root.join("out.txt");
    let first = Op::Write {
        path: out.clone(),
        content: "1".into(),
    };
    let second = Op::Write {
        path: out.clone(),
        content: "2".into(),
    };
    let mut pie = memory();

    pie.require(&first).unwrap().unwrap();

    let session = pie.new_session();
    session.require(&first).unwrap().unwrap();
    assert!(matches!(
        session.require(&second),
        Err(EngineError::ResourceConflict { .. })
    ));

    // failed executions are not reported
    let report = session.discard();
    assert_eq!(report.executions_of("write"), 0);
    assert_eq!(report.reused, 1);
}

#[test]
fn test_parallel_roots_share_one_execution() {
    let mut pie = memory();
    let slow = Op::Slow("shared".into());
    let roots = vec![slow.clone(); 8];

    let session = pie.new_session();
    let outputs = session.require_all(&roots);
    let report = session.commit().unwrap();

    assert_eq!(outputs.len(), 8);
    for output in outputs {
        assert_eq!(output.unwrap(), Ok("shared".to_string()));
    }
    assert_eq!(report.executions_of("slow"), 1);
}

#[test]
fn test_threads_share_one_execution() {
    let mut pie = memory();
    let slow = Op::Slow("threads".into());

    let session = pie.new_session();
    let outputs: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| scope.spawn(|| session.require(&slow)))
            .collect();

        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for output in outputs {
        assert_eq!(output.unwrap(), Ok("threads".to_string()));
    }
    assert_eq!(session.report().executions_of("slow"), 1);
}

#[test]
fn test_cancelled_session_commits_nothing() {
    let (_dir, root) = workspace();
    let a = write(&root.join("a.txt"), "a");
    let mut pie = durable(&root);

    let session = pie.new_session();
    session.require(&Op::Read(a.clone())).unwrap().unwrap();

    *TRIP.lock().unwrap() = Some(session.cancel_token());
    assert!(matches!(session.require(&Op::Trip), Err(EngineError::Cancelled)));
    assert!(matches!(
        session.require(&Op::Read(a.clone())),
        Err(EngineError::Cancelled)
    ));

    assert!(matches!(session.commit(), Err(EngineError::Cancelled)));
    assert!(pie.store().is_empty());
    drop(pie);
    assert!(durable(&root).store().is_empty());
}

#[test]
fn test_panic_is_structural() {
    let mut pie = memory();

    let session = pie.new_session();
    let err = session.require(&Op::Panic).unwrap_err();
    assert!(matches!(&err, EngineError::Panicked { message, .. } if message == "boom"));
    assert!(session.commit().is_err());
}

#[test]
fn test_corrupt_record_recomputes_only_that_key() {
    let (_dir, root) = workspace();
    let a = write(&root.join("a.txt"), "text");
    let upper = Op::Upper(a.clone());

    durable(&root).require(&upper).unwrap().unwrap();

    let record = root
        .join("store")
        .join(key(&Op::Read(a.clone())).digest().to_hex())
        .with_extension("cbor");
    std::fs::write(&record, b"not a record").unwrap();

    let mut pie = durable(&root);
    assert_eq!(pie.store().len(), 1);

    let (output, report) = pie.run_in_session(|s| s.require(&upper)).unwrap();
    assert_eq!(output, Ok("TEXT".to_string()));
    assert_eq!(report.executed.len(), 1);
    assert_eq!(report.executed[0].key, key(&Op::Read(a.clone())));
    assert_eq!(report.executed[0].reason, Reason::New);

    drop(pie);
    assert_eq!(durable(&root).store().len(), 2);
}

#[test]
fn test_dynamic_dependencies_are_replaced() {
    let (_dir, root) = workspace();
    let flag = write(&root.join("flag"), "a");
    let a = write(&root.join("a.txt"), "from a");
    let b = write(&root.join("b.txt"), "from b");
    let choose = Op::Choose {
        flag: flag.clone(),
        a: a.clone(),
        b: b.clone(),
    };
    let mut pie = memory();

    assert_eq!(pie.require(&choose).unwrap(), Ok("from a".to_string()));

    write(&flag, "b");
    assert_eq!(pie.require(&choose).unwrap(), Ok("from b".to_string()));

    let deps = &pie.store().get(&key(&choose)).unwrap().dependencies;
    assert_eq!(deps.len(), 2);
    assert!(deps.iter().all(|dep| !matches!(
        dep,
        Dependency::Call { key: k, .. } if k == &key(&Op::Read(a.clone()))
    )));

    write(&a, "changed");
    let (_, report) = pie.run_in_session(|s| s.require(&choose)).unwrap();
    assert!(report.executed.is_empty());
}

#[test]
fn test_application_failure_is_a_value() {
    let (_dir, root) = workspace();
    let missing = root.join("missing.txt");
    let mut pie = memory();

    let (output, _) = pie
        .run_in_session(|s| s.require(&Op::Upper(missing.clone())))
        .unwrap();
    assert!(output.is_err());

    let (output, report) = pie
        .run_in_session(|s| s.require(&Op::Upper(missing.clone())))
        .unwrap();
    assert!(output.is_err());
    assert!(report.executed.is_empty());

    write(&missing, "found");
    let (output, _) = pie
        .run_in_session(|s| s.require(&Op::Upper(missing.clone())))
        .unwrap();
    assert_eq!(output, Ok("FOUND".to_string()));
}

#[test]
fn test_snapshot_sessions_do_not_write() {
    let (_dir, root) = workspace();
    let a = write(&root.join("a.txt"), "old");
    let upper = Op::Upper(a.clone());
    let mut pie = memory();

    pie.require(&upper).unwrap().unwrap();
    write(&a, "new");

    let snapshot = pie.snapshot();
    let readers: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let session = snapshot.session();
                let upper = upper.clone();
                scope.spawn(move || {
                    let output = session.require(&upper).unwrap();
                    (output, session.commit().unwrap())
                })
            })
            .collect();

        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for (output, report) in readers {
        assert_eq!(output, Ok("NEW".to_string()));
        assert_eq!(report.executions_of("upper"), 1);
    }

    let stored = &pie.store().get(&key(&upper)).unwrap().output;
    assert_eq!(stored, &Ok("OLD".to_string()));

    let (_, report) = pie.run_in_session(|s| s.require(&upper)).unwrap();
    assert_eq!(report.executions_of("upper"), 1);
}

#[test]
fn test_persistent_check_error_is_not_a_change() {
    let (_dir, root) = workspace();
    let file = write(&root.join("file.txt"), "not a directory");
    let mut pie = memory();

    // listing a plain file fails with something other than "not found"
    let list = Op::List(file.clone());
    assert_eq!(pie.require(&list).unwrap(), Ok("false".to_string()));

    for _ in 0..3 {
        let session = pie.new_session();
        assert_eq!(session.require(&list).unwrap(), Ok("false".to_string()));
        let errors = session.dependency_check_errors();
        let report = session.commit().unwrap();

        assert!(errors.is_empty());
        assert_eq!(report.executions_of("list"), 0);
        assert_eq!(report.reused, 1);
    }
}

#[test]
fn test_check_error_with_changed_stamp_is_collected() {
    let (_dir, root) = workspace();
    let dir = root.join("dir");
    std::fs::create_dir(&dir).unwrap();
    let mut pie = memory();

    let list = Op::List(dir.clone());
    assert_eq!(pie.require(&list).unwrap(), Ok("true".to_string()));

    std::fs::remove_dir(&dir).unwrap();
    write(&dir, "now a file");

    let session = pie.new_session();
    assert_eq!(session.require(&list).unwrap(), Ok("false".to_string()));
    let errors = session.dependency_check_errors();
    let report = session.commit().unwrap();

    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].path, dir);
    assert_eq!(errors[0].key, key(&list));
    assert_eq!(report.executions_of("list"), 1);
}

#[test]
fn test_modified_stamper_follows_mtime() {
    let (_dir, root) = workspace();
    let a = write(&root.join("a.txt"), "same");
    let stat = Op::Stat(a.clone());
    let mut pie = memory();

    let set = |secs| {
        std::fs::File::options()
            .write(true)
            .open(&a)
            .unwrap()
            .set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(secs))
            .unwrap();
    };

    set(1_000_000);
    pie.require(&stat).unwrap().unwrap();

    let (_, report) = pie.run_in_session(|s| s.require(&stat)).unwrap();
    assert_eq!(report.executions_of("stat"), 0);

    // content is untouched, only the timestamp moves
    set(2_000_000);
    let (_, report) = pie.run_in_session(|s| s.require(&stat)).unwrap();
    assert_eq!(report.executions_of("stat"), 1);
    assert_eq!(report.executed[0].reason, Reason::Resource(a.clone()));
}

#[test]
fn test_cycle_across_parallel_roots() {
    let mut pie = memory();

    for _ in 0..4 {
        let session = pie.new_session();
        let outputs = session.require_all(&[Op::Loop(0), Op::Loop(1)]);

        assert_eq!(outputs.len(), 2);
        for output in outputs {
            assert!(output.unwrap_err().is_cycle());
        }

        assert!(session.commit().unwrap_err().is_cycle());
        assert!(pie.store().is_empty());
    }
}

#[test]
fn test_reexecution_releases_stale_provision() {
    let (_dir, root) = workspace();
    let out = root.join("out.txt");
    let src = write(&root.join("src.txt"), "one");
    let claim = Op::Claim {
        out: out.clone(),
        src: src.clone(),
    };
    let writer = Op::Write {
        path: out.clone(),
        content: "w".into(),
    };
    let mut pie = memory();

    assert_eq!(pie.require(&claim).unwrap(), Ok("one".to_string()));

    // checking the stored record registers `out` before `src` is seen to
    // have changed; the new body no longer provides it
    CLAIM.store(false, Ordering::SeqCst);
    write(&src, "two");

    let session = pie.new_session();
    assert_eq!(session.require(&claim).unwrap(), Ok("two".to_string()));
    assert_eq!(session.require(&writer).unwrap(), Ok("w".to_string()));
    let report = session.commit().unwrap();

    assert_eq!(report.executions_of("claim"), 1);
    assert_eq!(report.executions_of("write"), 1);

    let deps = &pie.store().get(&key(&claim)).unwrap().dependencies;
    assert!(!deps.iter().any(|dep| matches!(dep, Dependency::Provide { .. })));
}

#[test]
fn test_second_engine_on_same_store_is_refused() {
    let (_dir, root) = workspace();
    let pie = durable(&root);

    let err = Pie::<Op>::config()
        .store(root.join("store"))
        .finish()
        .map(|_| ())
        .unwrap_err();
    assert!(matches!(err, EngineError::Store(StoreError::Locked { .. })));

    drop(pie);
    assert!(durable(&root).store().is_empty());
}

static FRAGILE: AtomicBool = AtomicBool::new(false);

/// Task whose values stop decoding once `FRAGILE` is set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
struct Fragile(u8);

impl<'de> Deserialize<'de> for Fragile {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Raw(u8);

        if FRAGILE.load(Ordering::SeqCst) {
            panic!("undecodable");
        }

        Raw::deserialize(deserializer).map(|Raw(n)| Fragile(n))
    }
}

impl Task for Fragile {
    type Output = u8;

    fn id(&self) -> &'static str {
        "fragile"
    }

    fn execute(&self, ctx: &mut ExecContext<Self>) -> Result<u8, EngineError> {
        match self.0 {
            0 => ctx.require(&Fragile(1)),
            n => Ok(n),
        }
    }
}

#[test]
fn test_panic_while_validating_releases_waiters() {
    let mut pie = Pie::<Fragile>::config().threads(2).finish().unwrap();
    assert_eq!(pie.require(&Fragile(0)).unwrap(), 1);

    // checking the stored record of 0 decodes its dependency on 1
    FRAGILE.store(true, Ordering::SeqCst);

    let session = pie.new_session();
    let outputs: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|_| scope.spawn(|| session.require(&Fragile(0))))
            .collect();

        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    FRAGILE.store(false, Ordering::SeqCst);

    for output in outputs {
        let err = output.unwrap_err();
        assert!(matches!(&err, EngineError::Panicked { message, .. } if message == "undecodable"));
    }
    assert!(session.commit().is_err());
}

#[test]
fn test_compact_keeps_reachable_records() {
    let (_dir, root) = workspace();
    let a = write(&root.join("a.txt"), "a");
    let b = write(&root.join("b.txt"), "b");
    let mut pie = durable(&root);

    let session = pie.new_session();
    for result in session.require_all(&[Op::Upper(a.clone()), Op::Upper(b.clone())]) {
        result.unwrap().unwrap();
    }
    session.commit().unwrap();
    assert_eq!(pie.store().len(), 4);

    assert_eq!(pie.compact(&[Op::Upper(a.clone())]).unwrap(), 2);
    assert!(pie.store().contains(&key(&Op::Read(a.clone()))));
    assert!(!pie.store().contains(&key(&Op::Read(b.clone()))));

    drop(pie);
    assert_eq!(durable(&root).store().len(), 2);
}
