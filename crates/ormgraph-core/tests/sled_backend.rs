//! Persist and query through the sled-backed store.

mod common;

use std::sync::Arc;

use ormgraph_core::proto::Value;
use ormgraph_core::{
    ConnectionSource, CounterSequence, Environment, EnvironmentConfig, ErrorKind,
    GenericProxy, SledBackend,
};
use pretty_assertions::assert_eq;

use common::definitions;

/// Test fixture owning the database directory.
struct TestContext {
    dir: tempfile::TempDir,
}

impl TestContext {
    fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn open(&self) -> SledBackend {
        SledBackend::open(self.dir.path(), &definitions()).unwrap()
    }

    fn environment(&self, backend: &SledBackend) -> Environment {
        let sequence = CounterSequence::new();
        let mut connection = backend.acquire().unwrap();
        sequence.seed(connection.as_mut(), &definitions()).unwrap();
        Environment::new(
            definitions(),
            Arc::new(backend.clone()),
            Arc::new(sequence),
            EnvironmentConfig::new("org"),
        )
    }
}

#[test]
fn test_graph_survives_reopen() {
    let ctx = TestContext::new();
    {
        let backend = ctx.open();
        let env = ctx.environment(&backend);
        let mut work = env.unit_of_work();
        let account = env.lookup("Account").unwrap();
        let project = env.lookup("Project").unwrap();

        let c = work.context_mut();
        let a = c.create(&account).unwrap();
        c.set_value(a, "name", "Ann").unwrap();
        for title in ["Apollo", "Gemini"] {
            let p = c.create(&project).unwrap();
            c.set_value(p, "title", title).unwrap();
            c.set_reference(p, "owner", Some(a)).unwrap();
        }
        let outcome = work.persist().unwrap();
        assert_eq!(outcome.inserted.len(), 3);
        drop(work);
        backend.flush().unwrap();
    }

    let backend = ctx.open();
    let env = ctx.environment(&backend);
    let mut work = env.unit_of_work();
    let mut q = env.query::<GenericProxy>("Account").unwrap();
    let root = q.root();
    q.and(root, q.prop(root, "name").unwrap().eq("Ann")).unwrap();
    q.join(root, "projects").unwrap();
    let ids = work.query(&q).unwrap().ids();
    assert_eq!(ids.len(), 1);

    let c = work.context();
    assert_eq!(c.value(ids[0], "version").unwrap(), Value::Int64(1));
    let mut titles: Vec<Value> = c
        .children(ids[0], "projects")
        .unwrap()
        .into_iter()
        .map(|p| c.value(p, "title").unwrap())
        .collect();
    titles.sort_by(|a, b| a.compare(b).unwrap_or(std::cmp::Ordering::Equal));
    assert_eq!(titles, vec![Value::from("Apollo"), Value::from("Gemini")]);

    // keys continue after the stored ones
    let account = env.lookup("Account").unwrap();
    let b = work.context_mut().create(&account).unwrap();
    work.context_mut().set_value(b, "name", "Bob").unwrap();
    work.persist().unwrap();
    assert_eq!(work.context().entity(b).unwrap().key(), Some(&Value::Int64(2)));
}

#[test]
fn test_concurrent_sessions_detect_stale_copies() {
    let ctx = TestContext::new();
    let backend = ctx.open();
    let env = ctx.environment(&backend);

    let mut setup = env.unit_of_work();
    let account = env.lookup("Account").unwrap();
    let a = setup.context_mut().create(&account).unwrap();
    setup.context_mut().set_value(a, "name", "Ann").unwrap();
    setup.persist().unwrap();
    drop(setup);

    let all = env.query::<GenericProxy>("Account").unwrap();
    let mut left = env.unit_of_work();
    let mut right = env.unit_of_work();
    let l = left.query(&all).unwrap().ids()[0];
    let r = right.query(&all).unwrap().ids()[0];

    left.context_mut().set_value(l, "name", "Left").unwrap();
    left.persist().unwrap();
    right.context_mut().set_value(r, "name", "Right").unwrap();
    let err = right.persist().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OptimisticLock);

    let mut fresh = env.unit_of_work();
    let id = fresh.query(&all).unwrap().ids()[0];
    assert_eq!(fresh.context().value(id, "name").unwrap(), Value::from("Left"));
    assert_eq!(fresh.context().value(id, "version").unwrap(), Value::Int64(2));
}
