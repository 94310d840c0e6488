//! Query building, execution and identity-map merging.

mod common;

use ormgraph_core::proto::{OrderDirection, Value};
use ormgraph_core::{
    ContextConfig, EnvironmentConfig, Environment, EntityState, GenericProxy, MemoryBackend,
    QueryBatcher, QueryObject,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;

use common::{definitions, environment, insert, seed_areas};

fn seed_accounts(backend: &MemoryBackend) {
    for (id, name) in [(1, "Ann"), (2, "Bob"), (3, "Cat")] {
        insert(
            backend,
            "account",
            &[("id", Value::Int64(id)), ("name", name.into()), ("version", Value::Int64(1))],
        );
    }
    insert(
        backend,
        "project",
        &[("id", Value::Int64(10)), ("title", "Apollo".into()), ("owner_id", Value::Int64(1))],
    );
    insert(
        backend,
        "project",
        &[("id", Value::Int64(11)), ("title", "Gemini".into()), ("owner_id", Value::Int64(3))],
    );
}

#[test]
fn test_aliases_follow_node_creation_order() {
    let env = environment(&MemoryBackend::for_definitions(&definitions()));
    let build = || {
        let mut q = env.query::<GenericProxy>("Project").unwrap();
        let root = q.root();
        let owner = q.join(root, "owner").unwrap();
        let area = q.join_path(root, "area.parent").unwrap();
        let sub = q.exists(owner, "projects").unwrap();
        q.and_not_exists(owner, sub).unwrap();
        q.and(area, q.prop(area, "name").unwrap().eq("Root")).unwrap();
        (q.aliases().into_iter().map(String::from).collect::<Vec<_>>(), q.explain().unwrap())
    };
    let (aliases, explain) = build();
    assert_eq!(aliases, vec!["a", "b", "c", "d", "e"]);
    assert_eq!(build(), (aliases, explain));
}

#[test]
fn test_area_tree_resolves_to_one_parent() {
    let backend = MemoryBackend::for_definitions(&definitions());
    seed_areas(&backend);
    let env = environment(&backend);
    let mut work = env.unit_of_work();

    let mut q = env.query::<GenericProxy>("AccessArea").unwrap();
    let root = q.root();
    q.and(root, q.prop(root, "parent").unwrap().is_null()).unwrap();
    q.join(root, "children").unwrap();
    let result = work.query(&q).unwrap();
    assert_eq!(result.len(), 1);
    let parent = result.ids()[0];

    let ctx = work.context_mut();
    assert!(ctx.is_fetched(parent, "children").unwrap());
    let children = ctx.children(parent, "children").unwrap();
    assert_eq!(children.len(), 2);
    for child in children {
        assert_eq!(ctx.entity(child).unwrap().state(), EntityState::Loaded);
        assert_eq!(ctx.reference(child, "parent").unwrap(), Some(parent));
    }
    // three rows, three entities
    assert_eq!(ctx.len(), 3);
}

#[test]
fn test_child_to_parent_join_reuses_the_root() {
    let backend = MemoryBackend::for_definitions(&definitions());
    seed_areas(&backend);
    let env = environment(&backend);
    let mut work = env.unit_of_work();

    let mut q = env.query::<GenericProxy>("AccessArea").unwrap();
    let root = q.root();
    q.and(root, q.prop(root, "parent").unwrap().is_null()).unwrap();
    let children = q.join(root, "children").unwrap();
    q.join(children, "parent").unwrap();
    let result = work.query(&q).unwrap();
    assert_eq!(result.len(), 1);
    let parent = result.ids()[0];

    let ctx = work.context_mut();
    let children = ctx.children(parent, "children").unwrap();
    assert_eq!(children.len(), 2);
    for child in children {
        assert_eq!(ctx.reference(child, "parent").unwrap(), Some(parent));
    }
    assert_eq!(ctx.len(), 3);
}

#[test]
fn test_repeated_queries_share_identity() {
    let backend = MemoryBackend::for_definitions(&definitions());
    seed_accounts(&backend);
    let env = environment(&backend);
    let mut work = env.unit_of_work();

    let mut by_name = env.query::<GenericProxy>("Account").unwrap();
    let root = by_name.root();
    by_name.and(root, by_name.prop(root, "name").unwrap().like("A%")).unwrap();
    let first = work.query(&by_name).unwrap().ids();

    work.context_mut().set_value(first[0], "name", "Anna").unwrap();

    let mut all = env.query::<GenericProxy>("Account").unwrap();
    all.order_by(all.prop(all.root(), "id").unwrap(), OrderDirection::Asc)
        .unwrap();
    let second = work.query(&all).unwrap().ids();
    assert_eq!(second.len(), 3);
    assert_eq!(second[0], first[0]);
    // a reload does not clobber the pending change
    assert_eq!(work.context().value(first[0], "name").unwrap(), Value::from("Anna"));
    assert_eq!(backend.acquisitions(), 1);
}

#[test]
fn test_exists_filters_without_loading_sub_query_rows() {
    let backend = MemoryBackend::for_definitions(&definitions());
    seed_accounts(&backend);
    let env = environment(&backend);
    let mut work = env.unit_of_work();

    let mut q = env.query::<GenericProxy>("Account").unwrap();
    let root = q.root();
    let project = q.exists(root, "projects").unwrap();
    q.and(project, q.prop(project, "title").unwrap().like("G%")).unwrap();
    q.and_exists(root, project).unwrap();
    let result = work.query(&q).unwrap();

    let ctx = work.context();
    assert_eq!(result.len(), 1);
    assert_eq!(ctx.entity(result.ids()[0]).unwrap().key(), Some(&Value::Int64(3)));
    let project_type = env.lookup("Project").unwrap();
    assert!(ctx.of_type(&project_type).is_empty());
    assert!(!ctx.is_fetched(result.ids()[0], "projects").unwrap());
}

#[test]
fn test_filtered_join_is_not_marked_fetched() {
    let backend = MemoryBackend::for_definitions(&definitions());
    seed_accounts(&backend);
    let env = environment(&backend);
    let mut work = env.unit_of_work();

    let mut q = env.query::<GenericProxy>("Account").unwrap();
    let root = q.root();
    let projects = q.join(root, "projects").unwrap();
    q.and(projects, q.prop(projects, "title").unwrap().eq("Apollo")).unwrap();
    let ids = work.query(&q).unwrap().ids();

    assert_eq!(ids.len(), 1);
    assert!(!work.context().is_fetched(ids[0], "projects").unwrap());
    let full = work.fetch_children(ids[0], "projects").unwrap();
    assert_eq!(full.len(), 1);
    assert!(work.context().is_fetched(ids[0], "projects").unwrap());
}

#[test]
fn test_root_condition_on_collection_is_not_marked_fetched() {
    let backend = MemoryBackend::for_definitions(&definitions());
    seed_accounts(&backend);
    insert(
        &backend,
        "project",
        &[("id", Value::Int64(12)), ("title", "Voyager".into()), ("owner_id", Value::Int64(1))],
    );
    let env = environment(&backend);
    let mut work = env.unit_of_work();

    let mut q = env.query::<GenericProxy>("Account").unwrap();
    let root = q.root();
    let projects = q.join(root, "projects").unwrap();
    q.and(root, q.prop(projects, "title").unwrap().eq("Apollo")).unwrap();
    let ids = work.query(&q).unwrap().ids();

    assert_eq!(ids.len(), 1);
    assert_eq!(work.context().children(ids[0], "projects").unwrap().len(), 1);
    assert!(!work.context().is_fetched(ids[0], "projects").unwrap());
    let full = work.fetch_children(ids[0], "projects").unwrap();
    assert_eq!(full.len(), 2);
    assert!(work.context().is_fetched(ids[0], "projects").unwrap());
}

#[test]
fn test_batched_queries_return_results_in_order() {
    let backend = MemoryBackend::for_definitions(&definitions());
    seed_accounts(&backend);
    let env = environment(&backend);
    let mut work = env.unit_of_work();

    let queries: Vec<QueryObject> = [3i64, 1, 7]
        .into_iter()
        .map(|id| {
            let mut q = env.query::<GenericProxy>("Account").unwrap();
            let root = q.root();
            q.and(root, q.prop(root, "id").unwrap().eq(id)).unwrap();
            q
        })
        .collect();
    let mut batch = QueryBatcher::new();
    for q in &queries {
        batch.add(q);
    }
    let before = backend.round_trips();
    let results = work.query_batch(&batch).unwrap();

    assert_eq!(backend.round_trips() - before, 1);
    let sizes: Vec<usize> = results.iter().map(|r| r.len()).collect();
    assert_eq!(sizes, vec![1, 1, 0]);
    let key = |r: &ormgraph_core::QueryResult<GenericProxy>| {
        work.context().entity(r.ids()[0]).unwrap().key().cloned()
    };
    assert_eq!(key(&results[0]), Some(Value::Int64(3)));
    assert_eq!(key(&results[1]), Some(Value::Int64(1)));
}

#[test]
fn test_sweep_evicts_unreachable_clean_entities() {
    let backend = MemoryBackend::for_definitions(&definitions());
    seed_accounts(&backend);
    let env = Environment::new(
        definitions(),
        Arc::new(backend.clone()),
        Arc::new(ormgraph_core::CounterSequence::new()),
        EnvironmentConfig::new("org")
            .with_context(ContextConfig::new().with_garbage_collection(true)),
    );
    let mut work = env.unit_of_work();

    let all = env.query::<GenericProxy>("Account").unwrap();
    let ids = work.query(&all).unwrap().ids();
    assert_eq!(ids.len(), 3);

    let ctx = work.context_mut();
    ctx.retain(ids[0]).unwrap();
    ctx.set_value(ids[1], "name", "Bobby").unwrap();
    assert_eq!(ctx.sweep(), 1);
    assert_eq!(ctx.len(), 2);
    assert!(ctx.entity(ids[2]).is_err());

    // evicted rows come back as fresh entities
    let again = work.query(&all).unwrap().ids();
    assert_eq!(again.len(), 3);
    assert!(again.contains(&ids[0]));
    assert!(again.contains(&ids[1]));
}
