use std::sync::Arc;
use std::time::Duration;

use common::config::SequenceBackend;
use common::testing::TestConfigBuilder;
use compactor::{
    CompactableTable, ErrorKind, MaintenanceOrchestrator, Registry, RegistryEntry, Relation,
    SqliteSequence, Store,
};

const BLOG_SCHEMA: &[&str] = &[
    "CREATE TABLE tags (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT NOT NULL UNIQUE)",
    "CREATE TABLE articles (id INTEGER PRIMARY KEY AUTOINCREMENT, title TEXT NOT NULL)",
    "CREATE TABLE projects (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT NOT NULL)",
    "CREATE TABLE article_tags (article_id INTEGER NOT NULL, tag_id INTEGER NOT NULL, \
     PRIMARY KEY (article_id, tag_id))",
    "CREATE TABLE project_tags (project_id INTEGER NOT NULL, tag_id INTEGER NOT NULL, \
     PRIMARY KEY (project_id, tag_id))",
];

async fn blog_store(seed: &[&str]) -> Store {
    let store = Store::in_memory().await.expect("Failed to open store");
    for sql in BLOG_SCHEMA.iter().chain(seed) {
        store.execute(sql, &[]).await.expect("Failed to seed store");
    }
    store
}

fn orchestrator(store: &Store) -> MaintenanceOrchestrator {
    MaintenanceOrchestrator::new(store.clone(), Arc::new(SqliteSequence))
}

async fn ids(store: &Store, table: &str) -> Vec<i64> {
    sqlx::query_scalar(&format!("SELECT id FROM {table} ORDER BY id"))
        .fetch_all(store.pool())
        .await
        .unwrap()
}

async fn names(store: &Store, table: &str) -> Vec<String> {
    sqlx::query_scalar(&format!("SELECT name FROM {table} ORDER BY id"))
        .fetch_all(store.pool())
        .await
        .unwrap()
}

async fn links(store: &Store, table: &str, parent: &str) -> Vec<(i64, i64)> {
    sqlx::query_as(&format!(
        "SELECT {parent}, tag_id FROM {table} ORDER BY {parent}, tag_id"
    ))
    .fetch_all(store.pool())
    .await
    .unwrap()
}

async fn sequence(store: &Store, table: &str) -> Option<i64> {
    sqlx::query_scalar("SELECT seq FROM sqlite_sequence WHERE name = ?")
        .bind(table)
        .fetch_optional(store.pool())
        .await
        .unwrap()
}

fn tags() -> CompactableTable {
    CompactableTable::new("tags")
}

#[tokio::test]
async fn test_tags_scenario() {
    let store = blog_store(&[
        "INSERT INTO tags (id, name) VALUES (2, 'rust'), (5, 'sql'), (9, 'web')",
        "INSERT INTO article_tags (article_id, tag_id) VALUES (1, 5), (2, 7)",
    ])
    .await;

    let result = orchestrator(&store)
        .compact_table(&tags(), &[Relation::new("article_tags", "tag_id")])
        .await;

    assert!(result.success, "{}", result.message);
    assert_eq!(result.max_id, 3);
    assert_eq!(result.rows, 3);
    assert_eq!(result.moved, 3);
    assert_eq!(result.dropped_rows, 1);
    assert_eq!(result.relations.len(), 1);
    assert_eq!(result.relations[0].kept, 1);
    assert_eq!(result.relations[0].unresolved_ids, vec![7]);

    assert_eq!(ids(&store, "tags").await, vec![1, 2, 3]);
    assert_eq!(names(&store, "tags").await, vec!["rust", "sql", "web"]);
    assert_eq!(
        links(&store, "article_tags", "article_id").await,
        vec![(1, 2)]
    );
}

async fn total_changes(store: &Store) -> i64 {
    sqlx::query_scalar("SELECT total_changes()")
        .fetch_one(store.pool())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_empty_table() {
    // a used-then-emptied table keeps a stale counter
    let store = blog_store(&[
        "INSERT INTO tags (id, name) VALUES (1, 'a'), (2, 'b')",
        "DELETE FROM tags",
    ])
    .await;
    assert_eq!(sequence(&store, "tags").await, Some(2));
    let before = total_changes(&store).await;

    let result = orchestrator(&store)
        .compact_table(&tags(), &[Relation::new("article_tags", "tag_id")])
        .await;

    assert!(result.success, "{}", result.message);
    assert_eq!(result.max_id, 0);
    assert_eq!(result.rows, 0);
    assert_eq!(result.dropped_rows, 0);

    // the counter reset is the only row written
    assert_eq!(total_changes(&store).await - before, 1);
    assert_eq!(sequence(&store, "tags").await, Some(0));
    assert!(ids(&store, "tags").await.is_empty());
    assert!(links(&store, "article_tags", "article_id").await.is_empty());

    store
        .execute("INSERT INTO tags (name) VALUES ('first')", &[])
        .await
        .unwrap();
    assert_eq!(ids(&store, "tags").await, vec![1]);
}

#[tokio::test]
async fn test_empty_table_without_counter_row() {
    let store = blog_store(&[]).await;
    let before = total_changes(&store).await;

    let result = orchestrator(&store)
        .compact_table(&tags(), &[Relation::new("article_tags", "tag_id")])
        .await;

    assert!(result.success, "{}", result.message);
    assert_eq!(result.max_id, 0);
    // no sqlite_sequence row yet, so repair inserts one at 0
    assert_eq!(total_changes(&store).await - before, 1);
    assert_eq!(sequence(&store, "tags").await, Some(0));

    let before = total_changes(&store).await;
    let again = orchestrator(&store)
        .compact_table(&tags(), &[Relation::new("article_tags", "tag_id")])
        .await;
    assert!(again.success, "{}", again.message);
    assert_eq!(total_changes(&store).await - before, 1);
    assert_eq!(sequence(&store, "tags").await, Some(0));
}

#[tokio::test]
async fn test_dependent_with_cascading_children_is_rejected() {
    let store = Store::in_memory().await.unwrap();
    for sql in [
        "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL)",
        "CREATE TABLE articles (id INTEGER PRIMARY KEY, \
         author_id INTEGER REFERENCES users (id) ON DELETE CASCADE, title TEXT)",
        "CREATE TABLE article_tags (article_id INTEGER NOT NULL \
         REFERENCES articles (id) ON DELETE CASCADE, tag_id INTEGER NOT NULL)",
        "INSERT INTO users (id, name) VALUES (3, 'ada'), (8, 'grace')",
        "INSERT INTO articles (id, author_id, title) VALUES (1, 3, 'one'), (2, 8, 'two')",
        "INSERT INTO article_tags (article_id, tag_id) VALUES (1, 1), (2, 1)",
    ] {
        store.execute(sql, &[]).await.unwrap();
    }

    let result = orchestrator(&store)
        .compact_table(
            &CompactableTable::new("users"),
            &[Relation::new("articles", "author_id")],
        )
        .await;

    assert!(!result.success);
    assert_eq!(result.error_kind, Some(ErrorKind::Configuration));
    assert!(result.message.contains("article_tags"), "{}", result.message);
    assert_eq!(ids(&store, "users").await, vec![3, 8]);
    let join_rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM article_tags")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(join_rows, 2);
}

#[tokio::test]
async fn test_expired_run_reports_every_table_untouched() {
    let store = blog_store(&[
        "INSERT INTO tags (id, name) VALUES (2, 'rust'), (9, 'web')",
        "INSERT INTO article_tags (article_id, tag_id) VALUES (1, 9)",
    ])
    .await;
    let orchestrator = orchestrator(&store).with_run_timeout(Some(Duration::ZERO));

    let report = orchestrator.compact_all(&Registry::builtin()).await;

    assert!(!report.success);
    assert!(report.timed_out());
    let tables: Vec<&str> = report.results.iter().map(|r| r.table.as_str()).collect();
    assert_eq!(tables, ["tags", "articles", "projects"]);
    assert!(
        report
            .results
            .iter()
            .all(|r| r.error_kind == Some(ErrorKind::Timeout))
    );
    assert_eq!(orchestrator.metrics().tables_failed(), 3);
    assert_eq!(ids(&store, "tags").await, vec![2, 9]);
    assert_eq!(links(&store, "article_tags", "article_id").await, vec![(1, 9)]);

    let repair = orchestrator.repair_sequence("tags", "id").await;
    assert!(!repair.success);
    assert_eq!(repair.error_kind, Some(ErrorKind::Timeout));
}

#[tokio::test]
async fn test_run_within_limit_completes() {
    let store = blog_store(&[
        "INSERT INTO tags (id, name) VALUES (2, 'rust'), (9, 'web')",
        "INSERT INTO articles (id, title) VALUES (1, 'hello')",
        "INSERT INTO article_tags (article_id, tag_id) VALUES (1, 9)",
    ])
    .await;
    let orchestrator = orchestrator(&store).with_run_timeout(Some(Duration::from_secs(60)));

    let report = orchestrator.compact_all(&Registry::builtin()).await;

    assert!(report.success);
    assert!(!report.timed_out());
    assert_eq!(ids(&store, "tags").await, vec![1, 2]);
    assert_eq!(links(&store, "article_tags", "article_id").await, vec![(1, 2)]);
}

#[tokio::test]
async fn test_next_insert_follows_new_max() {
    let store = blog_store(&[
        "INSERT INTO tags (id, name) VALUES (10, 'a'), (20, 'b'), (30, 'c')",
    ])
    .await;
    assert_eq!(sequence(&store, "tags").await, Some(30));

    let result = orchestrator(&store).compact_table(&tags(), &[]).await;
    assert!(result.success, "{}", result.message);
    assert_eq!(sequence(&store, "tags").await, Some(3));

    store
        .execute("INSERT INTO tags (name) VALUES ('d')", &[])
        .await
        .unwrap();
    assert_eq!(ids(&store, "tags").await, vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn test_second_run_is_identity() {
    let store = blog_store(&[
        "INSERT INTO tags (id, name) VALUES (3, 'a'), (6, 'b')",
        "INSERT INTO article_tags (article_id, tag_id) VALUES (1, 3), (1, 6)",
    ])
    .await;
    let orchestrator = orchestrator(&store);
    let relations = [Relation::new("article_tags", "tag_id")];

    let first = orchestrator.compact_table(&tags(), &relations).await;
    assert_eq!(first.moved, 2);
    let after_first = links(&store, "article_tags", "article_id").await;

    let second = orchestrator.compact_table(&tags(), &relations).await;
    assert!(second.success, "{}", second.message);
    assert_eq!(second.moved, 0);
    assert_eq!(second.dropped_rows, 0);
    assert_eq!(second.max_id, 2);
    assert_eq!(links(&store, "article_tags", "article_id").await, after_first);
    assert_eq!(after_first, vec![(1, 1), (1, 2)]);
}

#[tokio::test]
async fn test_join_table_primary_key_survives_remap() {
    // (1, 5) -> (1, 2) collides with the existing (1, 2) if rows are updated in place
    let store = blog_store(&[
        "INSERT INTO tags (id, name) VALUES (2, 'a'), (5, 'b'), (9, 'c')",
        "INSERT INTO article_tags (article_id, tag_id) VALUES (1, 2), (1, 5), (1, 9)",
    ])
    .await;

    let result = orchestrator(&store)
        .compact_table(&tags(), &[Relation::new("article_tags", "tag_id")])
        .await;

    assert!(result.success, "{}", result.message);
    assert_eq!(
        links(&store, "article_tags", "article_id").await,
        vec![(1, 1), (1, 2), (1, 3)]
    );
}

#[tokio::test]
async fn test_compact_all_builtin_registry() {
    let store = blog_store(&[
        "INSERT INTO tags (id, name) VALUES (2, 'rust'), (5, 'sql'), (9, 'web')",
        "INSERT INTO articles (id, title) VALUES (3, 'first'), (10, 'second')",
        "INSERT INTO projects (id, name) VALUES (7, 'densekey')",
        "INSERT INTO article_tags (article_id, tag_id) VALUES (3, 5), (10, 9), (10, 2), (4, 5)",
        "INSERT INTO project_tags (project_id, tag_id) VALUES (7, 9), (8, 2)",
    ])
    .await;

    let report = orchestrator(&store).compact_all(&Registry::builtin()).await;

    assert!(report.success);
    let tables: Vec<&str> = report.results.iter().map(|r| r.table.as_str()).collect();
    assert_eq!(tables, ["tags", "articles", "projects"]);
    let dropped: Vec<u64> = report.results.iter().map(|r| r.dropped_rows).collect();
    assert_eq!(dropped, [0, 1, 1]);

    assert_eq!(ids(&store, "tags").await, vec![1, 2, 3]);
    assert_eq!(ids(&store, "articles").await, vec![1, 2]);
    assert_eq!(ids(&store, "projects").await, vec![1]);
    assert_eq!(
        links(&store, "article_tags", "article_id").await,
        vec![(1, 2), (2, 1), (2, 3)]
    );
    assert_eq!(
        links(&store, "project_tags", "project_id").await,
        vec![(1, 3)]
    );
}

#[tokio::test]
async fn test_compact_all_continues_after_failure() {
    let store = blog_store(&[
        "INSERT INTO tags (id, name) VALUES (4, 'a'), (8, 'b')",
    ])
    .await;
    let registry = Registry::new(vec![
        RegistryEntry {
            table: CompactableTable::new("comments"),
            relations: vec![],
        },
        RegistryEntry {
            table: tags(),
            relations: vec![Relation::new("article_tags", "tag_id")],
        },
    ]);
    let orchestrator = orchestrator(&store);

    let report = orchestrator.compact_all(&registry).await;

    assert!(!report.success);
    assert_eq!(report.failures(), 1);
    assert!(!report.results[0].success);
    assert_eq!(report.results[0].error_kind, Some(ErrorKind::Schema));
    assert!(report.results[1].success);
    assert_eq!(ids(&store, "tags").await, vec![1, 2]);

    let metrics = orchestrator.metrics().summary();
    assert_eq!(metrics.runs, 1);
    assert_eq!(metrics.tables_failed, 1);
    assert_eq!(metrics.tables_succeeded, 1);
}

#[tokio::test]
async fn test_configuration_error_leaves_table_untouched() {
    let store = blog_store(&[
        "INSERT INTO tags (id, name) VALUES (2, 'a'), (5, 'b'), (9, 'c')",
    ])
    .await;
    let orchestrator = orchestrator(&store);

    for relation in [
        Relation::new("article_tags", "label_id"),
        Relation::new("tag_links", "tag_id"),
        "article_tags:tag_id:slug".parse().unwrap(),
    ] {
        let result = orchestrator.compact_table(&tags(), &[relation]).await;
        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::Configuration));
    }

    assert_eq!(ids(&store, "tags").await, vec![2, 5, 9]);
    assert_eq!(sequence(&store, "tags").await, Some(9));
}

#[tokio::test]
async fn test_dry_run_reports_without_writing() {
    let store = blog_store(&[
        "INSERT INTO tags (id, name) VALUES (2, 'rust'), (5, 'sql'), (9, 'web')",
        "INSERT INTO article_tags (article_id, tag_id) VALUES (1, 5), (2, 7)",
    ])
    .await;

    let result = orchestrator(&store)
        .with_dry_run(true)
        .compact_table(&tags(), &[Relation::new("article_tags", "tag_id")])
        .await;

    assert!(result.success, "{}", result.message);
    assert!(result.dry_run);
    assert_eq!(result.max_id, 3);
    assert_eq!(result.dropped_rows, 1);

    assert_eq!(ids(&store, "tags").await, vec![2, 5, 9]);
    assert_eq!(
        links(&store, "article_tags", "article_id").await,
        vec![(1, 5), (2, 7)]
    );
    assert_eq!(sequence(&store, "tags").await, Some(9));
}

#[tokio::test]
async fn test_non_positive_ids_are_renumbered() {
    let store = blog_store(&[
        "INSERT INTO tags (id, name) VALUES (-3, 'a'), (0, 'b'), (2, 'c'), (3, 'd')",
        "INSERT INTO article_tags (article_id, tag_id) VALUES (1, -3), (1, 0), (1, 3)",
    ])
    .await;

    let result = orchestrator(&store)
        .compact_table(&tags(), &[Relation::new("article_tags", "tag_id")])
        .await;

    assert!(result.success, "{}", result.message);
    assert_eq!(ids(&store, "tags").await, vec![1, 2, 3, 4]);
    assert_eq!(names(&store, "tags").await, vec!["a", "b", "c", "d"]);
    assert_eq!(
        links(&store, "article_tags", "article_id").await,
        vec![(1, 1), (1, 2), (1, 4)]
    );
}

#[tokio::test]
async fn test_enforced_foreign_keys_are_satisfied_at_commit() {
    let store = Store::in_memory().await.unwrap();
    for sql in [
        "PRAGMA foreign_keys = ON",
        "CREATE TABLE tags (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT NOT NULL)",
        "CREATE TABLE article_tags (article_id INTEGER NOT NULL, \
         tag_id INTEGER REFERENCES tags (id), UNIQUE (article_id, tag_id))",
        "INSERT INTO tags (id, name) VALUES (3, 'a'), (7, 'b')",
        "INSERT INTO article_tags (article_id, tag_id) VALUES (1, 7), (2, 3), (3, NULL)",
    ] {
        store.execute(sql, &[]).await.unwrap();
    }

    let result = orchestrator(&store)
        .compact_table(&tags(), &[Relation::new("article_tags", "tag_id")])
        .await;
    assert!(result.success, "{}", result.message);

    let rows: Vec<(i64, Option<i64>)> =
        sqlx::query_as("SELECT article_id, tag_id FROM article_tags ORDER BY article_id")
            .fetch_all(store.pool())
            .await
            .unwrap();
    assert_eq!(rows, vec![(1, Some(2)), (2, Some(1)), (3, None)]);

    let violations: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pragma_foreign_key_check")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(violations, 0);
}

#[tokio::test]
async fn test_repair_all_sequences_skips_tables_without_id() {
    let store = blog_store(&[
        "INSERT INTO tags (id, name) VALUES (1, 'a'), (2, 'b'), (40, 'c')",
        "DELETE FROM tags WHERE id = 40",
        "INSERT INTO articles (id, title) VALUES (12, 'x')",
    ])
    .await;

    let report = orchestrator(&store).repair_all_sequences("id").await;

    assert!(report.success);
    let tables: Vec<&str> = report.results.iter().map(|r| r.table.as_str()).collect();
    assert_eq!(tables, ["articles", "projects", "tags"]);

    let tags = &report.results[2];
    assert_eq!(tags.previous, Some(40));
    assert_eq!(tags.max_id, 2);
    assert!(tags.tracked);
    assert_eq!(sequence(&store, "tags").await, Some(2));
    assert_eq!(sequence(&store, "articles").await, Some(12));
}

#[tokio::test]
async fn test_orchestrator_from_config() {
    let config = TestConfigBuilder::new()
        .in_memory()
        .with_sequence(SequenceBackend::Derived)
        .build();

    let orchestrator = MaintenanceOrchestrator::from_config(&config)
        .await
        .expect("Failed to build orchestrator");
    orchestrator
        .store()
        .execute("CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT)", &[])
        .await
        .unwrap();

    let result = orchestrator.repair_sequence("notes", "id").await;
    assert!(result.success, "{}", result.message);
    assert!(!result.tracked);

    let config = TestConfigBuilder::new()
        .in_memory()
        .with_sequence(SequenceBackend::Postgres)
        .build();
    let err = MaintenanceOrchestrator::from_config(&config)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
}
