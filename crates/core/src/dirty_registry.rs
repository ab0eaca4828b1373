use std::collections::{BTreeSet, HashMap};

use crate::table_view::{TableView, ViewId};

/// Identity of a table as the registry sees it: several open views on the
/// same connection may point at the same table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableKey {
    pub connection: String,
    pub database: Option<String>,
    pub table: String,
}

impl TableKey {
    #[must_use]
    pub fn new(
        connection: impl Into<String>,
        database: Option<String>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            connection: connection.into(),
            database,
            table: table.into(),
        }
    }

    #[must_use]
    pub fn for_view(view: &TableView) -> Self {
        Self {
            connection: view.connection().to_string(),
            database: view.spec().database.clone(),
            table: view.spec().table.clone(),
        }
    }
}

/// Session-owned index from (connection, table) to every open view
/// displaying it. Entries hold non-owning [`ViewId`] handles, never the
/// views themselves: a closed view unregisters and nothing dangles.
///
/// All access is funneled through the single UI loop; the map needs no
/// lock.
#[derive(Debug, Default)]
pub struct DirtyRegistry {
    entries: HashMap<TableKey, BTreeSet<ViewId>>,
}

impl DirtyRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Called when a view opens a table.
    pub fn register(&mut self, key: TableKey, view: ViewId) {
        self.entries.entry(key).or_default().insert(view);
    }

    /// Called when a view closes or switches tables. The entry disappears
    /// with its last view.
    pub fn unregister(&mut self, key: &TableKey, view: ViewId) {
        if let Some(views) = self.entries.get_mut(key) {
            views.remove(&view);
            if views.is_empty() {
                self.entries.remove(key);
            }
        }
    }

    /// Every registered view under `key` except the mutating one; the
    /// mutator already patched itself.
    #[must_use]
    pub fn peers_of(&self, key: &TableKey, mutator: ViewId) -> Vec<ViewId> {
        self.entries
            .get(key)
            .map(|views| {
                views
                    .iter()
                    .copied()
                    .filter(|view| *view != mutator)
                    .collect()
            })
            .unwrap_or_default()
    }

    #[must_use]
    pub fn views(&self, key: &TableKey) -> Vec<ViewId> {
        self.entries
            .get(key)
            .map(|views| views.iter().copied().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{DirtyRegistry, TableKey};
    use crate::mutations::{
        apply_completion as apply_mutation, prepare_update, run_mutation, AppliedMutation,
        MutationBackend, MutationBackendError,
    };
    use crate::query_spec::QuerySpec;
    use crate::table_view::{TableView, ViewId};
    use crate::value::{Column, Page, Row, RowCount, TableSchema, Value};

    fn key(table: &str) -> TableKey {
        TableKey::new("local", Some("app".to_string()), table)
    }

    #[test]
    fn entries_live_exactly_as_long_as_their_views() {
        let mut registry = DirtyRegistry::new();
        let key = key("users");
        let first = ViewId::new(1);
        let second = ViewId::new(2);

        registry.register(key.clone(), first);
        registry.register(key.clone(), second);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.views(&key), vec![first, second]);

        registry.unregister(&key, first);
        assert_eq!(registry.views(&key), vec![second]);

        registry.unregister(&key, second);
        assert!(registry.is_empty());
        assert!(registry.views(&key).is_empty());
    }

    #[test]
    fn peers_exclude_the_mutator_and_other_tables() {
        let mut registry = DirtyRegistry::new();
        let users = key("users");
        let sessions = key("sessions");
        let v1 = ViewId::new(1);
        let v2 = ViewId::new(2);
        let v3 = ViewId::new(3);

        registry.register(users.clone(), v1);
        registry.register(users.clone(), v2);
        registry.register(sessions.clone(), v3);

        assert_eq!(registry.peers_of(&users, v1), vec![v2]);
        assert_eq!(registry.peers_of(&users, v2), vec![v1]);
        assert!(registry.peers_of(&sessions, v3).is_empty());
    }

    #[test]
    fn keys_distinguish_connection_database_and_table() {
        let mut registry = DirtyRegistry::new();
        let v1 = ViewId::new(1);
        registry.register(key("users"), v1);

        let other_connection = TableKey::new("staging", Some("app".to_string()), "users");
        let other_database = TableKey::new("local", Some("warehouse".to_string()), "users");
        assert!(registry.views(&other_connection).is_empty());
        assert!(registry.views(&other_database).is_empty());
    }

    #[derive(Debug, Default)]
    struct RecordingBackend;

    #[async_trait::async_trait]
    impl MutationBackend for RecordingBackend {
        async fn update_cell(
            &self,
            _database: Option<&str>,
            _table: &str,
            _key: &[(String, Value)],
            _column: &str,
            _value: &Value,
        ) -> Result<(), MutationBackendError> {
            Ok(())
        }

        async fn delete_row(
            &self,
            _database: Option<&str>,
            _table: &str,
            _key: &[(String, Value)],
        ) -> Result<(), MutationBackendError> {
            Ok(())
        }

        async fn insert_row(
            &self,
            _database: Option<&str>,
            _table: &str,
            _values: &[(String, Value)],
        ) -> Result<(), MutationBackendError> {
            Ok(())
        }
    }

    fn schema() -> Arc<TableSchema> {
        Arc::new(TableSchema::new(vec![
            Column::new("id", "bigint").primary_key(),
            Column::new("email", "varchar(255)"),
        ]))
    }

    fn loaded_view(id: u64, offset: u64, rows: &[(i64, &str)]) -> TableView {
        let mut view = TableView::new(
            ViewId::new(id),
            "local",
            QuerySpec::for_table(Some("app".to_string()), "users"),
            schema(),
        );
        let page_rows = rows
            .iter()
            .map(|(id, email)| {
                Row::new(vec![
                    Value::Integer(*id),
                    Value::Text((*email).to_string()),
                ])
            })
            .collect();
        let page = Page::new(schema(), offset, page_rows).expect("page should build");
        let total = offset + rows.len() as u64;
        let generation = view.begin_load();
        assert!(view.apply_loaded_page(
            generation,
            page,
            Some(RowCount {
                total,
                exact: true,
            }),
            false,
        ));
        view
    }

    /// An update through one view reaches a second view of the same table:
    /// the peer goes dirty, reloads on next activation, and shows the new
    /// value for the same key even though the row moved to another offset.
    #[tokio::test]
    async fn updates_propagate_to_peer_views_by_primary_key() {
        let backend = RecordingBackend;
        let mut registry = DirtyRegistry::new();

        let mut v1 = loaded_view(1, 0, &[(1, "a@x"), (2, "b@x")]);
        // The peer is scrolled elsewhere; id=2 sits at absolute row 5 there.
        let mut v2 = loaded_view(2, 4, &[(8, "h@x"), (2, "b@x"), (9, "i@x")]);
        v2.set_cursor(5, 1);

        let users = TableKey::for_view(&v1);
        registry.register(users.clone(), v1.id());
        registry.register(TableKey::for_view(&v2), v2.id());

        // v1 edits id=2's email.
        let job = prepare_update(&v1, 1, 1, Value::Text("new@x".to_string()))
            .expect("update should prepare");
        let completion = run_mutation(&backend, job).await;
        assert_eq!(apply_mutation(&mut v1, completion), AppliedMutation::Changed);
        assert_eq!(v1.cell(1, 1), Some(&Value::Text("new@x".to_string())));

        // The UI loop marks every peer under the key dirty.
        for peer in registry.peers_of(&users, v1.id()) {
            assert_eq!(peer, v2.id());
            v2.mark_dirty();
        }
        assert!(v2.is_dirty());

        // v2 regains focus: reload through the normal load path, with the
        // fresh page carrying the updated value at a shifted offset.
        v2.prepare_dirty_reload();
        let generation = v2.begin_load();
        let fresh = Page::new(
            schema(),
            4,
            vec![
                Row::new(vec![Value::Integer(8), Value::Text("h@x".to_string())]),
                Row::new(vec![Value::Integer(9), Value::Text("i@x".to_string())]),
                Row::new(vec![Value::Integer(2), Value::Text("new@x".to_string())]),
            ],
        )
        .expect("page should build");
        assert!(v2.apply_loaded_page(
            generation,
            fresh,
            Some(RowCount {
                total: 7,
                exact: true,
            }),
            false,
        ));

        assert!(!v2.is_dirty());
        // Cursor followed the key to its new offset and sees the update.
        assert_eq!(v2.cursor().0, 6);
        assert_eq!(v2.cell(6, 1), Some(&Value::Text("new@x".to_string())));
    }
}
