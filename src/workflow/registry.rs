/// Hot-reload table catalog using ArcSwap
///
/// Holds the registered tables that SQL lineage is resolved against. Readers take a
/// snapshot of the whole catalog, so a sync attempt sees one consistent catalog
/// even when an operator replaces it mid-flight.

use anyhow::Context;
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// One registered table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableRef {
    pub id: i64,
    /// Database or schema the table lives in
    #[serde(default)]
    pub database: Option<String>,
    pub name: String,
}

impl TableRef {
    pub fn qualified_name(&self) -> String {
        match &self.database {
            Some(database) => format!("{}.{}", database, self.name),
            None => self.name.clone(),
        }
    }
}

/// Outcome of resolving a table name against the catalog
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableMatch {
    Unique(i64),
    Ambiguous(Vec<i64>),
    Unmatched,
}

/// Immutable set of registered tables keyed by id
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableCatalog {
    tables: BTreeMap<i64, TableRef>,
}

impl TableCatalog {
    pub fn new(tables: impl IntoIterator<Item = TableRef>) -> Self {
        Self {
            tables: tables.into_iter().map(|table| (table.id, table)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn get(&self, id: i64) -> Option<&TableRef> {
        self.tables.get(&id)
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableRef> {
        self.tables.values()
    }

    /// Resolve a table reference as written in SQL
    ///
    /// `db.table` must match both parts; a bare name matches that table in any
    /// database. Comparison ignores case and identifier quoting.
    pub fn resolve(&self, raw_name: &str) -> TableMatch {
        let cleaned: String = raw_name
            .chars()
            .filter(|c| !matches!(c, '`' | '"' | '[' | ']'))
            .collect::<String>()
            .trim()
            .to_lowercase();

        let (database, name) = match cleaned.rsplit_once('.') {
            Some((database, name)) => (Some(database), name),
            None => (None, cleaned.as_str()),
        };

        let ids: Vec<i64> = self
            .tables
            .values()
            .filter(|table| table.name.to_lowercase() == name)
            .filter(|table| match database {
                Some(database) => table
                    .database
                    .as_deref()
                    .map(|candidate| candidate.to_lowercase() == database)
                    .unwrap_or(false),
                None => true,
            })
            .map(|table| table.id)
            .collect();

        match ids.len() {
            0 => TableMatch::Unmatched,
            1 => TableMatch::Unique(ids[0]),
            _ => TableMatch::Ambiguous(ids),
        }
    }
}

/// Lock-free catalog holder
///
/// Every reload swaps the whole catalog pointer; in-flight readers keep the
/// snapshot they loaded.
#[derive(Debug)]
pub struct CatalogRegistry {
    catalog: ArcSwap<TableCatalog>,
}

impl CatalogRegistry {
    pub fn new(catalog: TableCatalog) -> Self {
        Self {
            catalog: ArcSwap::new(Arc::new(catalog)),
        }
    }

    /// Current catalog (lock-free read)
    pub fn snapshot(&self) -> Arc<TableCatalog> {
        self.catalog.load_full()
    }

    /// Replace the catalog atomically, returning the number of tables now registered
    pub fn reload(&self, tables: Vec<TableRef>) -> usize {
        let catalog = TableCatalog::new(tables);
        let count = catalog.len();
        self.catalog.store(Arc::new(catalog));
        tracing::info!("🔄 Reloaded table catalog with {} tables", count);
        count
    }

    /// Read a JSON array of tables from disk
    pub async fn load_file(path: impl AsRef<Path>) -> anyhow::Result<TableCatalog> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading table catalog {}", path.display()))?;
        let tables: Vec<TableRef> = serde_json::from_str(&raw)
            .with_context(|| format!("parsing table catalog {}", path.display()))?;
        Ok(TableCatalog::new(tables))
    }
}

impl Default for CatalogRegistry {
    fn default() -> Self {
        Self::new(TableCatalog::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(id: i64, database: &str, name: &str) -> TableRef {
        TableRef {
            id,
            database: Some(database.to_string()),
            name: name.to_string(),
        }
    }

    fn catalog() -> TableCatalog {
        TableCatalog::new(vec![
            table(1, "ods", "orders"),
            table(2, "dwd", "orders"),
            table(3, "dwd", "order_items"),
        ])
    }

    #[test]
    fn test_qualified_names_resolve_uniquely() {
        let catalog = catalog();

        assert_eq!(catalog.resolve("ods.orders"), TableMatch::Unique(1));
        assert_eq!(catalog.resolve("`DWD`.`Orders`"), TableMatch::Unique(2));
        assert_eq!(catalog.resolve("order_items"), TableMatch::Unique(3));
    }

    #[test]
    fn test_bare_name_in_two_databases_is_ambiguous() {
        assert_eq!(catalog().resolve("orders"), TableMatch::Ambiguous(vec![1, 2]));
        assert_eq!(catalog().resolve("ads.orders"), TableMatch::Unmatched);
        assert_eq!(catalog().resolve("customers"), TableMatch::Unmatched);
    }

    #[test]
    fn test_reload_swaps_whole_catalog() {
        let registry = CatalogRegistry::new(catalog());
        let before = registry.snapshot();

        let count = registry.reload(vec![table(9, "ods", "payments")]);

        assert_eq!(count, 1);
        assert_eq!(before.len(), 3);
        assert_eq!(registry.snapshot().resolve("payments"), TableMatch::Unique(9));
        assert_eq!(registry.snapshot().resolve("ods.orders"), TableMatch::Unmatched);
    }

    #[tokio::test]
    async fn test_load_file() {
        let path = std::env::temp_dir().join(format!("mechasync-catalog-{}.json", uuid::Uuid::new_v4()));
        tokio::fs::write(&path, r#"[{"id": 4, "database": "ods", "name": "users"}, {"id": 5, "name": "events"}]"#)
            .await
            .unwrap();

        let catalog = CatalogRegistry::load_file(&path).await.unwrap();
        tokio::fs::remove_file(&path).await.unwrap();

        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.get(5).unwrap().qualified_name(), "events");
        assert_eq!(catalog.resolve("ods.users"), TableMatch::Unique(4));
    }
}
