use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::buffer::PartitionedBufferPool;
use crate::common::value::ValueType;
use crate::common::{Lsn, PageId, INVALID_LSN};
use crate::error::{DbError, Result};
use crate::storage::TableHeap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub ty: ValueType,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Schema {
    pub columns: Vec<ColumnDef>,
}

impl Schema {
    pub fn new(columns: Vec<(&str, ValueType)>) -> Self {
        Self {
            columns: columns
                .into_iter()
                .map(|(name, ty)| ColumnDef {
                    name: name.to_string(),
                    ty,
                })
                .collect(),
        }
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }
}

/// One table as the core sees it: name, schema, the live heap and the
/// core-owned checkpoint LSN used by time travel.
pub struct TableEntry {
    pub name: String,
    pub schema: Schema,
    pub heap: TableHeap,
    checkpoint_lsn: AtomicI32,
}

impl TableEntry {
    pub fn checkpoint_lsn(&self) -> Lsn {
        self.checkpoint_lsn.load(Ordering::SeqCst)
    }

    pub fn set_checkpoint_lsn(&self, lsn: Lsn) {
        self.checkpoint_lsn.store(lsn, Ordering::SeqCst);
    }
}

#[derive(Serialize, Deserialize)]
struct TableRecord {
    name: String,
    schema: Schema,
    first_page_id: PageId,
    checkpoint_lsn: Lsn,
}

#[derive(Serialize, Deserialize, Default)]
struct CatalogFile {
    tables: Vec<TableRecord>,
}

/// Table registry for one database.
///
/// The SQL layer owns the richer catalog; the core needs lookup by name,
/// iteration, checkpoint-LSN tagging and durable save/load. Persisted as
/// JSON next to the database file, rewritten via temp-and-rename.
pub struct Catalog {
    bpm: Arc<PartitionedBufferPool>,
    tables: DashMap<String, Arc<TableEntry>>,
    catalog_path: PathBuf,
}

impl Catalog {
    pub fn new(bpm: Arc<PartitionedBufferPool>, db_dir: impl AsRef<Path>) -> Result<Self> {
        let db_dir = db_dir.as_ref();
        std::fs::create_dir_all(db_dir)?;
        let catalog = Self {
            bpm,
            tables: DashMap::new(),
            catalog_path: db_dir.join("catalog.json"),
        };
        catalog.load()?;
        Ok(catalog)
    }

    pub fn create_table(&self, name: &str, schema: Schema) -> Result<Arc<TableEntry>> {
        if self.tables.contains_key(name) {
            return Err(DbError::AlreadyExists(format!("table {}", name)));
        }
        let heap = TableHeap::create(self.bpm.clone())?;
        let entry = Arc::new(TableEntry {
            name: name.to_string(),
            schema,
            heap,
            checkpoint_lsn: AtomicI32::new(INVALID_LSN),
        });
        self.tables.insert(name.to_string(), entry.clone());
        info!(table = name, "created table");
        Ok(entry)
    }

    /// Drop a table and release its pages.
    pub fn drop_table(&self, name: &str) -> Result<()> {
        let (_, entry) = self
            .tables
            .remove(name)
            .ok_or_else(|| DbError::NotFound(format!("table {}", name)))?;
        entry.heap.truncate(INVALID_LSN)?;
        self.bpm.delete_page(entry.heap.first_page_id())?;
        info!(table = name, "dropped table");
        Ok(())
    }

    pub fn table(&self, name: &str) -> Option<Arc<TableEntry>> {
        self.tables.get(name).map(|e| e.value().clone())
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn all_tables(&self) -> Vec<Arc<TableEntry>> {
        let mut tables: Vec<Arc<TableEntry>> =
            self.tables.iter().map(|e| e.value().clone()).collect();
        tables.sort_by(|a, b| a.name.cmp(&b.name));
        tables
    }

    /// Tag every table with the LSN of the checkpoint that observed it.
    pub fn set_all_checkpoint_lsns(&self, lsn: Lsn) {
        for entry in self.tables.iter() {
            entry.value().set_checkpoint_lsn(lsn);
        }
    }

    /// Persist the registry. Written to a temp file first, then renamed.
    pub fn save(&self) -> Result<()> {
        let file = CatalogFile {
            tables: self
                .all_tables()
                .iter()
                .map(|entry| TableRecord {
                    name: entry.name.clone(),
                    schema: entry.schema.clone(),
                    first_page_id: entry.heap.first_page_id(),
                    checkpoint_lsn: entry.checkpoint_lsn(),
                })
                .collect(),
        };
        let json = serde_json::to_string_pretty(&file)?;
        let tmp_path = self.catalog_path.with_extension("json.tmp");
        std::fs::write(&tmp_path, json)?;
        std::fs::rename(&tmp_path, &self.catalog_path)?;
        Ok(())
    }

    fn load(&self) -> Result<()> {
        if !self.catalog_path.exists() {
            return Ok(());
        }
        let json = std::fs::read_to_string(&self.catalog_path)?;
        let file: CatalogFile = serde_json::from_str(&json)?;
        for record in file.tables {
            let heap = TableHeap::open(self.bpm.clone(), record.first_page_id);
            self.tables.insert(
                record.name.clone(),
                Arc::new(TableEntry {
                    name: record.name,
                    schema: record.schema,
                    heap,
                    checkpoint_lsn: AtomicI32::new(record.checkpoint_lsn),
                }),
            );
        }
        info!(tables = self.tables.len(), "loaded catalog");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::ReplacerPolicy;
    use crate::common::value::Value;
    use crate::storage::DiskManager;
    use tempfile::tempdir;

    fn make_bpm(dir: &Path) -> Arc<PartitionedBufferPool> {
        let disk = Arc::new(DiskManager::new(dir.join("cat")).unwrap());
        Arc::new(PartitionedBufferPool::new(32, 4, ReplacerPolicy::Lru, disk).unwrap())
    }

    fn users_schema() -> Schema {
        Schema::new(vec![("id", ValueType::Int), ("name", ValueType::Text)])
    }

    #[test]
    fn test_create_and_lookup() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::new(make_bpm(dir.path()), dir.path()).unwrap();

        catalog.create_table("users", users_schema()).unwrap();
        assert!(catalog.table("users").is_some());
        assert!(catalog.table("ghosts").is_none());
        assert!(matches!(
            catalog.create_table("users", users_schema()),
            Err(DbError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_drop_removes_table() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::new(make_bpm(dir.path()), dir.path()).unwrap();
        catalog.create_table("users", users_schema()).unwrap();
        catalog.drop_table("users").unwrap();
        assert!(catalog.table("users").is_none());
        assert!(matches!(
            catalog.drop_table("users"),
            Err(DbError::NotFound(_))
        ));
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempdir().unwrap();
        let bpm = make_bpm(dir.path());
        {
            let catalog = Catalog::new(bpm.clone(), dir.path()).unwrap();
            let entry = catalog.create_table("users", users_schema()).unwrap();
            entry
                .heap
                .insert_row(&vec![Value::Int(1), Value::Text("a".to_string())], 5)
                .unwrap();
            entry.set_checkpoint_lsn(42);
            catalog.save().unwrap();
            bpm.flush_all().unwrap();
        }

        let reloaded = Catalog::new(bpm, dir.path()).unwrap();
        let entry = reloaded.table("users").unwrap();
        assert_eq!(entry.checkpoint_lsn(), 42);
        assert_eq!(
            entry.heap.scan().unwrap(),
            vec![vec![Value::Int(1), Value::Text("a".to_string())]]
        );
    }

    #[test]
    fn test_checkpoint_lsn_tagging() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::new(make_bpm(dir.path()), dir.path()).unwrap();
        catalog.create_table("a", users_schema()).unwrap();
        catalog.create_table("b", users_schema()).unwrap();
        catalog.set_all_checkpoint_lsns(77);
        for entry in catalog.all_tables() {
            assert_eq!(entry.checkpoint_lsn(), 77);
        }
    }
}
