//! Key-value store boundary used by the save/load surface. On-disk engines
//! plug in through the registry; the built-in `memdb` keeps named stores in
//! process memory, which is all the core itself needs.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, Once};

use anyhow::{anyhow, Result};
use once_cell::sync::Lazy;

use crate::error::RunError;
use crate::registry::Registry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbMode {
    Read,
    New,
    WriteAppend,
}

impl DbMode {
    pub fn parse(raw: &str) -> Result<DbMode> {
        match raw {
            "read" => Ok(DbMode::Read),
            "new" => Ok(DbMode::New),
            "write_append" => Ok(DbMode::WriteAppend),
            other => Err(anyhow!("unknown db mode {}", other)),
        }
    }
}

pub trait DbCursor: Send {
    fn valid(&self) -> bool;
    fn key(&self) -> String;
    fn value(&self) -> Vec<u8>;
    fn next(&mut self);
    fn seek_to_first(&mut self);
}

pub trait DbTransaction: Send {
    fn put(&mut self, key: &str, value: Vec<u8>);
    fn commit(&mut self) -> Result<()>;
}

pub trait Database: Send + Sync {
    fn new_cursor(&self) -> Result<Box<dyn DbCursor>>;
    fn new_transaction(&self) -> Result<Box<dyn DbTransaction>>;
}

pub type DbFactory = Arc<dyn Fn(&str, DbMode) -> Result<Box<dyn Database>> + Send + Sync>;

static DB_REGISTRY: Lazy<Registry<String, DbFactory>> = Lazy::new(|| Registry::new("db"));
static BUILTIN_DBS: Once = Once::new();

pub fn register_db(kind: impl Into<String>, factory: DbFactory) {
    DB_REGISTRY.register(kind.into(), factory);
}

fn ensure_builtin_dbs() {
    BUILTIN_DBS.call_once(|| {
        register_db("memdb", Arc::new(|path, mode| MemDb::open(path, mode)));
    });
}

pub fn open_db(kind: &str, path: &str, mode: DbMode) -> Result<Box<dyn Database>> {
    ensure_builtin_dbs();
    let factory = DB_REGISTRY
        .get(&kind.to_string())
        .ok_or_else(|| anyhow!(RunError::NotFound(format!("db kind {}", kind))))?;
    factory(path, mode)
}

type Store = Arc<Mutex<BTreeMap<String, Vec<u8>>>>;

static MEM_STORES: Lazy<Mutex<HashMap<String, Store>>> = Lazy::new(|| Mutex::new(HashMap::new()));

/// In-memory database: stores are global per path, so a store written by a
/// save op is readable by a later load op in the same process.
pub struct MemDb {
    store: Store,
}

impl MemDb {
    pub fn open(path: &str, mode: DbMode) -> Result<Box<dyn Database>> {
        let mut stores = MEM_STORES.lock().expect("memdb registry poisoned");
        let store = match mode {
            DbMode::Read => stores
                .get(path)
                .cloned()
                .ok_or_else(|| anyhow!(RunError::NotFound(format!("memdb {}", path))))?,
            DbMode::New => {
                let store: Store = Arc::new(Mutex::new(BTreeMap::new()));
                stores.insert(path.to_string(), Arc::clone(&store));
                store
            }
            DbMode::WriteAppend => stores
                .entry(path.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(BTreeMap::new())))
                .clone(),
        };
        Ok(Box::new(MemDb { store }))
    }
}

impl Database for MemDb {
    fn new_cursor(&self) -> Result<Box<dyn DbCursor>> {
        let entries: Vec<(String, Vec<u8>)> = self
            .store
            .lock()
            .expect("memdb store poisoned")
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(Box::new(MemDbCursor { entries, pos: 0 }))
    }

    fn new_transaction(&self) -> Result<Box<dyn DbTransaction>> {
        Ok(Box::new(MemDbTransaction {
            store: Arc::clone(&self.store),
            pending: Vec::new(),
        }))
    }
}

struct MemDbCursor {
    entries: Vec<(String, Vec<u8>)>,
    pos: usize,
}

impl DbCursor for MemDbCursor {
    fn valid(&self) -> bool {
        self.pos < self.entries.len()
    }

    fn key(&self) -> String {
        self.entries[self.pos].0.clone()
    }

    fn value(&self) -> Vec<u8> {
        self.entries[self.pos].1.clone()
    }

    fn next(&mut self) {
        self.pos += 1;
    }

    fn seek_to_first(&mut self) {
        self.pos = 0;
    }
}

struct MemDbTransaction {
    store: Store,
    pending: Vec<(String, Vec<u8>)>,
}

impl DbTransaction for MemDbTransaction {
    fn put(&mut self, key: &str, value: Vec<u8>) {
        self.pending.push((key.to_string(), value));
    }

    fn commit(&mut self) -> Result<()> {
        let mut store = self.store.lock().expect("memdb store poisoned");
        for (key, value) in self.pending.drain(..) {
            store.insert(key, value);
        }
        Ok(())
    }
}

/// Drop a named in-memory store; tests use this to isolate round-trips.
pub fn drop_mem_store(path: &str) {
    MEM_STORES
        .lock()
        .expect("memdb registry poisoned")
        .remove(path);
}
