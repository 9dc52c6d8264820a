use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::sync::RwLock;

use super::{
    ensure_id, Collection, Database, DbError, DocumentStream, FindOptions, IndexModel, SortOrder,
};
use crate::document::{Document, Value};

/// Keeps every collection in process memory. Clones share the same data.
#[derive(Clone, Default)]
pub struct MemoryDatabase {
    collections: Arc<RwLock<HashMap<String, Arc<MemoryCollection>>>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn collection(&self, name: &str) -> Result<Arc<dyn Collection>, DbError> {
        let mut collections = self.collections.write().await;
        let collection: Arc<dyn Collection> = collections
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryCollection::new(name)))
            .clone();
        Ok(collection)
    }
}

pub struct MemoryCollection {
    name: String,
    state: RwLock<State>,
}

#[derive(Default)]
struct State {
    docs: Vec<Document>,
    indexes: Vec<IndexModel>,
}

impl MemoryCollection {
    pub fn new(name: &str) -> Self {
        MemoryCollection {
            name: name.to_string(),
            state: RwLock::new(State::default()),
        }
    }
}

fn index_key(doc: &Document, index: &IndexModel) -> Vec<Value> {
    index
        .keys
        .iter()
        .map(|(field, _)| doc.get(field).cloned().unwrap_or(Value::Null))
        .collect()
}

fn render_key(key: &[Value]) -> String {
    let parts: Vec<String> = key.iter().map(|v| v.to_string()).collect();
    format!("({})", parts.join(", "))
}

fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Int32(_) | Value::Int64(_) | Value::Double(_) => 1,
        Value::String(_) => 2,
        Value::Document(_) => 3,
        Value::Array(_) => 4,
        Value::Binary(_) => 5,
        Value::Id(_) => 6,
        Value::Bool(_) => 7,
        Value::DateTime(_) => 8,
    }
}

fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Int32(n) => Some(f64::from(*n)),
        Value::Int64(n) => Some(*n as f64),
        Value::Double(n) => Some(*n),
        _ => None,
    }
}

/// Total order over values used for sorting; numbers compare by magnitude
/// regardless of width, other types are grouped by type first.
fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Int32(x), Value::Int32(y)) => x.cmp(y),
        (Value::Int64(x), Value::Int64(y)) => x.cmp(y),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Id(x), Value::Id(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::DateTime(x), Value::DateTime(y)) => x.cmp(y),
        (Value::Binary(x), Value::Binary(y)) => x.cmp(y),
        _ => match (as_f64(a), as_f64(b)) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            _ => type_rank(a).cmp(&type_rank(b)),
        },
    }
}

fn compare_docs(a: &Document, b: &Document, sort: &[(String, SortOrder)]) -> Ordering {
    for (field, order) in sort {
        let ord = compare_values(
            a.get(field).unwrap_or(&Value::Null),
            b.get(field).unwrap_or(&Value::Null),
        );
        let ord = match order {
            SortOrder::Ascending => ord,
            SortOrder::Descending => ord.reverse(),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

#[async_trait]
impl Collection for MemoryCollection {
    fn name(&self) -> &str {
        &self.name
    }

    async fn insert(&self, mut doc: Document) -> Result<Value, DbError> {
        let mut state = self.state.write().await;
        let id = ensure_id(&mut doc);

        if state.docs.iter().any(|d| d.get("_id") == Some(&id)) {
            return Err(DbError::DuplicateKey {
                index: "_id_".to_string(),
                key: id.to_string(),
            });
        }
        for index in state.indexes.iter().filter(|i| i.unique) {
            let key = index_key(&doc, index);
            if state.docs.iter().any(|d| index_key(d, index) == key) {
                return Err(DbError::DuplicateKey {
                    index: index.name.clone(),
                    key: render_key(&key),
                });
            }
        }

        state.docs.push(doc);
        Ok(id)
    }

    async fn find(&self, filter: Document, options: FindOptions) -> Result<DocumentStream, DbError> {
        let state = self.state.read().await;
        let mut docs: Vec<Document> = state
            .docs
            .iter()
            .filter(|d| d.matches(&filter))
            .cloned()
            .collect();
        drop(state);

        if !options.sort.is_empty() {
            docs.sort_by(|a, b| compare_docs(a, b, &options.sort));
        }

        let skip = usize::try_from(options.skip).unwrap_or(usize::MAX);
        let limit = match options.limit {
            0 => usize::MAX,
            n => usize::try_from(n).unwrap_or(usize::MAX),
        };
        let projection = options.projection;

        let docs = docs.into_iter().skip(skip).take(limit).map(move |d| match &projection {
            Some(fields) => Ok(d.project(fields)),
            None => Ok(d),
        });

        Ok(stream::iter(docs).boxed())
    }

    async fn find_one(&self, filter: Document) -> Result<Option<Document>, DbError> {
        let state = self.state.read().await;
        Ok(state.docs.iter().find(|d| d.matches(&filter)).cloned())
    }

    async fn create_index(&self, index: IndexModel) -> Result<(), DbError> {
        let mut state = self.state.write().await;

        if let Some(existing) = state.indexes.iter().find(|i| i.name == index.name) {
            if existing.same_definition(&index) {
                return Ok(());
            }
            return Err(DbError::IndexConflict(index.name));
        }

        if index.unique {
            let mut seen: Vec<Vec<Value>> = Vec::with_capacity(state.docs.len());
            for doc in &state.docs {
                let key = index_key(doc, &index);
                if seen.contains(&key) {
                    return Err(DbError::DuplicateKey {
                        index: index.name,
                        key: render_key(&key),
                    });
                }
                seen.push(key);
            }
        }

        state.indexes.push(index);
        Ok(())
    }

    async fn list_indexes(&self) -> Result<Vec<IndexModel>, DbError> {
        Ok(self.state.read().await.indexes.clone())
    }

    async fn delete_many(&self, filter: Document) -> Result<u64, DbError> {
        let mut state = self.state.write().await;
        let before = state.docs.len();
        state.docs.retain(|d| !d.matches(&filter));
        Ok((before - state.docs.len()) as u64)
    }
}
