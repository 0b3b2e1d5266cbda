// In-memory document store for tests and single-node deployments

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

use super::{DocumentStore, FindOptions, SortOrder, StoreOp};

/// Default backend behind `memory://`. Collections are `BTreeMap`s so
/// unsorted scans come back in stable id order.
#[derive(Debug, Default)]
pub struct InMemoryDocumentStore {
    collections: RwLock<HashMap<&'static str, BTreeMap<String, Value>>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Match one document against a flat filter object
fn matches(doc: &Value, filter: &Value) -> bool {
    let Some(filter) = filter.as_object() else {
        return true;
    };
    filter.iter().all(|(field, expected)| {
        let actual = doc.get(field).unwrap_or(&Value::Null);
        match expected.as_object() {
            Some(ops) if ops.keys().any(|k| k.starts_with('$')) => {
                ops.iter().all(|(op, operand)| match op.as_str() {
                    "$ne" => actual != operand,
                    "$gt" => compare(actual, operand).map(|o| o.is_gt()).unwrap_or(false),
                    "$gte" => compare(actual, operand).map(|o| o.is_ge()).unwrap_or(false),
                    "$lt" => compare(actual, operand).map(|o| o.is_lt()).unwrap_or(false),
                    "$lte" => compare(actual, operand).map(|o| o.is_le()).unwrap_or(false),
                    "$in" => operand
                        .as_array()
                        .map(|candidates| candidates.contains(actual))
                        .unwrap_or(false),
                    _ => false,
                })
            }
            _ => actual == expected,
        }
    })
}

/// Orderable JSON comparison: numbers by value, strings lexicographically
fn compare(left: &Value, right: &Value) -> Option<std::cmp::Ordering> {
    if let (Some(a), Some(b)) = (left.as_f64(), right.as_f64()) {
        return a.partial_cmp(&b);
    }
    if let (Some(a), Some(b)) = (left.as_str(), right.as_str()) {
        return Some(a.cmp(b));
    }
    None
}

fn apply_options(mut docs: Vec<Value>, options: &FindOptions) -> Vec<Value> {
    if let Some((field, order)) = &options.sort {
        docs.sort_by(|a, b| {
            let left = a.get(field).unwrap_or(&Value::Null);
            let right = b.get(field).unwrap_or(&Value::Null);
            let ordering = compare(left, right).unwrap_or(std::cmp::Ordering::Equal);
            match order {
                SortOrder::Ascending => ordering,
                SortOrder::Descending => ordering.reverse(),
            }
        });
    }
    docs.into_iter()
        .skip(options.offset)
        .take(options.limit.unwrap_or(usize::MAX))
        .collect()
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn ping(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn insert(&self, collection: &'static str, id: &str, doc: Value) -> anyhow::Result<()> {
        let mut collections = self.collections.write().await;
        let entries = collections.entry(collection).or_default();
        if entries.contains_key(id) {
            anyhow::bail!("duplicate id '{}' in collection '{}'", id, collection);
        }
        entries.insert(id.to_string(), doc);
        Ok(())
    }

    async fn replace(
        &self,
        collection: &'static str,
        id: &str,
        doc: Value,
    ) -> anyhow::Result<bool> {
        let mut collections = self.collections.write().await;
        let entries = collections.entry(collection).or_default();
        match entries.get_mut(id) {
            Some(slot) => {
                *slot = doc;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn find_one(&self, collection: &'static str, id: &str) -> anyhow::Result<Option<Value>> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .and_then(|entries| entries.get(id))
            .cloned())
    }

    async fn find(
        &self,
        collection: &'static str,
        filter: &Value,
        options: &FindOptions,
    ) -> anyhow::Result<Vec<Value>> {
        let collections = self.collections.read().await;
        let docs = collections
            .get(collection)
            .map(|entries| {
                entries
                    .values()
                    .filter(|doc| matches(doc, filter))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(apply_options(docs, options))
    }

    async fn count(&self, collection: &'static str, filter: &Value) -> anyhow::Result<u64> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .map(|entries| entries.values().filter(|doc| matches(doc, filter)).count() as u64)
            .unwrap_or(0))
    }

    async fn commit(&self, ops: Vec<StoreOp>) -> anyhow::Result<()> {
        // One write guard for the whole batch is the commit scope
        let mut collections = self.collections.write().await;
        for op in &ops {
            if let StoreOp::Insert { collection, id, .. } = op {
                if collections
                    .get(collection)
                    .map(|entries| entries.contains_key(id))
                    .unwrap_or(false)
                {
                    anyhow::bail!("duplicate id '{}' in collection '{}'", id, collection);
                }
            }
        }
        for op in ops {
            match op {
                StoreOp::Insert { collection, id, doc } => {
                    collections.entry(collection).or_default().insert(id, doc);
                }
                StoreOp::Replace { collection, id, doc } => {
                    let entries = collections.entry(collection).or_default();
                    if !entries.contains_key(&id) {
                        anyhow::bail!("replace of missing id '{}' in '{}'", id, collection);
                    }
                    entries.insert(id, doc);
                }
            }
        }
        Ok(())
    }

    async fn delete_many(&self, collection: &'static str, filter: &Value) -> anyhow::Result<u64> {
        let mut collections = self.collections.write().await;
        let Some(entries) = collections.get_mut(collection) else {
            return Ok(0);
        };
        let before = entries.len();
        entries.retain(|_, doc| !matches(doc, filter));
        Ok((before - entries.len()) as u64)
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn insert_rejects_duplicates() {
        let store = InMemoryDocumentStore::new();
        store.insert("workflows", "a", json!({"x": 1})).await.unwrap();
        assert!(store.insert("workflows", "a", json!({"x": 2})).await.is_err());
    }

    #[tokio::test]
    async fn filter_operators() {
        let store = InMemoryDocumentStore::new();
        for (id, score) in [("a", 1), ("b", 5), ("c", 9)] {
            store
                .insert("docs", id, json!({"score": score, "tenant_id": "t1"}))
                .await
                .unwrap();
        }
        let gt = store
            .find("docs", &json!({"score": {"$gt": 4}}), &FindOptions::default())
            .await
            .unwrap();
        assert_eq!(gt.len(), 2);
        let ne = store
            .find("docs", &json!({"score": {"$ne": 5}}), &FindOptions::default())
            .await
            .unwrap();
        assert_eq!(ne.len(), 2);
        let within = store
            .find("docs", &json!({"score": {"$in": [1, 9]}}), &FindOptions::default())
            .await
            .unwrap();
        assert_eq!(within.len(), 2);
        assert_eq!(
            store.count("docs", &json!({"tenant_id": "t1"})).await.unwrap(),
            3
        );
    }

    #[tokio::test]
    async fn sort_and_pagination() {
        let store = InMemoryDocumentStore::new();
        for (id, seq) in [("a", 2), ("b", 0), ("c", 1)] {
            store.insert("docs", id, json!({"seq": seq})).await.unwrap();
        }
        let sorted = store
            .find(
                "docs",
                &json!({}),
                &FindOptions::sorted_desc("seq").with_limit(2),
            )
            .await
            .unwrap();
        assert_eq!(sorted[0]["seq"], json!(2));
        assert_eq!(sorted[1]["seq"], json!(1));
    }

    #[tokio::test]
    async fn commit_applies_batch() {
        let store = InMemoryDocumentStore::new();
        store.insert("docs", "a", json!({"v": 1})).await.unwrap();
        store
            .commit(vec![
                StoreOp::Replace {
                    collection: "docs",
                    id: "a".to_string(),
                    doc: json!({"v": 2}),
                },
                StoreOp::Insert {
                    collection: "audit_events",
                    id: "e1".to_string(),
                    doc: json!({"event": "update"}),
                },
            ])
            .await
            .unwrap();
        assert_eq!(
            store.find_one("docs", "a").await.unwrap().unwrap()["v"],
            json!(2)
        );
        assert!(store.find_one("audit_events", "e1").await.unwrap().is_some());
    }
}
