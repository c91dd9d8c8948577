//! Live query predicates and the subscription index.
//!
//! Predicates are deliberately small — equality and membership over
//! document attributes — so re-evaluating every live query after a
//! mutation is an attribute match, never an arbitrary function. Cost per
//! mutation is bounded by the number of subscriptions on the mutated
//! collection.
//!
//! The index owns every subscription's result set and is the only code
//! that mutates them. Delivery is the server's job: `notify` returns the
//! add/change/remove events and the server routes each one through the
//! receiving session's mediator before transmission.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::value::{CellValue, Collection, DocData};

/// Attribute name that resolves to the document id.
pub const ID_ATTR: &str = "id";

/// A live query predicate over document attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Predicate {
    /// Matches every document in the collection.
    All,
    /// Matches nothing; the narrowed form of a foreign-table query.
    Nothing,
    Eq { attr: String, value: CellValue },
    In { attr: String, values: Vec<CellValue> },
    NotIn { attr: String, values: Vec<CellValue> },
    And(Vec<Predicate>),
}

impl Predicate {
    /// Equality on the document id.
    pub fn id_eq(id: impl Into<String>) -> Self {
        Predicate::Eq { attr: ID_ATTR.into(), value: CellValue::Text(id.into()) }
    }

    /// Exclusion on the document id.
    pub fn id_not_in<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Predicate::NotIn {
            attr: ID_ATTR.into(),
            values: ids.into_iter().map(|s| CellValue::Text(s.into())).collect(),
        }
    }

    /// Conjunction, flattening trivial cases.
    pub fn and(self, other: Predicate) -> Predicate {
        match (self, other) {
            (Predicate::All, p) | (p, Predicate::All) => p,
            (Predicate::Nothing, _) | (_, Predicate::Nothing) => Predicate::Nothing,
            (Predicate::And(mut l), Predicate::And(r)) => {
                l.extend(r);
                Predicate::And(l)
            }
            (Predicate::And(mut l), p) => {
                l.push(p);
                Predicate::And(l)
            }
            (p, Predicate::And(mut r)) => {
                r.insert(0, p);
                Predicate::And(r)
            }
            (l, r) => Predicate::And(vec![l, r]),
        }
    }

    /// Evaluate against one document.
    pub fn matches(&self, doc_id: &str, data: &DocData) -> bool {
        match self {
            Predicate::All => true,
            Predicate::Nothing => false,
            Predicate::Eq { attr, value } => {
                attr_value(attr, doc_id, data).map_or(false, |v| v == *value)
            }
            Predicate::In { attr, values } => {
                attr_value(attr, doc_id, data).map_or(false, |v| values.contains(&v))
            }
            Predicate::NotIn { attr, values } => {
                // A missing attribute is trivially not in the set.
                attr_value(attr, doc_id, data).map_or(true, |v| !values.contains(&v))
            }
            Predicate::And(preds) => preds.iter().all(|p| p.matches(doc_id, data)),
        }
    }
}

fn attr_value(attr: &str, doc_id: &str, data: &DocData) -> Option<CellValue> {
    if attr == ID_ATTR {
        Some(CellValue::Text(doc_id.to_string()))
    } else {
        data.get(attr).cloned()
    }
}

/// How a document moved relative to a subscription's result set.
#[derive(Debug, Clone, PartialEq)]
pub enum DocChange {
    /// Newly matches; carries the snapshot to deliver.
    Added { version: u64, data: DocData },
    /// Still matches; the applied edits are delivered.
    Changed,
    /// No longer matches.
    Removed,
}

/// One fan-out event produced by a mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryEvent {
    pub subscription_id: Uuid,
    pub session_id: Uuid,
    pub collection: Collection,
    pub doc_id: String,
    pub change: DocChange,
}

/// A live query owned by the index.
#[derive(Debug)]
struct Subscription {
    session_id: Uuid,
    collection: Collection,
    /// Effective predicate — already narrowed by the mediator.
    predicate: Predicate,
    result_set: HashSet<String>,
}

#[derive(Default)]
struct IndexInner {
    subs: HashMap<Uuid, Subscription>,
    by_collection: HashMap<Collection, HashSet<Uuid>>,
    by_session: HashMap<Uuid, HashSet<Uuid>>,
}

/// Maps live queries to matching document sets and re-evaluates them on
/// every accepted mutation.
pub struct SubscriptionIndex {
    inner: RwLock<IndexInner>,
}

impl Default for SubscriptionIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionIndex {
    pub fn new() -> Self {
        Self { inner: RwLock::new(IndexInner::default()) }
    }

    /// Register a live query. `initial_docs` is the collection scan the
    /// caller fetched from the store; the returned ids are the documents
    /// matching the predicate right now.
    pub async fn subscribe(
        &self,
        session_id: Uuid,
        collection: Collection,
        predicate: Predicate,
        initial_docs: &[(String, DocData, u64)],
    ) -> (Uuid, Vec<String>) {
        let sub_id = Uuid::new_v4();
        let matching = self
            .subscribe_as(sub_id, session_id, collection, predicate, initial_docs)
            .await;
        (sub_id, matching)
    }

    /// Register a live query under a caller-assigned id, so the caller
    /// can tear it down even when setup is abandoned mid-flight.
    pub async fn subscribe_as(
        &self,
        subscription_id: Uuid,
        session_id: Uuid,
        collection: Collection,
        predicate: Predicate,
        initial_docs: &[(String, DocData, u64)],
    ) -> Vec<String> {
        let matching: Vec<String> = initial_docs
            .iter()
            .filter(|(id, data, _)| predicate.matches(id, data))
            .map(|(id, _, _)| id.clone())
            .collect();

        let mut inner = self.inner.write().await;
        inner.subs.insert(
            subscription_id,
            Subscription {
                session_id,
                collection: collection.clone(),
                predicate,
                result_set: matching.iter().cloned().collect(),
            },
        );
        inner.by_collection.entry(collection).or_default().insert(subscription_id);
        inner.by_session.entry(session_id).or_default().insert(subscription_id);

        log::debug!(
            "Subscription {subscription_id} registered ({} initial matches)",
            matching.len()
        );
        matching
    }

    /// Fold a collection scan into an already-registered subscription's
    /// result set, returning the ids that match. Registering before
    /// scanning means a document committed in between shows up either
    /// here or as an `Added` event (possibly both); seeding keeps a
    /// concurrently-added document matched instead of double-adding it.
    pub async fn seed(
        &self,
        subscription_id: &Uuid,
        docs: &[(String, DocData, u64)],
    ) -> Vec<String> {
        let mut inner = self.inner.write().await;
        let sub = match inner.subs.get_mut(subscription_id) {
            Some(s) => s,
            None => return Vec::new(),
        };
        let mut matching = Vec::new();
        for (id, data, _) in docs {
            if sub.predicate.matches(id, data) {
                sub.result_set.insert(id.clone());
                matching.push(id.clone());
            }
        }
        matching
    }

    /// Tear down one subscription. Returns false if unknown.
    pub async fn unsubscribe(&self, subscription_id: &Uuid) -> bool {
        let mut inner = self.inner.write().await;
        let sub = match inner.subs.remove(subscription_id) {
            Some(s) => s,
            None => return false,
        };
        if let Some(set) = inner.by_collection.get_mut(&sub.collection) {
            set.remove(subscription_id);
            if set.is_empty() {
                inner.by_collection.remove(&sub.collection);
            }
        }
        if let Some(set) = inner.by_session.get_mut(&sub.session_id) {
            set.remove(subscription_id);
            if set.is_empty() {
                inner.by_session.remove(&sub.session_id);
            }
        }
        true
    }

    /// Tear down every subscription a session owns (disconnect path).
    pub async fn remove_session(&self, session_id: &Uuid) -> usize {
        let sub_ids: Vec<Uuid> = {
            let inner = self.inner.read().await;
            inner
                .by_session
                .get(session_id)
                .map(|s| s.iter().copied().collect())
                .unwrap_or_default()
        };
        for sub_id in &sub_ids {
            self.unsubscribe(sub_id).await;
        }
        sub_ids.len()
    }

    /// Re-evaluate all live predicates on the mutated collection and
    /// update result sets. Returns the events to fan out.
    pub async fn notify(
        &self,
        collection: &Collection,
        doc_id: &str,
        data: &DocData,
        version: u64,
    ) -> Vec<QueryEvent> {
        let mut inner = self.inner.write().await;
        let sub_ids: Vec<Uuid> = match inner.by_collection.get(collection) {
            Some(set) => set.iter().copied().collect(),
            None => return Vec::new(),
        };

        let mut events = Vec::new();
        for sub_id in sub_ids {
            let sub = match inner.subs.get_mut(&sub_id) {
                Some(s) => s,
                None => continue,
            };
            let matches = sub.predicate.matches(doc_id, data);
            let was_member = sub.result_set.contains(doc_id);

            let change = match (was_member, matches) {
                (false, true) => {
                    sub.result_set.insert(doc_id.to_string());
                    DocChange::Added { version, data: data.clone() }
                }
                (true, true) => DocChange::Changed,
                (true, false) => {
                    sub.result_set.remove(doc_id);
                    DocChange::Removed
                }
                (false, false) => continue,
            };

            events.push(QueryEvent {
                subscription_id: sub_id,
                session_id: sub.session_id,
                collection: collection.clone(),
                doc_id: doc_id.to_string(),
                change,
            });
        }
        events
    }

    /// Number of live subscriptions.
    pub async fn subscription_count(&self) -> usize {
        self.inner.read().await.subs.len()
    }

    /// The session owning a subscription, if it is still live.
    pub async fn session_of(&self, subscription_id: &Uuid) -> Option<Uuid> {
        self.inner.read().await.subs.get(subscription_id).map(|s| s.session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(pairs: &[(&str, &str)]) -> DocData {
        DocData::from_pairs(pairs.iter().map(|(k, v)| (*k, *v)))
    }

    #[test]
    fn test_predicate_eq_attr() {
        let p = Predicate::Eq { attr: "type".into(), value: "grid".into() };
        assert!(p.matches("doc1", &doc(&[("type", "grid")])));
        assert!(!p.matches("doc1", &doc(&[("type", "form")])));
        assert!(!p.matches("doc1", &doc(&[])));
    }

    #[test]
    fn test_predicate_id_eq() {
        let p = Predicate::id_eq("viw1");
        assert!(p.matches("viw1", &doc(&[])));
        assert!(!p.matches("viw2", &doc(&[])));
    }

    #[test]
    fn test_predicate_not_in() {
        let p = Predicate::id_not_in(["f20"]);
        assert!(p.matches("f1", &doc(&[])));
        assert!(!p.matches("f20", &doc(&[])));
    }

    #[test]
    fn test_predicate_not_in_missing_attr() {
        let p = Predicate::NotIn { attr: "status".into(), values: vec!["done".into()] };
        assert!(p.matches("doc1", &doc(&[])));
        assert!(!p.matches("doc1", &doc(&[("status", "done")])));
    }

    #[test]
    fn test_predicate_in() {
        let p = Predicate::In { attr: "status".into(), values: vec!["a".into(), "b".into()] };
        assert!(p.matches("d", &doc(&[("status", "a")])));
        assert!(!p.matches("d", &doc(&[("status", "c")])));
    }

    #[test]
    fn test_predicate_and_flattening() {
        assert_eq!(Predicate::All.and(Predicate::id_eq("x")), Predicate::id_eq("x"));
        assert_eq!(Predicate::id_eq("x").and(Predicate::All), Predicate::id_eq("x"));
        assert_eq!(Predicate::Nothing.and(Predicate::All), Predicate::Nothing);

        let p = Predicate::id_eq("x").and(Predicate::id_not_in(["y"]));
        assert!(matches!(&p, Predicate::And(v) if v.len() == 2));
        assert!(p.matches("x", &doc(&[])));
        assert!(!p.matches("y", &doc(&[])));
    }

    #[tokio::test]
    async fn test_subscribe_initial_result_set() {
        let index = SubscriptionIndex::new();
        let docs = vec![
            ("f1".to_string(), doc(&[]), 1),
            ("f2".to_string(), doc(&[]), 1),
            ("f20".to_string(), doc(&[]), 1),
        ];
        let (sub_id, matching) = index
            .subscribe(
                Uuid::new_v4(),
                Collection::fields("tbl1"),
                Predicate::id_not_in(["f20"]),
                &docs,
            )
            .await;
        assert_eq!(matching.len(), 2);
        assert!(!matching.contains(&"f20".to_string()));
        assert!(index.unsubscribe(&sub_id).await);
        assert!(!index.unsubscribe(&sub_id).await);
    }

    #[tokio::test]
    async fn test_notify_added_changed_removed() {
        let index = SubscriptionIndex::new();
        let session = Uuid::new_v4();
        let collection = Collection::records("tbl1");
        let p = Predicate::Eq { attr: "status".into(), value: "open".into() };

        let (sub_id, matching) = index.subscribe(session, collection.clone(), p, &[]).await;
        assert!(matching.is_empty());

        // Document enters the result set.
        let open = doc(&[("status", "open")]);
        let events = index.notify(&collection, "rec1", &open, 1).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].subscription_id, sub_id);
        assert!(matches!(events[0].change, DocChange::Added { version: 1, .. }));

        // Still matching: changed.
        let events = index.notify(&collection, "rec1", &open, 2).await;
        assert_eq!(events[0].change, DocChange::Changed);

        // Stops matching: removed.
        let closed = doc(&[("status", "closed")]);
        let events = index.notify(&collection, "rec1", &closed, 3).await;
        assert_eq!(events[0].change, DocChange::Removed);

        // Never matched and still doesn't: no event.
        let events = index.notify(&collection, "rec2", &closed, 1).await;
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_seed_after_concurrent_notify() {
        let index = SubscriptionIndex::new();
        let session = Uuid::new_v4();
        let collection = Collection::records("tbl1");
        let sub_id = Uuid::new_v4();
        index
            .subscribe_as(sub_id, session, collection.clone(), Predicate::All, &[])
            .await;

        // A document commits between registration and the scan.
        let events = index.notify(&collection, "rec1", &doc(&[]), 1).await;
        assert!(matches!(events[0].change, DocChange::Added { .. }));

        // The scan then sees the same document; seeding keeps it in
        // the result set without forgetting it.
        let matching = index.seed(&sub_id, &[("rec1".into(), doc(&[]), 1)]).await;
        assert_eq!(matching, vec!["rec1".to_string()]);
        let events = index.notify(&collection, "rec1", &doc(&[]), 2).await;
        assert_eq!(events[0].change, DocChange::Changed);
    }

    #[tokio::test]
    async fn test_seed_unknown_subscription() {
        let index = SubscriptionIndex::new();
        let matching = index
            .seed(&Uuid::new_v4(), &[("rec1".into(), doc(&[]), 1)])
            .await;
        assert!(matching.is_empty());
    }

    #[tokio::test]
    async fn test_notify_collection_isolation() {
        let index = SubscriptionIndex::new();
        let session = Uuid::new_v4();
        index
            .subscribe(session, Collection::records("tbl1"), Predicate::All, &[])
            .await;

        let events = index
            .notify(&Collection::records("tbl2"), "rec1", &doc(&[]), 1)
            .await;
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_remove_session() {
        let index = SubscriptionIndex::new();
        let session = Uuid::new_v4();
        let other = Uuid::new_v4();

        index.subscribe(session, Collection::records("tbl1"), Predicate::All, &[]).await;
        index.subscribe(session, Collection::fields("tbl1"), Predicate::All, &[]).await;
        index.subscribe(other, Collection::records("tbl1"), Predicate::All, &[]).await;

        assert_eq!(index.subscription_count().await, 3);
        assert_eq!(index.remove_session(&session).await, 2);
        assert_eq!(index.subscription_count().await, 1);
        assert_eq!(index.remove_session(&session).await, 0);
    }

    #[tokio::test]
    async fn test_session_of() {
        let index = SubscriptionIndex::new();
        let session = Uuid::new_v4();
        let (sub_id, _) = index
            .subscribe(session, Collection::views("tbl1"), Predicate::All, &[])
            .await;
        assert_eq!(index.session_of(&sub_id).await, Some(session));
        index.unsubscribe(&sub_id).await;
        assert_eq!(index.session_of(&sub_id).await, None);
    }
}
