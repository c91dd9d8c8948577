//! Access-control mediator.
//!
//! Every inbound operation and every outbound snapshot or delta crosses
//! this module. A connection is either unscoped (full read/write) or
//! bound — once, at connect time — to a share scope derived from a share
//! token: one originating view, a hidden-field set, and a read-only
//! flag. The scope never changes for the life of the connection.
//!
//! Rejected writes are stopped here, before the transform engine, so a
//! denied operation never advances a document version or reaches any
//! op-log. Outbound filtering is applied per receiving session, so
//! hidden data never transiently appears on the wire.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use crate::edit::{Edit, Operation};
use crate::protocol::ErrorCode;
use crate::query::Predicate;
use crate::value::{Collection, CollectionKind, DocData};

/// The restriction set derived from one share token.
#[derive(Debug, Clone, PartialEq)]
pub struct ShareScope {
    pub share_id: String,
    /// The view this share was created from.
    pub view_id: String,
    /// The table owning that view; collections of other tables are
    /// invisible to this scope.
    pub table_id: String,
    /// Field ids marked hidden in the view's column metadata.
    pub hidden_fields: HashSet<String>,
    /// Extra record restriction supplied by the resolver (e.g. only
    /// records visible through the view). `All` when unrestricted.
    pub record_predicate: Predicate,
    pub read_only: bool,
}

impl ShareScope {
    pub fn new(
        share_id: impl Into<String>,
        view_id: impl Into<String>,
        table_id: impl Into<String>,
        hidden_fields: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            share_id: share_id.into(),
            view_id: view_id.into(),
            table_id: table_id.into(),
            hidden_fields: hidden_fields.into_iter().collect(),
            record_predicate: Predicate::All,
            read_only: true,
        }
    }
}

/// Per-connection authorization context. Immutable after creation.
#[derive(Debug, Clone, PartialEq)]
pub enum Scope {
    /// Full read/write rights.
    Unscoped,
    /// Restricted to one share's view of one table.
    Scoped(ShareScope),
}

impl Scope {
    pub fn is_scoped(&self) -> bool {
        matches!(self, Scope::Scoped(_))
    }

    pub fn is_read_only(&self) -> bool {
        match self {
            Scope::Unscoped => false,
            Scope::Scoped(s) => s.read_only,
        }
    }
}

/// Resolves a share token to its restriction set.
///
/// Owned by the business layer in production; [`StaticShareResolver`]
/// backs tests and demos.
pub trait ShareTokenResolver: Send + Sync {
    fn resolve(&self, share_id: &str) -> Option<ShareScope>;
}

/// In-memory token registry.
#[derive(Default)]
pub struct StaticShareResolver {
    shares: RwLock<HashMap<String, ShareScope>>,
}

impl StaticShareResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, scope: ShareScope) {
        let mut shares = match self.shares.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        shares.insert(scope.share_id.clone(), scope);
    }

    pub fn revoke(&self, share_id: &str) -> bool {
        let mut shares = match self.shares.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        shares.remove(share_id).is_some()
    }
}

impl ShareTokenResolver for StaticShareResolver {
    fn resolve(&self, share_id: &str) -> Option<ShareScope> {
        let shares = match self.shares.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        shares.get(share_id).cloned()
    }
}

/// Intercepts every operation and every query result for a session.
pub struct AccessMediator {
    resolver: Arc<dyn ShareTokenResolver>,
}

impl AccessMediator {
    pub fn new(resolver: Arc<dyn ShareTokenResolver>) -> Self {
        Self { resolver }
    }

    /// Stamp a connection with its scope at connect time.
    ///
    /// No token means full rights; a token that does not resolve denies
    /// connection setup entirely — the caller must close the transport
    /// without creating a session.
    pub fn scope_for(&self, share_token: Option<&str>) -> Result<Scope, ErrorCode> {
        match share_token {
            None => Ok(Scope::Unscoped),
            Some(token) => match self.resolver.resolve(token) {
                Some(share) => {
                    log::info!(
                        "Share token resolved to view {} (hidden fields: {})",
                        share.view_id,
                        share.hidden_fields.len()
                    );
                    Ok(Scope::Scoped(share))
                }
                None => {
                    log::warn!("Unresolvable share token presented at connect");
                    Err(ErrorCode::Unauthorized)
                }
            },
        }
    }

    /// Authorize a mutating operation. Checked before the transform
    /// engine so a denied write leaves no trace.
    pub fn authorize_write(&self, scope: &Scope, op: &Operation) -> Result<(), ErrorCode> {
        match scope {
            Scope::Unscoped => Ok(()),
            Scope::Scoped(share) if share.read_only => {
                log::debug!(
                    "Write to {}/{} denied for read-only share {}",
                    op.collection,
                    op.doc_id,
                    share.share_id
                );
                Err(ErrorCode::RestrictedResource)
            }
            Scope::Scoped(_) => Ok(()),
        }
    }

    /// Narrow a caller's predicate to what the scope may see.
    pub fn authorize_query(
        &self,
        scope: &Scope,
        collection: &Collection,
        predicate: Predicate,
    ) -> Predicate {
        let share = match scope {
            Scope::Unscoped => return predicate,
            Scope::Scoped(s) => s,
        };
        if collection.table_id != share.table_id {
            return Predicate::Nothing;
        }
        match collection.kind {
            // Only the view the share was created from.
            CollectionKind::View => predicate.and(Predicate::id_eq(share.view_id.clone())),
            // Every field except the hidden ones.
            CollectionKind::Field => {
                predicate.and(Predicate::id_not_in(share.hidden_fields.iter().cloned()))
            }
            // Records visible through the view, per the resolver.
            CollectionKind::Record => predicate.and(share.record_predicate.clone()),
        }
    }

    /// Strip hidden field values from an outbound snapshot.
    pub fn filter_snapshot(
        &self,
        scope: &Scope,
        collection: &Collection,
        data: &DocData,
    ) -> DocData {
        let share = match scope {
            Scope::Unscoped => return data.clone(),
            Scope::Scoped(s) => s,
        };
        if collection.kind != CollectionKind::Record || share.hidden_fields.is_empty() {
            return data.clone();
        }
        let mut filtered = data.clone();
        for field_id in &share.hidden_fields {
            filtered.remove(field_id);
        }
        filtered
    }

    /// Strip edits touching hidden fields from an outbound delta. The
    /// frame is still delivered (possibly with no edits) so the
    /// receiver's version sequence stays gap-free.
    pub fn filter_edits(
        &self,
        scope: &Scope,
        collection: &Collection,
        edits: &[Edit],
    ) -> Vec<Edit> {
        let share = match scope {
            Scope::Unscoped => return edits.to_vec(),
            Scope::Scoped(s) => s,
        };
        if collection.kind != CollectionKind::Record || share.hidden_fields.is_empty() {
            return edits.to_vec();
        }
        edits
            .iter()
            .filter_map(|edit| match edit {
                Edit::Replace { data } => Some(Edit::Replace {
                    data: self.filter_snapshot(scope, collection, data),
                }),
                e => match e.field_id() {
                    Some(f) if share.hidden_fields.contains(f) => None,
                    _ => Some(e.clone()),
                },
            })
            .collect()
    }
}
