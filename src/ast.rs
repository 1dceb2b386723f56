//! The AST-database collaborator.
//!
//! The engine never parses anything itself: hosts hand it an
//! implementation of [`AstDatabase`] and queries read nodes through the
//! query context so every lookup is captured as a content dependency.
//! Implementations must be pure with respect to their inputs — the same
//! CID always yields the same view within one revision of the corpus.

use crate::error::QueryError;
use crate::key::ContentId;

/// Syntactic category of a node view.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum NodeKind {
    /// A module root; owns a scope.
    Module,
    /// A function or method definition.
    Function,
    /// A nominal type definition.
    TypeDef,
    /// Any expression.
    Expr,
    /// An identifier reference.
    Ident,
    /// A literal value.
    Literal,
}

/// A host-materialized view of one AST node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeView {
    /// Syntactic category.
    pub kind: NodeKind,
    /// Byte span within the node's source unit.
    pub span: (u32, u32),
    /// Child nodes, in source order.
    pub children: Vec<ContentId>,
    /// The scope this node resolves names in.
    pub scope: ContentId,
}

/// One entry of a scope's declaration list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Declaration {
    /// Declared name.
    pub name: String,
    /// CID of the declaring node.
    pub node: ContentId,
}

/// Read-only access to the host's AST store.
///
/// Required error: [`QueryError::NodeNotFound`] for a CID the store does
/// not know. Implementations must not observe engine state; the engine
/// calls these methods while holding no locks.
pub trait AstDatabase: Send + Sync {
    /// Materializes the node behind `cid`.
    fn node(&self, cid: ContentId) -> Result<NodeView, QueryError>;

    /// Lists the declarations of a scope, in declaration order.
    fn declarations(&self, scope: ContentId) -> Result<Vec<Declaration>, QueryError>;
}
