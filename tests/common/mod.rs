//! Shared fixtures for the integration suites.

use sovereign::{
    AstDatabase, ContentId, Declaration, NodeKind, NodeView, QueryError,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// In-memory AST database with instrumented lookup counters.
pub struct FixtureAst {
    nodes: Mutex<HashMap<ContentId, NodeView>>,
    decls: Mutex<HashMap<ContentId, Vec<Declaration>>>,
    node_lookups: AtomicUsize,
}

impl FixtureAst {
    pub fn new() -> Self {
        FixtureAst {
            nodes: Mutex::new(HashMap::new()),
            decls: Mutex::new(HashMap::new()),
            node_lookups: AtomicUsize::new(0),
        }
    }

    /// Inserts a leaf expression node and returns its CID.
    pub fn add_expr(&self, label: &str, scope: ContentId) -> ContentId {
        let cid = ContentId::hash_of(label.as_bytes());
        self.nodes.lock().unwrap().insert(
            cid,
            NodeView {
                kind: NodeKind::Expr,
                span: (0, label.len() as u32),
                children: Vec::new(),
                scope,
            },
        );
        cid
    }

    /// Inserts a module node owning `decls` and returns its CID.
    pub fn add_module(&self, label: &str, decls: Vec<Declaration>) -> ContentId {
        let cid = ContentId::hash_of(label.as_bytes());
        self.nodes.lock().unwrap().insert(
            cid,
            NodeView {
                kind: NodeKind::Module,
                span: (0, 0),
                children: decls.iter().map(|decl| decl.node).collect(),
                scope: cid,
            },
        );
        self.decls.lock().unwrap().insert(cid, decls);
        cid
    }

    /// How many `node` lookups the engine has issued.
    pub fn node_lookups(&self) -> usize {
        self.node_lookups.load(Ordering::SeqCst)
    }
}

impl AstDatabase for FixtureAst {
    fn node(&self, cid: ContentId) -> Result<NodeView, QueryError> {
        self.node_lookups.fetch_add(1, Ordering::SeqCst);
        self.nodes
            .lock()
            .unwrap()
            .get(&cid)
            .cloned()
            .ok_or(QueryError::NodeNotFound(cid))
    }

    fn declarations(&self, scope: ContentId) -> Result<Vec<Declaration>, QueryError> {
        self.decls
            .lock()
            .unwrap()
            .get(&scope)
            .cloned()
            .ok_or(QueryError::NotAModule(scope))
    }
}
