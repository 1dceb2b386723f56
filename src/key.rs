//! Content identifiers, query kinds, and memo keys.
//!
//! Everything the engine memoizes is addressed by a [`MemoKey`]: the BLAKE3
//! digest of the query kind's stable tag name concatenated with the
//! canonical encoding of its arguments. Two executions share a memo key if
//! and only if they are semantically the same query.

use std::fmt;

/// A 32-byte content identifier naming a persistent entity (an AST node, a
/// source unit, a type definition).
///
/// CIDs are opaque to the engine: two values are equal exactly when their
/// bytes are equal, and no structure is ever read out of them.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentId(pub [u8; 32]);

impl ContentId {
    /// Byte view of the identifier.
    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Derives a CID from arbitrary bytes. Hosts normally mint CIDs
    /// themselves; this is a convenience for fixtures and tests.
    pub fn hash_of(data: &[u8]) -> Self {
        ContentId(*blake3::hash(data).as_bytes())
    }
}

impl fmt::Debug for ContentId {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "cid:")?;
        for byte in &self.0[..8] {
            write!(fmt, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// The closed set of semantic query kinds the engine hosts.
///
/// The tag *name* (not the discriminant) is part of the memo-key pre-image,
/// so renaming a variant changes every key of that kind.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueryKind {
    /// Resolve an identifier to its declaration.
    ResolveName,
    /// Infer the type of an expression or declaration.
    TypeOf,
    /// Resolve a dispatch site to its target and candidate set.
    Dispatch,
    /// Compute the effect labels of a function body.
    EffectsOf,
    /// Find the defining node of a symbol.
    DefinitionOf,
    /// Produce hover text for a node.
    Hover,
    /// Lower a definition to IR.
    IrOf,
}

impl QueryKind {
    /// Stable name hashed into the memo key.
    pub fn tag_name(self) -> &'static str {
        match self {
            QueryKind::ResolveName => "resolveName",
            QueryKind::TypeOf => "typeOf",
            QueryKind::Dispatch => "dispatch",
            QueryKind::EffectsOf => "effectsOf",
            QueryKind::DefinitionOf => "definitionOf",
            QueryKind::Hover => "hover",
            QueryKind::IrOf => "irOf",
        }
    }

    /// All kinds, for iteration in telemetry and tests.
    pub const ALL: [QueryKind; 7] = [
        QueryKind::ResolveName,
        QueryKind::TypeOf,
        QueryKind::Dispatch,
        QueryKind::EffectsOf,
        QueryKind::DefinitionOf,
        QueryKind::Hover,
        QueryKind::IrOf,
    ];
}

/// A 32-byte identifier of a specific `(query kind, canonical args)` pair.
///
/// Equal keys imply semantically identical queries; the cache, the
/// dependency graph, and the cycle detector all speak in memo keys.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemoKey([u8; 32]);

impl MemoKey {
    /// Computes `BLAKE3(tag-name ‖ canonical-args)`.
    pub fn compute(kind: QueryKind, canonical_args: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(kind.tag_name().as_bytes());
        hasher.update(canonical_args);
        MemoKey(*hasher.finalize().as_bytes())
    }

    /// Byte view of the key.
    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// The low 32 bits of the key, read little-endian. Shard selection in
    /// the memo cache derives from this value.
    #[inline]
    pub fn low_bits(&self) -> u32 {
        u32::from_le_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }

    #[cfg(test)]
    pub(crate) fn from_raw(bytes: [u8; 32]) -> Self {
        MemoKey(bytes)
    }
}

impl fmt::Debug for MemoKey {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "memo:")?;
        for byte in &self.0[..8] {
            write!(fmt, "{:02x}", byte)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cid_equality_is_byte_equality() {
        let a = ContentId([1; 32]);
        let b = ContentId([1; 32]);
        let c = ContentId([2; 32]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn memo_key_depends_on_kind_name() {
        let args = b"same-bytes";
        let hover = MemoKey::compute(QueryKind::Hover, args);
        let types = MemoKey::compute(QueryKind::TypeOf, args);
        assert_ne!(hover, types);
        assert_eq!(hover, MemoKey::compute(QueryKind::Hover, args));
    }

    #[test]
    fn memo_key_depends_on_args() {
        let a = MemoKey::compute(QueryKind::Hover, b"a");
        let b = MemoKey::compute(QueryKind::Hover, b"b");
        assert_ne!(a, b);
    }

    #[test]
    fn low_bits_are_little_endian() {
        let mut raw = [0u8; 32];
        raw[0] = 0x78;
        raw[1] = 0x56;
        raw[2] = 0x34;
        raw[3] = 0x12;
        assert_eq!(MemoKey::from_raw(raw).low_bits(), 0x1234_5678);
    }

    #[test]
    fn debug_renders_prefix() {
        let key = MemoKey::compute(QueryKind::Hover, b"");
        let rendered = format!("{:?}", key);
        assert!(rendered.starts_with("memo:"));
        assert_eq!(rendered.len(), "memo:".len() + 16);
    }
}
