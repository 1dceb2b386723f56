//! Canonical binary encoding of query arguments and results.
//!
//! The codec is deterministic and injective: structurally equal values
//! always produce byte-identical output, and `decode(encode(x)) == x` for
//! every valid input. The encoded argument sequence is the memo-key
//! pre-image, so any change here changes every key in the cache.
//!
//! Wire rules: counts and lengths are 32-bit little-endian; scalars are
//! 8-byte little-endian two's complement; strings are length-prefixed
//! UTF-8 (validated on both paths); every variant carries an explicit
//! 8-bit tag, never a memory-layout discriminant.

use crate::error::QueryError;
use crate::key::ContentId;

const ARG_TAG_CID: u8 = 0;
const ARG_TAG_SCALAR: u8 = 1;
const ARG_TAG_STRING: u8 = 2;

/// One canonical query argument.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum QueryArg {
    /// A content identifier.
    Cid(ContentId),
    /// A signed 64-bit scalar.
    Scalar(i64),
    /// A UTF-8 string.
    Str(String),
}

impl QueryArg {
    /// Builds a string argument from raw bytes, validating UTF-8.
    ///
    /// Hosts that construct arguments from foreign buffers (the C-ABI
    /// gasket in particular) must come through here; `QueryArg::Str` on a
    /// Rust `String` is canonical by construction.
    pub fn str_from_bytes(bytes: Vec<u8>) -> Result<Self, QueryError> {
        String::from_utf8(bytes)
            .map(QueryArg::Str)
            .map_err(|_| QueryError::NonCanonicalArg)
    }
}

/// Symbol-resolution payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SymbolInfo {
    /// Resolved symbol name.
    pub name: String,
    /// CID of the defining node.
    pub definition: ContentId,
}

/// Type-inference payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TypeInfo {
    /// Rendered type name.
    pub name: String,
    /// CID of the type declaration, when the type is nominal.
    pub declaration: Option<ContentId>,
}

/// Dispatch-resolution payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DispatchInfo {
    /// The selected target.
    pub target: ContentId,
    /// Every candidate considered, in resolution order.
    pub candidates: Vec<ContentId>,
}

/// Effect-analysis payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EffectsInfo {
    /// Effect labels, in analysis order.
    pub labels: Vec<String>,
}

/// Definition-lookup payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DefinitionInfo {
    /// CID of the defining node.
    pub node: ContentId,
    /// Byte span of the definition within its source unit.
    pub span: (u32, u32),
}

/// Hover payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HoverInfo {
    /// Markdown-ish hover text.
    pub text: String,
    /// Rendered type of the hovered entity.
    pub type_name: String,
}

/// IR-lowering payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IrInfo {
    /// CID of the lowered unit.
    pub unit: ContentId,
    /// Encoded IR bytes.
    pub bytes: Vec<u8>,
}

/// The closed set of query results. Tag discriminants 0..=6 are part of
/// the wire format.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueryResult {
    /// Result of `resolveName`.
    Symbol(SymbolInfo),
    /// Result of `typeOf`.
    Type(TypeInfo),
    /// Result of `dispatch`.
    Dispatch(DispatchInfo),
    /// Result of `effectsOf`.
    Effects(EffectsInfo),
    /// Result of `definitionOf`.
    Definition(DefinitionInfo),
    /// Result of `hover`.
    Hover(HoverInfo),
    /// Result of `irOf`.
    Ir(IrInfo),
}

impl QueryResult {
    fn tag(&self) -> u8 {
        match self {
            QueryResult::Symbol(_) => 0,
            QueryResult::Type(_) => 1,
            QueryResult::Dispatch(_) => 2,
            QueryResult::Effects(_) => 3,
            QueryResult::Definition(_) => 4,
            QueryResult::Hover(_) => 5,
            QueryResult::Ir(_) => 6,
        }
    }
}

/// Encodes an argument sequence: 32-bit LE count, then tagged payloads.
///
/// Infallible: UTF-8 validation happens where bytes enter the system
/// ([`QueryArg::str_from_bytes`] and [`decode_args`]), so every
/// constructed `QueryArg` already has a canonical form.
pub fn encode_args(args: &[QueryArg]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + args.len() * 16);
    out.extend_from_slice(&(args.len() as u32).to_le_bytes());
    for arg in args {
        match arg {
            QueryArg::Cid(cid) => {
                out.push(ARG_TAG_CID);
                out.extend_from_slice(cid.as_bytes());
            }
            QueryArg::Scalar(value) => {
                out.push(ARG_TAG_SCALAR);
                out.extend_from_slice(&value.to_le_bytes());
            }
            QueryArg::Str(text) => {
                out.push(ARG_TAG_STRING);
                write_bytes(&mut out, text.as_bytes());
            }
        }
    }
    out
}

/// Decodes an argument sequence produced by [`encode_args`].
pub fn decode_args(data: &[u8]) -> Result<Vec<QueryArg>, QueryError> {
    let mut cursor = Cursor::new(data);
    let count = cursor.read_u32()?;
    let mut args = Vec::with_capacity(count.min(1024) as usize);
    for _ in 0..count {
        let tag = cursor.read_u8()?;
        let arg = match tag {
            ARG_TAG_CID => QueryArg::Cid(cursor.read_cid()?),
            ARG_TAG_SCALAR => QueryArg::Scalar(i64::from_le_bytes(cursor.read_array()?)),
            ARG_TAG_STRING => QueryArg::Str(cursor.read_string()?),
            other => return Err(QueryError::InvalidArgType(other)),
        };
        args.push(arg);
    }
    Ok(args)
}

/// Encodes a result variant: 8-bit tag, then fields in declaration order.
pub fn encode_result(result: &QueryResult) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    out.push(result.tag());
    match result {
        QueryResult::Symbol(info) => {
            write_bytes(&mut out, info.name.as_bytes());
            out.extend_from_slice(info.definition.as_bytes());
        }
        QueryResult::Type(info) => {
            write_bytes(&mut out, info.name.as_bytes());
            match &info.declaration {
                None => out.push(0),
                Some(cid) => {
                    out.push(1);
                    out.extend_from_slice(cid.as_bytes());
                }
            }
        }
        QueryResult::Dispatch(info) => {
            out.extend_from_slice(info.target.as_bytes());
            out.extend_from_slice(&(info.candidates.len() as u32).to_le_bytes());
            for cid in &info.candidates {
                out.extend_from_slice(cid.as_bytes());
            }
        }
        QueryResult::Effects(info) => {
            out.extend_from_slice(&(info.labels.len() as u32).to_le_bytes());
            for label in &info.labels {
                write_bytes(&mut out, label.as_bytes());
            }
        }
        QueryResult::Definition(info) => {
            out.extend_from_slice(info.node.as_bytes());
            out.extend_from_slice(&info.span.0.to_le_bytes());
            out.extend_from_slice(&info.span.1.to_le_bytes());
        }
        QueryResult::Hover(info) => {
            write_bytes(&mut out, info.text.as_bytes());
            write_bytes(&mut out, info.type_name.as_bytes());
        }
        QueryResult::Ir(info) => {
            out.extend_from_slice(info.unit.as_bytes());
            write_bytes(&mut out, &info.bytes);
        }
    }
    out
}

/// Decodes a result variant produced by [`encode_result`].
pub fn decode_result(data: &[u8]) -> Result<QueryResult, QueryError> {
    let mut cursor = Cursor::new(data);
    let tag = cursor.read_u8()?;
    let result = match tag {
        0 => QueryResult::Symbol(SymbolInfo {
            name: cursor.read_string()?,
            definition: cursor.read_cid()?,
        }),
        1 => {
            let name = cursor.read_string()?;
            let declaration = match cursor.read_u8()? {
                0 => None,
                1 => Some(cursor.read_cid()?),
                other => return Err(QueryError::InvalidResultType(other)),
            };
            QueryResult::Type(TypeInfo { name, declaration })
        }
        2 => {
            let target = cursor.read_cid()?;
            let count = cursor.read_u32()?;
            let mut candidates = Vec::with_capacity(count.min(1024) as usize);
            for _ in 0..count {
                candidates.push(cursor.read_cid()?);
            }
            QueryResult::Dispatch(DispatchInfo { target, candidates })
        }
        3 => {
            let count = cursor.read_u32()?;
            let mut labels = Vec::with_capacity(count.min(1024) as usize);
            for _ in 0..count {
                labels.push(cursor.read_string()?);
            }
            QueryResult::Effects(EffectsInfo { labels })
        }
        4 => QueryResult::Definition(DefinitionInfo {
            node: cursor.read_cid()?,
            span: (
                u32::from_le_bytes(cursor.read_array()?),
                u32::from_le_bytes(cursor.read_array()?),
            ),
        }),
        5 => QueryResult::Hover(HoverInfo {
            text: cursor.read_string()?,
            type_name: cursor.read_string()?,
        }),
        6 => QueryResult::Ir(IrInfo {
            unit: cursor.read_cid()?,
            bytes: cursor.read_len_prefixed()?.to_vec(),
        }),
        other => return Err(QueryError::InvalidResultType(other)),
    };
    Ok(result)
}

fn write_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(bytes);
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Cursor { data, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], QueryError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or(QueryError::UnexpectedEndOfData)?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, QueryError> {
        Ok(self.take(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32, QueryError> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], QueryError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn read_cid(&mut self) -> Result<ContentId, QueryError> {
        Ok(ContentId(self.read_array()?))
    }

    fn read_len_prefixed(&mut self) -> Result<&'a [u8], QueryError> {
        let len = self.read_u32()? as usize;
        self.take(len)
    }

    fn read_string(&mut self) -> Result<String, QueryError> {
        let bytes = self.read_len_prefixed()?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| QueryError::NonCanonicalArg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cid(fill: u8) -> ContentId {
        ContentId([fill; 32])
    }

    #[test]
    fn args_round_trip() {
        let args = vec![
            QueryArg::Cid(cid(7)),
            QueryArg::Scalar(-42),
            QueryArg::Str("hello κόσμε".to_owned()),
            QueryArg::Scalar(i64::MIN),
        ];
        let encoded = encode_args(&args);
        assert_eq!(decode_args(&encoded).unwrap(), args);
    }

    #[test]
    fn empty_args_encode_to_count_only() {
        let encoded = encode_args(&[]);
        assert_eq!(encoded, vec![0, 0, 0, 0]);
        assert_eq!(decode_args(&encoded).unwrap(), Vec::<QueryArg>::new());
    }

    #[test]
    fn scalar_is_little_endian_twos_complement() {
        let encoded = encode_args(&[QueryArg::Scalar(-2)]);
        // count=1, tag=1, then 0xFE FF FF FF FF FF FF FF
        assert_eq!(&encoded[..5], &[1, 0, 0, 0, ARG_TAG_SCALAR]);
        assert_eq!(&encoded[5..], &[0xFE, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn equal_values_encode_identically() {
        let a = vec![QueryArg::Str("x".into()), QueryArg::Cid(cid(1))];
        let b = vec![QueryArg::Str("x".into()), QueryArg::Cid(cid(1))];
        assert_eq!(encode_args(&a), encode_args(&b));
    }

    #[test]
    fn unknown_arg_tag_is_rejected() {
        let mut encoded = encode_args(&[QueryArg::Scalar(1)]);
        encoded[4] = 9;
        assert_eq!(
            decode_args(&encoded).unwrap_err(),
            QueryError::InvalidArgType(9)
        );
    }

    #[test]
    fn truncated_buffer_is_rejected() {
        let encoded = encode_args(&[QueryArg::Cid(cid(3))]);
        for cut in 0..encoded.len() {
            let err = decode_args(&encoded[..cut]);
            if cut < encoded.len() {
                assert!(err.is_err(), "cut at {} decoded", cut);
            }
        }
    }

    #[test]
    fn invalid_utf8_string_is_rejected_on_decode() {
        // count=1, tag=string, len=2, bytes = invalid continuation
        let raw = [1, 0, 0, 0, ARG_TAG_STRING, 2, 0, 0, 0, 0xC3, 0x28];
        assert_eq!(
            decode_args(&raw).unwrap_err(),
            QueryError::NonCanonicalArg
        );
    }

    #[test]
    fn every_result_variant_round_trips() {
        let results = vec![
            QueryResult::Symbol(SymbolInfo {
                name: "visit".into(),
                definition: cid(1),
            }),
            QueryResult::Type(TypeInfo {
                name: "List[Int]".into(),
                declaration: Some(cid(2)),
            }),
            QueryResult::Type(TypeInfo {
                name: "Int".into(),
                declaration: None,
            }),
            QueryResult::Dispatch(DispatchInfo {
                target: cid(3),
                candidates: vec![cid(3), cid(4), cid(5)],
            }),
            QueryResult::Effects(EffectsInfo {
                labels: vec!["io".into(), "alloc".into()],
            }),
            QueryResult::Definition(DefinitionInfo {
                node: cid(6),
                span: (10, 42),
            }),
            QueryResult::Hover(HoverInfo {
                text: "fn visit(node: Node)".into(),
                type_name: "(Node) -> Unit".into(),
            }),
            QueryResult::Ir(IrInfo {
                unit: cid(7),
                bytes: vec![0xDE, 0xAD, 0xBE, 0xEF],
            }),
        ];
        for result in results {
            let encoded = encode_result(&result);
            assert_eq!(decode_result(&encoded).unwrap(), result, "{:?}", result);
        }
    }

    #[test]
    fn unknown_result_tag_is_rejected() {
        assert_eq!(
            decode_result(&[200]).unwrap_err(),
            QueryError::InvalidResultType(200)
        );
    }

    #[test]
    fn truncated_result_is_rejected() {
        let encoded = encode_result(&QueryResult::Hover(HoverInfo {
            text: "t".into(),
            type_name: "u".into(),
        }));
        assert_eq!(
            decode_result(&encoded[..encoded.len() - 1]).unwrap_err(),
            QueryError::UnexpectedEndOfData
        );
    }
}
