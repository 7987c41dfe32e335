//! ECMA-335 metadata reader.
//!
//! Only what virtualization needs is read: the `MethodDef` table with method body
//! addresses, names and signatures, plus `StandAloneSig` rows for local variable
//! types. Everything else in the tables stream is skipped by size.

use crate::error::OpenError;
use crate::model::{Architecture, ManagedSignature, StackType};
use crate::utils::read_le;

const METADATA_SIGNATURE: u64 = 0x424A_5342;

const TABLE_MODULE: usize = 0x00;
const TABLE_TYPE_REF: usize = 0x01;
const TABLE_TYPE_DEF: usize = 0x02;
const TABLE_FIELD: usize = 0x04;
const TABLE_METHOD_DEF: usize = 0x06;
const TABLE_PARAM: usize = 0x08;
const TABLE_INTERFACE_IMPL: usize = 0x09;
const TABLE_MEMBER_REF: usize = 0x0A;
const TABLE_DECL_SECURITY: usize = 0x0E;
const TABLE_STAND_ALONE_SIG: usize = 0x11;
const TABLE_EVENT: usize = 0x14;
const TABLE_PROPERTY: usize = 0x17;
const TABLE_MODULE_REF: usize = 0x1A;
const TABLE_TYPE_SPEC: usize = 0x1B;
const TABLE_ASSEMBLY: usize = 0x20;
const TABLE_ASSEMBLY_REF: usize = 0x23;
const TABLE_FILE: usize = 0x26;
const TABLE_EXPORTED_TYPE: usize = 0x27;
const TABLE_MANIFEST_RESOURCE: usize = 0x28;
const TABLE_GENERIC_PARAM: usize = 0x2A;
const TABLE_METHOD_SPEC: usize = 0x2B;
const TABLE_GENERIC_PARAM_CONSTRAINT: usize = 0x2C;

const TYPE_DEF_OR_REF: &[usize] = &[TABLE_TYPE_DEF, TABLE_TYPE_REF, TABLE_TYPE_SPEC];
const RESOLUTION_SCOPE: &[usize] = &[TABLE_MODULE, TABLE_MODULE_REF, TABLE_ASSEMBLY_REF, TABLE_TYPE_REF];
const MEMBER_REF_PARENT: &[usize] =
    &[TABLE_TYPE_DEF, TABLE_TYPE_REF, TABLE_MODULE_REF, TABLE_METHOD_DEF, TABLE_TYPE_SPEC];
const HAS_CONSTANT: &[usize] = &[TABLE_FIELD, TABLE_PARAM, TABLE_PROPERTY];
const HAS_CUSTOM_ATTRIBUTE: &[usize] = &[
    TABLE_METHOD_DEF,
    TABLE_FIELD,
    TABLE_TYPE_REF,
    TABLE_TYPE_DEF,
    TABLE_PARAM,
    TABLE_INTERFACE_IMPL,
    TABLE_MEMBER_REF,
    TABLE_MODULE,
    TABLE_DECL_SECURITY,
    TABLE_PROPERTY,
    TABLE_EVENT,
    TABLE_STAND_ALONE_SIG,
    TABLE_MODULE_REF,
    TABLE_TYPE_SPEC,
    TABLE_ASSEMBLY,
    TABLE_ASSEMBLY_REF,
    TABLE_FILE,
    TABLE_EXPORTED_TYPE,
    TABLE_MANIFEST_RESOURCE,
    TABLE_GENERIC_PARAM,
    TABLE_GENERIC_PARAM_CONSTRAINT,
    TABLE_METHOD_SPEC,
];
// Tags 0, 1 and 4 are unused but still count towards the tag width.
const CUSTOM_ATTRIBUTE_TYPE: &[usize] = &[TABLE_METHOD_DEF, TABLE_MEMBER_REF, TABLE_METHOD_DEF, TABLE_MEMBER_REF, TABLE_METHOD_DEF];
const HAS_FIELD_MARSHAL: &[usize] = &[TABLE_FIELD, TABLE_PARAM];
const HAS_DECL_SECURITY: &[usize] = &[TABLE_TYPE_DEF, TABLE_METHOD_DEF, TABLE_ASSEMBLY];

const SIG_HASTHIS: u8 = 0x20;
const SIG_GENERIC: u8 = 0x10;
const SIG_LOCAL: u8 = 0x07;
const ELEMENT_VOID: u8 = 0x01;

/// A method with a body in the image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Method {
    pub name: String,
    /// Virtual address of the method body header.
    pub address: u64,
    pub signature: Option<ManagedSignature>,
}

/// Column widths of the tables stream.
struct Widths {
    rows: [u32; 64],
    string: usize,
    guid: usize,
    blob: usize,
}

impl Widths {
    fn index(&self, table: usize) -> usize {
        if self.rows[table] < 1 << 16 {
            2
        } else {
            4
        }
    }

    fn coded(&self, tables: &[usize]) -> usize {
        let tag_bits = usize::BITS - (tables.len() - 1).leading_zeros();
        let max = tables.iter().map(|&t| self.rows[t]).max().unwrap_or(0);
        if u64::from(max) < 1u64 << (16 - tag_bits) {
            2
        } else {
            4
        }
    }

    /// Row size of the tables up to `StandAloneSig`.
    fn row_size(&self, table: usize) -> usize {
        let (s, g, b) = (self.string, self.guid, self.blob);
        match table {
            0x00 => 2 + s + g * 3,
            0x01 => self.coded(RESOLUTION_SCOPE) + s * 2,
            0x02 => 4 + s * 2 + self.coded(TYPE_DEF_OR_REF) + self.index(TABLE_FIELD) + self.index(TABLE_METHOD_DEF),
            0x03 => self.index(TABLE_FIELD),
            0x04 => 2 + s + b,
            0x05 => self.index(TABLE_METHOD_DEF),
            0x06 => 4 + 2 + 2 + s + b + self.index(TABLE_PARAM),
            0x07 => self.index(TABLE_PARAM),
            0x08 => 2 + 2 + s,
            0x09 => self.index(TABLE_TYPE_DEF) + self.coded(TYPE_DEF_OR_REF),
            0x0A => self.coded(MEMBER_REF_PARENT) + s + b,
            0x0B => 2 + self.coded(HAS_CONSTANT) + b,
            0x0C => self.coded(HAS_CUSTOM_ATTRIBUTE) + self.coded(CUSTOM_ATTRIBUTE_TYPE) + b,
            0x0D => self.coded(HAS_FIELD_MARSHAL) + b,
            0x0E => 2 + self.coded(HAS_DECL_SECURITY) + b,
            0x0F => 2 + 4 + self.index(TABLE_TYPE_DEF),
            0x10 => 4 + self.index(TABLE_FIELD),
            0x11 => b,
            _ => 0,
        }
    }
}

/// Reads a compressed unsigned integer, returning the value and its length.
pub fn compressed(bytes: &[u8]) -> Option<(u32, usize)> {
    let first = *bytes.first()?;
    if first & 0x80 == 0 {
        Some((u32::from(first), 1))
    } else if first & 0xC0 == 0x80 {
        Some(((u32::from(first & 0x3F) << 8) | u32::from(*bytes.get(1)?), 2))
    } else if first & 0xE0 == 0xC0 {
        let rest = bytes.get(1..4)?;
        let value = (u32::from(first & 0x1F) << 24)
            | (u32::from(rest[0]) << 16)
            | (u32::from(rest[1]) << 8)
            | u32::from(rest[2]);
        Some((value, 4))
    } else {
        None
    }
}

fn element(code: u8) -> Option<StackType> {
    match code {
        // bool, char, i1 through u4
        0x02..=0x09 => Some(StackType::I4),
        0x0A | 0x0B => Some(StackType::I8),
        _ => None,
    }
}

/// Parses a static method signature whose types all map to `int32` or `int64`.
pub fn method_signature(blob: &[u8]) -> Option<ManagedSignature> {
    let convention = *blob.first()?;
    if convention & (SIG_HASTHIS | SIG_GENERIC) != 0 {
        return None;
    }
    let (count, len) = compressed(&blob[1..])?;
    let mut types = blob.get(1 + len..)?.iter();
    let ret = match *types.next()? {
        ELEMENT_VOID => None,
        code => Some(element(code)?),
    };
    let args = (0..count)
        .map(|_| types.next().and_then(|&code| element(code)))
        .collect::<Option<Vec<_>>>()?;
    Some(ManagedSignature {
        args,
        locals: Vec::new(),
        ret,
    })
}

/// Parses a local variable signature.
pub fn locals_signature(blob: &[u8]) -> Option<Vec<StackType>> {
    if *blob.first()? != SIG_LOCAL {
        return None;
    }
    let (count, len) = compressed(&blob[1..])?;
    let mut types = blob.get(1 + len..)?.iter();
    (0..count).map(|_| types.next().and_then(|&code| element(code))).collect()
}

struct Heaps<'a> {
    strings: &'a [u8],
    blobs: &'a [u8],
}

impl Heaps<'_> {
    fn string(&self, index: u64) -> Option<String> {
        let bytes = self.strings.get(usize::try_from(index).ok()?..)?;
        let end = bytes.iter().position(|&b| b == 0)?;
        Some(String::from_utf8_lossy(&bytes[..end]).into_owned())
    }

    fn blob(&self, index: u64) -> Option<&[u8]> {
        let bytes = self.blobs.get(usize::try_from(index).ok()?..)?;
        let (len, prefix) = compressed(bytes)?;
        bytes.get(prefix..prefix + len as usize)
    }
}

/// The `LocalVarSigTok` of a fat method header, if it has locals.
fn local_var_token(arch: &Architecture, body: u64) -> Option<u64> {
    let header = arch.read(body, 12)?;
    if header[0] & 0x3 != 0x3 {
        return None;
    }
    read_le(header, 8, 4).filter(|&token| token != 0)
}

/// Lists the methods with bodies described by the metadata root at `address`.
pub fn methods(arch: &Architecture, address: u64) -> Result<Vec<Method>, OpenError> {
    let truncated = |what: &str| OpenError::Truncated(format!("CLR metadata {what}"));
    let root = arch.read_available(address, usize::MAX / 2).ok_or_else(|| truncated("root"))?;
    if read_le(root, 0, 4) != Some(METADATA_SIGNATURE) {
        return Err(OpenError::MalformedHeader("missing metadata signature".into()));
    }
    let version_len = read_le(root, 12, 4).ok_or_else(|| truncated("version"))? as usize;
    let mut at = 16 + version_len;
    let stream_count = read_le(root, at + 2, 2).ok_or_else(|| truncated("stream count"))?;
    at += 4;

    let (mut tables, mut strings, mut blobs) = (None, &[][..], &[][..]);
    for _ in 0..stream_count {
        let offset = read_le(root, at, 4).ok_or_else(|| truncated("stream header"))? as usize;
        let size = read_le(root, at + 4, 4).ok_or_else(|| truncated("stream header"))? as usize;
        let name_bytes = root.get(at + 8..).ok_or_else(|| truncated("stream name"))?;
        let name_len = name_bytes.iter().position(|&b| b == 0).ok_or_else(|| truncated("stream name"))?;
        let stream = root.get(offset..offset + size).ok_or_else(|| truncated("stream"))?;
        match &name_bytes[..name_len] {
            b"#~" | b"#-" => tables = Some(stream),
            b"#Strings" => strings = stream,
            b"#Blob" => blobs = stream,
            _ => {}
        }
        at += 8 + (name_len + 4) / 4 * 4;
    }
    let tables = tables.ok_or_else(|| OpenError::MalformedHeader("no metadata tables stream".into()))?;
    let heaps = Heaps { strings, blobs };

    let heap_sizes = *tables.get(6).ok_or_else(|| truncated("tables header"))?;
    let valid = read_le(tables, 8, 8).ok_or_else(|| truncated("tables header"))?;
    let mut widths = Widths {
        rows: [0; 64],
        string: if heap_sizes & 0x01 != 0 { 4 } else { 2 },
        guid: if heap_sizes & 0x02 != 0 { 4 } else { 2 },
        blob: if heap_sizes & 0x04 != 0 { 4 } else { 2 },
    };
    let mut cursor = 24;
    for table in (0..64).filter(|t| valid & (1u64 << t) != 0) {
        widths.rows[table] = read_le(tables, cursor, 4).ok_or_else(|| truncated("row counts"))? as u32;
        cursor += 4;
    }
    let mut table_offsets = [0usize; TABLE_STAND_ALONE_SIG + 1];
    for table in 0..=TABLE_STAND_ALONE_SIG {
        table_offsets[table] = cursor;
        cursor += widths.rows[table] as usize * widths.row_size(table);
    }

    let stand_alone = |row: u64| -> Option<Vec<StackType>> {
        let row = row.checked_sub(1)?;
        if row >= u64::from(widths.rows[TABLE_STAND_ALONE_SIG]) {
            return None;
        }
        let at = table_offsets[TABLE_STAND_ALONE_SIG] + row as usize * widths.blob;
        locals_signature(heaps.blob(read_le(tables, at, widths.blob)?)?)
    };

    let row_size = widths.row_size(TABLE_METHOD_DEF);
    let mut methods = Vec::new();
    for row in 0..widths.rows[TABLE_METHOD_DEF] as usize {
        let at = table_offsets[TABLE_METHOD_DEF] + row * row_size;
        let rva = read_le(tables, at, 4).ok_or_else(|| truncated("MethodDef row"))?;
        if rva == 0 {
            continue;
        }
        let name_at = at + 8;
        let name = read_le(tables, name_at, widths.string)
            .and_then(|index| heaps.string(index))
            .unwrap_or_else(|| format!("method_{:x}", row + 1));
        let signature_index = read_le(tables, name_at + widths.string, widths.blob);
        let body = arch.image_base + rva;
        let mut signature = signature_index.and_then(|i| heaps.blob(i)).and_then(method_signature);
        if let Some(token) = local_var_token(arch, body) {
            let locals = (token >> 24 == TABLE_STAND_ALONE_SIG as u64)
                .then(|| stand_alone(token & 0xFF_FFFF))
                .flatten();
            signature = signature.zip(locals).map(|(s, locals)| ManagedSignature { locals, ..s });
        }
        methods.push(Method {
            name,
            address: body,
            signature,
        });
    }
    Ok(methods)
}
