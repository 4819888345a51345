//! Bytecode archives.
//!
//! An archive is the 8-byte magic followed by member records, each a
//! header (`name, mode, uid, gid, mtime, size`) and the member's bytes.
//! The first member is the distinguished symbol index, mapping every
//! externally visible defined symbol to the byte offset of the member
//! that defines it, so a linker can demand-load exactly the members it
//! needs.

use std::collections::HashMap;
use std::ops::Range;

use crate::context::Context;
use crate::error::{CodecError, Error, Result};
use crate::ir::module::{Linkage, Module};

use super::bytes::{Cursor, Writer};
use super::codes::{ARCHIVE_MAGIC, SYMTAB_MEMBER};
use super::provider::ModuleProvider;
use super::writer::write_module;

/// Filesystem-ish metadata carried per member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberInfo {
    pub name: String,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime: u64,
}

impl MemberInfo {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mode: 0o644,
            uid: 0,
            gid: 0,
            mtime: 0,
        }
    }
}

/// Write-only archive construction. Members are appended, then
/// [`ArchiveBuilder::build`] lays out the symbol index and produces the
/// final bytes; the builder consumes itself, so an archive opened for
/// reading can never be rewritten in place.
#[derive(Default)]
pub struct ArchiveBuilder {
    members: Vec<(MemberInfo, Vec<u8>, Vec<String>)>,
}

impl ArchiveBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialize a module and append it as a member. Externally visible
    /// defined symbols go into the index.
    pub fn add_module(&mut self, info: MemberInfo, module: &Module, cx: &Context) {
        let symbols = module
            .globals
            .iter_enumerated()
            .filter(|(_, g)| {
                g.linkage == Linkage::External && !g.is_declaration(&module.functions)
            })
            .map(|(_, g)| g.name.clone())
            .collect();
        self.members.push((info, write_module(module, cx), symbols));
    }

    /// Append raw bytes with explicit symbols (for member types this
    /// library does not produce itself).
    pub fn add_member(&mut self, info: MemberInfo, bytes: Vec<u8>, symbols: Vec<String>) {
        self.members.push((info, bytes, symbols));
    }

    pub fn build(self) -> Vec<u8> {
        // The index uses fixed-width offsets so its own size is known
        // before the offsets are.
        let mut symtab = Writer::new();
        let total_symbols: usize = self.members.iter().map(|(_, _, s)| s.len()).sum();
        symtab.write_vbr(total_symbols as u64);
        let symtab_payload_len = {
            // Dry run to size the payload: names plus 4 bytes each.
            let mut probe = Writer::new();
            probe.write_vbr(total_symbols as u64);
            for (_, _, symbols) in &self.members {
                for s in symbols {
                    probe.write_str(s);
                    probe.write_u32(0);
                }
            }
            probe.len()
        };

        let mut header_probe = Writer::new();
        write_member_header(
            &mut header_probe,
            &MemberInfo::named(SYMTAB_MEMBER),
            symtab_payload_len,
        );
        let mut offset = ARCHIVE_MAGIC.len() + header_probe.len() + symtab_payload_len;

        // Offsets of each real member, in order.
        let mut offsets = Vec::with_capacity(self.members.len());
        for (info, bytes, _) in &self.members {
            offsets.push(offset as u32);
            let mut probe = Writer::new();
            write_member_header(&mut probe, info, bytes.len());
            offset += probe.len() + bytes.len();
        }

        for ((_, _, symbols), &member_offset) in self.members.iter().zip(&offsets) {
            for s in symbols {
                symtab.write_str(s);
                symtab.write_u32(member_offset);
            }
        }

        let mut out = Writer::new();
        out.write_bytes(&ARCHIVE_MAGIC);
        write_member_header(
            &mut out,
            &MemberInfo::named(SYMTAB_MEMBER),
            symtab_payload_len,
        );
        out.write_bytes(&symtab.into_bytes());
        for ((info, bytes, _), expected) in self.members.iter().zip(&offsets) {
            debug_assert_eq!(out.len() as u32, *expected);
            write_member_header(&mut out, info, bytes.len());
            out.write_bytes(bytes);
        }
        out.into_bytes()
    }
}

fn write_member_header(w: &mut Writer, info: &MemberInfo, size: usize) {
    w.write_str(&info.name);
    w.write_vbr(u64::from(info.mode));
    w.write_vbr(u64::from(info.uid));
    w.write_vbr(u64::from(info.gid));
    w.write_vbr(info.mtime);
    w.write_vbr(size as u64);
}

/// A parsed archive over a byte buffer. Member payloads stay untouched
/// until asked for.
pub struct Archive<'input> {
    bytes: &'input [u8],
    members: Vec<(MemberInfo, Range<usize>)>,
    /// symbol -> archive byte offset of the defining member's header
    symbols: HashMap<String, u32>,
}

impl<'input> Archive<'input> {
    pub fn parse(bytes: &'input [u8]) -> Result<Self> {
        let mut cursor = Cursor::new(bytes);
        let magic = cursor.read_bytes(ARCHIVE_MAGIC.len())?;
        if magic != ARCHIVE_MAGIC {
            let first4 = u32::from_le_bytes(magic[..4].try_into().unwrap_or_default());
            return Err(CodecError::BadMagic(first4).into());
        }

        let mut members = Vec::new();
        let mut symbols = HashMap::new();
        while !cursor.is_at_end() {
            let (info, size) = read_member_header(&mut cursor)?;
            let payload_start = cursor.position();
            cursor.read_bytes(size)?;
            if info.name == SYMTAB_MEMBER {
                let mut index = Cursor::new(&bytes[payload_start..payload_start + size]);
                let n = index.read_vbr()? as usize;
                for _ in 0..n {
                    let symbol = index.read_str()?;
                    let offset = index.read_u32()?;
                    symbols.insert(symbol, offset);
                }
            } else {
                members.push((info, payload_start..payload_start + size));
            }
        }
        Ok(Self {
            bytes,
            members,
            symbols,
        })
    }

    pub fn members(&self) -> impl Iterator<Item = (&MemberInfo, &'input [u8])> {
        self.members
            .iter()
            .map(|(info, range)| (info, &self.bytes[range.clone()]))
    }

    /// All indexed symbols.
    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.symbols.keys().map(String::as_str)
    }

    /// Raw bytes of the member defining `symbol`.
    pub fn member_for_symbol(&self, symbol: &str) -> Option<&'input [u8]> {
        let &offset = self.symbols.get(symbol)?;
        let mut cursor = Cursor::new(self.bytes);
        cursor.read_bytes(offset as usize).ok()?;
        let (_, size) = read_member_header(&mut cursor).ok()?;
        cursor.read_bytes(size).ok()
    }

    /// Demand-load the module defining `symbol` (lazily: only its
    /// skeleton parses here).
    pub fn load_module_for_symbol(&self, symbol: &str, cx: &Context) -> Result<ModuleProvider> {
        let bytes = self
            .member_for_symbol(symbol)
            .ok_or_else(|| Error::Unresolved(symbol.to_owned()))?;
        ModuleProvider::open(bytes.to_vec(), cx)
    }
}

fn read_member_header(cursor: &mut Cursor<'_>) -> Result<(MemberInfo, usize)> {
    let name = cursor.read_str()?;
    let mode = cursor.read_vbr()? as u32;
    let uid = cursor.read_vbr()? as u32;
    let gid = cursor.read_vbr()? as u32;
    let mtime = cursor.read_vbr()?;
    let size = cursor.read_vbr()? as usize;
    Ok((
        MemberInfo {
            name,
            mode,
            uid,
            gid,
            mtime,
        },
        size,
    ))
}
