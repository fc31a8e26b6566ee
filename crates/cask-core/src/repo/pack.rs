use rand::RngCore;
use rmp_serde as rmp;
use serde::{Deserialize, Serialize};

use crate::crypto::content_id::ContentId;
use crate::error::{CaskError, Result};
use crate::format::{FormatProvider, ObjectType};
use crate::storage::{BlobId, PACK_BLOB_PREFIX_REGULAR, PACK_BLOB_PREFIX_SPECIAL};

/// Which bucket a pending pack belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackKind {
    /// Unprefixed contents (`p` blobs).
    Regular,
    /// Prefixed/bucketed contents (`q` blobs).
    Special,
}

impl PackKind {
    pub fn blob_prefix(self) -> &'static str {
        match self {
            PackKind::Regular => PACK_BLOB_PREFIX_REGULAR,
            PackKind::Special => PACK_BLOB_PREFIX_SPECIAL,
        }
    }

    pub fn for_content_prefix(prefix: Option<char>) -> Self {
        if prefix.is_some() {
            PackKind::Special
        } else {
            PackKind::Regular
        }
    }
}

/// Generate a fresh pack blob ID: kind prefix + 32 hex chars of 16 random
/// bytes. The random suffix keeps the blob name from revealing contents.
pub fn new_pack_blob_id(kind: PackKind) -> BlobId {
    let mut suffix = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut suffix);
    BlobId::new(format!("{}{}", kind.blob_prefix(), hex::encode(suffix))).expect("valid pack id")
}

/// One entry of the encrypted pack footer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackFooterEntry {
    pub content_id: Vec<u8>,
    pub offset: u32,
    pub length: u32,
}

/// A content buffered in a pending pack.
#[derive(Debug, Clone)]
pub struct BufferedContent {
    pub content_id: ContentId,
    pub offset: u32,
    pub length: u32,
}

/// Accumulates encrypted contents for one bucket until the pack is sealed.
///
/// The pack blob ID is chosen when the builder is (re)armed, so every
/// buffered content has a complete location the moment it is added.
pub struct PackBuilder {
    kind: PackKind,
    blob_id: BlobId,
    buffer: Vec<u8>,
    contents: Vec<BufferedContent>,
}

impl PackBuilder {
    pub fn new(kind: PackKind) -> Self {
        Self {
            kind,
            blob_id: new_pack_blob_id(kind),
            buffer: Vec::new(),
            contents: Vec::new(),
        }
    }

    pub fn kind(&self) -> PackKind {
        self.kind
    }

    pub fn blob_id(&self) -> &BlobId {
        &self.blob_id
    }

    pub fn is_empty(&self) -> bool {
        self.contents.is_empty()
    }

    /// Bytes currently buffered (excluding the footer written at seal time).
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Append an encrypted content, returning its offset within the pack.
    pub fn add(&mut self, content_id: ContentId, encrypted: &[u8]) -> u32 {
        let offset = self.buffer.len() as u32;
        self.buffer.extend_from_slice(encrypted);
        self.contents.push(BufferedContent {
            content_id,
            offset,
            length: encrypted.len() as u32,
        });
        offset
    }

    /// Copy the encrypted bytes of a still-buffered range (read path for
    /// contents that have not been sealed yet).
    pub fn read_pending(&self, offset: u32, length: u32) -> Option<Vec<u8>> {
        let start = offset as usize;
        let end = start.checked_add(length as usize)?;
        self.buffer.get(start..end).map(<[u8]>::to_vec)
    }

    /// Assemble the pack bytes (contents + encrypted footer + footer length),
    /// then re-arm the builder with a fresh pack blob ID.
    ///
    /// Does not write to storage; the caller owns the upload.
    pub fn seal(&mut self, format: &FormatProvider) -> Result<SealedPack> {
        if self.contents.is_empty() {
            return Err(CaskError::Other("cannot seal empty pack".into()));
        }

        let footer: Vec<PackFooterEntry> = self
            .contents
            .iter()
            .map(|c| PackFooterEntry {
                content_id: c.content_id.to_bytes().to_vec(),
                offset: c.offset,
                length: c.length,
            })
            .collect();
        let footer_bytes = rmp::to_vec(&footer)?;
        let sealed_footer = format.seal_envelope(ObjectType::PackFooter, &footer_bytes)?;

        let mut pack_bytes = std::mem::take(&mut self.buffer);
        pack_bytes.extend_from_slice(&sealed_footer);
        pack_bytes.extend_from_slice(&(sealed_footer.len() as u32).to_le_bytes());

        let sealed = SealedPack {
            blob_id: self.blob_id.clone(),
            bytes: pack_bytes,
            contents: std::mem::take(&mut self.contents),
        };
        self.blob_id = new_pack_blob_id(self.kind);
        Ok(sealed)
    }
}

/// Result of sealing a pending pack.
pub struct SealedPack {
    pub blob_id: BlobId,
    pub bytes: Vec<u8>,
    pub contents: Vec<BufferedContent>,
}

/// Decode the footer of a full pack blob.
pub fn read_pack_footer(format: &FormatProvider, pack_bytes: &[u8]) -> Result<Vec<PackFooterEntry>> {
    if pack_bytes.len() < 4 {
        return Err(CaskError::CorruptData("pack too small".into()));
    }
    let len_offset = pack_bytes.len() - 4;
    let footer_len =
        u32::from_le_bytes(pack_bytes[len_offset..].try_into().unwrap()) as usize;
    if footer_len > len_offset {
        return Err(CaskError::CorruptData("invalid pack footer length".into()));
    }

    let sealed = &pack_bytes[len_offset - footer_len..len_offset];
    let footer_bytes = format.open_envelope(ObjectType::PackFooter, sealed)?;
    Ok(rmp::from_slice(&footer_bytes)?)
}
