//! Watermark blobs stored in the VM segment.

/// Produces the signed form of a watermark payload.
pub trait Signer: Sync {
    fn sign(&self, payload: &[u8]) -> Vec<u8>;
}

/// Frames the payload as `magic | len:u32 | payload | fnv1a64(payload)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct FramedSigner;

pub const WATERMARK_MAGIC: [u8; 4] = *b"UVMW";

impl Signer for FramedSigner {
    fn sign(&self, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(payload.len() + 16);
        out.extend_from_slice(&WATERMARK_MAGIC);
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(payload);
        out.extend_from_slice(&fnv1a64(payload).to_le_bytes());
        out
    }
}

pub fn fnv1a64(data: &[u8]) -> u64 {
    data.iter().fold(0xcbf2_9ce4_8422_2325, |hash, &b| {
        (hash ^ u64::from(b)).wrapping_mul(0x0100_0000_01b3)
    })
}

/// Extracts the payload from a framed blob, checking the digest.
pub fn verify(blob: &[u8]) -> Option<&[u8]> {
    if blob.get(..4)? != WATERMARK_MAGIC {
        return None;
    }
    let len = u32::from_le_bytes(blob.get(4..8)?.try_into().ok()?) as usize;
    let payload = blob.get(8..8 + len)?;
    let digest = u64::from_le_bytes(blob.get(8 + len..16 + len)?.try_into().ok()?);
    (digest == fnv1a64(payload)).then_some(payload)
}
