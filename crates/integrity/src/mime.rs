//! Content-type detection from leading bytes.

pub const OCTET_STREAM: &str = "application/octet-stream";

/// A leading-byte signature. Every `(offset, bytes)` pair must match.
#[derive(Debug, Clone, Copy)]
pub struct MagicSignature {
    pub mime_type: &'static str,
    pub parts: &'static [(usize, &'static [u8])],
}

impl MagicSignature {
    pub fn matches(&self, data: &[u8]) -> bool {
        self.parts.iter().all(|(offset, bytes)| {
            data.get(*offset..offset + bytes.len())
                .is_some_and(|slice| slice == *bytes)
        })
    }
}

const SIGNATURES: &[MagicSignature] = &[
    MagicSignature {
        mime_type: "image/jpeg",
        parts: &[(0, &[0xFF, 0xD8, 0xFF])],
    },
    MagicSignature {
        mime_type: "image/png",
        parts: &[(0, &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A])],
    },
    MagicSignature {
        mime_type: "image/gif",
        parts: &[(0, b"GIF87a")],
    },
    MagicSignature {
        mime_type: "image/gif",
        parts: &[(0, b"GIF89a")],
    },
    MagicSignature {
        mime_type: "image/webp",
        parts: &[(0, b"RIFF"), (8, b"WEBP")],
    },
    MagicSignature {
        mime_type: "image/tiff",
        parts: &[(0, &[b'I', b'I', 0x2A, 0x00])],
    },
    MagicSignature {
        mime_type: "image/tiff",
        parts: &[(0, &[b'M', b'M', 0x00, 0x2A])],
    },
    MagicSignature {
        mime_type: "video/x-msvideo",
        parts: &[(0, b"RIFF"), (8, b"AVI ")],
    },
    MagicSignature {
        mime_type: "video/webm",
        parts: &[(0, &[0x1A, 0x45, 0xDF, 0xA3])],
    },
    MagicSignature {
        mime_type: "application/pdf",
        parts: &[(0, b"%PDF-")],
    },
    MagicSignature {
        mime_type: "application/zip",
        parts: &[(0, &[b'P', b'K', 0x03, 0x04])],
    },
    MagicSignature {
        mime_type: "application/gzip",
        parts: &[(0, &[0x1F, 0x8B])],
    },
];

const HEIF_BRANDS: &[&[u8; 4]] = &[b"heic", b"heix", b"heim", b"heis", b"hevc", b"mif1", b"msf1"];

/// Detects the MIME type of `data` from its content only.
pub fn sniff_mime(data: &[u8]) -> &'static str {
    if let Some(mime) = sniff_iso_bmff(data) {
        return mime;
    }

    if let Some(sig) = SIGNATURES.iter().find(|sig| sig.matches(data)) {
        return sig.mime_type;
    }

    if looks_like_text(data) {
        return "text/plain";
    }

    OCTET_STREAM
}

// MP4, QuickTime and HEIF share the ISO base media `ftyp` box.
fn sniff_iso_bmff(data: &[u8]) -> Option<&'static str> {
    if data.get(4..8) != Some(b"ftyp".as_slice()) {
        return None;
    }
    let brand = data.get(8..12)?;

    if brand == b"qt  " {
        return Some("video/quicktime");
    }
    if HEIF_BRANDS.iter().any(|b| brand == b.as_slice()) {
        return Some("image/heic");
    }
    if brand == b"avif" {
        return Some("image/avif");
    }
    if brand == b"M4A " {
        return Some("audio/mp4");
    }
    Some("video/mp4")
}

fn looks_like_text(data: &[u8]) -> bool {
    if data.is_empty() {
        return false;
    }
    let sample = &data[..data.len().min(8192)];
    // The sample cut may split a multi-byte character; only the tail may be short.
    let text = match std::str::from_utf8(sample) {
        Ok(text) => text,
        Err(err) if err.error_len().is_none() => {
            match std::str::from_utf8(&sample[..err.valid_up_to()]) {
                Ok(text) => text,
                Err(_) => return false,
            }
        }
        Err(_) => return false,
    };
    text.chars()
        .all(|c| !c.is_control() || matches!(c, '\n' | '\r' | '\t'))
}
