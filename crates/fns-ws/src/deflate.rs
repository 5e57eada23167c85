//! permessage-deflate (RFC 7692), no-context-takeover variant only.
//!
//! Each message is compressed with a fresh raw DEFLATE stream that ends in a
//! sync flush; the trailing `00 00 ff ff` is stripped before framing. On the
//! read side the marker is put back, followed by an empty final block, so a
//! stock raw-deflate decoder sees a well-terminated stream.

use std::io::{self, Chain, Cursor, Read};

use flate2::read::DeflateDecoder;
use flate2::{Compress, Compression, FlushCompress};

pub const EXTENSION_NAME: &str = "permessage-deflate";

/// The only extension response the server ever sends.
pub const NO_CONTEXT_TAKEOVER_RESPONSE: &str =
    "permessage-deflate; server_no_context_takeover; client_no_context_takeover";

pub const DEFAULT_COMPRESSION_LEVEL: i32 = 1;
pub const MIN_COMPRESSION_LEVEL: i32 = -1;
pub const MAX_COMPRESSION_LEVEL: i32 = 9;

const SYNC_TAIL: [u8; 4] = [0x00, 0x00, 0xff, 0xff];
const READ_TAIL: &[u8] = &[0x00, 0x00, 0xff, 0xff, 0x01, 0x00, 0x00, 0xff, 0xff];

/// One offered extension: its name and `key[=value]` parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionOffer {
    pub name: String,
    pub params: Vec<(String, Option<String>)>,
}

/// Parse `Sec-WebSocket-Extensions` header values into offers.
pub fn parse_extensions<'a, I>(values: I) -> Vec<ExtensionOffer>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut offers = Vec::new();
    for value in values {
        for offer in value.split(',') {
            let mut parts = offer.split(';').map(str::trim);
            let name = match parts.next() {
                Some(n) if !n.is_empty() => n.to_ascii_lowercase(),
                _ => continue,
            };
            let params = parts
                .filter(|p| !p.is_empty())
                .map(|p| match p.split_once('=') {
                    Some((k, v)) => (
                        k.trim().to_ascii_lowercase(),
                        Some(v.trim().trim_matches('"').to_string()),
                    ),
                    None => (p.to_ascii_lowercase(), None),
                })
                .collect();
            offers.push(ExtensionOffer { name, params });
        }
    }
    offers
}

/// True when some offer is permessage-deflate with parameters that the
/// no-context-takeover variant with 15-bit windows satisfies. An offer that
/// asks for a smaller server window, or carries anything else, is skipped.
pub fn offers_deflate(offers: &[ExtensionOffer]) -> bool {
    offers
        .iter()
        .any(|o| o.name == EXTENSION_NAME && o.params.iter().all(|(k, v)| param_supported(k, v.as_deref())))
}

fn param_supported(name: &str, value: Option<&str>) -> bool {
    match (name, value) {
        ("server_no_context_takeover" | "client_no_context_takeover", None) => true,
        ("client_max_window_bits", None | Some("15")) => true,
        ("server_max_window_bits", Some("15")) => true,
        _ => false,
    }
}

pub fn is_valid_level(level: i32) -> bool {
    (MIN_COMPRESSION_LEVEL..=MAX_COMPRESSION_LEVEL).contains(&level)
}

fn compression(level: i32) -> Compression {
    if level < 0 {
        Compression::default()
    } else {
        Compression::new(level as u32)
    }
}

/// Per-message compressor. Dropped at the end of every message.
pub struct MessageCompressor {
    inner: Compress,
}

impl MessageCompressor {
    pub fn new(level: i32) -> Self {
        MessageCompressor {
            inner: Compress::new(compression(level), false),
        }
    }

    /// Compress `input`, appending whatever output is ready to `out`.
    pub fn write(&mut self, input: &[u8], out: &mut Vec<u8>) -> io::Result<()> {
        self.run(input, out, FlushCompress::None)
    }

    /// Sync-flush the stream and strip the trailing empty block marker.
    pub fn finish(mut self, out: &mut Vec<u8>) -> io::Result<()> {
        self.run(&[], out, FlushCompress::Sync)?;
        if out.ends_with(&SYNC_TAIL) {
            out.truncate(out.len() - SYNC_TAIL.len());
        }
        Ok(())
    }

    fn run(&mut self, mut input: &[u8], out: &mut Vec<u8>, flush: FlushCompress) -> io::Result<()> {
        loop {
            out.reserve(256 + input.len() / 2);
            let before = self.inner.total_in();
            self.inner
                .compress_vec(input, out, flush)
                .map_err(io::Error::other)?;
            let consumed = (self.inner.total_in() - before) as usize;
            input = &input[consumed..];
            if input.is_empty() && out.len() < out.capacity() {
                return Ok(());
            }
        }
    }
}

/// Compress a whole message in one call.
pub fn compress_message(level: i32, data: &[u8]) -> io::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len() / 2 + 16);
    let mut c = MessageCompressor::new(level);
    c.write(data, &mut out)?;
    c.finish(&mut out)?;
    Ok(out)
}

pub type Decompressor<R> = DeflateDecoder<Chain<R, Cursor<&'static [u8]>>>;

/// Wrap the raw compressed payload of one message in a decoder.
pub fn decompress_reader<R: Read>(compressed: R) -> Decompressor<R> {
    DeflateDecoder::new(compressed.chain(Cursor::new(READ_TAIL)))
}
