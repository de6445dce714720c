use crate::endpoint::UnitId;

/// Result of trying to decode the bytes received so far
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decoded {
    /// more bytes are required
    Incomplete,
    /// a complete, valid response frame
    Response(Vec<u8>),
    /// the device answered with a protocol level error
    Rejected {
        /// protocol specific error code
        code: u16,
        /// human readable description
        reason: String,
    },
    /// the bytes can never form a valid frame (bad checksum, unexpected header, ...)
    Malformed(String),
    /// the device no longer speaks the expected protocol; the connection must not be reused
    IdentityMismatch(String),
}

/// Protocol specific framing plugged into the transport core
///
/// The core never looks inside payloads. It asks the codec to frame a request for a unit,
/// then feeds every chunk read from the link to [`FrameCodec::decode`] until the codec
/// reports something other than [`Decoded::Incomplete`].
pub trait FrameCodec: Send + Sync + 'static {
    /// Append the on-wire representation of `request` for `unit` to `out`
    fn encode(&self, unit: UnitId, request: &[u8], out: &mut Vec<u8>);

    /// Inspect everything received so far for the in-flight `request`
    fn decode(&self, unit: UnitId, request: &[u8], received: &[u8]) -> Decoded;
}

/// Codec for delimiter terminated frames, typical of ASCII instruments on serial lines
///
/// Requests are written followed by the delimiter. A response is complete once the
/// delimiter is received; a response starting with the rejection prefix is reported as
/// [`Decoded::Rejected`]. Unit ids are not written, line protocols address devices in-band.
#[derive(Clone, Debug)]
pub struct DelimitedCodec {
    delimiter: u8,
    reject_prefix: Vec<u8>,
}

impl Default for DelimitedCodec {
    fn default() -> Self {
        Self {
            delimiter: b'\n',
            reject_prefix: b"ERR".to_vec(),
        }
    }
}

impl DelimitedCodec {
    /// Codec with a custom delimiter and rejection prefix
    pub fn new(delimiter: u8, reject_prefix: &[u8]) -> Self {
        Self {
            delimiter,
            reject_prefix: reject_prefix.to_vec(),
        }
    }

    fn parse_rejection(&self, frame: &[u8]) -> Decoded {
        // expected form: <prefix> [code] [reason...]
        let rest = String::from_utf8_lossy(&frame[self.reject_prefix.len()..]);
        let rest = rest.trim();
        let (code, reason) = match rest.split_once(' ') {
            Some((code, reason)) => (code, reason),
            None => (rest, ""),
        };
        match code.parse::<u16>() {
            Ok(code) => Decoded::Rejected {
                code,
                reason: reason.trim().to_string(),
            },
            Err(_) => Decoded::Rejected {
                code: 0,
                reason: rest.to_string(),
            },
        }
    }
}

impl FrameCodec for DelimitedCodec {
    fn encode(&self, _unit: UnitId, request: &[u8], out: &mut Vec<u8>) {
        out.extend_from_slice(request);
        out.push(self.delimiter);
    }

    fn decode(&self, _unit: UnitId, _request: &[u8], received: &[u8]) -> Decoded {
        let end = match received.iter().position(|x| *x == self.delimiter) {
            Some(end) => end,
            None => return Decoded::Incomplete,
        };

        if end + 1 != received.len() {
            return Decoded::Malformed(format!(
                "{} unexpected bytes after the delimiter",
                received.len() - end - 1
            ));
        }

        let frame = &received[..end];
        let frame = frame.strip_suffix(b"\r").unwrap_or(frame);

        if !self.reject_prefix.is_empty() && frame.starts_with(&self.reject_prefix) {
            return self.parse_rejection(frame);
        }

        Decoded::Response(frame.to_vec())
    }
}
