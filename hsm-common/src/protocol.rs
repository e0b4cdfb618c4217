//! # Wire Protocol Codec
//!
//! Purpose: Describe the vendor-specific text protocol spoken to an HSM node
//! behind a narrow trait, so the transport never formats or parses frames
//! itself.
//!
//! ## Design Principles
//! 1. **Codec Boundary**: The transport only asks for commands, tags and the
//!    end-of-frame marker; everything vendor-specific lives behind [`ProtocolCodec`].
//! 2. **Allocation-Light Parsing**: Frames are sliced in place, only the payload
//!    is copied out.
//! 3. **Explicit Failure**: Unparseable frames become `HsmError::Protocol`, device
//!    rejections become `HsmError::Command`.
//!
//! ## Utimaco Frame Layout
//!
//! ```text
//! request:   < CODE # field # field ... # ^TAG # >
//! response:  < CODE # PAYLOAD # ...        ^TAG # >
//!
//! <39B#KEYBLOCK##2#DATA#^BD_1718000000000_1a2b3c4d#>
//!  |    |         |      |                          |
//!  |    |         |      context tag                end marker
//!  |    key block  data
//!  command code
//! ```

use crate::error::{HsmError, HsmResult};

/// Vendor wire syntax consumed by the transport.
///
/// Implementations must be cheap to share across every connection of every pool.
pub trait ProtocolCodec: Send + Sync + 'static {
    fn build_visa_cavv_command(&self, key_block: &str, data: &str) -> String;

    fn build_master_cavv_command(&self, key_block: &str, data: &str) -> String;

    fn build_hmac_command(&self, key_block: &str, data: &str) -> String;

    fn build_ping_command(&self) -> String;

    /// Inserts the correlation id into an outbound command.
    fn embed_context_tag(&self, command: &str, correlation_id: &str) -> String;

    /// Recovers the correlation id echoed back in a response frame.
    fn extract_context_tag(&self, frame: &str) -> Option<String>;

    /// Extracts the meaningful payload of a response frame.
    fn parse_response(&self, frame: &str) -> HsmResult<String>;

    /// Suffix marking the end of a complete response frame.
    fn response_end_marker(&self) -> &str;
}

const FIELD_SEPARATOR: char = '#';
const TAG_PREFIX: char = '^';
const FRAME_START: char = '<';
const FRAME_END: &str = ">";

/// Command code for CAVV generation (both schemes).
pub const CAVV_COMMAND: &str = "5D";
/// Command code for HMAC generation.
pub const HMAC_COMMAND: &str = "39B";
/// Command code for the echo/ping probe.
pub const PING_COMMAND: &str = "00";
/// Response code the device uses for a rejected command.
pub const ERROR_RESPONSE: &str = "ER";

/// Codec for Utimaco payment HSMs.
#[derive(Debug, Clone, Copy, Default)]
pub struct UtimacoCodec;

impl UtimacoCodec {
    pub fn new() -> Self {
        UtimacoCodec
    }
}

impl ProtocolCodec for UtimacoCodec {
    fn build_visa_cavv_command(&self, key_block: &str, data: &str) -> String {
        format!("<{CAVV_COMMAND}#3#{key_block}##{data}#>")
    }

    fn build_master_cavv_command(&self, key_block: &str, data: &str) -> String {
        format!("<{CAVV_COMMAND}#3#{key_block}##{data}#>")
    }

    fn build_hmac_command(&self, key_block: &str, data: &str) -> String {
        format!("<{HMAC_COMMAND}#{key_block}##2#{data}#>")
    }

    fn build_ping_command(&self) -> String {
        format!("<{PING_COMMAND}#>")
    }

    fn embed_context_tag(&self, command: &str, correlation_id: &str) -> String {
        // Only the first terminator receives the tag.
        command.replacen("#>", &format!("#^{correlation_id}#>"), 1)
    }

    fn extract_context_tag(&self, frame: &str) -> Option<String> {
        let body = frame.trim().strip_suffix("#>")?;
        let start = body.rfind(TAG_PREFIX)?;
        let tag = &body[start + 1..];
        if start == 0 || !body[..start].ends_with(FIELD_SEPARATOR) {
            return None;
        }
        if tag.is_empty() || tag.contains(FIELD_SEPARATOR) {
            return None;
        }
        Some(tag.to_string())
    }

    fn parse_response(&self, frame: &str) -> HsmResult<String> {
        let trimmed = frame.trim();
        let inner = trimmed
            .strip_prefix(FRAME_START)
            .and_then(|rest| rest.strip_suffix(FRAME_END))
            .ok_or_else(|| HsmError::Protocol(format!("unable to parse HSM response: {trimmed}")))?;

        let mut fields = inner.splitn(3, FIELD_SEPARATOR);
        let code = fields.next().unwrap_or_default();
        let payload = fields.next().unwrap_or_default();
        // A trailing separator after the payload is mandatory.
        let has_tail = fields.next().is_some();

        let code_ok = !code.is_empty()
            && code
                .bytes()
                .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit());
        // A tag-only body such as `<00#^PING_1#>` yields the tag as payload;
        // some devices answer pings that way.
        if !code_ok || payload.is_empty() || !has_tail {
            return Err(HsmError::Protocol(format!(
                "unable to parse HSM response: {trimmed}"
            )));
        }

        if code == ERROR_RESPONSE {
            return Err(HsmError::Command(format!("HSM rejected command: {payload}")));
        }
        Ok(payload.to_string())
    }

    fn response_end_marker(&self) -> &str {
        FRAME_END
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_commands() {
        let codec = UtimacoCodec::new();
        assert_eq!(codec.build_visa_cavv_command("KB", "DATA"), "<5D#3#KB##DATA#>");
        assert_eq!(codec.build_master_cavv_command("KB", "DATA"), "<5D#3#KB##DATA#>");
        assert_eq!(codec.build_hmac_command("KB", "DATA"), "<39B#KB##2#DATA#>");
        assert_eq!(codec.build_ping_command(), "<00#>");
        assert_eq!(codec.response_end_marker(), ">");
    }

    #[test]
    fn tag_survives_embedding_in_hmac_command() {
        let codec = UtimacoCodec::new();
        let framed = codec.embed_context_tag(&codec.build_hmac_command("kb", "data"), "X1");
        assert_eq!(framed, "<39B#kb##2#data#^X1#>");
        assert_eq!(codec.extract_context_tag(&framed).as_deref(), Some("X1"));
    }

    #[test]
    fn embeds_tag_into_ping() {
        let codec = UtimacoCodec::new();
        let framed = codec.embed_context_tag(&codec.build_ping_command(), "PING_1_abcdef01");
        assert_eq!(framed, "<00#^PING_1_abcdef01#>");
    }

    #[test]
    fn extracts_tag_from_response_with_trailing_newline() {
        let codec = UtimacoCodec::new();
        assert_eq!(
            codec.extract_context_tag("<6D#CAVV123#^BD_1_deadbeef#>\r\n").as_deref(),
            Some("BD_1_deadbeef")
        );
    }

    #[test]
    fn missing_tag_is_absent() {
        let codec = UtimacoCodec::new();
        assert_eq!(codec.extract_context_tag("<6D#CAVV123#>"), None);
        assert_eq!(codec.extract_context_tag("<6D#CAVV123#^#>"), None);
        assert_eq!(codec.extract_context_tag("garbage"), None);
    }

    #[test]
    fn parses_payload_from_response() {
        let codec = UtimacoCodec::new();
        assert_eq!(codec.parse_response("<6D#CAVV123#^T1#>").unwrap(), "CAVV123");
        assert_eq!(codec.parse_response("<49B#ABCDEF#extra#^T2#>").unwrap(), "ABCDEF");
        assert_eq!(codec.parse_response("<00#OK#>").unwrap(), "OK");
    }

    #[test]
    fn tag_only_ping_reply_is_accepted() {
        let codec = UtimacoCodec::new();
        let frame = "<00#^PING_1_abcd#>";
        assert_eq!(codec.parse_response(frame).unwrap(), "^PING_1_abcd");
        assert_eq!(codec.extract_context_tag(frame).as_deref(), Some("PING_1_abcd"));
    }

    #[test]
    fn rejects_unparseable_frames() {
        let codec = UtimacoCodec::new();
        for frame in ["", "hello", "<6D>", "<6D#>", "<6d#X#>", "<6D#X>"] {
            let err = codec.parse_response(frame).unwrap_err();
            assert!(matches!(err, HsmError::Protocol(_)), "frame {frame:?} gave {err:?}");
        }
    }

    #[test]
    fn error_code_is_a_command_error() {
        let codec = UtimacoCodec::new();
        let err = codec.parse_response("<ER#15#^T9#>").unwrap_err();
        assert!(matches!(err, HsmError::Command(ref msg) if msg.contains("15")));
        assert_eq!(codec.extract_context_tag("<ER#15#^T9#>").as_deref(), Some("T9"));
    }
}
