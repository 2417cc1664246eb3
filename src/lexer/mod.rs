use logos::Logos;

/// Pieces of a string literal body (the text between the quotes).
#[derive(Logos, Debug, PartialEq, Clone, Copy)]
enum Piece {
    #[regex(r"[^\\]+")]
    Literal,

    #[regex(r"\\[0-7][0-7][0-7]")]
    Octal,
    #[regex(r"\\[0-7][0-7]?")]
    ShortOctal,
    #[regex(r"\\[89]")]
    BadOctal,

    #[regex(r"\\[xX][0-9a-fA-F][0-9a-fA-F]")]
    Hex,
    #[regex(r"\\[xX][0-9a-fA-F]?")]
    ShortHex,

    #[regex(r"\\u[0-9a-fA-F]{4}")]
    Unicode,
    #[regex(r"\\u[0-9a-fA-F]{0,3}")]
    ShortUnicode,

    // Named controls and "anything else is itself"
    #[regex(r"\\[^0-9xXu]")]
    Escaped,
}

/// Escape decoding failure; `offset` is relative to the start of the body.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct EscapeError {
    pub offset: usize,
    pub message: &'static str,
}

/// Decode the escapes of a string literal body.
///
/// Octal and hex escapes produce raw bytes, so the decoded buffer is checked
/// for UTF-8 validity as a whole.
pub fn unescape(body: &str) -> Result<String, EscapeError> {
    let mut lexer = Piece::lexer(body);
    let mut out: Vec<u8> = Vec::with_capacity(body.len());

    while let Some(piece) = lexer.next() {
        let span = lexer.span();
        let slice = lexer.slice();
        let fail = |message| EscapeError { offset: span.start, message };
        match piece {
            Ok(Piece::Literal) => out.extend_from_slice(slice.as_bytes()),
            Ok(Piece::Octal) => {
                let code = u32::from_str_radix(&slice[1..], 8).map_err(|_| fail("invalid octal escape sequence"))?;
                let byte = u8::try_from(code).map_err(|_| fail("octal escape sequence out of range"))?;
                out.push(byte);
            }
            Ok(Piece::ShortOctal) | Ok(Piece::BadOctal) => return Err(fail("invalid octal escape sequence")),
            Ok(Piece::Hex) => {
                let byte = u8::from_str_radix(&slice[2..], 16).map_err(|_| fail("invalid hexadecimal escape sequence"))?;
                out.push(byte);
            }
            Ok(Piece::ShortHex) => return Err(fail("invalid hexadecimal escape sequence")),
            Ok(Piece::Unicode) => {
                let ch = u32::from_str_radix(&slice[2..], 16)
                    .ok()
                    .and_then(char::from_u32)
                    .ok_or_else(|| fail("invalid unicode escape sequence"))?;
                let mut buf = [0u8; 4];
                out.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
            }
            Ok(Piece::ShortUnicode) => return Err(fail("invalid unicode escape sequence")),
            Ok(Piece::Escaped) => {
                let escaped = &slice[1..];
                match escaped {
                    "a" => out.push(0x07),
                    "b" => out.push(0x08),
                    "t" => out.push(b'\t'),
                    "n" => out.push(b'\n'),
                    "v" => out.push(0x0b),
                    "f" => out.push(0x0c),
                    "r" => out.push(b'\r'),
                    other => out.extend_from_slice(other.as_bytes()),
                }
            }
            Err(()) => return Err(fail("invalid escape sequence")),
        }
    }

    String::from_utf8(out).map_err(|e| EscapeError {
        offset: e.utf8_error().valid_up_to().min(body.len()),
        message: "escape sequence produces invalid UTF-8",
    })
}

/// Find the end of a quoted literal starting at `start` (which must hold the
/// opening quote). Returns the byte index of the closing quote.
pub fn find_closing_quote(src: &[u8], start: usize) -> Option<usize> {
    let quote = *src.get(start)?;
    let mut i = start + 1;
    while i < src.len() {
        match src[i] {
            b'\\' => i += 2,
            b if b == quote => return Some(i),
            _ => i += 1,
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_passes_through() {
        assert_eq!(unescape("hello world").unwrap(), "hello world");
        assert_eq!(unescape("").unwrap(), "");
    }

    #[test]
    fn named_controls() {
        assert_eq!(unescape(r"a\tb\nc\r").unwrap(), "a\tb\nc\r");
        assert_eq!(unescape(r"\a\b\v\f").unwrap(), "\x07\x08\x0b\x0c");
    }

    #[test]
    fn unknown_escape_is_literal() {
        assert_eq!(unescape(r#"\"\'\\\q"#).unwrap(), "\"'\\q");
        assert_eq!(unescape(r"\é").unwrap(), "é");
    }

    #[test]
    fn unicode_escape_encodes_utf8() {
        assert_eq!(unescape(r"\u00e9").unwrap(), "é");
        assert_eq!(unescape(r"caf\u00E9!").unwrap(), "café!");
    }

    #[test]
    fn octal_and_hex() {
        assert_eq!(unescape(r"\101\x42").unwrap(), "AB");
        assert_eq!(unescape(r"\303\251").unwrap(), "é");
    }

    #[test]
    fn octal_errors() {
        assert_eq!(unescape(r"\12").unwrap_err().message, "invalid octal escape sequence");
        assert_eq!(unescape(r"x\9").unwrap_err(), EscapeError { offset: 1, message: "invalid octal escape sequence" });
        assert_eq!(unescape(r"\777").unwrap_err().message, "octal escape sequence out of range");
    }

    #[test]
    fn hex_and_unicode_errors() {
        assert_eq!(unescape(r"\xg1").unwrap_err().message, "invalid hexadecimal escape sequence");
        assert_eq!(unescape(r"\u12").unwrap_err().message, "invalid unicode escape sequence");
        assert_eq!(unescape(r"\ud800").unwrap_err().message, "invalid unicode escape sequence");
    }

    #[test]
    fn raw_bytes_must_form_utf8() {
        assert_eq!(unescape(r"\xff").unwrap_err().message, "escape sequence produces invalid UTF-8");
    }

    #[test]
    fn closing_quote_skips_escapes() {
        let src = br#""a\"b" rest"#;
        assert_eq!(find_closing_quote(src, 0), Some(5));
        assert_eq!(find_closing_quote(b"'abc", 0), None);
        assert_eq!(find_closing_quote(br#"'a"b'"#, 0), Some(4));
    }
}
