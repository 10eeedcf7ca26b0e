//! JSON with `//` and `/* */` comments and trailing commas.
//!
//! Comments and dangling commas are blanked out in place (newlines kept) so
//! that line/column positions reported by `serde_json` still point into the
//! original source.

use crate::error::ServError;
use serde_json::Value;
use std::path::Path;

pub fn parse(path: &Path, source: &str) -> Result<Value, ServError> {
    let cleaned = strip(path, source)?;
    serde_json::from_str(&cleaned).map_err(|err| ServError::ConfigParse {
        path: path.to_path_buf(),
        line: err.line(),
        column: err.column(),
        message: strip_position_suffix(&err.to_string()),
    })
}

fn strip_position_suffix(message: &str) -> String {
    match message.rfind(" at line ") {
        Some(idx) => message[..idx].to_string(),
        None => message.to_string(),
    }
}

pub fn strip(path: &Path, source: &str) -> Result<String, ServError> {
    let chars: Vec<char> = source.chars().collect();
    let mut out: Vec<char> = Vec::with_capacity(chars.len());
    let mut i = 0;
    let mut in_string = false;
    let mut line = 1usize;
    let mut column = 1usize;

    while i < chars.len() {
        let ch = chars[i];
        if in_string {
            out.push(ch);
            if ch == '\\' && i + 1 < chars.len() {
                out.push(chars[i + 1]);
                i += 2;
                column += 2;
                continue;
            }
            if ch == '"' {
                in_string = false;
            }
            advance(ch, &mut line, &mut column);
            i += 1;
            continue;
        }

        match ch {
            '"' => {
                in_string = true;
                out.push(ch);
            }
            '/' if chars.get(i + 1) == Some(&'/') => {
                while i < chars.len() && chars[i] != '\n' {
                    out.push(' ');
                    i += 1;
                    column += 1;
                }
                continue;
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                let (start_line, start_column) = (line, column);
                out.push(' ');
                out.push(' ');
                i += 2;
                column += 2;
                let mut closed = false;
                while i < chars.len() {
                    if chars[i] == '*' && chars.get(i + 1) == Some(&'/') {
                        out.push(' ');
                        out.push(' ');
                        i += 2;
                        column += 2;
                        closed = true;
                        break;
                    }
                    let c = chars[i];
                    out.push(if c == '\n' { '\n' } else { ' ' });
                    advance(c, &mut line, &mut column);
                    i += 1;
                }
                if !closed {
                    return Err(ServError::ConfigParse {
                        path: path.to_path_buf(),
                        line: start_line,
                        column: start_column,
                        message: "unterminated block comment".to_string(),
                    });
                }
                continue;
            }
            _ => out.push(ch),
        }
        advance(ch, &mut line, &mut column);
        i += 1;
    }

    blank_trailing_commas(&mut out);
    Ok(out.into_iter().collect())
}

fn advance(ch: char, line: &mut usize, column: &mut usize) {
    if ch == '\n' {
        *line += 1;
        *column = 1;
    } else {
        *column += 1;
    }
}

// Runs after comments are blanked, so only whitespace can separate a comma
// from the closing bracket.
fn blank_trailing_commas(chars: &mut [char]) {
    let mut in_string = false;
    let mut escaped = false;
    let mut pending_comma: Option<usize> = None;
    for idx in 0..chars.len() {
        let ch = chars[idx];
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => {
                in_string = true;
                pending_comma = None;
            }
            ',' => pending_comma = Some(idx),
            '}' | ']' => {
                if let Some(comma) = pending_comma.take() {
                    chars[comma] = ' ';
                }
            }
            c if c.is_whitespace() => {}
            _ => pending_comma = None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse_str(source: &str) -> Result<Value, ServError> {
        parse(Path::new("servman.json"), source)
    }

    #[test]
    fn comments_are_ignored_outside_strings() {
        let value = parse_str(
            r#"{
  // the port
  "port": 8080, /* inline */
  "webroot": "http://example.com/a//b",
  "note": "/* not a comment */"
}"#,
        )
        .unwrap();
        assert_eq!(value["port"], json!(8080));
        assert_eq!(value["webroot"], json!("http://example.com/a//b"));
        assert_eq!(value["note"], json!("/* not a comment */"));
    }

    #[test]
    fn trailing_commas_are_tolerated() {
        let value = parse_str("{\"a\": [1, 2,], \"b\": {\"c\": true,},}").unwrap();
        assert_eq!(value, json!({"a": [1, 2], "b": {"c": true}}));
    }

    #[test]
    fn syntax_error_reports_original_position() {
        let err = parse_str("{\n  // comment\n  \"port\": 80 80\n}").unwrap_err();
        match err {
            ServError::ConfigParse { line, column, .. } => {
                assert_eq!(line, 3);
                assert!(column >= 13);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn unterminated_block_comment_is_a_parse_error() {
        let err = parse_str("{\n  /* never closed\n}").unwrap_err();
        match err {
            ServError::ConfigParse { line, column, message, .. } => {
                assert_eq!((line, column), (2, 3));
                assert!(message.contains("unterminated"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn escaped_quotes_do_not_end_strings() {
        let value = parse_str(r#"{"a": "say \"hi\" // still text"}"#).unwrap();
        assert_eq!(value["a"], json!("say \"hi\" // still text"));
    }
}
