//! Sql string operation.
//!
//! The driver never parses SQL for meaning, the server does. These helpers only
//! skip over quoted text and comments to find positional parameter markers,
//! and quote identifiers and literals for the few statements the driver
//! builds itself.

/// Returns `true` if `sql` is empty or only whitespace.
pub fn is_blank(sql: &str) -> bool {
    sql.trim().is_empty()
}

/// Number of positional parameters, the highest `$n` marker in `sql`.
///
/// Markers inside string literals, quoted identifiers, dollar quoted bodies
/// and comments are ignored.
pub fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0;
    let mut i = 0;

    let ident_char = |b: u8| b.is_ascii_alphanumeric() || b == b'_' || b >= 0x80;

    while i < bytes.len() {
        match bytes[i] {
            b'\'' => {
                // E'' strings accept backslash escapes
                let escapes = i > 0 && matches!(bytes[i - 1], b'e' | b'E')
                    && (i < 2 || !ident_char(bytes[i - 2]));
                i = skip_quoted(bytes, i + 1, b'\'', escapes);
            }
            b'"' => i = skip_quoted(bytes, i + 1, b'"', false),
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                i = match bytes[i..].iter().position(|b| *b == b'\n') {
                    Some(n) => i + n + 1,
                    None => bytes.len(),
                };
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => i = skip_block_comment(bytes, i + 2),
            b'$' if i > 0 && ident_char(bytes[i - 1]) => i += 1,
            b'$' => {
                let digits = bytes[i + 1..].iter().take_while(|b| b.is_ascii_digit()).count();
                if digits > 0 {
                    let n = sql[i + 1..i + 1 + digits].parse().unwrap_or(usize::MAX);
                    max = max.max(n);
                    i += 1 + digits;
                } else {
                    i = skip_dollar_quoted(bytes, i);
                }
            }
            _ => i += 1,
        }
    }

    max
}

fn skip_quoted(bytes: &[u8], mut i: usize, quote: u8, escapes: bool) -> usize {
    while i < bytes.len() {
        match bytes[i] {
            b'\\' if escapes => i += 2,
            // doubled quote is an escaped quote
            b if b == quote && bytes.get(i + 1) == Some(&quote) => i += 2,
            b if b == quote => return i + 1,
            _ => i += 1,
        }
    }
    bytes.len()
}

fn skip_block_comment(bytes: &[u8], mut i: usize) -> usize {
    // block comments nest
    let mut depth = 1;
    while i < bytes.len() {
        if bytes[i..].starts_with(b"/*") {
            depth += 1;
            i += 2;
        } else if bytes[i..].starts_with(b"*/") {
            depth -= 1;
            i += 2;
            if depth == 0 {
                return i;
            }
        } else {
            i += 1;
        }
    }
    bytes.len()
}

/// `start` points at a `$` not followed by a digit.
fn skip_dollar_quoted(bytes: &[u8], start: usize) -> usize {
    let tag_len = bytes[start + 1..]
        .iter()
        .take_while(|b| b.is_ascii_alphanumeric() || **b == b'_')
        .count();
    let tag_end = start + 1 + tag_len;

    if bytes.get(tag_end) != Some(&b'$') {
        return start + 1;
    }

    let tag = &bytes[start..=tag_end];
    let body = tag_end + 1;
    match bytes[body..].windows(tag.len()).position(|w| w == tag) {
        Some(n) => body + n + tag.len(),
        None => bytes.len(),
    }
}

/// Quote an identifier, doubling embedded double quotes.
pub fn quote_ident(ident: &str) -> String {
    let mut out = String::with_capacity(ident.len() + 2);
    out.push('"');
    for c in ident.chars() {
        if c == '"' {
            out.push('"');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Quote a string literal, doubling embedded single quotes.
pub fn quote_literal(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for c in value.chars() {
        if c == '\'' {
            out.push('\'');
        }
        out.push(c);
    }
    out.push('\'');
    out
}

/// Quote a possibly schema qualified name, `public.users` becomes `"public"."users"`.
pub fn quote_qualified(name: &str) -> String {
    name.split('.').map(quote_ident).collect::<Vec<_>>().join(".")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn params() {
        assert_eq!(count_params("SELECT 1"), 0);
        assert_eq!(count_params("SELECT $1, $2"), 2);
        assert_eq!(count_params("SELECT $2"), 2);
        assert_eq!(count_params("SELECT $1, $1::int"), 1);
        assert_eq!(count_params("INSERT INTO t VALUES ($1,$10)"), 10);
    }

    #[test]
    fn params_skip_quoted() {
        assert_eq!(count_params("SELECT '$1', $2"), 2);
        assert_eq!(count_params("SELECT 'it''s $3'"), 0);
        assert_eq!(count_params("SELECT E'\\' $3', $1"), 1);
        assert_eq!(count_params("SELECT \"$5\" FROM t WHERE a = $1"), 1);
        assert_eq!(count_params("SELECT 1 -- $4\n, $1"), 1);
        assert_eq!(count_params("SELECT /* $4 /* $5 */ */ $2"), 2);
        assert_eq!(count_params("SELECT $$ $9 $$, $fn$ $8 $fn$, $1"), 1);
        assert_eq!(count_params("SELECT a$1 FROM t"), 0);
    }

    #[test]
    fn quoting() {
        assert_eq!(quote_ident("users"), "\"users\"");
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
        assert_eq!(quote_literal("it's"), "'it''s'");
        assert_eq!(quote_qualified("public.users"), "\"public\".\"users\"");
    }

    #[test]
    fn blank() {
        assert!(is_blank(""));
        assert!(is_blank(" \n\t"));
        assert!(!is_blank(" SELECT 1"));
    }
}
