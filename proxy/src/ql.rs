//! Just enough InfluxQL (and Flux) literacy to dispatch queries.
//!
//! The proxy never evaluates queries - it only needs to know which backend
//! owns the measurement a query touches, or that a meta query must be
//! broadcast and reduced. This module extracts exactly that: a token
//! stream, the head statement, and the db/rp/measurement coordinates of a
//! FROM clause.

/// Split a query into tokens: bare words, unquoted contents of `"` / `'`
/// quoted runs, and single-character punctuation.
pub fn tokenize(q: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut chars = q.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {}
            '"' | '\'' => {
                let mut s = String::new();
                while let Some(c2) = chars.next() {
                    match c2 {
                        c2 if c2 == c => break,
                        // Keep the escaped character, drop the backslash.
                        '\\' => {
                            if let Some(escaped) = chars.next() {
                                s.push(escaped);
                            }
                        }
                        other => s.push(other),
                    }
                }
                tokens.push(s);
            }
            '.' | ',' | '(' | ')' | ';' | '=' => tokens.push(c.to_string()),
            _ => {
                let mut s = String::new();
                s.push(c);
                while let Some(&c2) = chars.peek() {
                    if c2.is_whitespace()
                        || matches!(c2, '"' | '\'' | '.' | ',' | '(' | ')' | ';' | '=')
                    {
                        break;
                    }
                    s.push(c2);
                    chars.next();
                }
                tokens.push(s);
            }
        }
    }
    tokens
}

/// The first `n` tokens, lowercased and space-joined.
pub fn head_stmt(tokens: &[String], n: usize) -> String {
    tokens
        .iter()
        .take(n)
        .map(|t| t.to_ascii_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Statements the dispatcher understands start with one of these verbs.
pub fn is_valid(tokens: &[String]) -> bool {
    tokens.first().is_some_and(|t| {
        t.eq_ignore_ascii_case("select")
            || t.eq_ignore_ascii_case("show")
            || t.eq_ignore_ascii_case("delete")
            || t.eq_ignore_ascii_case("drop")
    })
}

/// Does the statement carry a FROM clause?
pub fn has_from(tokens: &[String]) -> bool {
    tokens.iter().any(|t| t.eq_ignore_ascii_case("from"))
}

/// The (db, rp, measurement) components of the FROM target, any of which
/// may be absent. `FROM db.rp.m`, `FROM rp.m`, `FROM db..m` and `FROM m`
/// all resolve; a subquery does not.
pub fn from_target(tokens: &[String]) -> (Option<String>, Option<String>, Option<String>) {
    let at = match tokens.iter().position(|t| t.eq_ignore_ascii_case("from")) {
        Some(at) => at,
        None => return (None, None, None),
    };

    let mut components: Vec<String> = Vec::new();
    let mut current: Option<String> = None;

    for token in &tokens[at + 1..] {
        match token.as_str() {
            "." => components.push(current.take().unwrap_or_default()),
            "(" => return (None, None, None),
            _ => {
                if current.is_some() {
                    // Two idents in a row: the target ended one token ago.
                    break;
                }
                current = Some(token.clone());
            }
        }
    }
    components.push(current.unwrap_or_default());

    let non_empty = |s: String| if s.is_empty() { None } else { Some(s) };
    let mut it = components.into_iter();
    match it.len() {
        3 => {
            let db = non_empty(it.next().unwrap());
            let rp = non_empty(it.next().unwrap());
            let meas = non_empty(it.next().unwrap());
            (db, rp, meas)
        }
        2 => {
            let rp = non_empty(it.next().unwrap());
            let meas = non_empty(it.next().unwrap());
            (None, rp, meas)
        }
        _ => (None, None, non_empty(it.next().unwrap_or_default())),
    }
}

/// The measurement a statement addresses: the FROM target, or the token
/// after `MEASUREMENT` for `DROP MEASUREMENT m`.
pub fn measurement_from(tokens: &[String]) -> Option<String> {
    if has_from(tokens) {
        return from_target(tokens).2;
    }

    let at = tokens
        .iter()
        .position(|t| t.eq_ignore_ascii_case("measurement"))?;
    tokens.get(at + 1).filter(|t| *t != ";").cloned()
}

/// The database a statement names: an `ON` clause, or the first component
/// of a three-part FROM target.
pub fn database_from(tokens: &[String]) -> Option<String> {
    if let Some(at) = tokens.iter().position(|t| t.eq_ignore_ascii_case("on")) {
        return tokens.get(at + 1).cloned();
    }
    from_target(tokens).0
}

/// The retention policy named by the FROM target, if any.
pub fn retention_policy_from(tokens: &[String]) -> Option<String> {
    from_target(tokens).1
}

/// Scan a Flux script for its `bucket: "..."` source and
/// `_measurement == "..."` filter.
pub fn scan_flux(query: &str) -> (Option<String>, Option<String>) {
    let bucket = find_quoted_after(query, "bucket", &[':']);
    let measurement = find_quoted_after(query, "_measurement", &['"', ']', ')', '=']);
    (bucket, measurement)
}

/// Find `needle`, skip whitespace and bytes from `skip`, then read one
/// double-quoted string.
fn find_quoted_after(haystack: &str, needle: &str, skip: &[char]) -> Option<String> {
    let at = haystack.find(needle)? + needle.len();
    let rest = haystack[at..].trim_start_matches(|c: char| c.is_whitespace() || skip.contains(&c));

    let rest = rest.strip_prefix('"')?;
    let end = rest.find('"')?;
    Some(rest[..end].to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(q: &str) -> Vec<String> {
        tokenize(q)
    }

    #[test]
    fn tokenize_words_quotes_and_punct() {
        assert_eq!(
            toks(r#"select * from "my db".autogen.cpu where x = 'y'"#),
            ["select", "*", "from", "my db", ".", "autogen", ".", "cpu", "where", "x", "=", "y"]
        );
    }

    #[test]
    fn head_statements() {
        let t = toks("SHOW TAG VALUES FROM cpu WITH KEY = host");
        assert_eq!(head_stmt(&t, 3), "show tag values");
        assert_eq!(head_stmt(&t, 2), "show tag");
    }

    #[test]
    fn validity() {
        assert!(is_valid(&toks("select * from cpu")));
        assert!(is_valid(&toks("SHOW MEASUREMENTS")));
        assert!(is_valid(&toks("drop measurement cpu")));
        assert!(!is_valid(&toks("insert into cpu")));
        assert!(!is_valid(&toks("")));
    }

    #[test]
    fn from_targets() {
        assert_eq!(
            from_target(&toks("select * from cpu")),
            (None, None, Some("cpu".into()))
        );
        assert_eq!(
            from_target(&toks("select * from db.rp.cpu where t > 0")),
            (Some("db".into()), Some("rp".into()), Some("cpu".into()))
        );
        assert_eq!(
            from_target(&toks("select * from db..cpu")),
            (Some("db".into()), None, Some("cpu".into()))
        );
        assert_eq!(
            from_target(&toks(r#"select * from "rp"."cpu""#)),
            (None, Some("rp".into()), Some("cpu".into()))
        );
        // Subqueries cannot be routed by key.
        assert_eq!(
            from_target(&toks("select * from (select * from cpu)")),
            (None, None, None)
        );
    }

    #[test]
    fn measurements() {
        assert_eq!(
            measurement_from(&toks("show field keys from cpu")),
            Some("cpu".into())
        );
        assert_eq!(
            measurement_from(&toks("drop measurement cpu")),
            Some("cpu".into())
        );
        assert_eq!(measurement_from(&toks("show measurements")), None);
    }

    #[test]
    fn databases() {
        assert_eq!(
            database_from(&toks("show measurements on telegraf")),
            Some("telegraf".into())
        );
        assert_eq!(
            database_from(&toks("select * from db.rp.cpu")),
            Some("db".into())
        );
        assert_eq!(database_from(&toks("select * from cpu")), None);
    }

    #[test]
    fn flux_scan() {
        let q = r#"from(bucket: "my-bucket")
            |> range(start: -1h)
            |> filter(fn: (r) => r._measurement == "cpu")"#;
        assert_eq!(
            scan_flux(q),
            (Some("my-bucket".into()), Some("cpu".into()))
        );

        let q = r#"from(bucket:"b") |> filter(fn: (r) => r["_measurement"] == "mem")"#;
        assert_eq!(scan_flux(q), (Some("b".into()), Some("mem".into())));

        assert_eq!(scan_flux("buckets()"), (None, None));
    }
}
