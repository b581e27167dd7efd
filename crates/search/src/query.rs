//! Query tree, the query-string parser and requirement translation.

use std::fmt;

use arca_core::document::{FIELD_LABELS, FIELD_TITLE, FIELD_TITLE_NGRAM, FIELD_TITLE_PHRASE};

use crate::analysis;
use crate::mapping::{FieldKind, Mapping};
use crate::{Requirement, SearchError, SearchResult};

pub const TITLE_PHRASE_BOOST: f64 = 10.0;
pub const TITLE_PREFIX_BOOST: f64 = 5.0;

#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    MatchAll,
    MatchNone,
    Term { field: String, term: String, boost: f64 },
    /// `*` matches any run, `?` one char.
    Wildcard { field: String, pattern: String },
    /// Consecutive lowercase words of a stored text field.
    Phrase { field: String, words: Vec<String> },
    Conjunction(Vec<Query>),
    Disjunction { queries: Vec<Query>, min: usize },
    Boolean { must: Vec<Query>, should: Vec<Query>, must_not: Vec<Query> },
}

impl Query {
    pub fn term(field: &str, term: &str) -> Self {
        Query::Term { field: field.to_string(), term: term.to_string(), boost: 1.0 }
    }

    fn boosted(field: &str, term: &str, boost: f64) -> Self {
        Query::Term { field: field.to_string(), term: term.to_string(), boost }
    }

    /// Match every term, or nothing when the analyzer produced none.
    fn all_terms(field: &str, terms: Vec<String>) -> Self {
        match terms.len() {
            0 => Query::MatchNone,
            1 => Query::term(field, &terms[0]),
            _ => Query::Conjunction(terms.iter().map(|t| Query::term(field, t)).collect()),
        }
    }

    /// AND the parts together; an empty list matches everything.
    pub fn and(mut parts: Vec<Query>) -> Self {
        parts.retain(|q| *q != Query::MatchAll);
        match parts.len() {
            0 => Query::MatchAll,
            1 => parts.remove(0),
            _ => Query::Conjunction(parts),
        }
    }
}

fn join(f: &mut fmt::Formatter<'_>, qs: &[Query], sep: &str) -> fmt::Result {
    for (i, q) in qs.iter().enumerate() {
        if i > 0 {
            f.write_str(sep)?;
        }
        write!(f, "{q}")?;
    }
    Ok(())
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Query::MatchAll => f.write_str("*"),
            Query::MatchNone => f.write_str("-*"),
            Query::Term { field, term, boost } if *boost == 1.0 => write!(f, "{field}:{term}"),
            Query::Term { field, term, boost } => write!(f, "{field}:{term}^{boost}"),
            Query::Wildcard { field, pattern } => write!(f, "{field}:{pattern}"),
            Query::Phrase { field, words } => write!(f, "{field}:\"{}\"", words.join(" ")),
            Query::Conjunction(qs) => {
                f.write_str("(")?;
                join(f, qs, " AND ")?;
                f.write_str(")")
            }
            Query::Disjunction { queries, .. } => {
                f.write_str("(")?;
                join(f, queries, " OR ")?;
                f.write_str(")")
            }
            Query::Boolean { must, should, must_not } => {
                let mut first = true;
                for (prefix, qs) in [("+", must), ("", should), ("-", must_not)] {
                    for q in qs {
                        if !first {
                            f.write_str(" ")?;
                        }
                        first = false;
                        write!(f, "{prefix}{q}")?;
                    }
                }
                Ok(())
            }
        }
    }
}

fn is_wildcard(s: &str) -> bool {
    s.contains('*') || s.contains('?')
}

/// Lowercase values aimed at a lowercased keyword field.
pub fn filter_value(field: &str, value: &str) -> String {
    if field.ends_with("phrase") {
        value.to_lowercase()
    } else {
        value.to_string()
    }
}

/// Query matching one value of `field`.
fn value_query(mapping: &Mapping, field: &str, value: &str) -> Query {
    if value == "*" {
        return Query::MatchAll;
    }
    let value = filter_value(field, value);
    let kind = mapping.kind(field);
    if is_wildcard(&value) {
        let pattern = if kind.is_analyzed() { value.to_lowercase() } else { value };
        return Query::Wildcard { field: field.to_string(), pattern };
    }
    Query::all_terms(field, kind.query_terms(&value))
}

/// Translate one requirement. Only equality is supported.
pub fn requirement_query(mapping: &Mapping, req: &Requirement, label: bool) -> SearchResult<Query> {
    match req.operator.as_str() {
        "=" | "==" => {}
        op => {
            return Err(SearchError::BadRequest(format!(
                "unsupported query operation ({} {} {:?})",
                req.key, op, req.values
            )))
        }
    }
    let field = if label { format!("{FIELD_LABELS}.{}", req.key) } else { mapping.resolve(&req.key) };
    Ok(match req.values.len() {
        0 => Query::MatchAll,
        1 => value_query(mapping, &field, &req.values[0]),
        _ => Query::Conjunction(req.values.iter().map(|v| value_query(mapping, &field, v)).collect()),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Occur {
    Must,
    Should,
    MustNot,
}

/// Split a query string into clauses, keeping quoted phrases whole.
fn clauses(input: &str) -> SearchResult<Vec<String>> {
    let mut out = Vec::new();
    let mut cur = String::new();
    let mut quoted = false;
    for c in input.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                cur.push(c);
            }
            c if c.is_whitespace() && !quoted => {
                if !cur.is_empty() {
                    out.push(std::mem::take(&mut cur));
                }
            }
            c => cur.push(c),
        }
    }
    if quoted {
        return Err(SearchError::BadRequest(format!("unterminated phrase in query '{input}'")));
    }
    if !cur.is_empty() {
        out.push(cur);
    }
    Ok(out)
}

/// Free-text query without a field.
fn text_query(word: &str) -> Query {
    if is_wildcard(word) {
        return Query::Wildcard { field: FIELD_TITLE_PHRASE.to_string(), pattern: word.to_lowercase() };
    }
    let mut any = vec![
        Query::boosted(FIELD_TITLE_PHRASE, &word.to_lowercase(), TITLE_PHRASE_BOOST),
        Query::boosted(FIELD_TITLE, &analysis::edge_prefix(word), TITLE_PREFIX_BOOST),
    ];
    let grams = analysis::ngrams(word);
    if !grams.is_empty() {
        any.push(Query::all_terms(FIELD_TITLE_NGRAM, grams));
    }
    Query::Disjunction { queries: any, min: 1 }
}

fn clause_query(mapping: &Mapping, field: Option<&str>, value: &str) -> Query {
    let phrase = value.len() >= 2 && value.starts_with('"') && value.ends_with('"');
    let text = if phrase { &value[1..value.len() - 1] } else { value };
    match field {
        None if phrase => Query::Phrase { field: FIELD_TITLE.to_string(), words: analysis::tokenize(text) },
        None => text_query(text),
        Some(f) => {
            let field = mapping.resolve(f);
            let kind = mapping.kind(&field);
            if phrase && kind.is_analyzed() {
                return Query::Phrase { field, words: analysis::tokenize(text) };
            }
            if phrase || matches!(kind, FieldKind::Keyword | FieldKind::Phrase) {
                let text = filter_value(&field, text);
                if !phrase && is_wildcard(&text) {
                    return Query::Wildcard { field, pattern: text };
                }
                return Query::term(&field, &kind.query_terms(&text).concat());
            }
            value_query(mapping, &field, text)
        }
    }
}

/// Parse the free-text query syntax: whitespace separated clauses, each with an
/// optional `+`/`-` prefix and an optional `field:` prefix.
pub fn parse_query_string(mapping: &Mapping, input: &str) -> SearchResult<Query> {
    let input = input.trim();
    if input.is_empty() || input == "*" {
        return Ok(Query::MatchAll);
    }
    let (mut must, mut should, mut must_not) = (Vec::new(), Vec::new(), Vec::new());
    for raw in clauses(input)? {
        let (occur, rest) = match raw.as_bytes()[0] {
            b'+' => (Occur::Must, &raw[1..]),
            b'-' => (Occur::MustNot, &raw[1..]),
            _ => (Occur::Should, raw.as_str()),
        };
        if rest.is_empty() {
            continue;
        }
        let (field, value) = match rest.split_once(':') {
            Some((f, v)) if !f.is_empty() && !f.starts_with('"') && !v.is_empty() => (Some(f), v),
            _ => (None, rest),
        };
        let q = clause_query(mapping, field, value);
        match occur {
            Occur::Must => must.push(q),
            Occur::Should => should.push(q),
            Occur::MustNot => must_not.push(q),
        }
    }
    if must.is_empty() && must_not.is_empty() && should.len() == 1 {
        return Ok(should.remove(0));
    }
    Ok(Query::Boolean { must, should, must_not })
}

#[cfg(test)]
mod tests {
    use super::*;
    use arca_core::columns::{col, ColumnType};
    use arca_core::document::DocumentFields;

    fn mapping() -> Mapping {
        Mapping::new(&DocumentFields::new(vec![col("panels", ColumnType::Int64, 1)]))
    }

    fn req(key: &str, op: &str, values: &[&str]) -> Requirement {
        Requirement { key: key.into(), operator: op.into(), values: values.iter().map(|v| v.to_string()).collect() }
    }

    #[test]
    fn equality_requirements() {
        let m = mapping();
        assert_eq!(requirement_query(&m, &req("tags", "=", &[]), false).unwrap(), Query::MatchAll);
        assert_eq!(requirement_query(&m, &req("tags", "==", &["aa"]), false).unwrap(), Query::term("tags", "aa"));
        assert_eq!(
            requirement_query(&m, &req("region", "=", &["east"]), true).unwrap(),
            Query::term("labels.region", "east")
        );
        assert_eq!(requirement_query(&m, &req("panels", "=", &["4"]), false).unwrap(), Query::term("fields.panels", "4"));
        let both = requirement_query(&m, &req("tags", "=", &["aa", "bb"]), false).unwrap();
        assert_eq!(both, Query::Conjunction(vec![Query::term("tags", "aa"), Query::term("tags", "bb")]));
        assert_eq!(requirement_query(&m, &req("title_phrase", "=", &["AAA"]), false).unwrap(), Query::term("title_phrase", "aaa"));
    }

    #[test]
    fn other_operators_are_rejected() {
        for op in ["!=", "in", "notin", "exists", "!", "gt", "lt"] {
            let err = requirement_query(&mapping(), &req("tags", op, &["aa"]), false).unwrap_err();
            assert_eq!(err.to_string(), format!("unsupported query operation (tags {op} [\"aa\"])"));
        }
    }

    #[test]
    fn bare_words_fan_out_over_title_fields() {
        let q = parse_query_string(&mapping(), "Dash").unwrap();
        assert_eq!(q.to_string(), "(title_phrase:dash^10 OR title:dash^5 OR (title_ngram:ash AND title_ngram:das AND title_ngram:dash))");
        assert_eq!(parse_query_string(&mapping(), " * ").unwrap(), Query::MatchAll);
        assert_eq!(parse_query_string(&mapping(), "").unwrap(), Query::MatchAll);
    }

    #[test]
    fn prefixes_fields_and_phrases() {
        let q = parse_query_string(&mapping(), "+tags:aa -folder:zzz \"aaa dash\" panels:4 aa*").unwrap();
        let Query::Boolean { must, should, must_not } = q else { panic!("expected boolean") };
        assert_eq!(must, vec![Query::term("tags", "aa")]);
        assert_eq!(must_not, vec![Query::term("folder", "zzz")]);
        assert_eq!(
            should,
            vec![
                Query::Phrase { field: "title".into(), words: vec!["aaa".into(), "dash".into()] },
                Query::term("fields.panels", "4"),
                Query::Wildcard { field: "title_phrase".into(), pattern: "aa*".into() },
            ]
        );
        assert!(parse_query_string(&mapping(), "\"open").is_err());
    }
}
