//! Field mapping: how each document field is analyzed, indexed and stored.

use std::collections::BTreeMap;

use arca_core::columns::ColumnType;
use arca_core::document::*;
use arca_core::IndexableDocument;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::analysis;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Exact, case preserving.
    Keyword,
    /// Lowercased whole value.
    Phrase,
    /// Edge n-grams of lowercase words.
    EdgeNgram,
    /// n-grams of lowercase words.
    Ngram,
    Numeric,
    Date,
    /// Stored for display, never indexed.
    StoredOnly,
}

impl FieldKind {
    pub fn is_numeric(&self) -> bool {
        matches!(self, FieldKind::Numeric | FieldKind::Date)
    }

    pub fn is_analyzed(&self) -> bool {
        matches!(self, FieldKind::EdgeNgram | FieldKind::Ngram)
    }

    /// Terms written into the index for one value.
    pub fn index_terms(&self, value: &str) -> Vec<String> {
        match self {
            FieldKind::Keyword | FieldKind::Numeric | FieldKind::Date => vec![value.to_string()],
            FieldKind::Phrase => vec![value.to_lowercase()],
            FieldKind::EdgeNgram => analysis::edge_ngrams(value),
            FieldKind::Ngram => analysis::ngrams(value),
            FieldKind::StoredOnly => Vec::new(),
        }
    }

    /// Terms a query value must all match.
    pub fn query_terms(&self, value: &str) -> Vec<String> {
        match self {
            FieldKind::EdgeNgram => analysis::tokenize(value).iter().map(|w| analysis::edge_prefix(w)).collect(),
            FieldKind::Date => vec![date_term(value)],
            FieldKind::Numeric => vec![numeric_term(value)],
            other => other.index_terms(value),
        }
    }
}

fn number_term(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 9.0e18 {
        (n as i64).to_string()
    } else {
        n.to_string()
    }
}

fn numeric_term(value: &str) -> String {
    let v = value.trim();
    if let Ok(i) = v.parse::<i64>() {
        return i.to_string();
    }
    v.parse::<f64>().map(number_term).unwrap_or_else(|_| value.to_string())
}

/// Millisecond term for a date given either as millis or RFC 3339.
fn date_term(value: &str) -> String {
    if let Ok(ms) = value.trim().parse::<i64>() {
        return ms.to_string();
    }
    chrono::DateTime::parse_from_rfc3339(value.trim())
        .map(|dt| dt.timestamp_millis().to_string())
        .unwrap_or_else(|_| value.to_string())
}

/// One document as the engine sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappedDoc {
    pub id: String,
    /// `(field, term)` pairs, deduplicated.
    pub terms: Vec<(String, String)>,
    pub stored: BTreeMap<String, Value>,
}

/// Field mapping of one shard: the standard fields plus its custom fields.
#[derive(Debug, Clone, Default)]
pub struct Mapping {
    custom: BTreeMap<String, ColumnType>,
}

impl Mapping {
    pub fn new(fields: &DocumentFields) -> Self {
        Self { custom: fields.fields.iter().map(|f| (f.name.clone(), f.kind)).collect() }
    }

    pub fn is_custom(&self, name: &str) -> bool {
        self.custom.contains_key(name)
    }

    /// Index field a user-facing name refers to.
    pub fn resolve(&self, name: &str) -> String {
        if self.is_custom(name) {
            format!("{FIELD_PREFIX}{name}")
        } else {
            name.to_string()
        }
    }

    /// Index field used to sort by `name`.
    pub fn sort_field(&self, name: &str) -> String {
        if name == FIELD_TITLE {
            FIELD_TITLE_PHRASE.to_string()
        } else {
            self.resolve(name)
        }
    }

    pub fn kind(&self, field: &str) -> FieldKind {
        match field {
            FIELD_TITLE => FieldKind::EdgeNgram,
            FIELD_TITLE_PHRASE => FieldKind::Phrase,
            FIELD_TITLE_NGRAM | FIELD_DESCRIPTION => FieldKind::Ngram,
            FIELD_RV => FieldKind::Numeric,
            FIELD_CREATED | FIELD_UPDATED | FIELD_SOURCE_TIME => FieldKind::Date,
            f => match f.strip_prefix(FIELD_PREFIX).and_then(|n| self.custom.get(n)) {
                Some(ColumnType::Json) => FieldKind::StoredOnly,
                Some(ColumnType::DateTime) => FieldKind::Date,
                Some(t) if t.is_numeric() => FieldKind::Numeric,
                _ => FieldKind::Keyword,
            },
        }
    }

    pub fn map(&self, doc: &IndexableDocument) -> MappedDoc {
        let mut out = MappedDoc { id: doc.key.search_id(), terms: Vec::new(), stored: BTreeMap::new() };
        let mut put = |field: &str, v: Value| {
            let kind = self.kind(field);
            let values: Vec<String> = match &v {
                Value::String(s) => vec![s.clone()],
                Value::Number(n) => n.as_i64().map(|i| i.to_string()).or_else(|| n.as_f64().map(number_term)).into_iter().collect(),
                Value::Bool(b) => vec![b.to_string()],
                Value::Array(items) => items.iter().filter_map(|x| x.as_str().map(str::to_string)).collect(),
                _ => Vec::new(),
            };
            for val in values {
                for t in kind.index_terms(&val) {
                    out.terms.push((field.to_string(), t));
                }
            }
            out.stored.insert(field.to_string(), v);
        };

        put(FIELD_NAME, Value::from(doc.name.as_str()));
        put(FIELD_TITLE, Value::from(doc.title.as_str()));
        put(FIELD_TITLE_PHRASE, Value::from(doc.title.to_lowercase()));
        put(FIELD_TITLE_NGRAM, Value::from(doc.title.as_str()));
        if !doc.description.is_empty() {
            put(FIELD_DESCRIPTION, Value::from(doc.description.as_str()));
        }
        if !doc.tags.is_empty() {
            put(FIELD_TAGS, Value::from(doc.tags.clone()));
        }
        if !doc.folder.is_empty() {
            put(FIELD_FOLDER, Value::from(doc.folder.as_str()));
        }
        put(FIELD_RV, Value::from(doc.rv));
        if doc.created > 0 {
            put(FIELD_CREATED, Value::from(doc.created));
        }
        if doc.updated > 0 {
            put(FIELD_UPDATED, Value::from(doc.updated));
        }
        for (k, v) in &doc.labels {
            put(&format!("{FIELD_LABELS}.{k}"), Value::from(v.as_str()));
        }
        if let Some(m) = doc.manager.as_ref().filter(|m| !m.kind.is_empty()) {
            put(FIELD_MANAGER_KIND, Value::from(m.kind.as_str()));
            put(FIELD_MANAGER_ID, Value::from(m.id.as_str()));
        }
        if let Some(by) = doc.managed_by() {
            put(FIELD_MANAGED_BY, Value::from(by));
        }
        if let Some(src) = &doc.source {
            put(FIELD_SOURCE_PATH, Value::from(src.path.as_str()));
            if !src.checksum.is_empty() {
                put(FIELD_SOURCE_CHECKSUM, Value::from(src.checksum.as_str()));
            }
            if src.timestamp_millis > 0 {
                put(FIELD_SOURCE_TIME, Value::from(src.timestamp_millis));
            }
        }
        for (k, v) in &doc.fields {
            put(&format!("{FIELD_PREFIX}{k}"), v.clone());
        }

        out.terms.sort();
        out.terms.dedup();
        out
    }
}
