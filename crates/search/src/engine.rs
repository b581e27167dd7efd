//! Inverted index: postings per field and term, stored fields per document.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use regex::Regex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::mapping::MappedDoc;
use crate::query::Query;
use crate::{SearchError, SearchResult};

pub type DocId = u32;

/// Scored matches, ordered by doc id.
pub(crate) type Matches = Vec<(DocId, f64)>;

pub(crate) const INDEX_FILE: &str = "index.json";
/// Free slots tolerated beyond the live count before ids are reassigned.
const COMPACT_SLACK: usize = 64;

#[derive(Default)]
pub struct Engine {
    docs: Vec<Option<Arc<MappedDoc>>>,
    ids: FxHashMap<String, DocId>,
    postings: FxHashMap<String, FxHashMap<String, Vec<DocId>>>,
    rv: i64,
}

#[derive(Serialize, Deserialize)]
struct IndexFile {
    rv: i64,
    docs: Vec<MappedDoc>,
}

impl Engine {
    pub fn doc_count(&self) -> usize {
        self.ids.len()
    }

    pub fn rv(&self) -> i64 {
        self.rv
    }

    pub fn set_rv(&mut self, rv: i64) {
        self.rv = rv;
    }

    pub fn doc(&self, id: DocId) -> Option<&Arc<MappedDoc>> {
        self.docs.get(id as usize).and_then(|d| d.as_ref())
    }

    /// Insert or replace by search id.
    pub fn upsert(&mut self, doc: MappedDoc) -> SearchResult<()> {
        self.remove(&doc.id);
        self.push(Arc::new(doc))
    }

    fn push(&mut self, doc: Arc<MappedDoc>) -> SearchResult<()> {
        let id = DocId::try_from(self.docs.len())
            .map_err(|_| SearchError::Internal(format!("index is full at {} slots", self.docs.len())))?;
        for (field, term) in &doc.terms {
            // ids only grow, so postings stay sorted
            self.postings.entry(field.clone()).or_default().entry(term.clone()).or_default().push(id);
        }
        self.ids.insert(doc.id.clone(), id);
        self.docs.push(Some(doc));
        Ok(())
    }

    /// Slots in use, live or freed.
    pub(crate) fn slots(&self) -> usize {
        self.docs.len()
    }

    /// Renumber live documents once freed slots outweigh them; relative order is kept.
    fn maybe_compact(&mut self) {
        if self.docs.len() <= 2 * self.ids.len() + COMPACT_SLACK {
            return;
        }
        let live: Vec<Arc<MappedDoc>> = std::mem::take(&mut self.docs).into_iter().flatten().collect();
        self.ids.clear();
        self.postings.clear();
        for (id, doc) in live.into_iter().enumerate() {
            // fewer live docs than slots before, so ids still fit
            let id = id as DocId;
            for (field, term) in &doc.terms {
                self.postings.entry(field.clone()).or_default().entry(term.clone()).or_default().push(id);
            }
            self.ids.insert(doc.id.clone(), id);
            self.docs.push(Some(doc));
        }
    }

    pub fn remove(&mut self, search_id: &str) -> bool {
        let Some(id) = self.ids.remove(search_id) else { return false };
        let Some(doc) = self.docs.get_mut(id as usize).and_then(Option::take) else { return false };
        for (field, term) in &doc.terms {
            if let Some(terms) = self.postings.get_mut(field) {
                if let Some(list) = terms.get_mut(term) {
                    if let Ok(pos) = list.binary_search(&id) {
                        list.remove(pos);
                    }
                    if list.is_empty() {
                        terms.remove(term);
                    }
                }
            }
        }
        self.maybe_compact();
        true
    }

    /// Stored field names present in at least one document.
    pub fn stored_fields(&self) -> Vec<String> {
        let mut names: Vec<String> =
            self.docs.iter().flatten().flat_map(|d| d.stored.keys().cloned()).collect();
        names.sort();
        names.dedup();
        names
    }

    fn live(&self) -> Matches {
        self.docs.iter().enumerate().filter(|(_, d)| d.is_some()).map(|(i, _)| (i as DocId, 1.0)).collect()
    }

    /// Rarer terms score higher.
    fn idf(&self, df: usize) -> f64 {
        1.0 + ((self.doc_count() as f64 + 1.0) / (df as f64 + 1.0)).ln()
    }

    pub(crate) fn eval(&self, q: &Query) -> Matches {
        match q {
            Query::MatchAll => self.live(),
            Query::MatchNone => Vec::new(),
            Query::Term { field, term, boost } => {
                let Some(list) = self.postings.get(field).and_then(|t| t.get(term)) else { return Vec::new() };
                let score = boost * self.idf(list.len());
                list.iter().map(|id| (*id, score)).collect()
            }
            Query::Wildcard { field, pattern } => {
                let Some(terms) = self.postings.get(field) else { return Vec::new() };
                let Ok(re) = wildcard_regex(pattern) else { return Vec::new() };
                let mut hit: BTreeMap<DocId, f64> = BTreeMap::new();
                for (term, list) in terms {
                    if re.is_match(term) {
                        for id in list {
                            hit.insert(*id, 1.0);
                        }
                    }
                }
                hit.into_iter().collect()
            }
            Query::Phrase { field, words } => {
                if words.is_empty() {
                    return Vec::new();
                }
                self.docs
                    .iter()
                    .enumerate()
                    .filter_map(|(i, d)| d.as_ref().map(|d| (i, d)))
                    .filter(|(_, d)| {
                        let text = d.stored.get(field).and_then(Value::as_str).unwrap_or("");
                        crate::analysis::tokenize(text).windows(words.len()).any(|w| w == words.as_slice())
                    })
                    .map(|(i, _)| (i as DocId, words.len() as f64))
                    .collect()
            }
            Query::Conjunction(qs) => {
                let mut iter = qs.iter();
                let Some(first) = iter.next() else { return self.live() };
                let mut acc = self.eval(first);
                for q in iter {
                    if acc.is_empty() {
                        break;
                    }
                    acc = intersect_sorted(&acc, &self.eval(q));
                }
                acc
            }
            Query::Disjunction { queries, min } => {
                let mut hit: BTreeMap<DocId, (f64, usize)> = BTreeMap::new();
                for q in queries {
                    for (id, s) in self.eval(q) {
                        let e = hit.entry(id).or_insert((0.0, 0));
                        e.0 += s;
                        e.1 += 1;
                    }
                }
                hit.into_iter().filter(|(_, (_, n))| n >= min).map(|(id, (s, _))| (id, s)).collect()
            }
            Query::Boolean { must, should, must_not } => {
                let mut acc = if !must.is_empty() {
                    self.eval(&Query::Conjunction(must.clone()))
                } else if !should.is_empty() {
                    self.eval(&Query::Disjunction { queries: should.clone(), min: 1 })
                } else {
                    self.live()
                };
                if !must.is_empty() && !should.is_empty() {
                    let extra = self.eval(&Query::Disjunction { queries: should.clone(), min: 1 });
                    add_scores(&mut acc, &extra);
                }
                for q in must_not {
                    acc = subtract_sorted(&acc, &self.eval(q));
                }
                acc
            }
        }
    }

    pub fn save(&self, dir: &Path) -> SearchResult<()> {
        let file = IndexFile { rv: self.rv, docs: self.docs.iter().flatten().map(|d| (**d).clone()).collect() };
        let tmp = dir.join(format!("{INDEX_FILE}.tmp"));
        std::fs::write(&tmp, serde_json::to_vec(&file)?)?;
        std::fs::rename(&tmp, dir.join(INDEX_FILE))?;
        Ok(())
    }

    /// `None` when the directory holds no saved index.
    pub fn load(dir: &Path) -> SearchResult<Option<Self>> {
        let path = dir.join(INDEX_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let file: IndexFile = serde_json::from_slice(&std::fs::read(path)?)?;
        let mut engine = Engine { rv: file.rv, ..Default::default() };
        for d in file.docs {
            engine.upsert(d)?;
        }
        Ok(Some(engine))
    }
}

fn wildcard_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let mut re = String::from("^");
    for c in pattern.chars() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re)
}

fn intersect_sorted(a: &[(DocId, f64)], b: &[(DocId, f64)]) -> Matches {
    let (mut i, mut j) = (0usize, 0usize);
    let mut out = Vec::new();
    while i < a.len() && j < b.len() {
        match a[i].0.cmp(&b[j].0) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                out.push((a[i].0, a[i].1 + b[j].1));
                i += 1;
                j += 1;
            }
        }
    }
    out
}

fn subtract_sorted(a: &[(DocId, f64)], b: &[(DocId, f64)]) -> Matches {
    let mut j = 0usize;
    let mut out = Vec::with_capacity(a.len());
    for &(id, s) in a {
        while j < b.len() && b[j].0 < id {
            j += 1;
        }
        if j < b.len() && b[j].0 == id {
            continue;
        }
        out.push((id, s));
    }
    out
}

fn add_scores(acc: &mut Matches, extra: &[(DocId, f64)]) {
    let mut j = 0usize;
    for (id, s) in acc.iter_mut() {
        while j < extra.len() && extra[j].0 < *id {
            j += 1;
        }
        if j < extra.len() && extra[j].0 == *id {
            *s += extra[j].1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::Mapping;
    use arca_core::{IndexableDocument, ResourceKey};

    fn engine() -> Engine {
        let m = Mapping::default();
        let mut e = Engine::default();
        for (name, title, tags) in [("aaa", "aaa (dash)", vec!["aa", "bb"]), ("bbb", "bbb (dash)", vec!["aa"]), ("ccc", "ccc", vec![])] {
            let key = ResourceKey::new("g", "r", "ns", name);
            e.upsert(m.map(&IndexableDocument::new(key, 1, title).with_tags(&tags))).unwrap();
        }
        e
    }

    fn ids(e: &Engine, q: &Query) -> Vec<String> {
        e.eval(q).iter().filter_map(|(id, _)| e.doc(*id)).map(|d| d.id.rsplit('/').next().unwrap_or("").to_string()).collect()
    }

    #[test]
    fn boolean_logic() {
        let e = engine();
        assert_eq!(ids(&e, &Query::term("tags", "aa")), vec!["aaa", "bbb"]);
        let q = Query::Conjunction(vec![Query::term("tags", "aa"), Query::term("tags", "bb")]);
        assert_eq!(ids(&e, &q), vec!["aaa"]);
        let q = Query::Boolean { must: vec![], should: vec![], must_not: vec![Query::term("tags", "bb")] };
        assert_eq!(ids(&e, &q), vec!["bbb", "ccc"]);
        let q = Query::Wildcard { field: "title_phrase".into(), pattern: "?b*".into() };
        assert_eq!(ids(&e, &q), vec!["bbb"]);
        let q = Query::Phrase { field: "title".into(), words: vec!["aaa".into(), "dash".into()] };
        assert_eq!(ids(&e, &q), vec!["aaa"]);
    }

    #[test]
    fn replacing_a_document_drops_its_old_terms() {
        let mut e = engine();
        let key = ResourceKey::new("g", "r", "ns", "aaa");
        e.upsert(Mapping::default().map(&IndexableDocument::new(key, 2, "aaa").with_tags(&["cc"]))).unwrap();
        assert_eq!(e.doc_count(), 3);
        assert_eq!(ids(&e, &Query::term("tags", "bb")), Vec::<String>::new());
        assert_eq!(ids(&e, &Query::term("tags", "cc")), vec!["aaa"]);
        assert!(e.remove("ns/g/r/aaa"));
        assert!(!e.remove("ns/g/r/aaa"));
        assert_eq!(e.doc_count(), 2);
    }

    #[test]
    fn churn_keeps_slots_bounded() {
        let mut e = engine();
        let m = Mapping::default();
        for rv in 0..10_000 {
            let key = ResourceKey::new("g", "r", "ns", "bbb");
            let tag = if rv % 2 == 0 { "even" } else { "odd" };
            e.upsert(m.map(&IndexableDocument::new(key, rv, "bbb").with_tags(&[tag]))).unwrap();
        }
        assert_eq!(e.doc_count(), 3);
        assert!(e.slots() <= 2 * 3 + COMPACT_SLACK + 1, "{} slots", e.slots());
        assert_eq!(ids(&e, &Query::term("tags", "odd")), vec!["bbb"]);
        assert!(ids(&e, &Query::term("tags", "even")).is_empty());
        assert_eq!(ids(&e, &Query::MatchAll), vec!["aaa", "ccc", "bbb"]);
        assert_eq!(ids(&e, &Query::term("tags", "aa")), vec!["aaa"]);
    }

    #[test]
    fn save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut e = engine();
        e.set_rv(99);
        e.save(dir.path()).unwrap();
        let back = Engine::load(dir.path()).unwrap().unwrap();
        assert_eq!((back.doc_count(), back.rv()), (3, 99));
        assert_eq!(ids(&back, &Query::term("tags", "aa")), vec!["aaa", "bbb"]);
        assert!(Engine::load(&dir.path().join("missing")).unwrap().is_none());
    }
}
