//! Lexical search projection over models.
//!
//! Every model is projected into five independently scored fields:
//!
//! | Field | Weight | Content |
//! |-------|--------|---------|
//! | `name` | 5 | model name |
//! | `description` | 3 | free-text description |
//! | `column_names` | 2 | all column names |
//! | `sql_text` | 1 | compiled text, raw text as fallback (first 2000 chars) |
//! | `tags` | 1 | tag set |
//!
//! Each field is scored with BM25 against its own length statistics and
//! the weighted field scores are summed, so a term in `name` always counts
//! more than the same term in `sql_text`. The index is derived state: it
//! is rebuilt from the graph at the end of every ingestion pass and never
//! read back from the store.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::models::Model;

pub const FIELD_COUNT: usize = 5;
pub const FIELD_NAMES: [&str; FIELD_COUNT] =
    ["name", "description", "column_names", "sql_text", "tags"];
pub const FIELD_WEIGHTS: [f64; FIELD_COUNT] = [5.0, 3.0, 2.0, 1.0, 1.0];

/// Upper bound on the SQL text projected into the index.
pub const SQL_TEXT_CHARS: usize = 2000;

const STOPWORDS: &[&str] = &[
    "a", "an", "the", "to", "for", "in", "of", "on", "at", "with", "and", "or", "is", "it", "me",
    "my", "this", "that", "by", "be", "from",
];

/// Light suffix stripper. Deterministic and idempotent enough for matching
/// query terms against indexed terms; not a linguistic stemmer.
pub fn stem(word: &str) -> String {
    if word.len() <= 3 || !word.is_ascii() {
        return word.to_string();
    }
    let mut w = word.to_string();

    if w.ends_with("ies") && w.len() > 4 {
        w.truncate(w.len() - 3);
        w.push('y');
    } else if w.ends_with("sses") {
        w.truncate(w.len() - 2);
    } else if w.ends_with('s') && !w.ends_with("ss") && !w.ends_with("us") {
        w.pop();
    }

    if w.ends_with("ing") && w.len() >= 6 {
        w.truncate(w.len() - 3);
    } else if w.ends_with("ed") && w.len() >= 5 {
        w.truncate(w.len() - 2);
    }

    if w.ends_with('e') && !w.ends_with("ee") && w.len() >= 4 {
        w.pop();
    }
    w
}

/// Split on non-alphanumeric characters, lowercase and stem.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| stem(&t.to_lowercase()))
        .collect()
}

/// Distinct query terms with stopwords removed. A query made only of
/// stopwords keeps them all.
pub fn query_terms(query: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let all: Vec<String> = tokenize(query)
        .into_iter()
        .filter(|t| seen.insert(t.clone()))
        .collect();
    let filtered: Vec<String> = all
        .iter()
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
        .cloned()
        .collect();
    if filtered.is_empty() {
        all
    } else {
        filtered
    }
}

/// The raw text of each field for one model.
pub fn project_fields(model: &Model) -> [String; FIELD_COUNT] {
    [
        model.name.clone(),
        model.description.clone(),
        model
            .columns
            .iter()
            .map(|c| c.name.as_str())
            .collect::<Vec<_>>()
            .join(" "),
        model.sql_text().chars().take(SQL_TEXT_CHARS).collect(),
        model.tags.join(" "),
    ]
}

#[derive(Debug, Clone, Default, PartialEq)]
struct FieldStats {
    tf: HashMap<String, u32>,
    len: u32,
}

#[derive(Debug, Clone, PartialEq)]
struct IndexedDoc {
    content_hash: String,
    fields: [FieldStats; FIELD_COUNT],
}

impl IndexedDoc {
    fn build(model: &Model) -> Self {
        let texts = project_fields(model);
        let fields = texts.map(|text| {
            let mut stats = FieldStats::default();
            for token in tokenize(&text) {
                *stats.tf.entry(token).or_insert(0) += 1;
                stats.len += 1;
            }
            stats
        });
        Self {
            content_hash: model.content_hash.clone(),
            fields,
        }
    }

    fn contains(&self, term: &str) -> bool {
        self.fields.iter().any(|f| f.tf.contains_key(term))
    }
}

/// BM25 parameters.
#[derive(Debug, Clone, Copy)]
pub struct Bm25 {
    pub k1: f64,
    pub b: f64,
}

/// In-memory field-weighted BM25 index keyed by model id.
#[derive(Debug, Clone, Default)]
pub struct SearchIndex {
    docs: BTreeMap<String, IndexedDoc>,
    /// Number of documents containing each term in any field.
    doc_freq: HashMap<String, usize>,
    avg_len: [f64; FIELD_COUNT],
}

impl SearchIndex {
    /// Build the index for `models`, reusing documents from `previous`
    /// whose content hash is unchanged.
    pub fn build(models: &BTreeMap<String, Model>, previous: Option<&SearchIndex>) -> Self {
        let mut docs = BTreeMap::new();
        for (id, model) in models {
            let reused = previous
                .and_then(|p| p.docs.get(id))
                .filter(|d| !model.content_hash.is_empty() && d.content_hash == model.content_hash);
            let doc = match reused {
                Some(d) => d.clone(),
                None => IndexedDoc::build(model),
            };
            docs.insert(id.clone(), doc);
        }

        let mut doc_freq: HashMap<String, usize> = HashMap::new();
        let mut total_len = [0u64; FIELD_COUNT];
        for doc in docs.values() {
            let mut terms: BTreeSet<&str> = BTreeSet::new();
            for (i, field) in doc.fields.iter().enumerate() {
                total_len[i] += field.len as u64;
                terms.extend(field.tf.keys().map(|k| k.as_str()));
            }
            for term in terms {
                *doc_freq.entry(term.to_string()).or_insert(0) += 1;
            }
        }

        let n = docs.len().max(1) as f64;
        let avg_len = total_len.map(|t| t as f64 / n);

        Self {
            docs,
            doc_freq,
            avg_len,
        }
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    fn idf(&self, term: &str) -> f64 {
        let n = self.docs.len() as f64;
        let df = self.doc_freq.get(term).copied().unwrap_or(0) as f64;
        (1.0 + (n - df + 0.5) / (df + 0.5)).ln()
    }

    fn score_doc(&self, doc: &IndexedDoc, terms: &[String], idf: &[f64], params: Bm25) -> f64 {
        let mut total = 0.0;
        for (i, field) in doc.fields.iter().enumerate() {
            if field.len == 0 {
                continue;
            }
            let avg = if self.avg_len[i] > 0.0 {
                self.avg_len[i]
            } else {
                1.0
            };
            let norm = params.k1 * (1.0 - params.b + params.b * field.len as f64 / avg);
            let mut field_score = 0.0;
            for (term, idf) in terms.iter().zip(idf) {
                if let Some(&tf) = field.tf.get(term) {
                    let tf = tf as f64;
                    field_score += idf * tf * (params.k1 + 1.0) / (tf + norm);
                }
            }
            total += FIELD_WEIGHTS[i] * field_score;
        }
        total
    }

    /// Raw lexical score for every document matching at least one term.
    pub fn search(&self, terms: &[String], params: Bm25) -> Vec<(String, f64)> {
        if terms.is_empty() {
            return Vec::new();
        }
        let idf: Vec<f64> = terms.iter().map(|t| self.idf(t)).collect();
        self.docs
            .iter()
            .filter(|(_, doc)| terms.iter().any(|t| doc.contains(t)))
            .map(|(id, doc)| (id.clone(), self.score_doc(doc, terms, &idf, params)))
            .filter(|(_, score)| *score > 0.0)
            .collect()
    }

    /// Raw lexical score of a single document, 0 when absent.
    pub fn score(&self, id: &str, terms: &[String], params: Bm25) -> f64 {
        let Some(doc) = self.docs.get(id) else {
            return 0.0;
        };
        let idf: Vec<f64> = terms.iter().map(|t| self.idf(t)).collect();
        self.score_doc(doc, terms, &idf, params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::test_model;

    const PARAMS: Bm25 = Bm25 { k1: 1.2, b: 0.75 };

    #[test]
    fn test_stem_common_suffixes() {
        assert_eq!(stem("orders"), "order");
        assert_eq!(stem("failing"), "fail");
        assert_eq!(stem("categories"), "category");
        assert_eq!(stem("classes"), "class");
        assert_eq!(stem("status"), "status");
        assert_eq!(stem("create"), stem("created"));
        assert_eq!(stem("bug"), "bug");
    }

    #[test]
    fn test_tokenize_splits_identifiers() {
        assert_eq!(tokenize("stg_Orders.amount"), vec!["stg", "order", "amount"]);
    }

    #[test]
    fn test_query_terms_drop_stopwords() {
        assert_eq!(query_terms("the orders of the day"), vec!["order", "day"]);
        assert_eq!(query_terms("the"), vec!["the"]);
        assert_eq!(query_terms("orders orders"), vec!["order"]);
    }

    #[test]
    fn test_sql_text_truncated() {
        let mut m = test_model("model.p.x", "x");
        m.raw_code = "a".repeat(SQL_TEXT_CHARS + 100);
        let fields = project_fields(&m);
        assert_eq!(fields[3].chars().count(), SQL_TEXT_CHARS);
    }

    #[test]
    fn test_name_field_outweighs_sql_field() {
        let mut by_name = test_model("model.p.revenue", "revenue");
        by_name.raw_code = "select id from payments".into();
        let mut by_sql = test_model("model.p.payments", "payments");
        by_sql.raw_code = "select revenue from orders".into();

        let mut models = BTreeMap::new();
        models.insert(by_name.unique_id.clone(), by_name);
        models.insert(by_sql.unique_id.clone(), by_sql);
        let index = SearchIndex::build(&models, None);

        let terms = query_terms("revenue");
        let name_score = index.score("model.p.revenue", &terms, PARAMS);
        let sql_score = index.score("model.p.payments", &terms, PARAMS);
        assert!(name_score > sql_score, "{} <= {}", name_score, sql_score);
    }

    #[test]
    fn test_search_skips_non_matching() {
        let mut models = BTreeMap::new();
        let m = test_model("model.p.orders", "orders");
        models.insert(m.unique_id.clone(), m);
        let index = SearchIndex::build(&models, None);
        assert!(index.search(&query_terms("customers"), PARAMS).is_empty());
        assert_eq!(index.search(&query_terms("order"), PARAMS).len(), 1);
    }
}
