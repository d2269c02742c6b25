//! Full-text search over the inventory, using Tantivy
//!
//! Four text fields are indexed: `group`, `env` and `tag` run through an
//! English analyzer (tokenize, lowercase, stop words, stem) so queries like
//! "service database" reach the tag `services-database`; `host` is a single
//! case-folded keyword token so fully-qualified hostnames only match exactly.
//! Only `tag` is stored; hits are mapped back to inventory records through
//! the tag lookup map.
//!
//! One directory per inventory content hash lives under
//! `<config-dir>/indices/jimdex_<hash>`; an existing directory for the
//! current hash is reused without re-indexing.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tantivy::collector::TopDocs;
use tantivy::query::QueryParser;
use tantivy::schema::{
    Field, IndexRecordOption, Schema, TextFieldIndexing, TextOptions, Value,
};
use tantivy::tokenizer::{
    Language, LowerCaser, RawTokenizer, RemoveLongFilter, SimpleTokenizer, Stemmer,
    StopWordFilter, TextAnalyzer,
};
use tantivy::{Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument};
use tracing::{debug, warn};

const ENGLISH_TOKENIZER: &str = "jim_en";
const KEYWORD_TOKENIZER: &str = "jim_keyword";

/// Documents per batch between index flushes.
const INDEX_BATCH_SIZE: usize = 100;

/// Heap for the index writer during a build.
const WRITER_BUFFER_BYTES: usize = 50_000_000;

/// Optional per-field predicates for `List`; `free` searches all fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    pub group: Option<String>,
    pub env: Option<String>,
    pub tag: Option<String>,
    pub host: Option<String>,
    pub free: Option<String>,
}

impl Filter {
    /// True when no predicate carries a non-blank value.
    pub fn is_empty(&self) -> bool {
        [&self.group, &self.env, &self.tag, &self.host, &self.free]
            .iter()
            .all(|field| field.as_deref().map_or(true, |v| v.trim().is_empty()))
    }
}

struct Fields {
    group: Field,
    env: Field,
    tag: Field,
    host: Field,
}

/// Read handle over one on-disk index directory.
pub struct SearchIndex {
    index: Index,
    reader: IndexReader,
    fields: Fields,
}

/// Directory name for an inventory content hash.
pub fn index_dir_name(hash: &str) -> String {
    format!("jimdex_{hash}")
}

fn english_analyzer() -> Result<TextAnalyzer> {
    let stop_words =
        StopWordFilter::new(Language::English).context("English stop word list unavailable")?;
    Ok(TextAnalyzer::builder(SimpleTokenizer::default())
        .filter(RemoveLongFilter::limit(40))
        .filter(LowerCaser)
        .filter(stop_words)
        .filter(Stemmer::new(Language::English))
        .build())
}

fn keyword_analyzer() -> TextAnalyzer {
    TextAnalyzer::builder(RawTokenizer::default())
        .filter(LowerCaser)
        .build()
}

fn register_tokenizers(index: &Index) -> Result<()> {
    index
        .tokenizers()
        .register(ENGLISH_TOKENIZER, english_analyzer()?);
    index
        .tokenizers()
        .register(KEYWORD_TOKENIZER, keyword_analyzer());
    Ok(())
}

fn build_schema() -> Schema {
    let english = TextFieldIndexing::default()
        .set_tokenizer(ENGLISH_TOKENIZER)
        .set_index_option(IndexRecordOption::WithFreqsAndPositions);
    let keyword = TextFieldIndexing::default()
        .set_tokenizer(KEYWORD_TOKENIZER)
        .set_index_option(IndexRecordOption::WithFreqsAndPositions);

    let mut builder = Schema::builder();
    builder.add_text_field(
        "group",
        TextOptions::default().set_indexing_options(english.clone()),
    );
    builder.add_text_field(
        "env",
        TextOptions::default().set_indexing_options(english.clone()),
    );
    builder.add_text_field(
        "tag",
        TextOptions::default()
            .set_indexing_options(english)
            .set_stored(),
    );
    builder.add_text_field(
        "host",
        TextOptions::default().set_indexing_options(keyword),
    );
    builder.build()
}

impl SearchIndex {
    /// Open an existing index directory.
    pub fn open(path: &Path) -> Result<Self> {
        let index = Index::open_in_dir(path)
            .with_context(|| format!("failed to open index at {}", path.display()))?;
        register_tokenizers(&index)?;
        Self::with_reader(index)
    }

    /// Create a fresh index at `path` and populate it from the inventory
    /// with batched flushes. Any half-written directory is replaced.
    pub fn build(path: &Path, inventory: &crate::inventory::Inventory) -> Result<Self> {
        if path.exists() {
            std::fs::remove_dir_all(path)
                .with_context(|| format!("failed to clear {}", path.display()))?;
        }
        std::fs::create_dir_all(path)?;

        let index = Index::create_in_dir(path, build_schema())
            .with_context(|| format!("failed to create index at {}", path.display()))?;
        register_tokenizers(&index)?;

        let fields = Self::lookup_fields(&index)?;
        let mut writer: IndexWriter = index.writer(WRITER_BUFFER_BYTES)?;
        let mut pending = 0usize;
        for element in inventory.iter() {
            let mut doc = TantivyDocument::new();
            doc.add_text(fields.group, &element.group);
            doc.add_text(fields.env, &element.env);
            doc.add_text(fields.tag, &element.tag);
            doc.add_text(fields.host, &element.server.host);
            writer.add_document(doc)?;
            pending += 1;
            if pending == INDEX_BATCH_SIZE {
                writer.commit()?;
                pending = 0;
            }
        }
        if pending > 0 {
            writer.commit()?;
        }
        debug!(docs = inventory.len(), path = %path.display(), "search index built");

        Self::with_reader(index)
    }

    /// Reuse the directory for `hash` when it opens cleanly, otherwise build
    /// it. Returns the directory name together with the handle so the caller
    /// can schedule stale-sibling cleanup.
    pub fn open_or_build(
        indices_dir: &Path,
        hash: &str,
        inventory: &crate::inventory::Inventory,
    ) -> Result<(String, Self)> {
        let name = index_dir_name(hash);
        let path = indices_dir.join(&name);

        if path.exists() {
            match Self::open(&path) {
                Ok(index) => {
                    debug!(%name, "reusing existing search index");
                    return Ok((name, index));
                }
                Err(e) => warn!(%name, error = %e, "existing index unusable, rebuilding"),
            }
        }

        let index = Self::build(&path, inventory)?;
        Ok((name, index))
    }

    fn with_reader(index: Index) -> Result<Self> {
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::OnCommitWithDelay)
            .try_into()?;
        let fields = Self::lookup_fields(&index)?;
        Ok(Self {
            index,
            reader,
            fields,
        })
    }

    fn lookup_fields(index: &Index) -> Result<Fields> {
        let schema = index.schema();
        Ok(Fields {
            group: schema.get_field("group")?,
            env: schema.get_field("env")?,
            tag: schema.get_field("tag")?,
            host: schema.get_field("host")?,
        })
    }

    /// Best-scoring tag for an analyzed phrase match on the `tag` field.
    pub fn match_tag(&self, query: &str) -> Result<Option<String>> {
        Ok(self.top_tags(query, 1)?.into_iter().next())
    }

    /// Top-n scoring tags for an analyzed phrase match on the `tag` field.
    pub fn top_tags(&self, query: &str, n: usize) -> Result<Vec<String>> {
        let phrase = sanitize(query);
        if n == 0 || phrase.trim().is_empty() {
            return Ok(Vec::new());
        }
        self.run(&format!("tag:\"{phrase}\""), &[self.fields.tag], n)
    }

    /// Conjunction of one phrase sub-query per set filter field. Returns the
    /// stored tags of up to `limit` hits.
    pub fn filtered(&self, filter: &Filter, limit: usize) -> Result<Vec<String>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut parts = Vec::new();
        for (name, value) in [
            ("group", &filter.group),
            ("env", &filter.env),
            ("tag", &filter.tag),
            ("host", &filter.host),
        ] {
            if let Some(value) = value.as_deref().filter(|v| !v.trim().is_empty()) {
                parts.push(format!("{name}:\"{}\"", sanitize(value)));
            }
        }
        if let Some(free) = filter.free.as_deref().filter(|v| !v.trim().is_empty()) {
            parts.push(format!("\"{}\"", sanitize(free)));
        }
        if parts.is_empty() {
            return Ok(Vec::new());
        }

        let default_fields = [
            self.fields.group,
            self.fields.env,
            self.fields.tag,
            self.fields.host,
        ];
        self.run(&parts.join(" "), &default_fields, limit)
    }

    fn run(&self, query_text: &str, default_fields: &[Field], limit: usize) -> Result<Vec<String>> {
        let searcher = self.reader.searcher();

        let mut parser = QueryParser::for_index(&self.index, default_fields.to_vec());
        parser.set_conjunction_by_default();
        let query = parser
            .parse_query(query_text)
            .with_context(|| format!("failed to parse query '{query_text}'"))?;

        let top_docs = searcher.search(&query, &TopDocs::with_limit(limit))?;

        let mut tags = Vec::with_capacity(top_docs.len());
        for (_score, address) in top_docs {
            let doc: TantivyDocument = searcher.doc(address)?;
            if let Some(tag) = doc.get_first(self.fields.tag).and_then(|v| v.as_str()) {
                tags.push(tag.to_string());
            }
        }
        debug!(query = query_text, hits = tags.len(), "index search");
        Ok(tags)
    }
}

/// Remove sibling directories of the active index. Half-written directories
/// are tolerated: failures are logged and skipped.
pub fn cleanup_stale(indices_dir: &Path, keep: &str) {
    let entries = match std::fs::read_dir(indices_dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %indices_dir.display(), error = %e, "cannot scan index directory");
            return;
        }
    };

    for entry in entries.flatten() {
        let path: PathBuf = entry.path();
        if !path.is_dir() || entry.file_name() == keep {
            continue;
        }
        match std::fs::remove_dir_all(&path) {
            Ok(()) => debug!(stale = %path.display(), "removed stale index"),
            Err(e) => warn!(stale = %path.display(), error = %e, "failed to remove stale index"),
        }
    }
}

// Phrase queries are built by formatting user text between quotes; strip the
// two characters that would terminate or escape the phrase.
fn sanitize(input: &str) -> String {
    input
        .chars()
        .map(|c| if c == '"' || c == '\\' { ' ' } else { c })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::{parse, Inventory};
    use tempfile::TempDir;

    fn fixture() -> Inventory {
        let raw = parse(
            br#"[
                {"group":"prod","env":"eu","tag":"api-1",
                 "server":{"host":"host.example.com","dir":"/srv","port":"22","username":"u","password":"p"}},
                {"group":"prod","env":"us","tag":"api-2",
                 "server":{"host":"h2","dir":"/srv","port":"22","username":"u","password":"p"}},
                {"group":"db","env":"eu","tag":"services-database",
                 "server":{"host":"db1.internal","dir":"/var","port":"5432","username":"u","password":"p"}}
            ]"#,
        )
        .unwrap();
        Inventory::from_raw(raw).unwrap()
    }

    fn build_fixture_index(dir: &TempDir) -> SearchIndex {
        SearchIndex::build(&dir.path().join("jimdex_test"), &fixture()).unwrap()
    }

    #[test]
    fn phrase_match_with_stemming() {
        let dir = TempDir::new().unwrap();
        let index = build_fixture_index(&dir);

        let hit = index.match_tag("service database").unwrap();
        assert_eq!(hit.as_deref(), Some("services-database"));
    }

    #[test]
    fn host_is_keyword_matched() {
        let dir = TempDir::new().unwrap();
        let index = build_fixture_index(&dir);

        let full = Filter {
            host: Some("host.example.com".into()),
            ..Filter::default()
        };
        assert_eq!(index.filtered(&full, 10).unwrap(), vec!["api-1"]);

        let partial = Filter {
            host: Some("example".into()),
            ..Filter::default()
        };
        assert!(index.filtered(&partial, 10).unwrap().is_empty());
    }

    #[test]
    fn conjunctive_filter() {
        let dir = TempDir::new().unwrap();
        let index = build_fixture_index(&dir);

        let filter = Filter {
            group: Some("prod".into()),
            env: Some("eu".into()),
            ..Filter::default()
        };
        assert_eq!(index.filtered(&filter, 10).unwrap(), vec!["api-1"]);
    }

    #[test]
    fn free_text_searches_all_fields() {
        let dir = TempDir::new().unwrap();
        let index = build_fixture_index(&dir);

        let filter = Filter {
            free: Some("prod".into()),
            ..Filter::default()
        };
        let mut tags = index.filtered(&filter, 10).unwrap();
        tags.sort();
        assert_eq!(tags, vec!["api-1", "api-2"]);
    }

    #[test]
    fn limit_caps_results() {
        let dir = TempDir::new().unwrap();
        let index = build_fixture_index(&dir);

        let filter = Filter {
            free: Some("prod".into()),
            ..Filter::default()
        };
        assert_eq!(index.filtered(&filter, 1).unwrap().len(), 1);
        assert!(index.filtered(&filter, 0).unwrap().is_empty());
    }

    #[test]
    fn reopen_matches_fresh_build() {
        let dir = TempDir::new().unwrap();
        let inventory = fixture();
        let hash = inventory.content_hash();

        let (name, built) = SearchIndex::open_or_build(dir.path(), &hash, &inventory).unwrap();
        let fresh = built.match_tag("api-1").unwrap();

        let (name2, reopened) = SearchIndex::open_or_build(dir.path(), &hash, &inventory).unwrap();
        assert_eq!(name, name2);
        assert_eq!(reopened.match_tag("api-1").unwrap(), fresh);
    }

    #[test]
    fn stale_siblings_are_removed() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("jimdex_old")).unwrap();
        std::fs::create_dir_all(dir.path().join("jimdex_keep")).unwrap();

        cleanup_stale(dir.path(), "jimdex_keep");

        assert!(!dir.path().join("jimdex_old").exists());
        assert!(dir.path().join("jimdex_keep").exists());
    }

    #[test]
    fn empty_query_matches_nothing() {
        let dir = TempDir::new().unwrap();
        let index = build_fixture_index(&dir);
        assert!(index.match_tag("").unwrap().is_none());
        assert!(index.top_tags("\"\\", 5).unwrap().is_empty());
    }
}
