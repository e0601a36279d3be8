//! Local index store for one chunk.
//!
//! [`IndexStore`] is the seam to the full-text engine. [`TantivyIndex`] keeps
//! each chunk in its own in-RAM tantivy index; archival exports the committed
//! segment files as a tar bundle that [`TantivyIndex::import`] reopens.

use crate::search::{MATCH_ALL_QUERY, SearchQuery, UnitSearchResult, sort_hits};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::io::Read;
use std::ops::Bound;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use strata_common::{ChunkId, Error, LogMessage, Result};
use tantivy::collector::DocSetCollector;
use tantivy::directory::{Directory, RamDirectory};
use tantivy::indexer::NoMergePolicy;
use tantivy::query::{BooleanQuery, Occur, Query, RangeQuery, TermQuery};
use tantivy::schema::{FAST, Field, INDEXED, IndexRecordOption, STORED, STRING, Schema, TEXT, Value};
use tantivy::{Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument, Term};
use tracing::debug;

/// Searchable store owned by exactly one chunk.
pub trait IndexStore: Send + Sync {
    /// Parse and index one payload, returning the document timestamp.
    fn add(&mut self, payload: &[u8]) -> Result<i64>;

    fn search(&self, query: &SearchQuery) -> Result<UnitSearchResult>;

    /// Make everything added so far durable in the store's own terms.
    fn commit(&mut self) -> Result<()>;

    fn close(&mut self) -> Result<()>;

    /// Serialize the committed contents for archival.
    fn export(&self) -> Result<Vec<u8>>;

    fn doc_count(&self) -> u64;
}

/// Creates a fresh index store for a new chunk.
pub trait IndexFactory: Send + Sync {
    fn create(&self, chunk_id: &ChunkId) -> Result<Box<dyn IndexStore>>;
}

/// Indexing arena per chunk writer. Tantivy's floor is 15 MB per thread.
const WRITER_HEAP_BYTES: usize = 15_000_000;

const META_FILE: &str = "meta.json";

fn engine_error(context: &str, e: impl std::fmt::Display) -> Error {
    Error::internal(format!("{context}: {e}"))
}

/// Tantivy schema fields for a log document.
#[derive(Debug, Clone, Copy)]
struct SchemaFields {
    id: Field,
    timestamp: Field,
    service_name: Field,
    message: Field,
    /// Tokenized field values, for bare-term matches.
    field_text: Field,
    /// `name=value` pairs, for exact field matches.
    attrs: Field,
    /// Normalized JSON of the whole document.
    source: Field,
}

impl SchemaFields {
    fn build_schema() -> (Schema, Self) {
        let mut builder = Schema::builder();
        let id = builder.add_text_field("id", STRING);
        let timestamp = builder.add_i64_field("timestamp", INDEXED | STORED | FAST);
        let service_name = builder.add_text_field("service_name", STRING);
        let message = builder.add_text_field("message", TEXT);
        let field_text = builder.add_text_field("field_text", TEXT);
        let attrs = builder.add_text_field("attrs", STRING);
        let source = builder.add_bytes_field("source", STORED);
        (
            builder.build(),
            Self {
                id,
                timestamp,
                service_name,
                message,
                field_text,
                attrs,
                source,
            },
        )
    }
}

/// Tokens are lowercase alphanumeric runs, as tantivy's default tokenizer
/// produces them.
fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
}

fn term_query(term: Term) -> Box<dyn Query> {
    Box::new(TermQuery::new(term, IndexRecordOption::Basic))
}

enum QueryTerm {
    Token(String),
    Field { field: String, value: String },
}

fn parse_terms(query_text: &str) -> Vec<QueryTerm> {
    query_text
        .split_whitespace()
        .filter(|t| *t != MATCH_ALL_QUERY)
        .flat_map(|raw| match raw.split_once(':') {
            Some((field, value)) if !field.is_empty() && !value.is_empty() => {
                vec![QueryTerm::Field {
                    field: field.to_string(),
                    value: value.to_string(),
                }]
            }
            _ => tokenize(raw).map(QueryTerm::Token).collect(),
        })
        .collect()
}

/// Chunk index backed by an in-RAM tantivy index.
///
/// Searches see every document added so far: a search first commits any
/// pending documents and reloads the reader.
pub struct TantivyIndex {
    index: Index,
    fields: SchemaFields,
    writer: Mutex<Option<IndexWriter>>,
    reader: IndexReader,
    uncommitted: AtomicU64,
    doc_count: u64,
    closed: bool,
}

impl TantivyIndex {
    pub fn new() -> Result<Self> {
        let (schema, fields) = SchemaFields::build_schema();
        Self::from_index(Index::create_in_ram(schema), fields)
    }

    /// Reopen an index from [`IndexStore::export`] output.
    pub fn import(bytes: &[u8]) -> Result<Self> {
        let directory = RamDirectory::create();
        let mut archive = tar::Archive::new(bytes);
        for entry in archive.entries()? {
            let mut entry = entry?;
            let path = entry.path()?.into_owned();
            let mut data = Vec::new();
            entry.read_to_end(&mut data)?;
            directory.atomic_write(&path, &data)?;
        }
        let index = Index::open(directory).map_err(|e| engine_error("failed to open index", e))?;
        let (_, fields) = SchemaFields::build_schema();
        Self::from_index(index, fields)
    }

    fn from_index(index: Index, fields: SchemaFields) -> Result<Self> {
        let writer: IndexWriter = index
            .writer_with_num_threads(1, WRITER_HEAP_BYTES)
            .map_err(|e| engine_error("failed to create index writer", e))?;
        // Segment files are exported as they stand after commit.
        writer.set_merge_policy(Box::new(NoMergePolicy));
        let reader: IndexReader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()
            .map_err(|e| engine_error("failed to create index reader", e))?;
        let doc_count = reader.searcher().num_docs();
        Ok(Self {
            index,
            fields,
            writer: Mutex::new(Some(writer)),
            reader,
            uncommitted: AtomicU64::new(0),
            doc_count,
            closed: false,
        })
    }

    fn document(&self, doc: &LogMessage) -> Result<TantivyDocument> {
        let mut document = TantivyDocument::new();
        document.add_text(self.fields.id, &doc.id);
        document.add_i64(self.fields.timestamp, doc.timestamp_ms);
        if let Some(service) = &doc.service_name {
            document.add_text(self.fields.service_name, service);
        }
        document.add_text(self.fields.message, &doc.message);
        for (name, value) in &doc.fields {
            document.add_text(self.fields.field_text, value);
            document.add_text(self.fields.attrs, format!("{name}={value}"));
        }
        let source = serde_json::to_vec(doc)?;
        document.add_bytes(self.fields.source, source.as_slice());
        Ok(document)
    }

    fn exact_term(&self, field: &str, value: &str) -> Term {
        match field {
            "service_name" => Term::from_field_text(self.fields.service_name, value),
            "id" => Term::from_field_text(self.fields.id, value),
            _ => Term::from_field_text(self.fields.attrs, &format!("{field}={value}")),
        }
    }

    fn build_query(&self, query: &SearchQuery) -> BooleanQuery {
        let range: Box<dyn Query> = Box::new(RangeQuery::new(
            Bound::Included(Term::from_field_i64(self.fields.timestamp, query.start_time_ms)),
            Bound::Included(Term::from_field_i64(self.fields.timestamp, query.end_time_ms)),
        ));
        let mut clauses = vec![(Occur::Must, range)];
        for term in parse_terms(&query.query_text) {
            let clause: Box<dyn Query> = match term {
                QueryTerm::Token(token) => Box::new(BooleanQuery::new(vec![
                    (
                        Occur::Should,
                        term_query(Term::from_field_text(self.fields.message, &token)),
                    ),
                    (
                        Occur::Should,
                        term_query(Term::from_field_text(self.fields.field_text, &token)),
                    ),
                ])),
                QueryTerm::Field { field, value } => term_query(self.exact_term(&field, &value)),
            };
            clauses.push((Occur::Must, clause));
        }
        for filter in &query.filters {
            clauses.push((
                Occur::Must,
                term_query(self.exact_term(&filter.field, &filter.value)),
            ));
        }
        BooleanQuery::new(clauses)
    }

    /// Commit pending documents so the reader sees them.
    fn refresh(&self) -> Result<()> {
        if self.uncommitted.load(Ordering::Acquire) == 0 {
            return Ok(());
        }
        let mut writer = self.writer.lock();
        if self.uncommitted.swap(0, Ordering::AcqRel) == 0 {
            return Ok(());
        }
        if let Some(writer) = writer.as_mut() {
            writer
                .commit()
                .map_err(|e| engine_error("index commit failed", e))?;
        }
        self.reader
            .reload()
            .map_err(|e| engine_error("index reload failed", e))
    }

    /// Files backing the last commit, relative to the index directory.
    fn committed_files(&self) -> Result<BTreeSet<PathBuf>> {
        let directory = self.index.directory();
        let mut files = BTreeSet::from([PathBuf::from(META_FILE)]);
        let metas = self
            .index
            .searchable_segment_metas()
            .map_err(|e| engine_error("failed to list segments", e))?;
        for path in metas.iter().flat_map(tantivy::SegmentMeta::list_files) {
            if directory
                .exists(&path)
                .map_err(|e| engine_error("failed to stat segment file", e))?
            {
                files.insert(path);
            }
        }
        Ok(files)
    }
}

impl IndexStore for TantivyIndex {
    fn add(&mut self, payload: &[u8]) -> Result<i64> {
        if self.closed {
            return Err(Error::write("index is closed"));
        }
        let doc: LogMessage = serde_json::from_slice(payload)
            .map_err(|e| Error::write(format!("malformed log message: {e}")))?;
        let document = self.document(&doc)?;
        let writer = self
            .writer
            .get_mut()
            .as_mut()
            .ok_or_else(|| Error::write("index is closed"))?;
        writer
            .add_document(document)
            .map_err(|e| Error::write(e.to_string()))?;
        self.uncommitted.fetch_add(1, Ordering::AcqRel);
        self.doc_count += 1;
        Ok(doc.timestamp_ms)
    }

    fn search(&self, query: &SearchQuery) -> Result<UnitSearchResult> {
        if self.closed {
            return Err(Error::internal("index is closed"));
        }
        self.refresh()?;

        let searcher = self.reader.searcher();
        let matched = searcher
            .search(&self.build_query(query), &DocSetCollector)
            .map_err(|e| engine_error("search failed", e))?;

        let mut result = UnitSearchResult::default();
        for address in matched {
            let stored: TantivyDocument = searcher
                .doc(address)
                .map_err(|e| engine_error("failed to load document", e))?;
            let source = stored
                .get_first(self.fields.source)
                .and_then(|v| v.as_bytes())
                .ok_or_else(|| Error::internal("document has no stored source"))?;
            let doc: LogMessage = serde_json::from_slice(source)?;
            result.total_hits += 1;
            if let Some(key) = query.bucket_key(doc.timestamp_ms) {
                *result.buckets.entry(key).or_default() += 1;
            }
            result.hits.push(doc);
        }
        sort_hits(&mut result.hits);
        result.hits.truncate(query.limit);
        Ok(result)
    }

    fn commit(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.get_mut().as_mut() {
            writer
                .commit()
                .map_err(|e| engine_error("index commit failed", e))?;
        }
        self.uncommitted.store(0, Ordering::Release);
        self.reader
            .reload()
            .map_err(|e| engine_error("index reload failed", e))
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        if let Some(writer) = self.writer.get_mut().take() {
            writer
                .wait_merging_threads()
                .map_err(|e| engine_error("failed to stop index writer", e))?;
        }
        Ok(())
    }

    fn export(&self) -> Result<Vec<u8>> {
        let directory = self.index.directory();
        let mut bundle = tar::Builder::new(Vec::new());
        for path in self.committed_files()? {
            let data = directory
                .atomic_read(&path)
                .map_err(|e| engine_error("failed to read segment file", e))?;
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            bundle.append_data(&mut header, &path, data.as_slice())?;
        }
        Ok(bundle.into_inner()?)
    }

    fn doc_count(&self) -> u64 {
        self.doc_count
    }
}

/// Factory for [`TantivyIndex`] stores.
#[derive(Debug, Default, Clone, Copy)]
pub struct TantivyIndexFactory;

impl IndexFactory for TantivyIndexFactory {
    fn create(&self, chunk_id: &ChunkId) -> Result<Box<dyn IndexStore>> {
        debug!("Creating index for chunk {}", chunk_id);
        Ok(Box::new(TantivyIndex::new()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(id: &str, ts: i64, service: &str, message: &str) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "id": id,
            "timestamp": ts,
            "service_name": service,
            "message": message,
            "fields": {"level": "error"}
        }))
        .unwrap()
    }

    #[test]
    fn test_add_rejects_malformed_payload() {
        let mut index = TantivyIndex::new().unwrap();
        assert!(matches!(index.add(b"not json"), Err(Error::Write(_))));
        assert_eq!(index.doc_count(), 0);
    }

    #[test]
    fn test_term_and_field_search() {
        let mut index = TantivyIndex::new().unwrap();
        index.add(&payload("1", 100, "api", "Connection refused by upstream")).unwrap();
        index.add(&payload("2", 200, "web", "connection reset")).unwrap();
        index.add(&payload("3", 300, "api", "request ok")).unwrap();

        let q = SearchQuery::new("ds", "connection", 0, 1000, 10);
        let result = index.search(&q).unwrap();
        assert_eq!(result.total_hits, 2);
        assert_eq!(result.hits[0].id, "2");

        let q = SearchQuery::new("ds", "connection service_name:api", 0, 1000, 10);
        let result = index.search(&q).unwrap();
        assert_eq!(result.total_hits, 1);
        assert_eq!(result.hits[0].id, "1");

        let q = SearchQuery::new("ds", "*", 150, 1000, 10).with_filter("level", "error");
        assert_eq!(index.search(&q).unwrap().total_hits, 2);

        let q = SearchQuery::new("ds", "ERROR", 0, 1000, 10);
        assert_eq!(index.search(&q).unwrap().total_hits, 3);
    }

    #[test]
    fn test_search_sees_uncommitted_documents() {
        let mut index = TantivyIndex::new().unwrap();
        index.add(&payload("1", 1, "api", "first")).unwrap();
        let q = SearchQuery::new("ds", "*", 0, 10, 10);
        assert_eq!(index.search(&q).unwrap().total_hits, 1);

        index.add(&payload("2", 2, "api", "second")).unwrap();
        assert_eq!(index.search(&q).unwrap().total_hits, 2);
    }

    #[test]
    fn test_histogram_and_limit() {
        let mut index = TantivyIndex::new().unwrap();
        for i in 0..5 {
            index
                .add(&payload(&i.to_string(), i * 10, "api", "tick"))
                .unwrap();
        }
        let q = SearchQuery::new("ds", "", 0, 100, 2).with_histogram(20);
        let result = index.search(&q).unwrap();
        assert_eq!(result.hits.len(), 2);
        assert_eq!(result.hits[0].id, "4");
        assert_eq!(result.total_hits, 5);
        assert_eq!(result.buckets.get(&0), Some(&2));
        assert_eq!(result.buckets.get(&20), Some(&2));
        assert_eq!(result.buckets.get(&40), Some(&1));
    }

    #[test]
    fn test_export_reopens_committed_segments() {
        let mut index = TantivyIndex::new().unwrap();
        index.add(&payload("1", 1, "api", "one")).unwrap();
        index.commit().unwrap();
        index.add(&payload("2", 2, "api", "two")).unwrap();

        let restored = TantivyIndex::import(&index.export().unwrap()).unwrap();
        assert_eq!(restored.doc_count(), 1);
        let q = SearchQuery::new("ds", "one", 0, 10, 10);
        let result = restored.search(&q).unwrap();
        assert_eq!(result.total_hits, 1);
        assert_eq!(result.hits[0].service_name.as_deref(), Some("api"));
    }

    #[test]
    fn test_closed_index_rejects_use() {
        let mut index = TantivyIndex::new().unwrap();
        index.add(&payload("1", 1, "api", "one")).unwrap();
        index.close().unwrap();
        assert!(index.add(&payload("2", 2, "api", "two")).is_err());
        assert!(index.search(&SearchQuery::new("ds", "*", 0, 10, 10)).is_err());
    }
}
