//! # Streaming Export
//!
//! [`ReportExporter`] drives one export from a report design to a lazy stream of
//! byte chunks:
//!
//! 1. resolve the field selection (at construction),
//! 2. for CSV, emit the UTF-8 byte-order mark and check column labels,
//! 3. compile the fetch request, target the population and summarize it,
//! 4. generate the header (CSV checks the generated labels and emits its label
//!    row here),
//! 5. fetch pages of `page_size` patients and emit one chunk per non-empty page
//!    until the whole population has been requested.
//!
//! Nothing is fetched until the stream is polled and only one page is in flight
//! at a time. Dropping the stream cancels the export. A failure ends the stream
//! with an error; chunks already yielded stay valid.

use crate::design::ReportDesign;
use crate::flatten::{FlatRow, Flattener};
use crate::header::{Header, validate_labels};
use crate::metadata::RegistryMetadata;
use crate::query::FetchRequest;
use crate::selection::FieldSelection;
use crate::store::RegistryStore;
use crate::summary::{CardinalitySummary, summarize_population};
use crate::{ContentType, ExportOptions, PatientId, ReportError};
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde::Serialize;
use serde_json::Value;
use std::io::Write;
use std::sync::Arc;
use tracing::{debug, info};

/// UTF-8 byte-order mark opening every CSV export.
pub const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// What a chunk of an export holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    ByteOrderMark,
    HeaderRow,
    Page,
}

/// One chunk of an export with its bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportChunk {
    pub kind: ChunkKind,
    pub bytes: Bytes,
    /// Header width; 0 before the header exists.
    pub columns: usize,
    /// Patients encoded in this chunk.
    pub patients: usize,
    /// Cells of this chunk left empty by encoding recovery.
    pub null_filled: usize,
    /// Source values of this chunk that had no column.
    pub dropped_values: usize,
}

impl ExportChunk {
    fn preamble(kind: ChunkKind, bytes: Bytes, columns: usize) -> Self {
        Self {
            kind,
            bytes,
            columns,
            patients: 0,
            null_filled: 0,
            dropped_values: 0,
        }
    }
}

/// Totals of a drained export.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportStats {
    pub chunks: usize,
    pub pages_fetched: usize,
    pub patients_exported: usize,
    pub columns: usize,
    pub null_filled_cells: usize,
    pub dropped_values: usize,
}

/// Outcome of pre-flight validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Preflight {
    pub request: FetchRequest,
    pub population: usize,
}

/// Everything computed before the first data page.
#[derive(Debug, Clone)]
pub struct PreparedExport {
    pub header: Header,
    pub request: FetchRequest,
    pub population: Vec<PatientId>,
    pub summary: CardinalitySummary,
}

enum ExportState {
    Start,
    Prepare,
    Paging {
        prepared: Arc<PreparedExport>,
        offset: usize,
    },
    Finished,
}

/// Compiles one report design into exports.
#[derive(Clone)]
pub struct ReportExporter {
    design: Arc<ReportDesign>,
    metadata: Arc<RegistryMetadata>,
    store: Arc<dyn RegistryStore>,
    selection: Arc<FieldSelection>,
    options: ExportOptions,
}

impl ReportExporter {
    /// Resolve a design against the metadata. Fails with every unresolved key
    /// before any patient data is touched.
    pub fn new(
        design: ReportDesign,
        metadata: Arc<RegistryMetadata>,
        store: Arc<dyn RegistryStore>,
        options: ExportOptions,
    ) -> Result<Self, ReportError> {
        options.validate()?;
        let selection = FieldSelection::resolve(&design, &metadata)?;
        Ok(Self {
            design: Arc::new(design),
            metadata,
            store,
            selection: Arc::new(selection),
            options,
        })
    }

    pub fn design(&self) -> &ReportDesign {
        &self.design
    }

    pub fn selection(&self) -> &FieldSelection {
        &self.selection
    }

    pub fn options(&self) -> ExportOptions {
        self.options
    }

    pub fn compile_request(&self) -> Result<FetchRequest, ReportError> {
        FetchRequest::compile(&self.selection, &self.metadata)
    }

    /// Ids of the targeted patients.
    pub async fn population(&self) -> Result<Vec<PatientId>, ReportError> {
        self.store
            .population(self.selection.registry(), self.selection.filter())
            .await
    }

    /// Compile the fetch request and run it against at most one patient.
    pub async fn validate_query(&self) -> Result<Preflight, ReportError> {
        let request = self.compile_request()?;
        let population = self.population().await?;
        self.store.fetch(&request, &population, 0, 1).await?;
        Ok(Preflight {
            request,
            population: population.len(),
        })
    }

    /// Check that no two selected fields share a column label.
    pub fn validate_for_csv_export(&self) -> Result<(), ReportError> {
        validate_labels(&self.selection, &self.metadata)
    }

    /// All checks an export of `content_type` would fail on before its first
    /// data page.
    pub async fn preflight(&self, content_type: ContentType) -> Result<Preflight, ReportError> {
        if content_type == ContentType::Csv {
            self.validate_for_csv_export()?;
        }
        self.validate_query().await
    }

    /// Target the population, summarize it and generate the header.
    pub async fn prepare(&self) -> Result<PreparedExport, ReportError> {
        let request = self.compile_request()?;
        let population = self.population().await?;
        info!(
            "Preparing export of {} patients from registry {}",
            population.len(),
            self.selection.registry()
        );
        let summary = summarize_population(
            self.store.as_ref(),
            &self.selection,
            &population,
            self.options.summary_batch_size,
        )
        .await?;
        let header = Header::generate(&self.selection, &self.metadata, &summary)?;
        info!("Export header has {} columns", header.len());
        Ok(PreparedExport {
            header,
            request,
            population,
            summary,
        })
    }

    /// The export as a stream of byte chunks.
    pub fn export(&self, content_type: ContentType) -> BoxStream<'static, Result<Bytes, ReportError>> {
        self.export_chunks(content_type)
            .map_ok(|chunk| chunk.bytes)
            .boxed()
    }

    /// The export as a stream of chunks with per-chunk bookkeeping.
    pub fn export_chunks(
        &self,
        content_type: ContentType,
    ) -> BoxStream<'static, Result<ExportChunk, ReportError>> {
        let exporter = self.clone();
        let initial = match content_type {
            ContentType::Csv => ExportState::Start,
            ContentType::NdJson => ExportState::Prepare,
        };
        stream::try_unfold(initial, move |state| {
            let exporter = exporter.clone();
            async move { exporter.next_chunk(content_type, state).await }
        })
        .boxed()
    }

    /// Drain the export into a writer.
    pub async fn export_to_writer<W: Write>(
        &self,
        content_type: ContentType,
        writer: &mut W,
    ) -> Result<ExportStats, ReportError> {
        let mut stats = ExportStats::default();
        let mut chunks = self.export_chunks(content_type);
        while let Some(chunk) = chunks.try_next().await? {
            writer.write_all(&chunk.bytes)?;
            stats.chunks += 1;
            stats.columns = stats.columns.max(chunk.columns);
            if chunk.kind == ChunkKind::Page {
                stats.pages_fetched += 1;
                stats.patients_exported += chunk.patients;
                stats.null_filled_cells += chunk.null_filled;
                stats.dropped_values += chunk.dropped_values;
            }
        }
        writer.flush()?;
        info!(
            "Exported {} patients in {} pages ({} columns)",
            stats.patients_exported, stats.pages_fetched, stats.columns
        );
        Ok(stats)
    }

    async fn next_chunk(
        &self,
        content_type: ContentType,
        state: ExportState,
    ) -> Result<Option<(ExportChunk, ExportState)>, ReportError> {
        match state {
            ExportState::Start => Ok(Some((
                ExportChunk::preamble(ChunkKind::ByteOrderMark, Bytes::from_static(UTF8_BOM), 0),
                ExportState::Prepare,
            ))),
            ExportState::Prepare => {
                if content_type == ContentType::Csv {
                    self.validate_for_csv_export()?;
                }
                let prepared = Arc::new(self.prepare().await?);
                match content_type {
                    ContentType::Csv => {
                        prepared
                            .header
                            .validate_unique_labels(self.selection.heading_format())?;
                        let chunk = ExportChunk::preamble(
                            ChunkKind::HeaderRow,
                            encode_csv_header(&prepared.header)?,
                            prepared.header.len(),
                        );
                        Ok(Some((chunk, ExportState::Paging { prepared, offset: 0 })))
                    }
                    ContentType::NdJson => self.next_page(content_type, prepared, 0).await,
                }
            }
            ExportState::Paging { prepared, offset } => {
                self.next_page(content_type, prepared, offset).await
            }
            ExportState::Finished => Ok(None),
        }
    }

    async fn next_page(
        &self,
        content_type: ContentType,
        prepared: Arc<PreparedExport>,
        mut offset: usize,
    ) -> Result<Option<(ExportChunk, ExportState)>, ReportError> {
        let limit = self.options.page_size;
        let total = prepared.population.len();
        loop {
            if offset >= total {
                return Ok(None);
            }
            let page = self
                .store
                .fetch(&prepared.request, &prepared.population, offset, limit)
                .await?;
            let next_offset = offset + limit;
            if page.is_empty() {
                debug!("No patients left at offset {}, moving on", offset);
                offset = next_offset;
                continue;
            }
            debug!("Fetched {} patients at offset {}", page.len(), offset);

            let flattener = Flattener::new(&prepared.header);
            let rows: Vec<FlatRow> = page.iter().map(|record| flattener.flatten(record)).collect();
            if self.options.strict_encoding {
                check_lossless(&rows)?;
            }
            let bytes = match content_type {
                ContentType::Csv => encode_csv_rows(&rows)?,
                ContentType::NdJson => encode_ndjson_rows(&prepared.header, &rows)?,
            };
            let chunk = ExportChunk {
                kind: ChunkKind::Page,
                bytes,
                columns: prepared.header.len(),
                patients: rows.len(),
                null_filled: rows.iter().map(|r| r.null_filled).sum(),
                dropped_values: rows.iter().map(|r| r.dropped_values).sum(),
            };

            let next = if next_offset >= total {
                ExportState::Finished
            } else {
                ExportState::Paging {
                    prepared,
                    offset: next_offset,
                }
            };
            return Ok(Some((chunk, next)));
        }
    }
}

/// Fail on the first row that lost a value to encoding recovery.
fn check_lossless(rows: &[FlatRow]) -> Result<(), ReportError> {
    match rows
        .iter()
        .find(|row| row.null_filled > 0 || row.dropped_values > 0)
    {
        Some(row) => Err(ReportError::Encoding(format!(
            "patient {}: {} cell(s) could not be encoded and {} value(s) had no column",
            row.patient_id, row.null_filled, row.dropped_values
        ))),
        None => Ok(()),
    }
}

/// The CSV row of column labels.
pub fn encode_csv_header(header: &Header) -> Result<Bytes, ReportError> {
    let mut wtr = csv::Writer::from_writer(vec![]);
    wtr.write_record(header.labels())?;
    into_bytes(wtr)
}

/// CSV data rows; strings are written raw, other scalars as JSON.
pub fn encode_csv_rows(rows: &[FlatRow]) -> Result<Bytes, ReportError> {
    let mut wtr = csv::Writer::from_writer(vec![]);
    for row in rows {
        let record = row
            .values
            .iter()
            .map(|value| match value {
                Some(Value::String(s)) => Ok(s.clone()),
                Some(other) => serde_json::to_string(other),
                None => Ok(String::new()),
            })
            .collect::<Result<Vec<String>, _>>()?;
        wtr.write_record(&record)?;
    }
    into_bytes(wtr)
}

/// One JSON object per row, keyed by column key with explicit nulls.
pub fn encode_ndjson_rows(header: &Header, rows: &[FlatRow]) -> Result<Bytes, ReportError> {
    let mut output = Vec::new();
    for row in rows {
        serde_json::to_writer(&mut output, &row.to_json_object(header))?;
        output.push(b'\n');
    }
    Ok(Bytes::from(output))
}

fn into_bytes(wtr: csv::Writer<Vec<u8>>) -> Result<Bytes, ReportError> {
    wtr.into_inner()
        .map(Bytes::from)
        .map_err(|e| ReportError::Io(e.into_error()))
}
