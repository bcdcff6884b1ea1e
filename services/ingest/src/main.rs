//! Ingest Service - Loads regional environmental CSV exports into the CAN database
//!
//! Responsibilities:
//! - Read the declarative source registry (config/sources.json)
//! - Decode heterogeneous CSV exports (UTF-8 or Windows-1252, comma or semicolon)
//! - Normalize Italian-formatted numeric values into floats or an explicit absent
//! - Resolve free-text region labels to the 20 canonical Italian regions
//! - Upsert per-topic records keyed by canonical region identity
//! - Track ingestion runs for auditing
//!
//! CRITICAL: This service must be DETERMINISTIC and IDEMPOTENT
//! Same source files + same registry = same batch, and re-running over
//! identical sources must leave the database in the same state: existing
//! records are updated in place, never duplicated, and a field that the
//! current sources have no value for never erases previously loaded data.
//!
//! Usage:
//!   # Full run:
//!   cargo run --bin ingest -- --config config/sources.json
//!
//!   # Single source:
//!   cargo run --bin ingest -- --config config/sources.json --source-id mix
//!
//!   # Parse and report without touching the database:
//!   cargo run --bin ingest -- --dry-run

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use std::collections::BTreeMap;
use std::path::Path;
use tokio::fs;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "ingest", about = "Loads regional environmental CSV exports into the CAN database")]
struct Args {
    /// Path to sources config file
    #[arg(long, default_value = "config/sources.json")]
    config: String,

    /// Only ingest the source with this id
    #[arg(long)]
    source_id: Option<String>,

    /// Dry run - parse and report, don't write to the database
    #[arg(long, default_value = "false")]
    dry_run: bool,
}

// =============================================================================
// Source Registry
// =============================================================================

#[derive(Debug, Deserialize)]
struct SourcesConfig {
    version: String,
    #[serde(default = "default_data_dir")]
    data_dir: String,
    sources: Vec<SourceEntry>,
}

#[derive(Debug, Deserialize)]
struct SourceEntry {
    id: String,
    name: String,
    file: String,
    #[serde(default = "default_true")]
    enabled: bool,
}

fn default_true() -> bool {
    true
}

fn default_data_dir() -> String {
    "data".to_string()
}

/// Source ids the loaders know how to handle. An id in the registry that is
/// not listed here is reported and skipped, never guessed at.
const SRC_REGIONI: &str = "regioni";
const SRC_MORFOLOGIA: &str = "morfologia";
const SRC_EMISSIONI: &str = "emissioni";
const SRC_EDIFICI_CONSUMI: &str = "edifici-consumi";
const SRC_EDIFICI_EMISSIONI: &str = "edifici-emissioni";
const SRC_EDIFICI_ELETTRICO: &str = "edifici-elettrico";
const SRC_EDIFICI_APE: &str = "edifici-ape";
const SRC_INDUSTRIA: &str = "industria";
const SRC_MIX: &str = "mix";
const SRC_ASSORBIMENTI: &str = "assorbimenti";
const SRC_AZIONI: &str = "azioni";

const KNOWN_SOURCES: [&str; 11] = [
    SRC_REGIONI,
    SRC_MORFOLOGIA,
    SRC_EMISSIONI,
    SRC_EDIFICI_CONSUMI,
    SRC_EDIFICI_EMISSIONI,
    SRC_EDIFICI_ELETTRICO,
    SRC_EDIFICI_APE,
    SRC_INDUSTRIA,
    SRC_MIX,
    SRC_ASSORBIMENTI,
    SRC_AZIONI,
];

/// Load the source registry from a JSON file
async fn load_sources_config(path: &str) -> Result<SourcesConfig> {
    let content = fs::read_to_string(path)
        .await
        .context("Failed to read sources config")?;
    let config: SourcesConfig =
        serde_json::from_str(&content).context("Failed to parse sources config")?;
    Ok(config)
}

/// Print summary of registered sources
fn print_sources_summary(config: &SourcesConfig) {
    println!("\nRegistered sources:");
    println!("{:-<60}", "");
    for source in &config.sources {
        let status = if source.enabled { "✓" } else { "✗" };
        println!("  {} {} - {} [{}]", status, source.id, source.name, source.file);
    }
    println!("{:-<60}", "");
}

// =============================================================================
// Canonical Region Identity
// =============================================================================

const TRENTINO_ALTO_ADIGE: &str = "Trentino-Alto Adige";
const VALLE_D_AOSTA: &str = "Valle d'Aosta";

/// The 20 Italian administrative regions. This set is closed: every topic
/// record in the database is keyed by exactly one of these names.
const CANONICAL_REGIONS: [&str; 20] = [
    "Abruzzo",
    "Basilicata",
    "Calabria",
    "Campania",
    "Emilia-Romagna",
    "Friuli-Venezia Giulia",
    "Lazio",
    "Liguria",
    "Lombardia",
    "Marche",
    "Molise",
    "Piemonte",
    "Puglia",
    "Sardegna",
    "Sicilia",
    "Toscana",
    TRENTINO_ALTO_ADIGE,
    "Umbria",
    VALLE_D_AOSTA,
    "Veneto",
];

/// Known spelling variants, already in normalized form (lowercase, single
/// spaces, ASCII apostrophe). Bilingual and provincial labels collapse to
/// their parent region.
const REGION_VARIANTS: &[(&str, &str)] = &[
    ("trentino-alto adige/südtirol", TRENTINO_ALTO_ADIGE),
    ("trentino alto adige", TRENTINO_ALTO_ADIGE),
    ("trentino alto adige/südtirol", TRENTINO_ALTO_ADIGE),
    ("alto adige", TRENTINO_ALTO_ADIGE),
    ("südtirol", TRENTINO_ALTO_ADIGE),
    ("provincia di trento", TRENTINO_ALTO_ADIGE),
    ("provincia di bolzano", TRENTINO_ALTO_ADIGE),
    ("provincia autonoma di trento", TRENTINO_ALTO_ADIGE),
    ("provincia autonoma di bolzano", TRENTINO_ALTO_ADIGE),
    ("provincia autonoma di bolzano/bozen", TRENTINO_ALTO_ADIGE),
    ("valle d'aosta/vallée d'aoste", VALLE_D_AOSTA),
    ("vallée d'aoste", VALLE_D_AOSTA),
    ("val d'aosta", VALLE_D_AOSTA),
    ("emilia romagna", "Emilia-Romagna"),
    ("friuli venezia giulia", "Friuli-Venezia Giulia"),
];

/// Normalize a free-text region label for dictionary lookup: lowercase,
/// internal whitespace runs collapsed to single spaces, typographic
/// apostrophe replaced by the ASCII one.
fn normalize_region_label(raw: &str) -> String {
    let lowered = raw.to_lowercase().replace('\u{2019}', "'");
    lowered.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Map a region label as it appears in any source to its canonical name,
/// or None if no known spelling matches. Callers skip unresolved rows.
fn resolve_region(raw: &str) -> Option<&'static str> {
    let key = normalize_region_label(raw);
    for name in CANONICAL_REGIONS {
        if key == name.to_lowercase() {
            return Some(name);
        }
    }
    REGION_VARIANTS
        .iter()
        .find(|(variant, _)| *variant == key)
        .map(|(_, canonical)| *canonical)
}

// =============================================================================
// Numeric Normalization
// =============================================================================

/// Markers that mean "no value" in the exports, compared case-insensitively.
const NO_VALUE_MARKERS: [&str; 7] = ["n/a", "na", "n.d.", "nd", "-", "--", "—"];

/// Convert a locale-formatted numeric string into a float, or None when the
/// source has no usable value. Never fails on malformed input.
///
/// Handles the conventions seen across the exports:
/// - leading '~' marks an approximate value and carries no numeric meaning
/// - trailing '%' is dropped, percentages are stored as bare numbers
/// - '.' is the thousands separator, ',' the decimal one ("10.000,50")
fn normalize_number(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if NO_VALUE_MARKERS.contains(&trimmed.to_lowercase().as_str()) {
        return None;
    }
    let stripped = trimmed.strip_prefix('~').unwrap_or(trimmed).trim_start();
    let stripped = stripped.strip_suffix('%').unwrap_or(stripped).trim_end();
    let cleaned = stripped.replace('.', "").replace(',', ".");
    cleaned.parse::<f64>().ok()
}

/// Free-text counterpart: trims and collapses empty/no-value cells to None
/// instead of storing empty strings.
fn normalize_text(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if NO_VALUE_MARKERS.contains(&trimmed.to_lowercase().as_str()) {
        return None;
    }
    Some(trimmed.to_string())
}

// =============================================================================
// CSV Tables
// =============================================================================

/// Decode raw source bytes. The exports are a mix of UTF-8 (some with a BOM)
/// and Windows-1252 from older spreadsheet tooling.
fn decode_source_bytes(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.strip_prefix('\u{feff}').unwrap_or(text).to_string(),
        Err(_) => {
            let (decoded, _, _) = encoding_rs::WINDOWS_1252.decode(bytes);
            decoded.into_owned()
        }
    }
}

/// Sniff the delimiter from the header line. Italian exports use ';' about
/// as often as ','.
fn detect_delimiter(content: &str) -> u8 {
    let header = content.lines().next().unwrap_or("");
    let semicolons = header.matches(';').count();
    let commas = header.matches(',').count();
    if semicolons > commas {
        b';'
    } else {
        b','
    }
}

/// One decoded tabular source: a header row plus data rows.
#[derive(Debug)]
struct Table {
    source_id: String,
    headers: Vec<String>,
    rows: Vec<csv::StringRecord>,
}

impl Table {
    /// Exact-name column lookup. Renamed columns do not match.
    fn column(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }
}

/// Parse decoded CSV content into a Table
/// This function is DETERMINISTIC: same content = same table
fn parse_table(source_id: &str, content: &str) -> Result<Table> {
    let delimiter = detect_delimiter(content);
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(content.as_bytes());

    let headers: Vec<String> = reader
        .headers()
        .with_context(|| format!("{}: failed to read CSV header", source_id))?
        .iter()
        .map(|h| h.to_string())
        .collect();

    let mut rows = Vec::new();
    for (line_idx, result) in reader.records().enumerate() {
        match result {
            Ok(record) => rows.push(record),
            Err(e) => {
                // +2 for 1-indexed + header
                eprintln!("  ⚠ {}: skipping line {}: {}", source_id, line_idx + 2, e);
            }
        }
    }

    Ok(Table {
        source_id: source_id.to_string(),
        headers,
        rows,
    })
}

/// Read and decode one registered source file. A missing file is not an
/// error: the topic simply contributes nothing this run.
async fn read_table(source: &SourceEntry, data_dir: &Path) -> Result<Option<Table>> {
    let path = data_dir.join(&source.file);
    let bytes = match fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            eprintln!("  ⚠ {}: file not found, skipping: {}", source.id, path.display());
            return Ok(None);
        }
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read {}", path.display()));
        }
    };
    println!("  Read {}: {} bytes", path.display(), bytes.len());
    let content = decode_source_bytes(&bytes);
    let table = parse_table(&source.id, &content)?;
    println!("  {}: {} columns, {} rows", source.id, table.headers.len(), table.rows.len());
    Ok(Some(table))
}

// =============================================================================
// Column Bindings
// =============================================================================
// Each loader binds to its source's Italian headers by exact name. The
// bindings live here, as declarative constants, so the mapping stays
// auditable apart from the parsing logic.

const COL_REGIONE: &str = "Regione";

const COL_SUPERFICIE: &str = "Superficie Kmq";
const COL_DENSITA: &str = "Densità demografica (ab/kmq)";
const COL_PIL: &str = "PIL per abitante (migliaia di €)";

const COL_PIANURA: &str = "Pianura";
const COL_COLLINA: &str = "Collina";
const COL_MONTAGNA: &str = "Montagna";
const COL_URBANO: &str = "Urbano";
const COL_AGRICOLO: &str = "Agricolo";
const COL_FORESTALE: &str = "Forestale";

const COL_CO2EQ: &str = "Emissioni totali CO2eq (mln t)";

const COL_CONSUMO_MEDIO: &str = "Consumo medio (kWh/m2 anno)";
const COL_EMISSIONI_PROCAPITE: &str = "Emissioni pro capite (tCO2/ab)";
const COL_QUOTA_ELETTRICO: &str = "Quota elettrico";
const COL_QUOTA_APE: &str = "Quota APE classe A";

const COL_EMISSIONI_VA: &str = "Emissioni per valore aggiunto (tCO2/mln €)";

const COL_CARBONE: &str = "Carbone";
const COL_PETROLIO: &str = "Petrolio";
const COL_GAS: &str = "Gas";
const COL_RINNOVABILI: &str = "Rinnovabili";

const COL_PUNTI_FORZA: &str = "Punti di forza";
const COL_AREE_MIGLIORAMENTO: &str = "Aree di miglioramento";

const COL_FOTOVOLTAICO: &str = "Fotovoltaico capacità (GW)";
const COL_QUOTA_FER: &str = "Quota produzione FER";
const COL_AUTO_ELETTRICHE: &str = "Quota auto elettriche";
const COL_RISPARMI: &str = "Risparmi energetici (Mtep)";

// =============================================================================
// Topic Records
// =============================================================================
// One record type per satellite table. Every field is optional: None means
// the sources in this run had no usable value, and an upsert never turns an
// existing value into NULL because of it.

#[derive(Debug, Default, Clone, PartialEq)]
struct RegioneAttrs {
    superficie_kmq: Option<f64>,
    densita_demografica: Option<f64>,
    pil: Option<f64>,
}

#[derive(Debug, Default, Clone, PartialEq)]
struct Morfologia {
    pianura_pct: Option<f64>,
    collina_pct: Option<f64>,
    montagna_pct: Option<f64>,
    urbano_pct: Option<f64>,
    agricolo_pct: Option<f64>,
    forestale_pct: Option<f64>,
}

#[derive(Debug, Default, Clone, PartialEq)]
struct Emissioni {
    co2eq_mln_t: Option<f64>,
}

#[derive(Debug, Default, Clone, PartialEq)]
struct Edifici {
    consumo_medio_kwh_m2y: Option<f64>,
    emissioni_procapite_tco2_ab: Option<f64>,
    quota_elettrico_pct: Option<f64>,
    quota_ape_classe_a_pct: Option<f64>,
}

#[derive(Debug, Default, Clone, PartialEq)]
struct Industria {
    emissioni_per_valore_aggiunto_tco2_per_mln_eur: Option<f64>,
    quota_elettrico_pct: Option<f64>,
}

#[derive(Debug, Default, Clone, PartialEq)]
struct MixEnergetico {
    carbone_pct: Option<f64>,
    petrolio_pct: Option<f64>,
    gas_pct: Option<f64>,
    rinnovabili_pct: Option<f64>,
}

#[derive(Debug, Default, Clone, PartialEq)]
struct Assorbimenti {
    punti_forza: Option<String>,
    aree_miglioramento: Option<String>,
}

#[derive(Debug, Default, Clone, PartialEq)]
struct Azioni {
    fotovoltaico_capacita_gw: Option<f64>,
    quota_produzione_fer_pct: Option<f64>,
    quota_auto_elettriche_pct: Option<f64>,
    risparmi_energetici_mtep_mln: Option<f64>,
}

/// Everything one ingestion run wants to write, keyed by canonical region
/// name. BTreeMap for deterministic ordering.
#[derive(Debug, Default, PartialEq)]
struct Batch {
    regioni: BTreeMap<&'static str, RegioneAttrs>,
    morfologia: BTreeMap<&'static str, Morfologia>,
    emissioni: BTreeMap<&'static str, Emissioni>,
    edifici: BTreeMap<&'static str, Edifici>,
    industria: BTreeMap<&'static str, Industria>,
    mix: BTreeMap<&'static str, MixEnergetico>,
    assorbimenti: BTreeMap<&'static str, Assorbimenti>,
    azioni: BTreeMap<&'static str, Azioni>,
}

impl Batch {
    fn record_count(&self) -> usize {
        self.regioni.len()
            + self.morfologia.len()
            + self.emissioni.len()
            + self.edifici.len()
            + self.industria.len()
            + self.mix.len()
            + self.assorbimenti.len()
            + self.azioni.len()
    }
}

/// Data-quality findings collected while building the batch.
#[derive(Debug, Default)]
struct IngestReport {
    /// Raw region labels that resolved to nothing, with row counts.
    unresolved: BTreeMap<String, u32>,
    /// Sources dropped because a declared column was missing or renamed.
    skipped_sources: Vec<String>,
    mix_warnings: Vec<String>,
}

impl IngestReport {
    fn note_unresolved(&mut self, raw: &str) {
        let label = if raw.trim().is_empty() {
            "(empty)".to_string()
        } else {
            raw.trim().to_string()
        };
        *self.unresolved.entry(label).or_insert(0) += 1;
    }

    fn unresolved_rows(&self) -> u32 {
        self.unresolved.values().sum()
    }
}

/// Assign only when the incoming value is present. An absent value never
/// clobbers one a previous source already set.
fn merge_field<T>(slot: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *slot = value;
    }
}

// =============================================================================
// Loaders
// =============================================================================
// Each loader is pure: decoded tables in, canonical records out. Rows whose
// region label does not resolve are skipped and counted in the report.

/// Resolve the declared columns against the table header, exact match only.
/// A source that does not carry the expected columns is ignored whole.
fn bind_columns(table: &Table, names: &[&str], report: &mut IngestReport) -> Option<Vec<usize>> {
    let mut indices = Vec::with_capacity(names.len());
    for name in names {
        match table.column(name) {
            Some(idx) => indices.push(idx),
            None => {
                eprintln!(
                    "  ⚠ {}: expected column '{}' not found, source ignored",
                    table.source_id, name
                );
                report.skipped_sources.push(table.source_id.clone());
                return None;
            }
        }
    }
    Some(indices)
}

fn load_regioni(table: &Table, batch: &mut Batch, report: &mut IngestReport) {
    let cols = match bind_columns(table, &[COL_REGIONE, COL_SUPERFICIE, COL_DENSITA, COL_PIL], report) {
        Some(cols) => cols,
        None => return,
    };
    for row in &table.rows {
        let raw_region = row.get(cols[0]).unwrap_or("");
        let nome = match resolve_region(raw_region) {
            Some(nome) => nome,
            None => {
                report.note_unresolved(raw_region);
                continue;
            }
        };
        let superficie = normalize_number(row.get(cols[1]).unwrap_or(""));
        let densita = normalize_number(row.get(cols[2]).unwrap_or(""));
        let pil = normalize_number(row.get(cols[3]).unwrap_or(""));
        if superficie.is_none() && densita.is_none() && pil.is_none() {
            continue;
        }
        let rec = batch.regioni.entry(nome).or_default();
        merge_field(&mut rec.superficie_kmq, superficie);
        merge_field(&mut rec.densita_demografica, densita);
        merge_field(&mut rec.pil, pil);
    }
}

fn load_morfologia(table: &Table, batch: &mut Batch, report: &mut IngestReport) {
    let names = [
        COL_REGIONE,
        COL_PIANURA,
        COL_COLLINA,
        COL_MONTAGNA,
        COL_URBANO,
        COL_AGRICOLO,
        COL_FORESTALE,
    ];
    let cols = match bind_columns(table, &names, report) {
        Some(cols) => cols,
        None => return,
    };
    for row in &table.rows {
        let raw_region = row.get(cols[0]).unwrap_or("");
        let nome = match resolve_region(raw_region) {
            Some(nome) => nome,
            None => {
                report.note_unresolved(raw_region);
                continue;
            }
        };
        let values: Vec<Option<f64>> = cols[1..]
            .iter()
            .map(|&idx| normalize_number(row.get(idx).unwrap_or("")))
            .collect();
        if values.iter().all(|v| v.is_none()) {
            continue;
        }
        let rec = batch.morfologia.entry(nome).or_default();
        merge_field(&mut rec.pianura_pct, values[0]);
        merge_field(&mut rec.collina_pct, values[1]);
        merge_field(&mut rec.montagna_pct, values[2]);
        merge_field(&mut rec.urbano_pct, values[3]);
        merge_field(&mut rec.agricolo_pct, values[4]);
        merge_field(&mut rec.forestale_pct, values[5]);
    }
}

fn load_emissioni(table: &Table, batch: &mut Batch, report: &mut IngestReport) {
    let cols = match bind_columns(table, &[COL_REGIONE, COL_CO2EQ], report) {
        Some(cols) => cols,
        None => return,
    };
    for row in &table.rows {
        let raw_region = row.get(cols[0]).unwrap_or("");
        let nome = match resolve_region(raw_region) {
            Some(nome) => nome,
            None => {
                report.note_unresolved(raw_region);
                continue;
            }
        };
        if let Some(value) = normalize_number(row.get(cols[1]).unwrap_or("")) {
            batch.emissioni.entry(nome).or_default().co2eq_mln_t = Some(value);
        }
    }
}

/// The Edifici topic draws from four independently exported tables, one
/// value column each. They merge by canonical region: a region present in
/// only some of the sources keeps the other fields unset.
fn load_edifici_source(
    table: &Table,
    column: &str,
    set: fn(&mut Edifici, f64),
    batch: &mut Batch,
    report: &mut IngestReport,
) {
    let cols = match bind_columns(table, &[COL_REGIONE, column], report) {
        Some(cols) => cols,
        None => return,
    };
    for row in &table.rows {
        let raw_region = row.get(cols[0]).unwrap_or("");
        let nome = match resolve_region(raw_region) {
            Some(nome) => nome,
            None => {
                report.note_unresolved(raw_region);
                continue;
            }
        };
        if let Some(value) = normalize_number(row.get(cols[1]).unwrap_or("")) {
            set(batch.edifici.entry(nome).or_default(), value);
        }
    }
}

fn load_industria(table: &Table, batch: &mut Batch, report: &mut IngestReport) {
    let cols = match bind_columns(table, &[COL_REGIONE, COL_EMISSIONI_VA, COL_QUOTA_ELETTRICO], report) {
        Some(cols) => cols,
        None => return,
    };
    for row in &table.rows {
        let raw_region = row.get(cols[0]).unwrap_or("");
        let nome = match resolve_region(raw_region) {
            Some(nome) => nome,
            None => {
                report.note_unresolved(raw_region);
                continue;
            }
        };
        let emissioni_va = normalize_number(row.get(cols[1]).unwrap_or(""));
        let quota_elettrico = normalize_number(row.get(cols[2]).unwrap_or(""));
        if emissioni_va.is_none() && quota_elettrico.is_none() {
            continue;
        }
        let rec = batch.industria.entry(nome).or_default();
        merge_field(&mut rec.emissioni_per_valore_aggiunto_tco2_per_mln_eur, emissioni_va);
        merge_field(&mut rec.quota_elettrico_pct, quota_elettrico);
    }
}

fn load_mix(table: &Table, batch: &mut Batch, report: &mut IngestReport) {
    let names = [COL_REGIONE, COL_CARBONE, COL_PETROLIO, COL_GAS, COL_RINNOVABILI];
    let cols = match bind_columns(table, &names, report) {
        Some(cols) => cols,
        None => return,
    };
    for row in &table.rows {
        let raw_region = row.get(cols[0]).unwrap_or("");
        let nome = match resolve_region(raw_region) {
            Some(nome) => nome,
            None => {
                report.note_unresolved(raw_region);
                continue;
            }
        };
        let carbone = normalize_number(row.get(cols[1]).unwrap_or(""));
        let petrolio = normalize_number(row.get(cols[2]).unwrap_or(""));
        let gas = normalize_number(row.get(cols[3]).unwrap_or(""));
        let rinnovabili = normalize_number(row.get(cols[4]).unwrap_or(""));
        if [carbone, petrolio, gas, rinnovabili].iter().all(|v| v.is_none()) {
            continue;
        }
        let rec = batch.mix.entry(nome).or_default();
        merge_field(&mut rec.carbone_pct, carbone);
        merge_field(&mut rec.petrolio_pct, petrolio);
        merge_field(&mut rec.gas_pct, gas);
        merge_field(&mut rec.rinnovabili_pct, rinnovabili);
    }
}

fn load_assorbimenti(table: &Table, batch: &mut Batch, report: &mut IngestReport) {
    let cols = match bind_columns(table, &[COL_REGIONE, COL_PUNTI_FORZA, COL_AREE_MIGLIORAMENTO], report) {
        Some(cols) => cols,
        None => return,
    };
    for row in &table.rows {
        let raw_region = row.get(cols[0]).unwrap_or("");
        let nome = match resolve_region(raw_region) {
            Some(nome) => nome,
            None => {
                report.note_unresolved(raw_region);
                continue;
            }
        };
        let punti_forza = normalize_text(row.get(cols[1]).unwrap_or(""));
        let aree = normalize_text(row.get(cols[2]).unwrap_or(""));
        if punti_forza.is_none() && aree.is_none() {
            continue;
        }
        let rec = batch.assorbimenti.entry(nome).or_default();
        merge_field(&mut rec.punti_forza, punti_forza);
        merge_field(&mut rec.aree_miglioramento, aree);
    }
}

fn load_azioni(table: &Table, batch: &mut Batch, report: &mut IngestReport) {
    let names = [COL_REGIONE, COL_FOTOVOLTAICO, COL_QUOTA_FER, COL_AUTO_ELETTRICHE, COL_RISPARMI];
    let cols = match bind_columns(table, &names, report) {
        Some(cols) => cols,
        None => return,
    };
    for row in &table.rows {
        let raw_region = row.get(cols[0]).unwrap_or("");
        let nome = match resolve_region(raw_region) {
            Some(nome) => nome,
            None => {
                report.note_unresolved(raw_region);
                continue;
            }
        };
        let fotovoltaico = normalize_number(row.get(cols[1]).unwrap_or(""));
        let quota_fer = normalize_number(row.get(cols[2]).unwrap_or(""));
        let auto_elettriche = normalize_number(row.get(cols[3]).unwrap_or(""));
        let risparmi = normalize_number(row.get(cols[4]).unwrap_or(""));
        if [fotovoltaico, quota_fer, auto_elettriche, risparmi].iter().all(|v| v.is_none()) {
            continue;
        }
        let rec = batch.azioni.entry(nome).or_default();
        merge_field(&mut rec.fotovoltaico_capacita_gw, fotovoltaico);
        merge_field(&mut rec.quota_produzione_fer_pct, quota_fer);
        merge_field(&mut rec.quota_auto_elettriche_pct, auto_elettriche);
        merge_field(&mut rec.risparmi_energetici_mtep_mln, risparmi);
    }
}

/// Build the full batch from whatever sources this run managed to read.
/// This function is DETERMINISTIC: same tables = same batch
fn build_batch(tables: &BTreeMap<String, Table>, report: &mut IngestReport) -> Batch {
    let mut batch = Batch::default();

    if let Some(t) = tables.get(SRC_REGIONI) {
        load_regioni(t, &mut batch, report);
    }
    if let Some(t) = tables.get(SRC_MORFOLOGIA) {
        load_morfologia(t, &mut batch, report);
    }
    if let Some(t) = tables.get(SRC_EMISSIONI) {
        load_emissioni(t, &mut batch, report);
    }
    if let Some(t) = tables.get(SRC_EDIFICI_CONSUMI) {
        load_edifici_source(t, COL_CONSUMO_MEDIO, |r, v| r.consumo_medio_kwh_m2y = Some(v), &mut batch, report);
    }
    if let Some(t) = tables.get(SRC_EDIFICI_EMISSIONI) {
        load_edifici_source(t, COL_EMISSIONI_PROCAPITE, |r, v| r.emissioni_procapite_tco2_ab = Some(v), &mut batch, report);
    }
    if let Some(t) = tables.get(SRC_EDIFICI_ELETTRICO) {
        load_edifici_source(t, COL_QUOTA_ELETTRICO, |r, v| r.quota_elettrico_pct = Some(v), &mut batch, report);
    }
    if let Some(t) = tables.get(SRC_EDIFICI_APE) {
        load_edifici_source(t, COL_QUOTA_APE, |r, v| r.quota_ape_classe_a_pct = Some(v), &mut batch, report);
    }
    if let Some(t) = tables.get(SRC_INDUSTRIA) {
        load_industria(t, &mut batch, report);
    }
    if let Some(t) = tables.get(SRC_MIX) {
        load_mix(t, &mut batch, report);
    }
    if let Some(t) = tables.get(SRC_ASSORBIMENTI) {
        load_assorbimenti(t, &mut batch, report);
    }
    if let Some(t) = tables.get(SRC_AZIONI) {
        load_azioni(t, &mut batch, report);
    }

    batch
}

/// The four mix shares should sum to ~100 when all are present. A deviation
/// beyond ±1 is a data-quality warning, never an ingestion failure.
fn check_mix_composition(batch: &Batch, report: &mut IngestReport) {
    for (nome, mix) in &batch.mix {
        if let (Some(carbone), Some(petrolio), Some(gas), Some(rinnovabili)) =
            (mix.carbone_pct, mix.petrolio_pct, mix.gas_pct, mix.rinnovabili_pct)
        {
            let somma = carbone + petrolio + gas + rinnovabili;
            if (somma - 100.0).abs() > 1.0 {
                report.mix_warnings.push(format!(
                    "{}: carbone+petrolio+gas+rinnovabili = {:.2} (expected ~100)",
                    nome, somma
                ));
            }
        }
    }
}

fn print_report(batch: &Batch, report: &IngestReport) {
    println!("\n=== Batch Report ===");
    println!("  regioni (attributes): {}", batch.regioni.len());
    println!("  morfologia_suolo:     {}", batch.morfologia.len());
    println!("  emissioni_totali:     {}", batch.emissioni.len());
    println!("  edifici:              {}", batch.edifici.len());
    println!("  industria:            {}", batch.industria.len());
    println!("  mix_energetico:       {}", batch.mix.len());
    println!("  assorbimenti:         {}", batch.assorbimenti.len());
    println!("  azioni:               {}", batch.azioni.len());
    println!("  total records:        {}", batch.record_count());

    if !report.skipped_sources.is_empty() {
        println!("\n⚠ Sources ignored (column mismatch): {}", report.skipped_sources.join(", "));
    }
    if !report.unresolved.is_empty() {
        println!("\n⚠ Unresolved region labels ({} rows skipped):", report.unresolved_rows());
        for (label, count) in &report.unresolved {
            println!("  '{}' x{}", label, count);
        }
    }
    for warning in &report.mix_warnings {
        println!("⚠ Mix composition: {}", warning);
    }
}

// =============================================================================
// Sink
// =============================================================================
// All batch writes go through one transaction: a run either commits whole or
// rolls back whole. Updates COALESCE the incoming value with the stored one,
// so absent fields preserve existing data.

/// Ensure all 20 canonical regions exist, creating missing ones with no
/// attributes set. Returns the name -> id map the upserts key on.
async fn ensure_regioni(tx: &mut Transaction<'_, Postgres>) -> Result<BTreeMap<&'static str, Uuid>> {
    let mut ids = BTreeMap::new();
    for nome in CANONICAL_REGIONS {
        let existing: Option<(Uuid,)> =
            sqlx::query_as("SELECT id_regione FROM regioni WHERE nome = $1")
                .bind(nome)
                .fetch_optional(&mut **tx)
                .await?;

        let id = match existing {
            Some((id,)) => id,
            None => {
                let id = Uuid::new_v4();
                sqlx::query("INSERT INTO regioni (id_regione, nome) VALUES ($1, $2)")
                    .bind(id)
                    .bind(nome)
                    .execute(&mut **tx)
                    .await?;
                id
            }
        };
        ids.insert(nome, id);
    }
    Ok(ids)
}

async fn update_regione_attrs(
    tx: &mut Transaction<'_, Postgres>,
    id_regione: Uuid,
    attrs: &RegioneAttrs,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE regioni
        SET superficie_kmq = COALESCE($2, superficie_kmq),
            densita_demografica = COALESCE($3, densita_demografica),
            pil = COALESCE($4, pil)
        WHERE id_regione = $1
        "#,
    )
    .bind(id_regione)
    .bind(attrs.superficie_kmq)
    .bind(attrs.densita_demografica)
    .bind(attrs.pil)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Check whether a topic record exists for the region. Every satellite table
/// uses the region key as primary key, so at most one row can exist.
async fn topic_exists(
    tx: &mut Transaction<'_, Postgres>,
    table: &str,
    id_regione: Uuid,
) -> Result<bool> {
    let query = format!("SELECT id_regione FROM {} WHERE id_regione = $1", table);
    let existing: Option<(Uuid,)> = sqlx::query_as(&query)
        .bind(id_regione)
        .fetch_optional(&mut **tx)
        .await?;
    Ok(existing.is_some())
}

/// Returns true when a record was created, false when updated.
async fn upsert_morfologia(
    tx: &mut Transaction<'_, Postgres>,
    id_regione: Uuid,
    rec: &Morfologia,
) -> Result<bool> {
    if !topic_exists(tx, "morfologia_suolo", id_regione).await? {
        sqlx::query(
            r#"
            INSERT INTO morfologia_suolo
            (id_regione, pianura_pct, collina_pct, montagna_pct, urbano_pct, agricolo_pct, forestale_pct)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(id_regione)
        .bind(rec.pianura_pct)
        .bind(rec.collina_pct)
        .bind(rec.montagna_pct)
        .bind(rec.urbano_pct)
        .bind(rec.agricolo_pct)
        .bind(rec.forestale_pct)
        .execute(&mut **tx)
        .await?;
        return Ok(true);
    }
    sqlx::query(
        r#"
        UPDATE morfologia_suolo
        SET pianura_pct = COALESCE($2, pianura_pct),
            collina_pct = COALESCE($3, collina_pct),
            montagna_pct = COALESCE($4, montagna_pct),
            urbano_pct = COALESCE($5, urbano_pct),
            agricolo_pct = COALESCE($6, agricolo_pct),
            forestale_pct = COALESCE($7, forestale_pct)
        WHERE id_regione = $1
        "#,
    )
    .bind(id_regione)
    .bind(rec.pianura_pct)
    .bind(rec.collina_pct)
    .bind(rec.montagna_pct)
    .bind(rec.urbano_pct)
    .bind(rec.agricolo_pct)
    .bind(rec.forestale_pct)
    .execute(&mut **tx)
    .await?;
    Ok(false)
}

async fn upsert_emissioni(
    tx: &mut Transaction<'_, Postgres>,
    id_regione: Uuid,
    rec: &Emissioni,
) -> Result<bool> {
    if !topic_exists(tx, "emissioni_totali", id_regione).await? {
        sqlx::query("INSERT INTO emissioni_totali (id_regione, co2eq_mln_t) VALUES ($1, $2)")
            .bind(id_regione)
            .bind(rec.co2eq_mln_t)
            .execute(&mut **tx)
            .await?;
        return Ok(true);
    }
    sqlx::query(
        "UPDATE emissioni_totali SET co2eq_mln_t = COALESCE($2, co2eq_mln_t) WHERE id_regione = $1",
    )
    .bind(id_regione)
    .bind(rec.co2eq_mln_t)
    .execute(&mut **tx)
    .await?;
    Ok(false)
}

async fn upsert_edifici(
    tx: &mut Transaction<'_, Postgres>,
    id_regione: Uuid,
    rec: &Edifici,
) -> Result<bool> {
    if !topic_exists(tx, "edifici", id_regione).await? {
        sqlx::query(
            r#"
            INSERT INTO edifici
            (id_regione, consumo_medio_kwh_m2y, emissioni_procapite_tco2_ab, quota_elettrico_pct, quota_ape_classe_a_pct)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(id_regione)
        .bind(rec.consumo_medio_kwh_m2y)
        .bind(rec.emissioni_procapite_tco2_ab)
        .bind(rec.quota_elettrico_pct)
        .bind(rec.quota_ape_classe_a_pct)
        .execute(&mut **tx)
        .await?;
        return Ok(true);
    }
    sqlx::query(
        r#"
        UPDATE edifici
        SET consumo_medio_kwh_m2y = COALESCE($2, consumo_medio_kwh_m2y),
            emissioni_procapite_tco2_ab = COALESCE($3, emissioni_procapite_tco2_ab),
            quota_elettrico_pct = COALESCE($4, quota_elettrico_pct),
            quota_ape_classe_a_pct = COALESCE($5, quota_ape_classe_a_pct)
        WHERE id_regione = $1
        "#,
    )
    .bind(id_regione)
    .bind(rec.consumo_medio_kwh_m2y)
    .bind(rec.emissioni_procapite_tco2_ab)
    .bind(rec.quota_elettrico_pct)
    .bind(rec.quota_ape_classe_a_pct)
    .execute(&mut **tx)
    .await?;
    Ok(false)
}

async fn upsert_industria(
    tx: &mut Transaction<'_, Postgres>,
    id_regione: Uuid,
    rec: &Industria,
) -> Result<bool> {
    if !topic_exists(tx, "industria", id_regione).await? {
        sqlx::query(
            r#"
            INSERT INTO industria
            (id_regione, emissioni_per_valore_aggiunto_tco2_per_mln_eur, quota_elettrico_pct)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(id_regione)
        .bind(rec.emissioni_per_valore_aggiunto_tco2_per_mln_eur)
        .bind(rec.quota_elettrico_pct)
        .execute(&mut **tx)
        .await?;
        return Ok(true);
    }
    sqlx::query(
        r#"
        UPDATE industria
        SET emissioni_per_valore_aggiunto_tco2_per_mln_eur = COALESCE($2, emissioni_per_valore_aggiunto_tco2_per_mln_eur),
            quota_elettrico_pct = COALESCE($3, quota_elettrico_pct)
        WHERE id_regione = $1
        "#,
    )
    .bind(id_regione)
    .bind(rec.emissioni_per_valore_aggiunto_tco2_per_mln_eur)
    .bind(rec.quota_elettrico_pct)
    .execute(&mut **tx)
    .await?;
    Ok(false)
}

async fn upsert_mix(
    tx: &mut Transaction<'_, Postgres>,
    id_regione: Uuid,
    rec: &MixEnergetico,
) -> Result<bool> {
    if !topic_exists(tx, "mix_energetico", id_regione).await? {
        sqlx::query(
            r#"
            INSERT INTO mix_energetico
            (id_regione, carbone_pct, petrolio_pct, gas_pct, rinnovabili_pct)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(id_regione)
        .bind(rec.carbone_pct)
        .bind(rec.petrolio_pct)
        .bind(rec.gas_pct)
        .bind(rec.rinnovabili_pct)
        .execute(&mut **tx)
        .await?;
        return Ok(true);
    }
    sqlx::query(
        r#"
        UPDATE mix_energetico
        SET carbone_pct = COALESCE($2, carbone_pct),
            petrolio_pct = COALESCE($3, petrolio_pct),
            gas_pct = COALESCE($4, gas_pct),
            rinnovabili_pct = COALESCE($5, rinnovabili_pct)
        WHERE id_regione = $1
        "#,
    )
    .bind(id_regione)
    .bind(rec.carbone_pct)
    .bind(rec.petrolio_pct)
    .bind(rec.gas_pct)
    .bind(rec.rinnovabili_pct)
    .execute(&mut **tx)
    .await?;
    Ok(false)
}

async fn upsert_assorbimenti(
    tx: &mut Transaction<'_, Postgres>,
    id_regione: Uuid,
    rec: &Assorbimenti,
) -> Result<bool> {
    if !topic_exists(tx, "assorbimenti", id_regione).await? {
        sqlx::query(
            "INSERT INTO assorbimenti (id_regione, punti_forza, aree_miglioramento) VALUES ($1, $2, $3)",
        )
        .bind(id_regione)
        .bind(&rec.punti_forza)
        .bind(&rec.aree_miglioramento)
        .execute(&mut **tx)
        .await?;
        return Ok(true);
    }
    sqlx::query(
        r#"
        UPDATE assorbimenti
        SET punti_forza = COALESCE($2, punti_forza),
            aree_miglioramento = COALESCE($3, aree_miglioramento)
        WHERE id_regione = $1
        "#,
    )
    .bind(id_regione)
    .bind(&rec.punti_forza)
    .bind(&rec.aree_miglioramento)
    .execute(&mut **tx)
    .await?;
    Ok(false)
}

async fn upsert_azioni(
    tx: &mut Transaction<'_, Postgres>,
    id_regione: Uuid,
    rec: &Azioni,
) -> Result<bool> {
    if !topic_exists(tx, "azioni", id_regione).await? {
        sqlx::query(
            r#"
            INSERT INTO azioni
            (id_regione, fotovoltaico_capacita_gw, quota_produzione_fer_pct, quota_auto_elettriche_pct, risparmi_energetici_mtep_mln)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(id_regione)
        .bind(rec.fotovoltaico_capacita_gw)
        .bind(rec.quota_produzione_fer_pct)
        .bind(rec.quota_auto_elettriche_pct)
        .bind(rec.risparmi_energetici_mtep_mln)
        .execute(&mut **tx)
        .await?;
        return Ok(true);
    }
    sqlx::query(
        r#"
        UPDATE azioni
        SET fotovoltaico_capacita_gw = COALESCE($2, fotovoltaico_capacita_gw),
            quota_produzione_fer_pct = COALESCE($3, quota_produzione_fer_pct),
            quota_auto_elettriche_pct = COALESCE($4, quota_auto_elettriche_pct),
            risparmi_energetici_mtep_mln = COALESCE($5, risparmi_energetici_mtep_mln)
        WHERE id_regione = $1
        "#,
    )
    .bind(id_regione)
    .bind(rec.fotovoltaico_capacita_gw)
    .bind(rec.quota_produzione_fer_pct)
    .bind(rec.quota_auto_elettriche_pct)
    .bind(rec.risparmi_energetici_mtep_mln)
    .execute(&mut **tx)
    .await?;
    Ok(false)
}

// =============================================================================
// Run Audit
// =============================================================================
// Run records live outside the batch transaction so a rolled-back run still
// leaves a failed entry behind.

async fn create_ingestion_run(pool: &PgPool) -> Result<Uuid> {
    let run_id = Uuid::new_v4();
    sqlx::query("INSERT INTO ingestion_runs (run_id, status, detail) VALUES ($1, 'running', '{}')")
        .bind(run_id)
        .execute(pool)
        .await?;
    Ok(run_id)
}

async fn finish_ingestion_run(
    pool: &PgPool,
    run_id: Uuid,
    status: &str,
    error: Option<&str>,
    detail: serde_json::Value,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE ingestion_runs
        SET finished_at = now(), status = $2, error = $3, detail = detail || $4
        WHERE run_id = $1
        "#,
    )
    .bind(run_id)
    .bind(status)
    .bind(error)
    .bind(detail)
    .execute(pool)
    .await?;
    Ok(())
}

// =============================================================================
// Reconciliation Driver
// =============================================================================

#[derive(Debug, Default)]
struct ApplyStats {
    regioni_updated: u32,
    /// topic table -> (created, updated)
    topics: BTreeMap<&'static str, (u32, u32)>,
}

impl ApplyStats {
    fn add(&mut self, topic: &'static str, created: bool) {
        let entry = self.topics.entry(topic).or_insert((0, 0));
        if created {
            entry.0 += 1;
        } else {
            entry.1 += 1;
        }
    }

    fn created_total(&self) -> u32 {
        self.topics.values().map(|(created, _)| *created).sum()
    }

    fn updated_total(&self) -> u32 {
        self.topics.values().map(|(_, updated)| *updated).sum()
    }
}

fn region_id(ids: &BTreeMap<&'static str, Uuid>, nome: &str) -> Result<Uuid> {
    ids.get(nome)
        .copied()
        .with_context(|| format!("Region '{}' missing after bootstrap", nome))
}

/// Apply the whole batch inside the caller's transaction: bootstrap all 20
/// regions, then upsert every topic record keyed by canonical identity.
async fn ingest_batch(tx: &mut Transaction<'_, Postgres>, batch: &Batch) -> Result<ApplyStats> {
    let ids = ensure_regioni(tx).await?;
    println!("Regions bootstrapped: {}", ids.len());

    let mut stats = ApplyStats::default();

    for (nome, attrs) in &batch.regioni {
        let id = region_id(&ids, nome)?;
        update_regione_attrs(tx, id, attrs).await?;
        stats.regioni_updated += 1;
    }
    for (nome, rec) in &batch.morfologia {
        let id = region_id(&ids, nome)?;
        let created = upsert_morfologia(tx, id, rec).await?;
        stats.add("morfologia_suolo", created);
    }
    for (nome, rec) in &batch.emissioni {
        let id = region_id(&ids, nome)?;
        let created = upsert_emissioni(tx, id, rec).await?;
        stats.add("emissioni_totali", created);
    }
    for (nome, rec) in &batch.edifici {
        let id = region_id(&ids, nome)?;
        let created = upsert_edifici(tx, id, rec).await?;
        stats.add("edifici", created);
    }
    for (nome, rec) in &batch.industria {
        let id = region_id(&ids, nome)?;
        let created = upsert_industria(tx, id, rec).await?;
        stats.add("industria", created);
    }
    for (nome, rec) in &batch.mix {
        let id = region_id(&ids, nome)?;
        let created = upsert_mix(tx, id, rec).await?;
        stats.add("mix_energetico", created);
    }
    for (nome, rec) in &batch.assorbimenti {
        let id = region_id(&ids, nome)?;
        let created = upsert_assorbimenti(tx, id, rec).await?;
        stats.add("assorbimenti", created);
    }
    for (nome, rec) in &batch.azioni {
        let id = region_id(&ids, nome)?;
        let created = upsert_azioni(tx, id, rec).await?;
        stats.add("azioni", created);
    }

    Ok(stats)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    println!("=== CAN Ingest ===");
    println!("Config: {}", args.config);
    println!("Mode: {}", if args.dry_run { "dry-run" } else { "live" });

    let config = load_sources_config(&args.config).await?;
    println!("Config version: {}", config.version);
    println!("Data dir: {}", config.data_dir);

    // Filter sources
    let selected: Vec<&SourceEntry> = config
        .sources
        .iter()
        .filter(|s| {
            if !s.enabled {
                return false;
            }
            if let Some(ref filter_id) = args.source_id {
                return &s.id == filter_id;
            }
            true
        })
        .collect();

    if selected.is_empty() {
        print_sources_summary(&config);
        anyhow::bail!("No sources match the filter criteria");
    }

    // Read and decode every selected source
    println!("\nReading {} source(s)...", selected.len());
    let data_dir = Path::new(&config.data_dir);
    let mut tables: BTreeMap<String, Table> = BTreeMap::new();
    let mut report = IngestReport::default();

    for source in &selected {
        println!("\n[{}] {}", source.id, source.name);
        if !KNOWN_SOURCES.contains(&source.id.as_str()) {
            eprintln!("  ⚠ Unknown source id '{}', no loader bound, skipping", source.id);
            continue;
        }
        if let Some(table) = read_table(source, data_dir).await? {
            tables.insert(source.id.clone(), table);
        }
    }

    // Build the canonical batch
    let batch = build_batch(&tables, &mut report);
    check_mix_composition(&batch, &mut report);
    print_report(&batch, &report);

    if args.dry_run {
        println!("\nDry run - no changes written to the database");
        return Ok(());
    }

    // Connect to database
    let db_url = std::env::var("DB_URL").context("DB_URL env var missing")?;
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&db_url)
        .await
        .context("Failed to connect to database")?;

    let run_id = create_ingestion_run(&pool).await?;

    // One transaction per run: a mid-run failure must leave the previous
    // state untouched, not a partially applied batch.
    let mut tx = pool.begin().await.context("Failed to open transaction")?;
    let applied = ingest_batch(&mut tx, &batch).await;

    let outcome = match applied {
        Ok(stats) => match tx.commit().await {
            Ok(()) => Ok(stats),
            Err(e) => Err(anyhow::Error::from(e).context("Failed to commit ingestion batch")),
        },
        Err(e) => {
            if let Err(rb) = tx.rollback().await {
                eprintln!("⚠ Rollback failed: {}", rb);
            }
            Err(e)
        }
    };

    match &outcome {
        Ok(stats) => {
            let detail = serde_json::json!({
                "regioni_updated": stats.regioni_updated,
                "topics_created": stats.created_total(),
                "topics_updated": stats.updated_total(),
                "unresolved_rows": report.unresolved_rows(),
                "sources_skipped": report.skipped_sources.clone(),
                "mix_warnings": report.mix_warnings.len(),
            });
            finish_ingestion_run(&pool, run_id, "ok", None, detail).await?;
        }
        Err(e) => {
            finish_ingestion_run(&pool, run_id, "failed", Some(&e.to_string()), serde_json::json!({}))
                .await?;
        }
    }

    let stats = outcome?;

    println!("\n=== Ingestion Complete ===");
    println!("Run ID: {}", run_id);
    println!("Region attribute updates: {}", stats.regioni_updated);
    println!(
        "Topic records created: {}, updated: {}",
        stats.created_total(),
        stats.updated_total()
    );
    for (topic, (created, updated)) in &stats.topics {
        println!("  {}: +{} / ~{}", topic, created, updated);
    }
    if report.unresolved_rows() > 0 {
        println!("⚠ {} rows skipped on unresolved region labels", report.unresolved_rows());
    }

    Ok(())
}

// =============================================================================
// TESTS - the pure pipeline: normalization, identity, loaders, batch assembly
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn table(source_id: &str, content: &str) -> Table {
        parse_table(source_id, content).unwrap()
    }

    // -------------------------------------------------------------------------
    // NUMERIC NORMALIZATION TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_normalize_number_thousands_and_decimal() {
        assert_eq!(normalize_number("10.000,50"), Some(10000.50));
    }

    #[test]
    fn test_normalize_number_approx_marker() {
        assert_eq!(normalize_number("~40"), Some(40.0));
        assert_eq!(normalize_number("~ 40"), Some(40.0));
    }

    #[test]
    fn test_normalize_number_percent_suffix() {
        assert_eq!(normalize_number("55%"), Some(55.0));
        assert_eq!(normalize_number("12,5%"), Some(12.5));
    }

    #[test]
    fn test_normalize_number_approx_percent_combined() {
        assert_eq!(normalize_number("~12,5%"), Some(12.5));
    }

    #[test]
    fn test_normalize_number_plain_integer() {
        assert_eq!(normalize_number("42"), Some(42.0));
    }

    #[test]
    fn test_normalize_number_negative_decimal() {
        assert_eq!(normalize_number("-3,2"), Some(-3.2));
    }

    #[test]
    fn test_normalize_number_absent_markers() {
        assert_eq!(normalize_number(""), None);
        assert_eq!(normalize_number("   "), None);
        assert_eq!(normalize_number("n/a"), None);
        assert_eq!(normalize_number("N.D."), None);
        assert_eq!(normalize_number("-"), None);
    }

    #[test]
    fn test_normalize_number_garbage() {
        assert_eq!(normalize_number("boh"), None);
        assert_eq!(normalize_number("12abc"), None);
        assert_eq!(normalize_number("%"), None);
    }

    #[test]
    fn test_normalize_number_whitespace_trimmed() {
        assert_eq!(normalize_number("  1.234  "), Some(1234.0));
    }

    #[test]
    fn test_normalize_text_collapses_empty_to_unset() {
        assert_eq!(normalize_text(""), None);
        assert_eq!(normalize_text("  "), None);
        assert_eq!(normalize_text("n/a"), None);
        assert_eq!(normalize_text("  rete idrica solida  "), Some("rete idrica solida".to_string()));
    }

    // -------------------------------------------------------------------------
    // REGION IDENTITY TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_resolve_canonical_names() {
        for nome in CANONICAL_REGIONS {
            assert_eq!(resolve_region(nome), Some(nome), "canonical '{}' must resolve", nome);
        }
    }

    #[test]
    fn test_resolve_case_and_whitespace() {
        assert_eq!(resolve_region("  EMILIA-ROMAGNA "), Some("Emilia-Romagna"));
        assert_eq!(resolve_region("piemonte"), Some("Piemonte"));
        assert_eq!(resolve_region("valle  d'aosta"), Some("Valle d'Aosta"));
    }

    #[test]
    fn test_resolve_provincial_labels_collapse() {
        assert_eq!(resolve_region("Provincia di Bolzano"), Some("Trentino-Alto Adige"));
        assert_eq!(resolve_region("Provincia di Trento"), Some("Trentino-Alto Adige"));
        assert_eq!(
            resolve_region("Provincia Autonoma di Bolzano/Bozen"),
            Some("Trentino-Alto Adige")
        );
    }

    #[test]
    fn test_resolve_bilingual_labels() {
        assert_eq!(resolve_region("Trentino-Alto Adige/Südtirol"), Some("Trentino-Alto Adige"));
        assert_eq!(resolve_region("Valle d'Aosta/Vallée d'Aoste"), Some("Valle d'Aosta"));
        assert_eq!(resolve_region("Südtirol"), Some("Trentino-Alto Adige"));
    }

    #[test]
    fn test_resolve_typographic_apostrophe() {
        assert_eq!(resolve_region("Valle d\u{2019}Aosta"), Some("Valle d'Aosta"));
    }

    #[test]
    fn test_resolve_unhyphenated_spellings() {
        assert_eq!(resolve_region("Emilia Romagna"), Some("Emilia-Romagna"));
        assert_eq!(resolve_region("Friuli Venezia Giulia"), Some("Friuli-Venezia Giulia"));
    }

    #[test]
    fn test_resolve_unknown_is_none() {
        assert_eq!(resolve_region("Atlantide"), None);
        assert_eq!(resolve_region(""), None);
    }

    #[test]
    fn test_canonical_set_is_closed() {
        assert_eq!(CANONICAL_REGIONS.len(), 20);
        // Every variant collapses into the canonical set
        for (variant, canonical) in REGION_VARIANTS {
            assert!(CANONICAL_REGIONS.contains(canonical), "variant '{}' targets unknown region", variant);
        }
    }

    // -------------------------------------------------------------------------
    // DECODING AND TABLE READING TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_decode_utf8_with_bom() {
        let bytes = "\u{feff}Regione,Gas\nLazio,30".as_bytes();
        let content = decode_source_bytes(bytes);
        assert!(content.starts_with("Regione"));
    }

    #[test]
    fn test_decode_windows_1252_fallback() {
        // "Densità" with 0xE0 for the accented a, invalid as UTF-8
        let bytes = b"Densit\xe0 demografica";
        let content = decode_source_bytes(bytes);
        assert_eq!(content, "Densità demografica");
    }

    #[test]
    fn test_detect_delimiter() {
        assert_eq!(detect_delimiter("Regione;Gas\nLazio;30"), b';');
        assert_eq!(detect_delimiter("Regione,Gas\nLazio,30"), b',');
        assert_eq!(detect_delimiter(""), b',');
    }

    #[test]
    fn test_parse_table_semicolon() {
        let t = table("mix", "Regione;Carbone\nPiemonte;10%\n");
        assert_eq!(t.headers, vec!["Regione", "Carbone"]);
        assert_eq!(t.rows.len(), 1);
        assert_eq!(t.rows[0].get(1), Some("10%"));
    }

    #[test]
    fn test_parse_table_trims_fields() {
        let t = table("mix", "Regione,Gas\n  Lazio  ,  30  \n");
        assert_eq!(t.rows[0].get(0), Some("Lazio"));
        assert_eq!(t.rows[0].get(1), Some("30"));
    }

    #[test]
    fn test_column_binding_is_exact() {
        let t = table("emissioni", "Regione,Emissioni\nLazio,5\n");
        let mut report = IngestReport::default();
        // "Emissioni" is not the declared header, the source is ignored whole
        assert!(bind_columns(&t, &[COL_REGIONE, COL_CO2EQ], &mut report).is_none());
        assert_eq!(report.skipped_sources, vec!["emissioni".to_string()]);
    }

    // -------------------------------------------------------------------------
    // LOADER TESTS
    // -------------------------------------------------------------------------

    fn tables_from(entries: &[(&str, &str)]) -> BTreeMap<String, Table> {
        entries
            .iter()
            .map(|(id, content)| (id.to_string(), table(id, content)))
            .collect()
    }

    #[test]
    fn test_load_mix_end_to_end() {
        let tables = tables_from(&[(
            SRC_MIX,
            "Regione,Carbone,Petrolio,Gas,Rinnovabili\npiemonte,10%,20%,30%,40%\n",
        )]);
        let mut report = IngestReport::default();
        let batch = build_batch(&tables, &mut report);
        check_mix_composition(&batch, &mut report);

        assert_eq!(batch.mix.len(), 1);
        let rec = &batch.mix["Piemonte"];
        assert_eq!(rec.carbone_pct, Some(10.0));
        assert_eq!(rec.petrolio_pct, Some(20.0));
        assert_eq!(rec.gas_pct, Some(30.0));
        assert_eq!(rec.rinnovabili_pct, Some(40.0));
        // 10+20+30+40 = 100, zero deviation
        assert!(report.mix_warnings.is_empty());
    }

    #[test]
    fn test_mix_composition_warning_outside_tolerance() {
        let tables = tables_from(&[(
            SRC_MIX,
            "Regione,Carbone,Petrolio,Gas,Rinnovabili\nLazio,10,20,30,30\n",
        )]);
        let mut report = IngestReport::default();
        let batch = build_batch(&tables, &mut report);
        check_mix_composition(&batch, &mut report);

        assert_eq!(report.mix_warnings.len(), 1);
        assert!(report.mix_warnings[0].contains("Lazio"));
    }

    #[test]
    fn test_mix_composition_tolerates_one_point() {
        let tables = tables_from(&[(
            SRC_MIX,
            "Regione,Carbone,Petrolio,Gas,Rinnovabili\nLazio,10,20,30,\"40,8\"\n",
        )]);
        let mut report = IngestReport::default();
        let batch = build_batch(&tables, &mut report);
        check_mix_composition(&batch, &mut report);
        assert!(report.mix_warnings.is_empty());
    }

    #[test]
    fn test_mix_composition_skipped_when_partial() {
        let tables = tables_from(&[(
            SRC_MIX,
            "Regione,Carbone,Petrolio,Gas,Rinnovabili\nLazio,10,20,,\n",
        )]);
        let mut report = IngestReport::default();
        let batch = build_batch(&tables, &mut report);
        check_mix_composition(&batch, &mut report);
        // Incomplete compositions are not judged
        assert!(report.mix_warnings.is_empty());
    }

    #[test]
    fn test_load_edifici_partial_sources() {
        // Region present in 2 of the 4 sources: exactly those 2 fields set
        let tables = tables_from(&[
            (
                SRC_EDIFICI_CONSUMI,
                "Regione,Consumo medio (kWh/m2 anno)\nUmbria,\"150,5\"\n",
            ),
            (
                SRC_EDIFICI_APE,
                "Regione,Quota APE classe A\nUmbria,8%\n",
            ),
        ]);
        let mut report = IngestReport::default();
        let batch = build_batch(&tables, &mut report);

        assert_eq!(batch.edifici.len(), 1);
        let rec = &batch.edifici["Umbria"];
        assert_eq!(rec.consumo_medio_kwh_m2y, Some(150.5));
        assert_eq!(rec.quota_ape_classe_a_pct, Some(8.0));
        assert_eq!(rec.emissioni_procapite_tco2_ab, None);
        assert_eq!(rec.quota_elettrico_pct, None);
    }

    #[test]
    fn test_load_edifici_merges_by_canonical_key() {
        // The same region under different spellings still lands in one record
        let tables = tables_from(&[
            (
                SRC_EDIFICI_CONSUMI,
                "Regione,Consumo medio (kWh/m2 anno)\nProvincia di Trento,120\n",
            ),
            (
                SRC_EDIFICI_ELETTRICO,
                "Regione,Quota elettrico\nTrentino-Alto Adige/Südtirol,25%\n",
            ),
        ]);
        let mut report = IngestReport::default();
        let batch = build_batch(&tables, &mut report);

        assert_eq!(batch.edifici.len(), 1);
        let rec = &batch.edifici["Trentino-Alto Adige"];
        assert_eq!(rec.consumo_medio_kwh_m2y, Some(120.0));
        assert_eq!(rec.quota_elettrico_pct, Some(25.0));
    }

    #[test]
    fn test_unresolved_rows_skipped_and_counted() {
        let tables = tables_from(&[(
            SRC_EMISSIONI,
            "Regione,Emissioni totali CO2eq (mln t)\nAtlantide,5\nAtlantide,6\nLazio,\"32,1\"\n",
        )]);
        let mut report = IngestReport::default();
        let batch = build_batch(&tables, &mut report);

        assert_eq!(batch.emissioni.len(), 1);
        assert_eq!(batch.emissioni["Lazio"].co2eq_mln_t, Some(32.1));
        assert_eq!(report.unresolved.get("Atlantide"), Some(&2));
        assert_eq!(report.unresolved_rows(), 2);
    }

    #[test]
    fn test_rows_with_no_values_produce_no_record() {
        let tables = tables_from(&[(
            SRC_MORFOLOGIA,
            "Regione,Pianura,Collina,Montagna,Urbano,Agricolo,Forestale\nMolise,,,,,,\n",
        )]);
        let mut report = IngestReport::default();
        let batch = build_batch(&tables, &mut report);
        assert!(batch.morfologia.is_empty());
    }

    #[test]
    fn test_load_morfologia_locale_values() {
        let tables = tables_from(&[(
            SRC_MORFOLOGIA,
            "Regione,Pianura,Collina,Montagna,Urbano,Agricolo,Forestale\n\
             Piemonte,~27,30,43,\"7,2\",\"42,5\",\"36,8\"\n",
        )]);
        let mut report = IngestReport::default();
        let batch = build_batch(&tables, &mut report);

        let rec = &batch.morfologia["Piemonte"];
        assert_eq!(rec.pianura_pct, Some(27.0));
        assert_eq!(rec.collina_pct, Some(30.0));
        assert_eq!(rec.montagna_pct, Some(43.0));
        assert_eq!(rec.urbano_pct, Some(7.2));
        assert_eq!(rec.agricolo_pct, Some(42.5));
        assert_eq!(rec.forestale_pct, Some(36.8));
    }

    #[test]
    fn test_load_regioni_attributes() {
        let tables = tables_from(&[(
            SRC_REGIONI,
            "Regione;Superficie Kmq;Densità demografica (ab/kmq);PIL per abitante (migliaia di €)\n\
             Piemonte;25.399,00;170,50;\"31,4\"\n",
        )]);
        let mut report = IngestReport::default();
        let batch = build_batch(&tables, &mut report);

        let rec = &batch.regioni["Piemonte"];
        assert_eq!(rec.superficie_kmq, Some(25399.0));
        assert_eq!(rec.densita_demografica, Some(170.5));
        assert_eq!(rec.pil, Some(31.4));
    }

    #[test]
    fn test_load_assorbimenti_free_text() {
        let tables = tables_from(&[(
            SRC_ASSORBIMENTI,
            "Regione,Punti di forza,Aree di miglioramento\n\
             Veneto,Forte capacità forestale,\n\
             Puglia,n/a,Riforestazione costiera\n",
        )]);
        let mut report = IngestReport::default();
        let batch = build_batch(&tables, &mut report);

        let veneto = &batch.assorbimenti["Veneto"];
        assert_eq!(veneto.punti_forza.as_deref(), Some("Forte capacità forestale"));
        assert_eq!(veneto.aree_miglioramento, None);

        let puglia = &batch.assorbimenti["Puglia"];
        assert_eq!(puglia.punti_forza, None);
        assert_eq!(puglia.aree_miglioramento.as_deref(), Some("Riforestazione costiera"));
    }

    #[test]
    fn test_load_azioni() {
        let tables = tables_from(&[(
            SRC_AZIONI,
            "Regione,Fotovoltaico capacità (GW),Quota produzione FER,Quota auto elettriche,Risparmi energetici (Mtep)\n\
             Lombardia,\"3,6\",38%,\"4,1%\",\"0,9\"\n",
        )]);
        let mut report = IngestReport::default();
        let batch = build_batch(&tables, &mut report);

        let rec = &batch.azioni["Lombardia"];
        assert_eq!(rec.fotovoltaico_capacita_gw, Some(3.6));
        assert_eq!(rec.quota_produzione_fer_pct, Some(38.0));
        assert_eq!(rec.quota_auto_elettriche_pct, Some(4.1));
        assert_eq!(rec.risparmi_energetici_mtep_mln, Some(0.9));
    }

    #[test]
    fn test_load_industria_partial_row() {
        let tables = tables_from(&[(
            SRC_INDUSTRIA,
            "Regione,Emissioni per valore aggiunto (tCO2/mln €),Quota elettrico\nMarche,,41%\n",
        )]);
        let mut report = IngestReport::default();
        let batch = build_batch(&tables, &mut report);

        let rec = &batch.industria["Marche"];
        assert_eq!(rec.emissioni_per_valore_aggiunto_tco2_per_mln_eur, None);
        assert_eq!(rec.quota_elettrico_pct, Some(41.0));
    }

    #[test]
    fn test_renamed_column_drops_source_not_run() {
        let tables = tables_from(&[
            (
                SRC_EMISSIONI,
                "Regione,CO2eq\nLazio,5\n",
            ),
            (
                SRC_MIX,
                "Regione,Carbone,Petrolio,Gas,Rinnovabili\nLazio,10,25,35,30\n",
            ),
        ]);
        let mut report = IngestReport::default();
        let batch = build_batch(&tables, &mut report);

        // The renamed emissioni source is ignored, the mix source still loads
        assert!(batch.emissioni.is_empty());
        assert_eq!(batch.mix.len(), 1);
        assert_eq!(report.skipped_sources, vec![SRC_EMISSIONI.to_string()]);
    }

    // -------------------------------------------------------------------------
    // MERGE SEMANTICS TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_merge_field_preserves_on_absent() {
        let mut slot = Some(12.5);
        merge_field(&mut slot, None);
        assert_eq!(slot, Some(12.5));
        merge_field(&mut slot, Some(13.0));
        assert_eq!(slot, Some(13.0));
    }

    #[test]
    fn test_duplicate_rows_absent_does_not_clobber() {
        // Second row for the same region carries no value: the first survives
        let tables = tables_from(&[(
            SRC_EMISSIONI,
            "Regione,Emissioni totali CO2eq (mln t)\nLazio,\"32,1\"\nLazio,\n",
        )]);
        let mut report = IngestReport::default();
        let batch = build_batch(&tables, &mut report);
        assert_eq!(batch.emissioni["Lazio"].co2eq_mln_t, Some(32.1));
    }

    // -------------------------------------------------------------------------
    // DETERMINISM TESTS - Same input MUST produce same batch
    // -------------------------------------------------------------------------

    #[test]
    fn test_build_batch_determinism() {
        let tables = tables_from(&[
            (
                SRC_MIX,
                "Regione,Carbone,Petrolio,Gas,Rinnovabili\npiemonte,10%,20%,30%,40%\nLazio,5,25,40,30\n",
            ),
            (
                SRC_EMISSIONI,
                "Regione,Emissioni totali CO2eq (mln t)\nLazio,\"32,1\"\n",
            ),
        ]);

        let mut report1 = IngestReport::default();
        let baseline = build_batch(&tables, &mut report1);
        for _ in 0..10 {
            let mut report = IngestReport::default();
            let batch = build_batch(&tables, &mut report);
            assert_eq!(baseline, batch);
        }
    }

    #[test]
    fn test_empty_sources_empty_batch() {
        let tables = BTreeMap::new();
        let mut report = IngestReport::default();
        let batch = build_batch(&tables, &mut report);
        assert_eq!(batch.record_count(), 0);
        assert_eq!(report.unresolved_rows(), 0);
    }
}
