//! Command surface and migration driver for `burp2caido`.
//!
//! Library callers can skip the CLI entirely:
//! - [`run_cli`] for a parsed command line.
//! - [`run_migration_with_paths`] for a Burp export path and a Caido project
//!   directory.
//! - [`migrate`] for an item stream against already opened [`CaidoStores`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use burp2caido_core::{normalize_item, parse_zone_offset, ImportError, Item, ItemReader, NormalizeOptions};
use burp2caido_store_sqlite::{CaidoStores, WrittenEntry};
use clap::Parser;
use serde::{Deserialize, Serialize};

const PROGRESS_INTERVAL: usize = 1000;
const COMPLETION_NOTICE: &str = "Updated Caido databases successfully.";

#[derive(Debug, Parser)]
#[command(name = "burp2caido")]
#[command(about = "Import Burp Suite HTTP history into a Caido project")]
pub struct Cli {
    /// Burp Suite XML export of the HTTP history.
    #[arg(long, value_name = "XML")]
    burp: PathBuf,

    /// Caido project directory holding database.caido and database_raw.caido.
    #[arg(long, value_name = "DIR")]
    caido: PathBuf,

    /// Abort on the first item that cannot be imported.
    #[arg(long)]
    fail_fast: bool,

    /// Decode and normalize every item without writing.
    #[arg(long)]
    dry_run: bool,

    /// Stop after this many items.
    #[arg(long)]
    limit: Option<usize>,

    /// Store the part of the path after `?` as the request query.
    #[arg(long)]
    split_query: bool,

    /// Offset for a zone abbreviation in item timestamps, e.g. `CET=+01:00`.
    #[arg(long = "zone-offset", value_name = "ABBR=+HH:MM")]
    zone_offsets: Vec<String>,

    #[arg(long)]
    json: bool,

    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    #[must_use]
    pub fn verbose(&self) -> bool {
        self.verbose
    }

    /// Builds migration options from the parsed flags.
    ///
    /// # Errors
    /// Returns an error when a `--zone-offset` value is malformed.
    pub fn migration_options(&self) -> Result<MigrationOptions> {
        let mut zone_offsets = BTreeMap::new();
        for spec in &self.zone_offsets {
            let (abbreviation, offset) = parse_zone_offset(spec)?;
            zone_offsets.insert(abbreviation, offset);
        }

        Ok(MigrationOptions {
            normalize: NormalizeOptions {
                split_query: self.split_query,
                zone_offsets,
            },
            failure_policy: if self.fail_fast {
                FailurePolicy::Abort
            } else {
                FailurePolicy::Skip
            },
            limit: self.limit,
            dry_run: self.dry_run,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Record the failed item and continue with the next one.
    #[default]
    Skip,
    /// Stop the run at the first failed item.
    Abort,
}

impl FailurePolicy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Skip => "skip",
            Self::Abort => "abort",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationOptions {
    pub normalize: NormalizeOptions,
    pub failure_policy: FailurePolicy,
    pub limit: Option<usize>,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum MigrationState {
    Idle,
    Streaming,
    Normalizing,
    Writing,
    Recorded,
    Failed,
    Completed,
    Aborted,
}

impl MigrationState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Streaming => "streaming",
            Self::Normalizing => "normalizing",
            Self::Writing => "writing",
            Self::Recorded => "recorded",
            Self::Failed => "failed",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    InvalidField,
    PayloadDecode,
    TimestampParse,
    StoreWrite,
}

impl FailureKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidField => "invalid_field",
            Self::PayloadDecode => "payload_decode",
            Self::TimestampParse => "timestamp_parse",
            Self::StoreWrite => "store_write",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ItemFailure {
    /// 1-based position of the `<item>` in the export.
    pub index: usize,
    pub url: Option<String>,
    pub kind: FailureKind,
    pub message: String,
}

impl ItemFailure {
    fn from_import(index: usize, url: Option<&str>, err: &ImportError) -> Self {
        let kind = match err.kind() {
            "payload_decode" => FailureKind::PayloadDecode,
            "timestamp_parse" => FailureKind::TimestampParse,
            _ => FailureKind::InvalidField,
        };
        Self {
            index,
            url: url.map(str::to_string),
            kind,
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MigrationReport {
    pub status: MigrationState,
    pub dry_run: bool,
    pub failure_policy: FailurePolicy,
    pub items_seen: usize,
    pub items_normalized: usize,
    pub items_written: usize,
    pub items_failed: usize,
    pub failures: Vec<ItemFailure>,
    pub fatal_error: Option<String>,
    /// Set when a store failed to close after the run. Committed rows are
    /// unaffected.
    pub close_error: Option<String>,
}

impl MigrationReport {
    fn new(options: &MigrationOptions) -> Self {
        Self {
            status: MigrationState::Idle,
            dry_run: options.dry_run,
            failure_policy: options.failure_policy,
            items_seen: 0,
            items_normalized: 0,
            items_written: 0,
            items_failed: 0,
            failures: Vec::new(),
            fatal_error: None,
            close_error: None,
        }
    }

    fn abort(mut self, message: String) -> Self {
        tracing::error!(items_seen = self.items_seen, "migration aborted: {message}");
        self.status = MigrationState::Aborted;
        self.fatal_error = Some(message);
        self
    }

    fn record_close(mut self, closed: Result<()>) -> Self {
        if let Err(err) = closed {
            let message = format!("{err:#}");
            tracing::warn!(error = %message, "failed to close Caido stores");
            self.close_error = Some(message);
        }
        self
    }
}

/// Executes the parsed command line.
///
/// # Errors
/// Returns an error when the inputs cannot be opened, the destination schema
/// is incompatible, or the migration aborts.
pub fn run_cli(cli: Cli) -> Result<()> {
    let options = cli.migration_options()?;
    let report = run_migration_with_paths(&cli.burp, &cli.caido, &options)?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    match report.status {
        MigrationState::Completed if report.items_failed == 0 => {
            if !cli.json {
                println!("{COMPLETION_NOTICE}");
            }
            Ok(())
        }
        MigrationState::Completed => {
            let summary = partial_import_summary(&report);
            if !cli.json {
                println!("{summary}");
            }
            Err(anyhow!(summary))
        }
        _ => Err(anyhow!(
            "migration aborted: {}",
            report.fatal_error.as_deref().unwrap_or("unknown error")
        )),
    }
}

/// Opens both Caido stores and the Burp export, then runs [`migrate`].
///
/// Both stores are closed before returning, including when the run aborts. A
/// close failure is recorded in the report instead of replacing it.
///
/// # Errors
/// Returns an error when a path is missing, a store cannot be opened, the
/// destination schema is incompatible, or the export cannot be opened.
pub fn run_migration_with_paths(
    burp_path: &Path,
    caido_dir: &Path,
    options: &MigrationOptions,
) -> Result<MigrationReport> {
    if !burp_path.is_file() {
        return Err(anyhow!(
            "Burp Suite export {} does not exist",
            burp_path.display()
        ));
    }
    if !caido_dir.is_dir() {
        return Err(anyhow!(
            "Caido project directory {} does not exist",
            caido_dir.display()
        ));
    }

    tracing::info!(caido = %caido_dir.display(), "using Caido project");
    tracing::info!(burp = %burp_path.display(), "using Burp Suite export");

    let mut stores = CaidoStores::open(caido_dir)?;
    stores
        .verify_schema()
        .context("destination is not a compatible Caido project")?;
    let items = ItemReader::from_path(burp_path)?;

    let report = migrate(items, &mut stores, options);
    Ok(report.record_close(stores.close()))
}

/// Normalizes and writes every item of `items`, one at a time.
///
/// Per-item failures are recorded in the report and, under
/// [`FailurePolicy::Abort`], end the run. Fatal decode errors always end the
/// run with [`MigrationState::Aborted`].
pub fn migrate<I>(items: I, stores: &mut CaidoStores, options: &MigrationOptions) -> MigrationReport
where
    I: IntoIterator<Item = Result<Item, ImportError>>,
{
    let mut report = MigrationReport::new(options);
    report.status = MigrationState::Streaming;
    tracing::info!(
        dry_run = options.dry_run,
        policy = options.failure_policy.as_str(),
        "streaming history items"
    );

    for decoded in items {
        if options.limit.is_some_and(|limit| report.items_seen >= limit) {
            tracing::info!(limit = report.items_seen, "item limit reached");
            break;
        }

        let item = match decoded {
            Err(err) if err.is_fatal() => {
                tracing::error!(kind = err.kind(), "document decoding stopped");
                return report.abort(err.to_string());
            }
            Err(err) => {
                report.items_seen += 1;
                Err(ItemFailure::from_import(report.items_seen, None, &err))
            }
            Ok(item) => {
                report.items_seen += 1;
                Ok(item)
            }
        };
        let index = report.items_seen;

        let outcome = item.and_then(|item| process_item(index, &item, stores, options));
        match outcome {
            Ok(written) => {
                report.items_normalized += 1;
                if written.is_some() {
                    report.items_written += 1;
                }
                tracing::debug!(item = index, state = MigrationState::Recorded.as_str());
            }
            Err(failure) => {
                tracing::warn!(
                    item = index,
                    state = MigrationState::Failed.as_str(),
                    kind = failure.kind.as_str(),
                    url = failure.url.as_deref().unwrap_or(""),
                    "{}",
                    failure.message
                );
                let message = format!("item {index}: {}", failure.message);
                report.items_failed += 1;
                report.failures.push(failure);
                if options.failure_policy == FailurePolicy::Abort {
                    return report.abort(message);
                }
            }
        }

        if index % PROGRESS_INTERVAL == 0 {
            tracing::info!(
                items = index,
                written = report.items_written,
                failed = report.items_failed,
                "progress"
            );
        }
    }

    report.status = MigrationState::Completed;
    tracing::info!(
        items = report.items_seen,
        written = report.items_written,
        failed = report.items_failed,
        "migration completed"
    );
    report
}

fn process_item(
    index: usize,
    item: &Item,
    stores: &mut CaidoStores,
    options: &MigrationOptions,
) -> Result<Option<WrittenEntry>, ItemFailure> {
    tracing::debug!(item = index, state = MigrationState::Normalizing.as_str());
    let entry = normalize_item(item, &options.normalize)
        .map_err(|err| ItemFailure::from_import(index, Some(&item.url), &err))?;

    if options.dry_run {
        return Ok(None);
    }

    tracing::debug!(item = index, state = MigrationState::Writing.as_str());
    let written = stores.write_entry(&entry).map_err(|err| ItemFailure {
        index,
        url: Some(entry.url.clone()),
        kind: FailureKind::StoreWrite,
        message: format!("{err:#}"),
    })?;
    Ok(Some(written))
}

fn partial_import_summary(report: &MigrationReport) -> String {
    format!(
        "partial import: {} of {} items failed, {} written",
        report.items_failed, report.items_seen, report.items_written
    )
}

fn print_report(report: &MigrationReport) {
    println!(
        "status={} dry_run={} policy={}",
        report.status.as_str(),
        if report.dry_run { "yes" } else { "no" },
        report.failure_policy.as_str()
    );
    println!(
        "items_seen={} items_written={} items_failed={}",
        report.items_seen, report.items_written, report.items_failed
    );

    if let Some(close_error) = &report.close_error {
        println!("close_error={close_error}");
    }

    if report.failures.is_empty() {
        return;
    }

    println!("{:<8} {:<16} {:<40} message", "item", "kind", "url");
    println!("{}", "-".repeat(100));
    for failure in &report.failures {
        println!(
            "{:<8} {:<16} {:<40} {}",
            failure.index,
            failure.kind.as_str(),
            failure.url.as_deref().unwrap_or("-"),
            failure.message
        );
    }
}
