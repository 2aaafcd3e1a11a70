use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "folio",
    version,
    about = "Folio allocation and authorization-range lifecycle"
)]
pub struct Cli {
    /// YAML configuration file
    #[arg(long, global = true, env = "FOLIO_CONFIG")]
    pub config: Option<PathBuf>,

    /// SQLite database (overrides config and FOLIO_DATABASE)
    #[arg(long, global = true)]
    pub database: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Manage authorization ranges
    Range(RangeArgs),
    /// Assign the next folio of a series
    Assign(AssignArgs),
    /// Attach a document to a used folio
    Bind(BindArgs),
    /// Void an unused folio
    Void(VoidArgs),
    /// Show one folio
    Show(FolioRef),
    /// Expire ranges and raise validity alerts
    Sweep,
    /// Usage report for a period
    Report(ReportArgs),
    /// Request a new range if the series is low, then poll it
    Replenish(ReplenishArgs),
    /// List replenishment requests of a series
    Requests(SeriesArgs),
    /// Run the replenishment worker and validity watcher until Ctrl-C
    Serve,
}

#[derive(Args, Debug, Clone)]
pub struct SeriesArgs {
    /// Issuer tax id
    #[arg(long)]
    pub issuer: String,

    /// Document type code
    #[arg(long)]
    pub doc_type: String,
}

#[derive(Args, Debug)]
pub struct RangeArgs {
    #[command(subcommand)]
    pub cmd: RangeCmd,
}

#[derive(Subcommand, Debug)]
pub enum RangeCmd {
    /// Register a range from explicit bounds or a signed artifact
    Register(RegisterArgs),
    /// List ranges
    List(ListArgs),
    /// Validity and folio counts of one range
    Status(StatusArgs),
}

#[derive(Args, Debug)]
pub struct RegisterArgs {
    #[command(flatten)]
    pub series: SeriesArgs,

    /// First folio number (inclusive)
    #[arg(long, required_unless_present = "artifact", conflicts_with = "artifact")]
    pub start: Option<u64>,

    /// Last folio number (inclusive)
    #[arg(long, required_unless_present = "artifact", conflicts_with = "artifact")]
    pub end: Option<u64>,

    /// Authorization date (RFC 3339 or YYYY-MM-DD, default: now)
    #[arg(long, conflicts_with = "artifact")]
    pub authorized_at: Option<String>,

    /// Expiry date (default: authorization date plus the configured validity)
    #[arg(long, conflicts_with = "artifact")]
    pub expires_at: Option<String>,

    /// Signed authorization artifact (JSON)
    #[arg(long)]
    pub artifact: Option<PathBuf>,

    /// Additional trusted public key (PEM), repeatable
    #[arg(long = "trusted-key")]
    pub trusted_keys: Vec<PathBuf>,
}

#[derive(Args, Debug)]
pub struct ListArgs {
    #[arg(long)]
    pub issuer: Option<String>,

    #[arg(long)]
    pub doc_type: Option<String>,

    #[arg(long, value_enum)]
    pub status: Option<StatusFilter>,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum StatusFilter {
    Active,
    Expired,
    Exhausted,
}

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Range id
    pub range_id: String,
}

#[derive(Args, Debug)]
pub struct AssignArgs {
    #[command(flatten)]
    pub series: SeriesArgs,

    /// Bind the folio to this document in the same step
    #[arg(long)]
    pub document_id: Option<String>,
}

#[derive(Args, Debug)]
pub struct FolioRef {
    #[command(flatten)]
    pub series: SeriesArgs,

    #[arg(long)]
    pub number: u64,
}

#[derive(Args, Debug)]
pub struct BindArgs {
    #[command(flatten)]
    pub folio: FolioRef,

    #[arg(long)]
    pub document_id: String,
}

#[derive(Args, Debug)]
pub struct VoidArgs {
    #[command(flatten)]
    pub folio: FolioRef,

    #[arg(long)]
    pub reason: String,
}

#[derive(Args, Debug)]
pub struct ReportArgs {
    #[command(flatten)]
    pub series: SeriesArgs,

    /// Period start (RFC 3339 or YYYY-MM-DD)
    #[arg(long)]
    pub from: String,

    /// Period end (RFC 3339 or YYYY-MM-DD, inclusive)
    #[arg(long)]
    pub to: String,

    /// Output format; `csv` lists the period's folios and ignores `--json`
    #[arg(long, value_enum, default_value_t = ReportFormat::Text)]
    pub format: ReportFormat,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    Text,
    Csv,
}

#[derive(Args, Debug)]
pub struct ReplenishArgs {
    #[command(flatten)]
    pub series: SeriesArgs,

    /// Low-water mark (default: configured threshold)
    #[arg(long)]
    pub threshold: Option<u64>,

    /// Submit and return without polling; `serve` resumes the request
    #[arg(long)]
    pub no_wait: bool,
}
