//! `folio sweep|report`

use anyhow::Result;

use super::{parse_time, CmdContext, EXIT_SUCCESS};
use crate::args::{ReportArgs, ReportFormat};
use folio_core::{Folio, UsageReport};

pub fn cmd_sweep(ctx: &CmdContext) -> Result<i32> {
    let engine = ctx.open_engine()?;
    let report = engine.watcher().sweep()?;

    ctx.emit(&report, |r| {
        println!(
            "checked {} active ranges: {} expired, {} near expiry",
            r.checked,
            r.expired.len(),
            r.near_expiry_alerted.len()
        );
        for id in &r.expired {
            println!("  expired      {id}");
        }
        for id in &r.near_expiry_alerted {
            println!("  near expiry  {id}");
        }
        for series in &r.replenish_triggered {
            println!("  replenish    {series} (run `folio replenish` or `folio serve`)");
        }
    })?;
    Ok(EXIT_SUCCESS)
}

pub fn cmd_report(ctx: &CmdContext, args: ReportArgs) -> Result<i32> {
    let from = parse_time(&args.from, false)?;
    let to = parse_time(&args.to, true)?;

    let engine = ctx.open_engine()?;
    let report =
        engine
            .folios()
            .usage_report(&args.series.issuer, &args.series.doc_type, from, to)?;

    if args.format == ReportFormat::Csv {
        print!("{}", report_csv(&report));
        return Ok(EXIT_SUCCESS);
    }

    ctx.emit(&report, |r| {
        println!(
            "{}/{} from {} to {}: {} used, {} void",
            r.issuer,
            r.doc_type,
            r.from.format("%Y-%m-%d"),
            r.to.format("%Y-%m-%d"),
            r.used,
            r.voided
        );
        for f in &r.folios {
            let detail = f
                .document_id
                .as_deref()
                .or(f.void_reason.as_deref())
                .unwrap_or("-");
            println!("  {:>10}  {:<5}  {detail}", f.number, f.status.as_str());
        }
        for range in &r.active_ranges {
            println!(
                "  range {} {}..={} expires {}: {} available, {} used, {} void",
                range.range_id,
                range.start,
                range.end,
                range.expires_at.format("%Y-%m-%d"),
                range.available,
                range.used,
                range.voided
            );
        }
    })?;
    Ok(EXIT_SUCCESS)
}

const CSV_COLUMNS: [&str; 8] = [
    "issuer",
    "doc_type",
    "number",
    "status",
    "range_id",
    "at",
    "document_id",
    "void_reason",
];

/// One row per folio used or voided in the period.
fn report_csv(report: &UsageReport) -> String {
    let mut output = CSV_COLUMNS.join(",");
    output.push('\n');
    for folio in &report.folios {
        output.push_str(&csv_row(folio).join(","));
        output.push('\n');
    }
    output
}

fn csv_row(folio: &Folio) -> Vec<String> {
    let at = folio
        .used_at
        .or(folio.voided_at)
        .map(|t| t.to_rfc3339())
        .unwrap_or_default();
    [
        folio.issuer.clone(),
        folio.doc_type.clone(),
        folio.number.to_string(),
        folio.status.as_str().to_string(),
        folio.range_id.clone(),
        at,
        folio.document_id.clone().unwrap_or_default(),
        folio.void_reason.clone().unwrap_or_default(),
    ]
    .iter()
    .map(|cell| csv_escape(cell))
    .collect()
}

fn csv_escape(cell: &str) -> String {
    if cell.contains(',') || cell.contains('"') || cell.contains('\n') {
        format!("\"{}\"", cell.replace('"', "\"\""))
    } else {
        cell.to_string()
    }
}
