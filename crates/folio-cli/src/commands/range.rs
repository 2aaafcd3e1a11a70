//! `folio range register|list|status`

use anyhow::{Context, Result};
use chrono::{Months, Utc};
use std::path::Path;

use super::{parse_time, CmdContext, EXIT_SUCCESS};
use crate::args::{ListArgs, RegisterArgs, StatusArgs, StatusFilter};
use folio_core::{ArtifactVerifier, Ed25519ArtifactVerifier, NewRange, RangeFilter, RangeStatus};

pub fn cmd_register(ctx: &CmdContext, args: RegisterArgs) -> Result<i32> {
    let new = match &args.artifact {
        Some(path) => range_from_artifact(ctx, &args, path)?,
        None => range_from_bounds(ctx, &args)?,
    };

    let engine = ctx.open_engine()?;
    let range = engine.registry().register_range(new)?;

    ctx.emit(&range, |r| {
        println!(
            "registered {} {}/{} {}..={} (expires {})",
            r.range_id,
            r.issuer,
            r.doc_type,
            r.start,
            r.end,
            r.expires_at.format("%Y-%m-%d")
        );
    })?;
    Ok(EXIT_SUCCESS)
}

fn range_from_bounds(ctx: &CmdContext, args: &RegisterArgs) -> Result<NewRange> {
    let start = args.start.context("--start is required")?;
    let end = args.end.context("--end is required")?;

    let authorized_at = match &args.authorized_at {
        Some(value) => parse_time(value, false)?,
        None => Utc::now(),
    };
    let expires_at = match &args.expires_at {
        Some(value) => parse_time(value, false)?,
        None => authorized_at
            .checked_add_months(Months::new(ctx.config.validity_months))
            .context("expiry date out of range")?,
    };

    Ok(NewRange::new(
        &args.series.issuer,
        &args.series.doc_type,
        start,
        end,
        authorized_at,
        expires_at,
    ))
}

fn range_from_artifact(ctx: &CmdContext, args: &RegisterArgs, path: &Path) -> Result<NewRange> {
    let raw = std::fs::read(path)
        .with_context(|| format!("failed to read artifact {}", path.display()))?;

    let mut keys = ctx.config.trusted_keys.clone();
    keys.extend(args.trusted_keys.iter().cloned());
    let verifier = Ed25519ArtifactVerifier::from_pem_files(&keys, ctx.config.validity_months)?;
    if verifier.trusted_key_ids().is_empty() {
        anyhow::bail!("no trusted keys configured (use --trusted-key or trusted_keys in config)");
    }

    let verified = verifier.verify(&raw, &args.series.issuer, &args.series.doc_type, Utc::now())?;
    Ok(NewRange::new(
        verified.issuer,
        verified.doc_type,
        verified.start,
        verified.end,
        verified.authorized_at,
        verified.expires_at,
    )
    .with_artifact_hash(verified.hash))
}

pub fn cmd_list(ctx: &CmdContext, args: ListArgs) -> Result<i32> {
    let engine = ctx.open_engine()?;
    let filter = RangeFilter {
        issuer: args.issuer,
        doc_type: args.doc_type,
        status: args.status.map(|s| match s {
            StatusFilter::Active => RangeStatus::Active,
            StatusFilter::Expired => RangeStatus::Expired,
            StatusFilter::Exhausted => RangeStatus::Exhausted,
        }),
    };
    let ranges = engine.registry().list_ranges(&filter)?;

    ctx.emit(&ranges, |ranges| {
        if ranges.is_empty() {
            println!("no ranges");
            return;
        }
        println!(
            "{:<36}  {:<12} {:<4} {:>10} {:>10}  {:<9}  EXPIRES",
            "RANGE", "ISSUER", "TYPE", "START", "END", "STATUS"
        );
        for r in ranges {
            println!(
                "{:<36}  {:<12} {:<4} {:>10} {:>10}  {:<9}  {}",
                r.range_id,
                r.issuer,
                r.doc_type,
                r.start,
                r.end,
                r.status.as_str(),
                r.expires_at.format("%Y-%m-%d")
            );
        }
    })?;
    Ok(EXIT_SUCCESS)
}

pub fn cmd_status(ctx: &CmdContext, args: StatusArgs) -> Result<i32> {
    let engine = ctx.open_engine()?;
    let report =
        engine
            .registry()
            .range_status(&args.range_id, Utc::now(), ctx.config.near_expiry_days)?;

    ctx.emit(&report, |r| {
        println!("range:     {}", r.range.range_id);
        println!("series:    {}/{}", r.range.issuer, r.range.doc_type);
        println!("numbers:   {}..={}", r.range.start, r.range.end);
        println!("status:    {}", r.range.status.as_str());
        println!("validity:  {:?} ({} days left)", r.validity, r.days_to_expiry);
        println!(
            "folios:    {} available, {} used, {} void",
            r.available, r.used, r.voided
        );
    })?;
    Ok(EXIT_SUCCESS)
}
