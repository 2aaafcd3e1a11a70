//! `folio replenish|requests`

use anyhow::Result;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::{CmdContext, EXIT_SUCCESS};
use crate::args::{ReplenishArgs, SeriesArgs};
use folio_core::{
    AuthorizationRange, LockService, PollOutcome, ReplenishmentRequest, TriggerOutcome,
};

#[derive(Serialize, Default)]
struct ReplenishOutput {
    outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    remaining: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    request: Option<ReplenishmentRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    range: Option<AuthorizationRange>,
}

pub async fn cmd_replenish(ctx: &CmdContext, args: ReplenishArgs) -> Result<i32> {
    let engine = ctx.open_engine()?;
    let (issuer, doc_type) = (&args.series.issuer, &args.series.doc_type);
    let threshold = args.threshold.unwrap_or(ctx.config.low_water_threshold);

    let (request, lease) = match engine
        .monitor()
        .trigger_if_low(issuer, doc_type, threshold)
        .await?
    {
        TriggerOutcome::AlreadyInFlight => {
            let output = ReplenishOutput {
                outcome: "ALREADY_IN_FLIGHT",
                ..ReplenishOutput::default()
            };
            ctx.emit(&output, |_| {
                println!("replenishment for {issuer}/{doc_type} is already in flight");
            })?;
            return Ok(EXIT_SUCCESS);
        }
        TriggerOutcome::AboveThreshold { remaining } => {
            let output = ReplenishOutput {
                outcome: "ABOVE_THRESHOLD",
                remaining: Some(remaining),
                ..ReplenishOutput::default()
            };
            ctx.emit(&output, |_| {
                println!("{remaining} folios left for {issuer}/{doc_type}, above {threshold}");
            })?;
            return Ok(EXIT_SUCCESS);
        }
        TriggerOutcome::Submitted { request, lease }
        | TriggerOutcome::PendingExists { request, lease } => (request, lease),
    };

    if args.no_wait {
        engine.locks().release(&lease)?;
        let output = ReplenishOutput {
            outcome: "PENDING",
            request: Some(request),
            ..ReplenishOutput::default()
        };
        ctx.emit(&output, |o| {
            if let Some(r) = &o.request {
                println!(
                    "request {} for {}..={} is pending",
                    r.tracking_id, r.start, r.end
                );
            }
        })?;
        return Ok(EXIT_SUCCESS);
    }

    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_ctrl_c.cancel();
        }
    });

    eprintln!(
        "polling request {} every {}s (Ctrl-C to stop)",
        request.tracking_id, ctx.config.poll_interval_secs
    );
    let outcome = engine
        .monitor()
        .poll_with_lease(request.clone(), lease, ctx.config.poll_interval(), &cancel)
        .await?;

    let output = match outcome {
        PollOutcome::Ingested { request, range } => ReplenishOutput {
            outcome: "INGESTED",
            request: Some(request),
            range: Some(range),
            ..ReplenishOutput::default()
        },
        PollOutcome::AlreadyResolved { request } => ReplenishOutput {
            outcome: "ALREADY_RESOLVED",
            request: Some(request),
            ..ReplenishOutput::default()
        },
        PollOutcome::Cancelled => ReplenishOutput {
            outcome: "CANCELLED",
            request: Some(request),
            ..ReplenishOutput::default()
        },
    };
    ctx.emit(&output, |o| match (&o.range, &o.request) {
        (Some(range), _) => println!(
            "ingested range {} {}..={} (expires {})",
            range.range_id,
            range.start,
            range.end,
            range.expires_at.format("%Y-%m-%d")
        ),
        (None, Some(r)) => println!("request {} is {}", r.tracking_id, r.status.as_str()),
        (None, None) => {}
    })?;
    Ok(EXIT_SUCCESS)
}

pub fn cmd_requests(ctx: &CmdContext, args: SeriesArgs) -> Result<i32> {
    let engine = ctx.open_engine()?;
    let requests = engine.requests().list_for(&args.issuer, &args.doc_type)?;

    ctx.emit(&requests, |requests| {
        if requests.is_empty() {
            println!("no requests");
            return;
        }
        for r in requests {
            println!(
                "{:<24} {:>10}..={:<10} {:<9} {} {}",
                r.tracking_id,
                r.start,
                r.end,
                r.status.as_str(),
                r.requested_at.format("%Y-%m-%d %H:%M"),
                r.reason.as_deref().unwrap_or("")
            );
        }
    })?;
    Ok(EXIT_SUCCESS)
}
