//! `folio assign|bind|void|show`

use anyhow::Result;
use serde::Serialize;

use super::{CmdContext, EXIT_SUCCESS};
use crate::args::{AssignArgs, BindArgs, FolioRef, VoidArgs};
use folio_core::Folio;

#[derive(Serialize)]
struct AssignOutput {
    folio: Folio,
    remaining: u64,
    range_exhausted: bool,
}

pub fn cmd_assign(ctx: &CmdContext, args: AssignArgs) -> Result<i32> {
    let engine = ctx.open_engine()?;
    let (issuer, doc_type) = (&args.series.issuer, &args.series.doc_type);
    let assignment = match &args.document_id {
        Some(document_id) => {
            engine
                .allocator()
                .assign_next_for_document(issuer, doc_type, document_id)?
        }
        None => engine.allocator().assign_next(issuer, doc_type)?,
    };

    let output = AssignOutput {
        folio: assignment.folio,
        remaining: assignment.remaining,
        range_exhausted: assignment.range_exhausted,
    };
    ctx.emit(&output, |o| {
        println!("{}", o.folio.number);
        if o.remaining <= ctx.config.low_water_threshold {
            eprintln!("warning: {} folios left for {issuer}/{doc_type}", o.remaining);
        }
    })?;
    Ok(EXIT_SUCCESS)
}

pub fn cmd_bind(ctx: &CmdContext, args: BindArgs) -> Result<i32> {
    let engine = ctx.open_engine()?;
    let f = &args.folio;
    let folio = engine.folios().bind_document(
        &f.series.issuer,
        &f.series.doc_type,
        f.number,
        &args.document_id,
    )?;
    ctx.emit(&folio, print_folio)?;
    Ok(EXIT_SUCCESS)
}

pub fn cmd_void(ctx: &CmdContext, args: VoidArgs) -> Result<i32> {
    let engine = ctx.open_engine()?;
    let f = &args.folio;
    let folio =
        engine
            .folios()
            .void_folio(&f.series.issuer, &f.series.doc_type, f.number, &args.reason)?;
    ctx.emit(&folio, print_folio)?;
    Ok(EXIT_SUCCESS)
}

pub fn cmd_show(ctx: &CmdContext, args: FolioRef) -> Result<i32> {
    let engine = ctx.open_engine()?;
    let folio = engine
        .folios()
        .get_folio(&args.series.issuer, &args.series.doc_type, args.number)?;
    ctx.emit(&folio, print_folio)?;
    Ok(EXIT_SUCCESS)
}

fn print_folio(folio: &Folio) {
    println!("folio:     {}/{}/{}", folio.issuer, folio.doc_type, folio.number);
    println!("status:    {}", folio.status.as_str());
    println!("range:     {}", folio.range_id);
    if let Some(used_at) = folio.used_at {
        println!("used at:   {}", used_at.to_rfc3339());
    }
    if let Some(document_id) = &folio.document_id {
        println!("document:  {document_id}");
    }
    if let Some(voided_at) = folio.voided_at {
        println!("voided at: {}", voided_at.to_rfc3339());
    }
    if let Some(reason) = &folio.void_reason {
        println!("reason:    {reason}");
    }
}
