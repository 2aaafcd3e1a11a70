mod folio;
mod range;
mod replenish;
mod report;
mod serve;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

use crate::args::{Cli, Command, RangeCmd};
use folio_core::{Collaborators, EngineConfig, FolioEngine};

pub const EXIT_SUCCESS: i32 = 0;

/// Global options every command needs.
pub struct CmdContext {
    pub config: EngineConfig,
    pub json: bool,
}

impl CmdContext {
    pub fn open_engine(&self) -> Result<FolioEngine> {
        let collaborators = Collaborators::from_config(&self.config)?;
        let engine = FolioEngine::open(self.config.clone(), collaborators).with_context(|| {
            format!(
                "failed to open folio database {}",
                self.config.database_path.display()
            )
        })?;
        Ok(engine)
    }

    /// Print `value` as JSON, or through `human` otherwise.
    pub fn emit<T: Serialize>(&self, value: &T, human: impl FnOnce(&T)) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            human(value);
        }
        Ok(())
    }
}

pub async fn dispatch(cli: Cli) -> Result<i32> {
    let ctx = CmdContext {
        config: load_config(&cli)?,
        json: cli.json,
    };

    match cli.cmd {
        Command::Range(args) => match args.cmd {
            RangeCmd::Register(a) => range::cmd_register(&ctx, a),
            RangeCmd::List(a) => range::cmd_list(&ctx, a),
            RangeCmd::Status(a) => range::cmd_status(&ctx, a),
        },
        Command::Assign(a) => folio::cmd_assign(&ctx, a),
        Command::Bind(a) => folio::cmd_bind(&ctx, a),
        Command::Void(a) => folio::cmd_void(&ctx, a),
        Command::Show(a) => folio::cmd_show(&ctx, a),
        Command::Sweep => report::cmd_sweep(&ctx),
        Command::Report(a) => report::cmd_report(&ctx, a),
        Command::Replenish(a) => replenish::cmd_replenish(&ctx, a).await,
        Command::Requests(a) => replenish::cmd_requests(&ctx, a),
        Command::Serve => serve::cmd_serve(&ctx).await,
    }
}

/// File config (or defaults), then `FOLIO_*` env, then `--database`.
fn load_config(cli: &Cli) -> Result<EngineConfig> {
    let base = match &cli.config {
        Some(path) => EngineConfig::from_yaml_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    let mut config = base.with_env_overrides();
    if let Some(path) = &cli.database {
        config = config.with_database_path(path);
    }
    config.validate()?;
    Ok(config)
}

/// Accepts RFC 3339 timestamps or plain dates. Plain dates mean the start of
/// the day, or its last millisecond when `end_of_day` is set.
pub fn parse_time(value: &str, end_of_day: bool) -> Result<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Ok(ts.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .with_context(|| format!("invalid date {value:?}: expected RFC 3339 or YYYY-MM-DD"))?;
    let time = if end_of_day {
        date.and_hms_milli_opt(23, 59, 59, 999)
    } else {
        date.and_hms_opt(0, 0, 0)
    };
    time.map(|t| t.and_utc())
        .with_context(|| format!("invalid date {value:?}"))
}
