use std::path::Path;

use anyhow::bail;
use clap::Parser;

mod backup;
mod cli;
mod config;
mod eid;
mod engine;
mod lock;
mod records;
mod rules;
mod semantic;
mod sessions;
mod storage;
#[cfg(test)]
mod tests;
mod web;

use cli::{RulesArgs, SessionArgs};
use eid::Eid;
use engine::{dispatch, Command, Engine, EngineFactory};
use inquire::error::InquireResult;
use records::{parse_keywords, RecordDraft};
use rules::RuleKind;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
        .init();

    let args = cli::Args::parse();

    // backup and restore operate on the dataset files directly, without
    // assembling an engine
    match &args.command {
        cli::Command::Backup { output } => {
            let base_path = EngineFactory::base_path()?;
            return backup::create_backup(output.clone(), Path::new(&base_path));
        }
        cli::Command::Restore { path, yes } => {
            let base_path = EngineFactory::base_path()?;
            std::fs::create_dir_all(&base_path)?;

            // restore writes the dataset, so it takes the writer lock
            let _lock = lock::FileLock::try_acquire(Path::new(&base_path))?;
            return backup::import_backup(path.as_deref(), *yes, Path::new(&base_path));
        }
        _ => {}
    }

    let engine = EngineFactory::create()?;

    match args.command {
        cli::Command::Daemon {} => {
            web::start_daemon(engine);
            Ok(())
        }

        cli::Command::Capture {
            url,
            title,
            body,
            keywords,
            session,
            timestamp,
        } => run(
            &engine,
            Command::Capture {
                record: RecordDraft {
                    url,
                    title: title.unwrap_or_default(),
                    body: body.unwrap_or_default(),
                    timestamp_ms: timestamp,
                    keywords: keywords.map(parse_keywords).unwrap_or_default(),
                    session_id: session,
                    tab_ref: None,
                },
            },
        ),

        cli::Command::Search {
            query,
            limit,
            threshold,
        } => run(
            &engine,
            Command::Search {
                query,
                limit,
                threshold,
            },
        ),

        cli::Command::Neighbors { id, limit } => run(&engine, Command::Neighbors { id, limit }),

        cli::Command::Forget {
            domain,
            date_range,
            yes,
        } => {
            let what = match (&domain, &date_range) {
                (Some(domain), None) => format!("every record from {domain}"),
                (None, Some(range)) => format!("every record in {range}"),
                _ => bail!("forget requires exactly one of --domain or --date-range"),
            };

            if !yes {
                match inquire::prompt_confirmation(format!(
                    "Delete {what}, along with its vectors and edges?"
                )) {
                    InquireResult::Ok(true) => {}
                    InquireResult::Ok(false) => return Ok(()),
                    InquireResult::Err(err) => bail!("An error occurred: {}", err),
                }
            }

            run(&engine, Command::Forget { domain, date_range })
        }

        cli::Command::Export {} => run(&engine, Command::Export),

        cli::Command::Sessions { action } => match action {
            SessionArgs::Diff { a, b } => run(&engine, Command::DiffSessions { a, b }),
            SessionArgs::Merge { a, b } => run(&engine, Command::MergeSessions { a, b }),
        },

        cli::Command::Rules { action } => match action {
            RulesArgs::Add { kind, value } => {
                let kind = match kind.as_str() {
                    "domain" => RuleKind::Domain,
                    "date" => RuleKind::Date,
                    "keyword" => RuleKind::Keyword,
                    other => bail!("unknown rule kind {other:?}, expected domain, date or keyword"),
                };
                run(&engine, Command::AddRule { kind, value })
            }
            RulesArgs::Delete { id } => run(&engine, Command::DeleteRule { id: Eid::from(id) }),
            RulesArgs::List {} => run(&engine, Command::ListRules),
            RulesArgs::Toggle { id } => run(&engine, Command::ToggleRule { id: Eid::from(id) }),
        },

        cli::Command::Stats {} => run(&engine, Command::Stats),

        cli::Command::Reindex {} => {
            let report = engine.reindex()?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }

        // handled before the engine was assembled
        cli::Command::Backup { .. } | cli::Command::Restore { .. } => unreachable!(),
    }
}

/// Run one command against the engine and print its payload.
fn run(engine: &Engine, command: Command) -> anyhow::Result<()> {
    let response = dispatch(engine, command);

    if !response.success {
        bail!(response.error.unwrap_or_else(|| "command failed".to_string()));
    }
    if let Some(data) = response.data {
        println!("{}", serde_json::to_string_pretty(&data)?);
    }
    Ok(())
}
