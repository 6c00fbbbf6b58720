mod args;

use std::{
    fs::File,
    io::{BufReader, Write},
    sync::atomic::AtomicBool,
};

use anyhow::{anyhow, bail, Context, Result};
use serde_derive::*;
use tracing::info;

use args::Args;
use thermal_roi::{
    batch::{apply_session, BatchOptions, BatchOutcome},
    cli::{init_logging, progress_bar},
    exif::read_exiftool_json,
    CalibrationParameters, SessionStore,
};

fn main() -> Result<()> {
    init_logging();
    let args = Args::from_cmd_line()?;

    let session = SessionStore::new(&args.session)
        .load(&CalibrationParameters::default())?
        .ok_or_else(|| anyhow!("no session file at {}", args.session.display()))?;

    let mut captures = vec![];
    for path in &args.paths {
        let file = File::open(path).with_context(|| format!("could not open {}", path))?;
        let parsed = read_exiftool_json(BufReader::new(file))
            .with_context(|| format!("could not parse {}", path))?;
        captures.extend(parsed);
    }
    info!(images = captures.len(), rois = session.rois.len(), "starting");

    let abort = AtomicBool::new(false);
    let bar = progress_bar(captures.len());
    let outcomes = apply_session(
        &session,
        captures,
        BatchOptions {
            abort_on_error: args.abort_on_error,
        },
        &abort,
        &bar,
    );

    let failed = outcomes
        .iter()
        .filter(|o| matches!(o, BatchOutcome::Failed { .. }))
        .count();

    #[derive(Debug, Serialize)]
    struct OutputJson<'a> {
        session: String,
        images: &'a [BatchOutcome],
        failed: usize,
    }
    let output = OutputJson {
        session: args.session.display().to_string(),
        images: &outcomes,
        failed,
    };

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    if args.pretty {
        serde_json::to_writer_pretty(&mut out, &output)?;
    } else {
        serde_json::to_writer(&mut out, &output)?;
    }
    writeln!(out)?;

    if failed > 0 {
        bail!("{} of {} images failed", failed, outcomes.len());
    }
    Ok(())
}
