use std::error::Error;
use std::fmt::Write as _;
use std::path::PathBuf;

use clap::Args;

use crate::config::ForgeConfig;
use crate::context::ForgeContext;
use crate::orchestrator::{discover, Orchestrator};
use crate::persistence::HistoryStore;
use crate::state::{PipelineRun, Stage};
use crate::testgen::materialize::export_candidate;

#[derive(Args, Debug, Clone)]
pub struct GenerateArgs {
    #[arg(
        required = true,
        help = "Golden test files (.py), captures (.har/.json/.jsonl), directories or glob patterns"
    )]
    pub paths: Vec<String>,

    #[arg(long, default_value_t = false, help = "Skip sandboxed execution; validate statically")]
    pub no_execute: bool,

    #[arg(long, help = "Write accepted test modules into this directory")]
    pub out: Option<PathBuf>,

    #[arg(long, help = "Override pipeline.max_retries")]
    pub max_retries: Option<u32>,
}

#[derive(Args, Debug, Clone)]
pub struct HistoryArgs {
    #[arg(long, default_value_t = 20, help = "Number of most recent runs to show")]
    pub limit: usize,
}

/// Returns whether every run was accepted.
pub fn run_generate(mut cfg: ForgeConfig, args: &GenerateArgs) -> Result<bool, Box<dyn Error>> {
    if let Some(n) = args.max_retries {
        cfg.pipeline.max_retries = n;
    }

    let discovery = discover(&args.paths);
    for d in &discovery.diagnostics {
        eprintln!("skipped: {d}");
    }
    if discovery.inputs.is_empty() {
        return Err("no usable inputs".into());
    }

    let ctx = ForgeContext::from_config(cfg)?;
    let orchestrator = Orchestrator::new(&ctx);
    let runs = orchestrator.run_batch(discovery.inputs, !args.no_execute);

    let mut all_accepted = true;
    for run in &runs {
        println!("{}", render_run(run));
        if run.stage() != Stage::Accepted {
            all_accepted = false;
            continue;
        }
        if let Some(out) = &args.out {
            let candidate = run.last_attempt().and_then(|a| a.candidate.as_ref());
            if let Some(candidate) = candidate {
                let stem = run
                    .input
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| run.id.to_string());
                let path = export_candidate(out, &stem, candidate)?;
                println!("  written: {}", path.display());
            }
        }
    }

    let accepted = runs.iter().filter(|r| r.stage() == Stage::Accepted).count();
    println!("{accepted}/{} run(s) accepted", runs.len());
    Ok(all_accepted)
}

pub fn run_history(cfg: &ForgeConfig, args: &HistoryArgs) -> Result<(), Box<dyn Error>> {
    let store = HistoryStore::from_config(&cfg.store);
    let records = store.load_latest(args.limit)?;
    if records.is_empty() {
        println!("no runs recorded in {}", store.path().display());
        return Ok(());
    }
    for rec in records {
        println!("{}  {}", rec.recorded_at.format("%Y-%m-%d %H:%M:%S"), render_run(&rec.run));
    }
    Ok(())
}

/// One block per run: id, entry, input, terminal stage, attempts, rationale.
pub fn render_run(run: &PipelineRun) -> String {
    let mut out = String::new();
    let _ = write!(
        out,
        "{}  {:<8}  {:<9}  attempts={}  {}",
        &run.id.to_string()[..8],
        format!("{:?}", run.entry).to_lowercase(),
        run.stage().to_string(),
        run.attempts().len(),
        run.input.display()
    );
    if let Some(r) = &run.rationale {
        for line in r.lines().take(6) {
            let _ = write!(out, "\n    {line}");
        }
    }
    for d in run.diagnostics.iter().take(3) {
        let _ = write!(out, "\n    ! {d}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::EntryKind;

    #[test]
    fn rendered_run_shows_stage_and_rationale() {
        let mut run = PipelineRun::new(EntryKind::Observed, "cap.har".into());
        run.advance(Stage::Extracting).unwrap();
        run.rationale = Some("capture had no entries".into());
        run.advance(Stage::Failed).unwrap();

        let text = render_run(&run);
        assert!(text.contains("observed"));
        assert!(text.contains("failed"));
        assert!(text.contains("attempts=0"));
        assert!(text.contains("capture had no entries"));
    }
}
