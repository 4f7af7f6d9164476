//! orchestrator.rs
//!
//! Batch driver: discovers inputs, then runs one `RunMachine` per input on
//! a bounded worker pool. Runs are independent; a bad input only fails its
//! own run.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::thread;

use crossbeam_channel::unbounded;
use glob::glob as glob_fn;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::agent::{CancelToken, Extractor, GoldenContext};
use crate::context::ForgeContext;
use crate::detectors::analyzer::GoldenFile;
use crate::machine::RunMachine;
use crate::state::{EntryKind, PipelineRun, Stage};

const WALK_DEPTH: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct BatchInput {
    pub path: PathBuf,
    pub entry: EntryKind,
}

#[derive(Debug, Default)]
pub struct Discovery {
    pub inputs: Vec<BatchInput>,
    /// Arguments that matched nothing usable.
    pub diagnostics: Vec<String>,
}

/// Files, directories (walked) and glob patterns to a sorted input list.
pub fn discover(args: &[String]) -> Discovery {
    let mut found: BTreeSet<BatchInput> = BTreeSet::new();
    let mut diagnostics = Vec::new();

    for arg in args {
        let path = Path::new(arg);
        if path.is_file() {
            match EntryKind::for_path(path) {
                Some(entry) => {
                    found.insert(BatchInput {
                        path: path.to_path_buf(),
                        entry,
                    });
                }
                None => diagnostics.push(format!("{arg}: unsupported input type")),
            }
        } else if path.is_dir() {
            let before = found.len();
            for entry in WalkDir::new(path)
                .max_depth(WALK_DEPTH)
                .into_iter()
                .filter_map(Result::ok)
            {
                if !entry.file_type().is_file() {
                    continue;
                }
                if let Some(input) = walked_input(entry.path()) {
                    found.insert(input);
                }
            }
            if found.len() == before {
                diagnostics.push(format!("{arg}: no golden tests or captures found"));
            }
        } else {
            match glob_fn(arg) {
                Ok(paths) => {
                    let before = found.len();
                    for p in paths.filter_map(Result::ok).filter(|p| p.is_file()) {
                        if let Some(entry) = EntryKind::for_path(&p) {
                            found.insert(BatchInput { path: p, entry });
                        }
                    }
                    if found.len() == before {
                        diagnostics.push(format!("{arg}: matched nothing"));
                    }
                }
                Err(e) => diagnostics.push(format!("{arg}: {e}")),
            }
        }
    }

    Discovery {
        inputs: found.into_iter().collect(),
        diagnostics,
    }
}

/// Inside directories only test modules and capture files count.
fn walked_input(path: &Path) -> Option<BatchInput> {
    let name = path.file_name()?.to_str()?;
    let entry = EntryKind::for_path(path)?;
    let keep = match entry {
        EntryKind::Golden => name.starts_with("test_") || name.ends_with("_test.py"),
        EntryKind::Observed => {
            name.ends_with(".har") || name.ends_with(".jsonl") || name.ends_with(".ndjson")
        }
    };
    keep.then(|| BatchInput {
        path: path.to_path_buf(),
        entry,
    })
}

pub struct Orchestrator<'a> {
    ctx: &'a ForgeContext,
}

impl<'a> Orchestrator<'a> {
    pub fn new(ctx: &'a ForgeContext) -> Self {
        Self { ctx }
    }

    /// Drive every input to a terminal stage. Results keep input order.
    pub fn run_batch(&self, inputs: Vec<BatchInput>, execute: bool) -> Vec<PipelineRun> {
        if inputs.is_empty() {
            return Vec::new();
        }

        let golden = self.golden_context(&inputs);
        let workers = self.ctx.config.pipeline.max_parallel_runs.min(inputs.len()).max(1);
        let total = inputs.len();
        info!(runs = total, workers, execute, "batch started");

        let (job_tx, job_rx) = unbounded::<(usize, BatchInput)>();
        let (done_tx, done_rx) = unbounded::<(usize, PipelineRun)>();
        for job in inputs.into_iter().enumerate() {
            let _ = job_tx.send(job);
        }
        drop(job_tx);

        thread::scope(|s| {
            for w in 0..workers {
                let job_rx = job_rx.clone();
                let done_tx = done_tx.clone();
                let golden = golden.clone();
                s.spawn(move || {
                    for (i, input) in job_rx.iter() {
                        debug!(worker = w, input = %input.path.display(), "run picked up");
                        let extractor = Extractor::for_entry(input.entry, golden.clone());
                        let run = RunMachine::new(
                            self.ctx,
                            input.entry,
                            input.path,
                            extractor,
                            CancelToken::new(),
                            execute,
                        )
                        .drive();
                        let _ = done_tx.send((i, run));
                    }
                });
            }
        });
        drop(done_tx);

        let mut results: Vec<(usize, PipelineRun)> = done_rx.iter().collect();
        results.sort_by_key(|(i, _)| *i);
        let runs: Vec<PipelineRun> = results.into_iter().map(|(_, r)| r).collect();

        let accepted = runs.iter().filter(|r| r.stage() == Stage::Accepted).count();
        info!(runs = runs.len(), accepted, "batch finished");
        runs
    }

    /// Style and examples from every golden input, for observer runs.
    fn golden_context(&self, inputs: &[BatchInput]) -> Option<GoldenContext> {
        if !inputs.iter().any(|i| i.entry == EntryKind::Observed) {
            return None;
        }
        let files: Vec<GoldenFile> = inputs
            .iter()
            .filter(|i| i.entry == EntryKind::Golden)
            .filter_map(|i| match GoldenFile::load(&i.path) {
                Ok(f) => Some(f),
                Err(e) => {
                    warn!(input = %i.path.display(), error = %e, "golden file left out of shared style");
                    None
                }
            })
            .collect();
        (!files.is_empty()).then(|| GoldenContext::from_files(&files))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn discovery_walks_dirs_and_expands_globs() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("suite/nested")).unwrap();
        fs::write(root.join("suite/test_users.py"), "").unwrap();
        fs::write(root.join("suite/nested/orders_test.py"), "").unwrap();
        fs::write(root.join("suite/helpers.py"), "").unwrap();
        fs::write(root.join("suite/traffic.har"), "{}").unwrap();
        fs::write(root.join("suite/package.json"), "{}").unwrap();
        fs::write(root.join("a.jsonl"), "").unwrap();
        fs::write(root.join("b.jsonl"), "").unwrap();
        fs::write(root.join("notes.txt"), "").unwrap();

        let args = vec![
            root.join("suite").display().to_string(),
            root.join("*.jsonl").display().to_string(),
            root.join("notes.txt").display().to_string(),
            root.join("missing-*.har").display().to_string(),
        ];
        let d = discover(&args);

        let names: Vec<String> = d
            .inputs
            .iter()
            .map(|i| i.path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 5, "{names:?}");
        assert!(names.contains(&"orders_test.py".to_string()));
        assert!(!names.contains(&"helpers.py".to_string()));
        assert!(!names.contains(&"package.json".to_string()));
        assert_eq!(d.diagnostics.len(), 2);
    }

    #[test]
    fn explicit_json_file_is_a_capture() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("export.json");
        fs::write(&p, "{}").unwrap();
        let d = discover(&[p.display().to_string()]);
        assert_eq!(d.inputs[0].entry, EntryKind::Observed);
    }

    #[test]
    fn same_path_golden_sorts_before_capture() {
        let a = BatchInput {
            path: "b/in".into(),
            entry: EntryKind::Observed,
        };
        let b = BatchInput {
            path: "b/in".into(),
            entry: EntryKind::Golden,
        };
        let c = BatchInput {
            path: "a/in".into(),
            entry: EntryKind::Observed,
        };
        let mut inputs = vec![a, b, c];
        inputs.sort();
        inputs.dedup();
        let order: Vec<(String, EntryKind)> = inputs
            .iter()
            .map(|i| (i.path.display().to_string(), i.entry))
            .collect();
        assert_eq!(
            order,
            vec![
                ("a/in".to_string(), EntryKind::Observed),
                ("b/in".to_string(), EntryKind::Golden),
                ("b/in".to_string(), EntryKind::Observed),
            ]
        );
    }
}
