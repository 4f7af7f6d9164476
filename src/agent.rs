use std::{
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use tracing::debug;

use crate::detectors::{
    analyzer::GoldenFile,
    mapper::map_exchanges,
    observer::load_capture,
    style::StyleGuide,
};
use crate::error::InputError;
use crate::state::EntryKind;
use crate::testgen::intent::TestIntent;

#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Style and few-shot sources taken from golden inputs, shared with
/// observer runs when both kinds are given in one batch.
#[derive(Debug, Clone, Default)]
pub struct GoldenContext {
    pub style: Arc<StyleGuide>,
    pub sources: Arc<Vec<String>>,
}

impl GoldenContext {
    pub fn from_files(files: &[GoldenFile]) -> Self {
        Self {
            style: Arc::new(StyleGuide::from_golden(files)),
            sources: Arc::new(files.iter().map(|f| f.source.clone()).collect()),
        }
    }
}

/// What the extracting stage hands to generation. Same shape whichever
/// pipeline produced it.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub intents: Vec<Arc<TestIntent>>,
    pub style: Arc<StyleGuide>,
    pub golden_sources: Arc<Vec<String>>,
    /// Auth schemes seen in traffic (`bearer`, `api_key`, ...).
    pub auth_patterns: Vec<String>,
    /// Per-item problems that did not stop extraction.
    pub diagnostics: Vec<String>,
}

/// Extraction handler, picked by entry kind.
#[derive(Debug, Clone)]
pub enum Extractor {
    Golden,
    Observed { golden: Option<GoldenContext> },
}

impl Extractor {
    pub fn for_entry(entry: EntryKind, golden: Option<GoldenContext>) -> Self {
        match entry {
            EntryKind::Golden => Extractor::Golden,
            EntryKind::Observed => Extractor::Observed { golden },
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Extractor::Golden => "analyzer",
            Extractor::Observed { .. } => "observer",
        }
    }

    pub fn run(&self, input: &Path) -> Result<Extraction, InputError> {
        match self {
            Extractor::Golden => {
                let file = GoldenFile::load(input)?;
                let intents = file.intents();
                debug!(
                    input = %input.display(),
                    tests = file.tests.len(),
                    intents = intents.len(),
                    "golden file analyzed"
                );
                let ctx = GoldenContext::from_files(std::slice::from_ref(&file));
                Ok(Extraction {
                    intents,
                    style: ctx.style,
                    golden_sources: ctx.sources,
                    auth_patterns: Vec::new(),
                    diagnostics: Vec::new(),
                })
            }
            Extractor::Observed { golden } => {
                let observation = load_capture(input)?;
                let map = map_exchanges(&observation.capture, &observation.exchanges);
                debug!(
                    input = %input.display(),
                    exchanges = observation.exchanges.len(),
                    skipped = observation.skipped.len(),
                    intents = map.intents.len(),
                    "capture mapped"
                );
                let golden = golden.clone().unwrap_or_default();
                Ok(Extraction {
                    intents: map.intents,
                    style: golden.style,
                    golden_sources: golden.sources,
                    auth_patterns: map.auth_patterns,
                    diagnostics: observation.skipped.iter().map(|e| e.to_string()).collect(),
                })
            }
        }
    }
}
