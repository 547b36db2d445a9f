//! CLI binary for edgequake-exam2json.
//!
//! A thin shim over the library crate: expands the inputs, maps CLI flags
//! to `ExtractionConfig`, runs a `BatchRunner` and writes the results.

use anyhow::{Context, Result};
use clap::Parser;
use edgequake_exam2json::{
    BatchRunner, Cropper, DocumentOutcome, ExamPaper, ExtractionConfig, ExtractionProgressCallback, FileCropper,
    Orchestrator, Phase, ProgressCallback,
};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// One bar over the question-extraction pages of every document in the
/// batch. Documents report concurrently, so the length grows as each one is
/// parsed.
struct CliProgressCallback {
    bar: ProgressBar,
    page_errors: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} pages  \
             ⏱ {elapsed_precise}  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);
        bar.set_style(style);
        bar.set_prefix("Extracting");
        bar.set_message("parsing…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            page_errors: AtomicUsize::new(0),
        })
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl ExtractionProgressCallback for CliProgressCallback {
    fn on_document_start(&self, document: &str, total_pages: usize) {
        self.bar.inc_length(total_pages as u64);
        self.bar.println(format!(
            "{} {}  {}",
            cyan("◆"),
            bold(document),
            dim(&format!("{total_pages} pages"))
        ));
    }

    fn on_phase_start(&self, document: &str, phase: Phase) {
        self.bar.set_message(format!("{document}: {phase}"));
    }

    fn on_page_complete(&self, _document: &str, phase: Phase, _page_num: usize, _total_pages: usize) {
        if phase == Phase::Questions {
            self.bar.inc(1);
        }
    }

    fn on_page_error(&self, document: &str, phase: Phase, page_num: usize, total_pages: usize, error: &str) {
        self.page_errors.fetch_add(1, Ordering::SeqCst);
        let msg: String = if error.chars().count() > 80 {
            error.chars().take(79).chain(std::iter::once('\u{2026}')).collect()
        } else {
            error.to_string()
        };
        self.bar.println(format!(
            "  {} {}  page {:>3}/{:<3} {:<9} {}",
            red("✗"),
            document,
            page_num,
            total_pages,
            dim(&phase.to_string()),
            red(&msg),
        ));
        if phase == Phase::Questions {
            self.bar.inc(1);
        }
    }

    fn on_document_complete(&self, document: &str, questions: usize, errors: usize) {
        let mark = if errors == 0 { green("✓") } else { cyan("⚠") };
        self.bar.println(format!(
            "  {} {}  {} questions  {}",
            mark,
            document,
            questions,
            dim(&format!("{errors} errors")),
        ));
    }

    fn on_document_failed(&self, document: &str, error: &str) {
        self.bar
            .println(format!("  {} {}  {}", red("✘"), document, red(error)));
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # One paper, results under ./output
  exam2json 2023_P6_Maths_SA2_Nanyang_Primary.pdf

  # A folder of papers, three at a time
  exam2json --parallel 3 papers/ -o extracted/

  # Questions only (no diagram crops, no answer key)
  exam2json --no-diagrams --no-answers paper.pdf

  # Diagram crops as PNG files instead of inline data URIs
  exam2json --diagram-files paper.pdf

  # Answer keys without a header ("ANSWERS", "MARKING SCHEME", ...)
  exam2json --classify-with-model paper.pdf

  # Print the extracted papers as JSON on stdout
  exam2json --json paper.pdf > paper.json

OUTPUT LAYOUT (-o DIR):
  DIR/<stem>_extracted.json        full paper: metadata, questions, metrics
  DIR/<stem>_answer_keys.json      every answer key read from the paper
  DIR/<stem>/q<number>.json        one file per top-level question
  DIR/diagrams/<question>_<id>.png with --diagram-files

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  GEMINI_API_KEY          Google Gemini API key
  EDGEQUAKE_LLM_PROVIDER  Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override model ID
  PDFIUM_LIB_PATH         Path to an existing libpdfium
  RUST_LOG                Log filter, overrides --verbose / --quiet
"#;

/// Extract exam papers to structured JSON using Vision LLMs.
#[derive(Parser, Debug)]
#[command(
    name = "exam2json",
    version,
    about = "Extract exam papers (PDF files, folders or URLs) to structured JSON using Vision LLMs",
    long_about = "Extract questions, subparts, diagrams and answer keys from exam papers using \
Vision Language Models. Supports OpenAI, Anthropic, Google Gemini, Azure OpenAI, and any \
OpenAI-compatible endpoint (Ollama, vLLM, LiteLLM, etc.).",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// PDF files, directories of PDFs, or HTTP/HTTPS URLs.
    #[arg(required = true)]
    inputs: Vec<String>,

    /// Directory for the JSON results.
    #[arg(short, long, env = "EXAM2JSON_OUTPUT_DIR", default_value = "output")]
    output_dir: PathBuf,

    /// LLM model ID (e.g. gpt-4.1-nano, gpt-4.1, claude-sonnet-4-20250514).
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// Rendering DPI (72–400).
    #[arg(long, env = "EXAM2JSON_DPI", default_value_t = 150,
          value_parser = clap::value_parser!(u32).range(72..=400))]
    dpi: u32,

    /// Concurrent VLM calls per document.
    #[arg(short, long, env = "EXAM2JSON_CONCURRENCY", default_value_t = 5)]
    concurrency: usize,

    /// Documents extracted at the same time.
    #[arg(short, long, env = "EXAM2JSON_PARALLEL", default_value_t = 2)]
    parallel: usize,

    /// Skip diagram cropping and linking.
    #[arg(long)]
    no_diagrams: bool,

    /// Skip answer-key detection and merging.
    #[arg(long)]
    no_answers: bool,

    /// Ask the model to classify pages the header check does not flag.
    #[arg(long)]
    classify_with_model: bool,

    /// Write diagram crops as PNG files under <OUTPUT_DIR>/diagrams.
    #[arg(long)]
    diagram_files: bool,

    /// PDF user password for encrypted documents.
    #[arg(long, env = "EXAM2JSON_PASSWORD")]
    password: Option<String>,

    /// Per-call LLM timeout in seconds.
    #[arg(long, env = "EXAM2JSON_API_TIMEOUT", default_value_t = 120)]
    api_timeout: u64,

    /// Abandon a document after this many seconds.
    #[arg(long, env = "EXAM2JSON_DOCUMENT_TIMEOUT")]
    document_timeout: Option<u64>,

    /// Print the extracted papers as JSON on stdout instead of writing files.
    #[arg(long)]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "EXAM2JSON_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "EXAM2JSON_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "EXAM2JSON_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO logs; --verbose brings them all back.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_writer(io::stderr)
        .init();

    let documents = expand_inputs(&cli.inputs)?;
    if documents.is_empty() {
        anyhow::bail!("No PDF files found in {:?}", cli.inputs);
    }

    let progress = show_progress.then(CliProgressCallback::new);
    let config = build_config(&cli, progress.clone().map(|cb| cb as ProgressCallback))?;

    let mut orchestrator = Orchestrator::from_config(config).context("Failed to set up the vision model")?;
    if cli.diagram_files {
        let cropper: Arc<dyn Cropper> = Arc::new(FileCropper::new(cli.output_dir.join("diagrams")));
        orchestrator = orchestrator.with_cropper(cropper);
    }

    let outcomes = BatchRunner::new(orchestrator).run(documents).await;
    if let Some(ref cb) = progress {
        cb.finish();
    }

    if cli.json {
        let papers: Vec<&ExamPaper> = outcomes.iter().filter_map(|o| o.result.as_ref().ok()).collect();
        let json = if papers.len() == 1 {
            serde_json::to_string_pretty(papers[0])
        } else {
            serde_json::to_string_pretty(&papers)
        }
        .context("Failed to serialise output")?;
        println!("{json}");
    } else {
        for outcome in &outcomes {
            if let Ok(ref paper) = outcome.result {
                let written = save_paper(&cli.output_dir, &outcome.document, paper)
                    .with_context(|| format!("Failed to write results for {}", outcome.document))?;
                if !cli.quiet {
                    eprintln!("   {}  {}", dim("→"), bold(&written.display().to_string()));
                }
            }
        }
    }

    if !cli.quiet {
        print_summary(&outcomes);
    }

    let failed = outcomes.iter().filter(|o| !o.is_success()).count();
    if failed == outcomes.len() {
        anyhow::bail!("All {} documents failed", failed);
    }
    Ok(())
}

/// Map CLI args to `ExtractionConfig`.
fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<ExtractionConfig> {
    let mut builder = ExtractionConfig::builder()
        .dpi(cli.dpi)
        .concurrency(cli.concurrency)
        .max_concurrent_documents(cli.parallel)
        .api_timeout_secs(cli.api_timeout)
        .extract_diagrams(!cli.no_diagrams)
        .extract_answers(!cli.no_answers)
        .model_page_classification(cli.classify_with_model);

    if let Some(ref model) = cli.model {
        builder = builder.model(model.clone());
    }
    if let Some(ref provider) = cli.provider {
        builder = builder.provider_name(provider.clone());
    }
    if let Some(ref password) = cli.password {
        builder = builder.password(password.clone());
    }
    if let Some(secs) = cli.document_timeout {
        builder = builder.document_timeout_secs(secs);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

/// Files and URLs pass through; directories contribute their `*.pdf`
/// files in name order.
fn expand_inputs(inputs: &[String]) -> Result<Vec<String>> {
    let mut documents = Vec::new();
    for input in inputs {
        let path = Path::new(input);
        if !path.is_dir() {
            documents.push(input.clone());
            continue;
        }
        let mut pdfs: Vec<PathBuf> = std::fs::read_dir(path)
            .with_context(|| format!("Failed to read directory {input}"))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.is_file()
                    && p.extension()
                        .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"))
            })
            .collect();
        pdfs.sort();
        documents.extend(pdfs.into_iter().map(|p| p.to_string_lossy().into_owned()));
    }
    Ok(documents)
}

/// File stem for a path or URL (`https://x/y/paper.pdf?dl=1` → `paper`).
fn output_stem(document: &str) -> String {
    let last = document
        .split(['?', '#'])
        .next()
        .unwrap_or(document)
        .trim_end_matches('/')
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(document);
    let stem = Path::new(last)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    if stem.is_empty() {
        "document".to_string()
    } else {
        stem
    }
}

/// Keep question numbers usable as file names.
fn question_file_name(number: &str, position: usize) -> String {
    let safe: String = number
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    let safe = safe.trim_matches('_');
    if safe.is_empty() {
        format!("q{}.json", position + 1)
    } else {
        format!("q{safe}.json")
    }
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialise output")?;
    std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))
}

/// Write one paper's results and return the path of the main file.
fn save_paper(output_dir: &Path, document: &str, paper: &ExamPaper) -> Result<PathBuf> {
    let stem = output_stem(document);
    let question_dir = output_dir.join(&stem);
    std::fs::create_dir_all(&question_dir)
        .with_context(|| format!("Failed to create {}", question_dir.display()))?;

    let main = output_dir.join(format!("{stem}_extracted.json"));
    write_json(&main, paper)?;

    if !paper.answer_keys.is_empty() {
        write_json(&output_dir.join(format!("{stem}_answer_keys.json")), &paper.answer_keys)?;
    }

    for (i, question) in paper.questions.iter().enumerate() {
        write_json(
            &question_dir.join(question_file_name(&question.question_number, i)),
            question,
        )?;
    }
    Ok(main)
}

fn print_summary(outcomes: &[DocumentOutcome]) {
    eprintln!();
    eprintln!(
        "{}",
        bold(&format!(
            "{:<40} {:>9} {:>8} {:>8} {:>7} {:>10}",
            "Document", "Questions", "Diagrams", "Answers", "Errors", "Cost"
        ))
    );
    let mut total_cost = 0.0;
    let mut total_tokens = 0;
    for o in outcomes {
        let m = &o.metrics;
        total_cost += m.total_cost_usd;
        total_tokens += m.total_tokens;
        let mut name = output_stem(&o.document);
        if name.chars().count() > 38 {
            name = name.chars().take(37).chain(std::iter::once('\u{2026}')).collect();
        }
        match o.result {
            Ok(_) => eprintln!(
                "{:<40} {:>9} {:>8} {:>8} {:>7} {:>10}",
                name,
                m.questions_extracted,
                m.diagrams_extracted,
                m.answers_merged,
                m.errors.len(),
                format!("${:.4}", m.total_cost_usd),
            ),
            Err(ref e) => eprintln!("{:<40} {}", name, red(&e.to_string())),
        }
    }

    let ok = outcomes.iter().filter(|o| o.is_success()).count();
    eprintln!();
    eprintln!(
        "{} {}/{} documents  {}  {}",
        if ok == outcomes.len() { green("✔") } else { cyan("⚠") },
        bold(&ok.to_string()),
        outcomes.len(),
        dim(&format!("{total_tokens} tokens")),
        dim(&format!("${total_cost:.4}")),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stems_from_paths_and_urls() {
        assert_eq!(output_stem("papers/2023_P6_Maths.pdf"), "2023_P6_Maths");
        assert_eq!(output_stem("https://example.com/x/paper.pdf?dl=1"), "paper");
        assert_eq!(output_stem("https://example.com/"), "example");
        assert_eq!(output_stem(""), "document");
    }

    #[test]
    fn question_files_are_safe() {
        assert_eq!(question_file_name("3(a)", 0), "q3_a.json");
        assert_eq!(question_file_name("12", 4), "q12.json");
        assert_eq!(question_file_name("", 4), "q5.json");
    }

    #[test]
    fn directories_expand_to_sorted_pdfs() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.pdf", "a.PDF", "notes.txt"] {
            std::fs::write(dir.path().join(name), b"%PDF").unwrap();
        }
        let inputs = vec![dir.path().to_string_lossy().into_owned(), "https://x/y.pdf".into()];
        let docs = expand_inputs(&inputs).unwrap();
        assert_eq!(docs.len(), 3);
        assert!(docs[0].ends_with("a.PDF"));
        assert!(docs[1].ends_with("b.pdf"));
        assert_eq!(docs[2], "https://x/y.pdf");
    }
}
