//! CLI command implementations
//!
//! This module contains the business logic for CLI commands, kept out of
//! `main.rs` for testability.
//!
//! # Commands
//!
//! - `run` - Translate text, or start the interactive loop
//! - `info` - Show model settings and parameter count

// CLI glue code - relaxed lint requirements
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::needless_pass_by_value)]

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};

use crate::config::ModelSettings;
use crate::error::{Result, TraducirError};
use crate::generate::{GenerationConfig, SamplerKind};
use crate::model::{Session, Translation, Translator};
use crate::tokenizer::{BPETokenizer, TextCodec};
use crate::trace::{InferenceTracer, TraceConfig, TraceStep};

/// Prompt used when the settings don't define one
pub const DEFAULT_PROMPT: &str = "English text: ";

/// Traducir - encoder-decoder translation inference
#[derive(Parser, Debug)]
#[command(name = "traducir")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Command to run
    #[command(subcommand)]
    pub command: Commands,
}

/// CLI subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Translate text with a model
    ///
    /// Examples:
    ///   traducir run ./opus-mt-en-de "How are you?"
    ///   traducir run ./opus-mt-en-de --sampler random --seed 7
    Run {
        /// Model directory (settings, parameters, vocab.json, merges.txt)
        #[arg(value_name = "MODEL_DIR")]
        model_dir: PathBuf,

        /// Text to translate (interactive mode if omitted)
        #[arg(value_name = "TEXT")]
        text: Option<String>,

        /// Token selection policy
        #[arg(long, value_enum, default_value_t = SamplerArg::Greedy)]
        sampler: SamplerArg,

        /// Seed for the random sampler
        #[arg(long, default_value_t = 42)]
        seed: u64,

        /// Maximum decode steps (capped to the context size)
        #[arg(short = 'n', long)]
        max_positions: Option<usize>,

        /// Trace the inference pipeline
        #[arg(long)]
        trace: bool,

        /// Comma-separated steps to trace (default: all)
        #[arg(long, value_name = "STEPS")]
        trace_steps: Option<String>,

        /// Write the trace as JSON to this file instead of stderr
        ///
        /// In interactive mode the file is rewritten after every request.
        #[arg(long, value_name = "FILE")]
        trace_output: Option<PathBuf>,

        /// Trace every decode step
        #[arg(short, long)]
        verbose: bool,
    },
    /// Show model settings and parameter count
    Info {
        /// Model directory
        #[arg(value_name = "MODEL_DIR")]
        model_dir: PathBuf,

        /// Print settings as JSON
        #[arg(long)]
        json: bool,
    },
}

/// `--sampler` values
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerArg {
    /// Arg-max
    Greedy,
    /// Softmax-weighted random draw
    Random,
}

/// Resolved options of the `run` command
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Model directory
    pub model_dir: PathBuf,
    /// Text to translate; `None` starts the interactive loop
    pub text: Option<String>,
    /// Decode loop parameters
    pub generation: GenerationConfig,
    /// Tracer settings
    pub trace: TraceConfig,
}

impl RunConfig {
    /// Build from the parsed `run` arguments
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        model_dir: PathBuf,
        text: Option<String>,
        sampler: SamplerArg,
        seed: u64,
        max_positions: Option<usize>,
        trace: bool,
        trace_steps: Option<String>,
        trace_output: Option<PathBuf>,
        verbose: bool,
    ) -> Self {
        let sampler = match sampler {
            SamplerArg::Greedy => SamplerKind::Greedy,
            SamplerArg::Random => SamplerKind::WeightedRandom { seed },
        };
        let generation = GenerationConfig {
            max_positions,
            sampler,
        };

        let trace = TraceConfig {
            enabled: trace || trace_steps.is_some() || trace_output.is_some(),
            steps: trace_steps
                .as_deref()
                .map(TraceConfig::parse_steps)
                .unwrap_or_default(),
            verbose,
            output: trace_output,
        };

        Self {
            model_dir,
            text,
            generation,
            trace,
        }
    }
}

/// Main CLI entrypoint - dispatches commands to handlers
pub fn entrypoint(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Run {
            model_dir,
            text,
            sampler,
            seed,
            max_positions,
            trace,
            trace_steps,
            trace_output,
            verbose,
        } => run_command(&RunConfig::new(
            model_dir,
            text,
            sampler,
            seed,
            max_positions,
            trace,
            trace_steps,
            trace_output,
            verbose,
        )),
        Commands::Info { model_dir, json } => {
            let stdout = std::io::stdout();
            info_command(&model_dir, json, &mut stdout.lock())
        },
    }
}

/// Load a model and translate the given text or run the interactive loop
pub fn run_command(config: &RunConfig) -> Result<()> {
    let dir = &config.model_dir;
    let settings = ModelSettings::from_dir(dir)?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    writeln!(out, "Path: {}", dir.display()).map_err(io_error)?;
    writeln!(
        out,
        "Number of parameters: {}",
        format_parameter_count(settings.parameter_count())
    )
    .map_err(io_error)?;
    write!(out, "\nLoading trained parameters... ").map_err(io_error)?;
    out.flush().map_err(io_error)?;

    let translator = Translator::from_dir(dir)?;
    let tokenizer = BPETokenizer::from_dir(dir)?;
    writeln!(out, "Done.").map_err(io_error)?;

    let mut tracer = InferenceTracer::new(config.trace.clone());
    tracer.set_model_info(translator.model_info(&dir.display().to_string()));
    let mut session = translator.new_session()?.with_tracer(tracer);

    match &config.text {
        Some(text) => {
            let result = translate_text(
                &translator,
                &mut session,
                &tokenizer,
                &config.generation,
                text,
                &mut out,
            );
            flush_trace(&mut session)?;
            result.map(|_| ())
        },
        None => {
            let prompt = settings.prompt.as_deref().unwrap_or(DEFAULT_PROMPT);
            let stdin = std::io::stdin();
            interactive_loop(
                &translator,
                &mut session,
                &tokenizer,
                &config.generation,
                prompt,
                &mut stdin.lock(),
                &mut out,
            )
        },
    }
}

/// Write out the trace of the finished request and start a fresh one
fn flush_trace(session: &mut Session) -> Result<()> {
    let tracer = session.tracer_mut();
    if tracer.is_enabled() {
        tracer.write_output().map_err(io_error)?;
        tracer.clear_events();
    }
    Ok(())
}

/// Prompt for lines until an empty line or end of input
///
/// A failed translation is reported and the loop continues. When the
/// session traces, each request's trace is written out as soon as it
/// finishes.
pub fn interactive_loop<C, R, W>(
    translator: &Translator,
    session: &mut Session,
    codec: &C,
    generation: &GenerationConfig,
    prompt: &str,
    input: &mut R,
    out: &mut W,
) -> Result<()>
where
    C: TextCodec + ?Sized,
    R: BufRead,
    W: Write,
{
    loop {
        let prompt = prompt.trim_end();
        write!(out, "\n\n{prompt} ").map_err(io_error)?;
        out.flush().map_err(io_error)?;

        let mut line = String::new();
        if input.read_line(&mut line).map_err(io_error)? == 0 {
            return Ok(());
        }
        let text = line.trim();
        if text.is_empty() {
            return Ok(());
        }

        if let Err(e) = translate_text(translator, session, codec, generation, text, out) {
            writeln!(out, "\nERROR: {e}").map_err(io_error)?;
        }
        flush_trace(session)?;
    }
}

/// Translate one text, streaming display tokens to `out` as they arrive
///
/// When token-by-token decoding differs from decoding the whole response
/// (a character split over several tokens), the full decode is printed
/// afterwards as a corrected response.
pub fn translate_text<C, W>(
    translator: &Translator,
    session: &mut Session,
    codec: &C,
    generation: &GenerationConfig,
    text: &str,
    out: &mut W,
) -> Result<Translation>
where
    C: TextCodec + ?Sized,
    W: Write,
{
    session.tracer_mut().start_step(TraceStep::Tokenize);
    let tokens = codec.encode(text);
    session
        .tracer_mut()
        .trace_tokenize(text, &tokens, translator.settings().vocab_size);

    writeln!(out).map_err(io_error)?;
    let mut write_error = None;
    let translation = translator.translate_streaming(session, &tokens, generation, |token| {
        if write_error.is_some() {
            return;
        }
        let written = codec
            .decode_token(token)
            .and_then(|piece| write!(out, "{piece}").and_then(|()| out.flush()).map_err(io_error));
        if let Err(e) = written {
            write_error = Some(e);
        }
    })?;
    if let Some(e) = write_error {
        return Err(e);
    }

    let display = translation.display_tokens();
    session.tracer_mut().start_step(TraceStep::Detokenize);
    let response = codec.decode(display)?;
    session.tracer_mut().trace_detokenize(display, &response);

    if let Some(corrected) = corrected_response(codec, display, &response)? {
        write!(out, "\nCorrected unicode response:\n{corrected}").map_err(io_error)?;
    }
    Ok(translation)
}

/// The full decode, if it differs from the token-by-token rendering
pub fn corrected_response<C: TextCodec + ?Sized>(
    codec: &C,
    tokens: &[u32],
    response: &str,
) -> Result<Option<String>> {
    let mut streamed = String::new();
    for &token in tokens {
        streamed.push_str(&codec.decode_token(token)?);
    }
    Ok((streamed != response).then(|| response.to_string()))
}

/// Print settings and parameter count of a model directory
pub fn info_command<W: Write>(dir: &Path, json: bool, out: &mut W) -> Result<()> {
    let settings = ModelSettings::from_dir(dir)?;

    if json {
        let mut value = serde_json::to_value(&settings).map_err(|e| TraducirError::FormatError {
            reason: e.to_string(),
        })?;
        value["parameter_count"] = serde_json::Value::from(settings.parameter_count());
        let text = serde_json::to_string_pretty(&value).map_err(|e| TraducirError::FormatError {
            reason: e.to_string(),
        })?;
        writeln!(out, "{text}").map_err(io_error)?;
        return Ok(());
    }

    let lines = [
        format!("Path: {}", dir.display()),
        format!(
            "Number of parameters: {} ({})",
            format_parameter_count(settings.parameter_count()),
            settings.parameter_count()
        ),
        format!("Vocabulary: {} tokens", settings.vocab_size),
        format!(
            "Special tokens: start={} end={} offset={}",
            settings.start_of_text_token, settings.end_of_text_token, settings.special_token_offset
        ),
        format!("Context size: {}", settings.context_size),
        format!("Hidden size: {}", settings.hidden_size),
        format!(
            "Encoder: {} layers, {} heads, score divisor {}",
            settings.encoder_count, settings.encoder_head_count, settings.encoder_score_dividend
        ),
        format!(
            "Decoder: {} layers, {} heads, score divisor {}",
            settings.decoder_count, settings.decoder_head_count, settings.decoder_score_dividend
        ),
        format!("Epsilon: {:e}", settings.epsilon),
    ];
    for line in lines {
        writeln!(out, "{line}").map_err(io_error)?;
    }
    Ok(())
}

/// Parameter count rounded to millions, e.g. `74 M`
#[must_use]
pub fn format_parameter_count(count: u64) -> String {
    format!("{} M", (count + 500_000) / 1_000_000)
}

fn io_error(e: std::io::Error) -> TraducirError {
    TraducirError::IoError {
        message: e.to_string(),
    }
}
