//! Minimal CLI: marshal data → tagged tree → (json | yaml)
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use colored::Colorize;
use rayon::prelude::*;
use tracing::{debug, info};

use crate::emit::{write_tree, OutputFormat};
use crate::marshal::READER_STACK_SIZE;
use crate::table::TableByteOrder;
use crate::tagged::ConvertOptions;

// ————————————————————————————————————————————————————————————————————————————
// TYPES
// ————————————————————————————————————————————————————————————————————————————

/// convert marshaled game data files into a type-annotated JSON or YAML tree
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct CommandLineInterface {
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// convert marshaled files to a tagged tree
    Convert(ConvertOut),
    /// convert a tagged tree back to marshaled data (not implemented)
    ToRvdata(ReverseOut),
}

#[derive(Args, Debug, Clone)]
struct InputSettings {
    /// One or more inputs. May be literal paths or quoted glob patterns
    #[arg(long, short, num_args = 1.., required = true)]
    input: Vec<String>,
}

#[derive(clap::Parser, Debug)]
struct ConvertOut {
    #[command(flatten)]
    input_settings: InputSettings,

    /// output file for a single input (stdout if omitted)
    #[arg(short, long, conflicts_with = "out_dir")]
    out: Option<PathBuf>,

    /// output directory; one file per input, named after the input
    #[arg(long)]
    out_dir: Option<PathBuf>,

    /// output format (default: from the output extension, else json)
    #[arg(long, value_enum)]
    format: Option<OutputFormat>,

    /// byte order of dumped Table payloads
    #[arg(long, value_enum, default_value_t = TableByteOrder::default())]
    table_byte_order: TableByteOrder,

    /// debugging
    #[arg(long)]
    no_op: bool,
}

#[derive(clap::Parser, Debug)]
struct ReverseOut {
    #[command(flatten)]
    input_settings: InputSettings,

    /// output marshaled file
    #[arg(short, long)]
    out: Option<PathBuf>,
}

// ————————————————————————————————————————————————————————————————————————————
// IMPLEMENTATION
// ————————————————————————————————————————————————————————————————————————————

impl InputSettings {
    fn resolve(&self) -> Result<Vec<PathBuf>> {
        resolve_file_path_patterns(&self.input).context("failed to resolve input file paths")
    }
}

impl ConvertOut {
    fn options(&self) -> ConvertOptions {
        ConvertOptions { table_byte_order: self.table_byte_order }
    }

    fn output_format(&self) -> OutputFormat {
        self.format
            .or_else(|| self.out.as_deref().and_then(OutputFormat::from_path))
            .unwrap_or_default()
    }

    fn run(&self) -> Result<()> {
        let sources = self.input_settings.resolve()?;
        let pool = reader_pool()?;
        pool.install(|| self.convert(&sources))
    }

    fn convert(&self, sources: &[PathBuf]) -> Result<()> {
        let format = self.output_format();
        let options = self.options();

        match (&self.out_dir, sources) {
            (Some(out_dir), _) => convert_batch(sources, out_dir, format, &options),
            (None, [source]) => {
                let tree = crate::convert_file(source, &options)?;
                match &self.out {
                    Some(out) => write_output(&tree, format, out),
                    None => {
                        let stdout = std::io::stdout();
                        let mut writer = BufWriter::new(stdout.lock());
                        write_tree(&tree, format, &mut writer)?;
                        writer.flush()?;
                        Ok(())
                    }
                }
            }
            (None, _) => bail!(
                "{} inputs given; use --out-dir to convert more than one file",
                sources.len()
            ),
        }
    }
}

impl CommandLineInterface {
    pub fn load() -> Self {
        Self::parse()
    }
    pub fn run(&self) -> Result<()> {
        match &self.cmd {
            Command::Convert(target) => {
                // debug path
                if target.no_op {
                    eprintln!("{self:#?}");
                    return Ok(());
                }
                target.run()
            }
            Command::ToRvdata(target) => {
                debug!(inputs = ?target.input_settings.input, out = ?target.out, "reverse conversion requested");
                Err(anyhow!(
                    "reverse conversion (tagged tree → marshal) is not implemented"
                ))
            }
        }
    }
}

// ————————————————————————————————————————————————————————————————————————————
// INTERNAL HELPERS
// ————————————————————————————————————————————————————————————————————————————

/// Reading and serializing recurse once per nesting level; workers get a
/// stack deep enough for the reader's depth limit.
fn reader_pool() -> Result<rayon::ThreadPool> {
    rayon::ThreadPoolBuilder::new()
        .stack_size(READER_STACK_SIZE)
        .thread_name(|i| format!("rv-tree-{i}"))
        .build()
        .context("failed to start worker threads")
}

/// Converts every source into `out_dir` in parallel. Each file is
/// independent; one failure does not stop the others.
fn convert_batch(
    sources: &[PathBuf],
    out_dir: &Path,
    format: OutputFormat,
    options: &ConvertOptions,
) -> Result<()> {
    let targets = sources
        .iter()
        .map(|source| output_path(source, out_dir, format))
        .collect::<Result<Vec<_>>>()?;
    let mut seen = HashSet::new();
    for target in &targets {
        if !seen.insert(target) {
            bail!("two inputs map to the same output file {}", target.display());
        }
    }
    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("failed to create {}", out_dir.display()))?;

    let results = sources
        .par_iter()
        .zip(targets.par_iter())
        .map(|(source, target)| {
            let outcome = crate::convert_file(source, options)
                .and_then(|tree| write_output(&tree, format, target));
            (source, target, outcome)
        })
        .collect::<Vec<_>>();

    let mut failed = 0usize;
    for (source, target, outcome) in &results {
        match outcome {
            Ok(()) => eprintln!(
                "{} {} → {}",
                "✅".green(),
                source.display(),
                target.display()
            ),
            Err(error) => {
                failed += 1;
                eprintln!("{} {}: {error:#}", "❌ failed".red(), source.display());
            }
        }
    }
    if failed > 0 {
        bail!("{failed} of {} files failed to convert", results.len());
    }
    Ok(())
}

fn write_output(tree: &crate::tagged::Tagged, format: OutputFormat, out: &Path) -> Result<()> {
    if let Some(parent) = out.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }
    let file = File::create(out).with_context(|| format!("failed to create {}", out.display()))?;
    let mut writer = BufWriter::new(file);
    write_tree(tree, format, &mut writer)
        .with_context(|| format!("failed to write {}", out.display()))?;
    writer.flush()?;
    info!(path = %out.display(), ?format, "wrote tree");
    Ok(())
}

/// `Data/Map001.rvdata2` → `<out_dir>/Map001.json`
fn output_path(source: &Path, out_dir: &Path, format: OutputFormat) -> Result<PathBuf> {
    let stem = source
        .file_stem()
        .ok_or_else(|| anyhow!("input {} has no file name", source.display()))?;
    let mut name = stem.to_os_string();
    name.push(".");
    name.push(format.extension());
    Ok(out_dir.join(name))
}

fn resolve_file_path_patterns<I>(patterns: I) -> Result<Vec<PathBuf>>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    fn has_glob_chars(s: &str) -> bool {
        // Minimal glob detection for the `glob` crate syntax.
        s.bytes().any(|b| matches!(b, b'*' | b'?' | b'[' | b'{' ))
    }

    let mut out = Vec::<PathBuf>::new();

    for raw in patterns {
        let pattern = raw.as_ref();

        if has_glob_chars(pattern) {
            let mut matched_any = false;
            for entry in glob::glob(pattern)? {
                out.push(entry?);
                matched_any = true;
            }
            if !matched_any {
                // Pattern was explicitly a glob but matched nothing -> surface as an error
                bail!("glob pattern matched no files: {pattern}");
            }
        } else {
            out.push(PathBuf::from(pattern));
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> CommandLineInterface {
        CommandLineInterface::try_parse_from(args).unwrap()
    }

    fn convert_args(cli: &CommandLineInterface) -> &ConvertOut {
        match &cli.cmd {
            Command::Convert(target) => target,
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn format_comes_from_flag_then_extension() {
        let cli = parse(&["rv-tree", "convert", "-i", "a.rvdata2", "-o", "a.yml"]);
        assert_eq!(convert_args(&cli).output_format(), OutputFormat::Yaml);

        let cli = parse(&["rv-tree", "convert", "-i", "a.rvdata2", "-o", "a.yml", "--format", "json"]);
        assert_eq!(convert_args(&cli).output_format(), OutputFormat::Json);

        let cli = parse(&["rv-tree", "convert", "-i", "a.rvdata2"]);
        assert_eq!(convert_args(&cli).output_format(), OutputFormat::Json);
    }

    #[test]
    fn table_byte_order_defaults_to_little() {
        let cli = parse(&["rv-tree", "convert", "-i", "a.rvdata2"]);
        assert_eq!(convert_args(&cli).options().table_byte_order, TableByteOrder::Little);

        let cli = parse(&["rv-tree", "convert", "-i", "a", "--table-byte-order", "big"]);
        assert_eq!(convert_args(&cli).options().table_byte_order, TableByteOrder::Big);
    }

    #[test]
    fn out_and_out_dir_conflict() {
        let result = CommandLineInterface::try_parse_from([
            "rv-tree", "convert", "-i", "a", "-o", "x.json", "--out-dir", "d",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn output_path_uses_input_stem() {
        let path = output_path(Path::new("Data/Map001.rvdata2"), Path::new("out"), OutputFormat::Yaml).unwrap();
        assert_eq!(path, Path::new("out/Map001.yaml"));
    }

    #[test]
    fn unmatched_glob_is_an_error() {
        let err = resolve_file_path_patterns(["/definitely/not/here/*.rvdata2"]).unwrap_err();
        assert!(err.to_string().contains("matched no files"));
    }

    #[test]
    fn literal_paths_pass_through() {
        let paths = resolve_file_path_patterns(["Data/Actors.rvdata2"]).unwrap();
        assert_eq!(paths, vec![PathBuf::from("Data/Actors.rvdata2")]);
    }

    #[test]
    fn reverse_conversion_is_reported_as_unimplemented() {
        let cli = parse(&["rv-tree", "to-rvdata", "-i", "a.json"]);
        let err = cli.run().unwrap_err();
        assert!(err.to_string().contains("not implemented"));
    }

    #[test]
    fn deepest_readable_file_converts_on_the_worker_pool() {
        let dir = std::env::temp_dir().join(format!("rv-tree-deep-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let source = dir.join("Deep.rvdata2");
        let mut data = vec![4, 8];
        data.extend([b'[', 6].repeat(crate::marshal::DEFAULT_MAX_DEPTH - 1));
        data.push(b'0');
        std::fs::write(&source, data).unwrap();

        let out_dir = dir.join("out");
        let cli = parse(&[
            "rv-tree",
            "convert",
            "-i",
            source.to_str().unwrap(),
            "--out-dir",
            out_dir.to_str().unwrap(),
        ]);
        cli.run().unwrap();
        let json = std::fs::read_to_string(out_dir.join("Deep.json")).unwrap();
        assert!(json.starts_with("{\n    \"type\": \"Array\""));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn several_inputs_need_an_out_dir() {
        let cli = parse(&["rv-tree", "convert", "-i", "a.rvdata2", "b.rvdata2"]);
        let err = cli.run().unwrap_err();
        assert!(err.to_string().contains("--out-dir"));
    }
}
