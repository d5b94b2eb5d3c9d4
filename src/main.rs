//! PDF Image Extractor CLI
//!
//! Command-line interface for extracting embedded images from PDFs.

use anyhow::Context;
use clap::{Parser, ValueEnum};
use extract_pdf_images::{
    file_ops::extract_pdf_images_file, ExtractOptions, OutputFormat, FULL_CHUNK_HEIGHT,
};
use std::path::PathBuf;

/// Extract every embedded image of a PDF into a directory
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Input PDF file path
    #[arg(short, long)]
    input: PathBuf,

    /// Output directory for the extracted images
    #[arg(short, long)]
    output: PathBuf,

    /// Image file format
    #[arg(short, long, value_enum, default_value_t = FormatArg::Png)]
    format: FormatArg,

    /// JPEG quality (1-100, only affects JPEG output)
    #[arg(short, long, default_value = "90")]
    quality: u8,

    /// Rows decoded per chunk
    #[arg(long, default_value_t = FULL_CHUNK_HEIGHT)]
    chunk_height: u32,

    /// Also write manifest.json describing each image
    #[arg(short, long)]
    manifest: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum FormatArg {
    Png,
    Jpeg,
}

impl From<FormatArg> for OutputFormat {
    fn from(format: FormatArg) -> Self {
        match format {
            FormatArg::Png => OutputFormat::Png,
            FormatArg::Jpeg => OutputFormat::Jpeg,
        }
    }
}

fn main() {
    let args = Args::parse();

    let default_filter = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    if let Err(e) = run(&args) {
        eprintln!("Unable to process input: {:#}", e);
        std::process::exit(1);
    }
}

fn run(args: &Args) -> anyhow::Result<()> {
    let options = ExtractOptions {
        chunk_height: args.chunk_height,
        format: args.format.into(),
        quality: args.quality,
        write_manifest: args.manifest,
    };

    println!("PDF Image Extractor");
    println!("===================");

    let result = extract_pdf_images_file(&args.input, &args.output, &options)
        .with_context(|| format!("{}", args.input.display()))?;

    println!(
        "\nDone! Extracted {} images, {} skipped",
        result.total_images, result.skipped_images
    );
    if !result.failed_pages.is_empty() {
        let pages: Vec<usize> = result.failed_pages.iter().map(|p| p + 1).collect();
        println!("Pages that could not be read: {:?}", pages);
    }
    println!("Output saved to: {:?}", args.output);

    Ok(())
}
