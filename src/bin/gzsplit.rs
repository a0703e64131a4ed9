//! Splits a gzip-compressed log file on line boundaries into smaller
//! gzip pieces, so one oversized dump can be fanned out as several jobs.

use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

#[derive(Parser)]
#[command(name = "gzsplit", about, version)]
struct Cli {
    /// The gzip file to split.
    #[arg(short, long)]
    path: PathBuf,

    /// Target uncompressed bytes per piece.
    #[arg(long, default_value_t = 512 * 1024 * 1024)]
    size: u64,

    /// Remove the input file after a successful split.
    #[arg(long)]
    remove: bool,
}

struct PartWriter {
    prefix: String,
    index: u32,
    current: Option<GzEncoder<File>>,
    written: u64,
    limit: u64,
}

impl PartWriter {
    fn new(prefix: String, limit: u64) -> Self {
        Self {
            prefix,
            index: 0,
            current: None,
            written: 0,
            limit: limit.max(1),
        }
    }

    fn write_line(&mut self, line: &str) -> Result<()> {
        if self.current.is_none() || self.written >= self.limit {
            self.rotate()?;
        }

        let out = self.current.as_mut().expect("rotated above");
        out.write_all(line.as_bytes())?;
        out.write_all(b"\n")?;
        self.written += line.len() as u64 + 1;

        Ok(())
    }

    fn rotate(&mut self) -> Result<()> {
        self.finish()?;

        let path = format!("{}_part_{}.gz", self.prefix, self.index);
        println!("[WRITE] {path}");

        let file = File::create(&path).with_context(|| format!("creating {path}"))?;
        self.current = Some(GzEncoder::new(file, Compression::default()));
        self.index += 1;
        self.written = 0;

        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if let Some(out) = self.current.take() {
            out.finish().context("finishing gzip part")?;
        }
        Ok(())
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let file = File::open(&cli.path)
        .with_context(|| format!("cannot open: {}", cli.path.display()))?;
    let reader = BufReader::new(MultiGzDecoder::new(file));

    let prefix = cli
        .path
        .to_string_lossy()
        .trim_end_matches(".gz")
        .to_string();
    let mut writer = PartWriter::new(prefix, cli.size);

    for line in reader.lines() {
        let line = line.context("reading input line")?;
        writer.write_line(&line)?;
    }
    writer.finish()?;

    if cli.remove {
        std::fs::remove_file(&cli.path)
            .with_context(|| format!("removing {}", cli.path.display()))?;
    }

    Ok(())
}
