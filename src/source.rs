use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{Sender, TrySendError};
use flate2::read::MultiGzDecoder;
use tracing::info;

/// Capacity of the producer -> worker line channel.
pub const QUEUE_CAPACITY: usize = 16384;

/// How long the producer yields when the line channel is full.
const FULL_BACKOFF: Duration = Duration::from_millis(1);

/// Log a progress line every this many input lines.
const PROGRESS_EVERY: u64 = 100_000;

/// Reads a log file line by line into the bounded channel, yielding
/// briefly whenever the channel is full. Files ending in `.gz` are
/// decompressed on the fly. Sets `done` and drops the sender on return;
/// returns the number of lines pushed.
///
/// Runs on a blocking thread: all I/O here may block.
pub fn produce_file(path: &Path, tx: Sender<String>, done: &Arc<AtomicBool>) -> Result<u64> {
    let result = open_and_produce(path, tx);
    done.store(true, Ordering::Relaxed);
    result
}

fn open_and_produce(path: &Path, tx: Sender<String>) -> Result<u64> {
    let file =
        File::open(path).with_context(|| format!("cannot open: {}", path.display()))?;

    let is_gzip = path.extension().is_some_and(|ext| ext == "gz");
    let reader: Box<dyn Read> = if is_gzip {
        Box::new(MultiGzDecoder::new(file))
    } else {
        Box::new(file)
    };

    produce_lines(BufReader::new(reader), tx)
}

fn produce_lines(reader: impl BufRead, tx: Sender<String>) -> Result<u64> {
    let mut lines: u64 = 0;

    for line in reader.lines() {
        let mut line = line.context("reading input line")?;

        lines += 1;
        if lines % PROGRESS_EVERY == 0 {
            info!(lines, "input progress");
        }

        loop {
            match tx.try_send(line) {
                Ok(()) => break,
                Err(TrySendError::Full(back)) => {
                    line = back;
                    std::thread::sleep(FULL_BACKOFF);
                }
                // Worker is gone; nothing left to feed.
                Err(TrySendError::Disconnected(_)) => return Ok(lines),
            }
        }
    }

    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;

    use crossbeam_channel::bounded;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    fn drain(rx: &crossbeam_channel::Receiver<String>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(line) = rx.try_recv() {
            out.push(line);
        }
        out
    }

    #[test]
    fn test_produce_plain_file() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(file, "one 1").expect("write");
        writeln!(file, "two 2").expect("write");
        file.flush().expect("flush");

        let (tx, rx) = bounded(QUEUE_CAPACITY);
        let done = Arc::new(AtomicBool::new(false));
        let lines = produce_file(file.path(), tx, &done).expect("produce");

        assert_eq!(lines, 2);
        assert!(done.load(Ordering::Relaxed));
        assert_eq!(drain(&rx), vec!["one 1", "two 2"]);
    }

    #[test]
    fn test_produce_gzip_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("input.gz");

        let file = File::create(&path).expect("create");
        let mut enc = GzEncoder::new(file, Compression::default());
        enc.write_all(b"alpha\nbeta\ngamma\n").expect("write");
        enc.finish().expect("finish");

        let (tx, rx) = bounded(QUEUE_CAPACITY);
        let done = Arc::new(AtomicBool::new(false));
        let lines = produce_file(&path, tx, &done).expect("produce");

        assert_eq!(lines, 3);
        assert_eq!(drain(&rx), vec!["alpha", "beta", "gamma"]);
    }

    #[test]
    fn test_missing_file_is_error() {
        let (tx, _rx) = bounded(4);
        let done = Arc::new(AtomicBool::new(false));
        let err = produce_file(Path::new("/nonexistent/access.log"), tx, &done).unwrap_err();
        assert!(format!("{err:#}").contains("cannot open"));
        // done is set even on failure so the worker can drain and stop.
        assert!(done.load(Ordering::Relaxed));
    }

    #[test]
    fn test_producer_spins_on_full_queue() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        for i in 0..8 {
            writeln!(file, "line {i}").expect("write");
        }
        file.flush().expect("flush");

        // Capacity 2: the producer must block-and-retry, never overrun.
        let (tx, rx) = bounded(2);
        let done = Arc::new(AtomicBool::new(false));

        let path = file.path().to_path_buf();
        let handle = std::thread::spawn(move || produce_file(&path, tx, &done));

        let mut got = Vec::new();
        while got.len() < 8 {
            match rx.recv_timeout(Duration::from_secs(5)) {
                Ok(line) => got.push(line),
                Err(e) => panic!("producer stalled: {e}"),
            }
        }

        let lines = handle.join().expect("join").expect("produce");
        assert_eq!(lines, 8);
        assert_eq!(got[0], "line 0");
        assert_eq!(got[7], "line 7");
    }
}
