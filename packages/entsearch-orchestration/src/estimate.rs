use crate::error::Result;
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Sample caps: reading further buys little extra accuracy on the
/// multi-gigabyte dumps this targets.
pub const SAMPLE_RECORD_CAP: u64 = 20_000;
pub const SAMPLE_TEXT_BYTE_CAP: u64 = 64_000_000;

/// Advisory total-record prediction for a streamed corpus. Drives progress
/// reporting only; no correctness decision may depend on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizeEstimate {
    pub estimated_total_records: u64,
    pub sampled_records: u64,
    /// Bytes of the input file actually consumed while sampling. For gzip
    /// input these are compressed bytes, which is what makes the
    /// extrapolation ratio locally accurate.
    pub sampled_input_bytes: u64,
    pub sampled_text_bytes: u64,
    pub total_input_bytes: u64,
    /// The sample reached EOF, so the count is exact rather than projected.
    pub exhausted: bool,
}

struct CountingReader<R> {
    inner: R,
    count: Arc<AtomicU64>,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}

fn open_sampling_reader(path: &Path) -> Result<(Box<dyn BufRead>, Arc<AtomicU64>)> {
    let consumed = Arc::new(AtomicU64::new(0));
    let file = File::open(path)?;
    let counting = CountingReader {
        inner: file,
        count: consumed.clone(),
    };

    let is_gzip = path
        .extension()
        .map_or(false, |ext| ext.eq_ignore_ascii_case("gz"));

    let reader: Box<dyn BufRead> = if is_gzip {
        Box::new(BufReader::new(GzDecoder::new(counting)))
    } else {
        Box::new(BufReader::new(counting))
    };
    Ok((reader, consumed))
}

/// A corpus line counts as one record unless it is blank or dump framing
/// (a bare `[` / `]`); a trailing comma is tolerated.
fn is_record_line(raw_line: &str) -> bool {
    let mut line = raw_line.trim();
    if line.is_empty() || line == "[" || line == "]" {
        return false;
    }
    if let Some(stripped) = line.strip_suffix(',') {
        line = stripped;
    }
    !line.is_empty()
}

/// Project the full-file record count from a sampled prefix. Prefers the
/// consumed-input ratio (accurate for compressed sources); falls back to
/// the decoded-text ratio when input accounting came up empty.
fn extrapolate(
    sampled_records: u64,
    sampled_input_bytes: u64,
    sampled_text_bytes: u64,
    total_input_bytes: u64,
) -> u64 {
    if sampled_records == 0 {
        return 0;
    }

    let per_record_bytes = if sampled_input_bytes > 0 {
        sampled_input_bytes as f64 / sampled_records as f64
    } else if sampled_text_bytes > 0 {
        sampled_text_bytes as f64 / sampled_records as f64
    } else {
        return sampled_records;
    };

    let projected = (total_input_bytes as f64 / per_record_bytes) as u64;
    projected.max(sampled_records).max(1)
}

/// Estimate the total record count of `path` from a bounded prefix read.
///
/// Returns `Ok(None)` when no estimate can be made (missing or empty
/// input): the estimate is advisory and must never fail a run. A `limit`
/// of 0 means no parse limit.
pub fn estimate_record_total(path: &Path, limit: u64) -> Result<Option<SizeEstimate>> {
    if !path.is_file() {
        return Ok(None);
    }

    let total_input_bytes = std::fs::metadata(path)?.len();
    if total_input_bytes == 0 {
        return Ok(None);
    }

    let (mut reader, consumed) = open_sampling_reader(path)?;

    let mut sampled_records: u64 = 0;
    let mut sampled_text_bytes: u64 = 0;
    let mut exhausted = true;
    let mut line = String::new();

    loop {
        line.clear();
        let n = reader.read_line(&mut line)?;
        if n == 0 {
            break;
        }
        sampled_text_bytes += n as u64;
        if is_record_line(&line) {
            sampled_records += 1;
        }
        if sampled_records >= SAMPLE_RECORD_CAP || sampled_text_bytes >= SAMPLE_TEXT_BYTE_CAP {
            exhausted = false;
            break;
        }
    }

    if sampled_records == 0 {
        return Ok(None);
    }

    let sampled_input_bytes = consumed.load(Ordering::Relaxed);

    let mut estimated_total_records = if exhausted {
        sampled_records
    } else {
        extrapolate(
            sampled_records,
            sampled_input_bytes,
            sampled_text_bytes,
            total_input_bytes,
        )
    };

    if limit > 0 {
        estimated_total_records = estimated_total_records.min(limit);
    }

    debug!(
        "sampled {} records over {} input bytes of {} total (estimate ~{})",
        sampled_records, sampled_input_bytes, total_input_bytes, estimated_total_records
    );

    Ok(Some(SizeEstimate {
        estimated_total_records,
        sampled_records,
        sampled_input_bytes,
        sampled_text_bytes,
        total_input_bytes,
        exhausted,
    }))
}
