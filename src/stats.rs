//! Progress counters and the final report

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Atomic counters updated by all workers
#[derive(Debug, Default)]
pub struct Counters {
    pub in_full: AtomicU64,
    pub in_partial: AtomicU64,
    pub out_full: AtomicU64,
    pub out_partial: AtomicU64,
    pub out2_full: AtomicU64,
    pub out2_partial: AtomicU64,
    pub resid_sum: AtomicU64,
    pub dio_incomplete: AtomicU64,
    pub ebusy: AtomicU64,
    pub eagain: AtomicU64,
    pub abort_req: AtomicU64,
    pub abort_success: AtomicU64,
    pub mrq_abort_req: AtomicU64,
    pub mrq_abort_success: AtomicU64,
    pub num_waiting_calls: AtomicU64,
    pub mrq_batches: AtomicU64,
    pub miscompares: AtomicU64,
    pub retries: AtomicU64,
}

impl Counters {
    pub fn add(counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }

    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// Snapshot of a (possibly still running) copy
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Stats {
    pub records_in_full: u64,
    pub records_in_partial: u64,
    pub records_out_full: u64,
    pub records_out_partial: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub records_out2: Option<(u64, u64)>,
    /// the output half issued VERIFY instead of WRITE
    pub verify: bool,
    pub in_remaining: i64,
    pub out_remaining: i64,
    pub resid_sum: u64,
    pub dio_incomplete: u64,
    pub ebusy: u64,
    pub eagain: u64,
    pub abort_requests: u64,
    pub abort_successes: u64,
    pub mrq_abort_requests: u64,
    pub mrq_abort_successes: u64,
    pub num_waiting_calls: u64,
    pub mrq_batches: u64,
    pub miscompares: u64,
    pub retries: u64,
    pub block_size: usize,
    pub elapsed_secs: f64,
    /// 0 no timing report, 1 throughput, 2 throughput (nanosecond durations)
    #[serde(skip)]
    pub time: u8,
    pub exit_status: i32,
}

/// What [Stats::capture] needs besides the counters
pub struct StatsContext {
    pub in_remaining: i64,
    pub out_remaining: i64,
    pub has_out2: bool,
    pub verify: bool,
    pub block_size: usize,
    pub elapsed: Duration,
    pub time: u8,
    pub exit_status: i32,
}

impl Stats {
    pub fn capture(counters: &Counters, ctx: StatsContext) -> Self {
        let get = Counters::get;
        Self {
            records_in_full: get(&counters.in_full),
            records_in_partial: get(&counters.in_partial),
            records_out_full: get(&counters.out_full),
            records_out_partial: get(&counters.out_partial),
            records_out2: if ctx.has_out2 {
                Some((get(&counters.out2_full), get(&counters.out2_partial)))
            } else {
                None
            },
            verify: ctx.verify,
            in_remaining: ctx.in_remaining,
            out_remaining: ctx.out_remaining,
            resid_sum: get(&counters.resid_sum),
            dio_incomplete: get(&counters.dio_incomplete),
            ebusy: get(&counters.ebusy),
            eagain: get(&counters.eagain),
            abort_requests: get(&counters.abort_req),
            abort_successes: get(&counters.abort_success),
            mrq_abort_requests: get(&counters.mrq_abort_req),
            mrq_abort_successes: get(&counters.mrq_abort_success),
            num_waiting_calls: get(&counters.num_waiting_calls),
            mrq_batches: get(&counters.mrq_batches),
            miscompares: get(&counters.miscompares),
            retries: get(&counters.retries),
            block_size: ctx.block_size,
            elapsed_secs: ctx.elapsed.as_secs_f64(),
            time: ctx.time,
            exit_status: ctx.exit_status,
        }
    }

    /// Bytes transferred by the output half, partial blocks count as full
    pub fn bytes_out(&self) -> u64 {
        (self.records_out_full + self.records_out_partial) * self.block_size as u64
    }

    /// Throughput in MB/s (10^6 bytes), `None` for very short runs
    pub fn throughput(&self) -> Option<f64> {
        if self.elapsed_secs > 0.00001 {
            Some(self.bytes_out() as f64 / self.elapsed_secs / 1_000_000.0)
        } else {
            None
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        let mut value = serde_json::to_value(self)?;
        if let Some(obj) = value.as_object_mut() {
            if let Some(throughput) = self.throughput() {
                obj.insert("throughput-mb-per-sec".into(), throughput.into());
            }
        }
        serde_json::to_string_pretty(&value)
    }
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.in_remaining != 0 || self.out_remaining != 0 {
            writeln!(
                f,
                "  remaining block count: in={}, out={}",
                self.in_remaining, self.out_remaining
            )?;
        }
        writeln!(
            f,
            "{}+{} records in",
            self.records_in_full, self.records_in_partial
        )?;
        if self.verify {
            writeln!(
                f,
                "{}+{} records verified",
                self.records_out_full, self.records_out_partial
            )?;
        } else {
            writeln!(
                f,
                "{}+{} records out",
                self.records_out_full, self.records_out_partial
            )?;
        }
        if let Some((full, partial)) = self.records_out2 {
            writeln!(f, "{}+{} records out (of2)", full, partial)?;
        }
        if self.miscompares > 0 {
            writeln!(f, "  number of miscompares: {}", self.miscompares)?;
        }
        if self.dio_incomplete > 0 {
            writeln!(
                f,
                "  dio not done on {} commands, indirect IO used instead",
                self.dio_incomplete
            )?;
        }
        if self.resid_sum > 0 {
            writeln!(f, "  sum of residual byte counts: {}", self.resid_sum)?;
        }
        if self.ebusy > 0 || self.eagain > 0 {
            writeln!(
                f,
                "  submit retries: EBUSY={}, EAGAIN={}",
                self.ebusy, self.eagain
            )?;
        }
        if self.abort_requests > 0 || self.mrq_abort_requests > 0 {
            writeln!(
                f,
                "  aborts: {} requested, {} done; mrq aborts: {} requested, {} done",
                self.abort_requests,
                self.abort_successes,
                self.mrq_abort_requests,
                self.mrq_abort_successes
            )?;
        }
        if self.time > 0 {
            write!(
                f,
                "time to transfer data: {:.6} secs",
                self.elapsed_secs
            )?;
            match self.throughput() {
                Some(mbs) => writeln!(f, " at {:.2} MB/sec", mbs)?,
                None => writeln!(f)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample(verify: bool) -> Stats {
        let counters = Counters::default();
        Counters::add(&counters.in_full, 2048);
        Counters::add(&counters.out_full, 2047);
        Counters::inc(&counters.out_partial);
        Stats::capture(
            &counters,
            StatsContext {
                in_remaining: 0,
                out_remaining: 0,
                has_out2: false,
                verify,
                block_size: 512,
                elapsed: Duration::from_millis(500),
                time: 1,
                exit_status: 0,
            },
        )
    }

    #[test]
    fn dd_style_lines() {
        let text = sample(false).to_string();
        assert!(text.contains("2048+0 records in\n"));
        assert!(text.contains("2047+1 records out\n"));
        assert!(text.contains("time to transfer data"));
        assert!(!text.contains("remaining"));

        let text = sample(true).to_string();
        assert!(text.contains("2047+1 records verified\n"));
    }

    #[test]
    fn json_report() -> Result<(), anyhow::Error> {
        let stats = sample(false);
        assert_eq!(stats.bytes_out(), 2048 * 512);
        let value: serde_json::Value = serde_json::from_str(&stats.to_json()?)?;
        assert_eq!(value["records-in-full"], 2048);
        assert_eq!(value["records-out-partial"], 1);
        assert!(value.get("records-out2").is_none());
        assert!(value["throughput-mb-per-sec"].as_f64().is_some());
        Ok(())
    }
}
