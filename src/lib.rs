//! Multi-threaded dd style copy engine for SCSI generic devices
//!
//! The copy is split into segments of `bpt` blocks which a pool of
//! worker threads READs from the input and WRITEs to the output. With
//! two sg v4 pass-through endpoints the data can stay in the kernel
//! (shared reservation), and requests can be batched (multiple requests).

pub mod adapter;
pub mod collection;
pub mod distributor;
pub mod endpoint;
pub mod error;
mod mrq;
pub mod options;
pub mod signals;
pub mod stats;
pub mod worker;

use anyhow::Error;

use sg_pt::SenseCategory;

use crate::collection::{Collection, SharedState};
use crate::error::DdError;
use crate::signals::{BlockedSignals, SignalListener};
use crate::stats::Stats;
use crate::worker::Worker;

pub use collection::Plan;
pub use options::{Invocation, Options};

/// Stops the copy if a worker thread unwinds, so nobody keeps waiting
/// for a segment that will never be written
struct FailOnPanic<'a>(&'a SharedState);

impl Drop for FailOnPanic<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.fail(SenseCategory::Other.exit_code());
        }
    }
}

fn run_worker(id: usize, coll: &Collection) -> Result<(), Error> {
    let _panic_guard = FailOnPanic(&coll.shared);
    match Worker::new(id, coll) {
        Ok(worker) => worker.run(),
        Err(err) => {
            coll.shared.fail(DdError::exit_code_of(&err));
            Err(err)
        }
    }
}

/// Run the copy described by `coll` and return the final statistics
///
/// Worker failures do not make this fail, they are reported through
/// [Stats::exit_status].
pub fn run(coll: &Collection) -> Result<Stats, Error> {
    let opts = &coll.opts;
    let plan = &coll.plan;

    if opts.dry_run {
        log::info!(
            "dry run: {} blocks of {} bytes from {} to {}, {} threads, plan {:?}",
            plan.total,
            plan.bs,
            coll.input.name(),
            coll.output.name(),
            opts.threads,
            plan
        );
        return Ok(coll.stats());
    }

    let _blocked = if opts.signal_listener {
        Some(BlockedSignals::block()?)
    } else {
        None
    };

    let threads = opts.threads.max(1);
    let msg_list = std::thread::scope(|s| -> Result<Vec<String>, Error> {
        let listener = if opts.signal_listener {
            Some(SignalListener::spawn(s, coll)?)
        } else {
            None
        };

        let mut handles = Vec::new();
        for id in 0..threads {
            let res = std::thread::Builder::new()
                .name(format!("sgh_dd worker ({})", id))
                .spawn_scoped(s, move || run_worker(id, coll));
            match res {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    log::error!("unable to start worker {} - {}", id, err);
                    coll.shared.fail(DdError::exit_code_of(&err.into()));
                    break;
                }
            }
        }

        let mut msg_list = Vec::new();
        for (i, handle) in handles.into_iter().enumerate() {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    log::error!("worker {}: {}", i, err);
                    coll.shared.fail(DdError::exit_code_of(&err));
                }
                Err(panic) => match panic.downcast::<&str>() {
                    Ok(panic_msg) => msg_list.push(format!(
                        "thread sgh_dd worker ({}) paniced: {}",
                        i, panic_msg
                    )),
                    Err(_) => msg_list.push(format!("thread sgh_dd worker ({}) paniced", i)),
                },
            }
        }

        if let Some(listener) = listener {
            listener.stop();
        }
        Ok(msg_list)
    })?;

    for msg in &msg_list {
        log::error!("{}", msg);
    }

    if opts.sync && coll.shared.exit_status() == 0 {
        if let Err(err) = coll.sync_outputs() {
            log::error!("{}", err);
            coll.shared.record_exit_status(DdError::exit_code_of(&err));
        }
    }

    Ok(coll.stats())
}
