use anyhow::{Context, Result, anyhow};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::source::{Element, Elements};

/// How the engine schedules one unit of work per source element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherFactory {
    Serial,
    /// A throwaway pool of this many workers, built for one `apply` and
    /// joined before it returns.
    Parallel(usize),
}

impl DispatcherFactory {
    pub fn for_threads(threads: usize) -> Self {
        if threads == 0 {
            Self::Serial
        } else {
            Self::Parallel(threads)
        }
    }

    /// Runs `work` for every element. The first error stops further
    /// scheduling and is returned once in-flight work has finished.
    pub fn dispatch<F>(&self, elements: Elements, work: F) -> Result<()>
    where
        F: Fn(Element) -> Result<()> + Sync,
    {
        match *self {
            Self::Serial => {
                for element in elements {
                    work(element?)?;
                }
                Ok(())
            }
            Self::Parallel(threads) => dispatch_parallel(threads, elements, work),
        }
    }
}

fn dispatch_parallel<F>(threads: usize, elements: Elements, work: F) -> Result<()>
where
    F: Fn(Element) -> Result<()> + Sync,
{
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads.max(1))
        .thread_name(|i| format!("class-transform-worker-{i}"))
        .build()
        .context("Failed to create transformation worker pool")?;

    let aborted = AtomicBool::new(false);
    let failure: Mutex<Option<anyhow::Error>> = Mutex::new(None);
    let record = |err: anyhow::Error| {
        aborted.store(true, Ordering::SeqCst);
        if let Ok(mut slot) = failure.lock() {
            slot.get_or_insert(err);
        }
    };

    pool.in_place_scope(|scope| {
        let work = &work;
        let aborted = &aborted;
        let record = &record;
        for element in elements {
            if aborted.load(Ordering::SeqCst) {
                break;
            }
            match element {
                Ok(element) => scope.spawn(move |_| {
                    if aborted.load(Ordering::SeqCst) {
                        return;
                    }
                    if let Err(err) = work(element) {
                        record(err);
                    }
                }),
                Err(err) => {
                    record(err);
                    break;
                }
            }
        }
    });
    drop(pool);

    let failure = failure
        .into_inner()
        .map_err(|_| anyhow!("Worker failure slot poisoned"))?;
    match failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
