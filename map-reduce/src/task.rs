//! Map and reduce task bodies.
//!
//! Both are plain blocking functions: the master calls them directly in
//! sequential mode and workers call them from the blocking thread pool.
//! A failing task returns an error and leaves recovery to the scheduler,
//! which reruns the whole task elsewhere.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;

use anyhow::{bail, Context, Result};
use log::{debug, trace};

use crate::codec::{open_records, write_records};
use crate::{partition, App, JobPhase, KeyValue, MapFn, ReduceFn, RunTaskArgs, Workspace};

/// Runs map task `map_task` over `input`, writing one partition file per
/// reduce task. All `n_reduce` files are written, empty ones included.
pub fn run_map_task(
    workspace: &Workspace,
    job_name: &str,
    map_task: usize,
    input: &Path,
    n_reduce: usize,
    map_fn: MapFn,
) -> Result<()> {
    if n_reduce == 0 {
        bail!("map task {} needs at least one reduce partition", map_task);
    }
    let contents =
        fs::read(input).with_context(|| format!("unable to read input {}", input.display()))?;
    // Input is raw bytes; invalid UTF-8 sequences become U+FFFD.
    let contents = String::from_utf8_lossy(&contents);

    let mut buckets: Vec<Vec<KeyValue>> = vec![Vec::new(); n_reduce];
    for kv in map_fn(&input.to_string_lossy(), &contents) {
        buckets[partition(&kv.key, n_reduce)].push(kv);
    }

    for (reduce_task, bucket) in buckets.into_iter().enumerate() {
        let path = workspace.intermediate_path(job_name, map_task, reduce_task);
        trace!("map #{}: {} records -> {}", map_task, bucket.len(), path.display());
        write_records(&path, bucket)?;
    }
    debug!("map #{} of {} done", map_task, input.display());
    Ok(())
}

/// Runs reduce task `reduce_task`, fanning in the partition files of all
/// `n_map` map tasks.
///
/// A missing partition file means that mapper emitted nothing for this
/// partition. Values reach `reduce_fn` in arrival order: by map task, then
/// by position in the file.
pub fn run_reduce_task(
    workspace: &Workspace,
    job_name: &str,
    reduce_task: usize,
    n_map: usize,
    reduce_fn: ReduceFn,
) -> Result<()> {
    let mut values: HashMap<String, Vec<String>> = HashMap::new();

    for map_task in 0..n_map {
        let path = workspace.intermediate_path(job_name, map_task, reduce_task);
        let records = match open_records(&path) {
            Ok(records) => records,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                trace!("reduce #{}: {} absent", reduce_task, path.display());
                continue;
            }
            Err(e) => {
                return Err(e).with_context(|| format!("unable to open {}", path.display()))
            }
        };
        for record in records {
            let kv = record.with_context(|| format!("corrupt record in {}", path.display()))?;
            values.entry(kv.key).or_default().push(kv.value);
        }
    }

    let out = workspace.reduce_output_path(job_name, reduce_task);
    let nkeys = values.len();
    write_records(
        &out,
        values.into_iter().map(|(key, vs)| {
            let result = reduce_fn(&key, &vs);
            KeyValue::new(key, result)
        }),
    )?;
    debug!("reduce #{} done: {} keys -> {}", reduce_task, nkeys, out.display());
    Ok(())
}

/// Runs the task described by `args` with `app`'s callbacks.
pub fn run_task(workspace: &Workspace, app: App, args: &RunTaskArgs) -> Result<()> {
    match args.phase {
        JobPhase::Map => {
            let file = match &args.file {
                Some(file) => file,
                None => bail!("map task {} has no input file", args.task_number),
            };
            run_map_task(
                workspace,
                &args.job_name,
                args.task_number,
                file,
                args.num_other_phase,
                app.map,
            )
        }
        JobPhase::Reduce => run_reduce_task(
            workspace,
            &args.job_name,
            args.task_number,
            args.num_other_phase,
            app.reduce,
        ),
    }
}
