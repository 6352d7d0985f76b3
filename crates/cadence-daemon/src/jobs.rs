//! `cadence jobs …` administrative commands.

use anyhow::{anyhow, bail};
use cadence_core::{ArgValue, TaskPayload};
use cadence_scheduler::{Job, JobStore, NewJob, Period, Schedule};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::json;

use crate::cli::{AddArgs, JobsCommand};

pub fn execute(store: &JobStore, command: JobsCommand) -> anyhow::Result<()> {
    match command {
        JobsCommand::List => {
            let jobs = store.list()?;
            if jobs.is_empty() {
                println!("no jobs in namespace {}", store.namespace());
                return Ok(());
            }
            println!(
                "{:<36}  {:<24}  {:<8}  {:<7}  {:<9}  {:<20}  RUNS",
                "ID", "NAME", "KIND", "ENABLED", "STATUS", "NEXT RUN"
            );
            for job in &jobs {
                println!(
                    "{:<36}  {:<24}  {:<8}  {:<7}  {:<9}  {:<20}  {}",
                    job.id,
                    job.name,
                    job.kind(),
                    job.enabled,
                    job.status,
                    fmt_time(job.next_run_at),
                    job.run_count
                );
            }
        }
        JobsCommand::Show { id } => {
            let job = store.get(&id)?;
            println!("{}", serde_json::to_string_pretty(&describe(&job))?);
        }
        JobsCommand::Remove { id } => {
            if store.delete(&id)? {
                println!("removed {id}");
            } else {
                println!("no job {id}; nothing removed");
            }
        }
        JobsCommand::Enable { id } => {
            let job = store.get(&id)?;
            let job = store.set_enabled(&id, true, job.version)?;
            println!("enabled {} (next run {})", job.name, fmt_time(job.next_run_at));
        }
        JobsCommand::Disable { id } => {
            let job = store.get(&id)?;
            let job = store.set_enabled(&id, false, job.version)?;
            println!("disabled {}", job.name);
        }
        JobsCommand::RunNow { id } => {
            let job = store.run_now(&id, Utc::now())?;
            if job.enabled && job.next_run_at.is_some() {
                println!("{} will run on the next tick", job.name);
            } else {
                bail!("job {} is disabled or exhausted; enable or edit it first", job.name);
            }
        }
        JobsCommand::Add(add) => {
            let job = store.create(new_job(&add)?)?;
            println!("{}  {} (next run {})", job.id, job.name, fmt_time(job.next_run_at));
        }
    }
    Ok(())
}

/// Registration request for `jobs add`.
pub fn new_job(add: &AddArgs) -> anyhow::Result<NewJob> {
    let schedule = build_schedule(add)?;
    let payload = build_payload(add, &schedule)?;
    let job = NewJob::new(add.name.clone(), schedule, payload);
    Ok(if add.disabled { job.disabled() } else { job })
}

fn build_schedule(add: &AddArgs) -> anyhow::Result<Schedule> {
    if let Some(at) = add.at {
        return Ok(Schedule::Once { at });
    }
    if let Some(value) = add.every {
        return Ok(Schedule::Interval {
            every: Period::new(value, add.unit),
            repeat: add.repeat,
            start_at: add.start_at,
        });
    }
    if let Some(expression) = &add.cron {
        return Ok(Schedule::Cron {
            expression: expression.clone(),
            timezone: add.timezone.clone(),
            repeat: add.repeat,
        });
    }
    bail!("one of --at, --every or --cron is required")
}

fn build_payload(add: &AddArgs, schedule: &Schedule) -> anyhow::Result<Vec<u8>> {
    let mut task = TaskPayload::new(add.callable.clone()).with_queue(add.queue.clone());
    task.timeout_secs = add.timeout;
    task.result_ttl_secs = add.result_ttl;
    task.at_front = add.at_front;
    for raw in &add.args {
        task = task.with_arg(ArgValue::parse_typed(raw)?);
    }
    for raw in &add.kwargs {
        let (key, value) = raw
            .split_once('=')
            .ok_or_else(|| anyhow!("--kwarg expects key=value, got {raw:?}"))?;
        task = task.with_kwarg(key, ArgValue::parse_typed(value)?);
    }
    task.validate()?;
    if let Schedule::Interval { every, .. } = schedule {
        task.check_result_ttl(every.as_secs())?;
    }
    Ok(task.to_bytes()?)
}

fn describe(job: &Job) -> serde_json::Value {
    let task = TaskPayload::from_bytes(&job.payload).ok();
    json!({
        "id": job.id,
        "namespace": job.namespace,
        "name": job.name,
        "schedule": job.schedule,
        "enabled": job.enabled,
        "status": job.status,
        "next_run_at": job.next_run_at,
        "last_enqueued_at": job.last_enqueued_at,
        "run_count": job.run_count,
        "version": job.version,
        "created_at": job.created_at,
        "updated_at": job.updated_at,
        "call": task.as_ref().map(TaskPayload::function_string),
        "task": task,
    })
}

fn fmt_time(t: Option<DateTime<Utc>>) -> String {
    t.map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_else(|| "-".to_string())
}
