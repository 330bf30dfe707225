use jobmill_core::JobStatusRecord;
use jobmill_engine::EngineEvent;

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    out.push('…');
    out
}

/// Events printed to stderr rather than stdout.
pub fn is_diagnostic(event: &EngineEvent) -> bool {
    matches!(
        event,
        EngineEvent::Warning { .. } | EngineEvent::Error { .. } | EngineEvent::CrashLoop { .. }
    )
}

/// One console line per event worth showing; status writes and snapshots stay quiet.
pub fn format_event(event: &EngineEvent) -> Option<String> {
    let line = match event {
        EngineEvent::Started => "engine started".to_string(),
        EngineEvent::StopRequested => "stop requested".to_string(),
        EngineEvent::RecoveryFinished { report } => format!(
            "recovery: drained={} requeued={} scanned={}",
            report.drained, report.requeued, report.scanned
        ),
        EngineEvent::RecoverySkipped => "recovery: skipped (lock held by another instance)".to_string(),
        EngineEvent::JobQueued { .. } | EngineEvent::StatusChanged { .. } => return None,
        EngineEvent::JobStarted { worker_id, job_id } => format!("{job_id} started on worker {worker_id}"),
        EngineEvent::JobProgress {
            job_id,
            percent,
            message,
        } => match message {
            Some(message) => format!("{job_id} {percent:>3}% {}", truncate(message, 80)),
            None => format!("{job_id} {percent:>3}%"),
        },
        EngineEvent::JobCompleted { job_id, result } => {
            format!("{job_id} completed {}", truncate(&result.to_string(), 120))
        }
        EngineEvent::JobFailed { job_id, error } => format!("{job_id} failed: {}", truncate(error, 200)),
        EngineEvent::JobRetrying {
            job_id,
            attempt,
            max_attempts,
            error,
        } => format!(
            "{job_id} failed (attempt {attempt}/{max_attempts}), retrying: {}",
            truncate(error, 200)
        ),
        EngineEvent::JobInterrupted { job_id } => format!("{job_id} interrupted; requeued on next start"),
        EngineEvent::SessionCompleted {
            session_id,
            total_jobs,
            started_at,
            completed_at,
        } => {
            let secs = (*completed_at - *started_at).num_milliseconds().max(0) as f64 / 1000.0;
            format!("session {session_id} complete: {total_jobs} jobs in {secs:.1}s")
        }
        EngineEvent::WorkerSpawned { worker_id, pool_size } => {
            format!("worker {worker_id} spawned (pool={pool_size})")
        }
        EngineEvent::WorkerRemoved {
            worker_id,
            pool_size,
            reason,
        } => format!("worker {worker_id} removed: {reason} (pool={pool_size})"),
        EngineEvent::CrashLoop {
            consecutive_crashes,
            backoff_ms,
        } => format!(
            "warning: {consecutive_crashes} consecutive worker crashes; next respawn in {backoff_ms}ms"
        ),
        EngineEvent::Warning { message } => format!("warning: {message}"),
        EngineEvent::Error { message } => format!("error: {message}"),
        EngineEvent::Stopped => "engine stopped".to_string(),
    };
    Some(line)
}

/// Status record as printed by `jobmill status`, with the display label added.
pub fn status_json(record: &JobStatusRecord, label: &str) -> serde_json::Result<serde_json::Value> {
    let mut value = serde_json::to_value(record)?;
    if let Some(obj) = value.as_object_mut() {
        // The stored payload is an internal detail of the queue lists.
        obj.remove("rawJob");
        obj.insert("label".to_string(), serde_json::Value::String(label.to_string()));
    }
    Ok(value)
}
