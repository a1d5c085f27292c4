//! `drover status` command: show queue depth and the worker fleet.

use anyhow::Result;

use drover_core::store::TaskStore;

/// Print task counts by status and a worker summary table.
pub async fn run_status(store: &dyn TaskStore) -> Result<()> {
    let counts = store.count_tasks_by_status().await?;
    let total: i64 = counts.iter().map(|(_, n)| n).sum();

    println!("Tasks: {total}");
    for (status, count) in &counts {
        println!("  {status}: {count}");
    }

    let depths = store.count_pending_by_model().await?;
    if !depths.is_empty() {
        println!("Pending by model:");
        for (model, depth) in &depths {
            let model = if model.is_empty() { "(any)" } else { model };
            println!("  {model}: {depth}");
        }
    }
    println!();

    let workers = store.list_workers().await?;
    println!("Workers: {}", workers.len());
    for worker in &workers {
        let current = worker
            .current_task_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".to_owned());
        println!(
            "  {} [{}] {} cpu={} mem={}B gpu={} current={} handled={} heartbeat={}",
            worker.name,
            worker.status,
            worker.id,
            worker.available_cpu,
            worker.available_memory,
            worker.available_gpu,
            current,
            worker.total_tasks_handled,
            worker.last_heartbeat.format("%Y-%m-%d %H:%M:%S UTC"),
        );
    }

    Ok(())
}
