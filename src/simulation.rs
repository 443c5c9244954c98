use async_stream::stream;
use futures::stream::{Stream, StreamExt};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tessera_sdk::prelude::*;
use tessera_store::StoreStats;

/// Statistics collected during a collaboration run
#[derive(Clone, Debug)]
pub struct SimulationStats {
    pub num_clients: usize,
    pub edits_attempted: usize,
    pub edits_applied: usize,
    pub lock_conflicts: usize,
    pub undos: usize,
    pub failed_edits: usize,
    pub store: StoreStats,
    pub live_fetches: u64,
    pub cache_hits: u64,
    pub total_time: Duration,
    pub edits_per_second: f64,
}

impl SimulationStats {
    pub fn print(&self) {
        println!("\n╔════════════════════════════════════════════════════════════╗");
        println!("║              Collaboration Statistics                       ║");
        println!("╠════════════════════════════════════════════════════════════╣");
        println!("║  Clients:                   {:>30} ║", self.num_clients);
        println!("║  Edits attempted:           {:>30} ║", self.edits_attempted);
        println!("║  Edits applied:             {:>30} ║", self.edits_applied);
        println!("║  Advisory lock conflicts:   {:>30} ║", self.lock_conflicts);
        println!("║  Session undos:             {:>30} ║", self.undos);
        println!("║  Failed edits:              {:>30} ║", self.failed_edits);
        println!("║  Store reads:               {:>30} ║", self.store.reads);
        println!("║  Store queries:             {:>30} ║", self.store.queries);
        println!("║  Store writes:              {:>30} ║", self.store.writes);
        println!("║  Audit/snapshot appends:    {:>30} ║", self.store.appends);
        println!("║  Live fetches (all clients):{:>30} ║", self.live_fetches);
        println!("║  Cache hits (all clients):  {:>30} ║", self.cache_hits);
        println!("║  Total time:                {:>29}s ║", format!("{:.3}", self.total_time.as_secs_f64()));
        println!("║  Edits/second:              {:>30.0} ║", self.edits_per_second);
        println!("╚════════════════════════════════════════════════════════════╝");
    }
}

/// One simulated user action.
#[derive(Clone, Debug)]
enum Action {
    Status(&'static str),
    AddResource,
    RemoveResource,
    Link,
    Assign,
    Undo,
}

const STATUSES: [&str; 3] = ["planned", "in_progress", "developed"];

/// Generator that yields (client, outcome, action) triples from a seeded rng
fn edit_pattern(
    seed: u64,
    num_clients: usize,
    num_outcomes: usize,
    num_edits: usize,
) -> impl Stream<Item = (usize, usize, Action)> {
    stream! {
        let mut rng = StdRng::seed_from_u64(seed);
        for _ in 0..num_edits {
            let client = rng.gen_range(0..num_clients);
            let outcome = rng.gen_range(0..num_outcomes);
            let action = match rng.gen_range(0..10) {
                0..=3 => Action::Status(STATUSES[rng.gen_range(0..STATUSES.len())]),
                4 | 5 => Action::AddResource,
                6 => Action::RemoveResource,
                7 => Action::Link,
                8 => Action::Assign,
                _ => Action::Undo,
            };
            yield (client, outcome, action);
        }
    }
}

fn outcome_id(index: usize) -> String {
    format!("LO-{index}")
}

fn initial_tree(tree_id: &str, num_outcomes: usize) -> Value {
    let outcomes: Vec<Value> = (0..num_outcomes)
        .map(|i| json!({ "id": outcome_id(i), "status": "planned", "developed": false, "resources": [] }))
        .collect();
    json!({
        "id": tree_id,
        "domains": [{ "id": "D-1", "competences": [{ "id": "C-1", "outcomes": outcomes }] }]
    })
}

/// Short intervals so several polls happen during a run.
fn simulation_sync_config() -> SyncConfig {
    SyncConfigBuilder::new()
        .stream("tree", 200, 3)
        .stream("locks", 100, 2)
        .build()
}

async fn apply(ws: &Workspace<MemoryStore>, target: &str, action: &Action, rng: &mut StdRng) -> Result<bool> {
    match action {
        Action::Status(status) => ws.set_status(target, *status).await.map(|_| true),
        Action::AddResource => ws
            .add_resource(target, json!(format!("resource-{}", rng.gen_range(0..1000))))
            .await
            .map(|_| true),
        Action::RemoveResource => {
            let count = ws
                .node(target)
                .and_then(|node| node["resources"].as_array().map(Vec::len))
                .unwrap_or(0);
            if count == 0 {
                return Ok(false);
            }
            ws.remove_resource(target, rng.gen_range(0..count)).await.map(|_| true)
        }
        Action::Link => {
            let link = format!("https://lms.example/{target}");
            ws.set_course_link(target, Some(link.as_str())).await.map(|_| true)
        }
        Action::Assign => ws.toggle_assignment(target).await.map(|_| true),
        Action::Undo => ws.undo().await.map(|undone| undone.is_some()),
    }
}

/// Run `num_edits` random edits from `num_clients` clients against one tree
pub async fn simulate_collaboration(
    num_clients: usize,
    num_outcomes: usize,
    num_edits: usize,
    seed: u64,
) -> Result<SimulationStats> {
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║        Shared Tree Collaboration                            ║");
    println!("║  Clients: {} | Outcomes: {} | Edits: {} ║", num_clients, num_outcomes, num_edits);
    println!("╚════════════════════════════════════════════════════════════╝");

    let start = Instant::now();
    let tree_id = "tree-sim";
    let store = Arc::new(MemoryStore::new());

    let clients: Vec<Client<MemoryStore>> = (0..num_clients)
        .map(|i| {
            let config = ClientConfigBuilder::new()
                .actor(format!("user-{i}"))
                .sync(simulation_sync_config())
                .build();
            Client::new(store.clone(), config)
        })
        .collect();

    println!("\n[Phase 1/3] Opening workspaces...");
    let mut workspaces = Vec::with_capacity(num_clients);
    for (i, client) in clients.iter().enumerate() {
        // Later clients pick up the seeded tree while opening.
        let ws = client.open_workspace(tree_id).await?;
        if i == 0 {
            ws.seed(initial_tree(tree_id, num_outcomes)).await?;
        }
        ws.start_sync().await;
        workspaces.push(ws);
    }
    let baseline = workspaces[0].create_snapshot("baseline").await?;
    println!("[Phase 1/3] ✓ Completed");

    println!("[Phase 2/3] Editing...");
    let mut rng = StdRng::seed_from_u64(seed ^ 0x5eed);
    let mut pattern = Box::pin(edit_pattern(seed, num_clients, num_outcomes, num_edits));
    let (mut attempted, mut applied, mut conflicts, mut undos, mut failed) = (0, 0, 0, 0, 0);

    while let Some((client, outcome, action)) = pattern.next().await {
        attempted += 1;
        if attempted % 25 == 0 {
            // Let the polling channels run.
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        if attempted == num_edits / 2 {
            for client in clients.iter().skip(num_clients / 2) {
                client.set_visibility(Visibility::Background).await;
            }
        }
        if attempted % 100 == 0 {
            println!("  Edits processed: {}/{}", attempted, num_edits);
        }

        let ws = &workspaces[client];
        let target = outcome_id(outcome);

        if !matches!(action, Action::Undo) {
            if ws.is_locked(&target) {
                conflicts += 1;
                continue;
            }
            ws.acquire_lock(&target).await?;
        }

        match apply(ws, &target, &action, &mut rng).await {
            Ok(true) => {
                applied += 1;
                if matches!(action, Action::Undo) {
                    undos += 1;
                }
            }
            Ok(false) => {}
            Err(err) => {
                tracing::warn!(client, target = %target, error = %err, "edit failed");
                failed += 1;
            }
        }

        if !matches!(action, Action::Undo) && rng.gen_bool(0.7) {
            ws.release_lock(&target).await?;
        }
    }
    println!("[Phase 2/3] ✓ Completed");

    println!("[Phase 3/3] Restoring baseline and shutting down...");
    workspaces[0].restore_snapshot(&baseline.id).await?;

    let mut live_fetches = 0;
    let mut cache_hits = 0;
    for client in &clients {
        let scheduler_stats = client.scheduler().stats();
        live_fetches += scheduler_stats.live_fetches;
        cache_hits += scheduler_stats.cache_hits;
        client.shutdown().await;
    }
    println!("[Phase 3/3] ✓ Completed");

    let total_time = start.elapsed();
    Ok(SimulationStats {
        num_clients,
        edits_attempted: attempted,
        edits_applied: applied,
        lock_conflicts: conflicts,
        undos,
        failed_edits: failed,
        store: store.stats(),
        live_fetches,
        cache_hits,
        total_time,
        edits_per_second: applied as f64 / total_time.as_secs_f64(),
    })
}

/// Compare read volume as the number of clients grows
pub async fn simulate_scaling(max_clients: usize, step_size: usize, seed: u64) -> Result<()> {
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║      Scaling Analysis - Store Traffic vs Clients            ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    let mut current = step_size;
    while current <= max_clients {
        let stats = simulate_collaboration(current, 20, current * 50, seed).await?;
        stats.print();
        current += step_size;
    }
    Ok(())
}
