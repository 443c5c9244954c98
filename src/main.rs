mod simulation;

use simulation::{simulate_collaboration, simulate_scaling};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async_main())?;
    Ok(())
}

async fn async_main() -> tessera_sdk::Result<()> {
    println!("\n\n╔════════════════════════════════════════════════════════════╗");
    println!("║            COLLABORATION SIMULATION                         ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    // Run 1: a small team
    let stats = simulate_collaboration(3, 12, 200, 7).await?;
    stats.print();

    // Run 2: a crowded tree, more lock conflicts
    let stats = simulate_collaboration(8, 6, 600, 11).await?;
    stats.print();

    // Run 3: scaling analysis
    simulate_scaling(8, 2, 42).await?;

    println!("\n✓ All simulations completed successfully!");
    Ok(())
}
