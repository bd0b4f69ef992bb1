//! List the kernelspecs and running kernels known to a Jupyter server.
//!
//! ```text
//! cargo run --example list_kernelspecs -- http://localhost:8888 <token>
//! ```

use jupyter_kernel_client::{KernelManager, ManagerOptions};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let base_url = args
        .next()
        .ok_or_else(|| anyhow::anyhow!("usage: list_kernelspecs <base_url> <token>"))?;
    let token = args.next().unwrap_or_default();

    let manager = KernelManager::new(ManagerOptions {
        base_url,
        token,
        username: "demo".to_string(),
        reconnect_limit: None,
    })?;

    let (default, specs) = manager.kernelspecs(true).await?;
    println!("kernelspecs (default: {default:?}):");
    for (name, spec) in &specs {
        println!("  {name:20} {}", spec.display_name);
    }

    let running = manager.running_kernels(true).await?;
    println!("\nrunning kernels:");
    for kernel in &running {
        println!("  {:36} {}", kernel.id, kernel.name);
    }

    Ok(())
}
