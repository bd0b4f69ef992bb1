//! Start a kernel, run one cell, print its output, then shut the kernel
//! down.
//!
//! ```text
//! cargo run --example run_kernel -- http://localhost:8888 <token> 'print(1 + 1)'
//! ```

use jupyter_kernel_client::message::{Channel, KernelMessageType};
use jupyter_kernel_client::{KernelManager, ManagerOptions};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let base_url = args
        .next()
        .ok_or_else(|| anyhow::anyhow!("usage: run_kernel <base_url> <token> <code>"))?;
    let token = args.next().unwrap_or_default();
    let code = args.next().unwrap_or_else(|| "1 + 1".to_string());

    let manager = KernelManager::new(ManagerOptions {
        base_url,
        token,
        username: "demo".to_string(),
        reconnect_limit: None,
    })?;

    let session = manager.start_kernel(None).await?;
    println!("kernel {} is up", session.kernel_id());

    let fut = session.execute(serde_json::json!({ "code": code }), true)?;
    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    let done_tx = std::sync::Mutex::new(Some(done_tx));
    fut.on_done(move || {
        if let Some(tx) = done_tx.lock().unwrap().take() {
            let _ = tx.send(());
        }
    });
    fut.on_iopub(|msg| {
        if msg.channel != Channel::IoPub {
            return;
        }
        match msg.header.msg_type {
            KernelMessageType::Stream => {
                if let Some(text) = msg.content.get("text").and_then(|v| v.as_str()) {
                    print!("{text}");
                }
            }
            KernelMessageType::ExecuteResult | KernelMessageType::DisplayData => {
                if let Some(text) = msg
                    .content
                    .get("data")
                    .and_then(|d| d.get("text/plain"))
                    .and_then(|v| v.as_str())
                {
                    println!("{text}");
                }
            }
            KernelMessageType::Error => {
                if let Some(traceback) = msg.content.get("traceback").and_then(|v| v.as_array()) {
                    for line in traceback {
                        if let Some(s) = line.as_str() {
                            eprintln!("{s}");
                        }
                    }
                }
            }
            _ => {}
        }
    });

    let _ = done_rx.await;
    session.shutdown().await?;
    Ok(())
}
