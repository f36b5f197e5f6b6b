use std::time::Duration;
use taskq_client::{Connection, TaskqError};
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Connection::builder()
        .host("localhost")
        .port(1337)
        .response_timeout_ms(5000)
        .build();

    let mut conn = Connection::connect(config).await?;

    println!("Starting worker, polling for tasks...");

    loop {
        match conn.get_task("").await {
            Ok(Some(task)) => {
                // a retried ask may have replaced the session
                conn = task.parent().clone();
                let body = task.data().as_text().unwrap_or_default().to_string();
                println!("Processing task: {}", body);

                match process_task(&body).await {
                    Ok(_) => {
                        println!("✅ Done: {}", body);
                        task.accept().await;
                    }
                    Err(e) => {
                        println!("❌ Failed: {} ({})", body, e);
                        task.decline_with(move |err| {
                            eprintln!("Decline of {:?} may be lost: {}", body, err);
                        })
                        .await;
                    }
                }
            }
            Ok(None) => {
                println!("No tasks available, waiting...");
                sleep(Duration::from_secs(1)).await;
            }
            Err(TaskqError::Timeout(ms)) => {
                println!("Server did not answer within {}ms", ms);
                conn = conn.close().await;
            }
            Err(e) => {
                println!("Error fetching tasks: {}", e);
                conn = conn.close().await;
                sleep(Duration::from_secs(5)).await;
            }
        }
    }
}

async fn process_task(body: &str) -> Result<(), String> {
    sleep(Duration::from_millis(100)).await;

    if body.contains("error") {
        Err("Task contains 'error'".to_string())
    } else {
        Ok(())
    }
}
