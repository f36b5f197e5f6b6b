use taskq_client::Connection;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut conn = Connection::open("localhost", 1337, false).await?;

    println!("Scheduling tasks on the default queue...");
    for i in 1..=5 {
        conn = conn.schedule_task(format!("newsletter #{}", i), None).await?;
        println!("Sent newsletter #{}", i);
    }

    println!("\nScheduling tasks on the 'images' queue...");
    for file in ["cat.png", "dog.png", "error.png"] {
        conn = conn
            .schedule_task(format!("resize {}", file), Some("images"))
            .await?;
        println!("Sent resize {}", file);
    }

    println!("\nDraining 'images'...");
    while let Some(task) = conn.get_task("images").await? {
        conn = task.parent().clone();
        println!("Got: {:?} from {:?}", task.data(), task.origin());
        task.delete().await;
    }

    conn.close().await;
    println!("\nSession closed");
    Ok(())
}
