use serde::{Deserialize, Serialize};
use taskq_client::{Connection, TaskData};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Serialize, Deserialize)]
struct Resize {
    file: String,
    width: u32,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let conn = Connection::open("localhost", 1337, true).await?;

    let job = Resize {
        file: "cat.png".to_string(),
        width: 640,
    };
    let conn = conn
        .schedule_task(TaskData::from_serialize(&job)?, Some("images"))
        .await?;
    println!("Scheduled {:?}", job);

    // plain strings are refused before anything is sent
    if let Err(e) = conn.schedule_task("not json", None).await {
        println!("Rejected as expected: {}", e);
    }

    match conn.get_task("images").await? {
        Some(task) => {
            let job: Resize = task.parse()?;
            println!("Resizing {} to {}px", job.file, job.width);
            task.accept().await;
        }
        None => println!("Nothing queued"),
    }

    conn.close().await;
    Ok(())
}
