use structopt::StructOpt;
use taskq_graceful_shutdown::GracefulShutdown;
use taskq_queue::{NewTask, Queue};
use uuid::Uuid;

#[derive(Debug, StructOpt)]
#[structopt(name = "taskq-cli")]
struct Args {
    #[structopt(subcommand)]
    cmd: Cmd,
}

#[derive(Debug, StructOpt)]
enum Cmd {
    /// Enqueue a new task.
    Enqueue {
        task_type: String,
        /// JSON payload, passed through verbatim.
        payload: Option<String>,
        #[structopt(long)]
        depends_on: Vec<Uuid>,
    },
    /// Print a task's current status and dependency list.
    Status { id: Uuid },
    /// Cancel a pending or running task.
    Cancel { id: Uuid },
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    dotenv::dotenv().ok();

    taskq::tracing_config::configure("taskq-cli");

    let args = Args::from_args();

    let shutdown = GracefulShutdown::new();
    let config = taskq::Config::from_env(&shutdown)?;
    let pool = config.database.create_pool().await?;
    let queue = Queue::new(pool, shutdown.consumer()).await?;

    match args.cmd {
        Cmd::Enqueue {
            task_type,
            payload,
            depends_on,
        } => {
            let payload = payload
                .map(|p| serde_json::from_str(&p))
                .transpose()?;

            let id = queue
                .enqueue(NewTask {
                    task_type,
                    payload,
                    dependencies: depends_on,
                    ..NewTask::default()
                })
                .await?;

            println!("{}", id);
        }
        Cmd::Status { id } => {
            let info = queue.status(id).await?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        Cmd::Cancel { id } => {
            queue.cancel(id).await?;
        }
    }

    Ok(())
}
