#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    flowcraft_cli::cli::run().await
}
