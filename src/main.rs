#[tokio::main]
async fn main() -> anyhow::Result<()> {
    runjail::engine::run().await
}
