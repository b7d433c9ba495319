#[tokio::main]
async fn main() -> anyhow::Result<()> {
    softupakaran_api_lib::run().await
}
