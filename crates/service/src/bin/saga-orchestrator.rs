#[tokio::main]
async fn main() -> anyhow::Result<()> {
    atlas_observability::init("saga-orchestrator");
    atlas_service::saga::run().await
}
