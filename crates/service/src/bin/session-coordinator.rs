#[tokio::main]
async fn main() -> anyhow::Result<()> {
    atlas_observability::init("session-coordinator");
    atlas_service::session::run().await
}
